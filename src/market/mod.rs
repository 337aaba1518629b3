//! Market data comes from an upstream source that we do not control. Everything handed out of this
//! module has been mapped into typed structs, callers never see raw upstream JSON.
pub mod coingecko;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Display, PartialEq)]
pub enum MarketDataError {
    #[display("market data unavailable: {_0}")]
    Unavailable(String),
    #[display("market data rate limited")]
    RateLimited,
    #[display("unexpected market data response: {_0}")]
    InvalidResponse(String),
    #[display("invalid market data request: {_0}")]
    InvalidRequest(String),
}

impl std::error::Error for MarketDataError {}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PriceQuote {
    pub coin_id: String,
    pub current_price: f64,
    pub change_24h_percent: Option<f64>,
    pub market_cap: Option<f64>,
    /// Logo URL, when the upstream has one.
    pub image: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PricePoint {
    pub timestamp_ms: i64,
    pub price: f64,
}

/// Row of the upstream markets listing, ordered by market cap.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MarketCoin {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub image: Option<String>,
    pub current_price: Option<f64>,
    pub market_cap: Option<f64>,
    pub change_24h_percent: Option<f64>,
}

impl MarketCoin {
    /// Substring of name or symbol, or the exact identifier. `search` must be lower-case.
    pub fn matches(&self, search: &str) -> bool {
        self.name.to_lowercase().contains(search)
            || self.symbol.to_lowercase().contains(search)
            || self.id.to_lowercase() == search
    }

    pub fn quote(&self) -> Option<PriceQuote> {
        self.current_price.map(|current_price| PriceQuote {
            coin_id: self.id.clone(),
            current_price,
            change_24h_percent: self.change_24h_percent,
            market_cap: self.market_cap,
            image: self.image.clone(),
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CoinListing {
    pub id: String,
    pub symbol: String,
    pub name: String,
}

impl CoinListing {
    pub fn matches(&self, search: &str) -> bool {
        self.id.contains(search)
            || self.symbol.to_lowercase().contains(search)
            || self.name.to_lowercase().contains(search)
    }
}

/// Drops empty and repeated identifiers, keeping first-seen order.
pub fn dedup_coin_ids(coin_ids: &[String]) -> Vec<String> {
    let mut seen = Vec::with_capacity(coin_ids.len());
    for id in coin_ids {
        let id = id.trim().to_lowercase();
        if !id.is_empty() && !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

pub trait MarketData {
    /// One upstream call for all of `coin_ids`. Coins without a price are absent from the result.
    fn fetch_quotes(
        &self,
        coin_ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, PriceQuote>, MarketDataError>>;
    fn fetch_history(
        &self,
        coin_id: &str,
        days: u32,
    ) -> impl Future<Output = Result<Vec<PricePoint>, MarketDataError>>;
    fn fetch_top_coins(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<MarketCoin>, MarketDataError>>;
    fn fetch_coin_list(&self) -> impl Future<Output = Result<Vec<CoinListing>, MarketDataError>>;
}

/// Fixed market used by tests and benchmarks. Can be made to fail or to stall.
#[derive(Debug, Default)]
pub struct StaticMarket {
    coins: Vec<MarketCoin>,
    history: HashMap<String, Vec<PricePoint>>,
    listings: Vec<CoinListing>,
    failure: Option<MarketDataError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, coin_id: &str, price: f64) -> Self {
        self.with_coin(MarketCoin {
            id: coin_id.to_string(),
            symbol: coin_id.chars().take(3).collect(),
            name: coin_id.to_string(),
            image: None,
            current_price: Some(price),
            market_cap: None,
            change_24h_percent: None,
        })
    }

    pub fn with_coin(mut self, coin: MarketCoin) -> Self {
        self.listings.push(CoinListing {
            id: coin.id.clone(),
            symbol: coin.symbol.clone(),
            name: coin.name.clone(),
        });
        self.coins.push(coin);
        self
    }

    pub fn with_history(mut self, coin_id: &str, points: Vec<PricePoint>) -> Self {
        self.history.insert(coin_id.to_string(), points);
        self
    }

    pub fn failing(mut self, error: MarketDataError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls made against this market so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), MarketDataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(())
    }
}

impl MarketData for StaticMarket {
    async fn fetch_quotes(
        &self,
        coin_ids: &[String],
    ) -> Result<HashMap<String, PriceQuote>, MarketDataError> {
        let coin_ids = dedup_coin_ids(coin_ids);
        if coin_ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.enter().await?;

        let mut quotes = HashMap::new();
        for coin in &self.coins {
            if coin_ids.contains(&coin.id) {
                if let Some(quote) = coin.quote() {
                    quotes.insert(coin.id.clone(), quote);
                }
            }
        }
        Ok(quotes)
    }

    async fn fetch_history(
        &self,
        coin_id: &str,
        days: u32,
    ) -> Result<Vec<PricePoint>, MarketDataError> {
        if days == 0 {
            return Err(MarketDataError::InvalidRequest(
                "history needs at least one day".into(),
            ));
        }
        self.enter().await?;
        Ok(self.history.get(coin_id).cloned().unwrap_or_default())
    }

    async fn fetch_top_coins(&self, limit: usize) -> Result<Vec<MarketCoin>, MarketDataError> {
        self.enter().await?;
        Ok(self.coins.iter().take(limit).cloned().collect())
    }

    async fn fetch_coin_list(&self) -> Result<Vec<CoinListing>, MarketDataError> {
        self.enter().await?;
        Ok(self.listings.clone())
    }
}
