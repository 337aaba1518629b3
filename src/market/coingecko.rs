use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::Config;

use super::{
    dedup_coin_ids, CoinListing, MarketCoin, MarketData, MarketDataError, PricePoint, PriceQuote,
};

pub const USER_AGENT: &str = concat!("coinfolio/", env!("CARGO_PKG_VERSION"));

// The markets endpoint refuses larger pages.
const MAX_PAGE_SIZE: usize = 250;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter. A `Retry-After` from the upstream wins if it is longer.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_cap = (self.base_delay.as_millis() / 2) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
        let wanted = match retry_after {
            Some(after) if after > exp => after,
            _ => exp.saturating_add(jitter),
        };
        wanted.min(self.max_delay)
    }
}

// Failed attempt, with enough context to decide whether to go again.
struct Attempt {
    error: MarketDataError,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl Attempt {
    fn fatal(error: MarketDataError) -> Self {
        Self {
            error,
            retryable: false,
            retry_after: None,
        }
    }

    fn transient(error: MarketDataError) -> Self {
        Self {
            error,
            retryable: true,
            retry_after: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarketsEntry {
    id: String,
    symbol: String,
    name: String,
    image: Option<String>,
    current_price: Option<f64>,
    market_cap: Option<f64>,
    price_change_percentage_24h: Option<f64>,
}

impl TryFrom<MarketsEntry> for MarketCoin {
    type Error = MarketDataError;

    fn try_from(value: MarketsEntry) -> Result<Self, Self::Error> {
        if value.id.trim().is_empty() {
            return Err(MarketDataError::InvalidResponse(
                "markets entry without id".into(),
            ));
        }
        if let Some(price) = value.current_price {
            if price < 0.0 {
                return Err(MarketDataError::InvalidResponse(format!(
                    "negative price {price} for {}",
                    value.id
                )));
            }
        }
        Ok(MarketCoin {
            id: value.id,
            symbol: value.symbol,
            name: value.name,
            image: value.image,
            current_price: value.current_price,
            market_cap: value.market_cap,
            change_24h_percent: value.price_change_percentage_24h,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
}

impl From<MarketChart> for Vec<PricePoint> {
    fn from(value: MarketChart) -> Self {
        let mut points: Vec<PricePoint> = value
            .prices
            .into_iter()
            .map(|(timestamp_ms, price)| PricePoint {
                timestamp_ms: timestamp_ms as i64,
                price,
            })
            .collect();
        points.sort_by_key(|p| p.timestamp_ms);
        points
    }
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    id: String,
    symbol: String,
    name: String,
}

/// Client for a CoinGecko v3 compatible API. `path` is the API root, for example
/// `https://api.coingecko.com/api/v3`.
#[derive(Debug)]
pub struct CoinGecko {
    pub path: String,
    pub client: reqwest::Client,
    vs_currency: String,
    retry: RetryPolicy,
}

impl CoinGecko {
    pub fn from_config(config: &Config) -> Result<Self, MarketDataError> {
        let mut builder = CoinGeckoBuilder::new(config.api_base.clone())
            .with_vs_currency(&config.vs_currency)
            .with_timeout(config.request_timeout)
            .with_retry(RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.backoff_base,
                max_delay: config.retry_max_delay,
            });
        if let Some(key) = &config.api_key {
            builder = builder.with_api_key(key);
        }
        builder.build()
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketDataError> {
        let url = format!("{}{}", self.path, endpoint);
        let mut attempt = 0;
        loop {
            match self.get_once(&url, query).await {
                Ok(value) => return Ok(value),
                Err(failed) => {
                    if !failed.retryable || attempt >= self.retry.max_retries {
                        log::warn!("GET {url} failed: {}", failed.error);
                        return Err(failed.error);
                    }
                    let delay = self.retry.delay(attempt, failed.retry_after);
                    log::warn!(
                        "GET {url} failed: {}, retry {} of {} in {:?}",
                        failed.error,
                        attempt + 1,
                        self.retry.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, Attempt> {
        log::debug!("GET {url} {query:?}");
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| transport_failure(&e))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Attempt {
                error: MarketDataError::RateLimited,
                retryable: true,
                retry_after,
            });
        }
        if !status.is_success() {
            let error = MarketDataError::Unavailable(format!("upstream returned {status}"));
            return match status.as_u16() {
                500 | 502 | 503 | 504 => Err(Attempt::transient(error)),
                _ => Err(Attempt::fatal(error)),
            };
        }

        let body = resp.bytes().await.map_err(|e| transport_failure(&e))?;
        serde_json::from_slice::<T>(&body)
            .map_err(|e| Attempt::fatal(MarketDataError::InvalidResponse(e.to_string())))
    }

    async fn fetch_markets(
        &self,
        coin_ids: &[String],
    ) -> Result<Vec<MarketCoin>, MarketDataError> {
        let query = [
            ("vs_currency", self.vs_currency.clone()),
            ("ids", coin_ids.join(",")),
            ("per_page", coin_ids.len().to_string()),
            ("page", "1".to_string()),
            ("sparkline", "false".to_string()),
        ];
        let entries: Vec<MarketsEntry> = self.get("/coins/markets", &query).await?;
        entries.into_iter().map(MarketCoin::try_from).collect()
    }
}

fn transport_failure(e: &reqwest::Error) -> Attempt {
    let error = if e.is_timeout() {
        MarketDataError::Unavailable("request timed out".into())
    } else {
        MarketDataError::Unavailable(e.to_string())
    };
    Attempt::transient(error)
}

fn validate_path_id(coin_id: &str) -> Result<&str, MarketDataError> {
    let valid = !coin_id.is_empty()
        && coin_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid {
        return Err(MarketDataError::InvalidRequest(format!(
            "not a coin identifier: {coin_id:?}"
        )));
    }
    Ok(coin_id)
}

impl MarketData for CoinGecko {
    async fn fetch_quotes(
        &self,
        coin_ids: &[String],
    ) -> Result<HashMap<String, PriceQuote>, MarketDataError> {
        let coin_ids = dedup_coin_ids(coin_ids);
        let mut quotes = HashMap::new();
        // One call per page of ids, a single call for any realistic portfolio.
        for page in coin_ids.chunks(MAX_PAGE_SIZE) {
            for coin in self.fetch_markets(page).await? {
                if let Some(quote) = coin.quote() {
                    quotes.insert(quote.coin_id.clone(), quote);
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
        let coin_id = validate_path_id(coin_id)?;
        if days == 0 {
            return Err(MarketDataError::InvalidRequest(
                "history needs at least one day".into(),
            ));
        }
        let query = [
            ("vs_currency", self.vs_currency.clone()),
            ("days", days.to_string()),
        ];
        let chart: MarketChart = self
            .get(&format!("/coins/{coin_id}/market_chart"), &query)
            .await?;
        Ok(chart.into())
    }

    async fn fetch_top_coins(&self, limit: usize) -> Result<Vec<MarketCoin>, MarketDataError> {
        let query = [
            ("vs_currency", self.vs_currency.clone()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", limit.clamp(1, MAX_PAGE_SIZE).to_string()),
            ("page", "1".to_string()),
            ("sparkline", "false".to_string()),
            ("price_change_percentage", "24h".to_string()),
        ];
        let entries: Vec<MarketsEntry> = self.get("/coins/markets", &query).await?;
        entries.into_iter().map(MarketCoin::try_from).collect()
    }

    async fn fetch_coin_list(&self) -> Result<Vec<CoinListing>, MarketDataError> {
        let entries: Vec<ListEntry> = self.get("/coins/list", &[]).await?;
        let mut listings = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.id.trim().is_empty() {
                return Err(MarketDataError::InvalidResponse(
                    "coin list entry without id".into(),
                ));
            }
            listings.push(CoinListing {
                id: entry.id,
                symbol: entry.symbol,
                name: entry.name,
            });
        }
        Ok(listings)
    }
}

pub struct CoinGeckoBuilder {
    path: String,
    vs_currency: String,
    timeout: Duration,
    retry: RetryPolicy,
    api_key: Option<String>,
}

impl CoinGeckoBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into().trim_end_matches('/').to_string(),
            vs_currency: "usd".to_string(),
            timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            api_key: None,
        }
    }

    pub fn with_vs_currency(mut self, vs_currency: &str) -> Self {
        self.vs_currency = vs_currency.to_lowercase();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn build(self) -> Result<CoinGecko, MarketDataError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| MarketDataError::InvalidRequest(format!("bad api key: {e}")))?;
            headers.insert("x-cg-demo-api-key", value);
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(self.timeout)
            .build()
            .map_err(|e| MarketDataError::Unavailable(e.to_string()))?;

        Ok(CoinGecko {
            path: self.path,
            client,
            vs_currency: self.vs_currency,
            retry: self.retry,
        })
    }
}
