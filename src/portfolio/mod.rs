use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::market::{MarketData, PriceQuote};
use crate::store::{Holding, HoldingsStore, StoreError};

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    Priced,
    Unavailable,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PortfolioLine {
    pub holding: Holding,
    pub quote: Option<PriceQuote>,
    pub status: LineStatus,
    pub value: f64,
}

impl PortfolioLine {
    fn priced(holding: Holding, quote: PriceQuote) -> Self {
        let value = holding.quantity * quote.current_price;
        Self {
            holding,
            quote: Some(quote),
            status: LineStatus::Priced,
            value,
        }
    }

    fn unavailable(holding: Holding) -> Self {
        Self {
            holding,
            quote: None,
            status: LineStatus::Unavailable,
            value: 0.0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == LineStatus::Priced
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Portfolio {
    pub lines: Vec<PortfolioLine>,
    pub total_value: f64,
    pub coins_tracked: usize,
    pub unavailable_count: usize,
    /// Value-weighted over the priced lines that report a 24h change.
    pub change_24h_percent: Option<f64>,
    /// Set when quotes could not be fetched at all.
    pub degraded: Option<String>,
}

impl Portfolio {
    fn from_lines(lines: Vec<PortfolioLine>) -> Self {
        let total_value: f64 = lines.iter().map(|l| l.value).sum();
        let unavailable_count = lines.iter().filter(|l| !l.is_available()).count();

        let mut weighted = 0.0;
        let mut weight = 0.0;
        for line in &lines {
            if let Some(change) = line.quote.as_ref().and_then(|q| q.change_24h_percent) {
                weighted += change * line.value;
                weight += line.value;
            }
        }
        let change_24h_percent = if weight > 0.0 {
            Some(weighted / weight)
        } else {
            None
        };

        Self {
            coins_tracked: lines.len(),
            lines,
            total_value,
            unavailable_count,
            change_24h_percent,
            degraded: None,
        }
    }
}

/// Joins holdings with quotes, keeping the order of `holdings`. A holding without a usable quote
/// stays in the output as unavailable and contributes nothing to the total.
pub fn value_holdings(holdings: Vec<Holding>, quotes: &HashMap<String, PriceQuote>) -> Portfolio {
    let lines = holdings
        .into_iter()
        .map(|holding| match quotes.get(&holding.coin_id) {
            Some(quote)
                if quote.coin_id == holding.coin_id
                    && quote.current_price.is_finite()
                    && quote.current_price >= 0.0 =>
            {
                PortfolioLine::priced(holding, quote.clone())
            }
            _ => PortfolioLine::unavailable(holding),
        })
        .collect();
    Portfolio::from_lines(lines)
}

/// Every line unavailable, with the reason attached.
pub fn degraded_portfolio(holdings: Vec<Holding>, reason: String) -> Portfolio {
    let lines = holdings
        .into_iter()
        .map(PortfolioLine::unavailable)
        .collect();
    let mut portfolio = Portfolio::from_lines(lines);
    portfolio.degraded = Some(reason);
    portfolio
}

/// Values everything in `store` with a single batched quote request to `market`. Market failures,
/// including running past `deadline`, give a degraded portfolio rather than an error. Only store
/// failures are returned.
pub async fn compute_portfolio<M: MarketData>(
    store: &HoldingsStore,
    market: &M,
    deadline: Duration,
) -> Result<Portfolio, StoreError> {
    let holdings = store.list()?;
    if holdings.is_empty() {
        return Ok(value_holdings(holdings, &HashMap::new()));
    }

    let coin_ids: Vec<String> = holdings.iter().map(|h| h.coin_id.clone()).collect();
    match tokio::time::timeout(deadline, market.fetch_quotes(&coin_ids)).await {
        Ok(Ok(quotes)) => {
            let portfolio = value_holdings(holdings, &quotes);
            if portfolio.unavailable_count > 0 {
                log::warn!(
                    "{} of {} holdings have no quote",
                    portfolio.unavailable_count,
                    portfolio.coins_tracked
                );
            }
            Ok(portfolio)
        }
        Ok(Err(e)) => {
            log::warn!("Valuing portfolio without quotes: {e}");
            Ok(degraded_portfolio(holdings, e.to_string()))
        }
        Err(_) => {
            log::warn!("Valuing portfolio without quotes: no answer within {deadline:?}");
            Ok(degraded_portfolio(
                holdings,
                "market data timed out".to_string(),
            ))
        }
    }
}
