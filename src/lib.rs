//! # What is Coinfolio?
//!
//! Coinfolio is a small JSON server that tracks a personal crypto portfolio. Holdings (a coin
//! identifier and a quantity) are kept in a local SQLite file and are valued against live prices
//! pulled from a CoinGecko-compatible market-data API.
//!
//! # Implementation
//!
//! The server is composed of:
//! - A store, [HoldingsStore](crate::store::HoldingsStore), which owns the holdings. Prices are
//! never written to the store, they only live for a single request.
//! - A market-data source implementing [MarketData](crate::market::MarketData). The production
//! source is [CoinGecko](crate::market::coingecko::CoinGecko), tests and benchmarks use
//! [StaticMarket](crate::market::StaticMarket).
//! - The valuation, [compute_portfolio](crate::portfolio::compute_portfolio), which joins the
//! holdings with a single batched quote request. A holding without a quote is kept and marked
//! unavailable so the total never silently drops a position.
//! - The JSON server over all of the above, in [http](crate::http).
//!
//! Upstream failures never fail a request: the response is rendered in a degraded state with
//! every quote marked unavailable and the reason attached.
//!
//! ```text
//! cargo run --bin portfolio_server [ipv4_address] [port]
//! ```
pub mod chart;
pub mod config;
pub mod http;
pub mod market;
pub mod portfolio;
pub mod store;
