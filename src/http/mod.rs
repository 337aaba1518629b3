use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::chart::ChartSeries;
use crate::config::Config;
use crate::market::{CoinListing, MarketCoin, MarketData, MarketDataError};
use crate::portfolio::Portfolio;
use crate::store::{HoldingsStore, StoreError};

const DEFAULT_COIN_SEARCH_LIMIT: usize = 50;
const MAX_COIN_SEARCH_LIMIT: usize = 250;

#[derive(Clone, Debug)]
pub struct ViewSettings {
    pub top_coins: usize,
    pub chart_coin: String,
    pub chart_days: u32,
    pub valuation_deadline: Duration,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ViewSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_coins: config.top_coins,
            chart_coin: config.chart_coin.clone(),
            chart_days: config.chart_days,
            valuation_deadline: config.valuation_deadline(),
        }
    }
}

/// Shared by every worker. The store serializes its own access, the market source is stateless
/// from the point of view of the server.
pub struct AppState<M> {
    pub store: HoldingsStore,
    pub market: M,
    pub settings: ViewSettings,
}

impl<M: MarketData> AppState<M> {
    pub fn new(store: HoldingsStore, market: M, settings: ViewSettings) -> Self {
        Self {
            store,
            market,
            settings,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddHoldingRequest {
    pub coin_id: String,
    pub quantity: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateHoldingRequest {
    pub quantity: f64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteHoldingResponse {
    pub coin_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SearchQuery {
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl SearchQuery {
    fn needle(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChartQuery {
    pub coin: Option<String>,
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PricesResponse {
    pub coins: Vec<MarketCoin>,
    pub degraded: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CoinsResponse {
    pub coins: Vec<CoinListing>,
    pub degraded: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChartResponse {
    pub coin_id: String,
    pub days: u32,
    #[serde(flatten)]
    pub series: ChartSeries,
    pub degraded: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OverviewResponse {
    pub total_value: f64,
    pub coins_tracked: usize,
    /// 24h change of bitcoin, or of the largest coin when bitcoin is not listed.
    pub change_24h_percent: f64,
    pub portfolio: Portfolio,
    pub coins: Vec<MarketCoin>,
    pub chart: ChartResponse,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Display)]
pub enum ApiError {
    #[display("{_0}")]
    Validation(String),
    #[display("{_0}")]
    NotFound(String),
    #[display("internal error")]
    Internal,
}

impl std::error::Error for ApiError {}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Validation(msg) => ApiError::Validation(msg),
            StoreError::NotFound(coin_id) => {
                ApiError::NotFound(format!("no holding for coin {coin_id}"))
            }
            other => {
                log::error!("Holdings store failure: {other}");
                ApiError::Internal
            }
        }
    }
}

/// Splits market failures into those the caller caused, which fail the request, and upstream
/// trouble, which only degrades it.
fn degrade(error: MarketDataError) -> Result<String, ApiError> {
    match error {
        MarketDataError::InvalidRequest(msg) => Err(ApiError::Validation(msg)),
        other => {
            log::warn!("Serving degraded response: {other}");
            Ok(other.to_string())
        }
    }
}

pub fn headline_change(coins: &[MarketCoin]) -> f64 {
    coins
        .iter()
        .find(|c| c.id == "bitcoin")
        .or_else(|| coins.first())
        .and_then(|c| c.change_24h_percent)
        .unwrap_or(0.0)
}

/// Malformed bodies and query strings get the same `{"error": ...}` body as every other failure.
fn rejected_input(err: impl std::fmt::Display) -> actix_web::Error {
    log::debug!("Rejecting request: {err}");
    ApiError::Validation(err.to_string()).into()
}

pub fn configure<M: MarketData + 'static>(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| rejected_input(err)))
        .app_data(web::QueryConfig::default().error_handler(|err, _req| rejected_input(err)))
        .route("/overview", web::get().to(server::overview::<M>))
        .route("/portfolio", web::get().to(server::portfolio::<M>))
        .route("/portfolio/holdings", web::post().to(server::add_holding::<M>))
        .route(
            "/portfolio/holdings/{coin_id}",
            web::put().to(server::update_holding::<M>),
        )
        .route(
            "/portfolio/holdings/{coin_id}",
            web::delete().to(server::delete_holding::<M>),
        )
        .route("/prices", web::get().to(server::prices::<M>))
        .route("/coins", web::get().to(server::coins::<M>))
        .route("/chart", web::get().to(server::chart::<M>));
}

pub mod server {
    use actix_web::web;

    use super::{
        degrade, headline_change, AddHoldingRequest, ApiError, AppState, ChartQuery,
        ChartResponse, CoinsResponse, DeleteHoldingResponse, OverviewResponse, PricesResponse,
        SearchQuery, UpdateHoldingRequest, DEFAULT_COIN_SEARCH_LIMIT, MAX_COIN_SEARCH_LIMIT,
    };
    use crate::chart::ChartSeries;
    use crate::market::MarketData;
    use crate::portfolio::{compute_portfolio, Portfolio};
    use crate::store::{normalize_coin_id, Holding};

    pub async fn portfolio<M: MarketData>(
        app: web::Data<AppState<M>>,
    ) -> Result<web::Json<Portfolio>, ApiError> {
        let portfolio =
            compute_portfolio(&app.store, &app.market, app.settings.valuation_deadline).await?;
        Ok(web::Json(portfolio))
    }

    pub async fn add_holding<M: MarketData>(
        app: web::Data<AppState<M>>,
        add_holding: web::Json<AddHoldingRequest>,
    ) -> Result<web::Json<Holding>, ApiError> {
        let req = add_holding.into_inner();
        let holding = app.store.create_labeled(
            &req.coin_id,
            req.quantity,
            req.name.as_deref(),
            req.symbol.as_deref(),
        )?;
        Ok(web::Json(holding))
    }

    pub async fn update_holding<M: MarketData>(
        app: web::Data<AppState<M>>,
        path: web::Path<(String,)>,
        update_holding: web::Json<UpdateHoldingRequest>,
    ) -> Result<web::Json<Holding>, ApiError> {
        let (coin_id,) = path.into_inner();
        let holding = app
            .store
            .update_quantity(&coin_id, update_holding.quantity)?;
        Ok(web::Json(holding))
    }

    pub async fn delete_holding<M: MarketData>(
        app: web::Data<AppState<M>>,
        path: web::Path<(String,)>,
    ) -> Result<web::Json<DeleteHoldingResponse>, ApiError> {
        let (coin_id,) = path.into_inner();
        app.store.delete(&coin_id)?;
        Ok(web::Json(DeleteHoldingResponse {
            coin_id: normalize_coin_id(&coin_id),
        }))
    }

    pub async fn prices<M: MarketData>(
        app: web::Data<AppState<M>>,
        query: web::Query<SearchQuery>,
    ) -> Result<web::Json<PricesResponse>, ApiError> {
        match app.market.fetch_top_coins(app.settings.top_coins).await {
            Ok(mut coins) => {
                if let Some(needle) = query.needle() {
                    coins.retain(|c| c.matches(&needle));
                }
                Ok(web::Json(PricesResponse {
                    coins,
                    degraded: None,
                }))
            }
            Err(e) => Ok(web::Json(PricesResponse {
                coins: Vec::new(),
                degraded: Some(degrade(e)?),
            })),
        }
    }

    pub async fn coins<M: MarketData>(
        app: web::Data<AppState<M>>,
        query: web::Query<SearchQuery>,
    ) -> Result<web::Json<CoinsResponse>, ApiError> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_COIN_SEARCH_LIMIT)
            .clamp(1, MAX_COIN_SEARCH_LIMIT);
        match app.market.fetch_coin_list().await {
            Ok(listings) => {
                let needle = query.needle();
                let coins = listings
                    .into_iter()
                    .filter(|c| needle.as_deref().map_or(true, |n| c.matches(n)))
                    .take(limit)
                    .collect();
                Ok(web::Json(CoinsResponse {
                    coins,
                    degraded: None,
                }))
            }
            Err(e) => Ok(web::Json(CoinsResponse {
                coins: Vec::new(),
                degraded: Some(degrade(e)?),
            })),
        }
    }

    async fn chart_for<M: MarketData>(
        app: &AppState<M>,
        coin: Option<&str>,
        days: Option<u32>,
    ) -> Result<ChartResponse, ApiError> {
        let coin_id = coin
            .map(normalize_coin_id)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| app.settings.chart_coin.clone());
        let days = days.unwrap_or(app.settings.chart_days);

        match app.market.fetch_history(&coin_id, days).await {
            Ok(points) => Ok(ChartResponse {
                coin_id,
                days,
                series: ChartSeries::from_points(&points),
                degraded: None,
            }),
            Err(e) => Ok(ChartResponse {
                coin_id,
                days,
                series: ChartSeries::default(),
                degraded: Some(degrade(e)?),
            }),
        }
    }

    pub async fn chart<M: MarketData>(
        app: web::Data<AppState<M>>,
        query: web::Query<ChartQuery>,
    ) -> Result<web::Json<ChartResponse>, ApiError> {
        let chart = chart_for(&app, query.coin.as_deref(), query.days).await?;
        Ok(web::Json(chart))
    }

    pub async fn overview<M: MarketData>(
        app: web::Data<AppState<M>>,
    ) -> Result<web::Json<OverviewResponse>, ApiError> {
        let (portfolio, coins, chart) = tokio::join!(
            compute_portfolio(&app.store, &app.market, app.settings.valuation_deadline),
            app.market.fetch_top_coins(app.settings.top_coins),
            chart_for(&app, None, None),
        );
        let portfolio = portfolio?;
        let coins = match coins {
            Ok(coins) => coins,
            Err(e) => {
                degrade(e)?;
                Vec::new()
            }
        };

        Ok(web::Json(OverviewResponse {
            total_value: portfolio.total_value,
            coins_tracked: portfolio.coins_tracked,
            change_24h_percent: headline_change(&coins),
            portfolio,
            coins,
            chart: chart?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use actix_web::http::header::ContentType;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};

    use super::{
        configure, headline_change, AddHoldingRequest, AppState, ChartResponse, CoinsResponse,
        DeleteHoldingResponse, ErrorResponse, OverviewResponse, PricesResponse,
        UpdateHoldingRequest, ViewSettings,
    };
    use crate::market::{MarketCoin, MarketDataError, PricePoint, StaticMarket};
    use crate::portfolio::{LineStatus, Portfolio};
    use crate::store::{Holding, HoldingsStore};

    fn coin(id: &str, symbol: &str, name: &str, price: f64, change: f64) -> MarketCoin {
        MarketCoin {
            id: id.to_string(),
            symbol: symbol.to_string(),
            name: name.to_string(),
            image: None,
            current_price: Some(price),
            market_cap: None,
            change_24h_percent: Some(change),
        }
    }

    fn market() -> StaticMarket {
        StaticMarket::new()
            .with_coin(coin("bitcoin", "btc", "Bitcoin", 30000.0, 2.5))
            .with_coin(coin("ethereum", "eth", "Ethereum", 2000.0, -1.0))
            .with_coin(coin("dogecoin", "doge", "Dogecoin", 0.1, 7.0))
            .with_history(
                "bitcoin",
                vec![
                    PricePoint {
                        timestamp_ms: 1_700_000_000_000,
                        price: 36512.3456,
                    },
                    PricePoint {
                        timestamp_ms: 1_700_086_400_000,
                        price: 36000.0,
                    },
                ],
            )
    }

    fn state(market: StaticMarket) -> web::Data<AppState<StaticMarket>> {
        let _ = env_logger::try_init();
        let store = HoldingsStore::in_memory().unwrap();
        web::Data::new(AppState::new(store, market, ViewSettings::default()))
    }

    #[actix_web::test]
    async fn test_holding_lifecycle() {
        let app = test::init_service(
            App::new()
                .app_data(state(market()))
                .configure(configure::<StaticMarket>),
        )
        .await;

        let req = test::TestRequest::post()
            .set_json(AddHoldingRequest {
                coin_id: "Bitcoin".to_string(),
                quantity: 2.0,
                name: Some("Bitcoin".to_string()),
                symbol: Some("BTC".to_string()),
            })
            .uri("/portfolio/holdings")
            .to_request();
        let resp: Holding = test::call_and_read_body_json(&app, req).await;
        assert!(resp.coin_id == "bitcoin");

        let req1 = test::TestRequest::post()
            .set_json(AddHoldingRequest {
                coin_id: "doge-typo".to_string(),
                quantity: 10.0,
                name: None,
                symbol: None,
            })
            .uri("/portfolio/holdings")
            .to_request();
        let _resp1: Holding = test::call_and_read_body_json(&app, req1).await;

        let req2 = test::TestRequest::get().uri("/portfolio").to_request();
        let resp2: Portfolio = test::call_and_read_body_json(&app, req2).await;
        assert!(resp2.total_value == 60000.0);
        assert!(resp2.lines.len() == 2);
        assert!(resp2.lines[1].status == LineStatus::Unavailable);

        let req3 = test::TestRequest::put()
            .set_json(UpdateHoldingRequest { quantity: 1.0 })
            .uri("/portfolio/holdings/bitcoin")
            .to_request();
        let resp3: Holding = test::call_and_read_body_json(&app, req3).await;
        assert!(resp3.quantity == 1.0);

        let req4 = test::TestRequest::delete()
            .uri("/portfolio/holdings/doge-typo")
            .to_request();
        let resp4: DeleteHoldingResponse = test::call_and_read_body_json(&app, req4).await;
        assert!(resp4.coin_id == "doge-typo");

        let req5 = test::TestRequest::get().uri("/portfolio").to_request();
        let resp5: Portfolio = test::call_and_read_body_json(&app, req5).await;
        assert!(resp5.total_value == 30000.0);
        assert!(resp5.coins_tracked == 1);
    }

    #[actix_web::test]
    async fn test_that_bad_input_and_missing_holdings_are_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(state(market()))
                .configure(configure::<StaticMarket>),
        )
        .await;

        let req = test::TestRequest::post()
            .set_json(AddHoldingRequest {
                coin_id: "bitcoin".to_string(),
                quantity: -3.0,
                name: None,
                symbol: None,
            })
            .uri("/portfolio/holdings")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status() == StatusCode::BAD_REQUEST);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert!(body.error.contains("quantity"));

        let req1 = test::TestRequest::delete()
            .uri("/portfolio/holdings/cardano")
            .to_request();
        let resp1 = test::call_service(&app, req1).await;
        assert!(resp1.status() == StatusCode::NOT_FOUND);

        let req2 = test::TestRequest::put()
            .set_json(UpdateHoldingRequest { quantity: 1.0 })
            .uri("/portfolio/holdings/cardano")
            .to_request();
        let resp2 = test::call_service(&app, req2).await;
        assert!(resp2.status() == StatusCode::NOT_FOUND);

        let req3 = test::TestRequest::get().uri("/chart?days=0").to_request();
        let resp3 = test::call_service(&app, req3).await;
        assert!(resp3.status() == StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_that_malformed_body_and_query_get_json_errors() {
        let app = test::init_service(
            App::new()
                .app_data(state(market()))
                .configure(configure::<StaticMarket>),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/portfolio/holdings")
            .insert_header(ContentType::json())
            .set_payload(r#"{"coin_id":"bitcoin","quantity":"abc"}"#)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status() == StatusCode::BAD_REQUEST);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert!(!body.error.is_empty());

        let req1 = test::TestRequest::get().uri("/chart?days=-1").to_request();
        let resp1 = test::call_service(&app, req1).await;
        assert!(resp1.status() == StatusCode::BAD_REQUEST);
        let body1: ErrorResponse = test::read_body_json(resp1).await;
        assert!(!body1.error.is_empty());

        let req2 = test::TestRequest::get().uri("/portfolio").to_request();
        let resp2: Portfolio = test::call_and_read_body_json(&app, req2).await;
        assert!(resp2.lines.is_empty());
    }

    #[actix_web::test]
    async fn test_that_prices_can_be_searched() {
        let app = test::init_service(
            App::new()
                .app_data(state(market()))
                .configure(configure::<StaticMarket>),
        )
        .await;

        let req = test::TestRequest::get().uri("/prices").to_request();
        let resp: PricesResponse = test::call_and_read_body_json(&app, req).await;
        assert!(resp.coins.len() == 3);

        let req1 = test::TestRequest::get().uri("/prices?search=ETH").to_request();
        let resp1: PricesResponse = test::call_and_read_body_json(&app, req1).await;
        assert!(resp1.coins.len() == 1);
        assert!(resp1.coins[0].id == "ethereum");

        let req2 = test::TestRequest::get()
            .uri("/coins?search=coin&limit=1")
            .to_request();
        let resp2: CoinsResponse = test::call_and_read_body_json(&app, req2).await;
        assert!(resp2.coins.len() == 1);
        assert!(resp2.coins[0].id == "bitcoin");
    }

    #[actix_web::test]
    async fn test_that_overview_combines_portfolio_prices_and_chart() {
        let state = state(market());
        state.store.create("ethereum", 5.0).unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state)
                .configure(configure::<StaticMarket>),
        )
        .await;

        let req = test::TestRequest::get().uri("/overview").to_request();
        let resp: OverviewResponse = test::call_and_read_body_json(&app, req).await;
        assert!(resp.total_value == 10000.0);
        assert!(resp.coins_tracked == 1);
        assert!(resp.change_24h_percent == 2.5);
        assert!(resp.chart.coin_id == "bitcoin");
        assert!(resp.chart.series.labels == vec!["Nov 14", "Nov 15"]);
        assert!(resp.chart.series.values == vec![36512.35, 36000.0]);
    }

    #[actix_web::test]
    async fn test_that_upstream_failure_degrades_instead_of_failing() {
        let state = state(market().failing(MarketDataError::RateLimited));
        state.store.create("bitcoin", 1.0).unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state)
                .configure(configure::<StaticMarket>),
        )
        .await;

        let req = test::TestRequest::get().uri("/portfolio").to_request();
        let resp: Portfolio = test::call_and_read_body_json(&app, req).await;
        assert!(resp.total_value == 0.0);
        assert!(resp.lines[0].status == LineStatus::Unavailable);
        assert!(resp.degraded.is_some());

        let req1 = test::TestRequest::get().uri("/prices").to_request();
        let resp1: PricesResponse = test::call_and_read_body_json(&app, req1).await;
        assert!(resp1.coins.is_empty());
        assert!(resp1.degraded.is_some());

        let req2 = test::TestRequest::get().uri("/chart").to_request();
        let resp2: ChartResponse = test::call_and_read_body_json(&app, req2).await;
        assert!(resp2.series.labels.is_empty());
        assert!(resp2.degraded.is_some());

        let req3 = test::TestRequest::get().uri("/overview").to_request();
        let resp3: OverviewResponse = test::call_and_read_body_json(&app, req3).await;
        assert!(resp3.change_24h_percent == 0.0);
        assert!(resp3.portfolio.degraded.is_some());
    }

    #[::core::prelude::v1::test]
    fn test_that_headline_prefers_bitcoin() {
        let coins = vec![
            coin("ethereum", "eth", "Ethereum", 2000.0, -1.0),
            coin("bitcoin", "btc", "Bitcoin", 30000.0, 2.5),
        ];
        assert!(headline_change(&coins) == 2.5);
        assert!(headline_change(&coins[..1]) == -1.0);
        assert!(headline_change(&[]) == 0.0);
    }
}
