use actix_web::{web, App, HttpServer};
use anyhow::Context;
use coinfolio::config::Config;
use coinfolio::http::{configure, AppState, ViewSettings};
use coinfolio::market::coingecko::CoinGecko;
use coinfolio::store::HoldingsStore;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::from_env()?;

    let store = HoldingsStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path))?;
    let market = CoinGecko::from_config(&config)?;
    let app_state = AppState::new(store, market, ViewSettings::from_config(&config));
    let portfolio_state = web::Data::new(app_state);

    log::info!(
        "Serving portfolio on {}:{} with prices from {} in {}",
        config.address,
        config.port,
        config.api_base,
        config.vs_currency
    );

    HttpServer::new(move || {
        App::new()
            .app_data(portfolio_state.clone())
            .configure(configure::<CoinGecko>)
    })
    .bind((config.address.clone(), config.port))?
    .run()
    .await?;
    Ok(())
}
