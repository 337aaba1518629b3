use std::time::Duration;

use coinfolio::market::{MarketCoin, MarketDataError, StaticMarket};
use coinfolio::portfolio::{compute_portfolio, LineStatus};
use coinfolio::store::HoldingsStore;

const DEADLINE: Duration = Duration::from_secs(5);

fn store_with(holdings: &[(&str, f64)]) -> HoldingsStore {
    let _ = env_logger::try_init();
    let store = HoldingsStore::in_memory().unwrap();
    for (coin_id, quantity) in holdings {
        store.create(coin_id, *quantity).unwrap();
    }
    store
}

#[tokio::test]
async fn test_that_portfolio_is_valued_with_one_batched_call() {
    let store = store_with(&[("bitcoin", 2.0), ("ethereum", 5.0)]);
    let market = StaticMarket::new()
        .with_price("bitcoin", 30000.0)
        .with_price("ethereum", 2000.0);

    let portfolio = compute_portfolio(&store, &market, DEADLINE).await.unwrap();
    assert!(portfolio.total_value == 70000.0);
    assert!(portfolio.lines[0].holding.coin_id == "bitcoin");
    assert!(portfolio.lines[1].holding.coin_id == "ethereum");
    assert!(market.calls() == 1);
}

#[tokio::test]
async fn test_that_unknown_coin_is_kept_and_marked_unavailable() {
    let store = store_with(&[("bitcoin", 1.0), ("doge-typo", 10.0)]);
    let market = StaticMarket::new().with_price("bitcoin", 30000.0);

    let portfolio = compute_portfolio(&store, &market, DEADLINE).await.unwrap();
    assert!(portfolio.lines.len() == 2);
    let typo = &portfolio.lines[1];
    assert!(typo.holding.coin_id == "doge-typo");
    assert!(typo.status == LineStatus::Unavailable);
    assert!(typo.value == 0.0);
    assert!(portfolio.total_value == 30000.0);
}

#[tokio::test]
async fn test_that_total_matches_sum_over_available_quotes() {
    let store = store_with(&[
        ("bitcoin", 0.5),
        ("ethereum", 3.0),
        ("solana", 12.0),
        ("delisted", 100.0),
    ]);
    let market = StaticMarket::new()
        .with_price("bitcoin", 40000.0)
        .with_price("ethereum", 2500.0)
        .with_price("solana", 25.0);

    let portfolio = compute_portfolio(&store, &market, DEADLINE).await.unwrap();
    let expected = 0.5 * 40000.0 + 3.0 * 2500.0 + 12.0 * 25.0;
    assert!(portfolio.total_value == expected);
    assert!(portfolio.unavailable_count == 1);
}

#[tokio::test]
async fn test_that_market_timeout_marks_every_line_unavailable() {
    let store = store_with(&[("bitcoin", 1.0), ("ethereum", 1.0)]);
    let market = StaticMarket::new()
        .with_price("bitcoin", 30000.0)
        .with_price("ethereum", 2000.0)
        .with_delay(Duration::from_secs(60));

    let portfolio = compute_portfolio(&store, &market, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(portfolio.total_value == 0.0);
    assert!(portfolio
        .lines
        .iter()
        .all(|l| l.status == LineStatus::Unavailable));
    assert!(portfolio.degraded.is_some());
}

#[tokio::test]
async fn test_that_market_error_marks_every_line_unavailable() {
    let store = store_with(&[("bitcoin", 1.0)]);
    let market = StaticMarket::new()
        .with_price("bitcoin", 30000.0)
        .failing(MarketDataError::Unavailable("connection refused".into()));

    let portfolio = compute_portfolio(&store, &market, DEADLINE).await.unwrap();
    assert!(portfolio.total_value == 0.0);
    assert!(portfolio.unavailable_count == 1);
    assert!(portfolio
        .degraded
        .as_deref()
        .is_some_and(|reason| reason.contains("connection refused")));
}

#[tokio::test]
async fn test_that_empty_store_makes_no_market_call() {
    let store = store_with(&[]);
    let market = StaticMarket::new();

    let portfolio = compute_portfolio(&store, &market, DEADLINE).await.unwrap();
    assert!(portfolio.lines.is_empty());
    assert!(portfolio.total_value == 0.0);
    assert!(market.calls() == 0);
}

#[tokio::test]
async fn test_that_priced_lines_carry_the_coin_logo() {
    let store = store_with(&[("bitcoin", 1.0), ("ethereum", 1.0)]);
    let market = StaticMarket::new()
        .with_coin(MarketCoin {
            id: "bitcoin".to_string(),
            symbol: "btc".to_string(),
            name: "Bitcoin".to_string(),
            image: Some("https://assets.example.com/bitcoin.png".to_string()),
            current_price: Some(30000.0),
            market_cap: None,
            change_24h_percent: None,
        })
        .with_price("ethereum", 2000.0);

    let portfolio = compute_portfolio(&store, &market, DEADLINE).await.unwrap();
    let logo = portfolio.lines[0]
        .quote
        .as_ref()
        .and_then(|q| q.image.as_deref());
    assert!(logo == Some("https://assets.example.com/bitcoin.png"));
    assert!(portfolio.lines[1]
        .quote
        .as_ref()
        .is_some_and(|q| q.image.is_none()));
}
