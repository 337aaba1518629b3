use std::time::Duration;

use derive_more::Display;

pub const DEFAULT_API_BASE: &str = "https://api.coingecko.com/api/v3";

const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_BACKOFF_MS: u64 = 60_000;
const MAX_RETRIES: u32 = 10;

#[derive(Debug, Display)]
pub enum ConfigError {
    #[display("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub database_path: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub vs_currency: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Longest single wait between retries, including one asked for by `Retry-After`.
    pub retry_max_delay: Duration,
    pub top_coins: usize,
    pub chart_coin: String,
    pub chart_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            database_path: "portfolio.db".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            vs_currency: "usd".to_string(),
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
            top_coins: 20,
            chart_coin: "bitcoin".to_string(),
            chart_days: 7,
        }
    }
}

impl Config {
    /// Reads `[address] [port]` from the process arguments and everything else from `COINFOLIO_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::load(&args, |key| std::env::var(key).ok())
    }

    /// `args` follows `std::env::args`, so the first element is the program name.
    pub fn load<F>(args: &[String], var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(address) = args.get(1) {
            config.address = address.clone();
        }
        if let Some(port) = args.get(2) {
            config.port = parse("port", port)?;
        }

        if let Some(path) = var("COINFOLIO_DB") {
            config.database_path = path;
        }
        if let Some(base) = var("COINFOLIO_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        config.api_key = var("COINFOLIO_API_KEY").filter(|key| !key.is_empty());
        if let Some(currency) = var("COINFOLIO_VS_CURRENCY") {
            config.vs_currency = currency.to_lowercase();
        }
        if let Some(secs) = var("COINFOLIO_TIMEOUT_SECS") {
            let secs: u64 = parse("COINFOLIO_TIMEOUT_SECS", &secs)?;
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(invalid("COINFOLIO_TIMEOUT_SECS", &secs.to_string()));
            }
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = var("COINFOLIO_MAX_RETRIES") {
            config.max_retries = parse("COINFOLIO_MAX_RETRIES", &retries)?;
            if config.max_retries > MAX_RETRIES {
                return Err(invalid("COINFOLIO_MAX_RETRIES", &retries));
            }
        }
        if let Some(millis) = var("COINFOLIO_BACKOFF_MS") {
            let parsed: u64 = parse("COINFOLIO_BACKOFF_MS", &millis)?;
            if parsed > MAX_BACKOFF_MS {
                return Err(invalid("COINFOLIO_BACKOFF_MS", &millis));
            }
            config.backoff_base = Duration::from_millis(parsed);
        }
        if let Some(limit) = var("COINFOLIO_TOP_COINS") {
            config.top_coins = parse("COINFOLIO_TOP_COINS", &limit)?;
            if config.top_coins == 0 || config.top_coins > 250 {
                return Err(invalid("COINFOLIO_TOP_COINS", &limit));
            }
        }
        if let Some(coin) = var("COINFOLIO_CHART_COIN") {
            config.chart_coin = coin.trim().to_lowercase();
        }
        if let Some(days) = var("COINFOLIO_CHART_DAYS") {
            config.chart_days = parse("COINFOLIO_CHART_DAYS", &days)?;
            if config.chart_days == 0 {
                return Err(invalid("COINFOLIO_CHART_DAYS", &days));
            }
        }

        Ok(config)
    }

    /// Deadline for one valuation: every attempt the client is allowed, plus the longest wait the
    /// client may take before each retry.
    pub fn valuation_deadline(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        self.request_timeout
            .saturating_mul(attempts)
            .saturating_add(self.retry_max_delay.saturating_mul(self.max_retries))
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
