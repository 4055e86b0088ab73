use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::history::{DEFAULT_CANDLE_CAPACITY, DEFAULT_TRADE_CAPACITY};

pub const BITFINEX_WS_URL: &str = "wss://api.bitfinex.com/ws/2";
pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/stream";
pub const BINANCE_REST_URL: &str = "https://api.binance.com";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub bitfinex_ws_url: String,
    pub binance_ws_url: String,
    pub binance_rest_url: String,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub auth_timeout: Duration,
    pub request_timeout: Duration,
    pub trade_capacity: usize,
    pub candle_capacity: usize,
    pub book_depth: u32,
    pub max_buffered_updates: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bitfinex_ws_url: BITFINEX_WS_URL.to_string(),
            binance_ws_url: BINANCE_WS_URL.to_string(),
            binance_rest_url: BINANCE_REST_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            trade_capacity: DEFAULT_TRADE_CAPACITY,
            candle_capacity: DEFAULT_CANDLE_CAPACITY,
            book_depth: 25,
            max_buffered_updates: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any `FEED_*` key source; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let url = |key: &str, default: String| {
            lookup(key)
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(default)
        };

        let config = Self {
            bitfinex_ws_url: url("FEED_BITFINEX_WS_URL", defaults.bitfinex_ws_url),
            binance_ws_url: url("FEED_BINANCE_WS_URL", defaults.binance_ws_url),
            binance_rest_url: url("FEED_BINANCE_REST_URL", defaults.binance_rest_url),
            connect_timeout: parse_millis(&lookup, "FEED_CONNECT_TIMEOUT_MS")?
                .unwrap_or(defaults.connect_timeout),
            subscribe_timeout: parse_millis(&lookup, "FEED_SUBSCRIBE_TIMEOUT_MS")?
                .unwrap_or(defaults.subscribe_timeout),
            auth_timeout: parse_millis(&lookup, "FEED_AUTH_TIMEOUT_MS")?
                .unwrap_or(defaults.auth_timeout),
            request_timeout: parse_millis(&lookup, "FEED_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.request_timeout),
            trade_capacity: parse_value(&lookup, "FEED_TRADE_CAPACITY")?
                .unwrap_or(defaults.trade_capacity),
            candle_capacity: parse_value(&lookup, "FEED_CANDLE_CAPACITY")?
                .unwrap_or(defaults.candle_capacity),
            book_depth: parse_value(&lookup, "FEED_BOOK_DEPTH")?.unwrap_or(defaults.book_depth),
            max_buffered_updates: parse_value(&lookup, "FEED_MAX_BUFFERED_UPDATES")?
                .unwrap_or(defaults.max_buffered_updates),
        };

        if config.trade_capacity == 0 {
            return Err(anyhow!("FEED_TRADE_CAPACITY must be greater than zero"));
        }
        if config.candle_capacity == 0 {
            return Err(anyhow!("FEED_CANDLE_CAPACITY must be greater than zero"));
        }

        Ok(config)
    }
}

fn parse_value<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {key} value: {value}")),
        None => Ok(None),
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse_value::<u64>(lookup, key)?.map(Duration::from_millis))
}
