use std::{collections::HashMap, fmt, str::FromStr};

use crate::{client::ExchangeStreamClient, config::ClientConfig, errors::StreamError};

use super::{binance, bitfinex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeName {
    Bitfinex,
    Binance,
}

impl ExchangeName {
    pub const ALL: [ExchangeName; 2] = [Self::Bitfinex, Self::Binance];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bitfinex => bitfinex::EXCHANGE_NAME,
            Self::Binance => binance::EXCHANGE_NAME,
        }
    }
}

impl fmt::Display for ExchangeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeName {
    type Err = StreamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == normalized)
            .ok_or_else(|| StreamError::UnsupportedExchange(value.trim().to_string()))
    }
}

pub type ClientConstructor = fn(ClientConfig) -> Result<ExchangeStreamClient, StreamError>;

/// Explicit exchange table, filled once at startup.
#[derive(Default)]
pub struct ExchangeRegistry {
    constructors: HashMap<ExchangeName, ClientConstructor>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ExchangeName::Bitfinex, |config| {
            Ok(ExchangeStreamClient::bitfinex(config))
        });
        registry.register(ExchangeName::Binance, ExchangeStreamClient::binance);
        registry
    }

    pub fn register(&mut self, name: ExchangeName, constructor: ClientConstructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn supports(&self, name: ExchangeName) -> bool {
        self.constructors.contains_key(&name)
    }

    /// Builds a fresh, disconnected client for `name`.
    pub fn build(
        &self,
        name: ExchangeName,
        config: &ClientConfig,
    ) -> Result<ExchangeStreamClient, StreamError> {
        let constructor = self
            .constructors
            .get(&name)
            .ok_or_else(|| StreamError::UnsupportedExchange(name.to_string()))?;
        constructor(config.clone())
    }
}
