pub mod binance;
pub mod bitfinex;
pub mod registry;
pub mod traits;
