pub mod book;
pub mod client;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod exchanges;
pub mod history;
pub mod model;
pub mod models;
pub mod registry;
pub mod transport;
pub mod ws_shared;

pub use client::ExchangeStreamClient;
pub use config::ClientConfig;
pub use credentials::Credentials;
pub use errors::StreamError;
pub use exchanges::registry::{ExchangeName, ExchangeRegistry};
