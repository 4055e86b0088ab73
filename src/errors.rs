use std::time::Duration;

/// Every failure the streaming core can produce.
///
/// `ProtocolParse` and `StaleUpdate` never leave the session task: the frame or
/// update is logged and dropped so one bad message cannot take the stream down.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),
    #[error("stale update discarded: {0}")]
    StaleUpdate(String),
    #[error("subscription rejected by exchange (code {code}): {message}")]
    SubscriptionFailure { code: i64, message: String },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("user channels require an authenticated session")]
    NotAuthenticated,
    #[error("no handshake within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("no initial snapshot within {0:?}")]
    SubscribeTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("client is not connected")]
    NotConnected,
    #[error("history capacity must be greater than zero, got {0}")]
    InvalidCapacity(usize),
    #[error("{0}")]
    InvalidSymbol(String),
    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),
    #[error("channel `{channel}` is not supported by {exchange}")]
    UnsupportedChannel {
        exchange: &'static str,
        channel: String,
    },
    #[error("stream {stream_id} already carries {owner}")]
    StreamInUse { stream_id: String, owner: String },
    #[error("initial snapshot unavailable: {0}")]
    Snapshot(String),
    #[error("invalid credentials: {0}")]
    Credentials(String),
}

impl StreamError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ProtocolParse(message.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(error: reqwest::Error) -> Self {
        Self::Snapshot(error.to_string())
    }
}
