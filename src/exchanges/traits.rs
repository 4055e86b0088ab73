use async_trait::async_trait;
use serde_json::Value;

use crate::{
    credentials::Credentials,
    errors::StreamError,
    models::{Channel, MarketUpdate, StreamId, SubscriptionKey},
};

/// One decoded inbound frame, before it is routed to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Handshake/info event. `handshake` marks the one that opens the session.
    Info { handshake: bool, message: Value },
    Error { code: Option<i64>, message: String },
    Subscribed {
        request_id: u64,
        stream_id: Option<StreamId>,
    },
    SubscribeFailed {
        request_id: Option<u64>,
        code: i64,
        message: String,
    },
    Unsubscribed { stream_id: Option<StreamId> },
    /// Market data for a physical stream; decoded later with the stream's channel.
    Data { stream_id: StreamId, body: Value },
    /// Account data already demultiplexed by user channel.
    Account(MarketUpdate),
    AuthOk,
    AuthFailed { message: String },
    Heartbeat,
}

/// Where a channel's initial snapshot comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// First snapshot-shaped message on the stream itself.
    Inline,
    /// Fetched out of band through a `SnapshotSource`; stream updates are
    /// buffered until it arrives.
    Fetch,
    /// No snapshot; the model starts empty.
    Empty,
}

/// Wire protocol of one exchange: message construction and frame decoding.
pub trait ExchangeProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn ws_url(&self) -> &str;

    /// Whether `connect` must wait for an `Inbound::Info { handshake: true }`.
    fn requires_handshake(&self) -> bool;

    /// Normalizes the symbol and channel parameters so equivalent requests
    /// share one logical key; rejects channels the exchange cannot serve.
    fn canonical_key(&self, key: SubscriptionKey) -> Result<SubscriptionKey, StreamError>;

    fn snapshot_mode(&self, channel: &Channel) -> SnapshotMode;

    /// Stream id known before the exchange confirms the subscription.
    fn stream_id_for(&self, key: &SubscriptionKey) -> Option<StreamId>;

    fn subscribe_message(&self, key: &SubscriptionKey, request_id: u64) -> String;

    fn unsubscribe_message(&self, stream_id: &StreamId, request_id: u64) -> String;

    fn auth_message(&self, credentials: &Credentials, nonce: u64) -> Result<String, StreamError>;

    fn parse_frame(&self, text: &str) -> Result<Vec<Inbound>, StreamError>;

    fn decode(&self, channel: &Channel, body: &Value) -> Result<Vec<MarketUpdate>, StreamError>;
}

/// Out-of-band initial snapshots for channels in `SnapshotMode::Fetch`.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, key: &SubscriptionKey) -> Result<MarketUpdate, StreamError>;
}
