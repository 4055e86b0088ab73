use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::Value;

/// Channel family requested by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Channel {
    Ticker,
    Book { depth: u32 },
    Trades,
    Candles { timeframe: String },
    User { channel: UserChannel },
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Book { .. } => "book",
            Self::Trades => "trades",
            Self::Candles { .. } => "candles",
            Self::User { channel } => channel.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UserChannel {
    Orders,
    Trades,
    Balances,
}

impl UserChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Trades => "userTrades",
            Self::Balances => "balances",
        }
    }
}

pub const ACCOUNT_SYMBOL: &str = "account";

/// Logical subscription: what the caller asked for, independent of the
/// physical stream carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKey {
    pub symbol: String,
    pub channel: Channel,
}

impl SubscriptionKey {
    pub fn new(symbol: impl AsRef<str>, channel: Channel) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_string(),
            channel,
        }
    }

    pub fn user(channel: UserChannel) -> Self {
        Self::new(ACCOUNT_SYMBOL, Channel::User { channel })
    }

    pub fn is_user(&self) -> bool {
        matches!(self.channel, Channel::User { .. })
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.channel {
            Channel::Book { depth } => write!(f, "{}|book|{depth}", self.symbol),
            Channel::Candles { timeframe } => write!(f, "{}|candles|{timeframe}", self.symbol),
            other => write!(f, "{}|{}", self.symbol, other.name()),
        }
    }
}

/// Exchange-assigned identifier of a physical stream: a numeric channel id on
/// Bitfinex, a stream name on Binance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamId {
    Channel(u64),
    Named(String),
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "{id}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Bid,
    Ask,
}

/// One level change. `amount == 0.0` removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BookLevel {
    pub side: Side,
    pub price: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    /// Highest price first.
    pub bids: Vec<(f64, f64)>,
    /// Lowest price first.
    pub asks: Vec<(f64, f64)>,
    pub needs_resync: bool,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.first().copied()
    }

    pub fn bid(&self, price: f64) -> Option<f64> {
        level_amount(&self.bids, price)
    }

    pub fn ask(&self, price: f64) -> Option<f64> {
        level_amount(&self.asks, price)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

fn level_amount(levels: &[(f64, f64)], price: f64) -> Option<f64> {
    levels
        .iter()
        .find(|(level_price, _)| *level_price == price)
        .map(|(_, amount)| *amount)
}

/// Signed amount: negative for sells, positive for buys.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: Option<u64>,
    pub timestamp: u64,
    pub amount: f64,
    pub price: f64,
}

impl TradeRecord {
    pub fn is_sell(&self) -> bool {
        self.amount < 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleRecord {
    pub open_time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub bid: f64,
    pub bid_size: f64,
    pub ask: f64,
    pub ask_size: f64,
    pub daily_change: f64,
    pub daily_change_relative: f64,
    pub last_price: f64,
    pub volume: f64,
    pub high: f64,
    pub low: f64,
}

/// Normalized payload decoded from one exchange message, ready for a
/// `DataModel` to seed from or apply.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketUpdate {
    BookSnapshot {
        levels: Vec<BookLevel>,
        last_update_id: Option<u64>,
    },
    BookDelta {
        levels: Vec<BookLevel>,
        first_update_id: Option<u64>,
        last_update_id: Option<u64>,
    },
    TradesSnapshot(Vec<TradeRecord>),
    Trade(TradeRecord),
    CandlesSnapshot(Vec<CandleRecord>),
    Candle(CandleRecord),
    Ticker(Ticker),
    AccountSnapshot {
        channel: UserChannel,
        rows: Vec<Value>,
    },
    Account {
        channel: UserChannel,
        event: String,
        row: Value,
    },
}

impl MarketUpdate {
    pub fn is_snapshot(&self) -> bool {
        matches!(
            self,
            Self::BookSnapshot { .. }
                | Self::TradesSnapshot(_)
                | Self::CandlesSnapshot(_)
                | Self::Ticker(_)
                | Self::AccountSnapshot { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::BookSnapshot { .. } => "book snapshot",
            Self::BookDelta { .. } => "book delta",
            Self::TradesSnapshot(_) => "trades snapshot",
            Self::Trade(_) => "trade",
            Self::CandlesSnapshot(_) => "candles snapshot",
            Self::Candle(_) => "candle",
            Self::Ticker(_) => "ticker",
            Self::AccountSnapshot { .. } => "account snapshot",
            Self::Account { .. } => "account update",
        }
    }
}

/// Full materialization of a model's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "data")]
pub enum Snapshot {
    Book(OrderBookSnapshot),
    Trades(Vec<TradeRecord>),
    Candles(Vec<CandleRecord>),
    Ticker(Ticker),
    Account(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "data")]
pub enum Update {
    /// The book is re-rendered from a fresh snapshot after every applied delta.
    Book(OrderBookSnapshot),
    Trade(TradeRecord),
    Candle(CandleRecord),
    Ticker(Ticker),
    Account { event: String, row: Value },
}

/// Change descriptor handed to subscriber callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "tag", content = "payload")]
pub enum Change {
    Snapshot(Snapshot),
    Update(Update),
    Add(CandleRecord),
    /// The order book missed updates and no longer tracks the exchange.
    ResyncRequired,
}

impl Change {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::Update(_) => "update",
            Self::Add(_) => "add",
            Self::ResyncRequired => "resync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub sender: &'static str,
    pub key: SubscriptionKey,
    pub change: Change,
}

/// Unsolicited, subscription-independent notices from a session.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoEvent {
    Info { sender: &'static str, message: Value },
    Error {
        sender: &'static str,
        code: Option<i64>,
        message: String,
    },
    Disconnected { sender: &'static str, reason: String },
}

pub type Callback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;
pub type InfoHandler = Arc<dyn Fn(InfoEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Returned by `subscribe`; identifies both the logical stream and the
/// subscriber's callback so `unsubscribe` removes exactly one registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub key: SubscriptionKey,
    pub subscriber: SubscriberId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Connecting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_key_display_includes_channel_params() {
        let book = SubscriptionKey::new(" tBTCUSD ", Channel::Book { depth: 25 });
        let candles = SubscriptionKey::new(
            "BTCUSDT",
            Channel::Candles {
                timeframe: "1m".to_string(),
            },
        );

        assert_eq!(book.to_string(), "tBTCUSD|book|25");
        assert_eq!(candles.to_string(), "BTCUSDT|candles|1m");
        assert_eq!(
            SubscriptionKey::user(UserChannel::Balances).to_string(),
            "account|balances"
        );
    }

    #[test]
    fn change_serializes_with_tag_and_payload() {
        let change = Change::Add(CandleRecord {
            open_time: 1,
            open: 2.0,
            high: 3.0,
            low: 1.0,
            close: 2.5,
            volume: 10.0,
        });

        let value = serde_json::to_value(&change).expect("change should serialize");
        assert_eq!(value["tag"], "add");
        assert_eq!(value["payload"]["openTime"], 1);
        assert_eq!(change.tag(), "add");
    }

    #[test]
    fn snapshot_best_levels_come_from_the_front() {
        let snapshot = OrderBookSnapshot {
            bids: vec![(101.0, 1.0), (100.0, 2.0)],
            asks: vec![(102.0, 0.5), (103.0, 4.0)],
            needs_resync: false,
        };

        assert_eq!(snapshot.best_bid(), Some((101.0, 1.0)));
        assert_eq!(snapshot.best_ask(), Some((102.0, 0.5)));
        assert_eq!(snapshot.bid(100.0), Some(2.0));
        assert_eq!(snapshot.ask(101.0), None);
    }
}
