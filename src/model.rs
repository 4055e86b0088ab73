use serde_json::Value;

use crate::{
    book::OrderBook,
    config::ClientConfig,
    errors::StreamError,
    history::{Candles, Trades},
    models::{Change, Channel, MarketUpdate, Snapshot, Ticker, Update},
};

/// Live state behind one logical subscription.
#[derive(Debug, Clone)]
pub enum DataModel {
    Ticker(Ticker),
    Book(OrderBook),
    Trades(Trades),
    Candles(Candles),
    Account(AccountFeed),
}

impl DataModel {
    /// Builds the model from the first snapshot-shaped update for `channel`.
    pub fn seed(
        channel: &Channel,
        update: MarketUpdate,
        config: &ClientConfig,
    ) -> Result<Self, StreamError> {
        match (channel, update) {
            (Channel::Ticker, MarketUpdate::Ticker(ticker)) => Ok(Self::Ticker(ticker)),
            (
                Channel::Book { .. },
                MarketUpdate::BookSnapshot {
                    levels,
                    last_update_id,
                },
            ) => Ok(Self::Book(OrderBook::from_levels(&levels, last_update_id))),
            (Channel::Trades, MarketUpdate::TradesSnapshot(trades)) => {
                Ok(Self::Trades(Trades::new(config.trade_capacity, trades)?))
            }
            (Channel::Candles { .. }, MarketUpdate::CandlesSnapshot(candles)) => {
                Ok(Self::Candles(Candles::new(config.candle_capacity, candles)?))
            }
            (Channel::User { .. }, MarketUpdate::AccountSnapshot { rows, .. }) => {
                Ok(Self::Account(AccountFeed::new(rows)))
            }
            (channel, update) => Err(StreamError::Snapshot(format!(
                "cannot seed {} from {}",
                channel.name(),
                update.kind()
            ))),
        }
    }

    /// Empty model for channels that never receive a snapshot up front.
    pub fn empty(channel: &Channel) -> Option<Self> {
        match channel {
            Channel::User { .. } => Some(Self::Account(AccountFeed::new(Vec::new()))),
            _ => None,
        }
    }

    pub fn apply(&mut self, update: MarketUpdate) -> Result<Change, StreamError> {
        match (self, update) {
            (Self::Ticker(current), MarketUpdate::Ticker(ticker)) => {
                *current = ticker.clone();
                Ok(Change::Update(Update::Ticker(ticker)))
            }
            (
                Self::Book(book),
                MarketUpdate::BookDelta {
                    levels,
                    first_update_id,
                    last_update_id,
                },
            ) => book.apply(&levels, first_update_id, last_update_id),
            (
                Self::Book(book),
                MarketUpdate::BookSnapshot {
                    levels,
                    last_update_id,
                },
            ) => {
                *book = OrderBook::from_levels(&levels, last_update_id);
                Ok(Change::Snapshot(Snapshot::Book(book.snapshot())))
            }
            (Self::Trades(trades), MarketUpdate::Trade(trade)) => trades.apply(trade),
            (Self::Candles(candles), MarketUpdate::Candle(candle)) => candles.apply(candle),
            (Self::Account(feed), MarketUpdate::AccountSnapshot { rows, .. }) => {
                feed.rows = rows.clone();
                Ok(Change::Snapshot(Snapshot::Account(rows)))
            }
            (Self::Account(_), MarketUpdate::Account { event, row, .. }) => {
                Ok(Change::Update(Update::Account { event, row }))
            }
            (model, update) => Err(StreamError::parse(format!(
                "{} does not apply to a {} model",
                update.kind(),
                model.name()
            ))),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        match self {
            Self::Ticker(ticker) => Snapshot::Ticker(ticker.clone()),
            Self::Book(book) => Snapshot::Book(book.snapshot()),
            Self::Trades(trades) => trades.snapshot(),
            Self::Candles(candles) => candles.snapshot(),
            Self::Account(feed) => Snapshot::Account(feed.rows.clone()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Ticker(_) => "ticker",
            Self::Book(_) => "book",
            Self::Trades(_) => "trades",
            Self::Candles(_) => "candles",
            Self::Account(_) => "account",
        }
    }
}

/// Authenticated account rows for one user channel, as of the last
/// account snapshot.
#[derive(Debug, Clone)]
pub struct AccountFeed {
    rows: Vec<Value>,
}

impl AccountFeed {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows }
    }
}
