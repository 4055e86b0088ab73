use std::collections::VecDeque;

use crate::{
    errors::StreamError,
    models::{CandleRecord, Change, Snapshot, TradeRecord, Update},
};

pub const DEFAULT_TRADE_CAPACITY: usize = 100;
pub const DEFAULT_CANDLE_CAPACITY: usize = 500;

/// Which end of the buffer holds the most recent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOrder {
    NewestFirst,
    OldestFirst,
}

/// Fixed-capacity record history. Appending at the newest end evicts from the
/// oldest end once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    records: VecDeque<T>,
    capacity: usize,
    order: HistoryOrder,
}

impl<T: Clone> BoundedHistory<T> {
    pub fn new(capacity: usize, order: HistoryOrder) -> Result<Self, StreamError> {
        if capacity == 0 {
            return Err(StreamError::InvalidCapacity(capacity));
        }

        Ok(Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            order,
        })
    }

    /// Seeds from records already in storage order, keeping the newest
    /// `capacity` of them.
    pub fn seeded(
        capacity: usize,
        order: HistoryOrder,
        records: impl IntoIterator<Item = T>,
    ) -> Result<Self, StreamError> {
        let mut history = Self::new(capacity, order)?;
        history.records.extend(records);
        while history.records.len() > capacity {
            history.evict();
        }
        Ok(history)
    }

    pub fn append(&mut self, record: T) {
        match self.order {
            HistoryOrder::NewestFirst => self.records.push_front(record),
            HistoryOrder::OldestFirst => self.records.push_back(record),
        }
        if self.records.len() > self.capacity {
            self.evict();
        }
    }

    /// Overwrites the most recently appended record. Appends when empty.
    pub fn replace_last(&mut self, record: T) {
        match self.last_mut() {
            Some(slot) => *slot = record,
            None => self.append(record),
        }
    }

    pub fn last(&self) -> Option<&T> {
        match self.order {
            HistoryOrder::NewestFirst => self.records.front(),
            HistoryOrder::OldestFirst => self.records.back(),
        }
    }

    fn last_mut(&mut self) -> Option<&mut T> {
        match self.order {
            HistoryOrder::NewestFirst => self.records.front_mut(),
            HistoryOrder::OldestFirst => self.records.back_mut(),
        }
    }

    fn evict(&mut self) {
        match self.order {
            HistoryOrder::NewestFirst => self.records.pop_back(),
            HistoryOrder::OldestFirst => self.records.pop_front(),
        };
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.records.iter()
    }

    pub fn to_ordered_vec(&self) -> Vec<T> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn order(&self) -> HistoryOrder {
        self.order
    }
}

/// Recent trades, newest first.
#[derive(Debug, Clone)]
pub struct Trades {
    history: BoundedHistory<TradeRecord>,
}

impl Trades {
    pub fn new(capacity: usize, seed: Vec<TradeRecord>) -> Result<Self, StreamError> {
        Ok(Self {
            history: BoundedHistory::seeded(capacity, HistoryOrder::NewestFirst, seed)?,
        })
    }

    pub fn apply(&mut self, trade: TradeRecord) -> Result<Change, StreamError> {
        if let Some(newest) = self.history.last() {
            if trade.timestamp < newest.timestamp {
                return Err(StreamError::StaleUpdate(format!(
                    "trade at {} older than newest {}",
                    trade.timestamp, newest.timestamp
                )));
            }
        }
        if trade.id.is_some() && self.history.iter().any(|known| known.id == trade.id) {
            return Err(StreamError::StaleUpdate(format!(
                "duplicate trade id {:?}",
                trade.id
            )));
        }

        self.history.append(trade.clone());
        Ok(Change::Update(Update::Trade(trade)))
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::Trades(self.history.to_ordered_vec())
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Candle history keyed by open time, oldest first.
#[derive(Debug, Clone)]
pub struct Candles {
    history: BoundedHistory<CandleRecord>,
}

impl Candles {
    /// `seed` must already be ordered oldest to newest.
    pub fn new(capacity: usize, mut seed: Vec<CandleRecord>) -> Result<Self, StreamError> {
        seed.dedup_by_key(|candle| candle.open_time);
        Ok(Self {
            history: BoundedHistory::seeded(capacity, HistoryOrder::OldestFirst, seed)?,
        })
    }

    pub fn apply(&mut self, candle: CandleRecord) -> Result<Change, StreamError> {
        let Some(last_open_time) = self.history.last().map(|last| last.open_time) else {
            self.history.append(candle.clone());
            return Ok(Change::Add(candle));
        };

        if candle.open_time == last_open_time {
            self.history.replace_last(candle.clone());
            Ok(Change::Update(Update::Candle(candle)))
        } else if candle.open_time > last_open_time {
            self.history.append(candle.clone());
            Ok(Change::Add(candle))
        } else {
            Err(StreamError::StaleUpdate(format!(
                "candle {} is before the open candle {last_open_time}",
                candle.open_time
            )))
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::Candles(self.history.to_ordered_vec())
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
