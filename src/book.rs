use std::collections::BTreeMap;

use ordered_float::OrderedFloat;

use crate::{
    errors::StreamError,
    models::{BookLevel, Change, OrderBookSnapshot, Side, Update},
};

/// Price -> amount for one side of a book. Zero amounts are never stored.
#[derive(Debug, Clone, Default)]
pub struct PriceLevelMap {
    levels: BTreeMap<OrderedFloat<f64>, f64>,
}

impl PriceLevelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the amount at `price`, removing the level when `amount` is zero.
    /// Removing a price that is not present is a no-op.
    pub fn upsert(&mut self, price: f64, amount: f64) {
        if amount == 0.0 {
            self.levels.remove(&OrderedFloat(price));
        } else {
            self.levels.insert(OrderedFloat(price), amount);
        }
    }

    pub fn get(&self, price: f64) -> Option<f64> {
        self.levels.get(&OrderedFloat(price)).copied()
    }

    pub fn ascending(&self) -> impl DoubleEndedIterator<Item = (f64, f64)> + '_ {
        self.levels.iter().map(|(price, amount)| (price.0, *amount))
    }

    pub fn descending(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.ascending().rev()
    }

    pub fn lowest(&self) -> Option<(f64, f64)> {
        self.levels
            .first_key_value()
            .map(|(price, amount)| (price.0, *amount))
    }

    pub fn highest(&self) -> Option<(f64, f64)> {
        self.levels
            .last_key_value()
            .map(|(price, amount)| (price.0, *amount))
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }
}

/// Incrementally maintained L2 book.
///
/// When the exchange stamps updates with `(first, last)` ids the book only
/// applies contiguous ranges: anything ending at or before the last applied id
/// is stale, and anything starting past `last_applied + 1` is a gap. A gap flags
/// the book as needing a resync and is reported once.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    bids: PriceLevelMap,
    asks: PriceLevelMap,
    last_update_id: Option<u64>,
    needs_resync: bool,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_levels(levels: &[BookLevel], last_update_id: Option<u64>) -> Self {
        let mut book = Self::new();
        for level in levels {
            book.upsert(level);
        }
        book.last_update_id = last_update_id;
        book
    }

    pub fn apply(
        &mut self,
        levels: &[BookLevel],
        first_update_id: Option<u64>,
        last_update_id: Option<u64>,
    ) -> Result<Change, StreamError> {
        if let (Some(applied), Some(last)) = (self.last_update_id, last_update_id) {
            if last <= applied {
                return Err(StreamError::StaleUpdate(format!(
                    "update id {last} already applied (last applied {applied})"
                )));
            }

            let first = first_update_id.unwrap_or(last);
            if first > applied + 1 {
                if self.needs_resync {
                    return Err(StreamError::StaleUpdate(format!(
                        "book awaiting resync, dropping update {first}..{last}"
                    )));
                }
                tracing::warn!(
                    last_applied = applied,
                    first_update_id = first,
                    "order book sequence gap, flagging for resync"
                );
                self.needs_resync = true;
                return Ok(Change::ResyncRequired);
            }
        }

        for level in levels {
            self.upsert(level);
        }
        if last_update_id.is_some() {
            self.last_update_id = last_update_id;
        }

        Ok(Change::Update(Update::Book(self.snapshot())))
    }

    fn upsert(&mut self, level: &BookLevel) {
        let amount = level.amount.abs();
        match level.side {
            Side::Bid => self.bids.upsert(level.price, amount),
            Side::Ask => self.asks.upsert(level.price, amount),
        }
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            bids: self.bids.descending().collect(),
            asks: self.asks.ascending().collect(),
            needs_resync: self.needs_resync,
        }
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.highest()
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.lowest()
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub fn last_update_id(&self) -> Option<u64> {
        self.last_update_id
    }
}
