//! Order Book
//!
//! Price-indexed FIFO queues per side plus an order-id index for O(1)
//! cancellation. The book is owned exclusively by its pair loop, so no
//! internal locking is needed.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

use super::types::{BookSnapshot, OrderEntry, PriceKey, Side, TradingPair};

// ============================================================================
// Order Book Side
// ============================================================================

/// One side of the book: ordered price levels, each a FIFO of resting
/// entries. Best price is the max key for bids, min key for asks.
#[derive(Debug)]
pub struct OrderBookSide {
    side: Side,
    levels: BTreeMap<PriceKey, VecDeque<OrderEntry>>,
    entries: usize,
}

impl OrderBookSide {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
            entries: 0,
        }
    }

    /// Number of resting entries on this side.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Best price key: max for bids, min for asks.
    pub fn best_key(&self) -> Option<PriceKey> {
        match self.side {
            Side::Buy => self.levels.keys().next_back().copied(),
            Side::Sell => self.levels.keys().next().copied(),
        }
    }

    pub fn best_price(&self) -> Option<Decimal> {
        self.best_key().map(|k| k.to_decimal())
    }

    /// Append an entry at the back of its price level's queue.
    pub fn add(&mut self, key: PriceKey, entry: OrderEntry) {
        self.levels.entry(key).or_default().push_back(entry);
        self.entries += 1;
    }

    /// Pop the head of the queue at `key`. Empties are pruned by the caller
    /// via [`prune_level`](Self::prune_level) once level processing ends.
    pub fn pop_front(&mut self, key: PriceKey) -> Option<OrderEntry> {
        let queue = self.levels.get_mut(&key)?;
        let entry = queue.pop_front()?;
        self.entries -= 1;
        Some(entry)
    }

    /// Re-insert at the head of the queue, preserving time priority.
    pub fn push_front(&mut self, key: PriceKey, entry: OrderEntry) {
        self.levels.entry(key).or_default().push_front(entry);
        self.entries += 1;
    }

    /// Rotate an entry to the back of the queue.
    pub fn push_back(&mut self, key: PriceKey, entry: OrderEntry) {
        self.levels.entry(key).or_default().push_back(entry);
        self.entries += 1;
    }

    /// Remove a specific order from its price level.
    pub fn remove(&mut self, order_id: i64, key: PriceKey) -> Option<OrderEntry> {
        let queue = self.levels.get_mut(&key)?;
        let pos = queue.iter().position(|o| o.id == order_id)?;
        let entry = queue.remove(pos);
        if entry.is_some() {
            self.entries -= 1;
        }
        if queue.is_empty() {
            self.levels.remove(&key);
        }
        entry
    }

    /// Number of entries queued at `key`.
    pub fn queue_len(&self, key: PriceKey) -> usize {
        self.levels.get(&key).map_or(0, VecDeque::len)
    }

    /// Borrow a specific resting entry.
    pub fn get(&self, order_id: i64, key: PriceKey) -> Option<&OrderEntry> {
        self.levels.get(&key)?.iter().find(|o| o.id == order_id)
    }

    /// Drop the price level if its queue is empty.
    pub fn prune_level(&mut self, key: PriceKey) {
        if self.levels.get(&key).is_some_and(VecDeque::is_empty) {
            self.levels.remove(&key);
        }
    }

    /// Top-n aggregated `(price, total remaining)` in canonical order:
    /// bids descending, asks ascending.
    pub fn depth(&self, n: usize) -> Vec<(Decimal, Decimal)> {
        let aggregate = |(key, queue): (&PriceKey, &VecDeque<OrderEntry>)| {
            let total: Decimal = queue.iter().map(|o| o.remaining_amount).sum();
            (key.to_decimal(), total)
        };
        match self.side {
            Side::Buy => self.levels.iter().rev().take(n).map(aggregate).collect(),
            Side::Sell => self.levels.iter().take(n).map(aggregate).collect(),
        }
    }

    #[cfg(test)]
    fn queue_total(&self) -> usize {
        self.levels.values().map(VecDeque::len).sum()
    }
}

// ============================================================================
// Order Book
// ============================================================================

/// Both sides for one trading pair; owns every resting entry for the pair.
#[derive(Debug)]
pub struct OrderBook {
    pub pair: TradingPair,
    bids: OrderBookSide,
    asks: OrderBookSide,
    index: HashMap<i64, (Side, PriceKey)>,
}

impl OrderBook {
    pub fn new(pair: TradingPair) -> Self {
        Self {
            pair,
            bids: OrderBookSide::new(Side::Buy),
            asks: OrderBookSide::new(Side::Sell),
            index: HashMap::new(),
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.best_price()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.best_price()
    }

    pub fn entry_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn contains(&self, order_id: i64) -> bool {
        self.index.contains_key(&order_id)
    }

    fn side_mut(&mut self, side: Side) -> &mut OrderBookSide {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    pub fn side(&self, side: Side) -> &OrderBookSide {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    /// Rest a limit entry at the back of its price level.
    ///
    /// The caller guarantees the entry carries a price; market orders never
    /// rest.
    pub fn insert(&mut self, entry: OrderEntry) {
        let price = entry
            .price
            .expect("resting entries always carry a price");
        let key = PriceKey::from_decimal(price);
        let side = entry.side;
        self.index.insert(entry.id, (side, key));
        self.side_mut(side).add(key, entry);
    }

    /// Remove a resting entry by id (cancellation path).
    pub fn remove(&mut self, order_id: i64) -> Option<OrderEntry> {
        let (side, key) = self.index.remove(&order_id)?;
        self.side_mut(side).remove(order_id, key)
    }

    /// Borrow a resting entry by id.
    pub fn get(&self, order_id: i64) -> Option<&OrderEntry> {
        let (side, key) = self.index.get(&order_id)?;
        self.side(*side).get(order_id, *key)
    }

    /// Pop the head of `side`'s queue at `key`, dropping it from the index.
    pub(crate) fn pop_front_at(&mut self, side: Side, key: PriceKey) -> Option<OrderEntry> {
        let entry = self.side_mut(side).pop_front(key)?;
        self.index.remove(&entry.id);
        Some(entry)
    }

    /// Re-insert at the head of `side`'s queue at `key`.
    pub(crate) fn push_front_at(&mut self, side: Side, key: PriceKey, entry: OrderEntry) {
        self.index.insert(entry.id, (side, key));
        self.side_mut(side).push_front(key, entry);
    }

    /// Rotate to the back of `side`'s queue at `key`.
    pub(crate) fn push_back_at(&mut self, side: Side, key: PriceKey, entry: OrderEntry) {
        self.index.insert(entry.id, (side, key));
        self.side_mut(side).push_back(key, entry);
    }

    pub(crate) fn prune_level(&mut self, side: Side, key: PriceKey) {
        self.side_mut(side).prune_level(key);
    }

    pub(crate) fn best_key(&self, side: Side) -> Option<PriceKey> {
        self.side(side).best_key()
    }

    pub(crate) fn queue_len_at(&self, side: Side, key: PriceKey) -> usize {
        self.side(side).queue_len(key)
    }

    /// Aggregated top-n snapshot of both sides.
    pub fn snapshot(&self, depth: usize, timestamp: i64) -> BookSnapshot {
        let format = |(price, total): (Decimal, Decimal)| [price.to_string(), total.to_string()];
        BookSnapshot {
            pair: self.pair.clone(),
            bids: self.bids.depth(depth).into_iter().map(format).collect(),
            asks: self.asks.depth(depth).into_iter().map(format).collect(),
            timestamp,
        }
    }
}
