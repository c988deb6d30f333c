//! Two-sided limit order book with price-time priority.
//!
//! One instance per asset:
//! - Bids: descending by price (best = highest), ties by ascending order id.
//! - Asks: ascending by price (best = lowest), ties by ascending order id.
//!
//! Each side is a `BTreeMap` keyed on `(price, order_id)` priority, plus an
//! order-id index into the keys, so insert, cancel-by-id and top access are
//! all O(log n).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::order::{LimitOrder, OrderId, UserId};
use crate::side::Side;

/// Priority key for one side of the book.
///
/// Bids store the negated price so that ascending key order is priority
/// order on both sides; prices are validated strictly positive upstream,
/// so the sign flip is lossless and `total_cmp` gives a total order.
#[derive(Debug, Clone, Copy)]
struct BookKey {
    signed_price: f32,
    order_id: OrderId,
}

impl BookKey {
    fn bid(order: &LimitOrder) -> Self {
        BookKey {
            signed_price: -order.price,
            order_id: order.order_id,
        }
    }

    fn ask(order: &LimitOrder) -> Self {
        BookKey {
            signed_price: order.price,
            order_id: order.order_id,
        }
    }
}

impl PartialEq for BookKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BookKey {}

impl PartialOrd for BookKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BookKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.signed_price
            .total_cmp(&other.signed_price)
            .then_with(|| self.order_id.cmp(&other.order_id))
    }
}

/// One ordered side plus its id index.
///
/// Invariant: `index` contains exactly the ids of the orders in `orders`.
#[derive(Debug, Default)]
struct BookSide {
    orders: BTreeMap<BookKey, LimitOrder>,
    index: HashMap<OrderId, BookKey>,
}

impl BookSide {
    fn len(&self) -> usize {
        self.orders.len()
    }

    fn insert(&mut self, key: BookKey, order: LimitOrder) {
        self.index.insert(order.order_id, key);
        self.orders.insert(key, order);
    }

    fn cancel(&mut self, order_id: OrderId) -> Option<LimitOrder> {
        let key = self.index.remove(&order_id)?;
        self.orders.remove(&key)
    }

    fn top(&self) -> Option<&LimitOrder> {
        self.orders.first_key_value().map(|(_, order)| order)
    }

    fn pop_top(&mut self) -> Option<LimitOrder> {
        let (_, order) = self.orders.pop_first()?;
        self.index.remove(&order.order_id);
        Some(order)
    }

    fn clear(&mut self) {
        self.orders.clear();
        self.index.clear();
    }
}

/// Cumulative depth per side: one `(price, cumulative_volume)` entry per
/// populated price level, best level first. The volume at a level is the
/// total resting volume with priority at least as good as that price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookDepth {
    pub bid: Vec<(f32, f32)>,
    pub ask: Vec<(f32, f32)>,
}

/// Both sides flattened into priority order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatBook {
    pub bid: Vec<LimitOrder>,
    pub ask: Vec<LimitOrder>,
}

/// The order book proper. Methods are not synchronized; the owning
/// simulation guards access.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BookSide,
    asks: BookSide,
}

impl OrderBook {
    pub fn new() -> Self {
        OrderBook::default()
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_count(&self) -> usize {
        self.asks.len()
    }

    /// True if `order_id` rests on either side.
    pub fn has_order(&self, order_id: OrderId) -> bool {
        self.bids.index.contains_key(&order_id) || self.asks.index.contains_key(&order_id)
    }

    /// Insert a limit order on its side.
    ///
    /// Returns `false` (and leaves the book untouched) iff an order with
    /// the same id is already present on this book. The engine assigns
    /// ids, so a duplicate indicates an engine bug rather than a caller
    /// error.
    pub fn insert(&mut self, order: LimitOrder) -> bool {
        if self.has_order(order.order_id) {
            return false;
        }
        match order.side {
            Side::Bid => self.bids.insert(BookKey::bid(&order), order),
            Side::Ask => self.asks.insert(BookKey::ask(&order), order),
        }
        true
    }

    /// Remove an order by id from whichever side holds it.
    ///
    /// Returns `false` if the id is unknown here (already filled,
    /// cancelled, or never on this book).
    pub fn cancel(&mut self, order_id: OrderId) -> bool {
        self.bids.cancel(order_id).is_some() || self.asks.cancel(order_id).is_some()
    }

    /// The highest-priority bid.
    pub fn top_bid(&self) -> SimResult<&LimitOrder> {
        self.bids.top().ok_or(SimError::BookEmpty(Side::Bid))
    }

    /// The highest-priority ask.
    pub fn top_ask(&self) -> SimResult<&LimitOrder> {
        self.asks.top().ok_or(SimError::BookEmpty(Side::Ask))
    }

    /// Remove and return the highest-priority bid.
    pub fn pop_top_bid(&mut self) -> SimResult<LimitOrder> {
        self.bids.pop_top().ok_or(SimError::BookEmpty(Side::Bid))
    }

    /// Remove and return the highest-priority ask.
    pub fn pop_top_ask(&mut self) -> SimResult<LimitOrder> {
        self.asks.pop_top().ok_or(SimError::BookEmpty(Side::Ask))
    }

    /// True when both sides are populated and the best bid meets or
    /// exceeds the best ask. A crossed book at an observation boundary is
    /// an engine invariant violation.
    pub fn is_crossed(&self) -> bool {
        match (self.bids.top(), self.asks.top()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Cumulative volume per price level, both sides, best level first.
    pub fn book_depth(&self) -> BookDepth {
        BookDepth {
            bid: Self::cumulate(self.bids.orders.values()),
            ask: Self::cumulate(self.asks.orders.values()),
        }
    }

    fn cumulate<'a>(orders: impl Iterator<Item = &'a LimitOrder>) -> Vec<(f32, f32)> {
        let mut levels: Vec<(f32, f32)> = Vec::new();
        let mut accumulated = 0.0f32;
        for order in orders {
            accumulated += order.volume;
            match levels.last_mut() {
                Some(level) if level.0 == order.price => level.1 = accumulated,
                _ => levels.push((order.price, accumulated)),
            }
        }
        levels
    }

    /// Both sides flattened into priority order.
    pub fn flatten(&self) -> FlatBook {
        FlatBook {
            bid: self.bids.orders.values().copied().collect(),
            ask: self.asks.orders.values().copied().collect(),
        }
    }

    /// Ids of every resting order belonging to `user_id`, both sides.
    pub fn orders_of_user(&self, user_id: UserId) -> BTreeSet<OrderId> {
        self.bids
            .orders
            .values()
            .chain(self.asks.orders.values())
            .filter(|order| order.user_id == user_id)
            .map(|order| order.order_id)
            .collect()
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }
}
