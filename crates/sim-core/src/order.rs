//! Order, transaction and identifier types.
//!
//! All identifiers are dense `u32`s handed out by monotonic counters at
//! registration time: an id exists iff it is strictly smaller than its
//! counter. Order ids are globally unique across assets and sides.

use serde::{Deserialize, Serialize};

use crate::side::Side;

pub type UserId = u32;
pub type AssetId = u32;
pub type OrderId = u32;
pub type TransactionId = u32;
pub type Step = u32;

/// A limit order, either incoming or resting on a book.
///
/// `price` and `volume` are validated to be strictly positive at
/// submission; `volume` shrinks as the order fills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub side: Side,
    pub price: f32,
    pub volume: f32,
}

/// Cancels a previously submitted limit order.
///
/// The referenced order may already be filled, cancelled or unknown; the
/// cancel is then a no-op rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub user_id: UserId,
    pub order_id_to_cancel: OrderId,
}

/// A market order. Consumed entirely within the step that processes it;
/// it never rests on the book, and unfillable volume is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub side: Side,
    pub volume: f32,
}

/// A queued submission awaiting the next step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderCommand {
    Limit(LimitOrder),
    Cancel(CancelOrder),
    Market(MarketOrder),
}

/// A completed trade. Append-only; never mutated after creation.
///
/// `step` is the index of the step during which the trade executed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub step: Step,
    pub asset_id: AssetId,
    pub buyer: UserId,
    pub seller: UserId,
    pub price: f32,
    pub volume: f32,
}
