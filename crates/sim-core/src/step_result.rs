//! Immutable per-step output.
//!
//! A [`StepResult`] aggregates everything that happened during one call
//! to [`Simulation::process_step`](crate::simulation::Simulation::process_step):
//! the deltas (submissions, fills, cancels, transactions), post-step views
//! of every book, the full portfolio grid and per-user trading statistics.
//! All maps are keyed by asset id; the id-to-ticker and id-to-username
//! directories are included so thin adapters can re-key by name without
//! reaching back into the engine.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::order::{AssetId, OrderId, Step, Transaction, UserId};
use crate::order_book::{BookDepth, FlatBook};

/// Per-user trading statistics for a single tradeable asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TradingStatistics {
    /// Current holdings of the asset.
    pub position: f32,
    /// Sum of `price * volume` over the open FIFO lots.
    pub cost: f32,
    /// Volume-weighted average price of the open lots; 0 when none.
    pub vwap: f32,
    /// P&L accumulated from closed FIFO lot pairs.
    pub realized: f32,
    /// `position * mark_price - cost`.
    pub unrealized: f32,
    /// Denominated holdings plus every tradeable position valued at its
    /// mark price.
    pub net_liquidation_value: f32,
}

/// Everything produced by one simulation step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// The step counter after this step; the deltas below describe step
    /// `current_step - 1`.
    pub current_step: Step,
    pub has_next_step: bool,

    pub user_id_to_username: BTreeMap<UserId, String>,
    pub asset_id_to_ticker: BTreeMap<AssetId, String>,

    /// Limit orders newly inserted this step (market orders excluded).
    pub submitted_limit_orders: BTreeMap<AssetId, Vec<OrderId>>,
    /// Resting order id to cumulative volume transacted this step.
    pub transacted_orders: BTreeMap<AssetId, BTreeMap<OrderId, f32>>,
    /// Orders successfully cancelled this step.
    pub cancelled_orders: BTreeMap<AssetId, Vec<OrderId>>,
    /// Transactions in execution order.
    pub transactions: BTreeMap<AssetId, Vec<Transaction>>,

    pub order_book_per_asset: BTreeMap<AssetId, FlatBook>,
    pub book_depth_per_asset: BTreeMap<AssetId, BookDepth>,

    /// The full holdings grid, row per user, column per asset.
    pub portfolios: Vec<Vec<f32>>,
    /// Statistics for every (tradeable asset, user) pair.
    pub statistics_per_user_per_asset: BTreeMap<AssetId, BTreeMap<UserId, TradingStatistics>>,
}
