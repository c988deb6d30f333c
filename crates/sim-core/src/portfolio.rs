//! Per-user, per-asset holdings with FIFO lot accounting.
//!
//! The grid is a row per user and a column per asset. A reader-writer
//! lock guards the outer structure (growing it on user registration is
//! the only exclusive operation); a per-user mutex guards each row, so
//! compound updates are atomic per user and disjoint users proceed in
//! parallel.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IdKind, SimError, SimResult};
use crate::order::{AssetId, UserId};
use crate::side::Side;

/// One fragment of a past trade, retained for cost-basis accounting.
///
/// Queues of stubs are kept FIFO per (user, asset); stubs on the same side
/// concatenate, stubs on the opposite side cancel against the queue head.
/// As a consequence a queue only ever holds stubs of a single side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransactionStub {
    pub side: Side,
    pub price: f32,
    pub volume: f32,
}

/// Open-lot cost and volume-weighted average price for one (user, asset).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostAndVwap {
    /// Sum of `price * volume` over the open lots.
    pub cost: f32,
    /// `cost / total volume`; 0 when no lots are open.
    pub vwap: f32,
}

#[derive(Debug)]
struct UserRow {
    holdings: Vec<f32>,
    lots: Vec<VecDeque<TransactionStub>>,
    realized: Vec<f32>,
}

impl UserRow {
    fn new(columns: usize) -> Self {
        UserRow {
            holdings: vec![0.0; columns],
            lots: vec![VecDeque::new(); columns],
            realized: vec![0.0; columns],
        }
    }

    fn reset(&mut self) {
        self.holdings.fill(0.0);
        self.realized.fill(0.0);
        for queue in &mut self.lots {
            queue.clear();
        }
    }
}

/// The (user x asset) float grid plus lot queues.
#[derive(Debug)]
pub struct PortfolioManager {
    columns: usize,
    rows: RwLock<Vec<Mutex<UserRow>>>,
}

impl PortfolioManager {
    /// A manager with `columns` asset columns and no users.
    pub fn new(columns: usize) -> Self {
        PortfolioManager {
            columns,
            rows: RwLock::new(Vec::new()),
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns
    }

    pub fn user_count(&self) -> u32 {
        match self.rows.read() {
            Ok(rows) => rows.len() as u32,
            Err(poisoned) => poisoned.into_inner().len() as u32,
        }
    }

    /// Grow the grid by one zeroed row and return its user id.
    pub fn register_user(&self) -> SimResult<UserId> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| SimError::InvariantViolation("portfolio lock poisoned".into()))?;
        let user_id = rows.len() as UserId;
        rows.push(Mutex::new(UserRow::new(self.columns)));
        debug!(user_id, "portfolio row registered");
        Ok(user_id)
    }

    /// `holdings[user][asset] += delta`; returns the updated value.
    pub fn add(&self, user_id: UserId, asset_id: AssetId, delta: f32) -> SimResult<f32> {
        let rows = self.read_rows()?;
        let mut row = self.lock_row(&rows, user_id)?;
        let asset = self.check_asset(asset_id)?;
        row.holdings[asset] += delta;
        Ok(row.holdings[asset])
    }

    /// Adjust two distinct assets of the same user atomically; returns
    /// both updated values.
    pub fn add_two(
        &self,
        user_id: UserId,
        asset_id_1: AssetId,
        delta_1: f32,
        asset_id_2: AssetId,
        delta_2: f32,
    ) -> SimResult<(f32, f32)> {
        if asset_id_1 == asset_id_2 {
            return Err(SimError::InvalidArgument(
                "the same asset was referenced twice in a two-asset update".into(),
            ));
        }
        let rows = self.read_rows()?;
        let mut row = self.lock_row(&rows, user_id)?;
        let a = self.check_asset(asset_id_1)?;
        let b = self.check_asset(asset_id_2)?;
        row.holdings[a] += delta_1;
        row.holdings[b] += delta_2;
        Ok((row.holdings[a], row.holdings[b]))
    }

    /// `holdings[dst] += holdings[src] * factor`; returns the updated
    /// destination value.
    pub fn mul_add(
        &self,
        user_id: UserId,
        src_asset_id: AssetId,
        dst_asset_id: AssetId,
        factor: f32,
    ) -> SimResult<f32> {
        if src_asset_id == dst_asset_id {
            return Err(SimError::InvalidArgument(
                "the same asset was referenced twice in a two-asset update".into(),
            ));
        }
        let rows = self.read_rows()?;
        let mut row = self.lock_row(&rows, user_id)?;
        let src = self.check_asset(src_asset_id)?;
        let dst = self.check_asset(dst_asset_id)?;
        row.holdings[dst] += row.holdings[src] * factor;
        Ok(row.holdings[dst])
    }

    /// `holdings[dst] += holdings[src] * factor; holdings[src] = value`,
    /// atomically; returns the updated destination value. Used e.g. to
    /// liquidate one asset into another.
    pub fn mul_add_and_set(
        &self,
        user_id: UserId,
        src_asset_id: AssetId,
        dst_asset_id: AssetId,
        factor: f32,
        value: f32,
    ) -> SimResult<f32> {
        if src_asset_id == dst_asset_id {
            return Err(SimError::InvalidArgument(
                "the same asset was referenced twice in a two-asset update".into(),
            ));
        }
        let rows = self.read_rows()?;
        let mut row = self.lock_row(&rows, user_id)?;
        let src = self.check_asset(src_asset_id)?;
        let dst = self.check_asset(dst_asset_id)?;
        row.holdings[dst] += row.holdings[src] * factor;
        row.holdings[src] = value;
        Ok(row.holdings[dst])
    }

    /// Zero one user's holdings, lots and realized P&L.
    pub fn reset_user(&self, user_id: UserId) -> SimResult<()> {
        let rows = self.read_rows()?;
        let mut row = self.lock_row(&rows, user_id)?;
        row.reset();
        Ok(())
    }

    /// Zero every row. Registrations are preserved.
    pub fn reset_all(&self) -> SimResult<()> {
        let rows = self.read_rows()?;
        for row in rows.iter() {
            self.lock(row)?.reset();
        }
        Ok(())
    }

    pub fn holdings(&self, user_id: UserId, asset_id: AssetId) -> SimResult<f32> {
        let rows = self.read_rows()?;
        let row = self.lock_row(&rows, user_id)?;
        let asset = self.check_asset(asset_id)?;
        Ok(row.holdings[asset])
    }

    /// Copy of one user's full holdings row.
    pub fn user_portfolio(&self, user_id: UserId) -> SimResult<Vec<f32>> {
        let rows = self.read_rows()?;
        let row = self.lock_row(&rows, user_id)?;
        Ok(row.holdings.clone())
    }

    /// Consistent copy of the whole grid, row per user.
    ///
    /// Holds the outer shared lock and visits each row lock in order, so
    /// every row is internally consistent; rows are not mutually frozen.
    pub fn snapshot_table(&self) -> SimResult<Vec<Vec<f32>>> {
        let rows = self.read_rows()?;
        let mut table = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            table.push(self.lock(row)?.holdings.clone());
        }
        Ok(table)
    }

    /// Record one side of an executed trade in the FIFO lot queue.
    ///
    /// A stub matching the queue side is appended; an opposite-side stub
    /// cancels against the head until either it or the queue is
    /// exhausted, accruing realized P&L on each matched fragment.
    pub fn record_trade(
        &self,
        user_id: UserId,
        asset_id: AssetId,
        side: Side,
        price: f32,
        mut volume: f32,
    ) -> SimResult<()> {
        let rows = self.read_rows()?;
        let mut row = self.lock_row(&rows, user_id)?;
        let asset = self.check_asset(asset_id)?;
        let row = &mut *row;
        let queue = &mut row.lots[asset];

        loop {
            match queue.front_mut() {
                None => {
                    queue.push_back(TransactionStub { side, price, volume });
                    break;
                }
                Some(front) if front.side == side => {
                    queue.push_back(TransactionStub { side, price, volume });
                    break;
                }
                Some(front) => {
                    let matched = front.volume.min(volume);
                    let (buy_price, sell_price) = match side {
                        Side::Bid => (price, front.price),
                        Side::Ask => (front.price, price),
                    };
                    row.realized[asset] += (sell_price - buy_price) * matched;
                    front.volume -= matched;
                    volume -= matched;
                    if front.volume == 0.0 {
                        queue.pop_front();
                        if volume == 0.0 {
                            break;
                        }
                    } else {
                        // The incoming volume is exhausted.
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Open-lot cost and VWAP for one (user, asset); zeros when no lots
    /// are open.
    pub fn cost_and_vwap(&self, user_id: UserId, asset_id: AssetId) -> SimResult<CostAndVwap> {
        let rows = self.read_rows()?;
        let row = self.lock_row(&rows, user_id)?;
        let asset = self.check_asset(asset_id)?;

        let mut cumulative_volume = 0.0f64;
        let mut cumulative_price_volume = 0.0f64;
        for stub in &row.lots[asset] {
            cumulative_volume += stub.volume as f64;
            cumulative_price_volume += (stub.price as f64) * (stub.volume as f64);
        }
        if cumulative_volume == 0.0 {
            return Ok(CostAndVwap { cost: 0.0, vwap: 0.0 });
        }
        Ok(CostAndVwap {
            cost: cumulative_price_volume as f32,
            vwap: (cumulative_price_volume / cumulative_volume) as f32,
        })
    }

    /// Realized P&L accumulated from closed lot pairs.
    pub fn realized(&self, user_id: UserId, asset_id: AssetId) -> SimResult<f32> {
        let rows = self.read_rows()?;
        let row = self.lock_row(&rows, user_id)?;
        let asset = self.check_asset(asset_id)?;
        Ok(row.realized[asset])
    }

    /// Copy of the open lot queue, head first. Mostly for inspection and
    /// tests.
    pub fn open_lots(&self, user_id: UserId, asset_id: AssetId) -> SimResult<Vec<TransactionStub>> {
        let rows = self.read_rows()?;
        let row = self.lock_row(&rows, user_id)?;
        let asset = self.check_asset(asset_id)?;
        Ok(row.lots[asset].iter().copied().collect())
    }

    fn read_rows(&self) -> SimResult<RwLockReadGuard<'_, Vec<Mutex<UserRow>>>> {
        self.rows
            .read()
            .map_err(|_| SimError::InvariantViolation("portfolio lock poisoned".into()))
    }

    fn lock_row<'a>(
        &self,
        rows: &'a RwLockReadGuard<'_, Vec<Mutex<UserRow>>>,
        user_id: UserId,
    ) -> SimResult<MutexGuard<'a, UserRow>> {
        let row = rows
            .get(user_id as usize)
            .ok_or(SimError::UnknownId(IdKind::User, user_id))?;
        self.lock(row)
    }

    fn lock<'a>(&self, row: &'a Mutex<UserRow>) -> SimResult<MutexGuard<'a, UserRow>> {
        row.lock()
            .map_err(|_| SimError::InvariantViolation("portfolio row lock poisoned".into()))
    }

    fn check_asset(&self, asset_id: AssetId) -> SimResult<usize> {
        if (asset_id as usize) < self.columns {
            Ok(asset_id as usize)
        } else {
            Err(SimError::UnknownId(IdKind::Asset, asset_id))
        }
    }
}
