//! The step-driven simulation and matching engine.
//!
//! A [`Simulation`] owns the asset plug-ins, one order book and pending
//! submission queue per asset, the portfolio grid and the id counters.
//! Submitter threads append to the pending queues through the `submit_*`
//! methods; a single driver thread calls [`Simulation::process_step`],
//! which drains the queues, resolves crossings under price-time priority,
//! fires the asset lifecycle callbacks and emits a [`StepResult`].
//!
//! Locking policy: the market (books, transaction logs) sits behind one
//! reader-writer lock whose write side is held for the whole step, so
//! observer queries block while a step is in flight and see a consistent
//! market otherwise. Pending queues use short per-asset mutexes held only
//! for an append or the drain swap, so submissions stay cheap and may
//! overlap a running step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info};

use crate::asset::{Asset, AssetDirectory, MarketView};
use crate::error::{IdKind, SimError, SimResult};
use crate::order::{
    AssetId, CancelOrder, LimitOrder, MarketOrder, OrderCommand, OrderId, Step, Transaction,
    UserId,
};
use crate::order_book::{BookDepth, FlatBook, OrderBook};
use crate::portfolio::{CostAndVwap, PortfolioManager};
use crate::side::Side;
use crate::step_result::{StepResult, TradingStatistics};

/// Simulation lifecycle, derived from the step counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationState {
    /// No step has been processed yet.
    Created,
    /// At least one step processed, final step not yet reached.
    Running,
    /// The final step has been processed.
    Ended,
}

struct AssetRuntime {
    behavior: Box<dyn Asset>,
    pending: Mutex<Vec<OrderCommand>>,
}

/// Everything the stepping thread owns exclusively during a step.
struct MarketState {
    books: Vec<OrderBook>,
    transactions: Vec<Vec<Transaction>>,
    last_trade_price: Vec<Option<f32>>,
}

pub struct Simulation {
    step_count: u32,
    horizon: f32,
    directory: AssetDirectory,
    assets: Vec<AssetRuntime>,
    portfolio: PortfolioManager,
    usernames: RwLock<Vec<String>>,
    market: RwLock<MarketState>,
    step_counter: AtomicU32,
    order_id_counter: AtomicU32,
    transaction_id_counter: AtomicU32,
    halted: AtomicBool,
}

impl Simulation {
    /// Build a simulation over `assets`, stepping `step_count` times over
    /// a simulated horizon of `horizon`.
    ///
    /// Asset ids are assigned densely in vector order; that order is also
    /// the processing order within every step. Fails if a ticker is empty
    /// or duplicated, or if a tradeable asset is denominated in an
    /// unregistered ticker or in itself.
    pub fn new(assets: Vec<Box<dyn Asset>>, step_count: u32, horizon: f32) -> SimResult<Self> {
        if step_count == 0 {
            return Err(SimError::InvalidArgument(
                "step count must be at least 1".into(),
            ));
        }
        if !(horizon > 0.0) {
            return Err(SimError::InvalidArgument(
                "horizon must be strictly positive".into(),
            ));
        }

        let mut directory = AssetDirectory::default();
        for asset in &assets {
            directory.register(asset.ticker(), asset.is_tradeable(), None)?;
        }
        for (index, asset) in assets.iter().enumerate() {
            if !asset.is_tradeable() {
                continue;
            }
            let denominated = directory.asset_id(asset.denominated_in()).map_err(|_| {
                SimError::InvalidArgument(format!(
                    "asset {:?} is denominated in unregistered ticker {:?}",
                    asset.ticker(),
                    asset.denominated_in()
                ))
            })?;
            if denominated == index as AssetId {
                return Err(SimError::InvalidArgument(format!(
                    "tradeable asset {:?} cannot be denominated in itself",
                    asset.ticker()
                )));
            }
            directory.set_denominated(index as AssetId, denominated);
        }

        let asset_count = assets.len();
        Ok(Simulation {
            step_count,
            horizon,
            directory,
            assets: assets
                .into_iter()
                .map(|behavior| AssetRuntime {
                    behavior,
                    pending: Mutex::new(Vec::new()),
                })
                .collect(),
            portfolio: PortfolioManager::new(asset_count),
            usernames: RwLock::new(Vec::new()),
            market: RwLock::new(MarketState {
                books: (0..asset_count).map(|_| OrderBook::new()).collect(),
                transactions: vec![Vec::new(); asset_count],
                last_trade_price: vec![None; asset_count],
            }),
            step_counter: AtomicU32::new(0),
            order_id_counter: AtomicU32::new(0),
            transaction_id_counter: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    /// Register a user and return its id. Valid at any time; the new
    /// portfolio row starts zeroed.
    pub fn add_user(&self, username: impl Into<String>) -> SimResult<UserId> {
        self.ensure_live()?;
        let mut usernames = self
            .usernames
            .write()
            .map_err(|_| SimError::InvariantViolation("username lock poisoned".into()))?;
        let user_id = self.portfolio.register_user()?;
        usernames.push(username.into());
        info!(user_id, "user registered");
        Ok(user_id)
    }

    pub fn username(&self, user_id: UserId) -> SimResult<String> {
        let usernames = self.read_usernames()?;
        usernames
            .get(user_id as usize)
            .cloned()
            .ok_or(SimError::UnknownId(IdKind::User, user_id))
    }

    pub fn user_count(&self) -> u32 {
        self.portfolio.user_count()
    }

    pub fn user_exists(&self, user_id: UserId) -> bool {
        user_id < self.user_count()
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    pub fn asset_exists(&self, asset_id: AssetId) -> bool {
        (asset_id as usize) < self.assets.len()
    }

    pub fn order_exists(&self, order_id: OrderId) -> bool {
        order_id < self.order_id_counter.load(Ordering::SeqCst)
    }

    pub fn transaction_exists(&self, transaction_id: u32) -> bool {
        transaction_id < self.transaction_id_counter.load(Ordering::SeqCst)
    }

    /// Number of transactions executed so far, across all assets.
    pub fn transaction_count(&self) -> u32 {
        self.transaction_id_counter.load(Ordering::SeqCst)
    }

    /// Tickers in registration (= id) order.
    pub fn tickers(&self) -> Vec<String> {
        self.directory.tickers().map(str::to_owned).collect()
    }

    pub fn ticker(&self, asset_id: AssetId) -> SimResult<&str> {
        self.directory.ticker(asset_id)
    }

    pub fn asset_id(&self, ticker: &str) -> SimResult<AssetId> {
        self.directory.asset_id(ticker)
    }

    pub fn is_tradeable(&self, asset_id: AssetId) -> SimResult<bool> {
        self.directory.is_tradeable(asset_id)
    }

    /// The asset a tradeable asset's prices are quoted in.
    pub fn denominated_asset(&self, asset_id: AssetId) -> SimResult<Option<AssetId>> {
        self.directory.denominated(asset_id)
    }

    /// Step width `T / N`.
    pub fn dt(&self) -> f32 {
        self.horizon / self.step_count as f32
    }

    /// Simulated time of the current step.
    pub fn t(&self) -> f32 {
        self.current_step() as f32 * self.dt()
    }

    /// Simulated horizon `T`.
    pub fn horizon(&self) -> f32 {
        self.horizon
    }

    /// Total number of steps `N`.
    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn current_step(&self) -> Step {
        self.step_counter.load(Ordering::SeqCst)
    }

    pub fn has_next_step(&self) -> bool {
        self.current_step() < self.step_count
    }

    pub fn state(&self) -> SimulationState {
        let step = self.current_step();
        if step == 0 {
            SimulationState::Created
        } else if step < self.step_count {
            SimulationState::Running
        } else {
            SimulationState::Ended
        }
    }

    /// The portfolio grid. Mutating it directly (e.g. to endow users with
    /// initial holdings) is allowed and bypasses trade accounting.
    pub fn portfolio(&self) -> &PortfolioManager {
        &self.portfolio
    }

    // -------------------------------------------------------------------------
    // Submission API
    // -------------------------------------------------------------------------

    /// Queue a limit order for the next step; returns its order id.
    ///
    /// Safe to call concurrently with other submissions and with a step
    /// in flight: the step drains only what was queued when it swapped
    /// the queue out.
    pub fn submit_limit_order(
        &self,
        user_id: UserId,
        asset_id: AssetId,
        side: Side,
        price: f32,
        volume: f32,
    ) -> SimResult<OrderId> {
        self.ensure_live()?;
        self.ensure_user(user_id)?;
        self.ensure_tradeable(asset_id)?;
        ensure_positive(price, "price")?;
        ensure_positive(volume, "volume")?;

        let order_id = self.next_order_id();
        let order = LimitOrder {
            user_id,
            order_id,
            side,
            price,
            volume,
        };
        self.push_command(asset_id, OrderCommand::Limit(order))?;
        debug!(user_id, asset_id, order_id, ?side, price, volume, "limit order queued");
        Ok(order_id)
    }

    /// Queue a cancel for the next step. The referenced order may already
    /// be filled, cancelled or unknown; the cancel then does nothing.
    pub fn submit_cancel_order(
        &self,
        user_id: UserId,
        asset_id: AssetId,
        order_id_to_cancel: OrderId,
    ) -> SimResult<()> {
        self.ensure_live()?;
        self.ensure_user(user_id)?;
        self.ensure_asset(asset_id)?;

        let cancel = CancelOrder {
            user_id,
            order_id_to_cancel,
        };
        self.push_command(asset_id, OrderCommand::Cancel(cancel))?;
        debug!(user_id, asset_id, order_id_to_cancel, "cancel queued");
        Ok(())
    }

    /// Queue a market order for the next step; returns its order id.
    /// Volume that finds no opposing liquidity is silently discarded.
    pub fn submit_market_order(
        &self,
        user_id: UserId,
        asset_id: AssetId,
        side: Side,
        volume: f32,
    ) -> SimResult<OrderId> {
        self.ensure_live()?;
        self.ensure_user(user_id)?;
        self.ensure_tradeable(asset_id)?;
        ensure_positive(volume, "volume")?;

        let order_id = self.next_order_id();
        let order = MarketOrder {
            user_id,
            order_id,
            side,
            volume,
        };
        self.push_command(asset_id, OrderCommand::Market(order))?;
        debug!(user_id, asset_id, order_id, ?side, volume, "market order queued");
        Ok(order_id)
    }

    /// Insert a resting order directly, bypassing the pending queue.
    ///
    /// Only valid before the first step; used to seed an initial market.
    /// Fails with `InvalidArgument` if the insertion would cross the book.
    pub fn seed_limit_order(
        &self,
        user_id: UserId,
        asset_id: AssetId,
        side: Side,
        price: f32,
        volume: f32,
    ) -> SimResult<OrderId> {
        self.ensure_live()?;
        self.ensure_user(user_id)?;
        self.ensure_tradeable(asset_id)?;
        ensure_positive(price, "price")?;
        ensure_positive(volume, "volume")?;
        if self.current_step() != 0 {
            return Err(SimError::InvalidArgument(
                "book seeding is only allowed before the first step".into(),
            ));
        }

        let mut market = self.market_write()?;
        let book = &mut market.books[asset_id as usize];
        let would_cross = match side {
            Side::Bid => book.top_ask().map_or(false, |ask| price >= ask.price),
            Side::Ask => book.top_bid().map_or(false, |bid| price <= bid.price),
        };
        if would_cross {
            return Err(SimError::InvalidArgument(
                "seeded order would cross the book".into(),
            ));
        }

        let order_id = self.next_order_id();
        let order = LimitOrder {
            user_id,
            order_id,
            side,
            price,
            volume,
        };
        if !book.insert(order) {
            return Err(self.halt("duplicate order id on seed insertion"));
        }
        debug!(user_id, asset_id, order_id, ?side, price, volume, "order seeded");
        Ok(order_id)
    }

    // -------------------------------------------------------------------------
    // Observer queries
    //
    // These take the market read lock: they block while a step is in
    // flight and otherwise see a consistent post-step market.
    // -------------------------------------------------------------------------

    pub fn top_bid(&self, asset_id: AssetId) -> SimResult<LimitOrder> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        market.books[asset_id as usize].top_bid().copied()
    }

    pub fn top_ask(&self, asset_id: AssetId) -> SimResult<LimitOrder> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        market.books[asset_id as usize].top_ask().copied()
    }

    pub fn bid_count(&self, asset_id: AssetId) -> SimResult<usize> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        Ok(market.books[asset_id as usize].bid_count())
    }

    pub fn ask_count(&self, asset_id: AssetId) -> SimResult<usize> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        Ok(market.books[asset_id as usize].ask_count())
    }

    /// Both sides of an asset's book, flattened in priority order.
    pub fn order_book(&self, asset_id: AssetId) -> SimResult<FlatBook> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        Ok(market.books[asset_id as usize].flatten())
    }

    /// Cumulative book depth per side.
    pub fn book_depth(&self, asset_id: AssetId) -> SimResult<BookDepth> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        Ok(market.books[asset_id as usize].book_depth())
    }

    pub fn has_order(&self, asset_id: AssetId, order_id: OrderId) -> SimResult<bool> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        Ok(market.books[asset_id as usize].has_order(order_id))
    }

    /// Ids of a user's resting orders on one asset, both sides.
    pub fn open_user_orders(
        &self,
        user_id: UserId,
        asset_id: AssetId,
    ) -> SimResult<BTreeSet<OrderId>> {
        self.ensure_user(user_id)?;
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        Ok(market.books[asset_id as usize].orders_of_user(user_id))
    }

    /// The append-only transaction log of one asset.
    pub fn transactions(&self, asset_id: AssetId) -> SimResult<Vec<Transaction>> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        Ok(market.transactions[asset_id as usize].clone())
    }

    pub fn last_trade_price(&self, asset_id: AssetId) -> SimResult<Option<f32>> {
        self.ensure_asset(asset_id)?;
        let market = self.market_read()?;
        Ok(market.last_trade_price[asset_id as usize])
    }

    pub fn user_portfolio(&self, user_id: UserId) -> SimResult<Vec<f32>> {
        self.portfolio.user_portfolio(user_id)
    }

    // -------------------------------------------------------------------------
    // Stepping
    // -------------------------------------------------------------------------

    /// Process one step: drain the pending queues, match, fire callbacks,
    /// and return the per-step deltas and views.
    ///
    /// Fails with `SimulationEnded` once the final step has been reached;
    /// `reset_simulation` rewinds to a fresh run.
    pub fn process_step(&self) -> SimResult<StepResult> {
        self.ensure_live()?;
        let mut market = self.market_write()?;

        let step = self.current_step();
        if step >= self.step_count {
            return Err(SimError::SimulationEnded);
        }
        debug!(step, "processing step");

        // First-step and per-step lifecycle callbacks, registration order.
        if step == 0 {
            let view = self.view_of(step, &market);
            for asset in &self.assets {
                asset.behavior.on_simulation_start(&view, &self.portfolio)?;
            }
        }
        {
            let view = self.view_of(step, &market);
            for asset in &self.assets {
                asset.behavior.before_step(&view, &self.portfolio)?;
            }
        }

        // Atomic drain: swap each pending queue for an empty one.
        let mut drained: Vec<Vec<OrderCommand>> = Vec::with_capacity(self.assets.len());
        for asset in &self.assets {
            let mut queue = self.lock_pending(&asset.pending)?;
            drained.push(std::mem::take(&mut *queue));
        }

        let asset_count = self.assets.len();
        let mut submitted: Vec<Vec<OrderId>> = vec![Vec::new(); asset_count];
        let mut transacted: Vec<BTreeMap<OrderId, f32>> = vec![BTreeMap::new(); asset_count];
        let mut cancelled: Vec<Vec<OrderId>> = vec![Vec::new(); asset_count];
        let mut step_transactions: Vec<Vec<Transaction>> = vec![Vec::new(); asset_count];

        for (asset_index, commands) in drained.into_iter().enumerate() {
            for command in commands {
                // Observation boundary: callbacks fired while this
                // command executes see the market as of here.
                let view = self.view_of(step, &market);
                let market_state = &mut *market;
                let book = &mut market_state.books[asset_index];
                match command {
                    OrderCommand::Limit(order) => {
                        if book.is_crossed() {
                            return Err(self.halt("book crossed before inserting a limit order"));
                        }
                        if !book.insert(order) {
                            return Err(self.halt("duplicate order id on insertion"));
                        }
                        submitted[asset_index].push(order.order_id);

                        // Resolve the crossing this order may have caused.
                        loop {
                            let (bid, ask) = match (book.top_bid(), book.top_ask()) {
                                (Ok(bid), Ok(ask)) => (*bid, *ask),
                                _ => break,
                            };
                            if bid.price < ask.price {
                                break;
                            }
                            // The crossing is due to the inserted order, so
                            // the execution price is the resting side's.
                            let price = if order.side == Side::Bid {
                                ask.price
                            } else {
                                bid.price
                            };
                            let volume = bid.volume.min(ask.volume);
                            self.fill_top(book, Side::Bid, volume)?;
                            self.fill_top(book, Side::Ask, volume)?;
                            *transacted[asset_index].entry(bid.order_id).or_insert(0.0) += volume;
                            *transacted[asset_index].entry(ask.order_id).or_insert(0.0) += volume;
                            self.execute_trade(
                                step,
                                asset_index as AssetId,
                                &view,
                                bid.user_id,
                                ask.user_id,
                                price,
                                volume,
                                &mut market_state.transactions[asset_index],
                                &mut market_state.last_trade_price[asset_index],
                                &mut step_transactions[asset_index],
                            )?;
                        }
                        if book.is_crossed() {
                            return Err(self.halt("book crossed after matching a limit order"));
                        }
                    }
                    OrderCommand::Cancel(cancel) => {
                        if book.cancel(cancel.order_id_to_cancel) {
                            cancelled[asset_index].push(cancel.order_id_to_cancel);
                            debug!(
                                asset_index,
                                order_id = cancel.order_id_to_cancel,
                                "order cancelled"
                            );
                        }
                    }
                    OrderCommand::Market(mut order) => {
                        while order.volume > 0.0 {
                            let top = match order.side {
                                Side::Bid => match book.top_ask() {
                                    Ok(top) => *top,
                                    Err(_) => break,
                                },
                                Side::Ask => match book.top_bid() {
                                    Ok(top) => *top,
                                    Err(_) => break,
                                },
                            };
                            let price = top.price;
                            let volume = order.volume.min(top.volume);
                            self.fill_top(book, top.side, volume)?;
                            order.volume -= volume;
                            *transacted[asset_index].entry(top.order_id).or_insert(0.0) += volume;
                            let (buyer, seller) = match order.side {
                                Side::Bid => (order.user_id, top.user_id),
                                Side::Ask => (top.user_id, order.user_id),
                            };
                            self.execute_trade(
                                step,
                                asset_index as AssetId,
                                &view,
                                buyer,
                                seller,
                                price,
                                volume,
                                &mut market_state.transactions[asset_index],
                                &mut market_state.last_trade_price[asset_index],
                                &mut step_transactions[asset_index],
                            )?;
                        }
                        // Any unfilled remainder is discarded, not an error.
                    }
                }
            }
        }

        {
            let view = self.view_of(step, &market);
            for asset in &self.assets {
                asset.behavior.after_step(&view, &self.portfolio)?;
            }
        }

        let current_step = step + 1;
        self.step_counter.store(current_step, Ordering::SeqCst);

        if current_step == self.step_count {
            let view = self.view_of(current_step, &market);
            for asset in &self.assets {
                asset.behavior.on_simulation_end(&view, &self.portfolio)?;
            }
            info!(step = current_step, "simulation ended");
        }

        let mut order_book_per_asset = BTreeMap::new();
        let mut book_depth_per_asset = BTreeMap::new();
        for (index, book) in market.books.iter().enumerate() {
            order_book_per_asset.insert(index as AssetId, book.flatten());
            book_depth_per_asset.insert(index as AssetId, book.book_depth());
        }

        let portfolios = self.portfolio.snapshot_table()?;
        let marks: Vec<f32> = (0..asset_count)
            .map(|index| mark_price(&market, index))
            .collect();
        let statistics_per_user_per_asset = self.build_statistics(&marks, &portfolios)?;

        let user_id_to_username = self
            .read_usernames()?
            .iter()
            .enumerate()
            .map(|(user_id, name)| (user_id as UserId, name.clone()))
            .collect();
        let asset_id_to_ticker = self
            .directory
            .tickers()
            .enumerate()
            .map(|(asset_id, ticker)| (asset_id as AssetId, ticker.to_owned()))
            .collect();

        Ok(StepResult {
            current_step,
            has_next_step: current_step < self.step_count,
            user_id_to_username,
            asset_id_to_ticker,
            submitted_limit_orders: into_asset_map(submitted),
            transacted_orders: into_asset_map(transacted),
            cancelled_orders: into_asset_map(cancelled),
            transactions: into_asset_map(step_transactions),
            order_book_per_asset,
            book_depth_per_asset,
            portfolios,
            statistics_per_user_per_asset,
        })
    }

    /// Rewind to a fresh run: clear the books, pending queues, transaction
    /// logs and lot queues, zero the portfolios, and reset the step, order
    /// and transaction counters. Users and registered assets survive, so
    /// replaying the same submission sequence reproduces the same step
    /// results.
    pub fn reset_simulation(&self) -> SimResult<()> {
        self.ensure_live()?;
        let mut market = self.market_write()?;
        for book in &mut market.books {
            book.clear();
        }
        for log in &mut market.transactions {
            log.clear();
        }
        for last in &mut market.last_trade_price {
            *last = None;
        }
        for asset in &self.assets {
            self.lock_pending(&asset.pending)?.clear();
        }
        self.portfolio.reset_all()?;
        self.step_counter.store(0, Ordering::SeqCst);
        self.order_id_counter.store(0, Ordering::SeqCst);
        self.transaction_id_counter.store(0, Ordering::SeqCst);
        info!("simulation reset");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn view_of<'a>(&'a self, step: Step, market: &MarketState) -> MarketView<'a> {
        let tops = market
            .books
            .iter()
            .map(|book| (book.top_bid().ok().copied(), book.top_ask().ok().copied()))
            .collect();
        MarketView::new(
            step,
            self.step_count,
            self.horizon,
            self.portfolio.user_count(),
            &self.directory,
            tops,
        )
    }

    /// Reduce the top of one side by `volume`, popping it when exhausted.
    fn fill_top(&self, book: &mut OrderBook, side: Side, volume: f32) -> SimResult<()> {
        let mut top = match side {
            Side::Bid => book.pop_top_bid()?,
            Side::Ask => book.pop_top_ask()?,
        };
        top.volume -= volume;
        if top.volume > 0.0 && !book.insert(top) {
            return Err(self.halt("duplicate order id on reinsertion"));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_trade(
        &self,
        step: Step,
        asset_id: AssetId,
        view: &MarketView<'_>,
        buyer: UserId,
        seller: UserId,
        price: f32,
        volume: f32,
        log: &mut Vec<Transaction>,
        last_trade: &mut Option<f32>,
        step_log: &mut Vec<Transaction>,
    ) -> SimResult<()> {
        let id = self.transaction_id_counter.fetch_add(1, Ordering::SeqCst);
        let transaction = Transaction {
            id,
            step,
            asset_id,
            buyer,
            seller,
            price,
            volume,
        };
        log.push(transaction);
        step_log.push(transaction);
        *last_trade = Some(price);

        self.portfolio
            .record_trade(buyer, asset_id, Side::Bid, price, volume)?;
        self.portfolio
            .record_trade(seller, asset_id, Side::Ask, price, volume)?;
        self.assets[asset_id as usize].behavior.on_trade_executed(
            view,
            &self.portfolio,
            buyer,
            seller,
            price,
            volume,
        )?;
        debug!(asset_id, buyer, seller, price, volume, "trade executed");
        Ok(())
    }

    fn build_statistics(
        &self,
        marks: &[f32],
        portfolios: &[Vec<f32>],
    ) -> SimResult<BTreeMap<AssetId, BTreeMap<UserId, TradingStatistics>>> {
        let user_count = portfolios.len();

        // Value of every tradeable position at its mark, per user.
        let mut liquidation = vec![0.0f32; user_count];
        for (index, mark) in marks.iter().enumerate() {
            if !self.directory.is_tradeable(index as AssetId)? {
                continue;
            }
            for (user, row) in portfolios.iter().enumerate() {
                liquidation[user] += row[index] * mark;
            }
        }

        let mut statistics = BTreeMap::new();
        for (index, mark) in marks.iter().enumerate() {
            let asset_id = index as AssetId;
            if !self.directory.is_tradeable(asset_id)? {
                continue;
            }
            let denominated = self.directory.denominated(asset_id)?.ok_or_else(|| {
                SimError::InvariantViolation("tradeable asset without denominated asset".into())
            })?;

            let mut per_user = BTreeMap::new();
            for (user, row) in portfolios.iter().enumerate() {
                let user_id = user as UserId;
                let position = row[index];
                let CostAndVwap { cost, vwap } = self.portfolio.cost_and_vwap(user_id, asset_id)?;
                let realized = self.portfolio.realized(user_id, asset_id)?;
                per_user.insert(
                    user_id,
                    TradingStatistics {
                        position,
                        cost,
                        vwap,
                        realized,
                        unrealized: position * mark - cost,
                        net_liquidation_value: row[denominated as usize] + liquidation[user],
                    },
                );
            }
            statistics.insert(asset_id, per_user);
        }
        Ok(statistics)
    }

    fn next_order_id(&self) -> OrderId {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn push_command(&self, asset_id: AssetId, command: OrderCommand) -> SimResult<()> {
        let asset = &self.assets[asset_id as usize];
        self.lock_pending(&asset.pending)?.push(command);
        Ok(())
    }

    fn ensure_live(&self) -> SimResult<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(SimError::InvariantViolation(
                "engine halted by an earlier invariant violation".into(),
            ));
        }
        Ok(())
    }

    /// Latch the halted flag; every later public call fails.
    fn halt(&self, reason: &str) -> SimError {
        self.halted.store(true, Ordering::SeqCst);
        error!(reason, "engine halted");
        SimError::InvariantViolation(reason.into())
    }

    fn ensure_user(&self, user_id: UserId) -> SimResult<()> {
        if self.user_exists(user_id) {
            Ok(())
        } else {
            Err(SimError::UnknownId(IdKind::User, user_id))
        }
    }

    fn ensure_asset(&self, asset_id: AssetId) -> SimResult<()> {
        if self.asset_exists(asset_id) {
            Ok(())
        } else {
            Err(SimError::UnknownId(IdKind::Asset, asset_id))
        }
    }

    fn ensure_tradeable(&self, asset_id: AssetId) -> SimResult<()> {
        self.ensure_asset(asset_id)?;
        if self.directory.is_tradeable(asset_id)? {
            Ok(())
        } else {
            Err(SimError::InvalidArgument(format!(
                "asset {asset_id} is not tradeable"
            )))
        }
    }

    fn market_read(&self) -> SimResult<RwLockReadGuard<'_, MarketState>> {
        self.market
            .read()
            .map_err(|_| SimError::InvariantViolation("market lock poisoned".into()))
    }

    fn market_write(&self) -> SimResult<RwLockWriteGuard<'_, MarketState>> {
        self.market
            .write()
            .map_err(|_| SimError::InvariantViolation("market lock poisoned".into()))
    }

    fn lock_pending<'a>(
        &self,
        pending: &'a Mutex<Vec<OrderCommand>>,
    ) -> SimResult<MutexGuard<'a, Vec<OrderCommand>>> {
        pending
            .lock()
            .map_err(|_| SimError::InvariantViolation("pending queue lock poisoned".into()))
    }

    fn read_usernames(&self) -> SimResult<RwLockReadGuard<'_, Vec<String>>> {
        self.usernames
            .read()
            .map_err(|_| SimError::InvariantViolation("username lock poisoned".into()))
    }
}

/// The price open positions are valued at: mid when both sides exist,
/// else the single populated side, else the last trade, else 0.
fn mark_price(market: &MarketState, index: usize) -> f32 {
    let book = &market.books[index];
    match (book.top_bid().ok(), book.top_ask().ok()) {
        (Some(bid), Some(ask)) => (bid.price + ask.price) / 2.0,
        (Some(bid), None) => bid.price,
        (None, Some(ask)) => ask.price,
        (None, None) => market.last_trade_price[index].unwrap_or(0.0),
    }
}

fn ensure_positive(value: f32, name: &str) -> SimResult<()> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(SimError::InvalidArgument(format!(
            "{name} must be strictly positive, got {value}"
        )))
    }
}

fn into_asset_map<T>(values: Vec<T>) -> BTreeMap<AssetId, T> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| (index as AssetId, value))
        .collect()
}
