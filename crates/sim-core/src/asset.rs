//! Asset plug-ins and the read-only view handed to their callbacks.
//!
//! An [`Asset`] declares whether it trades on a book and which asset its
//! prices are denominated in, and receives lifecycle callbacks from the
//! stepping engine. Callbacks are handed two independent borrows: a
//! [`MarketView`] for queries and the [`PortfolioManager`] for mutations.
//! Assets hold no reference back into the engine, and callbacks must not
//! submit orders; submissions happen only from outside the step pipeline.

use indexmap::IndexMap;

use crate::error::{IdKind, SimError, SimResult};
use crate::order::{AssetId, LimitOrder, Step, UserId};
use crate::portfolio::PortfolioManager;

/// Registration-ordered ticker directory.
///
/// Asset ids are dense and assigned in registration order, so an asset's
/// id doubles as its index in the map.
#[derive(Debug, Default)]
pub struct AssetDirectory {
    by_ticker: IndexMap<String, AssetMeta>,
}

#[derive(Debug, Clone, Copy)]
struct AssetMeta {
    tradeable: bool,
    denominated: Option<AssetId>,
}

impl AssetDirectory {
    pub(crate) fn register(
        &mut self,
        ticker: &str,
        tradeable: bool,
        denominated: Option<AssetId>,
    ) -> SimResult<AssetId> {
        if ticker.is_empty() {
            return Err(SimError::InvalidArgument("asset ticker is empty".into()));
        }
        if self.by_ticker.contains_key(ticker) {
            return Err(SimError::InvalidArgument(format!(
                "duplicate asset ticker {ticker:?}"
            )));
        }
        let asset_id = self.by_ticker.len() as AssetId;
        self.by_ticker.insert(
            ticker.to_owned(),
            AssetMeta {
                tradeable,
                denominated,
            },
        );
        Ok(asset_id)
    }

    pub(crate) fn set_denominated(&mut self, asset_id: AssetId, denominated: AssetId) {
        if let Some((_, meta)) = self.by_ticker.get_index_mut(asset_id as usize) {
            meta.denominated = Some(denominated);
        }
    }

    pub fn len(&self) -> usize {
        self.by_ticker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ticker.is_empty()
    }

    pub fn asset_id(&self, ticker: &str) -> SimResult<AssetId> {
        self.by_ticker
            .get_index_of(ticker)
            .map(|index| index as AssetId)
            .ok_or_else(|| SimError::UnknownTicker(ticker.to_owned()))
    }

    pub fn ticker(&self, asset_id: AssetId) -> SimResult<&str> {
        self.by_ticker
            .get_index(asset_id as usize)
            .map(|(ticker, _)| ticker.as_str())
            .ok_or(SimError::UnknownId(IdKind::Asset, asset_id))
    }

    pub fn is_tradeable(&self, asset_id: AssetId) -> SimResult<bool> {
        self.meta(asset_id).map(|meta| meta.tradeable)
    }

    /// The asset a tradeable asset's prices are quoted in; `None` for
    /// non-tradeable assets.
    pub fn denominated(&self, asset_id: AssetId) -> SimResult<Option<AssetId>> {
        self.meta(asset_id).map(|meta| meta.denominated)
    }

    /// Tickers in registration order.
    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.by_ticker.keys().map(String::as_str)
    }

    fn meta(&self, asset_id: AssetId) -> SimResult<AssetMeta> {
        self.by_ticker
            .get_index(asset_id as usize)
            .map(|(_, meta)| *meta)
            .ok_or(SimError::UnknownId(IdKind::Asset, asset_id))
    }
}

/// Read-only engine state handed to asset callbacks.
///
/// Top-of-book values are sampled at the most recent observation boundary:
/// the start of the current lifecycle phase, or the start of the order
/// currently being matched. All mutation goes through the portfolio
/// manager passed alongside this view.
pub struct MarketView<'a> {
    step: Step,
    step_count: u32,
    horizon: f32,
    user_count: u32,
    directory: &'a AssetDirectory,
    tops: Vec<(Option<LimitOrder>, Option<LimitOrder>)>,
}

impl<'a> MarketView<'a> {
    pub(crate) fn new(
        step: Step,
        step_count: u32,
        horizon: f32,
        user_count: u32,
        directory: &'a AssetDirectory,
        tops: Vec<(Option<LimitOrder>, Option<LimitOrder>)>,
    ) -> Self {
        MarketView {
            step,
            step_count,
            horizon,
            user_count,
            directory,
            tops,
        }
    }

    /// The step currently being processed.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Total number of steps `N`.
    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    /// Simulated horizon `T`.
    pub fn horizon(&self) -> f32 {
        self.horizon
    }

    /// Step width `T / N`.
    pub fn dt(&self) -> f32 {
        self.horizon / self.step_count as f32
    }

    /// Simulated time `step * dt`.
    pub fn t(&self) -> f32 {
        self.step as f32 * self.dt()
    }

    pub fn user_count(&self) -> u32 {
        self.user_count
    }

    pub fn asset_count(&self) -> usize {
        self.directory.len()
    }

    pub fn asset_id(&self, ticker: &str) -> SimResult<AssetId> {
        self.directory.asset_id(ticker)
    }

    pub fn ticker(&self, asset_id: AssetId) -> SimResult<&str> {
        self.directory.ticker(asset_id)
    }

    /// Best bid as of the last observation boundary; `None` when the side
    /// is empty or the id is out of range.
    pub fn top_bid(&self, asset_id: AssetId) -> Option<&LimitOrder> {
        self.tops.get(asset_id as usize)?.0.as_ref()
    }

    /// Best ask as of the last observation boundary.
    pub fn top_ask(&self, asset_id: AssetId) -> Option<&LimitOrder> {
        self.tops.get(asset_id as usize)?.1.as_ref()
    }
}

/// A pluggable asset behavior.
///
/// The lifecycle hooks default to no-ops; tradeable assets typically
/// override at least [`Asset::on_trade_executed`] to exchange holdings
/// against the denominated asset.
pub trait Asset: Send + Sync {
    /// Unique, non-empty ticker.
    fn ticker(&self) -> &str;

    /// Whether orders may be submitted against this asset.
    fn is_tradeable(&self) -> bool;

    /// Ticker of the asset this one's prices are quoted in. Ignored for
    /// non-tradeable assets.
    fn denominated_in(&self) -> &str;

    /// Invoked once, before the first step's order processing.
    fn on_simulation_start(
        &self,
        view: &MarketView<'_>,
        portfolio: &PortfolioManager,
    ) -> SimResult<()> {
        let _ = (view, portfolio);
        Ok(())
    }

    /// Invoked at the start of every step.
    fn before_step(&self, view: &MarketView<'_>, portfolio: &PortfolioManager) -> SimResult<()> {
        let _ = (view, portfolio);
        Ok(())
    }

    /// Invoked immediately after each transaction on this asset's book is
    /// appended.
    fn on_trade_executed(
        &self,
        view: &MarketView<'_>,
        portfolio: &PortfolioManager,
        buyer: UserId,
        seller: UserId,
        price: f32,
        volume: f32,
    ) -> SimResult<()> {
        let _ = (view, portfolio, buyer, seller, price, volume);
        Ok(())
    }

    /// Invoked at the end of every step, after order processing.
    fn after_step(&self, view: &MarketView<'_>, portfolio: &PortfolioManager) -> SimResult<()> {
        let _ = (view, portfolio);
        Ok(())
    }

    /// Invoked once, after the final step.
    fn on_simulation_end(
        &self,
        view: &MarketView<'_>,
        portfolio: &PortfolioManager,
    ) -> SimResult<()> {
        let _ = (view, portfolio);
        Ok(())
    }
}

/// Exchange `volume` of `asset_id` against `price * volume` of the
/// denominated asset, buyer and seller mirrored.
fn settle_trade(
    portfolio: &PortfolioManager,
    asset_id: AssetId,
    denominated_id: AssetId,
    buyer: UserId,
    seller: UserId,
    price: f32,
    volume: f32,
) -> SimResult<()> {
    portfolio.add_two(buyer, asset_id, volume, denominated_id, -price * volume)?;
    portfolio.add_two(seller, asset_id, -volume, denominated_id, price * volume)?;
    Ok(())
}

/// A non-tradeable cash asset. All lifecycle hooks are no-ops.
#[derive(Debug, Clone)]
pub struct Currency {
    ticker: String,
}

impl Currency {
    pub fn new(ticker: impl Into<String>) -> Self {
        Currency {
            ticker: ticker.into(),
        }
    }
}

impl Asset for Currency {
    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn is_tradeable(&self) -> bool {
        false
    }

    fn denominated_in(&self) -> &str {
        &self.ticker
    }
}

/// A coupon-bearing bond.
///
/// Pays `rate * face_value * dt` of the denominated asset per held unit
/// every step, and redeems at face value when the simulation ends.
#[derive(Debug, Clone)]
pub struct Bond {
    ticker: String,
    denominated: String,
    rate: f32,
    face_value: f32,
}

impl Bond {
    pub fn new(
        ticker: impl Into<String>,
        denominated: impl Into<String>,
        rate: f32,
        face_value: f32,
    ) -> Self {
        Bond {
            ticker: ticker.into(),
            denominated: denominated.into(),
            rate,
            face_value,
        }
    }
}

impl Asset for Bond {
    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn is_tradeable(&self) -> bool {
        true
    }

    fn denominated_in(&self) -> &str {
        &self.denominated
    }

    fn on_trade_executed(
        &self,
        view: &MarketView<'_>,
        portfolio: &PortfolioManager,
        buyer: UserId,
        seller: UserId,
        price: f32,
        volume: f32,
    ) -> SimResult<()> {
        let bond_id = view.asset_id(&self.ticker)?;
        let cash_id = view.asset_id(&self.denominated)?;
        settle_trade(portfolio, bond_id, cash_id, buyer, seller, price, volume)
    }

    fn after_step(&self, view: &MarketView<'_>, portfolio: &PortfolioManager) -> SimResult<()> {
        let bond_id = view.asset_id(&self.ticker)?;
        let cash_id = view.asset_id(&self.denominated)?;
        let coupon = self.rate * self.face_value * view.dt();
        for user_id in 0..view.user_count() {
            portfolio.mul_add(user_id, bond_id, cash_id, coupon)?;
        }
        Ok(())
    }

    fn on_simulation_end(
        &self,
        view: &MarketView<'_>,
        portfolio: &PortfolioManager,
    ) -> SimResult<()> {
        let bond_id = view.asset_id(&self.ticker)?;
        let cash_id = view.asset_id(&self.denominated)?;
        for user_id in 0..view.user_count() {
            portfolio.mul_add_and_set(user_id, bond_id, cash_id, self.face_value, 0.0)?;
        }
        Ok(())
    }
}

/// A plain equity.
///
/// Trades settle against the denominated asset; remaining positions are
/// marked to the mid price when the simulation ends, with an empty side
/// defaulting to [`Stock::DEFAULT_SIDE_PRICE`].
#[derive(Debug, Clone)]
pub struct Stock {
    ticker: String,
    denominated: String,
}

impl Stock {
    /// Stand-in price for an empty book side at final mark-to-market.
    pub const DEFAULT_SIDE_PRICE: f32 = 100.0;

    pub fn new(ticker: impl Into<String>, denominated: impl Into<String>) -> Self {
        Stock {
            ticker: ticker.into(),
            denominated: denominated.into(),
        }
    }
}

impl Asset for Stock {
    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn is_tradeable(&self) -> bool {
        true
    }

    fn denominated_in(&self) -> &str {
        &self.denominated
    }

    fn on_trade_executed(
        &self,
        view: &MarketView<'_>,
        portfolio: &PortfolioManager,
        buyer: UserId,
        seller: UserId,
        price: f32,
        volume: f32,
    ) -> SimResult<()> {
        let stock_id = view.asset_id(&self.ticker)?;
        let cash_id = view.asset_id(&self.denominated)?;
        settle_trade(portfolio, stock_id, cash_id, buyer, seller, price, volume)
    }

    fn on_simulation_end(
        &self,
        view: &MarketView<'_>,
        portfolio: &PortfolioManager,
    ) -> SimResult<()> {
        let stock_id = view.asset_id(&self.ticker)?;
        let cash_id = view.asset_id(&self.denominated)?;
        let bid = view
            .top_bid(stock_id)
            .map_or(Self::DEFAULT_SIDE_PRICE, |order| order.price);
        let ask = view
            .top_ask(stock_id)
            .map_or(Self::DEFAULT_SIDE_PRICE, |order| order.price);
        let mark = (bid + ask) / 2.0;
        for user_id in 0..view.user_count() {
            portfolio.mul_add_and_set(user_id, stock_id, cash_id, mark, 0.0)?;
        }
        Ok(())
    }
}
