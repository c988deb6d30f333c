//! sim-core
//!
//! Discrete-time multi-asset market simulator built around a continuous
//! limit order book matching engine:
//! - per-asset order books with price-time priority
//! - a per-user, per-asset portfolio grid with FIFO lot accounting
//! - pluggable asset behaviors with lifecycle callbacks
//! - a step-driven matching engine emitting immutable per-step results
//!
//! The crate is a library with no I/O of its own; submitter threads and a
//! single stepping thread drive it through [`Simulation`].

pub mod asset;
pub mod error;
pub mod order;
pub mod order_book;
pub mod portfolio;
pub mod side;
pub mod simulation;
pub mod step_result;

pub use asset::{Asset, AssetDirectory, Bond, Currency, MarketView, Stock};
pub use error::{IdKind, SimError, SimResult};
pub use order::{
    AssetId, CancelOrder, LimitOrder, MarketOrder, OrderCommand, OrderId, Step, Transaction,
    TransactionId, UserId,
};
pub use order_book::{BookDepth, FlatBook, OrderBook};
pub use portfolio::{CostAndVwap, PortfolioManager, TransactionStub};
pub use side::Side;
pub use simulation::{Simulation, SimulationState};
pub use step_result::{StepResult, TradingStatistics};
