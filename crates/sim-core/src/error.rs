//! Error types for the simulator.
//!
//! Every kind is surfaced to the caller; none is used for internal control
//! flow. `UnknownId`/`UnknownTicker` and `InvalidArgument` are caller
//! errors and never mutate state. `InvariantViolation` is fatal: the
//! engine latches a halted flag and refuses all further operations.

use thiserror::Error;

use crate::side::Side;

/// Which identifier space an unknown id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    User,
    Asset,
    Order,
    Transaction,
}

impl std::fmt::Display for IdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IdKind::User => "user",
            IdKind::Asset => "asset",
            IdKind::Order => "order",
            IdKind::Transaction => "transaction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// A referenced user, asset, order or transaction id was never issued.
    #[error("unknown {0} id {1}")]
    UnknownId(IdKind, u32),

    /// A referenced ticker is not registered.
    #[error("unknown ticker {0:?}")]
    UnknownTicker(String),

    /// `process_step` was called after the simulation reached its final
    /// step. The caller may reset and continue.
    #[error("simulation has already reached its final step")]
    SimulationEnded,

    /// A top-of-book query hit an empty side.
    #[error("{0:?} side of the book is empty")]
    BookEmpty(Side),

    /// Caller-supplied arguments were rejected; state is unchanged.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal invariant failed. The engine stops accepting work.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type SimResult<T> = Result<T, SimError>;
