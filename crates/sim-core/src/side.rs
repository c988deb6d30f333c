//! Order side (bid / ask).

use serde::{Deserialize, Serialize};

/// Which side of the book an order rests on or takes from.
///
/// `Bid` is the buying side, `Ask` the selling side. The [`Side::BUY`] and
/// [`Side::SELL`] aliases are provided for callers that think in actions
/// rather than in book sides; the two namings are interchangeable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Alias for [`Side::Bid`].
    pub const BUY: Side = Side::Bid;

    /// Alias for [`Side::Ask`].
    pub const SELL: Side = Side::Ask;

    /// The other side of the book.
    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}
