//! Events carried by a market data pipeline
//!
//! Slots are pre-allocated and reused, so the enum has an `Empty` default
//! that stages skip.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketDataEvent {
    /// Unused slot.
    #[default]
    Empty,
    /// Observed price, in arrival order per instrument.
    Tick {
        timestamp: i64,
        price: f64,
        volume: f64,
    },
    /// Synthetic clock event marking that time reached `timestamp`.
    Boundary { timestamp: i64 },
}

impl MarketDataEvent {
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            MarketDataEvent::Empty => None,
            MarketDataEvent::Tick { timestamp, .. } | MarketDataEvent::Boundary { timestamp } => {
                Some(*timestamp)
            }
        }
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self, MarketDataEvent::Boundary { .. })
    }
}
