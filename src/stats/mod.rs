//! Statistical analysis module.
//!
//! Two testers run independently on the same cleaned gene x sample matrix:
//! a two-group moderated linear model (Control vs Disease) and an ordinal
//! trend test across the seven Braak stages. Each tester owns its own
//! multiple-testing family and its own significance threshold.

pub mod correction;
pub mod differential;
pub mod trend;

pub use differential::{DifferentialResult, DifferentialTester, MomentShrinker, VarianceShrinker};
pub use trend::{TrendResult, TrendTester};

use serde::{Deserialize, Serialize};

/// Adjusted-p threshold for the two-group test.
pub const DIFFERENTIAL_ALPHA: f64 = 0.05;

/// Adjusted-p threshold for the ordinal trend test. Deliberately stricter
/// than the two-group threshold; the asymmetry is inherited from the study
/// design and must not be unified without product-owner sign-off.
pub const TREND_ALPHA: f64 = 0.01;

/// Regulation direction assigned by a tester's own classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    None,
}

impl Direction {
    /// Direction from the sign of a signed effect estimate.
    pub fn from_sign(effect: f64) -> Direction {
        if effect > 0.0 {
            Direction::Up
        } else if effect < 0.0 {
            Direction::Down
        } else {
            Direction::None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Up => "Up-Regulated",
            Direction::Down => "Down-Regulated",
            Direction::None => "None",
        }
    }
}
