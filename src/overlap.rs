//! Cross-method reconciliation of significant gene sets.
//!
//! The two testers answer related but distinct questions, so their
//! significant sets are compared per direction rather than merged. Overlap
//! is reported against the smaller of the two sets, not the union: a small
//! set fully contained in a large one reads as 100%, which is the intended
//! interpretation and differs from a Jaccard-style ratio.

use crate::stats::{DifferentialResult, Direction, TrendResult};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Overlap figures for one regulation direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlapSummary {
    pub direction: Direction,
    pub differential_count: usize,
    pub trend_count: usize,
    pub intersection: usize,
    /// Intersection as a percentage of the smaller set; 0.0 when either set
    /// is empty.
    pub percent_of_smaller: f64,
}

/// Significant gene symbols from each tester, split by that tester's own
/// direction labels, ready for enrichment hand-off.
#[derive(Debug, Clone, Default)]
pub struct DirectionalSets {
    pub differential_up: Vec<String>,
    pub differential_down: Vec<String>,
    pub trend_up: Vec<String>,
    pub trend_down: Vec<String>,
}

/// Partitions the testers' significant sets by direction and computes the
/// per-direction overlap summaries (Up first, then Down).
pub fn reconcile(
    differential: &[DifferentialResult],
    trend: &[TrendResult],
) -> (Vec<OverlapSummary>, DirectionalSets) {
    let mut sets = DirectionalSets::default();

    for r in differential.iter().filter(|r| r.significant) {
        match r.direction {
            Direction::Up => sets.differential_up.push(r.gene.clone()),
            Direction::Down => sets.differential_down.push(r.gene.clone()),
            Direction::None => {}
        }
    }
    for r in trend.iter().filter(|r| r.significant) {
        match r.direction {
            Direction::Up => sets.trend_up.push(r.gene.clone()),
            Direction::Down => sets.trend_down.push(r.gene.clone()),
            Direction::None => {}
        }
    }

    let summaries = vec![
        summarize(Direction::Up, &sets.differential_up, &sets.trend_up),
        summarize(Direction::Down, &sets.differential_down, &sets.trend_down),
    ];
    (summaries, sets)
}

fn summarize(direction: Direction, differential: &[String], trend: &[String]) -> OverlapSummary {
    let a: HashSet<&String> = differential.iter().collect();
    let b: HashSet<&String> = trend.iter().collect();
    let intersection = a.intersection(&b).count();
    let smaller = a.len().min(b.len());
    let percent_of_smaller = if smaller == 0 {
        0.0
    } else {
        100.0 * intersection as f64 / smaller as f64
    };
    OverlapSummary {
        direction,
        differential_count: a.len(),
        trend_count: b.len(),
        intersection,
        percent_of_smaller,
    }
}

/// Deterministic, deduplicated gene list for the enrichment hand-off.
pub fn merged_direction_list(sets: &DirectionalSets, direction: Direction) -> Vec<String> {
    let (a, b) = match direction {
        Direction::Up => (&sets.differential_up, &sets.trend_up),
        Direction::Down => (&sets.differential_down, &sets.trend_down),
        Direction::None => return Vec::new(),
    };
    a.iter().chain(b.iter()).unique().cloned().sorted().collect()
}
