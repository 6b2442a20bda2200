//! Ordinal trend testing across the seven Braak stages.
//!
//! The Jonckheere-Terpstra statistic accumulates pairwise comparisons
//! between every ordered pair of stage groups, giving a distribution-free
//! test of monotonic association with stage. The asymptotic normal p-value
//! uses the tie-corrected variance: quantile-normalized data produce
//! cross-sample ties by construction, so the no-tie formula would be wrong
//! here. Direction is classified separately from a weighted-effects fit so
//! that small stage groups cannot dominate the slope estimate.

use crate::error::Result;
use crate::expression::ExpressionMatrix;
use crate::metadata::SampleTable;
use crate::stats::correction::benjamini_hochberg;
use crate::stats::{Direction, TREND_ALPHA};
use log::warn;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Per-gene result of the ordinal trend test. `None` statistic fields mark a
/// degenerate gene (fewer than two populated stage groups, or zero variance
/// after tie correction), skipped and flagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendResult {
    pub gene: String,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub p_adjusted: Option<f64>,
    pub direction: Direction,
    pub significant: bool,
}

pub struct TrendTester {
    pub alpha: f64,
}

impl Default for TrendTester {
    fn default() -> Self {
        TrendTester { alpha: TREND_ALPHA }
    }
}

impl TrendTester {
    /// Runs the trend test over every gene, in parallel across the rayon
    /// pool; result order follows matrix row order.
    pub fn run(&self, matrix: &ExpressionMatrix, table: &SampleTable) -> Result<Vec<TrendResult>> {
        table.validate_alignment(matrix, "trend testing")?;
        let stage_indices = table.indices_by_stage();

        let mut results: Vec<TrendResult> = (0..matrix.n_features())
            .into_par_iter()
            .map(|row| {
                let values = matrix.values.row(row);
                let groups: Vec<Vec<f64>> = stage_indices
                    .iter()
                    .map(|idx| idx.iter().map(|&i| values[i]).collect())
                    .collect();

                let gene = matrix.feature_names[row].clone();
                match jonckheere_terpstra(&groups) {
                    Some((statistic, p_value)) => TrendResult {
                        gene,
                        statistic: Some(statistic),
                        p_value: Some(p_value),
                        p_adjusted: None,
                        direction: classify_direction(&groups),
                        significant: false,
                    },
                    None => TrendResult {
                        gene,
                        statistic: None,
                        p_value: None,
                        p_adjusted: None,
                        direction: Direction::None,
                        significant: false,
                    },
                }
            })
            .collect();

        let raw: Vec<Option<f64>> = results.iter().map(|r| r.p_value).collect();
        let adjusted = benjamini_hochberg(&raw);
        for (result, padj) in results.iter_mut().zip(adjusted) {
            result.p_adjusted = padj;
            result.significant = padj.map(|p| p <= self.alpha).unwrap_or(false);
        }

        let degenerate = results.iter().filter(|r| r.p_value.is_none()).count();
        if degenerate > 0 {
            warn!("{} genes were degenerate in the trend test", degenerate);
        }

        Ok(results)
    }
}

/// Jonckheere-Terpstra statistic and two-sided asymptotic p-value for the
/// ordered groups, or `None` when the configuration is degenerate.
pub fn jonckheere_terpstra(groups: &[Vec<f64>]) -> Option<(f64, f64)> {
    let populated = groups.iter().filter(|g| !g.is_empty()).count();
    if populated < 2 {
        return None;
    }

    // Pairwise Mann-Whitney counts over every ordered group pair, ties at
    // half weight.
    let mut j = 0.0f64;
    for lower in 0..groups.len() {
        for upper in lower + 1..groups.len() {
            for &a in &groups[lower] {
                for &b in &groups[upper] {
                    if a < b {
                        j += 1.0;
                    } else if a == b {
                        j += 0.5;
                    }
                }
            }
        }
    }

    let sizes: Vec<f64> = groups.iter().map(|g| g.len() as f64).collect();
    let n: f64 = sizes.iter().sum();
    let sum_sq: f64 = sizes.iter().map(|s| s * s).sum();
    let mean = (n * n - sum_sq) / 4.0;

    // Tie group sizes over the pooled values.
    let mut pooled: Vec<f64> = groups.iter().flatten().copied().collect();
    pooled.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut ties: Vec<f64> = Vec::new();
    let mut run = 1.0;
    for window in pooled.windows(2) {
        if window[0] == window[1] {
            run += 1.0;
        } else {
            if run > 1.0 {
                ties.push(run);
            }
            run = 1.0;
        }
    }
    if run > 1.0 {
        ties.push(run);
    }

    let sum2 = |xs: &[f64]| xs.iter().map(|&x| x * (x - 1.0)).sum::<f64>();
    let sum3 = |xs: &[f64]| xs.iter().map(|&x| x * (x - 1.0) * (x - 2.0)).sum::<f64>();
    let weighted = |xs: &[f64]| {
        xs.iter()
            .map(|&x| x * (x - 1.0) * (2.0 * x + 5.0))
            .sum::<f64>()
    };

    let term1 =
        (n * (n - 1.0) * (2.0 * n + 5.0) - weighted(&sizes) - weighted(&ties)) / 72.0;
    let term2 = sum3(&sizes) * sum3(&ties) / (36.0 * n * (n - 1.0) * (n - 2.0));
    let term3 = sum2(&sizes) * sum2(&ties) / (8.0 * n * (n - 1.0));
    let variance = term1 + term2 + term3;

    if !(variance > 1e-12) {
        return None;
    }

    let z = (j - mean) / variance.sqrt();
    let normal = Normal::new(0.0, 1.0).unwrap();
    let p = (2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0);
    Some((j, p))
}

/// Weighted-effects direction classifier.
///
/// Each populated stage above the baseline (lowest populated) stage
/// contributes its mean deviation from the baseline mean, weighted by the
/// stage's share of the total sample count; the mean of the weighted
/// coefficients gives the sign. Weighting by group share keeps a handful of
/// late-stage samples from dominating the call.
pub fn classify_direction(groups: &[Vec<f64>]) -> Direction {
    let present: Vec<(f64, f64)> = groups
        .iter()
        .filter(|g| !g.is_empty())
        .map(|g| {
            let n = g.len() as f64;
            (g.iter().sum::<f64>() / n, n)
        })
        .collect();
    if present.len() < 2 {
        return Direction::None;
    }

    let total: f64 = present.iter().map(|(_, n)| n).sum();
    let (baseline_mean, _) = present[0];

    let mut acc = 0.0;
    for &(mean, n) in &present[1..] {
        acc += (mean - baseline_mean) * (n / total);
    }
    Direction::from_sign(acc / (present.len() - 1) as f64)
}
