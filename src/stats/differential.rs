//! Two-group differential expression testing with variance shrinkage.
//!
//! Fits a per-gene linear model contrasting Control and Disease samples on
//! log2 data. Per-gene variance estimates are unstable at these group sizes,
//! so they are squeezed toward a common prior fitted across all genes
//! (empirical Bayes) before the moderated t statistic is formed.

use crate::error::Result;
use crate::expression::ExpressionMatrix;
use crate::metadata::{DiseaseStatus, SampleTable};
use crate::stats::correction::benjamini_hochberg;
use crate::stats::{Direction, DIFFERENTIAL_ALPHA};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Per-gene result of the two-group comparison. `None` statistic fields mark
/// a degenerate gene that was skipped and flagged, never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifferentialResult {
    pub gene: String,
    pub mean_expression: f64,
    pub log2_fold_change: Option<f64>,
    pub p_value: Option<f64>,
    pub p_adjusted: Option<f64>,
    pub direction: Direction,
    pub significant: bool,
}

/// Prior fitted across genes plus the squeezed per-gene variances.
#[derive(Debug, Clone)]
pub struct ShrunkenVariances {
    pub prior_df: f64,
    pub prior_variance: f64,
    pub posterior: Vec<f64>,
}

/// Capability interface for the empirical-Bayes variance squeeze, so a
/// numerically equivalent backend can replace the built-in fit without
/// touching the tester contract.
pub trait VarianceShrinker: Sync {
    /// `variances` are per-gene pooled residual variances on `residual_df`
    /// degrees of freedom each.
    fn shrink(&self, variances: &[f64], residual_df: f64) -> ShrunkenVariances;
}

/// Method-of-moments fit of a scaled-inverse-chi-square prior.
///
/// Under the hierarchical model the gene variances are marginally scaled
/// F(d, d0); matching the observed mean and variance of the gene variances
/// to the F moments yields the prior df d0 and prior variance s0^2. When the
/// observed spread does not exceed pure chi-square sampling noise the prior
/// df is effectively infinite and every gene collapses to the common value.
pub struct MomentShrinker;

/// Stand-in for an infinite prior df; large enough that the Student's t on
/// d + d0 df is indistinguishable from a normal.
const PRIOR_DF_CAP: f64 = 1e6;

impl VarianceShrinker for MomentShrinker {
    fn shrink(&self, variances: &[f64], residual_df: f64) -> ShrunkenVariances {
        let n = variances.len();
        if n == 0 {
            return ShrunkenVariances {
                prior_df: PRIOR_DF_CAP,
                prior_variance: 0.0,
                posterior: Vec::new(),
            };
        }

        let mean = variances.iter().sum::<f64>() / n as f64;
        let spread = variances
            .iter()
            .map(|s2| (s2 - mean).powi(2))
            .sum::<f64>()
            / n as f64;

        let (prior_df, prior_variance) = if mean <= 0.0 || spread <= 0.0 {
            (PRIOR_DF_CAP, mean.max(0.0))
        } else {
            // r = Var(s^2)/E(s^2)^2 = 2(d + d0 - 2) / (d (d0 - 4))
            let r = spread / (mean * mean);
            let denom = r * residual_df - 2.0;
            if denom <= 0.0 {
                (PRIOR_DF_CAP, mean)
            } else {
                let d0 = (2.0 * residual_df - 4.0 + 4.0 * r * residual_df) / denom;
                let d0 = d0.clamp(1.0, PRIOR_DF_CAP);
                // E(s^2) = s0^2 d0/(d0 - 2) when d0 > 2.
                let s0 = if d0 > 2.0 { mean * (d0 - 2.0) / d0 } else { mean };
                (d0, s0)
            }
        };

        let posterior = variances
            .iter()
            .map(|&s2| {
                (prior_df * prior_variance + residual_df * s2) / (prior_df + residual_df)
            })
            .collect();

        ShrunkenVariances {
            prior_df,
            prior_variance,
            posterior,
        }
    }
}

/// Per-gene first-pass summary, before shrinkage.
struct GeneSummary {
    mean: f64,
    log2_fold_change: f64,
    residual_variance: f64,
    degenerate: bool,
}

pub struct DifferentialTester {
    pub alpha: f64,
    pub shrinker: Box<dyn VarianceShrinker>,
}

impl Default for DifferentialTester {
    fn default() -> Self {
        DifferentialTester {
            alpha: DIFFERENTIAL_ALPHA,
            shrinker: Box::new(MomentShrinker),
        }
    }
}

impl DifferentialTester {
    /// Runs the moderated two-group test over every gene. Per-gene work is
    /// fanned across the rayon pool; result order follows matrix row order
    /// regardless of scheduling.
    pub fn run(
        &self,
        matrix: &ExpressionMatrix,
        table: &SampleTable,
    ) -> Result<Vec<DifferentialResult>> {
        table.validate_alignment(matrix, "differential testing")?;

        let controls = table.indices_with_status(DiseaseStatus::Control);
        let diseased = table.indices_with_status(DiseaseStatus::Disease);
        let n1 = controls.len();
        let n2 = diseased.len();

        if n1 == 0 || n2 == 0 {
            warn!(
                "differential test skipped: {} control / {} disease samples",
                n1, n2
            );
            return Ok(matrix
                .feature_names
                .iter()
                .enumerate()
                .map(|(row, gene)| DifferentialResult {
                    gene: gene.clone(),
                    mean_expression: matrix.values.row(row).mean().unwrap_or(0.0),
                    log2_fold_change: None,
                    p_value: None,
                    p_adjusted: None,
                    direction: Direction::None,
                    significant: false,
                })
                .collect());
        }

        let residual_df = (n1 + n2) as f64 - 2.0;

        let summaries: Vec<GeneSummary> = (0..matrix.n_features())
            .into_par_iter()
            .map(|row| summarize_gene(matrix, row, &controls, &diseased))
            .collect();

        let informative: Vec<f64> = summaries
            .iter()
            .filter(|s| !s.degenerate)
            .map(|s| s.residual_variance)
            .collect();
        let shrunk = self.shrinker.shrink(&informative, residual_df);
        info!(
            "variance prior: df {:.1}, variance {:.5} over {} genes",
            shrunk.prior_df,
            shrunk.prior_variance,
            informative.len()
        );

        // Reinflate the posterior vector to all genes, None for degenerate.
        let mut posterior_iter = shrunk.posterior.iter();
        let posteriors: Vec<Option<f64>> = summaries
            .iter()
            .map(|s| {
                if s.degenerate {
                    None
                } else {
                    posterior_iter.next().copied()
                }
            })
            .collect();

        let total_df = residual_df + shrunk.prior_df;
        let scale = (1.0 / n1 as f64 + 1.0 / n2 as f64).sqrt();

        let mut results: Vec<DifferentialResult> = summaries
            .par_iter()
            .zip(posteriors.par_iter())
            .enumerate()
            .map(|(row, (summary, posterior))| {
                let gene = matrix.feature_names[row].clone();
                match posterior {
                    Some(s2_tilde) if *s2_tilde > 0.0 => {
                        let t = summary.log2_fold_change / (s2_tilde.sqrt() * scale);
                        let p = moderated_p(t, total_df);
                        DifferentialResult {
                            gene,
                            mean_expression: summary.mean,
                            log2_fold_change: Some(summary.log2_fold_change),
                            p_value: p,
                            p_adjusted: None,
                            direction: Direction::from_sign(summary.log2_fold_change),
                            significant: false,
                        }
                    }
                    _ => DifferentialResult {
                        gene,
                        mean_expression: summary.mean,
                        log2_fold_change: None,
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
            warn!("{} genes were degenerate in the two-group test", degenerate);
        }

        Ok(results)
    }
}

fn summarize_gene(
    matrix: &ExpressionMatrix,
    row: usize,
    controls: &[usize],
    diseased: &[usize],
) -> GeneSummary {
    let values = matrix.values.row(row);
    let mean_of = |idx: &[usize]| idx.iter().map(|&i| values[i]).sum::<f64>() / idx.len() as f64;

    let m1 = mean_of(controls);
    let m2 = mean_of(diseased);
    let rss: f64 = controls.iter().map(|&i| (values[i] - m1).powi(2)).sum::<f64>()
        + diseased.iter().map(|&i| (values[i] - m2).powi(2)).sum::<f64>();
    let residual_df = (controls.len() + diseased.len()) as f64 - 2.0;
    let residual_variance = if residual_df > 0.0 { rss / residual_df } else { 0.0 };
    let log2_fold_change = m2 - m1;

    // A gene constant across every sample carries no testable signal.
    let degenerate =
        residual_df <= 0.0 || (residual_variance == 0.0 && log2_fold_change == 0.0);

    GeneSummary {
        mean: values.mean().unwrap_or(0.0),
        log2_fold_change,
        residual_variance,
        degenerate,
    }
}

/// Two-sided p-value of the moderated t statistic on `df` degrees of
/// freedom. `None` when the distribution cannot be formed.
fn moderated_p(t: f64, df: f64) -> Option<f64> {
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{resolve_samples, RawSampleRecord};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn table_with_stages(stages: &[&str]) -> SampleTable {
        let records: Vec<RawSampleRecord> = stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                [
                    ("sample".to_string(), format!("S{}", i)),
                    ("stage".to_string(), stage.to_string()),
                ]
                .into_iter()
                .collect()
            })
            .collect();
        resolve_samples(&records).unwrap().table
    }

    fn matrix_from(values: Array2<f64>) -> ExpressionMatrix {
        let (n_genes, n_samples) = values.dim();
        ExpressionMatrix::new(
            values,
            (0..n_genes).map(|i| format!("G{}", i)).collect(),
            (0..n_samples).map(|i| format!("S{}", i)).collect(),
        )
        .unwrap()
    }

    /// Small deterministic jitter, centered on zero.
    fn jitter(seed: usize) -> f64 {
        (((seed * 37 + 11) % 13) as f64 - 6.0) * 0.01
    }

    #[test]
    fn test_shifted_gene_is_significant_with_correct_sign() {
        let n_controls = 12;
        let n_disease = 8;
        let n = n_controls + n_disease;
        let mut values = Array2::zeros((6, n));
        for g in 0..6 {
            for s in 0..n {
                let base = 8.0 + jitter(g * n + s);
                // Gene 0 gains a full log2 unit in disease samples.
                let shift = if g == 0 && s >= n_controls { 1.0 } else { 0.0 };
                values[[g, s]] = base + shift;
            }
        }
        let stages: Vec<&str> = (0..n).map(|i| if i < n_controls { "0" } else { "IV" }).collect();
        let table = table_with_stages(&stages);
        let matrix = matrix_from(values);

        let results = DifferentialTester::default().run(&matrix, &table).unwrap();
        assert!(results[0].significant);
        assert_eq!(results[0].direction, Direction::Up);
        assert_relative_eq!(results[0].log2_fold_change.unwrap(), 1.0, epsilon = 0.1);
        for r in &results[1..] {
            assert!(!r.significant, "null gene {} flagged", r.gene);
        }
    }

    #[test]
    fn test_constant_gene_flagged_degenerate() {
        let mut values = Array2::zeros((2, 8));
        for s in 0..8 {
            values[[0, s]] = 5.0;
            values[[1, s]] = 5.0 + jitter(s) + if s >= 4 { 0.5 } else { 0.0 };
        }
        let table = table_with_stages(&["0", "0", "0", "0", "II", "II", "II", "II"]);
        let results = DifferentialTester::default()
            .run(&matrix_from(values), &table)
            .unwrap();

        assert!(results[0].p_value.is_none());
        assert!(!results[0].significant);
        assert_eq!(results[0].direction, Direction::None);
        assert!(results[1].p_value.is_some());
    }

    #[test]
    fn test_empty_group_skips_all_genes() {
        let values = Array2::from_shape_fn((3, 4), |(g, s)| jitter(g * 4 + s) + 7.0);
        let table = table_with_stages(&["0", "0", "0", "0"]);
        let results = DifferentialTester::default()
            .run(&matrix_from(values), &table)
            .unwrap();
        assert!(results.iter().all(|r| r.p_value.is_none()));
    }

    #[test]
    fn test_moment_shrinker_pulls_toward_prior() {
        let variances = vec![0.5, 1.0, 1.5, 2.0, 0.8, 1.2];
        let shrunk = MomentShrinker.shrink(&variances, 10.0);
        let mean = variances.iter().sum::<f64>() / variances.len() as f64;
        for (&raw, &post) in variances.iter().zip(shrunk.posterior.iter()) {
            // Posterior sits between the raw estimate and the prior.
            assert!(
                (post - raw).abs() <= (mean - raw).abs() + 1e-9,
                "posterior {} overshot prior from raw {}",
                post,
                raw
            );
        }
        assert!(shrunk.prior_df > 0.0);
    }

    #[test]
    fn test_moment_shrinker_uniform_variances_collapse() {
        let variances = vec![1.0; 20];
        let shrunk = MomentShrinker.shrink(&variances, 10.0);
        assert_relative_eq!(shrunk.prior_variance, 1.0, epsilon = 1e-9);
        for post in shrunk.posterior {
            assert_relative_eq!(post, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_results_are_deterministic() {
        let values = Array2::from_shape_fn((10, 12), |(g, s)| 6.0 + jitter(g * 12 + s));
        let stages: Vec<&str> = (0..12).map(|i| if i < 6 { "0" } else { "III" }).collect();
        let table = table_with_stages(&stages);
        let matrix = matrix_from(values);

        let tester = DifferentialTester::default();
        let a = tester.run(&matrix, &table).unwrap();
        let b = tester.run(&matrix, &table).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.p_value, y.p_value);
            assert_eq!(x.p_adjusted, y.p_adjusted);
        }
    }
}
