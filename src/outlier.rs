//! Principal-component-based sample screening.
//!
//! Samples are scored on the first principal component of the
//! gene-standardized expression matrix (samples as observations, genes as
//! variables). A sample whose absolute PC1 score exceeds the 99th percentile
//! of the absolute-score distribution is removed from the matrix and the
//! sample table together. The cut is applied to absolute scores against a
//! percentile, not a fixed top-1% count, so the flagged fraction is
//! data-dependent; that semantics is part of the contract.

use crate::error::{AnalysisError, Result};
use crate::expression::ExpressionMatrix;
use crate::metadata::SampleTable;
use log::info;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, Axis};

/// Capability interface for the decomposition backend: anything that can
/// produce a leading-component score per observation row.
pub trait Pc1Scorer {
    /// `data` is observations x variables; returns one score per row.
    fn pc1_scores(&self, data: &Array2<f64>) -> Result<Vec<f64>>;
}

/// PC1 scoring through the observation-space Gram matrix.
///
/// For n samples and p genes with n << p, the n x n Gram matrix shares its
/// leading eigenpair with the covariance decomposition, so the scores come
/// out of a symmetric eigensolve of manageable size.
pub struct GramEigenScorer;

impl Pc1Scorer for GramEigenScorer {
    fn pc1_scores(&self, data: &Array2<f64>) -> Result<Vec<f64>> {
        let n = data.nrows();
        if n < 2 {
            return Err(AnalysisError::integrity(
                "outlier detection",
                format!("need at least 2 samples for PCA, have {}", n),
            ));
        }

        let gram = data.dot(&data.t());
        let sym = DMatrix::from_fn(n, n, |i, j| gram[[i, j]]);
        let eigen = SymmetricEigen::new(sym);

        let mut lead = 0;
        for i in 1..n {
            if eigen.eigenvalues[i] > eigen.eigenvalues[lead] {
                lead = i;
            }
        }
        let lambda = eigen.eigenvalues[lead].max(0.0);
        let scale = lambda.sqrt();
        let mut scores: Vec<f64> = (0..n)
            .map(|i| eigen.eigenvectors[(i, lead)] * scale)
            .collect();

        // Eigenvector sign is arbitrary; pin it so identical inputs always
        // produce identical score vectors.
        let dominant = scores
            .iter()
            .cloned()
            .fold(0.0f64, |acc, s| if s.abs() > acc.abs() { s } else { acc });
        if dominant < 0.0 {
            for s in scores.iter_mut() {
                *s = -*s;
            }
        }

        Ok(scores)
    }
}

/// Outcome of the screening: filtered matrix and table plus the removed
/// sample identifiers for provenance.
pub struct OutlierScreen {
    pub matrix: ExpressionMatrix,
    pub table: SampleTable,
    pub removed: Vec<String>,
}

/// Standardizes each gene to zero mean and unit variance across samples.
/// Zero-variance genes carry no direction information and contribute zero.
fn standardize_genes(matrix: &ExpressionMatrix) -> Array2<f64> {
    let mut standardized = matrix.values.clone();
    let n_samples = matrix.n_samples() as f64;
    for mut row in standardized.axis_iter_mut(Axis(0)) {
        let mean = row.sum() / n_samples;
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n_samples - 1.0);
        if var > 0.0 {
            let sd = var.sqrt();
            row.mapv_inplace(|v| (v - mean) / sd);
        } else {
            row.fill(0.0);
        }
    }
    standardized
}

/// Linear-interpolation percentile of `values` at quantile `q` in [0, 1].
pub fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = q * (sorted.len() - 1) as f64;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Screens samples on |PC1| and removes flagged ones from both structures.
pub fn remove_outlier_samples(
    matrix: &ExpressionMatrix,
    table: &SampleTable,
    scorer: &dyn Pc1Scorer,
) -> Result<OutlierScreen> {
    table.validate_alignment(matrix, "outlier detection")?;

    let standardized = standardize_genes(matrix);
    // Samples as observations: transpose to samples x genes.
    let observations = standardized.t().to_owned();
    let scores = scorer.pc1_scores(&observations)?;

    let abs_scores: Vec<f64> = scores.iter().map(|s| s.abs()).collect();
    let cutoff = percentile(&abs_scores, 0.99);

    let mut keep = Vec::with_capacity(scores.len());
    let mut removed = Vec::new();
    for (i, &abs_score) in abs_scores.iter().enumerate() {
        if abs_score > cutoff {
            removed.push(table.samples[i].id.clone());
        } else {
            keep.push(i);
        }
    }

    info!(
        "outlier screen removed {} of {} samples (|PC1| cutoff {:.4})",
        removed.len(),
        scores.len(),
        cutoff
    );

    let matrix = matrix.retain_samples(&keep)?;
    let table = table.retain(&keep);
    table.validate_alignment(&matrix, "outlier detection")?;

    Ok(OutlierScreen {
        matrix,
        table,
        removed,
    })
}
