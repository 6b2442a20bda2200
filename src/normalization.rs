//! Cross-sample normalization of the expression matrix.
//!
//! Two order-sensitive steps: an elementwise log2 transform, then quantile
//! normalization across samples. Quantile normalization forces identical
//! marginal value distributions on every sample while preserving each
//! sample's within-column rank order, which removes array-to-array scale and
//! shape differences without altering relative gene ranking per sample.

use crate::error::{AnalysisError, Result};
use crate::expression::ExpressionMatrix;
use log::info;
use std::cmp::Ordering;

/// Applies the log2 transform in place. Intensities must be strictly
/// positive; a value <= 0 cannot be log-transformed and indicates corrupt
/// input, so the run aborts naming the offending cell.
pub fn log2_transform(matrix: &mut ExpressionMatrix) -> Result<()> {
    for ((row, col), value) in matrix.values.indexed_iter_mut() {
        if *value <= 0.0 {
            return Err(AnalysisError::integrity(
                "log2 transform",
                format!(
                    "non-positive intensity {} for probe '{}' in sample '{}'",
                    value, matrix.feature_names[row], matrix.sample_names[col]
                ),
            ));
        }
        *value = value.log2();
    }
    info!("log2 transform applied to {} cells", matrix.values.len());
    Ok(())
}

/// Quantile-normalizes the matrix across samples in place.
///
/// For each sample column the rank-ordered values are replaced by the mean of
/// the values at that rank position across all samples. Ranks are assigned by
/// a stable sort, so ties resolve by row order and the result is
/// bit-reproducible.
pub fn quantile_normalize(matrix: &mut ExpressionMatrix) -> Result<()> {
    let (n_features, n_samples) = matrix.dimensions();
    if n_features == 0 || n_samples == 0 {
        return Err(AnalysisError::integrity(
            "quantile normalization",
            "empty expression matrix".to_string(),
        ));
    }

    // Per-column permutation sorting that column ascending.
    let mut orders: Vec<Vec<usize>> = Vec::with_capacity(n_samples);
    for col in 0..n_samples {
        let column = matrix.values.column(col);
        let mut order: Vec<usize> = (0..n_features).collect();
        order.sort_by(|&a, &b| {
            column[a]
                .partial_cmp(&column[b])
                .unwrap_or(Ordering::Equal)
        });
        orders.push(order);
    }

    // Mean across samples at each rank position.
    let mut rank_means = vec![0.0f64; n_features];
    for (col, order) in orders.iter().enumerate() {
        let column = matrix.values.column(col);
        for (rank, &row) in order.iter().enumerate() {
            rank_means[rank] += column[row];
        }
    }
    for mean in rank_means.iter_mut() {
        *mean /= n_samples as f64;
    }

    // Write the rank means back through each column's permutation.
    for (col, order) in orders.iter().enumerate() {
        let mut column = matrix.values.column_mut(col);
        for (rank, &row) in order.iter().enumerate() {
            column[row] = rank_means[rank];
        }
    }

    info!(
        "quantile normalization aligned {} samples over {} features",
        n_samples, n_features
    );
    Ok(())
}

/// Runs both normalization steps in their required order.
pub fn normalize(matrix: &mut ExpressionMatrix) -> Result<()> {
    log2_transform(matrix)?;
    quantile_normalize(matrix)
}
