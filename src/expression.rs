//! Defines structures and functions for handling expression data.
//!
//! The central structure is a features x samples matrix of real-valued
//! intensities. Rows are measurement probes early in the pipeline and gene
//! symbols after deduplication; columns stay index-aligned with the sample
//! table at all times.

use crate::error::{AnalysisError, Result};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An expression matrix with named rows (features) and columns (samples).
///
/// Stores intensities as `f64` to accommodate log-scale and normalized
/// values, along with name vectors and lookup maps for both axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionMatrix {
    /// The core data matrix (features x samples).
    pub values: Array2<f64>,

    /// Mapping from feature index (row) to feature name (probe id or gene symbol).
    pub feature_names: Vec<String>,
    pub feature_map: HashMap<String, usize>,

    /// Mapping from sample index (column) to sample identifier.
    pub sample_names: Vec<String>,
    pub sample_map: HashMap<String, usize>,
}

impl ExpressionMatrix {
    /// Builds a matrix from its parts, validating dimensions and name
    /// uniqueness. Duplicate feature or sample names are a fatal integrity
    /// error: every downstream join keys on these names.
    pub fn new(
        values: Array2<f64>,
        feature_names: Vec<String>,
        sample_names: Vec<String>,
    ) -> Result<Self> {
        let (n_features, n_samples) = values.dim();
        if feature_names.len() != n_features {
            return Err(AnalysisError::integrity(
                "matrix construction",
                format!(
                    "{} feature names for {} matrix rows",
                    feature_names.len(),
                    n_features
                ),
            ));
        }
        if sample_names.len() != n_samples {
            return Err(AnalysisError::integrity(
                "matrix construction",
                format!(
                    "{} sample names for {} matrix columns",
                    sample_names.len(),
                    n_samples
                ),
            ));
        }

        let feature_map = build_index(&feature_names, "matrix construction", "feature")?;
        let sample_map = build_index(&sample_names, "matrix construction", "sample")?;

        Ok(ExpressionMatrix {
            values,
            feature_names,
            feature_map,
            sample_names,
            sample_map,
        })
    }

    /// Returns the dimensions of the matrix (features, samples).
    pub fn dimensions(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn n_features(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.values.ncols()
    }

    /// Retrieves the expression vector for a feature by name.
    pub fn feature_values(&self, feature_name: &str) -> Option<ArrayView1<'_, f64>> {
        self.feature_map
            .get(feature_name)
            .map(|&idx| self.values.row(idx))
    }

    /// Retrieves the expression column for a sample by identifier.
    pub fn sample_values(&self, sample_name: &str) -> Option<ArrayView1<'_, f64>> {
        self.sample_map
            .get(sample_name)
            .map(|&idx| self.values.column(idx))
    }

    /// Mean expression per feature across retained samples.
    pub fn row_means(&self) -> Vec<f64> {
        self.values
            .mean_axis(Axis(1))
            .map(|m| m.to_vec())
            .unwrap_or_default()
    }

    /// Returns a new matrix keeping only the rows at `indices`, renamed to
    /// `new_names`. Used by the deduplicator to collapse probes into genes.
    pub fn select_rows(&self, indices: &[usize], new_names: Vec<String>) -> Result<Self> {
        let mut values = Array2::zeros((indices.len(), self.n_samples()));
        for (out_row, &src_row) in indices.iter().enumerate() {
            values.row_mut(out_row).assign(&self.values.row(src_row));
        }
        ExpressionMatrix::new(values, new_names, self.sample_names.clone())
    }

    /// Returns a new matrix keeping only the columns at `keep`, in order.
    /// The caller must apply the identical selection to the sample table.
    pub fn retain_samples(&self, keep: &[usize]) -> Result<Self> {
        let mut values = Array2::zeros((self.n_features(), keep.len()));
        let mut sample_names = Vec::with_capacity(keep.len());
        for (out_col, &src_col) in keep.iter().enumerate() {
            values
                .column_mut(out_col)
                .assign(&self.values.column(src_col));
            sample_names.push(self.sample_names[src_col].clone());
        }
        ExpressionMatrix::new(values, self.feature_names.clone(), sample_names)
    }
}

fn build_index(
    names: &[String],
    stage: &'static str,
    axis: &str,
) -> Result<HashMap<String, usize>> {
    let mut map = HashMap::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        if map.insert(name.clone(), i).is_some() {
            return Err(AnalysisError::integrity(
                stage,
                format!("duplicate {} name '{}'", axis, name),
            ));
        }
    }
    Ok(map)
}
