//! Collapses multiple probes mapping to the same gene symbol.
//!
//! Of all surviving probes sharing a gene symbol, only the one with the
//! highest mean expression across retained samples is kept; the matrix rows
//! are then reindexed by gene symbol. Grouping uses an insertion-ordered map
//! and ties break on probe-id order, so the outcome is deterministic for
//! identical input.

use crate::annotation::ProbeAnnotation;
use crate::error::{AnalysisError, Result};
use crate::expression::ExpressionMatrix;
use indexmap::IndexMap;
use log::info;

/// Result of the collapse: the gene-indexed matrix plus the number of probes
/// discarded as lower-expressed duplicates.
pub struct DeduplicatedMatrix {
    pub matrix: ExpressionMatrix,
    pub probes_collapsed: usize,
}

/// Collapses probe rows into one row per gene symbol.
///
/// `annotations` must align 1:1 with the matrix rows and every record must
/// already be resolved; the probe filter guarantees both upstream, so a
/// violation here is an integrity error, not a gap.
pub fn collapse_by_gene(
    matrix: &ExpressionMatrix,
    annotations: &[ProbeAnnotation],
) -> Result<DeduplicatedMatrix> {
    if annotations.len() != matrix.n_features() {
        return Err(AnalysisError::integrity(
            "gene deduplication",
            format!(
                "{} annotation records for {} matrix rows",
                annotations.len(),
                matrix.n_features()
            ),
        ));
    }

    let row_means = matrix.row_means();

    // Gene symbol -> probe rows, in first-seen order.
    let mut by_gene: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (row, annotation) in annotations.iter().enumerate() {
        let symbol = annotation.gene_symbol.as_ref().ok_or_else(|| {
            AnalysisError::integrity(
                "gene deduplication",
                format!("unresolved probe '{}' reached deduplication", annotation.probe_id),
            )
        })?;
        by_gene.entry(symbol.clone()).or_default().push(row);
    }

    let mut keep_rows = Vec::with_capacity(by_gene.len());
    let mut gene_names = Vec::with_capacity(by_gene.len());
    let mut probes_collapsed = 0usize;

    for (symbol, rows) in &by_gene {
        // Max mean expression wins; ties fall to the lexically smaller
        // probe id so re-runs pick the same representative.
        let &best = rows
            .iter()
            .max_by(|&&a, &&b| {
                row_means[a]
                    .partial_cmp(&row_means[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        matrix.feature_names[b]
                            .cmp(&matrix.feature_names[a])
                    })
            })
            .expect("gene group is never empty");
        probes_collapsed += rows.len() - 1;
        keep_rows.push(best);
        gene_names.push(symbol.clone());
    }

    info!(
        "collapsed {} probes into {} genes ({} duplicates discarded)",
        matrix.n_features(),
        gene_names.len(),
        probes_collapsed
    );

    // ExpressionMatrix::new re-checks name uniqueness; a duplicate symbol
    // surviving the collapse means the grouping logic is broken upstream.
    let matrix = matrix.select_rows(&keep_rows, gene_names)?;
    Ok(DeduplicatedMatrix {
        matrix,
        probes_collapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    fn annotation(probe: &str, symbol: &str) -> ProbeAnnotation {
        ProbeAnnotation {
            probe_id: probe.to_string(),
            gene_symbol: Some(symbol.to_string()),
            gene_id: Some(1),
            gene_name: None,
        }
    }

    fn fixture() -> (ExpressionMatrix, Vec<ProbeAnnotation>) {
        let matrix = ExpressionMatrix::new(
            arr2(&[
                [1.0, 2.0, 3.0], // APOE, mean 2.0
                [4.0, 5.0, 6.0], // APOE, mean 5.0 <- keeper
                [7.0, 8.0, 9.0], // TREM2
            ]),
            vec!["201_at".to_string(), "202_at".to_string(), "203_at".to_string()],
            vec!["S1".to_string(), "S2".to_string(), "S3".to_string()],
        )
        .unwrap();
        let annotations = vec![
            annotation("201_at", "APOE"),
            annotation("202_at", "APOE"),
            annotation("203_at", "TREM2"),
        ];
        (matrix, annotations)
    }

    #[test]
    fn test_highest_mean_probe_survives() {
        let (matrix, annotations) = fixture();
        let result = collapse_by_gene(&matrix, &annotations).unwrap();
        assert_eq!(result.matrix.n_features(), 2);
        assert_eq!(result.probes_collapsed, 1);
        assert_eq!(result.matrix.feature_names, vec!["APOE", "TREM2"]);
        let apoe = result.matrix.feature_values("APOE").unwrap();
        assert_relative_eq!(apoe[0], 4.0);
    }

    #[test]
    fn test_tie_breaks_on_probe_id() {
        let matrix = ExpressionMatrix::new(
            arr2(&[[2.0, 2.0], [2.0, 2.0]]),
            vec!["300_at".to_string(), "100_at".to_string()],
            vec!["S1".to_string(), "S2".to_string()],
        )
        .unwrap();
        let annotations = vec![annotation("300_at", "GFAP"), annotation("100_at", "GFAP")];

        let result = collapse_by_gene(&matrix, &annotations).unwrap();
        // Equal means: the lexically smaller probe id ("100_at", row 1) wins.
        assert_eq!(result.matrix.n_features(), 1);
        let kept_row = result.matrix.feature_values("GFAP").unwrap();
        assert_relative_eq!(kept_row[0], 2.0);
        assert_eq!(result.probes_collapsed, 1);
    }

    #[test]
    fn test_unresolved_probe_is_integrity_error() {
        let (matrix, mut annotations) = fixture();
        annotations[0].gene_symbol = None;
        assert!(collapse_by_gene(&matrix, &annotations).is_err());
    }

    #[test]
    fn test_single_probe_genes_pass_through() {
        let (matrix, annotations) = fixture();
        let result = collapse_by_gene(&matrix, &annotations).unwrap();
        let trem2 = result.matrix.feature_values("TREM2").unwrap();
        assert_relative_eq!(trem2[2], 9.0);
    }
}
