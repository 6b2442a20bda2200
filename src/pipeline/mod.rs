//! The analysis pipeline.
//!
//! One explicit context object is threaded through the stages; every stage
//! returns a new (possibly filtered) state and re-validates the matrix /
//! sample-table alignment at its boundary, so a misaligned filter shows up
//! at the stage that caused it instead of as a silent join error later. The
//! stage order is fixed: metadata and annotation resolve independently, then
//! normalization, deduplication, outlier screening, and the two testers on
//! the same cleaned matrix.

pub mod report;

use crate::annotation::{filter_annotated_probes, AnnotationSource, ProbeAnnotation};
use crate::dedup::collapse_by_gene;
use crate::error::Result;
use crate::expression::ExpressionMatrix;
use crate::io::align_records_to_matrix;
use crate::metadata::{resolve_samples, BraakStage, RawSampleRecord, SampleTable};
use crate::normalization::normalize;
use crate::outlier::{remove_outlier_samples, GramEigenScorer, Pc1Scorer};
use crate::overlap::{reconcile, DirectionalSets, OverlapSummary};
use crate::stats::{DifferentialResult, DifferentialTester, TrendResult, TrendTester};
use log::info;
use serde::{Deserialize, Serialize};

/// Counters reported with every completed run: how many records each stage
/// touched, so the output tables carry their own filtering history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub samples_total: usize,
    pub stages_imputed: usize,
    pub outlier_samples_removed: Vec<String>,
    pub probes_total: usize,
    pub probes_unannotated: usize,
    pub probes_control: usize,
    pub probes_collapsed: usize,
    pub genes_tested: usize,
    pub degenerate_differential: usize,
    pub degenerate_trend: usize,
}

/// Everything a completed run hands to reporting and enrichment.
#[derive(Debug)]
pub struct AnalysisOutput {
    pub differential: Vec<DifferentialResult>,
    pub trend: Vec<TrendResult>,
    pub overlap: Vec<OverlapSummary>,
    pub gene_sets: DirectionalSets,
    pub provenance: Provenance,
}

/// Pipeline state between stages: the matrix, the aligned sample table, the
/// per-row probe annotations, and the accumulated provenance.
pub struct AnalysisContext {
    pub matrix: ExpressionMatrix,
    pub table: SampleTable,
    pub annotations: Vec<ProbeAnnotation>,
    pub provenance: Provenance,
}

impl AnalysisContext {
    /// Stage 1: resolve metadata into the canonical sample table, aligned to
    /// the matrix columns, and resolve probe annotations. The two
    /// resolutions are independent of each other.
    pub fn build(
        matrix: ExpressionMatrix,
        metadata_records: Vec<RawSampleRecord>,
        annotation: &dyn AnnotationSource,
    ) -> Result<Self> {
        let aligned = align_records_to_matrix(&matrix, metadata_records)?;
        let resolved = resolve_samples(&aligned)?;
        resolved
            .table
            .validate_alignment(&matrix, "metadata resolution")?;

        let by_stage = resolved.table.indices_by_stage();
        let distribution = BraakStage::ALL
            .iter()
            .zip(by_stage.iter())
            .map(|(stage, idx)| format!("{}:{}", stage.label(), idx.len()))
            .collect::<Vec<_>>()
            .join(" ");
        info!("stage distribution: {}", distribution);

        let annotations = annotation.resolve(&matrix.feature_names)?;

        let provenance = Provenance {
            samples_total: resolved.table.len(),
            stages_imputed: resolved.stages_imputed,
            probes_total: matrix.n_features(),
            ..Provenance::default()
        };

        Ok(AnalysisContext {
            matrix,
            table: resolved.table,
            annotations,
            provenance,
        })
    }

    /// Stage 2: drop unannotated and control probes.
    pub fn filter_probes(mut self) -> Result<Self> {
        let (matrix, annotations, counts) =
            filter_annotated_probes(&self.matrix, &self.annotations)?;
        self.provenance.probes_unannotated = counts.unannotated;
        self.provenance.probes_control = counts.control;
        self.table.validate_alignment(&matrix, "probe filtering")?;
        Ok(AnalysisContext {
            matrix,
            annotations,
            ..self
        })
    }

    /// Stage 3: log2 transform and quantile normalization, in that order.
    pub fn normalize(mut self) -> Result<Self> {
        normalize(&mut self.matrix)?;
        self.table.validate_alignment(&self.matrix, "normalization")?;
        Ok(self)
    }

    /// Stage 4: collapse probes to one row per gene symbol.
    pub fn deduplicate(mut self) -> Result<Self> {
        let collapsed = collapse_by_gene(&self.matrix, &self.annotations)?;
        self.provenance.probes_collapsed = collapsed.probes_collapsed;
        self.provenance.genes_tested = collapsed.matrix.n_features();
        self.table
            .validate_alignment(&collapsed.matrix, "gene deduplication")?;
        Ok(AnalysisContext {
            matrix: collapsed.matrix,
            // Probe annotations refer to probe rows; past this point the
            // unit of analysis is the gene symbol.
            annotations: Vec::new(),
            ..self
        })
    }

    /// Stage 5: PC1-based sample screening, filtering matrix and table
    /// together.
    pub fn screen_outliers(mut self, scorer: &dyn Pc1Scorer) -> Result<Self> {
        let screen = remove_outlier_samples(&self.matrix, &self.table, scorer)?;
        self.provenance.outlier_samples_removed = screen.removed;
        Ok(AnalysisContext {
            matrix: screen.matrix,
            table: screen.table,
            ..self
        })
    }

    /// Stage 6: both testers on the same cleaned matrix, then the overlap
    /// reconciliation of their significant sets.
    pub fn test(mut self) -> Result<AnalysisOutput> {
        let differential = DifferentialTester::default().run(&self.matrix, &self.table)?;
        let trend = TrendTester::default().run(&self.matrix, &self.table)?;

        self.provenance.degenerate_differential =
            differential.iter().filter(|r| r.p_value.is_none()).count();
        self.provenance.degenerate_trend = trend.iter().filter(|r| r.p_value.is_none()).count();

        let (overlap, gene_sets) = reconcile(&differential, &trend);

        Ok(AnalysisOutput {
            differential,
            trend,
            overlap,
            gene_sets,
            provenance: self.provenance,
        })
    }
}

/// Runs the whole pipeline over a fixed input snapshot. Every computation is
/// deterministic for identical inputs; nothing is persisted between runs.
pub fn run_pipeline(
    matrix: ExpressionMatrix,
    metadata_records: Vec<RawSampleRecord>,
    annotation: &dyn AnnotationSource,
) -> Result<AnalysisOutput> {
    info!(
        "starting analysis over {} probes x {} samples",
        matrix.n_features(),
        matrix.n_samples()
    );
    let output = AnalysisContext::build(matrix, metadata_records, annotation)?
        .filter_probes()?
        .normalize()?
        .deduplicate()?
        .screen_outliers(&GramEigenScorer)?
        .test()?;
    info!(
        "analysis complete: {} genes tested, {} differential / {} trend significant",
        output.provenance.genes_tested,
        output.differential.iter().filter(|r| r.significant).count(),
        output.trend.iter().filter(|r| r.significant).count()
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{resolve_samples, RawSampleRecord};
    use crate::stats::Direction;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    struct MapAnnotation;

    impl AnnotationSource for MapAnnotation {
        fn resolve(&self, probe_ids: &[String]) -> Result<Vec<ProbeAnnotation>> {
            // Probe "<n>_at" maps to gene "GENE<n>"; control probes and one
            // unannotated probe pass through unresolved.
            Ok(probe_ids
                .iter()
                .map(|p| {
                    let resolved = !p.starts_with("AFFX") && !p.starts_with("NOANN");
                    ProbeAnnotation {
                        probe_id: p.clone(),
                        gene_symbol: resolved
                            .then(|| format!("GENE{}", p.trim_end_matches("_at"))),
                        gene_id: resolved.then(|| 1000 + p.len() as u64),
                        gene_name: None,
                    }
                })
                .collect())
        }
    }

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

    fn metadata_records(stages: &[&str]) -> Vec<RawSampleRecord> {
        stages
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
            .collect()
    }

    /// Deterministic jitter in [-0.06, 0.06].
    fn jitter(seed: usize) -> f64 {
        ((seed % 13) as f64 - 6.0) * 0.01
    }

    /// Scenario: 200 samples (150 Control / 50 Disease), 30 genes, 5 of
    /// them with a synthetic 2-fold (one log2 unit) shift in Disease and
    /// negligible variance elsewhere. The two-group tester must flag exactly
    /// those 5 genes, with positive sign.
    #[test]
    fn test_scenario_two_group_exact_recovery() {
        let n_controls = 150;
        let n_disease = 50;
        let n = n_controls + n_disease;
        let n_genes = 30;

        let mut values = Array2::zeros((n_genes, n));
        for g in 0..n_genes {
            for s in 0..n {
                // Jitter phase has period 10, which divides both group
                // sizes, so null genes have exactly zero fold change.
                let base = 6.0 + (g as f64) * 0.05 + jitter(g * 7 + (s % 10));
                let spike = if g < 5 && s >= n_controls { 1.0 } else { 0.0 };
                values[[g, s]] = base + spike;
            }
        }
        let stages: Vec<&str> = (0..n)
            .map(|s| if s < n_controls { "0" } else { "V" })
            .collect();
        let table = table_with_stages(&stages);
        let matrix = ExpressionMatrix::new(
            values,
            (0..n_genes).map(|g| format!("GENE{}", g)).collect(),
            (0..n).map(|s| format!("S{}", s)).collect(),
        )
        .unwrap();

        let results = DifferentialTester::default().run(&matrix, &table).unwrap();
        let flagged: Vec<&str> = results
            .iter()
            .filter(|r| r.significant)
            .map(|r| r.gene.as_str())
            .collect();
        assert_eq!(flagged, vec!["GENE0", "GENE1", "GENE2", "GENE3", "GENE4"]);
        for r in results.iter().take(5) {
            assert_eq!(r.direction, Direction::Up);
            assert!(r.log2_fold_change.unwrap() > 0.9);
        }
    }

    /// Scenario: one gene strictly increasing in mean across the seven
    /// ordered stage groups, no noise within groups beyond distinct values.
    /// The trend tester must assign an adjusted p-value near zero and an
    /// Up-Regulated direction.
    #[test]
    fn test_scenario_monotone_trend_recovery() {
        let per_stage = 6;
        let stage_labels = ["0", "I", "II", "III", "IV", "V", "VI"];
        let stages: Vec<&str> = stage_labels
            .iter()
            .flat_map(|s| std::iter::repeat(*s).take(per_stage))
            .collect();
        let n = stages.len();
        let table = table_with_stages(&stages);

        let mut values = Array2::zeros((1, n));
        for s in 0..n {
            let stage = s / per_stage;
            values[[0, s]] = 5.0 + stage as f64 * 0.8 + (s % per_stage) as f64 * 0.01;
        }
        let matrix = ExpressionMatrix::new(
            values,
            vec!["MAPT".to_string()],
            (0..n).map(|s| format!("S{}", s)).collect(),
        )
        .unwrap();

        let results = TrendTester::default().run(&matrix, &table).unwrap();
        assert!(results[0].significant);
        assert!(results[0].p_adjusted.unwrap() < 1e-8);
        assert_eq!(results[0].direction, Direction::Up);
        assert_eq!(results[0].direction.label(), "Up-Regulated");
    }

    fn full_pipeline_fixture() -> (ExpressionMatrix, Vec<RawSampleRecord>) {
        // Six annotated biological probes, one control probe, one
        // unannotated probe, over 24 samples spread across stages.
        let stage_cycle = ["0", "0", "I", "II", "III", "IV", "V", "VI"];
        let n = 24;
        let stages: Vec<&str> = (0..n).map(|s| stage_cycle[s % 8]).collect();

        let probes = vec![
            "1_at".to_string(),
            "2_at".to_string(),
            "3_at".to_string(),
            "4_at".to_string(),
            "5_at".to_string(),
            "6_at".to_string(),
            "NOANN_at".to_string(),
            "AFFX-ctrl_at".to_string(),
        ];
        let mut values = Array2::zeros((probes.len(), n));
        for p in 0..probes.len() {
            for s in 0..n {
                // Strictly positive raw intensities with probe- and
                // sample-dependent structure.
                let stage = (s % 8).saturating_sub(1);
                values[[p, s]] = 50.0
                    + p as f64 * 10.0
                    + stage as f64 * (p as f64 - 3.0)
                    + ((p * 11 + s * 5) % 7) as f64;
            }
        }
        let matrix = ExpressionMatrix::new(
            values,
            probes,
            (0..n).map(|s| format!("S{}", s)).collect(),
        )
        .unwrap();
        (matrix, metadata_records(&stages))
    }

    #[test]
    fn test_full_pipeline_provenance_and_alignment() {
        let (matrix, records) = full_pipeline_fixture();
        let output = run_pipeline(matrix, records, &MapAnnotation).unwrap();

        assert_eq!(output.provenance.samples_total, 24);
        assert_eq!(output.provenance.probes_total, 8);
        assert_eq!(output.provenance.probes_control, 1);
        assert_eq!(output.provenance.probes_unannotated, 1);
        // Six annotated biological probes map to six distinct genes here.
        assert_eq!(output.provenance.genes_tested, 6);
        assert_eq!(output.differential.len(), 6);
        assert_eq!(output.trend.len(), 6);
        assert_eq!(output.overlap.len(), 2);
    }

    #[test]
    fn test_full_pipeline_is_deterministic() {
        let (matrix, records) = full_pipeline_fixture();
        let a = run_pipeline(matrix.clone(), records.clone(), &MapAnnotation).unwrap();
        let b = run_pipeline(matrix, records, &MapAnnotation).unwrap();

        // Byte-identical serialized outputs on identical inputs.
        let ser = |o: &AnalysisOutput| {
            serde_json::to_string(&(
                &o.differential,
                &o.trend,
                &o.overlap,
                &o.provenance,
            ))
            .unwrap()
        };
        assert_eq!(ser(&a), ser(&b));
    }

    #[test]
    fn test_overlap_disjoint_sets_no_division_error() {
        use crate::overlap::reconcile;
        use crate::stats::{DifferentialResult, TrendResult};

        let differential: Vec<DifferentialResult> = ["A", "B", "C"]
            .iter()
            .map(|g| DifferentialResult {
                gene: g.to_string(),
                mean_expression: 0.0,
                log2_fold_change: Some(1.0),
                p_value: Some(0.001),
                p_adjusted: Some(0.01),
                direction: Direction::Up,
                significant: true,
            })
            .collect();
        let trend: Vec<TrendResult> = ["X", "Y"]
            .iter()
            .map(|g| TrendResult {
                gene: g.to_string(),
                statistic: Some(5.0),
                p_value: Some(0.001),
                p_adjusted: Some(0.005),
                direction: Direction::Up,
                significant: true,
            })
            .collect();

        let (summaries, _) = reconcile(&differential, &trend);
        assert_eq!(summaries[0].intersection, 0);
        assert_relative_eq!(summaries[0].percent_of_smaller, 0.0);
        assert_eq!(summaries[0].differential_count, 3);
        assert_eq!(summaries[0].trend_count, 2);
    }
}
