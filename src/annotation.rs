//! Probe annotation resolution.
//!
//! Maps measurement-probe identifiers to gene symbols and numeric gene
//! identifiers. Resolution is backed by an external collaborator, modeled as
//! the `AnnotationSource` capability so the pipeline contract is independent
//! of where annotations actually come from. Lookups are treated as fallible
//! network operations: retried with backoff, cached for the run, fatal once
//! the retry budget is spent.

use crate::error::{AnalysisError, Result};
use crate::expression::ExpressionMatrix;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Control probes follow the platform's fixed naming convention and carry no
/// biological signal.
pub const CONTROL_PROBE_PREFIX: &str = "AFFX";

/// Annotation record for one probe. A probe missing either the symbol or the
/// numeric gene id counts as unresolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeAnnotation {
    pub probe_id: String,
    pub gene_symbol: Option<String>,
    pub gene_id: Option<u64>,
    pub gene_name: Option<String>,
}

impl ProbeAnnotation {
    pub fn is_resolved(&self) -> bool {
        self.gene_symbol.is_some() && self.gene_id.is_some()
    }
}

/// Capability interface over the external annotation collaborator.
pub trait AnnotationSource {
    /// Resolves the given probes, returning one record per input probe in
    /// input order. Unknown probes come back unresolved, not missing.
    fn resolve(&self, probe_ids: &[String]) -> Result<Vec<ProbeAnnotation>>;
}

/// Annotation source backed by the collaborator-exported CSV table
/// (columns: probe id, gene symbol, gene id, gene name).
pub struct CsvAnnotationSource {
    path: PathBuf,
}

impl CsvAnnotationSource {
    pub fn new(path: &Path) -> Self {
        CsvAnnotationSource {
            path: path.to_path_buf(),
        }
    }

    fn load_table(&self) -> Result<HashMap<String, ProbeAnnotation>> {
        let mut rdr = csv::Reader::from_path(&self.path)?;
        let mut table = HashMap::new();
        for result in rdr.records() {
            let record = result?;
            let probe_id = record
                .get(0)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    AnalysisError::integrity(
                        "annotation input",
                        "annotation row with empty probe id".to_string(),
                    )
                })?
                .to_string();
            let gene_symbol = field(&record, 1);
            let gene_id = field(&record, 2).and_then(|v| v.parse::<u64>().ok());
            let gene_name = field(&record, 3);
            table.insert(
                probe_id.clone(),
                ProbeAnnotation {
                    probe_id,
                    gene_symbol,
                    gene_id,
                    gene_name,
                },
            );
        }
        Ok(table)
    }
}

fn field(record: &csv::StringRecord, idx: usize) -> Option<String> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "NA" && *v != "---")
        .map(str::to_string)
}

impl AnnotationSource for CsvAnnotationSource {
    fn resolve(&self, probe_ids: &[String]) -> Result<Vec<ProbeAnnotation>> {
        let table = self.load_table()?;
        Ok(probe_ids
            .iter()
            .map(|probe| {
                table.get(probe).cloned().unwrap_or_else(|| ProbeAnnotation {
                    probe_id: probe.clone(),
                    gene_symbol: None,
                    gene_id: None,
                    gene_name: None,
                })
            })
            .collect())
    }
}

/// Decorator adding bounded retries with exponential backoff and a per-run
/// result cache around any annotation source.
pub struct RetryingSource<S> {
    inner: S,
    max_attempts: u32,
    base_backoff: Duration,
    cache: Mutex<HashMap<String, ProbeAnnotation>>,
}

impl<S: AnnotationSource> RetryingSource<S> {
    pub fn new(inner: S, max_attempts: u32, base_backoff: Duration) -> Self {
        RetryingSource {
            inner,
            max_attempts,
            base_backoff,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: AnnotationSource> AnnotationSource for RetryingSource<S> {
    fn resolve(&self, probe_ids: &[String]) -> Result<Vec<ProbeAnnotation>> {
        let mut cache = self.cache.lock().expect("annotation cache poisoned");
        let missing: Vec<String> = probe_ids
            .iter()
            .filter(|p| !cache.contains_key(*p))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let mut last_error = String::new();
            let mut resolved = None;
            for attempt in 1..=self.max_attempts {
                match self.inner.resolve(&missing) {
                    Ok(records) => {
                        resolved = Some(records);
                        break;
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        warn!(
                            "annotation lookup attempt {}/{} failed: {}",
                            attempt, self.max_attempts, last_error
                        );
                        if attempt < self.max_attempts {
                            std::thread::sleep(self.base_backoff * 2u32.pow(attempt - 1));
                        }
                    }
                }
            }
            let records = resolved.ok_or(AnalysisError::ExternalService {
                service: "annotation",
                attempts: self.max_attempts,
                detail: last_error,
            })?;
            for record in records {
                cache.insert(record.probe_id.clone(), record);
            }
        }

        Ok(probe_ids
            .iter()
            .map(|p| cache.get(p).expect("probe resolved above").clone())
            .collect())
    }
}

/// Probe filtering applied by the pipeline after resolution, before
/// deduplication.
#[derive(Debug, Default)]
pub struct ProbeFilterCounts {
    pub unannotated: usize,
    pub control: usize,
}

/// Drops control probes and probes lacking a symbol or gene id, returning
/// the filtered matrix, the surviving annotations aligned to its rows, and
/// the drop counts for provenance. Dropped probes are a recovered gap, never
/// an error.
pub fn filter_annotated_probes(
    matrix: &ExpressionMatrix,
    annotations: &[ProbeAnnotation],
) -> Result<(ExpressionMatrix, Vec<ProbeAnnotation>, ProbeFilterCounts)> {
    if annotations.len() != matrix.n_features() {
        return Err(AnalysisError::integrity(
            "probe filtering",
            format!(
                "{} annotation records for {} matrix rows",
                annotations.len(),
                matrix.n_features()
            ),
        ));
    }

    let mut counts = ProbeFilterCounts::default();
    let mut keep_rows = Vec::new();
    let mut keep_names = Vec::new();
    let mut keep_annotations = Vec::new();

    for (row, annotation) in annotations.iter().enumerate() {
        if annotation.probe_id.starts_with(CONTROL_PROBE_PREFIX) {
            counts.control += 1;
            continue;
        }
        if !annotation.is_resolved() {
            counts.unannotated += 1;
            continue;
        }
        keep_rows.push(row);
        keep_names.push(annotation.probe_id.clone());
        keep_annotations.push(annotation.clone());
    }

    info!(
        "probe filter kept {} of {} probes ({} unannotated, {} control)",
        keep_rows.len(),
        annotations.len(),
        counts.unannotated,
        counts.control
    );

    let filtered = matrix.select_rows(&keep_rows, keep_names)?;
    Ok((filtered, keep_annotations, counts))
}
