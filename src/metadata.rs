//! Sample metadata handling.
//!
//! Builds the canonical sample table from raw per-sample attribute records,
//! coercing the Braak stage to an ordered category, imputing missing stages,
//! and canonicalizing brain-region labels. The table stays index-aligned
//! with the expression matrix columns for the whole run.

use crate::error::{AnalysisError, Result};
use crate::expression::ExpressionMatrix;
use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Serialize};

/// Braak pathological stage, an ordered seven-level category.
///
/// The total order is load-bearing: the trend test walks the levels in this
/// declared order and imputation targets the lowest level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BraakStage {
    Zero,
    I,
    II,
    III,
    IV,
    V,
    VI,
}

impl BraakStage {
    pub const ALL: [BraakStage; 7] = [
        BraakStage::Zero,
        BraakStage::I,
        BraakStage::II,
        BraakStage::III,
        BraakStage::IV,
        BraakStage::V,
        BraakStage::VI,
    ];

    /// Zero-based position in the stage order.
    pub fn index(self) -> usize {
        match self {
            BraakStage::Zero => 0,
            BraakStage::I => 1,
            BraakStage::II => 2,
            BraakStage::III => 3,
            BraakStage::IV => 4,
            BraakStage::V => 5,
            BraakStage::VI => 6,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BraakStage::Zero => "0",
            BraakStage::I => "I",
            BraakStage::II => "II",
            BraakStage::III => "III",
            BraakStage::IV => "IV",
            BraakStage::V => "V",
            BraakStage::VI => "VI",
        }
    }

    /// Parses a raw stage label. Accepts roman numerals and arabic digits,
    /// with or without a "braak"/"stage" prefix. Blank and NA-like labels
    /// parse to `None` and are imputed by the resolver.
    pub fn parse(raw: &str) -> Option<BraakStage> {
        let cleaned = raw.trim().to_ascii_lowercase();
        let cleaned = cleaned.strip_prefix("braak").unwrap_or(&cleaned).trim();
        let cleaned = cleaned.strip_prefix("stage").unwrap_or(cleaned).trim();
        match cleaned {
            "0" => Some(BraakStage::Zero),
            "i" | "1" => Some(BraakStage::I),
            "ii" | "2" => Some(BraakStage::II),
            "iii" | "3" => Some(BraakStage::III),
            "iv" | "4" => Some(BraakStage::IV),
            "v" | "5" => Some(BraakStage::V),
            "vi" | "6" => Some(BraakStage::VI),
            _ => None,
        }
    }
}

/// Binary disease status, derived from the stage and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiseaseStatus {
    Control,
    Disease,
}

/// One sample in the study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub region: String,
    pub stage: BraakStage,
    pub age: Option<f64>,
    pub sex: Option<String>,
    pub genotype: Option<String>,
}

impl Sample {
    /// Disease status is a pure function of the stage: recomputing it here
    /// keeps the status consistent with any stage mutation.
    pub fn status(&self) -> DiseaseStatus {
        if self.stage == BraakStage::Zero {
            DiseaseStatus::Control
        } else {
            DiseaseStatus::Disease
        }
    }
}

/// The canonical sample table, index-aligned with matrix columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleTable {
    pub samples: Vec<Sample>,
}

impl SampleTable {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Column indices of samples with the given status.
    pub fn indices_with_status(&self, status: DiseaseStatus) -> Vec<usize> {
        self.samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status() == status)
            .map(|(i, _)| i)
            .collect()
    }

    /// Column indices grouped by stage, in declared stage order.
    pub fn indices_by_stage(&self) -> [Vec<usize>; 7] {
        let mut groups: [Vec<usize>; 7] = Default::default();
        for (i, sample) in self.samples.iter().enumerate() {
            groups[sample.stage.index()].push(i);
        }
        groups
    }

    /// Returns a new table keeping only the samples at `keep`, in order.
    pub fn retain(&self, keep: &[usize]) -> SampleTable {
        SampleTable {
            samples: keep.iter().map(|&i| self.samples[i].clone()).collect(),
        }
    }

    /// Checks the 1:1 column alignment with the matrix. A mismatch means the
    /// two structures were filtered or reordered independently, which is not
    /// recoverable.
    pub fn validate_alignment(&self, matrix: &ExpressionMatrix, stage: &'static str) -> Result<()> {
        if self.len() != matrix.n_samples() {
            return Err(AnalysisError::integrity(
                stage,
                format!(
                    "sample table has {} rows but matrix has {} columns",
                    self.len(),
                    matrix.n_samples()
                ),
            ));
        }
        for (i, sample) in self.samples.iter().enumerate() {
            if sample.id != matrix.sample_names[i] {
                return Err(AnalysisError::integrity(
                    stage,
                    format!(
                        "column {} is '{}' in the matrix but '{}' in the sample table",
                        i, matrix.sample_names[i], sample.id
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Raw attribute record for one sample, as read from the metadata source.
pub type RawSampleRecord = IndexMap<String, String>;

/// Outcome of metadata resolution: the table plus the imputation count
/// carried into the run provenance.
#[derive(Debug)]
pub struct ResolvedMetadata {
    pub table: SampleTable,
    pub stages_imputed: usize,
}

const ID_KEYS: [&str; 4] = ["id", "sample", "sampleid", "sample_id"];
const STAGE_KEYS: [&str; 4] = ["stage", "braak", "braak stage", "braak_stage"];
const REGION_KEYS: [&str; 3] = ["region", "brain region", "brain_region"];
const AGE_KEYS: [&str; 2] = ["age", "age_years"];
const SEX_KEYS: [&str; 2] = ["sex", "gender"];
const GENOTYPE_KEYS: [&str; 3] = ["genotype", "apoe", "apoe_genotype"];

/// Builds the canonical sample table from raw attribute records.
///
/// Policy preserved verbatim from the study design: a sample with no stage
/// label is assigned stage 0 (Control) rather than dropped, because dropping
/// would shift downstream group sizes. A sample with no identifier is a
/// fatal integrity error.
pub fn resolve_samples(records: &[RawSampleRecord]) -> Result<ResolvedMetadata> {
    let mut samples = Vec::with_capacity(records.len());
    let mut stages_imputed = 0usize;

    for (row, record) in records.iter().enumerate() {
        let id = lookup(record, &ID_KEYS).ok_or_else(|| {
            AnalysisError::integrity(
                "metadata resolution",
                format!("record {} has no sample identifier", row),
            )
        })?;

        let stage = match lookup(record, &STAGE_KEYS).and_then(|v| BraakStage::parse(&v)) {
            Some(stage) => stage,
            None => {
                warn!(
                    "sample '{}' has no usable stage label, assigning stage 0",
                    id
                );
                stages_imputed += 1;
                BraakStage::Zero
            }
        };

        let region = lookup(record, &REGION_KEYS)
            .map(|v| canonical_region(&v))
            .unwrap_or_else(|| "unspecified".to_string());
        let age = lookup(record, &AGE_KEYS).and_then(|v| v.parse::<f64>().ok());
        let sex = lookup(record, &SEX_KEYS);
        let genotype = lookup(record, &GENOTYPE_KEYS);

        samples.push(Sample {
            id,
            region,
            stage,
            age,
            sex,
            genotype,
        });
    }

    Ok(ResolvedMetadata {
        table: SampleTable { samples },
        stages_imputed,
    })
}

/// Case-insensitive key lookup with aliasing, trimming the value. Empty
/// values count as missing.
fn lookup(record: &RawSampleRecord, keys: &[&str]) -> Option<String> {
    for (key, value) in record {
        let key = key.trim().to_ascii_lowercase();
        if keys.contains(&key.as_str()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Spelling variants of the same anatomical region collapse to one label.
const REGION_SYNONYMS: [(&str, &str); 4] = [
    ("hippocampus (ca1)", "hippocampus ca1"),
    ("ca1 hippocampus", "hippocampus ca1"),
    ("entorhinal ctx", "entorhinal cortex"),
    ("sup. frontal gyrus", "superior frontal gyrus"),
];

/// Canonicalizes a brain-region label: whitespace and case folding followed
/// by a fixed synonym table.
pub fn canonical_region(raw: &str) -> String {
    let folded = raw
        .trim()
        .to_ascii_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    for (variant, canonical) in REGION_SYNONYMS {
        if folded == variant {
            return canonical.to_string();
        }
    }
    folded
}
