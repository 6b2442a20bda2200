//! Error taxonomy for the analysis pipeline.
//!
//! Only conditions that abort the run are modeled as error variants. Probes
//! that fail annotation and genes that are statistically degenerate are
//! recovered locally, counted in the run provenance, and never surface here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// An input invariant was violated (non-positive intensity, misaligned
    /// sample identifiers, duplicate identifiers). Always fatal; the stage
    /// and offending record are named in the message.
    #[error("input integrity violation in {stage}: {detail}")]
    InputIntegrity { stage: &'static str, detail: String },

    /// An external collaborator (annotation or enrichment service) kept
    /// failing after the retry budget was exhausted.
    #[error("{service} service failed after {attempts} attempts: {detail}")]
    ExternalService {
        service: &'static str,
        attempts: u32,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl AnalysisError {
    /// Shorthand for the pervasive integrity-violation case.
    pub fn integrity(stage: &'static str, detail: impl Into<String>) -> Self {
        AnalysisError::InputIntegrity {
            stage,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
