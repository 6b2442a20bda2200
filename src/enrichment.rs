//! Gene-set enrichment hand-off.
//!
//! Enrichment scoring against curated pathway databases happens in an
//! external collaborator; the pipeline only sends a gene list and receives
//! term/p-value/count records back. The call is a fallible network
//! operation with the same retry discipline as annotation: exhausted
//! retries abort the run, because a silently missing enrichment table would
//! corrupt downstream biological interpretation.

use crate::error::{AnalysisError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One enriched term as returned by the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub term: String,
    pub p_value: f64,
    pub gene_count: usize,
}

/// Capability interface over the external enrichment collaborator.
pub trait EnrichmentClient {
    fn enrich(&self, genes: &[String]) -> Result<Vec<EnrichmentRecord>>;
}

/// Decorator adding bounded retries with exponential backoff around any
/// enrichment client.
pub struct RetryingClient<C> {
    inner: C,
    max_attempts: u32,
    base_backoff: Duration,
}

impl<C: EnrichmentClient> RetryingClient<C> {
    pub fn new(inner: C, max_attempts: u32, base_backoff: Duration) -> Self {
        RetryingClient {
            inner,
            max_attempts,
            base_backoff,
        }
    }
}

impl<C: EnrichmentClient> EnrichmentClient for RetryingClient<C> {
    fn enrich(&self, genes: &[String]) -> Result<Vec<EnrichmentRecord>> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.inner.enrich(genes) {
                Ok(records) => return Ok(records),
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "enrichment attempt {}/{} failed: {}",
                        attempt, self.max_attempts, last_error
                    );
                    if attempt < self.max_attempts {
                        std::thread::sleep(self.base_backoff * 2u32.pow(attempt - 1));
                    }
                }
            }
        }
        Err(AnalysisError::ExternalService {
            service: "enrichment",
            attempts: self.max_attempts,
            detail: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl EnrichmentClient for FlakyClient {
        fn enrich(&self, genes: &[String]) -> Result<Vec<EnrichmentRecord>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(AnalysisError::ExternalService {
                    service: "enrichment",
                    attempts: 1,
                    detail: "gateway timeout".to_string(),
                });
            }
            Ok(vec![EnrichmentRecord {
                term: "GO:0006915 apoptotic process".to_string(),
                p_value: 0.003,
                gene_count: genes.len(),
            }])
        }
    }

    #[test]
    fn test_recovers_from_transient_failure() {
        let client = RetryingClient::new(
            FlakyClient {
                failures_before_success: 1,
                calls: AtomicU32::new(0),
            },
            3,
            Duration::from_millis(1),
        );
        let records = client.enrich(&["APOE".to_string(), "TREM2".to_string()]).unwrap();
        assert_eq!(records[0].gene_count, 2);
    }

    #[test]
    fn test_exhausted_retries_abort() {
        let client = RetryingClient::new(
            FlakyClient {
                failures_before_success: 5,
                calls: AtomicU32::new(0),
            },
            2,
            Duration::from_millis(1),
        );
        let result = client.enrich(&["APOE".to_string()]);
        assert!(matches!(
            result,
            Err(AnalysisError::ExternalService { attempts: 2, .. })
        ));
    }
}
