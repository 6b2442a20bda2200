//! Readers for the tabular boundary formats.
//!
//! Three read-only inputs cross the pipeline boundary: the probe x sample
//! intensity matrix, the sample metadata table, and the collaborator-resolved
//! probe annotation table. All are plain CSV; no binary format is owned here.

use crate::error::{AnalysisError, Result};
use crate::expression::ExpressionMatrix;
use crate::metadata::RawSampleRecord;
use log::info;
use ndarray::Array2;
use std::collections::HashSet;
use std::path::Path;

/// Reads the expression matrix from CSV: first column is the probe id, the
/// header row carries sample identifiers, cells are raw intensities.
pub fn read_matrix(path: &Path) -> Result<ExpressionMatrix> {
    let mut rdr = csv::Reader::from_path(path)?;

    let headers = rdr.headers()?.clone();
    if headers.len() < 2 {
        return Err(AnalysisError::integrity(
            "matrix input",
            format!("'{}' has no sample columns", path.display()),
        ));
    }
    let sample_names: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut feature_names = Vec::new();
    let mut rows: Vec<f64> = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let probe = record
            .get(0)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                AnalysisError::integrity(
                    "matrix input",
                    format!("row {} has an empty probe identifier", line + 2),
                )
            })?;
        if record.len() != headers.len() {
            return Err(AnalysisError::integrity(
                "matrix input",
                format!(
                    "probe '{}' has {} values for {} samples",
                    probe,
                    record.len() - 1,
                    sample_names.len()
                ),
            ));
        }
        for field in record.iter().skip(1) {
            let value: f64 = field.trim().parse().map_err(|_| {
                AnalysisError::integrity(
                    "matrix input",
                    format!("probe '{}' has non-numeric intensity '{}'", probe, field),
                )
            })?;
            rows.push(value);
        }
        feature_names.push(probe.to_string());
    }

    let n_features = feature_names.len();
    let n_samples = sample_names.len();
    let values = Array2::from_shape_vec((n_features, n_samples), rows).map_err(|e| {
        AnalysisError::integrity("matrix input", format!("ragged matrix: {}", e))
    })?;

    info!(
        "read matrix of {} probes x {} samples from {}",
        n_features,
        n_samples,
        path.display()
    );
    ExpressionMatrix::new(values, feature_names, sample_names)
}

/// Reads the metadata table as raw key-value records, one per sample. Header
/// names are kept verbatim; the metadata resolver owns alias matching.
pub fn read_metadata_records(path: &Path) -> Result<Vec<RawSampleRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let headers = rdr.headers()?.clone();

    let mut records = Vec::new();
    for result in rdr.records() {
        let row = result?;
        let record: RawSampleRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        records.push(record);
    }

    info!(
        "read {} metadata records from {}",
        records.len(),
        path.display()
    );
    Ok(records)
}

/// Checks that the metadata identifiers cover every matrix column. Matrix
/// columns without metadata cannot be grouped and abort the run; extra
/// metadata rows are allowed and ignored downstream.
pub fn validate_sample_coverage(
    matrix: &ExpressionMatrix,
    records: &[RawSampleRecord],
) -> Result<()> {
    let known: HashSet<String> = records
        .iter()
        .flat_map(|r| {
            r.iter()
                .filter(|(k, _)| {
                    let k = k.trim().to_ascii_lowercase();
                    matches!(k.as_str(), "id" | "sample" | "sampleid" | "sample_id")
                })
                .map(|(_, v)| v.trim().to_string())
        })
        .collect();

    for id in &matrix.sample_names {
        if !known.contains(id) {
            return Err(AnalysisError::integrity(
                "metadata coverage",
                format!("matrix column '{}' has no metadata record", id),
            ));
        }
    }
    Ok(())
}

/// Reorders metadata records to match the matrix column order, dropping
/// records for samples absent from the matrix.
pub fn align_records_to_matrix(
    matrix: &ExpressionMatrix,
    records: Vec<RawSampleRecord>,
) -> Result<Vec<RawSampleRecord>> {
    validate_sample_coverage(matrix, &records)?;

    let mut aligned = Vec::with_capacity(matrix.n_samples());
    for id in &matrix.sample_names {
        let record = records
            .iter()
            .find(|r| {
                r.iter().any(|(k, v)| {
                    let k = k.trim().to_ascii_lowercase();
                    matches!(k.as_str(), "id" | "sample" | "sampleid" | "sample_id")
                        && v.trim() == id
                })
            })
            .cloned()
            .ok_or_else(|| {
                AnalysisError::integrity(
                    "metadata coverage",
                    format!("matrix column '{}' has no metadata record", id),
                )
            })?;
        aligned.push(record);
    }
    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(path: &Path, content: &str) {
        let mut file = File::create(path).unwrap();
        writeln!(file, "{}", content).unwrap();
    }

    #[test]
    fn test_read_matrix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.csv");
        write_file(
            &path,
            "probe,S1,S2,S3\n1007_s_at,120.5,98.2,110.0\n1053_at,45.0,50.5,48.8",
        );

        let matrix = read_matrix(&path).unwrap();
        assert_eq!(matrix.dimensions(), (2, 3));
        assert_eq!(matrix.feature_names[1], "1053_at");
        assert_relative_eq!(matrix.values[[0, 1]], 98.2);
    }

    #[test]
    fn test_read_matrix_rejects_non_numeric() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        write_file(&path, "probe,S1\n1007_s_at,abc");
        assert!(read_matrix(&path).is_err());
    }

    #[test]
    fn test_read_matrix_rejects_empty_probe_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        write_file(&path, "probe,S1\n,1.0");
        assert!(read_matrix(&path).is_err());
    }

    #[test]
    fn test_metadata_records_keep_all_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.csv");
        write_file(
            &path,
            "Sample,Braak Stage,Region,Sex\nS1,III,Entorhinal Ctx,F\nS2,,Temporal Cortex,M",
        );

        let records = read_metadata_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("Braak Stage").unwrap(), "III");
        assert_eq!(records[1].get("Sex").unwrap(), "M");
    }

    #[test]
    fn test_sample_coverage_superset_required() {
        let dir = tempdir().unwrap();
        let matrix_path = dir.path().join("matrix.csv");
        write_file(&matrix_path, "probe,S1,S2\nP1,1.0,2.0");
        let matrix = read_matrix(&matrix_path).unwrap();

        let meta_path = dir.path().join("meta.csv");
        write_file(&meta_path, "Sample,Stage\nS1,0");
        let records = read_metadata_records(&meta_path).unwrap();
        assert!(validate_sample_coverage(&matrix, &records).is_err());

        let full_path = dir.path().join("full.csv");
        write_file(&full_path, "Sample,Stage\nS2,I\nS1,0\nS3,II");
        let records = read_metadata_records(&full_path).unwrap();
        assert!(validate_sample_coverage(&matrix, &records).is_ok());

        // Extra records are dropped and order follows the matrix columns.
        let aligned = align_records_to_matrix(&matrix, records).unwrap();
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[0].get("Sample").unwrap(), "S1");
        assert_eq!(aligned[1].get("Sample").unwrap(), "S2");
    }
}
