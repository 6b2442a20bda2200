//! Result tables written at the end of a run.
//!
//! All outputs are plain tabular records for downstream reporting and
//! enrichment collaborators: the differential table (top-N by absolute
//! effect size), the trend table (significant genes only), the overlap
//! table, per-direction gene lists, and the run provenance as JSON.

use crate::enrichment::EnrichmentClient;
use crate::error::Result;
use crate::overlap::merged_direction_list;
use crate::pipeline::AnalysisOutput;
use crate::stats::Direction;
use itertools::Itertools;
use log::info;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Writes every output table into `dir`, creating it if needed. When an
/// enrichment client is configured, the per-direction gene lists are also
/// sent to it and the returned term tables written alongside; an enrichment
/// failure after retries aborts the run rather than leaving the biological
/// interpretation tables silently incomplete.
pub fn write_all(
    dir: &Path,
    output: &AnalysisOutput,
    top_n: usize,
    enrichment: Option<&dyn EnrichmentClient>,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_differential_table(&dir.join("differential_results.csv"), output, top_n)?;
    write_trend_table(&dir.join("trend_results.csv"), output)?;
    write_overlap_table(&dir.join("overlap_summary.csv"), output)?;
    write_gene_lists(dir, output)?;
    write_provenance(&dir.join("provenance.json"), output)?;
    if let Some(client) = enrichment {
        write_enrichment_tables(dir, output, client)?;
    }
    info!("wrote result tables to {}", dir.display());
    Ok(())
}

/// Differential table: one row per tested gene, sorted by absolute log2
/// fold change descending, truncated to the top-N report size. Degenerate
/// genes carry empty statistic fields and sort last.
fn write_differential_table(path: &Path, output: &AnalysisOutput, top_n: usize) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "gene",
        "log2_fold_change",
        "p_value",
        "p_adjusted",
        "direction",
        "significant",
    ])?;

    let ranked = output
        .differential
        .iter()
        .sorted_by(|a, b| {
            let ka = a.log2_fold_change.map(f64::abs).unwrap_or(f64::NEG_INFINITY);
            let kb = b.log2_fold_change.map(f64::abs).unwrap_or(f64::NEG_INFINITY);
            kb.partial_cmp(&ka)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.gene.cmp(&b.gene))
        })
        .take(top_n);

    for r in ranked {
        wtr.write_record([
            r.gene.clone(),
            fmt_opt(r.log2_fold_change),
            fmt_opt(r.p_value),
            fmt_opt(r.p_adjusted),
            r.direction.label().to_string(),
            r.significant.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Trend table: restricted to genes under the trend threshold.
fn write_trend_table(path: &Path, output: &AnalysisOutput) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["gene", "p_adjusted", "direction"])?;
    for r in output.trend.iter().filter(|r| r.significant) {
        wtr.write_record([
            r.gene.clone(),
            fmt_opt(r.p_adjusted),
            r.direction.label().to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_overlap_table(path: &Path, output: &AnalysisOutput) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "direction",
        "differential_count",
        "trend_count",
        "intersection",
        "percent_of_smaller",
    ])?;
    for s in &output.overlap {
        wtr.write_record([
            s.direction.label().to_string(),
            s.differential_count.to_string(),
            s.trend_count.to_string(),
            s.intersection.to_string(),
            format!("{:.2}", s.percent_of_smaller),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Per-direction gene lists, one symbol per line, as handed to the
/// enrichment collaborator.
fn write_gene_lists(dir: &Path, output: &AnalysisOutput) -> Result<()> {
    for (direction, name) in [
        (Direction::Up, "genes_up.txt"),
        (Direction::Down, "genes_down.txt"),
    ] {
        let genes = merged_direction_list(&output.gene_sets, direction);
        let mut file = fs::File::create(dir.join(name))?;
        for gene in genes {
            writeln!(file, "{}", gene)?;
        }
    }
    Ok(())
}

/// Sends each direction's gene list to the enrichment collaborator and
/// writes the term/p-value/count records it returns.
fn write_enrichment_tables(
    dir: &Path,
    output: &AnalysisOutput,
    client: &dyn EnrichmentClient,
) -> Result<()> {
    for (direction, name) in [
        (Direction::Up, "enrichment_up.csv"),
        (Direction::Down, "enrichment_down.csv"),
    ] {
        let genes = merged_direction_list(&output.gene_sets, direction);
        let records = client.enrich(&genes)?;
        let mut wtr = csv::Writer::from_path(dir.join(name))?;
        wtr.write_record(["term", "p_value", "gene_count"])?;
        for r in &records {
            wtr.write_record([
                r.term.clone(),
                format!("{:.6e}", r.p_value),
                r.gene_count.to_string(),
            ])?;
        }
        wtr.flush()?;
    }
    Ok(())
}

fn write_provenance(path: &Path, output: &AnalysisOutput) -> Result<()> {
    let json = serde_json::to_string_pretty(&output.provenance)
        .expect("provenance serializes to JSON");
    fs::write(path, json)?;
    Ok(())
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{:.6e}", v)).unwrap_or_default()
}
