//! Multiple-testing correction shared by both testers.
//!
//! Benjamini-Hochberg step-up adjustment over one family of tests. Skipped
//! (degenerate) tests enter as `None`, stay `None`, and do not count toward
//! the family size.

use std::cmp::Ordering;

/// Adjusts raw p-values with the Benjamini-Hochberg procedure.
///
/// Returns one adjusted value per input, `None` where the input was `None`.
/// Adjusted values are monotone in the raw ordering and capped at 1.0, with
/// each adjusted value >= its raw value.
pub fn benjamini_hochberg(p_values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut indexed: Vec<(usize, f64)> = p_values
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.map(|p| (i, p)))
        .collect();
    let m = indexed.len();

    let mut adjusted: Vec<Option<f64>> = vec![None; p_values.len()];
    if m == 0 {
        return adjusted;
    }

    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    // Walk from the largest p-value down, enforcing monotonicity.
    let mut running_min = 1.0f64;
    for (rank, &(original, p)) in indexed.iter().enumerate().rev() {
        let candidate = (p * m as f64 / (rank + 1) as f64).min(1.0);
        running_min = running_min.min(candidate);
        adjusted[original] = Some(running_min);
    }

    adjusted
}
