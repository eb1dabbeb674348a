//! Per-cell summary statistics.
//!
//! Reduces a cell's metrics rows to the distributional summary persisted in
//! `summary.json`: quantiles, moments, a permutation-test p-value against the
//! baseline profit factor, multiple-testing corrections, and the robust
//! score used for ranking.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::{CellParams, MetricsRow, SimCounters};

/// Distribution summary of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub p05: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub mean: f64,
    pub std: f64,
}

/// Final per-cell statistics, including the integrity fields the resume
/// protocol audits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellSummary {
    pub cell_id: String,
    pub params: CellParams,
    pub n_perms_done: u32,
    pub n_rows_raw: u64,
    pub n_duplicates_dropped: u64,
    pub n_rows_deduped: u64,
    pub total_return_pct: MetricSummary,
    pub max_drawdown_pct: MetricSummary,
    pub profit_factor: MetricSummary,
    pub worst_month_pct: MetricSummary,
    pub trades_executed: MetricSummary,
    /// Permutation-test p-value: share of simulations whose profit factor
    /// reaches the baseline (add-one smoothed).
    pub p_value_raw: f64,
    /// Bonferroni correction over the filtered grid.
    pub p_value_bonferroni: f64,
    /// Benjamini-Hochberg form at rank 1 (equals Bonferroni for one test;
    /// kept separate so the analysis stage can re-rank across cells).
    pub p_value_bh: f64,
    /// Normal-approximation p-value that the mean total return is positive.
    pub p_value_mean_return: f64,
    pub robust_score: f64,
    pub degenerate_count: u64,
    pub sentinel_count: u64,
    pub finished_at: String,
}

/// Integrity numbers carried from the dedupe pass into the summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupeStats {
    pub n_rows_raw: u64,
    pub n_duplicates_dropped: u64,
    pub n_rows_deduped: u64,
}

/// Reduce a cell's (deduped, sorted) rows to its summary.
///
/// `baseline_pf` defaults to break-even (1.0) when no step-1 report was
/// available; `n_tests` is the filtered grid size used for the corrections.
#[allow(clippy::too_many_arguments)]
pub fn summarize_cell(
    cell_id: &str,
    params: &CellParams,
    rows: &[MetricsRow],
    dedupe: DedupeStats,
    counters: SimCounters,
    baseline_pf: Option<f64>,
    n_tests: u32,
) -> CellSummary {
    let total_return = summarize_metric(rows.iter().map(|r| r.total_return_pct));
    let max_drawdown = summarize_metric(rows.iter().map(|r| r.max_drawdown_pct));
    let profit_factor = summarize_metric(rows.iter().map(|r| r.profit_factor));
    let worst_month = summarize_metric(rows.iter().map(|r| r.worst_month_pct));
    let trades = summarize_metric(rows.iter().map(|r| r.trades_executed as f64));

    let threshold = baseline_pf.unwrap_or(1.0);
    let p_value_raw = permutation_p_value(rows.iter().map(|r| r.profit_factor), threshold);
    let p_value_bonferroni = correct_p(p_value_raw, n_tests);
    let p_value_bh = correct_p(p_value_raw, n_tests);
    let p_value_mean_return = mean_positive_p_value(&total_return, rows.len());

    let robust_score = profit_factor.p50 * (1.0 - p_value_bonferroni);

    CellSummary {
        cell_id: cell_id.to_string(),
        params: params.clone(),
        n_perms_done: rows.len() as u32,
        n_rows_raw: dedupe.n_rows_raw,
        n_duplicates_dropped: dedupe.n_duplicates_dropped,
        n_rows_deduped: dedupe.n_rows_deduped,
        total_return_pct: total_return,
        max_drawdown_pct: max_drawdown,
        profit_factor,
        worst_month_pct: worst_month,
        trades_executed: trades,
        p_value_raw,
        p_value_bonferroni,
        p_value_bh,
        p_value_mean_return,
        robust_score,
        degenerate_count: counters.degenerate,
        sentinel_count: counters.sentinel,
        finished_at: chrono::Utc::now().to_rfc3339(),
    }
}

fn summarize_metric(values: impl Iterator<Item = f64>) -> MetricSummary {
    let mut sorted: Vec<f64> = values.collect();
    sorted.par_sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    if n == 0 {
        return MetricSummary {
            p05: 0.0,
            p25: 0.0,
            p50: 0.0,
            p75: 0.0,
            p95: 0.0,
            mean: 0.0,
            std: 0.0,
        };
    }

    let mean = sorted.iter().sum::<f64>() / n as f64;
    let var = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0).max(1.0);

    MetricSummary {
        p05: percentile_sorted(&sorted, 5.0),
        p25: percentile_sorted(&sorted, 25.0),
        p50: percentile_sorted(&sorted, 50.0),
        p75: percentile_sorted(&sorted, 75.0),
        p95: percentile_sorted(&sorted, 95.0),
        mean,
        std: var.sqrt(),
    }
}

/// Add-one smoothed permutation p-value: `(1 + #{x ≥ threshold}) / (n + 1)`.
fn permutation_p_value(values: impl Iterator<Item = f64>, threshold: f64) -> f64 {
    let mut n = 0u64;
    let mut hits = 0u64;
    for v in values {
        n += 1;
        if v >= threshold {
            hits += 1;
        }
    }
    if n == 0 {
        return 1.0;
    }
    (hits + 1) as f64 / (n + 1) as f64
}

/// Multiply by the number of tests and clamp to 1 (Bonferroni; also the BH
/// adjustment at rank 1).
fn correct_p(raw: f64, n_tests: u32) -> f64 {
    (raw * n_tests.max(1) as f64).min(1.0)
}

/// Two-sided-free z-test that the mean total return exceeds zero, using the
/// normal CDF. Reported for the analysis stage; 1.0 when undefined.
fn mean_positive_p_value(summary: &MetricSummary, n: usize) -> f64 {
    use statrs::distribution::{ContinuousCDF, Normal};
    if n < 3 || summary.std <= 1e-12 {
        return if summary.mean > 0.0 && n > 0 { 0.0 } else { 1.0 };
    }
    let se = summary.std / (n as f64).sqrt();
    let z = summary.mean / se;
    let normal = match Normal::new(0.0, 1.0) {
        Ok(d) => d,
        Err(_) => return 1.0,
    };
    1.0 - normal.cdf(z)
}

/// Percentile of a sorted slice (nearest-rank with rounding).
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BootstrapMode, ShuffleMode};

    fn row(perm: u32, ret: f64, pf: f64) -> MetricsRow {
        MetricsRow {
            perm_index: perm,
            total_return_pct: ret,
            max_drawdown_pct: 0.1,
            profit_factor: pf,
            worst_month_pct: -0.02,
            trades_executed: 50,
        }
    }

    fn params() -> CellParams {
        CellParams {
            p_skip: 0.05,
            slip_dollars_max: 10.0,
            delay_bars_max: 0,
            shuffle_mode: ShuffleMode::None,
            bootstrap_mode: BootstrapMode::None,
            block_len: 0,
        }
    }

    #[test]
    fn percentiles_of_known_distribution() {
        let sorted: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile_sorted(&sorted, 50.0), 51.0);
        assert_eq!(percentile_sorted(&sorted, 0.0), 1.0);
        assert_eq!(percentile_sorted(&sorted, 100.0), 100.0);
        assert!(percentile_sorted(&sorted, 5.0) <= 7.0);
    }

    #[test]
    fn p_value_counts_threshold_hits() {
        // 3 of 9 values reach 2.0 → (3+1)/(9+1).
        let values = [1.0, 1.5, 2.0, 2.5, 3.0, 0.5, 0.1, 1.9, 1.99];
        let p = permutation_p_value(values.iter().copied(), 2.0);
        assert!((p - 0.4).abs() < 1e-12);
    }

    #[test]
    fn bonferroni_clamps_to_one() {
        assert_eq!(correct_p(0.2, 10), 1.0);
        assert!((correct_p(0.01, 10) - 0.1).abs() < 1e-12);
        assert_eq!(correct_p(0.3, 0), 0.3);
    }

    #[test]
    fn summary_carries_integrity_fields() {
        let rows: Vec<MetricsRow> = (0..100).map(|i| row(i, 0.1, 1.5)).collect();
        let dedupe = DedupeStats {
            n_rows_raw: 103,
            n_duplicates_dropped: 3,
            n_rows_deduped: 100,
        };
        let s = summarize_cell(
            "0_0_0_0_0",
            &params(),
            &rows,
            dedupe,
            SimCounters::default(),
            Some(1.2),
            48,
        );
        assert_eq!(s.n_perms_done, 100);
        assert_eq!(s.n_rows_raw, 103);
        assert_eq!(s.n_duplicates_dropped, 3);
        assert_eq!(s.n_rows_deduped, 100);
        // Every PF is 1.5 ≥ baseline 1.2 → raw p ≈ 1, corrected clamps to 1,
        // robust score collapses to 0.
        assert!(s.p_value_raw > 0.99);
        assert_eq!(s.p_value_bonferroni, 1.0);
        assert_eq!(s.robust_score, 0.0);
        assert_eq!(s.profit_factor.p50, 1.5);
    }

    #[test]
    fn constant_distribution_has_zero_std() {
        let rows: Vec<MetricsRow> = (0..50).map(|i| row(i, 0.25, 2.0)).collect();
        let s = summarize_metric(rows.iter().map(|r| r.total_return_pct));
        assert_eq!(s.p05, 0.25);
        assert_eq!(s.p95, 0.25);
        assert_eq!(s.mean, 0.25);
        assert_eq!(s.std, 0.0);
    }
}
