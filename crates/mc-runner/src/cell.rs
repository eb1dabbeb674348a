//! Per-cell runner.
//!
//! Drives one grid cell through `Fresh → Resuming → Producing → Finalizing →
//! Complete`. The metrics log is the only resume authority: every run starts
//! with a dedupe pass, produces permutation indices strictly upward from
//! `max(perm_index) + 1` in checkpointed chunks, and finalizes by re-deduping
//! and writing the summary atomically. `progress.json` is advisory and never
//! read back for recovery.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mc_engine::{
    run_permutation, seeding, summarize_cell, CellSummary, DedupeStats, GridCell, MetricsRow,
    RunConfig, SimCounters, SimScratch, StressInputs,
};

use crate::error::RunnerError;
use crate::persist::{
    self, append_rows, atomic_write_json, dedupe_metrics, log_line, read_json, scan_metrics,
    METRICS_FILE, PROGRESS_FILE, SUMMARY_FILE,
};

/// Cooperative cancellation shared between the coordinator and its workers.
/// A cancelled worker finishes its current chunk, checkpoints, and returns.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal status of one cell-runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// Summary written this invocation.
    Completed,
    /// Valid summary and full metrics log already present; nothing produced.
    AlreadyComplete,
    /// Cancelled between chunks; resume picks up from the checkpoint.
    Interrupted,
    /// Persistent I/O failure; existing data left intact.
    Stalled,
}

/// What a cell-runner invocation reports back to the scheduler.
#[derive(Debug, Clone)]
pub struct CellReport {
    pub cell_id: String,
    pub status: CellStatus,
    pub n_unique: u64,
    pub n_duplicates_dropped: u64,
}

/// Advisory progress snapshot. A cache of the metrics log, regenerated from
/// it whenever they disagree; resume never reads this file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellProgress {
    pub cell_id: String,
    pub state: String,
    pub n_done: u64,
    pub n_target: u32,
    pub params: mc_engine::CellParams,
    pub started_at: String,
    pub updated_at: String,
}

pub struct CellRunner<'a> {
    cfg: &'a RunConfig,
    inputs: &'a StressInputs,
    cell: &'a GridCell,
    /// Filtered grid size, the multiple-testing denominator.
    n_tests: u32,
    cancel: CancelToken,
}

impl<'a> CellRunner<'a> {
    pub fn new(
        cfg: &'a RunConfig,
        inputs: &'a StressInputs,
        cell: &'a GridCell,
        n_tests: u32,
        cancel: CancelToken,
    ) -> Self {
        Self {
            cfg,
            inputs,
            cell,
            n_tests,
            cancel,
        }
    }

    /// Run the cell to completion, resumption point, or cancellation.
    pub fn run(&self) -> Result<CellReport, RunnerError> {
        let dir = self.cfg.cell_dir(&self.cell.id);
        persist::with_retry("create cell directory", || {
            std::fs::create_dir_all(&dir).map_err(Into::into)
        })?;

        let n_target = self.cfg.n_per_cell;
        if let Some(summary) = verify_complete(&dir, n_target) {
            return Ok(CellReport {
                cell_id: self.cell.id.clone(),
                status: CellStatus::AlreadyComplete,
                n_unique: summary.n_rows_deduped,
                n_duplicates_dropped: 0,
            });
        }

        let metrics_path = dir.join(METRICS_FILE);
        let fresh = !metrics_path.exists();
        let audit = dedupe_metrics(&metrics_path, n_target)?;
        let mut n_unique = audit.scan.n_unique();
        let mut next_idx = audit.start_idx;

        if fresh {
            tracing::info!(cell = %self.cell.id, "fresh cell, producing {n_target} permutations");
            log_line(&dir, &format!("fresh: target {n_target}"));
        } else {
            tracing::info!(
                cell = %self.cell.id,
                "resuming at {next_idx} ({n_unique} rows, {} duplicates dropped)",
                audit.scan.n_duplicates_dropped
            );
            log_line(
                &dir,
                &format!(
                    "resumed: {} rows, {} duplicates dropped, {} malformed, next index {}",
                    n_unique, audit.scan.n_duplicates_dropped, audit.scan.n_malformed, next_idx
                ),
            );
        }

        let started_at = chrono::Utc::now().to_rfc3339();
        if let Err(e) = self.write_progress(&dir, "producing", n_unique, &started_at) {
            return Ok(self.stall(&dir, n_unique, &audit, &e));
        }

        // Rows parsed and duplicates dropped across this whole invocation;
        // the finalize pass rescans a repaired file, so these are carried
        // forward into the summary's integrity fields.
        let mut session_raw = audit.scan.n_rows_raw;
        let session_dupes = audit.scan.n_duplicates_dropped;

        let base = seeding::base_seed(self.cfg.global_seed, self.cfg.seed_stride, &self.cell.id);
        let mut scratch = SimScratch::new();
        let mut counters = SimCounters::default();
        let mut chunk: Vec<MetricsRow> = Vec::with_capacity(self.cfg.checkpoint_every as usize);

        while n_unique < n_target as u64 {
            chunk.clear();
            let take = (n_target as u64 - n_unique).min(self.cfg.checkpoint_every as u64) as u32;
            for _ in 0..take {
                let seed = seeding::sim_seed(base, next_idx);
                chunk.push(run_permutation(
                    self.inputs,
                    &self.cell.params,
                    &self.cfg.kernel,
                    seed,
                    next_idx,
                    &mut scratch,
                    &mut counters,
                ));
                next_idx += 1;
            }

            let appended =
                persist::with_retry("append metrics chunk", || append_rows(&metrics_path, &chunk));
            if let Err(e) = appended {
                return Ok(self.stall(&dir, n_unique, &audit, &e));
            }
            n_unique += take as u64;
            session_raw += take as u64;

            if let Err(e) = self.write_progress(&dir, "producing", n_unique, &started_at) {
                return Ok(self.stall(&dir, n_unique, &audit, &e));
            }
            log_line(&dir, &format!("checkpoint: {n_unique}/{n_target}"));

            if self.cancel.is_cancelled() && n_unique < n_target as u64 {
                tracing::info!(cell = %self.cell.id, "interrupted at {n_unique}/{n_target}");
                log_line(&dir, &format!("interrupted at {n_unique}/{n_target}"));
                self.write_progress(&dir, "interrupted", n_unique, &started_at)?;
                return Ok(CellReport {
                    cell_id: self.cell.id.clone(),
                    status: CellStatus::Interrupted,
                    n_unique,
                    n_duplicates_dropped: audit.scan.n_duplicates_dropped,
                });
            }
        }

        self.finalize(&dir, counters, &started_at, session_raw, session_dupes)
    }

    /// Mark this invocation stalled after retries were exhausted. Data on
    /// disk is left exactly as the last successful append put it.
    fn stall(
        &self,
        dir: &Path,
        n_unique: u64,
        audit: &crate::persist::MetricsAudit,
        error: &RunnerError,
    ) -> CellReport {
        tracing::warn!(cell = %self.cell.id, "stalled: {error}");
        log_line(dir, &format!("stalled: {error}"));
        CellReport {
            cell_id: self.cell.id.clone(),
            status: CellStatus::Stalled,
            n_unique,
            n_duplicates_dropped: audit.scan.n_duplicates_dropped,
        }
    }

    /// Finalize from the authoritative metrics log: re-dedupe, audit the
    /// exact-count invariant, and write the summary atomically.
    /// `session_raw`/`session_dupes` fold the resume-pass numbers into the
    /// integrity fields; the orphan path passes zeros and relies on its own
    /// scan of the (possibly corrupt) log.
    fn finalize(
        &self,
        dir: &Path,
        counters: SimCounters,
        started_at: &str,
        session_raw: u64,
        session_dupes: u64,
    ) -> Result<CellReport, RunnerError> {
        let n_target = self.cfg.n_per_cell;
        let metrics_path = dir.join(METRICS_FILE);
        let audit = dedupe_metrics(&metrics_path, n_target)?;

        if audit.scan.n_unique() != n_target as u64 {
            log_line(
                dir,
                &format!(
                    "integrity violation: {} unique rows, target {}",
                    audit.scan.n_unique(),
                    n_target
                ),
            );
            return Err(RunnerError::Integrity {
                cell_id: self.cell.id.clone(),
                expected: n_target,
                actual: audit.scan.n_unique(),
            });
        }

        let summary = summarize_cell(
            &self.cell.id,
            &self.cell.params,
            &audit.scan.rows,
            DedupeStats {
                n_rows_raw: session_raw.max(audit.scan.n_rows_raw),
                n_duplicates_dropped: session_dupes + audit.scan.n_duplicates_dropped,
                n_rows_deduped: audit.scan.n_unique(),
            },
            counters,
            self.inputs.baseline.baseline_pf,
            self.n_tests,
        );
        persist::with_retry("write summary", || {
            atomic_write_json(&dir.join(SUMMARY_FILE), &summary)
        })?;
        self.write_progress(dir, "complete", audit.scan.n_unique(), started_at)?;
        log_line(dir, "finalized");
        tracing::info!(cell = %self.cell.id, "complete");

        Ok(CellReport {
            cell_id: self.cell.id.clone(),
            status: CellStatus::Completed,
            n_unique: audit.scan.n_unique(),
            n_duplicates_dropped: audit.scan.n_duplicates_dropped,
        })
    }

    fn write_progress(
        &self,
        dir: &Path,
        state: &str,
        n_done: u64,
        started_at: &str,
    ) -> Result<(), RunnerError> {
        let progress = CellProgress {
            cell_id: self.cell.id.clone(),
            state: state.to_string(),
            n_done,
            n_target: self.cfg.n_per_cell,
            params: self.cell.params.clone(),
            started_at: started_at.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        persist::with_retry("write progress", || {
            atomic_write_json(&dir.join(PROGRESS_FILE), &progress)
        })
    }
}

/// A cell is complete when its summary is valid for the target count *and*
/// the metrics log holds exactly that many rows in canonical form. A log
/// carrying duplicates or a partial trailing line fails this check, which
/// routes the cell back through the dedupe pass.
pub fn verify_complete(dir: &Path, n_target: u32) -> Option<CellSummary> {
    let summary: CellSummary = read_json(&dir.join(SUMMARY_FILE))?;
    if summary.n_rows_deduped != n_target as u64 || summary.n_perms_done != n_target {
        return None;
    }
    let scan = scan_metrics(&dir.join(METRICS_FILE)).ok()?;
    if scan.n_unique() != n_target as u64
        || scan.n_rows_raw != n_target as u64
        || scan.n_malformed != 0
        || !scan.ends_clean
    {
        return None;
    }
    Some(summary)
}

/// Re-finalize a cell whose metrics log is complete but whose summary is
/// missing or invalid (a worker crashed between the last append and the
/// summary rename). Per-session anomaly counters died with that worker, so
/// the regenerated summary carries zeros there; every other field comes from
/// the authoritative log.
pub fn finalize_orphan(
    cfg: &RunConfig,
    inputs: &StressInputs,
    cell: &GridCell,
    n_tests: u32,
) -> Result<Option<CellReport>, RunnerError> {
    let dir = cfg.cell_dir(&cell.id);
    let metrics_path = dir.join(METRICS_FILE);
    if !metrics_path.exists() {
        return Ok(None);
    }
    if verify_complete(&dir, cfg.n_per_cell).is_some() {
        return Ok(None);
    }
    let scan = scan_metrics(&metrics_path)?;
    if scan.n_unique() != cfg.n_per_cell as u64 {
        return Ok(None);
    }

    tracing::info!(cell = %cell.id, "orphan sweep: regenerating summary");
    log_line(&dir, "orphan sweep: regenerating summary");
    let runner = CellRunner::new(cfg, inputs, cell, n_tests, CancelToken::new());
    let started_at = chrono::Utc::now().to_rfc3339();
    runner
        .finalize(&dir, SimCounters::default(), &started_at, 0, 0)
        .map(Some)
}
