//! Grid scheduler.
//!
//! Enumerates the Cartesian parameter grid, filters it, and fans the
//! surviving cells out to a bounded pool of worker threads. Workers own their
//! cell directories exclusively; the coordinator owns `aggregated/` and never
//! writes under `per_cell/`. Worker panics are contained with
//! `catch_unwind`, and a soft per-cell timeout releases the coordinator
//! without killing the worker; the orphan sweep and the next invocation
//! recover whatever state reached disk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use mc_engine::{
    load_inputs, BootstrapMode, CellKey, CellParams, GridAxes, GridCell, KernelConfig, RunConfig,
    ShuffleMode, StressInputs,
};

use crate::cell::{verify_complete, CancelToken, CellReport, CellRunner, CellStatus};
use crate::error::RunnerError;
use crate::persist::{
    atomic_write_bytes, atomic_write_json, read_json, scan_metrics, METRICS_FILE, SUMMARY_FILE,
};

pub const MANIFEST_FILE: &str = "run_manifest.json";
pub const HEARTBEAT_FILE: &str = "heartbeat.json";
pub const PROGRESS_CSV_FILE: &str = "progress.csv";
pub const GRID_SUMMARY_FILE: &str = "grid_summary.csv";
pub const DONE_FILE: &str = "DONE.txt";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

// --- Grid enumeration ---

/// Enumerate the filtered Cartesian grid.
///
/// The block-length axis only multiplies combinations whose shuffle or
/// bootstrap actually uses blocks; for every other combination a single cell
/// is emitted with the block axis pinned to zero, since varying it would
/// duplicate the same simulation under different ids.
pub fn enumerate_cells(cfg: &RunConfig) -> Vec<GridCell> {
    let axes = &cfg.axes;
    let mut cells = Vec::new();

    for (a, p_skip) in axes.p_skip.iter().enumerate() {
        for (b, slip) in axes.slip_dollars_max.iter().enumerate() {
            for (c, delay) in axes.delay_bars_max.iter().enumerate() {
                for (d, shuffle) in axes.shuffle_modes.iter().enumerate() {
                    for (e, bootstrap) in axes.bootstrap_modes.iter().enumerate() {
                        let uses_blocks = *shuffle == ShuffleMode::BlockPermute
                            || *bootstrap == BootstrapMode::BlockBootstrap;
                        let block_indices: Vec<usize> = if uses_blocks {
                            (0..axes.block_lens.len()).collect()
                        } else {
                            vec![0]
                        };

                        for f in block_indices {
                            let params = CellParams {
                                p_skip: *p_skip,
                                slip_dollars_max: *slip,
                                delay_bars_max: *delay,
                                shuffle_mode: *shuffle,
                                bootstrap_mode: *bootstrap,
                                block_len: if uses_blocks {
                                    axes.block_lens.get(f).copied().unwrap_or(0)
                                } else {
                                    0
                                },
                            };
                            if !keep_cell(cfg, &params) {
                                continue;
                            }
                            let key = CellKey {
                                p_skip_idx: a,
                                slip_idx: b,
                                delay_idx: c,
                                shuffle_idx: d,
                                bootstrap_idx: e,
                                block_len_idx: f,
                            };
                            cells.push(GridCell::new(key, params));
                        }
                    }
                }
            }
        }
    }
    cells
}

fn keep_cell(cfg: &RunConfig, params: &CellParams) -> bool {
    if let Some(fixed) = cfg.fixed_delay {
        if params.delay_bars_max != fixed {
            return false;
        }
    }
    let slip = params.slip_dollars_max;
    if slip == 0.0 {
        return cfg.include_zero_slip;
    }
    if let Some(lo) = cfg.slip_min {
        if slip < lo {
            return false;
        }
    }
    if let Some(hi) = cfg.slip_max {
        if slip > hi {
            return false;
        }
    }
    true
}

// --- Aggregated artifacts ---

/// Run configuration snapshot written once at startup.
#[derive(Debug, Serialize)]
struct RunManifest<'a> {
    run_name: &'a str,
    created_at: String,
    global_seed: u32,
    seed_stride: u32,
    n_per_cell: u32,
    checkpoint_every: u32,
    jobs: usize,
    n_cells: usize,
    /// How seeds derive, for auditability of reproductions.
    seed_scheme: &'static str,
    fixed_delay: Option<u32>,
    slip_min: Option<f64>,
    slip_max: Option<f64>,
    include_zero_slip: bool,
    axes: &'a GridAxes,
    kernel: &'a KernelConfig,
}

const SEED_SCHEME: &str = "base = (global_seed + sha256(cell_id)[0..4] as be_u32 % stride) mod 2^32; \
     sim = (base + perm_index * 1000003) mod 2^32; PRNG = ChaCha8";

/// Global progress snapshot rewritten every 30 seconds.
#[derive(Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub run_name: String,
    pub updated_at: String,
    pub cells_total: usize,
    pub cells_done: usize,
    pub cells_active: usize,
    pub cells_pending: usize,
    pub perms_done: u64,
}

/// Final state of one grid invocation.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub cells_total: usize,
    pub cells_completed: usize,
    pub cells_interrupted: usize,
    pub cells_stalled: usize,
    pub cells_failed: usize,
    pub cells_timed_out: usize,
    pub all_complete: bool,
}

enum WorkerEvent {
    Started { cell_id: String },
    Finished { cell_id: String, outcome: Result<CellReport, String> },
}

// --- Grid execution ---

/// Run the whole grid: dispatch, heartbeat, orphan sweep, aggregation.
pub fn run_grid(cfg: &RunConfig) -> Result<RunReport, RunnerError> {
    run_grid_with_cancel(cfg, CancelToken::new())
}

/// `run_grid` with an externally owned cancellation token (wired to SIGTERM
/// by the embedding binary).
pub fn run_grid_with_cancel(cfg: &RunConfig, cancel: CancelToken) -> Result<RunReport, RunnerError> {
    let inputs = Arc::new(load_inputs(&cfg.repo_path, &cfg.kernel)?);
    let cells = enumerate_cells(cfg);
    let n_tests = cells.len() as u32;

    let aggregated = cfg.aggregated_dir();
    std::fs::create_dir_all(&aggregated)?;
    std::fs::create_dir_all(cfg.out_dir().join("per_cell"))?;
    write_manifest(cfg, &aggregated, cells.len())?;

    // Cells already complete from a previous invocation are not re-dispatched.
    let mut report = RunReport {
        cells_total: cells.len(),
        ..RunReport::default()
    };
    let mut perms_done = 0u64;
    let mut pending: VecDeque<GridCell> = VecDeque::new();
    for cell in &cells {
        match verify_complete(&cfg.cell_dir(&cell.id), cfg.n_per_cell) {
            Some(_) => {
                report.cells_completed += 1;
                perms_done += cfg.n_per_cell as u64;
            }
            None => pending.push_back(cell.clone()),
        }
    }
    tracing::info!(
        "grid: {} cells, {} already complete, {} pending, {} workers",
        cells.len(),
        report.cells_completed,
        pending.len(),
        cfg.effective_jobs()
    );

    let n_pending = pending.len();
    if n_pending > 0 {
        let queue = Arc::new(Mutex::new(pending));
        let (tx, rx) = mpsc::channel::<WorkerEvent>();

        for worker_id in 0..cfg.effective_jobs().min(n_pending) {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let inputs = Arc::clone(&inputs);
            let cfg = cfg.clone();
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name(format!("cell-worker-{worker_id}"))
                .spawn(move || worker_loop(&cfg, &inputs, n_tests, &queue, &tx, &cancel))
                .map_err(RunnerError::Io)?;
        }
        drop(tx);

        coordinate(cfg, &aggregated, n_pending, &rx, &mut report, &mut perms_done, &cancel)?;
    }

    // Orphan sweep: any cell whose metrics log is complete but whose summary
    // never landed is re-finalized from the log.
    for cell in &cells {
        match crate::cell::finalize_orphan(cfg, &inputs, cell, n_tests) {
            Ok(Some(_)) => {
                report.cells_completed += 1;
                perms_done += cfg.n_per_cell as u64;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(cell = %cell.id, "orphan sweep failed: {e}"),
        }
    }

    // Recount from disk: the authoritative completion test, not the tallies.
    let complete_cells: Vec<&GridCell> = cells
        .iter()
        .filter(|c| verify_complete(&cfg.cell_dir(&c.id), cfg.n_per_cell).is_some())
        .collect();
    report.cells_completed = complete_cells.len();
    report.all_complete = complete_cells.len() == cells.len();

    write_grid_summary(cfg, &aggregated, &complete_cells)?;
    write_heartbeat(cfg, &aggregated, &report, 0, perms_done)?;

    if report.all_complete {
        let done = format!(
            "run complete: {} cells x {} permutations at {}\n",
            cells.len(),
            cfg.n_per_cell,
            chrono::Utc::now().to_rfc3339()
        );
        atomic_write_bytes(&aggregated.join(DONE_FILE), done.as_bytes())?;
        tracing::info!("all {} cells complete", cells.len());
    } else {
        tracing::info!(
            "{} of {} cells complete; re-run to resume",
            report.cells_completed,
            report.cells_total
        );
    }
    Ok(report)
}

fn worker_loop(
    cfg: &RunConfig,
    inputs: &StressInputs,
    n_tests: u32,
    queue: &Mutex<VecDeque<GridCell>>,
    tx: &mpsc::Sender<WorkerEvent>,
    cancel: &CancelToken,
) {
    loop {
        let cell = match queue.lock() {
            Ok(mut q) => q.pop_front(),
            Err(_) => None,
        };
        let Some(cell) = cell else { break };
        if cancel.is_cancelled() {
            break;
        }

        let _ = tx.send(WorkerEvent::Started {
            cell_id: cell.id.clone(),
        });

        // Panic isolation: numeric failures inside one cell must not take
        // down the pool. The cell's on-disk state stays recoverable.
        let runner = CellRunner::new(cfg, inputs, &cell, n_tests, cancel.clone());
        let outcome = match catch_unwind(AssertUnwindSafe(|| runner.run())) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                Err(format!("panic: {message}"))
            }
        };
        let _ = tx.send(WorkerEvent::Finished {
            cell_id: cell.id.clone(),
            outcome,
        });
    }
}

#[allow(clippy::too_many_arguments)]
fn coordinate(
    cfg: &RunConfig,
    aggregated: &Path,
    n_pending: usize,
    rx: &mpsc::Receiver<WorkerEvent>,
    report: &mut RunReport,
    perms_done: &mut u64,
    cancel: &CancelToken,
) -> Result<(), RunnerError> {
    let timeout = cfg.effective_cell_timeout();
    let mut active: HashMap<String, Instant> = HashMap::new();
    let mut released: HashSet<String> = HashSet::new();
    let mut settled = 0usize;
    let mut cancel_announced = false;
    let mut last_heartbeat: Option<Instant> = None;
    let mut last_progress: Option<Instant> = None;

    while settled < n_pending {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(WorkerEvent::Started { cell_id }) => {
                active.insert(cell_id, Instant::now());
            }
            Ok(WorkerEvent::Finished { cell_id, outcome }) => {
                active.remove(&cell_id);
                if !released.remove(&cell_id) {
                    settled += 1;
                }
                match outcome {
                    Ok(r) => {
                        match r.status {
                            CellStatus::Completed | CellStatus::AlreadyComplete => {
                                report.cells_completed += 1;
                                *perms_done += r.n_unique;
                            }
                            CellStatus::Interrupted => {
                                report.cells_interrupted += 1;
                                *perms_done += r.n_unique;
                            }
                            CellStatus::Stalled => report.cells_stalled += 1,
                        }
                    }
                    Err(message) => {
                        report.cells_failed += 1;
                        tracing::error!(cell = %cell_id, "worker failed: {message}");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // Soft timeouts: release the cell and move on; the worker keeps
        // going and the orphan sweep or the next invocation recovers it.
        let expired: Vec<String> = active
            .iter()
            .filter(|(id, t0)| t0.elapsed() > timeout && !released.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for cell_id in expired {
            tracing::warn!(cell = %cell_id, "cell exceeded {}s timeout; releasing", timeout.as_secs());
            released.insert(cell_id);
            report.cells_timed_out += 1;
            settled += 1;
        }

        if last_heartbeat.is_none_or(|t| t.elapsed() >= HEARTBEAT_INTERVAL) {
            last_heartbeat = Some(Instant::now());
            let _ = write_heartbeat(cfg, aggregated, report, active.len(), *perms_done);
        }
        if last_progress.is_none_or(|t| t.elapsed() >= PROGRESS_INTERVAL) {
            last_progress = Some(Instant::now());
            append_progress_line(aggregated, report, *perms_done);
        }
        if cancel.is_cancelled() && !cancel_announced {
            // Workers see the same token and checkpoint out on their own;
            // keep draining whatever they still report.
            cancel_announced = true;
            tracing::info!("cancellation requested; waiting for workers to checkpoint");
        }
    }
    Ok(())
}

fn write_manifest(cfg: &RunConfig, aggregated: &Path, n_cells: usize) -> Result<(), RunnerError> {
    let manifest = RunManifest {
        run_name: &cfg.run_name,
        created_at: chrono::Utc::now().to_rfc3339(),
        global_seed: cfg.global_seed,
        seed_stride: cfg.seed_stride,
        n_per_cell: cfg.n_per_cell,
        checkpoint_every: cfg.checkpoint_every,
        jobs: cfg.effective_jobs(),
        n_cells,
        seed_scheme: SEED_SCHEME,
        fixed_delay: cfg.fixed_delay,
        slip_min: cfg.slip_min,
        slip_max: cfg.slip_max,
        include_zero_slip: cfg.include_zero_slip,
        axes: &cfg.axes,
        kernel: &cfg.kernel,
    };
    atomic_write_json(&aggregated.join(MANIFEST_FILE), &manifest)
}

fn write_heartbeat(
    cfg: &RunConfig,
    aggregated: &Path,
    report: &RunReport,
    cells_active: usize,
    perms_done: u64,
) -> Result<(), RunnerError> {
    let heartbeat = Heartbeat {
        run_name: cfg.run_name.clone(),
        updated_at: chrono::Utc::now().to_rfc3339(),
        cells_total: report.cells_total,
        cells_done: report.cells_completed,
        cells_active,
        cells_pending: report
            .cells_total
            .saturating_sub(report.cells_completed + cells_active),
        perms_done,
    };
    atomic_write_json(&aggregated.join(HEARTBEAT_FILE), &heartbeat)
}

/// Append one status line to `aggregated/progress.csv`. Best effort.
fn append_progress_line(aggregated: &Path, report: &RunReport, perms_done: u64) {
    let path = aggregated.join(PROGRESS_CSV_FILE);
    let fresh = !path.exists();
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| {
            if fresh {
                f.write_all(b"time,cells_done,cells_total,perms_done\n")?;
            }
            f.write_all(
                format!(
                    "{},{},{},{}\n",
                    chrono::Utc::now().to_rfc3339(),
                    report.cells_completed,
                    report.cells_total,
                    perms_done
                )
                .as_bytes(),
            )
        });
    if let Err(e) = result {
        tracing::warn!("failed to append progress line: {e}");
    }
}

/// One row per completed cell: key quantiles and the robust score.
fn write_grid_summary(
    cfg: &RunConfig,
    aggregated: &Path,
    complete_cells: &[&GridCell],
) -> Result<(), RunnerError> {
    let mut out = String::from(
        "cell_id,n_perms,ret_p05,ret_p50,ret_p95,dd_p50,dd_p95,pf_p05,pf_p50,pf_p95,\
         worst_month_p05,p_value_raw,p_value_corrected,robust_score\n",
    );
    let mut rows: Vec<(String, String)> = Vec::new();
    for cell in complete_cells {
        let dir = cfg.cell_dir(&cell.id);
        let Some(s) = read_json::<mc_engine::CellSummary>(&dir.join(SUMMARY_FILE)) else {
            continue;
        };
        let line = format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
            s.cell_id,
            s.n_perms_done,
            s.total_return_pct.p05,
            s.total_return_pct.p50,
            s.total_return_pct.p95,
            s.max_drawdown_pct.p50,
            s.max_drawdown_pct.p95,
            s.profit_factor.p05,
            s.profit_factor.p50,
            s.profit_factor.p95,
            s.worst_month_pct.p05,
            s.p_value_raw,
            s.p_value_bonferroni,
            s.robust_score
        );
        rows.push((s.cell_id, line));
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, line) in rows {
        out.push_str(&line);
    }
    atomic_write_bytes(&aggregated.join(GRID_SUMMARY_FILE), out.as_bytes())
}

// --- Status mode ---

/// Print one status line per cell plus an aggregate, without producing
/// anything.
pub fn print_status(cfg: &RunConfig) -> Result<(), RunnerError> {
    let cells = enumerate_cells(cfg);
    let n_target = cfg.n_per_cell;
    let mut complete = 0usize;
    for cell in &cells {
        let dir = cfg.cell_dir(&cell.id);
        if !dir.join(METRICS_FILE).exists() {
            println!("{:<14} pending        0/{n_target}", cell.id);
            continue;
        }
        let n_unique = scan_metrics(&dir.join(METRICS_FILE))?.n_unique();
        if verify_complete(&dir, n_target).is_some() {
            complete += 1;
            println!("{:<14} complete  {n_unique:>7}/{n_target}", cell.id);
        } else {
            println!("{:<14} producing {n_unique:>7}/{n_target}", cell.id);
        }
    }
    println!(
        "{complete}/{} cells complete under {}",
        cells.len(),
        cfg.out_dir().display()
    );
    Ok(())
}
