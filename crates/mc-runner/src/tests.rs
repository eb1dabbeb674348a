use std::fs;
use std::path::Path;

use mc_engine::{load_inputs, GridCell, RunConfig, StressInputs};

use crate::cell::{finalize_orphan, verify_complete, CancelToken, CellRunner, CellStatus};
use crate::persist::{append_rows, scan_metrics, METRICS_FILE, SUMMARY_FILE};
use crate::scheduler::{
    enumerate_cells, print_status, run_grid, DONE_FILE, GRID_SUMMARY_FILE, HEARTBEAT_FILE,
    MANIFEST_FILE,
};

/// Helper: write a 40-trade input set (+10 PnL each) under `repo`.
fn write_sample_inputs(repo: &Path) {
    let n = 40usize;
    let step = 6 * 3600i64;
    let iso = |ts: i64| {
        chrono::DateTime::from_timestamp(ts, 0)
            .unwrap()
            .to_rfc3339()
    };

    let mut trades = String::from("entry_time,exit_time,entry_price,exit_price,pnl,qty,side\n");
    let mut equity = String::from("time,equity\n");
    equity.push_str(&format!("{},10000\n", iso(0)));
    for i in 0..n {
        let entry = (2 * i as i64 + 1) * step;
        let exit = (2 * i as i64 + 2) * step;
        trades.push_str(&format!(
            "{},{},100,110,10,1,long\n",
            iso(entry),
            iso(exit)
        ));
        equity.push_str(&format!("{},{}\n", iso(exit + step / 2), 10_000 + 10 * (i + 1)));
    }
    fs::write(repo.join("trade_list.csv"), trades).unwrap();
    fs::write(repo.join("equity_curve.csv"), equity).unwrap();
    fs::write(repo.join("step1_report.txt"), "Profit Factor: 1.50\n").unwrap();
}

/// Helper: a single-cell configuration over the sample inputs.
fn single_cell_config(repo: &Path, run_name: &str) -> RunConfig {
    let mut cfg = RunConfig::new(repo, run_name);
    cfg.n_per_cell = 200;
    cfg.checkpoint_every = 50;
    cfg.jobs = 1;
    cfg.axes.p_skip = vec![0.05];
    cfg.axes.slip_dollars_max = vec![50.0];
    cfg.axes.delay_bars_max = vec![0];
    cfg.axes.shuffle_modes = vec![mc_engine::ShuffleMode::None];
    cfg.axes.bootstrap_modes = vec![mc_engine::BootstrapMode::None];
    cfg.kernel.min_trades = 30;
    cfg
}

fn load_for(cfg: &RunConfig) -> StressInputs {
    load_inputs(&cfg.repo_path, &cfg.kernel).unwrap()
}

fn the_cell(cfg: &RunConfig) -> GridCell {
    let cells = enumerate_cells(cfg);
    assert_eq!(cells.len(), 1);
    cells.into_iter().next().unwrap()
}

fn run_cell(cfg: &RunConfig, inputs: &StressInputs, cancel: CancelToken) -> CellStatus {
    let cell = the_cell(cfg);
    let runner = CellRunner::new(cfg, inputs, &cell, 1, cancel);
    runner.run().unwrap().status
}

// =============================================================================
// Test: a fresh cell runs to completion with the exact-set invariant
// =============================================================================

#[test]
fn test_cell_runs_to_completion() {
    let repo = tempfile::tempdir().unwrap();
    write_sample_inputs(repo.path());
    let cfg = single_cell_config(repo.path(), "complete");
    let inputs = load_for(&cfg);

    let status = run_cell(&cfg, &inputs, CancelToken::new());
    assert_eq!(status, CellStatus::Completed);

    let cell = the_cell(&cfg);
    let dir = cfg.cell_dir(&cell.id);
    let scan = scan_metrics(&dir.join(METRICS_FILE)).unwrap();
    assert_eq!(scan.n_unique(), 200);
    let indices: Vec<u32> = scan.rows.iter().map(|r| r.perm_index).collect();
    assert_eq!(indices, (0..200).collect::<Vec<u32>>());

    let summary = verify_complete(&dir, 200).expect("cell should verify complete");
    assert_eq!(summary.n_perms_done, 200);
    assert_eq!(summary.n_rows_deduped, 200);
    // Baseline PF came from the step-1 report.
    assert!(summary.p_value_raw > 0.0 && summary.p_value_raw <= 1.0);

    // A second invocation is a no-op.
    assert_eq!(
        run_cell(&cfg, &inputs, CancelToken::new()),
        CellStatus::AlreadyComplete
    );
}

// =============================================================================
// Scenario 3: interrupt after 137 rows, resume, and match a clean run
// =============================================================================

#[test]
fn test_interrupted_resume_matches_clean_run() {
    let clean_repo = tempfile::tempdir().unwrap();
    let crash_repo = tempfile::tempdir().unwrap();
    write_sample_inputs(clean_repo.path());
    write_sample_inputs(crash_repo.path());

    // Clean reference run.
    let clean_cfg = single_cell_config(clean_repo.path(), "reference");
    let clean_inputs = load_for(&clean_cfg);
    assert_eq!(
        run_cell(&clean_cfg, &clean_inputs, CancelToken::new()),
        CellStatus::Completed
    );

    // Interrupted run: the token is already tripped, so the worker finishes
    // exactly one 137-row chunk, checkpoints, and exits.
    let mut crash_cfg = single_cell_config(crash_repo.path(), "crashed");
    crash_cfg.checkpoint_every = 137;
    let crash_inputs = load_for(&crash_cfg);
    let cancel = CancelToken::new();
    cancel.cancel();
    assert_eq!(
        run_cell(&crash_cfg, &crash_inputs, cancel),
        CellStatus::Interrupted
    );

    let cell = the_cell(&crash_cfg);
    let crashed_path = crash_cfg.cell_dir(&cell.id).join(METRICS_FILE);
    assert_eq!(scan_metrics(&crashed_path).unwrap().n_unique(), 137);

    // Resume with a different chunk size; content must not depend on it.
    crash_cfg.checkpoint_every = 50;
    assert_eq!(
        run_cell(&crash_cfg, &crash_inputs, CancelToken::new()),
        CellStatus::Completed
    );

    let clean_path = clean_cfg.cell_dir(&cell.id).join(METRICS_FILE);
    assert_eq!(
        fs::read(&clean_path).unwrap(),
        fs::read(&crashed_path).unwrap(),
        "resumed metrics log differs from the clean run"
    );
}

// =============================================================================
// Round trip: truncating the tail of the log and re-running restores it
// =============================================================================

#[test]
fn test_truncated_log_rebuilds_identically() {
    let repo = tempfile::tempdir().unwrap();
    write_sample_inputs(repo.path());
    let cfg = single_cell_config(repo.path(), "truncated");
    let inputs = load_for(&cfg);
    assert_eq!(run_cell(&cfg, &inputs, CancelToken::new()), CellStatus::Completed);

    let cell = the_cell(&cfg);
    let path = cfg.cell_dir(&cell.id).join(METRICS_FILE);
    let original = fs::read_to_string(&path).unwrap();

    // Drop the final 63 rows.
    let kept: String = original
        .lines()
        .take(137)
        .map(|l| format!("{l}\n"))
        .collect();
    fs::write(&path, kept).unwrap();

    assert_eq!(run_cell(&cfg, &inputs, CancelToken::new()), CellStatus::Completed);
    assert_eq!(fs::read_to_string(&path).unwrap(), original);
}

// =============================================================================
// Scenario 6: duplicates plus a partial trailing line are repaired in place
// =============================================================================

#[test]
fn test_dedupe_under_corruption() {
    let repo = tempfile::tempdir().unwrap();
    write_sample_inputs(repo.path());
    let cfg = single_cell_config(repo.path(), "corrupted");
    let inputs = load_for(&cfg);
    assert_eq!(run_cell(&cfg, &inputs, CancelToken::new()), CellStatus::Completed);

    let cell = the_cell(&cfg);
    let path = cfg.cell_dir(&cell.id).join(METRICS_FILE);
    let clean_bytes = fs::read(&path).unwrap();

    // Re-append 50 existing rows and a crash-truncated line.
    let scan = scan_metrics(&path).unwrap();
    append_rows(&path, &scan.rows[25..75]).unwrap();
    let mut raw = fs::read(&path).unwrap();
    raw.extend_from_slice(b"137,0.0");
    fs::write(&path, raw).unwrap();

    assert_eq!(run_cell(&cfg, &inputs, CancelToken::new()), CellStatus::Completed);

    assert_eq!(fs::read(&path).unwrap(), clean_bytes);
    let summary = verify_complete(&cfg.cell_dir(&cell.id), 200).unwrap();
    assert_eq!(summary.n_duplicates_dropped, 50);
    assert_eq!(summary.n_rows_deduped, 200);
}

// =============================================================================
// Round trip: deleting summary.json regenerates it from the metrics log
// =============================================================================

#[test]
fn test_summary_regenerates_identically() {
    let repo = tempfile::tempdir().unwrap();
    write_sample_inputs(repo.path());
    let cfg = single_cell_config(repo.path(), "resummarize");
    let inputs = load_for(&cfg);
    assert_eq!(run_cell(&cfg, &inputs, CancelToken::new()), CellStatus::Completed);

    let cell = the_cell(&cfg);
    let summary_path = cfg.cell_dir(&cell.id).join(SUMMARY_FILE);
    let mut before: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&summary_path).unwrap()).unwrap();
    fs::remove_file(&summary_path).unwrap();

    // The orphan path rebuilds the summary from the log alone.
    let report = finalize_orphan(&cfg, &inputs, &cell, 1).unwrap().unwrap();
    assert_eq!(report.status, CellStatus::Completed);

    let mut after: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&summary_path).unwrap()).unwrap();
    // Byte equality holds up to timestamps and the per-session counters the
    // crashed worker took with it.
    for doc in [&mut before, &mut after] {
        doc.as_object_mut().unwrap().remove("finished_at");
        doc.as_object_mut().unwrap().remove("degenerate_count");
        doc.as_object_mut().unwrap().remove("sentinel_count");
    }
    assert_eq!(before, after);
}

// =============================================================================
// Grid enumeration and filters
// =============================================================================

#[test]
fn test_enumerate_default_grid_size() {
    let cfg = RunConfig::new("/tmp/x", "grid");
    let cells = enumerate_cells(&cfg);
    // 4 p_skip × 4 slip × 4 delay = 64 base combos; 4 mode pairs without
    // blocks plus 5 with blocks × 3 block lengths = 19 per base combo.
    assert_eq!(cells.len(), 64 * 19);

    // Cell ids carry the block index only when blocks are in play.
    assert!(cells.iter().any(|c| c.id.matches('_').count() == 4));
    assert!(cells.iter().any(|c| c.id.matches('_').count() == 5));
    for cell in &cells {
        let has_block_field = cell.id.matches('_').count() == 5;
        assert_eq!(cell.params.uses_blocks(), has_block_field, "{}", cell.id);
    }

    // Ids are unique.
    let unique: std::collections::HashSet<&str> =
        cells.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(unique.len(), cells.len());
}

#[test]
fn test_enumerate_filters() {
    let mut cfg = RunConfig::new("/tmp/x", "grid");
    cfg.fixed_delay = Some(1);
    assert_eq!(enumerate_cells(&cfg).len(), 16 * 19);

    let mut cfg = RunConfig::new("/tmp/x", "grid");
    cfg.include_zero_slip = false;
    assert_eq!(enumerate_cells(&cfg).len(), 48 * 19);

    // slip_min excludes 10 but include_zero_slip keeps the zero column.
    let mut cfg = RunConfig::new("/tmp/x", "grid");
    cfg.slip_min = Some(20.0);
    assert_eq!(enumerate_cells(&cfg).len(), 48 * 19);

    let mut cfg = RunConfig::new("/tmp/x", "grid");
    cfg.slip_min = Some(20.0);
    cfg.include_zero_slip = false;
    assert_eq!(enumerate_cells(&cfg).len(), 32 * 19);
}

// =============================================================================
// Scheduler end to end: a small grid runs to DONE with all artifacts
// =============================================================================

#[test]
fn test_grid_end_to_end() {
    let repo = tempfile::tempdir().unwrap();
    write_sample_inputs(repo.path());

    let mut cfg = single_cell_config(repo.path(), "grid_e2e");
    cfg.n_per_cell = 50;
    cfg.checkpoint_every = 20;
    cfg.jobs = 2;
    cfg.axes.p_skip = vec![0.0, 0.10];
    cfg.axes.slip_dollars_max = vec![0.0, 10.0];

    let report = run_grid(&cfg).unwrap();
    assert_eq!(report.cells_total, 4);
    assert_eq!(report.cells_completed, 4);
    assert!(report.all_complete);

    let aggregated = cfg.aggregated_dir();
    assert!(aggregated.join(DONE_FILE).exists());
    assert!(aggregated.join(MANIFEST_FILE).exists());
    assert!(aggregated.join(HEARTBEAT_FILE).exists());

    let grid_summary = fs::read_to_string(aggregated.join(GRID_SUMMARY_FILE)).unwrap();
    assert_eq!(grid_summary.lines().count(), 5); // header + one row per cell

    for cell in enumerate_cells(&cfg) {
        let dir = cfg.cell_dir(&cell.id);
        let scan = scan_metrics(&dir.join(METRICS_FILE)).unwrap();
        let indices: Vec<u32> = scan.rows.iter().map(|r| r.perm_index).collect();
        assert_eq!(indices, (0..50).collect::<Vec<u32>>(), "cell {}", cell.id);
        assert!(verify_complete(&dir, 50).is_some(), "cell {}", cell.id);
    }

    // A second pass over a finished grid is a fast no-op that leaves DONE.
    let report = run_grid(&cfg).unwrap();
    assert!(report.all_complete);
    assert_eq!(report.cells_completed, 4);

    // Status mode never writes; it just prints.
    print_status(&cfg).unwrap();
}

// =============================================================================
// Determinism across grid invocations (scenario 2 at the file level)
// =============================================================================

#[test]
fn test_two_runs_produce_identical_metrics() {
    let repo_a = tempfile::tempdir().unwrap();
    let repo_b = tempfile::tempdir().unwrap();
    write_sample_inputs(repo_a.path());
    write_sample_inputs(repo_b.path());

    let cfg_a = single_cell_config(repo_a.path(), "twin");
    let cfg_b = single_cell_config(repo_b.path(), "twin");
    let inputs_a = load_for(&cfg_a);
    let inputs_b = load_for(&cfg_b);

    assert_eq!(run_cell(&cfg_a, &inputs_a, CancelToken::new()), CellStatus::Completed);
    assert_eq!(run_cell(&cfg_b, &inputs_b, CancelToken::new()), CellStatus::Completed);

    let cell = the_cell(&cfg_a);
    let bytes_a = fs::read(cfg_a.cell_dir(&cell.id).join(METRICS_FILE)).unwrap();
    let bytes_b = fs::read(cfg_b.cell_dir(&cell.id).join(METRICS_FILE)).unwrap();
    assert_eq!(bytes_a, bytes_b);
}
