use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Sentinel reported for profit factor when a simulation has no losing trades.
pub const PF_SENTINEL: f64 = 1e9;

// --- Trade data (struct-of-arrays) ---

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Long,
    Short,
}

/// The baseline trade list in columnar form.
///
/// Each field is a parallel column indexed by trade number; the perturbation
/// stages operate on these primitive slices directly and never materialize
/// per-trade row structures. Timestamps are Unix seconds (UTC).
#[derive(Debug, Clone, Default)]
pub struct TradeColumns {
    pub entry_ts: Vec<i64>,
    pub exit_ts: Vec<i64>,
    pub entry_price: Vec<f64>,
    pub exit_price: Vec<f64>,
    pub qty: Vec<f64>,
    pub side: Vec<Side>,
    pub pnl: Vec<f64>,
    /// Per-trade dollar risk R. Derived from the PnL distribution when the
    /// input column is absent.
    pub risk_dollars: Vec<f64>,
}

impl TradeColumns {
    pub fn len(&self) -> usize {
        self.pnl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pnl.is_empty()
    }
}

/// The baseline equity curve in columnar form. Timestamps are Unix seconds.
#[derive(Debug, Clone, Default)]
pub struct EquityCurve {
    pub ts: Vec<i64>,
    pub equity: Vec<f64>,
}

impl EquityCurve {
    pub fn len(&self) -> usize {
        self.equity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.equity.is_empty()
    }
}

/// OHLC bar series in columnar form. Optional; required only for OHLC-mode
/// delay. Timestamps are Unix seconds and strictly increasing.
#[derive(Debug, Clone, Default)]
pub struct OhlcSeries {
    pub ts: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
}

impl OhlcSeries {
    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }
}

/// Per-trade context derived once at load and shared read-only by every
/// simulation.
#[derive(Debug, Clone, Default)]
pub struct BaselineContext {
    /// Starting equity (first point of the equity curve).
    pub initial_capital: f64,
    /// Bar index of each trade's entry, when OHLC data is present.
    pub entry_bar: Option<Vec<u32>>,
    /// Bar index of each trade's exit, when OHLC data is present.
    pub exit_bar: Option<Vec<u32>>,
    /// Percentile rank in [0,1] of rolling equity-return volatility at each
    /// trade's entry point.
    pub vol_rank: Vec<f64>,
    /// Normalized drawdown depth in [0,1] at each trade's entry point.
    pub dd_norm: Vec<f64>,
    /// Calendar month id (`year * 12 + month0`, UTC) of each trade's exit.
    pub exit_month: Vec<u32>,
    /// Empirical per-bar return series used by approximate-mode delay.
    pub bar_returns: Vec<f64>,
    /// Baseline profit factor parsed from step1_report.txt, if available.
    pub baseline_pf: Option<f64>,
    /// Baseline total return of the unperturbed trade list.
    pub baseline_return_pct: f64,
}

/// Everything the perturbation kernel reads: validated columnar inputs plus
/// the precomputed baseline context.
#[derive(Debug, Clone, Default)]
pub struct StressInputs {
    pub trades: TradeColumns,
    pub equity: EquityCurve,
    pub ohlc: Option<OhlcSeries>,
    pub baseline: BaselineContext,
}

// --- Grid cells ---

/// Trade-sequence shuffle applied after skip, delay, and slippage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleMode {
    #[default]
    None,
    Permute,
    BlockPermute,
}

/// Resampling applied to the already-shuffled sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMode {
    #[default]
    None,
    TradeBootstrap,
    BlockBootstrap,
}

/// Axis indices identifying one point in the perturbation grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub p_skip_idx: usize,
    pub slip_idx: usize,
    pub delay_idx: usize,
    pub shuffle_idx: usize,
    pub bootstrap_idx: usize,
    pub block_len_idx: usize,
}

/// Concrete parameter values a cell's indices resolve to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellParams {
    pub p_skip: f64,
    pub slip_dollars_max: f64,
    pub delay_bars_max: u32,
    pub shuffle_mode: ShuffleMode,
    pub bootstrap_mode: BootstrapMode,
    pub block_len: u32,
}

impl CellParams {
    /// Whether this cell's shuffle or bootstrap actually consumes the block
    /// length. Cells that do not are enumerated without the block axis.
    pub fn uses_blocks(&self) -> bool {
        self.shuffle_mode == ShuffleMode::BlockPermute
            || self.bootstrap_mode == BootstrapMode::BlockBootstrap
    }
}

/// One grid cell: key, resolved parameters, and the canonical string id used
/// in directory names and seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridCell {
    pub key: CellKey,
    pub params: CellParams,
    pub id: String,
}

impl GridCell {
    pub fn new(key: CellKey, params: CellParams) -> Self {
        // Canonical form: five underscore-joined axis indices, with the
        // block-length index appended only for cells that use blocks.
        let mut id = format!(
            "{}_{}_{}_{}_{}",
            key.p_skip_idx, key.slip_idx, key.delay_idx, key.shuffle_idx, key.bootstrap_idx
        );
        if params.uses_blocks() {
            id.push('_');
            id.push_str(&key.block_len_idx.to_string());
        }
        Self { key, params, id }
    }
}

// --- Metrics ---

/// A single simulation's summary row. `perm_index` is the primary key within
/// a cell; the remaining fields are the distributional metrics.
///
/// Serialized field order defines the metrics_compact.csv column order:
/// perm_index, total_return_pct, max_drawdown_pct, profit_factor,
/// worst_month_pct, trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub perm_index: u32,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub profit_factor: f64,
    pub worst_month_pct: f64,
    pub trades_executed: u32,
}

/// Anomaly counters accumulated across a cell's simulations. Anomalies are
/// absorbed into sentinel values and counted here; they never abort the cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimCounters {
    /// Simulations whose skip mask stayed below `min_trades` after all
    /// redraws.
    pub degenerate: u64,
    /// Sentinel substitutions (NaN/infinite PnL, zero-loss profit factor).
    pub sentinel: u64,
}

impl SimCounters {
    pub fn merge(&mut self, other: SimCounters) {
        self.degenerate += other.degenerate;
        self.sentinel += other.sentinel;
    }
}

// --- Run configuration ---

/// Which fill sides the delay stage perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    /// Independent entry and exit delays (the default).
    #[default]
    Both,
    /// A single uniformly chosen side is delayed.
    OneSide,
}

/// Units of the slippage magnitude axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlipMode {
    /// Axis value is a dollar cost.
    #[default]
    Dollar,
    /// Axis value is a multiple of the trade's dollar risk R.
    RMultiple,
    /// Axis value is a fraction of trade notional.
    Pct,
}

/// State-dependent slippage intensity source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlipIntensity {
    #[default]
    None,
    Vol,
    Dd,
    VolDd,
}

/// Kernel-level knobs shared by every cell of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Minimum executed trades before a skip mask is accepted.
    #[serde(default = "default_min_trades")]
    pub min_trades: u32,
    /// Maximum skip-mask redraws before proceeding degenerate.
    #[serde(default = "default_max_redraws")]
    pub max_redraws: u32,
    #[serde(default)]
    pub delay_mode: DelayMode,
    /// Adverse cap on delay damage, in R multiples.
    #[serde(default = "default_delay_adverse_cap_r")]
    pub delay_adverse_cap_r: f64,
    #[serde(default)]
    pub slip_mode: SlipMode,
    #[serde(default)]
    pub slip_intensity: SlipIntensity,
    /// Rolling window (equity points) for the volatility percentile rank.
    #[serde(default = "default_vol_window")]
    pub vol_window: usize,
}

fn default_min_trades() -> u32 {
    30
}
fn default_max_redraws() -> u32 {
    50
}
fn default_delay_adverse_cap_r() -> f64 {
    0.5
}
fn default_vol_window() -> usize {
    20
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            min_trades: 30,
            max_redraws: 50,
            delay_mode: DelayMode::Both,
            delay_adverse_cap_r: 0.5,
            slip_mode: SlipMode::Dollar,
            slip_intensity: SlipIntensity::None,
            vol_window: 20,
        }
    }
}

/// Parameter axes enumerated into the Cartesian grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridAxes {
    #[serde(default = "default_p_skip_axis")]
    pub p_skip: Vec<f64>,
    #[serde(default = "default_slip_axis")]
    pub slip_dollars_max: Vec<f64>,
    #[serde(default = "default_delay_axis")]
    pub delay_bars_max: Vec<u32>,
    #[serde(default = "default_shuffle_axis")]
    pub shuffle_modes: Vec<ShuffleMode>,
    #[serde(default = "default_bootstrap_axis")]
    pub bootstrap_modes: Vec<BootstrapMode>,
    #[serde(default = "default_block_len_axis")]
    pub block_lens: Vec<u32>,
}

fn default_p_skip_axis() -> Vec<f64> {
    vec![0.0, 0.05, 0.10, 0.20]
}
fn default_slip_axis() -> Vec<f64> {
    vec![0.0, 10.0, 25.0, 50.0]
}
fn default_delay_axis() -> Vec<u32> {
    vec![0, 1, 2, 3]
}
fn default_shuffle_axis() -> Vec<ShuffleMode> {
    vec![ShuffleMode::None, ShuffleMode::Permute, ShuffleMode::BlockPermute]
}
fn default_bootstrap_axis() -> Vec<BootstrapMode> {
    vec![
        BootstrapMode::None,
        BootstrapMode::TradeBootstrap,
        BootstrapMode::BlockBootstrap,
    ]
}
fn default_block_len_axis() -> Vec<u32> {
    vec![5, 10, 20]
}

impl Default for GridAxes {
    fn default() -> Self {
        Self {
            p_skip: default_p_skip_axis(),
            slip_dollars_max: default_slip_axis(),
            delay_bars_max: default_delay_axis(),
            shuffle_modes: default_shuffle_axis(),
            bootstrap_modes: default_bootstrap_axis(),
            block_lens: default_block_len_axis(),
        }
    }
}

/// Configuration record for a full grid run. Loadable from JSON; every field
/// except `repo_path` and `run_name` has a working default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root directory holding the input files and the output tree.
    pub repo_path: PathBuf,
    /// Name of this run; becomes the output directory name.
    pub run_name: String,
    /// Simulations per cell.
    #[serde(default = "default_n_per_cell")]
    pub n_per_cell: u32,
    /// Worker pool size. Zero means `min(8, cores)`.
    #[serde(default)]
    pub jobs: usize,
    /// Rows per append/checkpoint chunk.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u32,
    #[serde(default = "default_global_seed")]
    pub global_seed: u32,
    /// Modulus applied to the cell hash before it offsets the global seed.
    #[serde(default = "default_seed_stride")]
    pub seed_stride: u32,
    /// Keep only cells whose delay axis equals this value.
    #[serde(default)]
    pub fixed_delay: Option<u32>,
    /// Keep only cells with slippage at or above this value.
    #[serde(default)]
    pub slip_min: Option<f64>,
    /// Keep only cells with slippage at or below this value.
    #[serde(default)]
    pub slip_max: Option<f64>,
    /// Keep zero-slippage cells even when `slip_min` would exclude them.
    #[serde(default = "default_true")]
    pub include_zero_slip: bool,
    /// Print per-cell status and exit without producing anything.
    #[serde(default)]
    pub status_only: bool,
    /// Soft per-cell timeout in seconds. Zero means 10 minutes scaled by
    /// `n_per_cell / 200_000`.
    #[serde(default)]
    pub cell_timeout_secs: u64,
    #[serde(default)]
    pub axes: GridAxes,
    #[serde(default)]
    pub kernel: KernelConfig,
}

fn default_n_per_cell() -> u32 {
    200_000
}
fn default_checkpoint_every() -> u32 {
    2_000
}
fn default_global_seed() -> u32 {
    1_337
}
fn default_seed_stride() -> u32 {
    1_000_000
}
fn default_true() -> bool {
    true
}

impl RunConfig {
    pub fn new(repo_path: impl Into<PathBuf>, run_name: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            run_name: run_name.into(),
            n_per_cell: default_n_per_cell(),
            jobs: 0,
            checkpoint_every: default_checkpoint_every(),
            global_seed: default_global_seed(),
            seed_stride: default_seed_stride(),
            fixed_delay: None,
            slip_min: None,
            slip_max: None,
            include_zero_slip: true,
            status_only: false,
            cell_timeout_secs: 0,
            axes: GridAxes::default(),
            kernel: KernelConfig::default(),
        }
    }

    /// Effective worker pool size.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs > 0 {
            return self.jobs;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.min(8)
    }

    /// Effective soft per-cell timeout.
    pub fn effective_cell_timeout(&self) -> std::time::Duration {
        if self.cell_timeout_secs > 0 {
            return std::time::Duration::from_secs(self.cell_timeout_secs);
        }
        let scaled = 600.0 * self.n_per_cell as f64 / 200_000.0;
        std::time::Duration::from_secs(scaled.max(60.0) as u64)
    }

    /// Run output root: `<repo_path>/backtest/out/montecarlo/<run_name>`.
    pub fn out_dir(&self) -> PathBuf {
        self.repo_path
            .join("backtest")
            .join("out")
            .join("montecarlo")
            .join(&self.run_name)
    }

    pub fn aggregated_dir(&self) -> PathBuf {
        self.out_dir().join("aggregated")
    }

    pub fn cell_dir(&self, cell_id: &str) -> PathBuf {
        self.out_dir().join("per_cell").join(cell_id)
    }
}

// --- Small shared helpers ---

/// Month id (`year * 12 + month0`) of a Unix timestamp, UTC.
pub fn month_id(ts: i64) -> u32 {
    use chrono::Datelike;
    let dt = chrono::DateTime::from_timestamp(ts, 0).unwrap_or_default();
    (dt.year().max(0) as u32) * 12 + dt.month0()
}
