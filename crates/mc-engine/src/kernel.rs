//! Perturbation kernel.
//!
//! One call = one Monte Carlo simulation: starting from the baseline trade
//! list, apply skip, delay, slippage, shuffle, and bootstrap in that order,
//! then reduce the perturbed sequence to a single `MetricsRow`.
//!
//! Stage order matters: a skipped trade is never delayed or slipped, slippage
//! applies to the already-delayed PnL, and shuffling before bootstrap keeps
//! the bootstrap sample definition independent of ordering. All randomness
//! comes from a single ChaCha8 stream seeded per permutation, consumed in a
//! fixed draw order, so a `(global_seed, cell_id, perm_index)` triple always
//! reproduces the same row.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::models::{
    BootstrapMode, CellParams, DelayMode, KernelConfig, MetricsRow, Side, SimCounters,
    SlipIntensity, SlipMode, StressInputs, ShuffleMode, PF_SENTINEL,
};
use crate::seeding;

/// Reusable per-simulation buffers. One instance per worker; every simulation
/// clears and refills these instead of allocating.
#[derive(Debug, Default)]
pub struct SimScratch {
    /// Indices (into the trade columns) of executed trades.
    executed: Vec<u32>,
    /// Perturbed PnL per executed trade, parallel to `executed`.
    pnl: Vec<f64>,
    /// Final sequence order: positions into `pnl` after shuffle + bootstrap.
    order: Vec<u32>,
    /// Block-order scratch for block permutation.
    blocks: Vec<u32>,
    /// Month id → summed PnL, for the worst-month reduction.
    months: HashMap<u32, f64>,
}

impl SimScratch {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Run one simulation and reduce it to a metrics row.
pub fn run_permutation(
    inputs: &StressInputs,
    params: &CellParams,
    kernel: &KernelConfig,
    seed: u32,
    perm_index: u32,
    scratch: &mut SimScratch,
    counters: &mut SimCounters,
) -> MetricsRow {
    let mut rng = seeding::sim_rng(seed);

    draw_skip_mask(inputs, params, kernel, &mut rng, scratch, counters);
    apply_delay(inputs, params, kernel, &mut rng, scratch, counters);
    apply_slippage(inputs, params, kernel, &mut rng, scratch);
    apply_shuffle(params, &mut rng, scratch);
    apply_bootstrap(params, &mut rng, scratch);
    reduce(inputs, perm_index, scratch, counters)
}

// --- Stage 1: skip mask ---

/// Draw the executed-trade mask. The whole mask is redrawn (up to
/// `max_redraws` times) until at least `min_trades` survive; if it never
/// does, the last mask is kept and the simulation is counted degenerate.
fn draw_skip_mask(
    inputs: &StressInputs,
    params: &CellParams,
    kernel: &KernelConfig,
    rng: &mut ChaCha8Rng,
    scratch: &mut SimScratch,
    counters: &mut SimCounters,
) {
    let n = inputs.trades.len();
    scratch.executed.clear();

    if params.p_skip <= 0.0 {
        scratch.executed.extend(0..n as u32);
        return;
    }

    for _ in 0..=kernel.max_redraws {
        scratch.executed.clear();
        for i in 0..n {
            if rng.gen::<f64>() > params.p_skip {
                scratch.executed.push(i as u32);
            }
        }
        if scratch.executed.len() >= kernel.min_trades as usize {
            return;
        }
    }
    counters.degenerate += 1;
}

// --- Stage 2: delay ---

/// Apply fill delay to each executed trade and fill `scratch.pnl`.
///
/// With OHLC data the delayed fill is the open of the bar `k` steps after the
/// original fill bar (bounded by the last bar) and PnL is recomputed from the
/// delayed prices; without it, `k` bar-return draws are compounded onto the
/// original PnL. Either way the conservative clamp (delay never helps) and
/// the adverse cap (at most `delay_adverse_cap_r` R of extra damage) run
/// afterwards.
fn apply_delay(
    inputs: &StressInputs,
    params: &CellParams,
    kernel: &KernelConfig,
    rng: &mut ChaCha8Rng,
    scratch: &mut SimScratch,
    counters: &mut SimCounters,
) {
    let trades = &inputs.trades;
    scratch.pnl.clear();

    if params.delay_bars_max == 0 {
        scratch
            .pnl
            .extend(scratch.executed.iter().map(|i| trades.pnl[*i as usize]));
        return;
    }

    let ohlc_mode = inputs.ohlc.is_some()
        && inputs.baseline.entry_bar.is_some()
        && inputs.baseline.exit_bar.is_some();

    for idx in &scratch.executed {
        let i = *idx as usize;
        let original = trades.pnl[i];

        let (k_entry, k_exit) = match kernel.delay_mode {
            DelayMode::Both => (
                rng.gen_range(0..=params.delay_bars_max),
                rng.gen_range(0..=params.delay_bars_max),
            ),
            DelayMode::OneSide => {
                let k = rng.gen_range(0..=params.delay_bars_max);
                if rng.gen::<bool>() {
                    (k, 0)
                } else {
                    (0, k)
                }
            }
        };

        let mut delayed = if ohlc_mode {
            delayed_pnl_ohlc(inputs, i, k_entry, k_exit)
        } else {
            delayed_pnl_approx(inputs, original, k_entry + k_exit, rng)
        };

        if !delayed.is_finite() {
            counters.sentinel += 1;
            delayed = original;
        }

        // Delay can only hurt, and by at most the adverse cap.
        delayed = delayed.min(original);
        let floor = original - kernel.delay_adverse_cap_r * trades.risk_dollars[i];
        delayed = delayed.max(floor);

        scratch.pnl.push(delayed);
    }
}

/// PnL of trade `i` refilled at the opens `k_entry`/`k_exit` bars late.
fn delayed_pnl_ohlc(inputs: &StressInputs, i: usize, k_entry: u32, k_exit: u32) -> f64 {
    let bars = inputs.ohlc.as_ref().map(|b| &b.open[..]).unwrap_or(&[]);
    if bars.is_empty() {
        return inputs.trades.pnl[i];
    }
    let last = bars.len() - 1;
    let entry_bar = inputs.baseline.entry_bar.as_ref().map(|b| b[i]).unwrap_or(0) as usize;
    let exit_bar = inputs.baseline.exit_bar.as_ref().map(|b| b[i]).unwrap_or(0) as usize;

    let entry_px = bars[(entry_bar + k_entry as usize).min(last)];
    let exit_px = bars[(exit_bar + k_exit as usize).min(last)];
    let qty = inputs.trades.qty[i];
    match inputs.trades.side[i] {
        Side::Long => (exit_px - entry_px) * qty,
        Side::Short => (entry_px - exit_px) * qty,
    }
}

/// Approximate-mode delay: compound `k` draws from the empirical bar-return
/// series and scale the original PnL by the resulting factor.
fn delayed_pnl_approx(inputs: &StressInputs, original: f64, k: u32, rng: &mut ChaCha8Rng) -> f64 {
    let returns = &inputs.baseline.bar_returns;
    if k == 0 || returns.is_empty() {
        return original;
    }
    let mut factor = 1.0;
    for _ in 0..k {
        factor *= 1.0 + returns[rng.gen_range(0..returns.len())];
    }
    original * factor
}

// --- Stage 3: slippage ---

/// Subtract a uniformly drawn slippage cost from each executed trade's PnL,
/// scaled by the state-dependent multiplier `1 + intensity`.
fn apply_slippage(
    inputs: &StressInputs,
    params: &CellParams,
    kernel: &KernelConfig,
    rng: &mut ChaCha8Rng,
    scratch: &mut SimScratch,
) {
    if params.slip_dollars_max <= 0.0 {
        return;
    }
    let trades = &inputs.trades;
    let baseline = &inputs.baseline;

    for (j, idx) in scratch.executed.iter().enumerate() {
        let i = *idx as usize;
        let u = rng.gen::<f64>();
        let intensity = match kernel.slip_intensity {
            SlipIntensity::None => 0.0,
            SlipIntensity::Vol => baseline.vol_rank[i],
            SlipIntensity::Dd => baseline.dd_norm[i],
            SlipIntensity::VolDd => 0.5 * baseline.vol_rank[i] + 0.5 * baseline.dd_norm[i],
        };
        let m = 1.0 + intensity;
        let cost = match kernel.slip_mode {
            SlipMode::Dollar => u * params.slip_dollars_max * m,
            SlipMode::RMultiple => u * params.slip_dollars_max * trades.risk_dollars[i] * m,
            SlipMode::Pct => {
                let notional = (trades.entry_price[i] * trades.qty[i]).abs();
                u * params.slip_dollars_max * notional * m
            }
        };
        scratch.pnl[j] -= cost;
    }
}

// --- Stage 4: shuffle ---

/// Reorder the executed sequence. `permute` is a Fisher–Yates pass over the
/// whole sequence; `block_permute` keeps contiguous blocks intact (the final
/// block may be short) and permutes the block order.
fn apply_shuffle(params: &CellParams, rng: &mut ChaCha8Rng, scratch: &mut SimScratch) {
    let m = scratch.pnl.len();
    scratch.order.clear();
    scratch.order.extend(0..m as u32);

    match params.shuffle_mode {
        ShuffleMode::None => {}
        ShuffleMode::Permute => {
            scratch.order.shuffle(rng);
        }
        ShuffleMode::BlockPermute => {
            let block_len = params.block_len.max(1) as usize;
            let n_blocks = m.div_ceil(block_len);
            if n_blocks <= 1 {
                return;
            }
            scratch.blocks.clear();
            scratch.blocks.extend(0..n_blocks as u32);
            scratch.blocks.shuffle(rng);

            scratch.order.clear();
            for b in &scratch.blocks {
                let start = *b as usize * block_len;
                let end = (start + block_len).min(m);
                scratch.order.extend(start as u32..end as u32);
            }
        }
    }
}

// --- Stage 5: bootstrap ---

/// Resample the shuffled sequence with replacement to exactly its own length.
fn apply_bootstrap(params: &CellParams, rng: &mut ChaCha8Rng, scratch: &mut SimScratch) {
    let m = scratch.order.len();
    if m == 0 {
        return;
    }
    match params.bootstrap_mode {
        BootstrapMode::None => {}
        BootstrapMode::TradeBootstrap => {
            scratch.blocks.clear();
            scratch
                .blocks
                .extend((0..m).map(|_| scratch.order[rng.gen_range(0..m)]));
            std::mem::swap(&mut scratch.order, &mut scratch.blocks);
        }
        BootstrapMode::BlockBootstrap => {
            let block_len = (params.block_len.max(1) as usize).min(m);
            let hi = m - block_len;
            scratch.blocks.clear();
            while scratch.blocks.len() < m {
                let start = rng.gen_range(0..=hi);
                let take = block_len.min(m - scratch.blocks.len());
                for t in 0..take {
                    scratch.blocks.push(scratch.order[start + t]);
                }
            }
            std::mem::swap(&mut scratch.order, &mut scratch.blocks);
        }
    }
}

// --- Stage 6: reduction ---

/// Rebuild the equity path from the final sequence and reduce it to the
/// metrics row. NaN PnL values are absorbed as zero and counted; a zero-loss
/// denominator turns the profit factor into `PF_SENTINEL`.
fn reduce(
    inputs: &StressInputs,
    perm_index: u32,
    scratch: &mut SimScratch,
    counters: &mut SimCounters,
) -> MetricsRow {
    let initial = inputs.baseline.initial_capital;
    let months = &inputs.baseline.exit_month;

    let mut equity = initial;
    let mut peak = initial;
    let mut max_dd = 0.0_f64;
    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;
    scratch.months.clear();

    for pos in &scratch.order {
        let j = *pos as usize;
        let mut p = scratch.pnl[j];
        if !p.is_finite() {
            counters.sentinel += 1;
            p = 0.0;
        }
        equity += p;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
        if p > 0.0 {
            gross_profit += p;
        } else {
            gross_loss += -p;
        }
        let trade_idx = scratch.executed[j] as usize;
        *scratch.months.entry(months[trade_idx]).or_insert(0.0) += p;
    }

    let total_return_pct = (equity - initial) / initial;
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else {
        counters.sentinel += 1;
        PF_SENTINEL
    };
    let worst_month_pct = scratch
        .months
        .values()
        .map(|p| p / initial)
        .fold(f64::INFINITY, f64::min);
    let worst_month_pct = if worst_month_pct.is_finite() {
        worst_month_pct
    } else {
        0.0
    };

    MetricsRow {
        perm_index,
        total_return_pct,
        max_drawdown_pct: max_dd,
        profit_factor,
        worst_month_pct,
        trades_executed: scratch.executed.len() as u32,
    }
}
