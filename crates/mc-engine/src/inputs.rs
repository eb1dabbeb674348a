//! Inputs loader.
//!
//! Reads the trade list, equity curve, and optional OHLC series into columnar
//! form, validates shapes and monotonicity, and precomputes the per-trade
//! baseline context (bar indices, volatility ranks, drawdown depths, month
//! ids) shared read-only by every simulation. All validation failures here
//! are fatal; nothing malformed reaches the kernel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::EngineError;
use crate::models::{
    month_id, BaselineContext, EquityCurve, KernelConfig, OhlcSeries, Side, StressInputs,
    TradeColumns,
};

pub const TRADE_LIST_FILE: &str = "trade_list.csv";
pub const EQUITY_CURVE_FILE: &str = "equity_curve.csv";
pub const OHLC_FILE: &str = "ohlc.csv";
pub const STEP1_REPORT_FILE: &str = "step1_report.txt";

/// Load and validate all inputs under `repo_path`.
///
/// `ohlc.csv` and `step1_report.txt` are optional; the trade list and equity
/// curve are required.
pub fn load_inputs(repo_path: &Path, kernel: &KernelConfig) -> Result<StressInputs, EngineError> {
    let trade_path = repo_path.join(TRADE_LIST_FILE);
    let equity_path = repo_path.join(EQUITY_CURVE_FILE);
    if !trade_path.is_file() {
        return Err(EngineError::MissingInput(trade_path));
    }
    if !equity_path.is_file() {
        return Err(EngineError::MissingInput(equity_path));
    }

    let trades = load_trades(&trade_path)?;
    let equity = load_equity(&equity_path)?;

    let ohlc_path = repo_path.join(OHLC_FILE);
    let ohlc = if ohlc_path.is_file() {
        Some(load_ohlc(&ohlc_path)?)
    } else {
        None
    };

    let baseline_pf = parse_step1_report(&repo_path.join(STEP1_REPORT_FILE));

    let baseline = build_baseline(&trades, &equity, ohlc.as_ref(), baseline_pf, kernel, &trade_path)?;

    tracing::info!(
        "loaded {} trades, {} equity points, {} bars (baseline PF {:?})",
        trades.len(),
        equity.len(),
        ohlc.as_ref().map(|b| b.len()).unwrap_or(0),
        baseline_pf
    );

    Ok(StressInputs {
        trades,
        equity,
        ohlc,
        baseline,
    })
}

// --- Trade list ---

fn load_trades(path: &PathBuf) -> Result<TradeColumns, EngineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let col = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let required = |name: &str| {
        col(name).ok_or_else(|| EngineError::schema(path, 1, format!("missing column '{name}'")))
    };

    let c_entry_time = required("entry_time")?;
    let c_exit_time = required("exit_time")?;
    let c_entry_price = required("entry_price")?;
    let c_exit_price = required("exit_price")?;
    let c_pnl = required("pnl")?;
    let c_qty = required("qty")?;
    let c_side = required("side")?;
    let c_risk = col("risk_dollars");

    let mut out = TradeColumns::default();
    let mut risk_raw: Vec<Option<f64>> = Vec::new();

    for (i, result) in reader.records().enumerate() {
        let row = i + 2; // 1-based, after the header line
        let record = result?;
        let field = |idx: usize, name: &str| {
            record
                .get(idx)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| EngineError::schema(path, row, format!("missing field '{name}'")))
        };

        let entry_ts = parse_timestamp(field(c_entry_time, "entry_time")?, path, row)?;
        let exit_ts = parse_timestamp(field(c_exit_time, "exit_time")?, path, row)?;
        if let Some(prev) = out.entry_ts.last() {
            if entry_ts < *prev {
                return Err(EngineError::schema(
                    path,
                    row,
                    "trades are not ordered by entry_time",
                ));
            }
        }

        out.entry_ts.push(entry_ts);
        out.exit_ts.push(exit_ts);
        out.entry_price
            .push(parse_f64(field(c_entry_price, "entry_price")?, path, row)?);
        out.exit_price
            .push(parse_f64(field(c_exit_price, "exit_price")?, path, row)?);
        out.pnl.push(parse_f64(field(c_pnl, "pnl")?, path, row)?);
        out.qty.push(parse_f64(field(c_qty, "qty")?, path, row)?);
        out.side.push(parse_side(field(c_side, "side")?, path, row)?);
        risk_raw.push(match c_risk {
            Some(idx) => record
                .get(idx)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_f64(s, path, row))
                .transpose()?,
            None => None,
        });
    }

    if out.is_empty() {
        return Err(EngineError::InvalidInput(format!(
            "{}: trade list is empty",
            path.display()
        )));
    }

    out.risk_dollars = derive_risk(&out.pnl, &risk_raw);
    Ok(out)
}

/// Fill missing `risk_dollars` entries with the median absolute PnL of
/// non-zero trades (1.0 when no trade has non-zero PnL).
fn derive_risk(pnl: &[f64], raw: &[Option<f64>]) -> Vec<f64> {
    let mut magnitudes: Vec<f64> = pnl
        .iter()
        .map(|p| p.abs())
        .filter(|p| *p > 0.0)
        .collect();
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let fallback = if magnitudes.is_empty() {
        1.0
    } else {
        magnitudes[magnitudes.len() / 2]
    };
    raw.iter()
        .map(|r| match r {
            Some(v) if *v > 0.0 => *v,
            _ => fallback,
        })
        .collect()
}

// --- Equity curve ---

fn load_equity(path: &PathBuf) -> Result<EquityCurve, EngineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let c_time = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case("time"))
        .ok_or_else(|| EngineError::schema(path, 1, "missing column 'time'"))?;
    let c_equity = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case("equity"))
        .ok_or_else(|| EngineError::schema(path, 1, "missing column 'equity'"))?;

    let mut out = EquityCurve::default();
    for (i, result) in reader.records().enumerate() {
        let row = i + 2;
        let record = result?;
        let ts_s = record
            .get(c_time)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::schema(path, row, "missing field 'time'"))?;
        let eq_s = record
            .get(c_equity)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::schema(path, row, "missing field 'equity'"))?;

        let ts = parse_timestamp(ts_s, path, row)?;
        let eq = parse_f64(eq_s, path, row)?;
        if let Some(prev) = out.ts.last() {
            if ts <= *prev {
                return Err(EngineError::schema(path, row, "equity timestamps not increasing"));
            }
        }
        if !eq.is_finite() {
            return Err(EngineError::schema(path, row, "non-finite equity value"));
        }
        out.ts.push(ts);
        out.equity.push(eq);
    }

    if out.len() == 0 {
        return Err(EngineError::InvalidInput(format!(
            "{}: equity curve is empty",
            path.display()
        )));
    }
    if out.equity[0] <= 0.0 {
        return Err(EngineError::InvalidInput(format!(
            "{}: initial equity must be positive",
            path.display()
        )));
    }
    Ok(out)
}

// --- OHLC bars ---

fn load_ohlc(path: &PathBuf) -> Result<OhlcSeries, EngineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let idx_of = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| EngineError::schema(path, 1, format!("missing column '{name}'")))
    };
    let c_time = idx_of("time")?;
    let c_open = idx_of("open")?;
    let c_high = idx_of("high")?;
    let c_low = idx_of("low")?;
    let c_close = idx_of("close")?;

    let mut out = OhlcSeries::default();
    for (i, result) in reader.records().enumerate() {
        let row = i + 2;
        let record = result?;
        let get = |idx: usize, name: &str| {
            record
                .get(idx)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| EngineError::schema(path, row, format!("missing field '{name}'")))
        };
        let ts = parse_timestamp(get(c_time, "time")?, path, row)?;
        if let Some(prev) = out.ts.last() {
            if ts <= *prev {
                return Err(EngineError::schema(path, row, "bar timestamps not increasing"));
            }
        }
        out.ts.push(ts);
        out.open.push(parse_f64(get(c_open, "open")?, path, row)?);
        out.high.push(parse_f64(get(c_high, "high")?, path, row)?);
        out.low.push(parse_f64(get(c_low, "low")?, path, row)?);
        out.close.push(parse_f64(get(c_close, "close")?, path, row)?);
    }
    Ok(out)
}

// --- Baseline report ---

/// Lenient scan for a baseline profit factor in the step-1 report. Missing
/// file, missing line, or unparseable number all yield `None`.
fn parse_step1_report(path: &Path) -> Option<f64> {
    let text = std::fs::read_to_string(path).ok()?;
    for line in text.lines() {
        if !line.to_ascii_lowercase().contains("profit factor") {
            continue;
        }
        let value = line
            .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<f64>().ok())
            .next_back();
        if value.is_some() {
            return value;
        }
    }
    None
}

// --- Baseline context ---

fn build_baseline(
    trades: &TradeColumns,
    equity: &EquityCurve,
    ohlc: Option<&OhlcSeries>,
    baseline_pf: Option<f64>,
    kernel: &KernelConfig,
    trade_path: &Path,
) -> Result<BaselineContext, EngineError> {
    let initial_capital = equity.equity[0];

    // Exact-match timestamp → bar index lookup for OHLC-mode delay.
    let (entry_bar, exit_bar) = match ohlc {
        Some(bars) => {
            let index: HashMap<i64, u32> = bars
                .ts
                .iter()
                .enumerate()
                .map(|(i, ts)| (*ts, i as u32))
                .collect();
            let lookup = |ts: &[i64], what: &str| -> Result<Vec<u32>, EngineError> {
                ts.iter()
                    .enumerate()
                    .map(|(i, t)| {
                        index.get(t).copied().ok_or_else(|| {
                            EngineError::schema(
                                trade_path,
                                i + 2,
                                format!("{what} does not match any bar timestamp"),
                            )
                        })
                    })
                    .collect()
            };
            (
                Some(lookup(&trades.entry_ts, "entry_time")?),
                Some(lookup(&trades.exit_ts, "exit_time")?),
            )
        }
        None => (None, None),
    };

    // Per-bar equity returns; also the empirical series for approximate delay.
    let bar_returns: Vec<f64> = equity
        .equity
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect();

    let vol_rank_points = rolling_vol_ranks(&bar_returns, kernel.vol_window, equity.len());
    let dd_norm_points = drawdown_norm(&equity.equity);

    // Map each trade to the equity point at or before its entry.
    let point_of = |ts: i64| -> usize {
        let upper = equity.ts.partition_point(|t| *t <= ts);
        upper.saturating_sub(1)
    };
    let vol_rank: Vec<f64> = trades
        .entry_ts
        .iter()
        .map(|ts| vol_rank_points[point_of(*ts)])
        .collect();
    let dd_norm: Vec<f64> = trades
        .entry_ts
        .iter()
        .map(|ts| dd_norm_points[point_of(*ts)])
        .collect();

    let exit_month: Vec<u32> = trades.exit_ts.iter().map(|ts| month_id(*ts)).collect();

    let total_pnl: f64 = trades.pnl.iter().sum();
    let baseline_return_pct = total_pnl / initial_capital;

    Ok(BaselineContext {
        initial_capital,
        entry_bar,
        exit_bar,
        vol_rank,
        dd_norm,
        exit_month,
        bar_returns,
        baseline_pf,
        baseline_return_pct,
    })
}

/// Percentile rank (in [0,1]) of the rolling standard deviation of returns at
/// each equity point. Points before the window has filled rank 0.
fn rolling_vol_ranks(returns: &[f64], window: usize, n_points: usize) -> Vec<f64> {
    let window = window.max(2);
    let mut vols: Vec<f64> = vec![f64::NAN; n_points];
    // Return t covers the move into equity point t+1.
    for t in window..=returns.len() {
        let slice = &returns[t - window..t];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / window as f64;
        vols[t.min(n_points - 1)] = var.sqrt();
    }

    let mut valid: Vec<f64> = vols.iter().copied().filter(|v| v.is_finite()).collect();
    valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if valid.is_empty() {
        return vec![0.0; n_points];
    }

    vols.iter()
        .map(|v| {
            if !v.is_finite() {
                return 0.0;
            }
            let below = valid.partition_point(|x| x <= v);
            below as f64 / valid.len() as f64
        })
        .collect()
}

/// `|dd| / max|dd|` at each equity point, where `dd` is the drawdown from the
/// running maximum. All zeros when the curve never draws down.
fn drawdown_norm(equity: &[f64]) -> Vec<f64> {
    let mut dd = Vec::with_capacity(equity.len());
    let mut peak = f64::MIN;
    for e in equity {
        peak = peak.max(*e);
        dd.push(if peak > 0.0 { (e - peak) / peak } else { 0.0 });
    }
    let max_abs = dd.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
    if max_abs <= 0.0 {
        return vec![0.0; equity.len()];
    }
    dd.iter().map(|d| d.abs() / max_abs).collect()
}

// --- Field parsers ---

fn parse_f64(s: &str, path: &Path, row: usize) -> Result<f64, EngineError> {
    s.parse::<f64>()
        .map_err(|_| EngineError::schema(path, row, format!("invalid number '{s}'")))
}

fn parse_side(s: &str, path: &Path, row: usize) -> Result<Side, EngineError> {
    match s.to_ascii_lowercase().as_str() {
        "long" => Ok(Side::Long),
        "short" => Ok(Side::Short),
        other => Err(EngineError::schema(
            path,
            row,
            format!("invalid side '{other}' (expected long/short)"),
        )),
    }
}

/// Parse an ISO-8601 timestamp to Unix seconds (UTC). Accepts RFC 3339,
/// `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS`, and bare dates.
pub fn parse_timestamp(s: &str, path: &Path, row: usize) -> Result<i64, EngineError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc().timestamp());
        }
    }
    Err(EngineError::schema(
        path,
        row,
        format!("invalid timestamp '{s}'"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_formats_accepted() {
        let p = Path::new("x.csv");
        assert_eq!(parse_timestamp("1970-01-01 00:00:10", p, 1).unwrap(), 10);
        assert_eq!(parse_timestamp("1970-01-01T00:00:10", p, 1).unwrap(), 10);
        assert_eq!(parse_timestamp("1970-01-02", p, 1).unwrap(), 86_400);
        assert_eq!(
            parse_timestamp("1970-01-01T00:00:10+00:00", p, 1).unwrap(),
            10
        );
        assert!(parse_timestamp("yesterday", p, 1).is_err());
    }

    #[test]
    fn risk_fallback_uses_median_magnitude() {
        let pnl = vec![10.0, -20.0, 30.0, 0.0];
        let raw = vec![None, Some(5.0), None, None];
        let risk = derive_risk(&pnl, &raw);
        // Sorted magnitudes of non-zero pnl: [10, 20, 30] → median 20.
        assert_eq!(risk, vec![20.0, 5.0, 20.0, 20.0]);
    }

    #[test]
    fn drawdown_norm_peaks_at_one() {
        let eq = vec![100.0, 120.0, 90.0, 110.0, 60.0];
        let dd = drawdown_norm(&eq);
        assert_eq!(dd[0], 0.0);
        assert_eq!(dd[1], 0.0);
        let max = dd.iter().cloned().fold(0.0_f64, f64::max);
        assert!((max - 1.0).abs() < 1e-12);
    }

    #[test]
    fn vol_ranks_bounded() {
        let returns: Vec<f64> = (0..100).map(|i| ((i * 37) % 11) as f64 / 100.0).collect();
        let ranks = rolling_vol_ranks(&returns, 20, 101);
        assert!(ranks.iter().all(|r| (0.0..=1.0).contains(r)));
        assert!(ranks.iter().any(|r| *r > 0.0));
    }

    #[test]
    fn step1_report_parsed_leniently() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let path = dir.join(STEP1_REPORT_FILE);
        std::fs::write(&path, "Trades: 120\nProfit Factor: 1.85\nNet: $900\n").unwrap();
        assert_eq!(parse_step1_report(&path), Some(1.85));
        std::fs::write(&path, "no metrics here\n").unwrap();
        assert_eq!(parse_step1_report(&path), None);
        assert_eq!(parse_step1_report(&dir.join("missing.txt")), None);
    }
}
