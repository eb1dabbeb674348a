//! mc-runner: Monte Carlo stress-grid executor.
//!
//! Loads a `RunConfig` record from a JSON file and runs the perturbation
//! grid (or prints per-cell status). The configuration file is the control
//! surface; the only flags recognized here are the config path and
//! `--status`.
//!
//! Usage:
//!   cargo run -p mc-runner -- montecarlo.json
//!   cargo run -p mc-runner -- montecarlo.json --status
//!
//! Exits 0 on successful completion or status print; non-zero on fatal
//! input-validation or filesystem errors. An incomplete grid (timeouts,
//! stalls) is not fatal: the next invocation resumes from the metrics logs.

use anyhow::Context;
use mc_engine::RunConfig;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mc_runner=info,mc_engine=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let status_flag = args.iter().any(|a| a == "--status");
    let config_path = args
        .iter()
        .skip(1)
        .find(|a| !a.starts_with("--"))
        .map(String::as_str)
        .unwrap_or("montecarlo.json");

    let text = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {config_path}"))?;
    let mut cfg: RunConfig = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config file {config_path}"))?;
    if status_flag {
        cfg.status_only = true;
    }

    if cfg.status_only {
        mc_runner::print_status(&cfg)?;
        return Ok(());
    }

    let report = mc_runner::run_grid(&cfg)?;
    tracing::info!(
        "run finished: {}/{} cells complete ({} interrupted, {} stalled, {} timed out, {} failed)",
        report.cells_completed,
        report.cells_total,
        report.cells_interrupted,
        report.cells_stalled,
        report.cells_timed_out,
        report.cells_failed
    );
    Ok(())
}
