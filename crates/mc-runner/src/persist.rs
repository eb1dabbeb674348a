//! Crash-safe persistence primitives.
//!
//! Two disciplines cover every file the engine writes:
//!
//! - Whole files read back later (progress, summary, heartbeat, manifest,
//!   DONE sentinel) go through write-tmp-then-rename. A reader observes the
//!   old or the new content, never a partial file.
//! - The metrics log is append-only and flushed per chunk. It is *not*
//!   atomic: a crash mid-append leaves a partial trailing line, which the
//!   dedupe pass discards on the next resume.
//!
//! The metrics log is the single source of truth. Everything else under a
//! cell directory is a cache regenerated from it.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use mc_engine::MetricsRow;

use crate::error::RunnerError;

pub const METRICS_FILE: &str = "metrics_compact.csv";
pub const PROGRESS_FILE: &str = "progress.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const LOGS_FILE: &str = "logs.txt";

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

// --- Atomic whole-file writes ---

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `<path>.tmp` and rename over `path`. The tmp file is
/// removed on failure; the destination is never truncated in place.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), RunnerError> {
    let tmp = tmp_path(path);
    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        drop(file);
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(Into::into)
}

/// Atomically write a pretty-printed JSON value.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RunnerError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

/// Read a JSON file leniently: missing, unreadable, or unparseable files all
/// yield `None`. Used for advisory caches and completeness probes.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

// --- Bounded retry for transient filesystem failures ---

/// Run `op` up to three times with exponential backoff, logging each retry.
pub fn with_retry<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, RunnerError>,
) -> Result<T, RunnerError> {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt == RETRY_ATTEMPTS => return Err(e),
            Err(e) => {
                tracing::warn!("{what} failed (attempt {attempt}): {e}; retrying");
                std::thread::sleep(delay);
                delay *= 2;
            }
        }
    }
    unreachable!("retry loop always returns")
}

// --- Metrics log ---

/// Append rows to the metrics log and flush. Creates the file when missing.
pub fn append_rows(path: &Path, rows: &[MetricsRow]) -> Result<(), RunnerError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Non-mutating scan of the metrics log.
#[derive(Debug, Default)]
pub struct MetricsScan {
    /// Deduped rows, sorted by `perm_index` (first occurrence wins).
    pub rows: Vec<MetricsRow>,
    /// Rows that parsed, duplicates included.
    pub n_rows_raw: u64,
    pub n_duplicates_dropped: u64,
    /// Unparseable rows (crash-truncated trailing line, corruption).
    pub n_malformed: u64,
    /// Whether the raw file ended with a newline.
    pub ends_clean: bool,
}

impl MetricsScan {
    pub fn n_unique(&self) -> u64 {
        self.rows.len() as u64
    }
}

/// Parse the metrics log row by row, tolerating a partial trailing line.
pub fn scan_metrics(path: &Path) -> Result<MetricsScan, RunnerError> {
    if !path.exists() {
        return Ok(MetricsScan {
            ends_clean: true,
            ..MetricsScan::default()
        });
    }
    let raw = fs::read(path)?;
    let text = String::from_utf8_lossy(&raw);
    let ends_clean = text.is_empty() || text.ends_with('\n');

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut map: BTreeMap<u32, MetricsRow> = BTreeMap::new();
    let mut n_rows_raw = 0u64;
    let mut n_duplicates_dropped = 0u64;
    let mut n_malformed = 0u64;
    for result in reader.deserialize::<MetricsRow>() {
        match result {
            Ok(row) => {
                n_rows_raw += 1;
                if map.contains_key(&row.perm_index) {
                    n_duplicates_dropped += 1;
                } else {
                    map.insert(row.perm_index, row);
                }
            }
            Err(_) => n_malformed += 1,
        }
    }

    Ok(MetricsScan {
        rows: map.into_values().collect(),
        n_rows_raw,
        n_duplicates_dropped,
        n_malformed,
        ends_clean,
    })
}

/// Result of a dedupe pass over a cell's metrics log.
#[derive(Debug)]
pub struct MetricsAudit {
    pub scan: MetricsScan,
    /// Whether the log was rewritten to its canonical form.
    pub rewritten: bool,
    /// Next permutation index to produce: `max(perm_index) + 1`, or 0.
    pub start_idx: u32,
}

/// Dedupe-on-resume: canonicalize the metrics log and derive the resume
/// position.
///
/// Duplicates keep their first occurrence; a partial trailing line is
/// discarded; rows beyond `n_target` (lowest indices first) are truncated.
/// The file is atomically rewritten, sorted by `perm_index`, whenever any of
/// those repairs fired. The resume position is `max(perm_index) + 1`; gaps
/// below the max are never refilled, so repeated crashes stay idempotent.
pub fn dedupe_metrics(path: &Path, n_target: u32) -> Result<MetricsAudit, RunnerError> {
    if !path.exists() {
        // Fresh cell: materialize the empty authoritative log.
        File::create(path)?;
        return Ok(MetricsAudit {
            scan: MetricsScan {
                ends_clean: true,
                ..MetricsScan::default()
            },
            rewritten: false,
            start_idx: 0,
        });
    }

    let mut scan = scan_metrics(path)?;
    let truncated = scan.rows.len() > n_target as usize;
    if truncated {
        scan.rows.truncate(n_target as usize);
    }

    let needs_rewrite =
        scan.n_duplicates_dropped > 0 || scan.n_malformed > 0 || !scan.ends_clean || truncated;
    if needs_rewrite {
        rewrite_metrics(path, &scan.rows)?;
    }

    let start_idx = scan.rows.last().map(|r| r.perm_index + 1).unwrap_or(0);
    Ok(MetricsAudit {
        scan,
        rewritten: needs_rewrite,
        start_idx,
    })
}

/// Atomically replace the metrics log with the canonical row set.
fn rewrite_metrics(path: &Path, rows: &[MetricsRow]) -> Result<(), RunnerError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| RunnerError::Io(std::io::Error::other(e.to_string())))?;
    atomic_write_bytes(path, &bytes)
}

// --- Human-readable cell log ---

/// Append a timestamped line to a cell's `logs.txt`. Best effort: a failure
/// here must never take down production, so it only warns.
pub fn log_line(dir: &Path, message: &str) {
    let path = dir.join(LOGS_FILE);
    let stamped = format!("[{}] {}\n", chrono::Utc::now().to_rfc3339(), message);
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(stamped.as_bytes()));
    if let Err(e) = result {
        tracing::warn!("failed to append to {}: {e}", path.display());
    }
}
