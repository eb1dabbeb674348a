use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("missing input file: {0}")]
    MissingInput(PathBuf),

    #[error("schema error in {path} (row {row}): {message}")]
    Schema {
        path: PathBuf,
        row: usize,
        message: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Convenience constructor for per-row schema violations.
    pub fn schema(path: impl Into<PathBuf>, row: usize, message: impl Into<String>) -> Self {
        Self::Schema {
            path: path.into(),
            row,
            message: message.into(),
        }
    }
}
