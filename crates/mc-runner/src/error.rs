use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("engine error: {0}")]
    Engine(#[from] mc_engine::EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("cell {cell_id}: expected {expected} unique permutations, found {actual}")]
    Integrity {
        cell_id: String,
        expected: u32,
        actual: u64,
    },

    #[error("cell {cell_id}: stalled after repeated I/O failures")]
    Stalled { cell_id: String },
}
