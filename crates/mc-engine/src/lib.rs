pub mod error;
pub mod inputs;
pub mod kernel;
pub mod models;
pub mod seeding;
pub mod summary;


pub use error::EngineError;
pub use inputs::load_inputs;
pub use kernel::{run_permutation, SimScratch};
pub use models::*;
pub use summary::{summarize_cell, CellSummary, DedupeStats, MetricSummary};
