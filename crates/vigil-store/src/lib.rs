//! SQLite persistence for the validation engine.
//!
//! Owns the five durable entities: workflows, click baselines, workflow
//! runs, per-run screenshots, and the append-only correction log.

mod db;
mod models;

pub use db::Database;
pub use models::{
    BaselineCoverage, BaselineRow, CorrectionRecord, CorrectionRow, RunRow, RunStatus,
    SaveBaseline, ScreenshotRow, WorkflowRow,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for vigil::EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvariantViolation(msg) => vigil::EngineError::Internal(msg),
            other => vigil::EngineError::Storage(other.to_string()),
        }
    }
}
