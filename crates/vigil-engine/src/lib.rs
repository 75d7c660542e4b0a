//! Run validation, coordinate healing and baseline promotion.
//!
//! The engine drives a workflow against the remote desktop through
//! dependency-injected collaborators, snapshots a region around every click
//! before it lands, validates the snapshots against stored baselines at run
//! end, and — after repeated failures at the same step — relocates the moved
//! element via the external vision locator, applies the corrected
//! coordinates with backup/rollback, and re-verifies before promoting new
//! baselines.

pub mod config;
pub mod engine;
pub mod healer;
pub mod runner;
pub mod updater;
pub mod validator;

pub use config::EngineConfig;
pub use engine::{Engine, RunLocks, RunReport};
pub use healer::{HealOutcome, HealingOrchestrator};
pub use runner::WorkflowRunner;
pub use updater::WorkflowUpdater;
pub use validator::{ActionVerdict, RunSession, RunState, RunVerdict, Validator};
