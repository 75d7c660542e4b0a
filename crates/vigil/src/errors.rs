use thiserror::Error;

/// Error taxonomy for the validation and healing engine.
///
/// Expected outcomes — a comparison scoring below threshold, a locator
/// result that fails the acceptance checks — are modeled as values
/// (`RunVerdict`, `LocatorRejection`), not as variants here. Only
/// infrastructure failures travel through this enum.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("screen capture failed: {0}")]
    CaptureFailure(String),

    #[error("input injection failed: {0}")]
    InjectionFailure(String),

    #[error("element locator unavailable: {0}")]
    LocatorUnavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to persist coordinate update: {0}")]
    UpdatePersistFailure(String),

    #[error("no backup available to roll back: {0}")]
    RollbackFailure(String),

    #[error("image decode failed: {0}")]
    ImageDecode(String),

    #[error("internal error: {0}")]
    Internal(String),
}
