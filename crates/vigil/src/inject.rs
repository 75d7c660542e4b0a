//! Input injection collaborator boundary.

use async_trait::async_trait;

use crate::errors::EngineError;

/// Performs the physical input actions against the target desktop.
///
/// All methods are fire-and-report: success or an [`EngineError`], no
/// payload. Human-like timing and motion curves are the implementor's
/// concern, not the engine's.
#[async_trait]
pub trait InputInjector: Send + Sync {
    /// Click at absolute screen coordinates.
    async fn click(&self, x: i32, y: i32) -> Result<(), EngineError>;

    /// Type text into the focused element.
    async fn type_text(&self, text: &str) -> Result<(), EngineError>;

    /// Press a single named key ("enter", "tab", ...).
    async fn press(&self, key: &str) -> Result<(), EngineError>;
}
