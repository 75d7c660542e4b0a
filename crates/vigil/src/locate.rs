//! Element locator collaborator boundary.
//!
//! The locator is an external vision capability that proposes where a moved
//! UI element now lives. It is an untrusted, possibly slow, possibly wrong
//! oracle: every response passes the acceptance checks in
//! [`LocateResponse::accept`] before a single coordinate is written.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::Frame;

/// Request sent to the vision capability.
#[derive(Debug, Clone)]
pub struct LocateRequest {
    /// Full desktop frame to search.
    pub frame: Frame,
    /// Natural-language description of the element ("the blue Submit button").
    pub description: String,
    /// Where the element used to be.
    pub previous: (i32, i32),
    /// Optional baseline / failing region pair for extra context.
    pub context_images: Vec<Vec<u8>>,
}

/// Raw locator answer, before any trust is placed in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocateResponse {
    pub found: bool,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Why a locator response was not acted on. Consumes a healing attempt,
/// never fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum LocatorRejection {
    NotFound,
    OutOfBounds { x: i32, y: i32 },
    LowConfidence { confidence: f64, required: f64 },
}

impl std::fmt::Display for LocatorRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocatorRejection::NotFound => write!(f, "locator reported element not found"),
            LocatorRejection::OutOfBounds { x, y } => {
                write!(f, "proposed coordinates ({x}, {y}) fall outside the frame")
            }
            LocatorRejection::LowConfidence {
                confidence,
                required,
            } => write!(f, "confidence {confidence:.2} below required {required:.2}"),
        }
    }
}

impl LocateResponse {
    /// Apply the acceptance checks: found, in-bounds for the frame the
    /// locator saw, and confident enough. Returns the coordinates only if
    /// all three hold.
    pub fn accept(
        &self,
        frame_width: u32,
        frame_height: u32,
        min_confidence: f64,
    ) -> Result<(i32, i32), LocatorRejection> {
        if !self.found {
            return Err(LocatorRejection::NotFound);
        }
        if self.x < 0
            || self.y < 0
            || self.x >= frame_width as i32
            || self.y >= frame_height as i32
        {
            return Err(LocatorRejection::OutOfBounds {
                x: self.x,
                y: self.y,
            });
        }
        if self.confidence < min_confidence {
            return Err(LocatorRejection::LowConfidence {
                confidence: self.confidence,
                required: min_confidence,
            });
        }
        Ok((self.x, self.y))
    }
}

#[async_trait]
pub trait ElementLocator: Send + Sync {
    /// Ask the vision capability where the described element is now.
    ///
    /// Implementations cross a network boundary; callers wrap this in an
    /// explicit timeout.
    async fn locate(&self, request: LocateRequest) -> Result<LocateResponse, EngineError>;
}
