//! Visual validation primitives for desktop workflow automation
//!
//! This crate provides the building blocks for validating replayed UI
//! workflows against a remote desktop: a typed action model, an image
//! comparator with interchangeable scoring strategies, and the collaborator
//! traits (screen capture, input injection, element location) that the
//! orchestration layer is wired with.

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

pub mod capture;
pub mod compare;
pub mod errors;
pub mod inject;
pub mod locate;
pub mod workflow;

pub use capture::{with_retries, ScreenCapture, REGION_FILL};
pub use compare::{CompareOutcome, CompareStrategy, Comparator};
pub use errors::EngineError;
pub use inject::InputInjector;
pub use locate::{ElementLocator, LocateRequest, LocateResponse, LocatorRejection};
pub use workflow::{HealingNote, WorkflowAction, WorkflowDefinition};

/// A raw RGBA frame captured from the target desktop.
///
/// Mirrors what capture collaborators hand back: pixel data plus dimensions.
/// Stored baselines and run screenshots are PNG-encoded before they hit the
/// database, so the type carries codec helpers in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Raw image data (RGBA, row-major)
    pub data: Vec<u8>,
    /// Width of the image
    pub width: u32,
    /// Height of the image
    pub height: u32,
}

impl Frame {
    /// Build a frame from raw RGBA bytes.
    ///
    /// Returns `InvalidArgument`-style errors as `EngineError::Internal`
    /// when the buffer length does not match the dimensions.
    pub fn from_rgba(data: Vec<u8>, width: u32, height: u32) -> Result<Self, EngineError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(EngineError::Internal(format!(
                "RGBA buffer length {} does not match {}x{} frame",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// A uniformly colored frame. Handy for fills and test fixtures.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgba);
        }
        Self {
            data,
            width,
            height,
        }
    }

    /// Encode the frame as PNG bytes.
    pub fn to_png(&self) -> Result<Vec<u8>, EngineError> {
        let img = RgbaImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(
            || EngineError::Internal("frame buffer does not match its dimensions".to_string()),
        )?;
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .map_err(|e| EngineError::ImageDecode(format!("PNG encode failed: {e}")))?;
        Ok(out.into_inner())
    }

    /// Decode PNG (or any format `image` sniffs) bytes into a frame.
    pub fn from_png(bytes: &[u8]) -> Result<Self, EngineError> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| EngineError::ImageDecode(format!("image decode failed: {e}")))?
            .to_rgba8();
        let (width, height) = img.dimensions();
        Ok(Self {
            data: img.into_raw(),
            width,
            height,
        })
    }

    /// Read one pixel. Callers guarantee the coordinate is in bounds.
    pub(crate) fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }

    /// Write one pixel. Out-of-bounds writes are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        self.data[idx..idx + 4].copy_from_slice(&rgba);
    }

    /// Fill an axis-aligned rectangle, clipped to the frame.
    pub fn fill_rect(&mut self, x: i64, y: i64, w: u32, h: u32, rgba: [u8; 4]) {
        for dy in 0..h as i64 {
            for dx in 0..w as i64 {
                let (px, py) = (x + dx, y + dy);
                if px >= 0 && py >= 0 {
                    self.put_pixel(px as u32, py as u32, rgba);
                }
            }
        }
    }
}
