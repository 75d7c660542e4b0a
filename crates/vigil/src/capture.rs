//! Screen capture collaborator boundary.
//!
//! The remote-desktop transport lives behind [`ScreenCapture`]. The engine
//! only ever asks for a full frame or a fixed-size region around a click
//! target; retries and timeouts for flaky transports belong at this
//! boundary, never inside the validator.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::EngineError;
use crate::Frame;

/// Fill color used when a requested region extends past the frame edge.
/// Keeps every region capture exactly `box_size x box_size`.
pub const REGION_FILL: [u8; 4] = [128, 128, 128, 255];

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Capture the full desktop frame.
    async fn capture_frame(&self) -> Result<Frame, EngineError>;

    /// Capture a `box_size x box_size` region centered on `(x, y)`.
    ///
    /// The default implementation crops (and pads) the full frame, so
    /// transports that can only ship whole frames get region capture for
    /// free. Transports with server-side cropping should override this.
    async fn capture_region(&self, x: i32, y: i32, box_size: u32) -> Result<Frame, EngineError> {
        let frame = self.capture_frame().await?;
        Ok(crop_region(&frame, x, y, box_size))
    }
}

/// Crop a centered box out of `frame`, padding with [`REGION_FILL`] where
/// the box extends past the frame bounds.
pub fn crop_region(frame: &Frame, x: i32, y: i32, box_size: u32) -> Frame {
    let mut out = Frame::solid(box_size, box_size, REGION_FILL);
    let half = box_size as i64 / 2;
    let origin_x = x as i64 - half;
    let origin_y = y as i64 - half;

    for oy in 0..box_size as i64 {
        for ox in 0..box_size as i64 {
            let sx = origin_x + ox;
            let sy = origin_y + oy;
            if sx >= 0 && sy >= 0 && (sx as u32) < frame.width && (sy as u32) < frame.height {
                let px = frame_pixel(frame, sx as u32, sy as u32);
                out.put_pixel(ox as u32, oy as u32, px);
            }
        }
    }
    out
}

fn frame_pixel(frame: &Frame, x: u32, y: u32) -> [u8; 4] {
    let idx = (y as usize * frame.width as usize + x as usize) * 4;
    [
        frame.data[idx],
        frame.data[idx + 1],
        frame.data[idx + 2],
        frame.data[idx + 3],
    ]
}

/// Run a fallible collaborator call with a bounded number of retries.
///
/// `attempts` is the total number of tries, not the number of retries; a
/// value of 1 means no retry at all.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    warn!("{what} failed (attempt {attempt}/{attempts}), retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| EngineError::Internal(format!("{what} failed with no attempts made"))))
}
