use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil::{CompareStrategy, EngineError};

/// Engine tuning knobs. Every field has a default so a deployment can ship
/// a partial JSON config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Side length of the square region captured around each click target.
    pub region_box_size: u32,
    /// Scoring strategy for baseline comparison.
    pub compare_strategy: CompareStrategy,
    /// Threshold applied to newly bootstrapped baselines. Individual
    /// baselines may be relaxed afterwards for dynamic regions.
    pub default_match_threshold: f64,
    /// Minimum locator confidence before a proposed coordinate is trusted.
    pub locator_min_confidence: f64,
    /// Healing attempts per failing action.
    pub max_heal_attempts: u32,
    /// Consecutive validation failures at the same index required before
    /// healing is considered. Guards against transient glitches.
    pub min_consecutive_failures: u32,
    /// Timeout for a single locator call, which crosses a network boundary.
    pub locator_timeout_ms: u64,
    /// Total tries for capture and injection calls (1 = no retry).
    pub collaborator_attempts: u32,
    /// Delay between collaborator retries.
    pub retry_delay_ms: u64,
    /// A `running` run older than this is treated as abandoned.
    pub stale_run_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            region_box_size: 100,
            compare_strategy: CompareStrategy::Ssim,
            default_match_threshold: 0.95,
            locator_min_confidence: 0.80,
            max_heal_attempts: 3,
            min_consecutive_failures: 2,
            locator_timeout_ms: 30_000,
            collaborator_attempts: 3,
            retry_delay_ms: 250,
            stale_run_secs: 900,
        }
    }
}

impl EngineConfig {
    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            EngineError::Internal(format!("failed to read config {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Internal(format!("failed to parse config: {e}")))
    }

    pub fn locator_timeout(&self) -> Duration {
        Duration::from_millis(self.locator_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.stale_run_secs)
    }
}
