//! Healing orchestrator.
//!
//! When validation keeps failing at the same click, the orchestrator asks
//! the external vision locator where the element moved, applies the
//! proposed coordinates through the updater (which backs up first), re-runs
//! the workflow from the failed step, and only promotes a new baseline once
//! the re-run verifies. Every step of the protocol is an explicit attempt
//! loop — no event-driven callback chains.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vigil::{
    with_retries, ElementLocator, EngineError, LocateRequest, ScreenCapture, WorkflowDefinition,
};
use vigil_store::{CorrectionRecord, Database, SaveBaseline};

use crate::config::EngineConfig;
use crate::runner::WorkflowRunner;
use crate::updater::WorkflowUpdater;

/// Result of one healing invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HealOutcome {
    /// Preconditions were not met; nothing was attempted.
    Skipped { reason: String },
    /// The action was fixed and the full re-run verified.
    Healed {
        action_index: usize,
        new_x: i32,
        new_y: i32,
        attempts: u32,
    },
    /// The targeted action is fixed, but a later action now fails. The fix
    /// is kept; the caller must treat the run as failed overall.
    PartiallyHealed {
        fixed_index: usize,
        new_failure_index: usize,
        new_x: i32,
        new_y: i32,
        reason: String,
    },
    /// All attempts exhausted; the workflow is back in its pre-healing
    /// coordinate state.
    Failed { reason: String },
}

pub struct HealingOrchestrator {
    capture: Arc<dyn ScreenCapture>,
    locator: Arc<dyn ElementLocator>,
    runner: WorkflowRunner,
    db: Database,
    config: EngineConfig,
}

impl HealingOrchestrator {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        locator: Arc<dyn ElementLocator>,
        runner: WorkflowRunner,
        db: Database,
        config: EngineConfig,
    ) -> Self {
        Self {
            capture,
            locator,
            runner,
            db,
            config,
        }
    }

    /// Attempt to heal `failing_index` of `workflow` after run `run_id`
    /// failed validation there with `score` against `threshold`.
    #[instrument(skip(self, updater), fields(workflow, failing_index))]
    pub async fn heal(
        &self,
        updater: &mut WorkflowUpdater,
        workflow: &str,
        run_id: i64,
        failing_index: usize,
        score: f64,
        threshold: f64,
    ) -> Result<HealOutcome, EngineError> {
        // Guard: healing is only for visual mismatches, not for runs that
        // failed for unrelated reasons.
        if score >= threshold {
            return Ok(HealOutcome::Skipped {
                reason: format!(
                    "similarity {score:.2} is not below threshold {threshold:.2}, nothing to heal"
                ),
            });
        }

        // Guard: a single glitch (slow popup, loading spinner) is not worth
        // rewriting coordinates over.
        let consecutive = self.db.consecutive_failures_at(workflow, failing_index)?;
        if consecutive < self.config.min_consecutive_failures {
            return Ok(HealOutcome::Skipped {
                reason: format!(
                    "only {consecutive} consecutive failure(s) at action {failing_index}, need {}",
                    self.config.min_consecutive_failures
                ),
            });
        }

        let baseline = self.db.get_baseline(workflow, failing_index)?;
        let failing_region = self
            .db
            .list_screenshots(run_id)?
            .into_iter()
            .find(|s| s.action_index == failing_index)
            .map(|s| s.image);

        let max_attempts = self.config.max_heal_attempts.max(1);
        for attempt in 1..=max_attempts {
            debug!("Healing attempt {attempt}/{max_attempts} for action {failing_index}");

            let definition = updater.load().await?;
            let previous = updater.get_coordinates(failing_index).await?;

            let frame = with_retries(
                "full-frame capture",
                self.config.collaborator_attempts,
                self.config.retry_delay(),
                || self.capture.capture_frame(),
            )
            .await?;
            let (frame_w, frame_h) = (frame.width, frame.height);

            let mut context_images = Vec::new();
            if let Some(b) = &baseline {
                context_images.push(b.image.clone());
            }
            if let Some(region) = &failing_region {
                context_images.push(region.clone());
            }

            let request = LocateRequest {
                frame,
                description: definition.action_description(failing_index),
                previous,
                context_images,
            };

            // The locator crosses a network boundary; a slow or failed call
            // consumes an attempt rather than hanging or aborting the run.
            let response = match tokio::time::timeout(
                self.config.locator_timeout(),
                self.locator.locate(request),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!("Locator call failed on attempt {attempt}: {e}");
                    continue;
                }
                Err(_) => {
                    warn!("Locator call timed out on attempt {attempt}");
                    continue;
                }
            };

            let (new_x, new_y) =
                match response.accept(frame_w, frame_h, self.config.locator_min_confidence) {
                    Ok(coords) => coords,
                    Err(rejection) => {
                        warn!("Locator result rejected on attempt {attempt}: {rejection}");
                        continue;
                    }
                };

            info!(
                "Locator proposed ({new_x}, {new_y}) for action {failing_index} \
                 (confidence {:.2}): {}",
                response.confidence, response.reasoning
            );

            let update_reason = format!(
                "relocated by element locator with confidence {:.2} after \
                 {consecutive} consecutive failures",
                response.confidence
            );
            if let Err(e) = updater
                .update_coordinates(failing_index, new_x, new_y, &update_reason)
                .await
            {
                // Do not leave a half-applied update behind.
                if let Err(rb) = updater.rollback().await {
                    warn!("rollback after failed update also failed: {rb}");
                }
                return Err(e);
            }

            let updated = updater.load().await?;
            let job_id = format!("heal-{}", Uuid::new_v4());
            let verdict = match self
                .runner
                .run_from(&updated, Some(&job_id), failing_index)
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    if let Err(rb) = updater.rollback().await {
                        warn!("rollback after failed re-run also failed: {rb}");
                    }
                    return Err(e);
                }
            };

            if verdict.success {
                self.promote(
                    workflow,
                    &updated,
                    failing_index,
                    previous,
                    (new_x, new_y),
                    baseline.as_ref().map(|b| b.image.as_slice()),
                    baseline.as_ref().map(|b| b.match_threshold),
                    consecutive,
                )
                .await?;
                info!(
                    "Healed action {failing_index} of '{workflow}' at ({new_x}, {new_y}) \
                     on attempt {attempt}"
                );
                return Ok(HealOutcome::Healed {
                    action_index: failing_index,
                    new_x,
                    new_y,
                    attempts: attempt,
                });
            }

            match verdict.failure_index {
                Some(index) if index == failing_index => {
                    // The proposed coordinates did not fix it. Discard them
                    // and try again.
                    updater.rollback().await?;
                    warn!("Re-run still fails at action {failing_index}, attempt {attempt} discarded");
                }
                Some(later_index) => {
                    // The targeted action now passes; a downstream step is
                    // broken for some other reason. Keep the fix.
                    self.promote(
                        workflow,
                        &updated,
                        failing_index,
                        previous,
                        (new_x, new_y),
                        baseline.as_ref().map(|b| b.image.as_slice()),
                        baseline.as_ref().map(|b| b.match_threshold),
                        consecutive,
                    )
                    .await?;
                    let reason = format!(
                        "fixed action {failing_index}, but action {later_index} now fails: {}",
                        verdict.reason.as_deref().unwrap_or("unknown")
                    );
                    warn!("{reason}");
                    return Ok(HealOutcome::PartiallyHealed {
                        fixed_index: failing_index,
                        new_failure_index: later_index,
                        new_x,
                        new_y,
                        reason,
                    });
                }
                None => {
                    return Err(EngineError::Internal(
                        "failed verdict without a failure index".to_string(),
                    ));
                }
            }
        }

        Ok(HealOutcome::Failed {
            reason: format!(
                "could not fix action {failing_index} of '{workflow}' after \
                 {max_attempts} attempt(s); coordinates left unchanged"
            ),
        })
    }

    /// Promote a verified fix: fresh baseline at the new coordinates plus
    /// one append-only correction record.
    #[allow(clippy::too_many_arguments)]
    async fn promote(
        &self,
        workflow: &str,
        definition: &WorkflowDefinition,
        action_index: usize,
        old: (i32, i32),
        new: (i32, i32),
        old_image: Option<&[u8]>,
        old_threshold: Option<f64>,
        consecutive: u32,
    ) -> Result<(), EngineError> {
        let region = with_retries(
            "baseline region capture",
            self.config.collaborator_attempts,
            self.config.retry_delay(),
            || {
                self.capture
                    .capture_region(new.0, new.1, self.config.region_box_size)
            },
        )
        .await?;
        let png = region.to_png()?;

        self.db.save_baseline(SaveBaseline {
            workflow,
            action_index,
            action_kind: "click",
            x: new.0,
            y: new.1,
            image: &png,
            description: &definition.action_description(action_index),
            match_threshold: old_threshold.unwrap_or(self.config.default_match_threshold),
        })?;

        self.db.append_correction(CorrectionRecord {
            workflow,
            action_index,
            old_x: old.0,
            old_y: old.1,
            new_x: new.0,
            new_y: new.1,
            old_image,
            new_image: Some(&png),
            reason: "element relocated by vision locator, verified by re-run",
            consecutive_failures: consecutive,
        })?;
        Ok(())
    }
}
