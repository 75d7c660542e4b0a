//! Executes workflow actions against the collaborators and feeds the
//! validator.
//!
//! Ordering guarantee: the region for action `i` is captured and durably
//! persisted strictly before the click for action `i` is injected.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};
use vigil::{with_retries, EngineError, InputInjector, ScreenCapture, WorkflowAction, WorkflowDefinition};

use crate::config::EngineConfig;
use crate::validator::{RunVerdict, Validator};

#[derive(Clone)]
pub struct WorkflowRunner {
    capture: Arc<dyn ScreenCapture>,
    injector: Arc<dyn InputInjector>,
    validator: Validator,
    config: EngineConfig,
}

impl WorkflowRunner {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        injector: Arc<dyn InputInjector>,
        validator: Validator,
        config: EngineConfig,
    ) -> Self {
        Self {
            capture,
            injector,
            validator,
            config,
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Execute the workflow from `start_index` to the end, then validate.
    ///
    /// Collaborator failures abort the run (finalized as `failed`) and
    /// propagate; validation mismatches are reported through the verdict,
    /// never as errors.
    #[instrument(skip(self, definition), fields(workflow = %definition.name))]
    pub async fn run_from(
        &self,
        definition: &WorkflowDefinition,
        job_id: Option<&str>,
        start_index: usize,
    ) -> Result<RunVerdict, EngineError> {
        let mut session = self.validator.start_run(&definition.name, job_id)?;

        for (index, action) in definition.actions.iter().enumerate().skip(start_index) {
            let result = self.perform(&mut session, index, action).await;
            if let Err(e) = result {
                let reason = format!("action {index} failed: {e}");
                self.validator.abort_run(&mut session, &reason)?;
                return Err(e);
            }
            self.validator.touch_run(&session)?;
        }

        self.validator.validate_run(&mut session, definition)
    }

    async fn perform(
        &self,
        session: &mut crate::validator::RunSession,
        index: usize,
        action: &WorkflowAction,
    ) -> Result<(), EngineError> {
        let attempts = self.config.collaborator_attempts;
        let delay = self.config.retry_delay();

        match action {
            WorkflowAction::Click { x, y, .. } => {
                let region = with_retries("region capture", attempts, delay, || {
                    self.capture
                        .capture_region(*x, *y, self.config.region_box_size)
                })
                .await?;
                // Durable before the click lands.
                self.validator
                    .record_capture(session, index, *x, *y, &region)?;
                with_retries("click", attempts, delay, || self.injector.click(*x, *y)).await?;
                debug!("Clicked ({x}, {y}) for action {index}");
            }
            WorkflowAction::Type { text } => {
                with_retries("type", attempts, delay, || self.injector.type_text(text)).await?;
            }
            WorkflowAction::Paste { content } => {
                // Paste content travels on the action; injected as text so
                // no shared clipboard state exists between steps.
                with_retries("paste", attempts, delay, || self.injector.type_text(content))
                    .await?;
            }
            WorkflowAction::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
        }
        Ok(())
    }
}
