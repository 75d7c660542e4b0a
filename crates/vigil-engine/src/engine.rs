//! Engine façade: wires the collaborators, the store and the config
//! together and drives run → validate → heal → re-verify under an exclusive
//! per-workflow lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument};
use vigil::{Comparator, ElementLocator, EngineError, InputInjector, ScreenCapture};
use vigil_store::Database;

use crate::config::EngineConfig;
use crate::healer::{HealOutcome, HealingOrchestrator};
use crate::runner::WorkflowRunner;
use crate::updater::WorkflowUpdater;
use crate::validator::Validator;

/// Exclusive lock per workflow name. The remote desktop is a single shared,
/// stateful resource: two runs against the same workflow must never
/// interleave, healing included.
#[derive(Clone, Default)]
pub struct RunLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RunLocks {
    pub async fn acquire(&self, workflow: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock();
            map.entry(workflow.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Outcome of one `run_workflow` invocation, for the caller that polled the
/// job in the first place.
#[derive(Debug, Clone, PartialEq)]
pub enum RunReport {
    Success {
        run_id: i64,
    },
    /// Validation failed and healing was not attempted (preconditions
    /// unmet). `heal_skipped` says why.
    ValidationFailed {
        run_id: i64,
        failure_index: usize,
        reason: String,
        heal_skipped: String,
    },
    /// Healing fixed the action and the re-run verified end to end.
    Healed {
        action_index: usize,
        new_x: i32,
        new_y: i32,
    },
    /// The failing action was fixed but a later one now fails; overall the
    /// run is a failure, but the fix is kept.
    PartiallyHealed {
        fixed_index: usize,
        new_failure_index: usize,
        reason: String,
    },
    /// Healing could not fix the action; coordinates are unchanged.
    HealFailed {
        failure_index: usize,
        reason: String,
    },
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self, RunReport::Success { .. } | RunReport::Healed { .. })
    }
}

/// The validation and self-healing engine. Collaborators are injected, so
/// tests run against scripted fakes.
pub struct Engine {
    runner: WorkflowRunner,
    healer: HealingOrchestrator,
    db: Database,
    config: EngineConfig,
    locks: RunLocks,
}

impl Engine {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        injector: Arc<dyn InputInjector>,
        locator: Arc<dyn ElementLocator>,
        db: Database,
        config: EngineConfig,
    ) -> Self {
        let validator = Validator::new(
            db.clone(),
            Comparator::new(config.compare_strategy),
            config.default_match_threshold,
        );
        let runner = WorkflowRunner::new(capture.clone(), injector, validator, config.clone());
        let healer = HealingOrchestrator::new(
            capture,
            locator,
            runner.clone(),
            db.clone(),
            config.clone(),
        );
        Self {
            runner,
            healer,
            db,
            config,
            locks: RunLocks::default(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Execute the workflow at `path` end to end: run, validate, and heal
    /// if validation keeps failing at one step. Holds the workflow's
    /// exclusive lock for the whole cycle.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn run_workflow(
        &self,
        path: &Path,
        job_id: Option<&str>,
    ) -> Result<RunReport, EngineError> {
        let mut updater = WorkflowUpdater::new(path);
        let definition = updater.load().await?;
        let click_indices = definition.click_indices();

        let _guard = self.locks.acquire(&definition.name).await;

        // Reconciliation: anything still `running` from a dead process is
        // finalized as aborted before we start a new run.
        self.db.reap_stale_runs(self.config.staleness())?;

        self.db
            .upsert_workflow(&definition.name, definition.actions.len(), 0)?;
        let coverage = self.db.coverage(&definition.name, &click_indices)?;
        self.db.upsert_workflow(
            &definition.name,
            definition.actions.len(),
            coverage.with_baseline,
        )?;
        if coverage.is_first_run() {
            debug!(
                "No baselines for '{}' yet; this run will bootstrap them",
                definition.name
            );
        }

        let verdict = self.runner.run_from(&definition, job_id, 0).await?;
        if verdict.success {
            info!("Run {} of '{}' succeeded", verdict.run_id, definition.name);
            self.refresh_validated_count(&definition.name, &click_indices, definition.actions.len())?;
            return Ok(RunReport::Success {
                run_id: verdict.run_id,
            });
        }

        let failure_index = verdict
            .failure_index
            .ok_or_else(|| EngineError::Internal("failed verdict without index".to_string()))?;
        let score = verdict.failure_score.unwrap_or(0.0);
        let threshold = verdict
            .failure_threshold
            .unwrap_or(self.config.default_match_threshold);

        let outcome = self
            .healer
            .heal(
                &mut updater,
                &definition.name,
                verdict.run_id,
                failure_index,
                score,
                threshold,
            )
            .await?;

        self.refresh_validated_count(&definition.name, &click_indices, definition.actions.len())?;

        Ok(match outcome {
            HealOutcome::Skipped { reason } => RunReport::ValidationFailed {
                run_id: verdict.run_id,
                failure_index,
                reason: verdict.reason.unwrap_or_default(),
                heal_skipped: reason,
            },
            HealOutcome::Healed {
                action_index,
                new_x,
                new_y,
                ..
            } => RunReport::Healed {
                action_index,
                new_x,
                new_y,
            },
            HealOutcome::PartiallyHealed {
                fixed_index,
                new_failure_index,
                reason,
                ..
            } => RunReport::PartiallyHealed {
                fixed_index,
                new_failure_index,
                reason,
            },
            HealOutcome::Failed { reason } => RunReport::HealFailed {
                failure_index,
                reason,
            },
        })
    }

    fn refresh_validated_count(
        &self,
        workflow: &str,
        click_indices: &[usize],
        total_actions: usize,
    ) -> Result<(), EngineError> {
        let coverage = self.db.coverage(workflow, click_indices)?;
        self.db
            .upsert_workflow(workflow, total_actions, coverage.with_baseline)?;
        Ok(())
    }
}
