//! Run validation state machine.
//!
//! `RUNNING -> {SUCCESS, VALIDATION_FAILED, ERROR}`. A session is born
//! running; the idle state before a run starts is the absence of a session.
//! Regions are captured and persisted *before* the click they belong to, so
//! a crash mid-run leaves durable evidence; validation happens once, at the
//! point the caller would otherwise report success.

use tracing::{debug, info, instrument, warn};
use vigil::{Comparator, EngineError, Frame, WorkflowDefinition};
use vigil_store::{Database, RunStatus, SaveBaseline};

/// Validator-side view of a run's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Success,
    ValidationFailed,
    Error,
}

/// In-memory buffer entry for one pre-click capture.
#[derive(Debug, Clone)]
struct CapturedRegion {
    action_index: usize,
    x: i32,
    y: i32,
    png: Vec<u8>,
}

/// One in-flight workflow execution.
#[derive(Debug)]
pub struct RunSession {
    pub run_id: i64,
    pub workflow: String,
    state: RunState,
    captures: Vec<CapturedRegion>,
}

impl RunSession {
    pub fn state(&self) -> RunState {
        self.state
    }
}

/// Comparison result for one validated action.
#[derive(Debug, Clone)]
pub struct ActionVerdict {
    pub action_index: usize,
    pub score: f64,
    pub threshold: f64,
    pub valid: bool,
    /// True when no baseline existed and this capture became one.
    pub bootstrapped: bool,
}

/// Verdict for the whole run.
#[derive(Debug, Clone)]
pub struct RunVerdict {
    pub run_id: i64,
    pub success: bool,
    /// First failing action index, in ascending order. Later mismatches are
    /// still recorded in `actions` for diagnostics but never change this.
    pub failure_index: Option<usize>,
    pub failure_score: Option<f64>,
    pub failure_threshold: Option<f64>,
    pub reason: Option<String>,
    pub actions: Vec<ActionVerdict>,
}

/// Orchestrates a single run's capture buffer and end-of-run comparison.
#[derive(Clone)]
pub struct Validator {
    db: Database,
    comparator: Comparator,
    default_threshold: f64,
}

impl Validator {
    pub fn new(db: Database, comparator: Comparator, default_threshold: f64) -> Self {
        Self {
            db,
            comparator,
            default_threshold,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Create the run record and an empty capture buffer.
    #[instrument(skip(self))]
    pub fn start_run(&self, workflow: &str, job_id: Option<&str>) -> Result<RunSession, EngineError> {
        let run_id = self.db.create_run(workflow, job_id)?;
        debug!("Run {run_id} started for workflow '{workflow}'");
        Ok(RunSession {
            run_id,
            workflow: workflow.to_string(),
            state: RunState::Running,
            captures: Vec::new(),
        })
    }

    /// Persist a pre-click region capture and buffer it for validation.
    /// Must be called before the corresponding click is injected.
    pub fn record_capture(
        &self,
        session: &mut RunSession,
        action_index: usize,
        x: i32,
        y: i32,
        region: &Frame,
    ) -> Result<(), EngineError> {
        let png = region.to_png()?;
        self.db.record_screenshot(session.run_id, action_index, &png)?;
        session.captures.push(CapturedRegion {
            action_index,
            x,
            y,
            png,
        });
        Ok(())
    }

    /// Heartbeat for the stale-run reaper. Called after every completed
    /// action, so a long run with large waits is never mistaken for a dead
    /// one.
    pub fn touch_run(&self, session: &RunSession) -> Result<(), EngineError> {
        self.db.touch_run(session.run_id)?;
        Ok(())
    }

    /// Compare every buffered capture against its baseline, in ascending
    /// action-index order, and finalize the run.
    ///
    /// Actions without a baseline pass and their capture is promoted to the
    /// first baseline (first-run bootstrap). The first mismatch fixes the
    /// reported failure index; later actions are still scored for
    /// diagnostics.
    #[instrument(skip(self, session, definition), fields(run_id = session.run_id))]
    pub fn validate_run(
        &self,
        session: &mut RunSession,
        definition: &WorkflowDefinition,
    ) -> Result<RunVerdict, EngineError> {
        let mut captures = session.captures.clone();
        captures.sort_by_key(|c| c.action_index);

        let mut actions = Vec::with_capacity(captures.len());
        let mut first_failure: Option<(usize, f64, f64)> = None;

        for capture in &captures {
            match self.db.get_baseline(&session.workflow, capture.action_index)? {
                None => {
                    self.db.save_baseline(SaveBaseline {
                        workflow: &session.workflow,
                        action_index: capture.action_index,
                        action_kind: "click",
                        x: capture.x,
                        y: capture.y,
                        image: &capture.png,
                        description: &definition.action_description(capture.action_index),
                        match_threshold: self.default_threshold,
                    })?;
                    info!(
                        "Bootstrapped baseline for '{}' action {}",
                        session.workflow, capture.action_index
                    );
                    actions.push(ActionVerdict {
                        action_index: capture.action_index,
                        score: 1.0,
                        threshold: self.default_threshold,
                        valid: true,
                        bootstrapped: true,
                    });
                }
                Some(baseline) => {
                    let outcome =
                        self.comparator
                            .compare(&baseline.image, &capture.png, baseline.match_threshold);
                    self.db.update_screenshot_verdict(
                        session.run_id,
                        capture.action_index,
                        outcome.score,
                        outcome.is_match,
                    )?;
                    if !outcome.is_match {
                        warn!(
                            "Action {} scored {:.3} against threshold {:.2}",
                            capture.action_index, outcome.score, baseline.match_threshold
                        );
                        if first_failure.is_none() {
                            first_failure = Some((
                                capture.action_index,
                                outcome.score,
                                baseline.match_threshold,
                            ));
                        }
                    }
                    actions.push(ActionVerdict {
                        action_index: capture.action_index,
                        score: outcome.score,
                        threshold: baseline.match_threshold,
                        valid: outcome.is_match,
                        bootstrapped: false,
                    });
                }
            }
        }

        let verdict = match first_failure {
            None => {
                self.db
                    .finalize_run(session.run_id, RunStatus::Success, None, None)?;
                session.state = RunState::Success;
                RunVerdict {
                    run_id: session.run_id,
                    success: true,
                    failure_index: None,
                    failure_score: None,
                    failure_threshold: None,
                    reason: None,
                    actions,
                }
            }
            Some((index, score, threshold)) => {
                let reason =
                    format!("Click {index} mismatch: {score:.2} similarity (need {threshold:.2})");
                self.db.finalize_run(
                    session.run_id,
                    RunStatus::ValidationFailed,
                    Some(index),
                    Some(&reason),
                )?;
                session.state = RunState::ValidationFailed;
                RunVerdict {
                    run_id: session.run_id,
                    success: false,
                    failure_index: Some(index),
                    failure_score: Some(score),
                    failure_threshold: Some(threshold),
                    reason: Some(reason),
                    actions,
                }
            }
        };

        debug!(
            "Run {} validated: success={} failure_index={:?}",
            session.run_id, verdict.success, verdict.failure_index
        );
        Ok(verdict)
    }

    /// Finalize a run that cannot continue (collaborator failure, external
    /// abort). Never leaves a run `running` forever.
    pub fn abort_run(&self, session: &mut RunSession, reason: &str) -> Result<(), EngineError> {
        self.db
            .finalize_run(session.run_id, RunStatus::Failed, None, Some(reason))?;
        session.state = RunState::Error;
        warn!("Run {} aborted: {reason}", session.run_id);
        Ok(())
    }
}
