//! End-to-end engine tests against scripted fake collaborators.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;
use vigil::{
    ElementLocator, EngineError, Frame, InputInjector, LocateRequest, LocateResponse,
    ScreenCapture, WorkflowAction, WorkflowDefinition,
};
use vigil_engine::{Engine, EngineConfig, RunReport};
use vigil_store::{Database, RunStatus};

const SCREEN_W: u32 = 800;
const SCREEN_H: u32 = 600;
const BG: [u8; 4] = [210, 210, 210, 255];
const BUTTON: [u8; 4] = [25, 25, 35, 255];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A desktop frame with dark "buttons" drawn centered on the given points.
fn screen_with_buttons(buttons: &[(i32, i32)]) -> Frame {
    let mut frame = Frame::solid(SCREEN_W, SCREEN_H, BG);
    for &(x, y) in buttons {
        frame.fill_rect(x as i64 - 20, y as i64 - 15, 40, 30, BUTTON);
    }
    frame
}

struct FakeScreen {
    frame: Mutex<Frame>,
}

impl FakeScreen {
    fn new(frame: Frame) -> Arc<Self> {
        Arc::new(Self {
            frame: Mutex::new(frame),
        })
    }

    fn set(&self, frame: Frame) {
        *self.frame.lock() = frame;
    }
}

#[async_trait]
impl ScreenCapture for FakeScreen {
    async fn capture_frame(&self) -> Result<Frame, EngineError> {
        Ok(self.frame.lock().clone())
    }
}

#[derive(Default)]
struct FakeInjector {
    clicks: Mutex<Vec<(i32, i32)>>,
    fail_clicks: bool,
}

#[async_trait]
impl InputInjector for FakeInjector {
    async fn click(&self, x: i32, y: i32) -> Result<(), EngineError> {
        if self.fail_clicks {
            return Err(EngineError::InjectionFailure("target unreachable".to_string()));
        }
        self.clicks.lock().push((x, y));
        Ok(())
    }

    async fn type_text(&self, _text: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn press(&self, _key: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeLocator {
    responses: Mutex<VecDeque<Result<LocateResponse, EngineError>>>,
    calls: AtomicU32,
}

impl FakeLocator {
    fn script(&self, responses: Vec<LocateResponse>) {
        self.responses.lock().extend(responses.into_iter().map(Ok));
    }

    fn script_outage(&self, message: &str) {
        self.responses
            .lock()
            .push_back(Err(EngineError::LocatorUnavailable(message.to_string())));
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ElementLocator for FakeLocator {
    async fn locate(&self, _request: LocateRequest) -> Result<LocateResponse, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses.lock().pop_front().unwrap_or(Ok(LocateResponse {
            found: false,
            x: 0,
            y: 0,
            confidence: 0.0,
            reasoning: "nothing scripted".to_string(),
        }))
    }
}

struct Harness {
    engine: Engine,
    screen: Arc<FakeScreen>,
    injector: Arc<FakeInjector>,
    locator: Arc<FakeLocator>,
    workflow_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new(definition: WorkflowDefinition, frame: Frame) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let workflow_path = dir.path().join(format!("{}.json", definition.name));
        tokio::fs::write(&workflow_path, definition.to_json_pretty().unwrap())
            .await
            .unwrap();

        let screen = FakeScreen::new(frame);
        let injector = Arc::new(FakeInjector::default());
        let locator = Arc::new(FakeLocator::default());
        let config = EngineConfig {
            retry_delay_ms: 1,
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            screen.clone(),
            injector.clone(),
            locator.clone(),
            Database::open_memory().unwrap(),
            config,
        );
        Self {
            engine,
            screen,
            injector,
            locator,
            workflow_path,
            _dir: dir,
        }
    }

    async fn run(&self, job_id: Option<&str>) -> Result<RunReport, EngineError> {
        self.engine.run_workflow(&self.workflow_path, job_id).await
    }

    async fn definition_on_disk(&self) -> WorkflowDefinition {
        WorkflowDefinition::load(&self.workflow_path).await.unwrap()
    }

    fn db(&self) -> &Database {
        self.engine.db()
    }
}

fn two_click_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "invoice-entry",
        vec![
            WorkflowAction::Click {
                x: 100,
                y: 100,
                description: "the Invoices menu entry".to_string(),
            },
            WorkflowAction::Type {
                text: "INV-42".to_string(),
            },
            WorkflowAction::Click {
                x: 300,
                y: 200,
                description: "the blue Submit button".to_string(),
            },
        ],
    )
}

#[tokio::test]
async fn first_run_bootstraps_then_matching_run_succeeds() {
    let h = Harness::new(
        two_click_workflow(),
        screen_with_buttons(&[(100, 100), (300, 200)]),
    )
    .await;

    // First run: no baselines, auto-pass, captures become baselines.
    let report = h.run(Some("job-1")).await.unwrap();
    assert!(matches!(report, RunReport::Success { .. }));
    assert_eq!(h.injector.clicks.lock().as_slice(), &[(100, 100), (300, 200)]);
    assert!(h.db().get_baseline("invoice-entry", 0).unwrap().is_some());
    assert!(h.db().get_baseline("invoice-entry", 2).unwrap().is_some());

    // Second run against an unchanged screen: similarity 1.0 everywhere.
    let report = h.run(Some("job-2")).await.unwrap();
    let RunReport::Success { run_id } = report else {
        panic!("expected success, got {report:?}");
    };
    let shots = h.db().list_screenshots(run_id).unwrap();
    assert_eq!(shots.len(), 2);
    assert!(shots.iter().all(|s| s.is_match == Some(true)));
    assert_eq!(h.locator.calls(), 0);

    let workflow = h.db().get_workflow("invoice-entry").unwrap().unwrap();
    assert_eq!(workflow.total_actions, 3);
    assert_eq!(workflow.validated_actions, 2);
}

#[tokio::test]
async fn small_rendering_drift_still_validates() {
    let h = Harness::new(
        two_click_workflow(),
        screen_with_buttons(&[(100, 100), (300, 200)]),
    )
    .await;
    h.run(None).await.unwrap(); // bootstrap

    // A theme update shifted a few background pixels near Submit. The
    // candidate bytes differ from the baseline, so the verdict must come
    // from the similarity score, not from hash equality.
    let mut drifted = screen_with_buttons(&[(100, 100), (300, 200)]);
    drifted.fill_rect(322, 210, 8, 8, [200, 200, 200, 255]);
    h.screen.set(drifted);

    let report = h.run(None).await.unwrap();
    let RunReport::Success { run_id } = report else {
        panic!("expected success, got {report:?}");
    };

    let shots = h.db().list_screenshots(run_id).unwrap();
    let submit = shots.iter().find(|s| s.action_index == 2).unwrap();
    assert_eq!(submit.is_match, Some(true));
    let score = submit.similarity.unwrap();
    assert!(
        score > 0.95 && score < 1.0,
        "score {score} not strictly between threshold and 1.0"
    );
}

#[tokio::test]
async fn moved_element_is_healed_after_two_consecutive_failures() {
    let h = Harness::new(
        two_click_workflow(),
        screen_with_buttons(&[(100, 100), (300, 200)]),
    )
    .await;
    h.run(None).await.unwrap(); // bootstrap

    // The target app shipped a new layout: Submit moved.
    h.screen.set(screen_with_buttons(&[(100, 100), (520, 350)]));

    // First failure: transient-glitch guard keeps healing off.
    let report = h.run(None).await.unwrap();
    let RunReport::ValidationFailed {
        failure_index,
        reason,
        heal_skipped,
        ..
    } = report
    else {
        panic!("expected validation failure, got {report:?}");
    };
    assert_eq!(failure_index, 2);
    assert!(reason.starts_with("Click 2 mismatch:"), "reason: {reason}");
    assert!(heal_skipped.contains("consecutive"), "skip: {heal_skipped}");
    assert_eq!(h.locator.calls(), 0);

    // Second consecutive failure at the same index: healing engages.
    h.locator.script(vec![LocateResponse {
        found: true,
        x: 520,
        y: 350,
        confidence: 0.92,
        reasoning: "matched button shape near previous location".to_string(),
    }]);
    let report = h.run(None).await.unwrap();
    assert_eq!(
        report,
        RunReport::Healed {
            action_index: 2,
            new_x: 520,
            new_y: 350
        }
    );
    assert_eq!(h.locator.calls(), 1);

    // The workflow file now carries the corrected coordinates plus one
    // healing-history note.
    let definition = h.definition_on_disk().await;
    assert_eq!(definition.actions[2].coordinates(), Some((520, 350)));
    assert_eq!(definition.healing_history.len(), 1);
    assert_eq!(definition.healing_history[0].old_x, 300);

    // The baseline was promoted to the new location.
    let baseline = h.db().get_baseline("invoice-entry", 2).unwrap().unwrap();
    assert_eq!((baseline.x, baseline.y), (520, 350));

    // Exactly one append-only correction record.
    let corrections = h.db().list_corrections("invoice-entry").unwrap();
    assert_eq!(corrections.len(), 1);
    assert_eq!((corrections[0].old_x, corrections[0].old_y), (300, 200));
    assert_eq!((corrections[0].new_x, corrections[0].new_y), (520, 350));
    assert_eq!(corrections[0].consecutive_failures, 2);

    // And the next run just works.
    let report = h.run(None).await.unwrap();
    assert!(matches!(report, RunReport::Success { .. }));
}

#[tokio::test]
async fn locator_outage_consumes_one_attempt_not_the_run() {
    let h = Harness::new(
        two_click_workflow(),
        screen_with_buttons(&[(100, 100), (300, 200)]),
    )
    .await;
    h.run(None).await.unwrap();

    h.screen.set(screen_with_buttons(&[(100, 100), (520, 350)]));
    h.run(None).await.unwrap(); // failure #1, heal skipped

    // First call hits a transient outage; the retry on attempt two lands.
    h.locator.script_outage("vision endpoint unreachable");
    h.locator.script(vec![LocateResponse {
        found: true,
        x: 520,
        y: 350,
        confidence: 0.92,
        reasoning: String::new(),
    }]);

    let report = h.run(None).await.unwrap();
    assert_eq!(
        report,
        RunReport::Healed {
            action_index: 2,
            new_x: 520,
            new_y: 350
        }
    );
    assert_eq!(h.locator.calls(), 2);
}

#[tokio::test]
async fn locator_not_found_exhausts_attempts_and_changes_nothing() {
    let h = Harness::new(
        two_click_workflow(),
        screen_with_buttons(&[(100, 100), (300, 200)]),
    )
    .await;
    h.run(None).await.unwrap();
    let baseline_before = h.db().get_baseline("invoice-entry", 2).unwrap().unwrap();

    h.screen.set(screen_with_buttons(&[(100, 100), (520, 350)]));
    h.run(None).await.unwrap(); // failure #1, heal skipped

    // Locator never finds anything; every miss consumes one attempt.
    let report = h.run(None).await.unwrap();
    let RunReport::HealFailed {
        failure_index,
        reason,
    } = report
    else {
        panic!("expected heal failure, got {report:?}");
    };
    assert_eq!(failure_index, 2);
    assert!(reason.contains("after 3 attempt(s)"), "reason: {reason}");
    assert_eq!(h.locator.calls(), 3);

    // Original coordinates untouched, no baseline overwrite, no corrections.
    let definition = h.definition_on_disk().await;
    assert_eq!(definition.actions[2].coordinates(), Some((300, 200)));
    assert!(definition.healing_history.is_empty());
    let baseline_after = h.db().get_baseline("invoice-entry", 2).unwrap().unwrap();
    assert_eq!(baseline_before.image_hash, baseline_after.image_hash);
    assert!(h.db().list_corrections("invoice-entry").unwrap().is_empty());
}

#[tokio::test]
async fn low_confidence_result_never_writes_coordinates() {
    let h = Harness::new(
        two_click_workflow(),
        screen_with_buttons(&[(100, 100), (300, 200)]),
    )
    .await;
    h.run(None).await.unwrap();

    h.screen.set(screen_with_buttons(&[(100, 100), (520, 350)]));
    h.run(None).await.unwrap();

    // Right place, but the locator is not sure enough.
    h.locator.script(vec![
        LocateResponse {
            found: true,
            x: 520,
            y: 350,
            confidence: 0.50,
            reasoning: String::new(),
        };
        3
    ]);
    let report = h.run(None).await.unwrap();
    assert!(matches!(report, RunReport::HealFailed { .. }));

    // No write ever happened: no history note, no backup churn, old coords.
    let definition = h.definition_on_disk().await;
    assert_eq!(definition.actions[2].coordinates(), Some((300, 200)));
    assert!(definition.healing_history.is_empty());
}

#[tokio::test]
async fn wrong_guess_is_rolled_back_each_attempt() {
    let h = Harness::new(
        two_click_workflow(),
        screen_with_buttons(&[(100, 100), (300, 200)]),
    )
    .await;
    h.run(None).await.unwrap();
    let file_before = tokio::fs::read(&h.workflow_path).await.unwrap();

    h.screen.set(screen_with_buttons(&[(100, 100), (520, 350)]));
    h.run(None).await.unwrap();

    // Confident but wrong: points at empty background every time.
    h.locator.script(vec![
        LocateResponse {
            found: true,
            x: 600,
            y: 480,
            confidence: 0.95,
            reasoning: String::new(),
        };
        3
    ]);
    let report = h.run(None).await.unwrap();
    assert!(matches!(report, RunReport::HealFailed { .. }));
    assert_eq!(h.locator.calls(), 3);

    // Every attempt was applied and rolled back; the file is byte-identical
    // to its pre-healing state.
    let file_after = tokio::fs::read(&h.workflow_path).await.unwrap();
    assert_eq!(file_before, file_after);
}

#[tokio::test]
async fn downstream_failure_after_fix_is_partial_success() {
    let definition = WorkflowDefinition::new(
        "three-step",
        vec![
            WorkflowAction::Click {
                x: 100,
                y: 100,
                description: "step one".to_string(),
            },
            WorkflowAction::Click {
                x: 300,
                y: 200,
                description: "step two".to_string(),
            },
            WorkflowAction::Click {
                x: 600,
                y: 400,
                description: "step three".to_string(),
            },
        ],
    );
    let h = Harness::new(
        definition,
        screen_with_buttons(&[(100, 100), (300, 200), (600, 400)]),
    )
    .await;
    h.run(None).await.unwrap();

    // Step two moved AND step three's button disappeared.
    h.screen.set(screen_with_buttons(&[(100, 100), (520, 350)]));

    h.run(None).await.unwrap(); // failure #1 at index 1
    h.locator.script(vec![LocateResponse {
        found: true,
        x: 520,
        y: 350,
        confidence: 0.90,
        reasoning: String::new(),
    }]);
    let report = h.run(None).await.unwrap();

    let RunReport::PartiallyHealed {
        fixed_index,
        new_failure_index,
        reason,
    } = report
    else {
        panic!("expected partial heal, got {report:?}");
    };
    assert_eq!(fixed_index, 1);
    assert_eq!(new_failure_index, 2);
    assert!(reason.contains("fixed action 1"), "reason: {reason}");

    // The fix that worked is kept, with its correction and baseline.
    let definition = h.definition_on_disk().await;
    assert_eq!(definition.actions[1].coordinates(), Some((520, 350)));
    assert_eq!(h.db().list_corrections("three-step").unwrap().len(), 1);

    // The re-run failed at index 2, so the streak at index 1 is reset.
    assert_eq!(h.db().consecutive_failures_at("three-step", 1).unwrap(), 0);
    assert_eq!(h.db().consecutive_failures_at("three-step", 2).unwrap(), 1);
}

#[tokio::test]
async fn injector_failure_aborts_the_run_as_failed() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let definition = two_click_workflow();
    let path = dir.path().join("wf.json");
    tokio::fs::write(&path, definition.to_json_pretty().unwrap())
        .await
        .unwrap();

    let screen = FakeScreen::new(screen_with_buttons(&[(100, 100), (300, 200)]));
    let injector = Arc::new(FakeInjector {
        fail_clicks: true,
        ..FakeInjector::default()
    });
    let locator = Arc::new(FakeLocator::default());
    let db = Database::open_memory().unwrap();
    let engine = Engine::new(
        screen,
        injector,
        locator,
        db.clone(),
        EngineConfig {
            retry_delay_ms: 1,
            ..EngineConfig::default()
        },
    );

    let err = engine.run_workflow(&path, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InjectionFailure(_)));

    // The run record was finalized, not left running forever.
    let run = db.get_run(1).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure_reason.unwrap().contains("action 0 failed"));
}
