use serde::{Deserialize, Serialize};

/// Lifecycle of one workflow execution. Finalized exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    ValidationFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::ValidationFailed => "validation_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "validation_failed" => Some(RunStatus::ValidationFailed),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// A registered workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowRow {
    pub id: i64,
    pub name: String,
    pub total_actions: usize,
    pub validated_actions: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Expected visual context for one click action.
#[derive(Debug, Clone)]
pub struct BaselineRow {
    pub id: i64,
    pub workflow_id: i64,
    pub action_index: usize,
    pub action_kind: String,
    pub x: i32,
    pub y: i32,
    pub image: Vec<u8>,
    pub image_hash: String,
    pub description: String,
    pub match_threshold: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Arguments for creating or replacing a baseline.
#[derive(Debug, Clone)]
pub struct SaveBaseline<'a> {
    pub workflow: &'a str,
    pub action_index: usize,
    pub action_kind: &'a str,
    pub x: i32,
    pub y: i32,
    pub image: &'a [u8],
    pub description: &'a str,
    pub match_threshold: f64,
}

/// Click actions with vs. without a stored baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineCoverage {
    pub with_baseline: usize,
    pub without_baseline: usize,
}

impl BaselineCoverage {
    /// A run with zero covered actions skips validation entirely and
    /// bootstraps baselines from its own captures.
    pub fn is_first_run(&self) -> bool {
        self.with_baseline == 0
    }
}

/// One execution attempt of a workflow.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub workflow_id: i64,
    pub job_id: Option<String>,
    pub status: RunStatus,
    pub started_at: i64,
    /// Heartbeat timestamp; refreshed by captures and explicit touches.
    /// The stale-run reaper keys on this, not on `started_at`.
    pub last_seen: i64,
    pub finished_at: Option<i64>,
    pub failed_action_index: Option<usize>,
    pub failure_reason: Option<String>,
}

/// One captured region tied to a run and action index.
#[derive(Debug, Clone)]
pub struct ScreenshotRow {
    pub id: i64,
    pub run_id: i64,
    pub action_index: usize,
    pub image: Vec<u8>,
    pub image_hash: String,
    pub similarity: Option<f64>,
    pub is_match: Option<bool>,
    pub captured_at: i64,
}

/// Arguments for appending a correction audit record.
#[derive(Debug, Clone)]
pub struct CorrectionRecord<'a> {
    pub workflow: &'a str,
    pub action_index: usize,
    pub old_x: i32,
    pub old_y: i32,
    pub new_x: i32,
    pub new_y: i32,
    pub old_image: Option<&'a [u8]>,
    pub new_image: Option<&'a [u8]>,
    pub reason: &'a str,
    pub consecutive_failures: u32,
}

/// A coordinate change applied by healing. Append-only, never mutated.
#[derive(Debug, Clone)]
pub struct CorrectionRow {
    pub id: i64,
    pub workflow_id: i64,
    pub action_index: usize,
    pub old_x: i32,
    pub old_y: i32,
    pub new_x: i32,
    pub new_y: i32,
    pub old_image: Option<Vec<u8>>,
    pub new_image: Option<Vec<u8>>,
    pub reason: String,
    pub consecutive_failures: u32,
    pub created_at: i64,
}
