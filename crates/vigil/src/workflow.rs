//! Typed workflow action model.
//!
//! A workflow is a closed set of tagged action variants with one canonical
//! coordinate representation, decided once when the definition is loaded.
//! Paste actions carry their content inline; nothing in the engine reads an
//! ambient clipboard.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Physical click at absolute screen coordinates.
    Click {
        x: i32,
        y: i32,
        /// Human-readable purpose of the click ("the blue Submit button"),
        /// used to prompt the element locator during healing.
        #[serde(default)]
        description: String,
    },
    /// Type text character by character.
    Type { text: String },
    /// Paste a block of content. The content travels on the action.
    Paste { content: String },
    /// Pause between steps.
    Wait { ms: u64 },
}

impl WorkflowAction {
    pub fn is_click(&self) -> bool {
        matches!(self, WorkflowAction::Click { .. })
    }

    /// Canonical coordinates, present only for click actions.
    pub fn coordinates(&self) -> Option<(i32, i32)> {
        match self {
            WorkflowAction::Click { x, y, .. } => Some((*x, *y)),
            _ => None,
        }
    }

    /// Stable kind tag, matching the serialized `action` field.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowAction::Click { .. } => "click",
            WorkflowAction::Type { .. } => "type",
            WorkflowAction::Paste { .. } => "paste",
            WorkflowAction::Wait { .. } => "wait",
        }
    }
}

/// Audit note appended to a definition every time healing rewrites a
/// coordinate. Restored verbatim by the updater's rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingNote {
    pub action_index: usize,
    pub old_x: i32,
    pub old_y: i32,
    pub new_x: i32,
    pub new_y: i32,
    pub reason: String,
    pub healed_at: DateTime<Utc>,
}

/// A named, versioned sequence of actions for one target application
/// variant. Serialized as JSON on disk; the file is the single source of
/// truth for coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub actions: Vec<WorkflowAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub healing_history: Vec<HealingNote>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, actions: Vec<WorkflowAction>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            actions,
            healing_history: Vec::new(),
        }
    }

    /// Parse a definition from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::InvalidWorkflow(format!("failed to parse workflow: {e}")))
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::Internal(format!("failed to serialize workflow: {e}")))
    }

    /// Load a definition from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            EngineError::InvalidWorkflow(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&bytes)
    }

    /// Indices of click-type actions, in execution order.
    pub fn click_indices(&self) -> Vec<usize> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_click())
            .map(|(i, _)| i)
            .collect()
    }

    /// Description used to prompt the locator for the given action.
    /// Falls back to a positional phrase when the author left it blank.
    pub fn action_description(&self, index: usize) -> String {
        match self.actions.get(index) {
            Some(WorkflowAction::Click { description, .. }) if !description.is_empty() => {
                description.clone()
            }
            Some(WorkflowAction::Click { .. }) => {
                format!("click target for step {index} of workflow '{}'", self.name)
            }
            _ => format!("step {index} of workflow '{}'", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "invoice-entry",
            vec![
                WorkflowAction::Click {
                    x: 100,
                    y: 200,
                    description: "Open invoices tab".to_string(),
                },
                WorkflowAction::Type {
                    text: "INV-42".to_string(),
                },
                WorkflowAction::Paste {
                    content: "Acme Corp".to_string(),
                },
                WorkflowAction::Wait { ms: 250 },
                WorkflowAction::Click {
                    x: 300,
                    y: 400,
                    description: String::new(),
                },
            ],
        )
    }

    #[test]
    fn json_round_trip() {
        let def = sample();
        let bytes = def.to_json_pretty().unwrap();
        let parsed = WorkflowDefinition::from_json(&bytes).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn tagged_parse_from_plain_json() {
        let raw = br#"{
            "name": "wf",
            "actions": [
                {"action": "click", "x": 10, "y": 20, "description": "ok"},
                {"action": "wait", "ms": 100}
            ]
        }"#;
        let def = WorkflowDefinition::from_json(raw).unwrap();
        assert_eq!(def.version, 0);
        assert_eq!(def.actions.len(), 2);
        assert_eq!(def.actions[0].coordinates(), Some((10, 20)));
    }

    #[test]
    fn unknown_action_kind_is_rejected() {
        let raw = br#"{"name": "wf", "actions": [{"action": "hover", "x": 1, "y": 2}]}"#;
        let err = WorkflowDefinition::from_json(raw).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));
    }

    #[test]
    fn click_indices_skip_non_clicks() {
        assert_eq!(sample().click_indices(), vec![0, 4]);
    }

    #[test]
    fn blank_description_gets_positional_fallback() {
        let def = sample();
        assert_eq!(def.action_description(0), "Open invoices tab");
        assert!(def.action_description(4).contains("step 4"));
    }
}
