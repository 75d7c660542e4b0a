//! Workflow coordinate updater with backup-before-write and single-level
//! rollback.
//!
//! The workflow JSON file is the persisted ground truth for coordinates.
//! Every mutation first copies the current file bytes to a timestamped
//! backup; rollback restores those exact bytes, healing-history annotations
//! included.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};
use vigil::{EngineError, HealingNote, WorkflowAction, WorkflowDefinition};

pub struct WorkflowUpdater {
    path: PathBuf,
    /// Most recent backup taken by `update_coordinates`. Single-level undo,
    /// not a stack: only one healing attempt is ever in flight per workflow.
    last_backup: Option<PathBuf>,
}

impl WorkflowUpdater {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_backup: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_backup_path(&self) -> Option<&Path> {
        self.last_backup.as_deref()
    }

    /// Current persisted definition.
    pub async fn load(&self) -> Result<WorkflowDefinition, EngineError> {
        WorkflowDefinition::load(&self.path).await
    }

    /// Current coordinates of a click action.
    pub async fn get_coordinates(&self, action_index: usize) -> Result<(i32, i32), EngineError> {
        let definition = self.load().await?;
        definition
            .actions
            .get(action_index)
            .and_then(|a| a.coordinates())
            .ok_or_else(|| {
                EngineError::InvalidWorkflow(format!(
                    "action {action_index} of '{}' is not a click",
                    definition.name
                ))
            })
    }

    /// All click actions as (index, locator description) pairs, used to
    /// build healing prompts.
    pub async fn list_click_actions(&self) -> Result<Vec<(usize, String)>, EngineError> {
        let definition = self.load().await?;
        Ok(definition
            .click_indices()
            .into_iter()
            .map(|i| (i, definition.action_description(i)))
            .collect())
    }

    /// Rewrite the coordinates of one click action.
    ///
    /// The current file bytes are backed up first; the mutation appends a
    /// healing-history note recording old and new coordinates plus the
    /// machine reason.
    pub async fn update_coordinates(
        &mut self,
        action_index: usize,
        new_x: i32,
        new_y: i32,
        reason: &str,
    ) -> Result<(), EngineError> {
        let original = tokio::fs::read(&self.path).await.map_err(|e| {
            EngineError::UpdatePersistFailure(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))
        })?;
        let mut definition = WorkflowDefinition::from_json(&original)?;

        let (old_x, old_y) = match definition.actions.get_mut(action_index) {
            Some(WorkflowAction::Click { x, y, .. }) => {
                let old = (*x, *y);
                *x = new_x;
                *y = new_y;
                old
            }
            _ => {
                return Err(EngineError::InvalidWorkflow(format!(
                    "action {action_index} of '{}' is not a click",
                    definition.name
                )))
            }
        };

        // Backup before any write touches the file. The slot is armed as
        // soon as the backup exists so a failed main write can still be
        // rolled back.
        let backup_path = self.backup_path();
        tokio::fs::write(&backup_path, &original).await.map_err(|e| {
            EngineError::UpdatePersistFailure(format!(
                "failed to write backup {}: {e}",
                backup_path.display()
            ))
        })?;
        self.last_backup = Some(backup_path);

        definition.healing_history.push(HealingNote {
            action_index,
            old_x,
            old_y,
            new_x,
            new_y,
            reason: reason.to_string(),
            healed_at: chrono::Utc::now(),
        });

        let serialized = definition.to_json_pretty()?;
        tokio::fs::write(&self.path, serialized).await.map_err(|e| {
            EngineError::UpdatePersistFailure(format!(
                "failed to write {}: {e}",
                self.path.display()
            ))
        })?;

        info!(
            "Updated '{}' action {} from ({}, {}) to ({}, {})",
            definition.name, action_index, old_x, old_y, new_x, new_y
        );
        Ok(())
    }

    /// Restore the backup taken by the last `update_coordinates` call and
    /// clear the slot. The restored file is byte-identical to the
    /// pre-update state. The backup file itself stays on disk as audit.
    pub async fn rollback(&mut self) -> Result<(), EngineError> {
        let backup_path = match self.last_backup.take() {
            Some(path) => path,
            None => {
                // Backup-before-write makes this unreachable in the healing
                // protocol; reaching it means a caller bug. State is left
                // untouched rather than guessed at.
                error!(
                    "rollback requested for {} but no backup slot is set",
                    self.path.display()
                );
                return Err(EngineError::RollbackFailure(format!(
                    "no backup recorded for {}",
                    self.path.display()
                )));
            }
        };

        let bytes = tokio::fs::read(&backup_path).await.map_err(|e| {
            EngineError::RollbackFailure(format!(
                "failed to read backup {}: {e}",
                backup_path.display()
            ))
        })?;
        tokio::fs::write(&self.path, bytes).await.map_err(|e| {
            EngineError::RollbackFailure(format!(
                "failed to restore {}: {e}",
                self.path.display()
            ))
        })?;

        debug!(
            "Rolled back {} from {}",
            self.path.display(),
            backup_path.display()
        );
        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        self.path.with_file_name(format!("{stem}.{stamp}.bak"))
    }
}
