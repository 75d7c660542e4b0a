//! SQLite database for validation state persistence.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::models::{
    BaselineCoverage, BaselineRow, CorrectionRecord, CorrectionRow, RunRow, RunStatus,
    SaveBaseline, ScreenshotRow, WorkflowRow,
};
use crate::{Result, StoreError};

/// Database wrapper shared by the validator and the healing orchestrator.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL for concurrent readers while a run is writing screenshots.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened validation database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                total_actions INTEGER NOT NULL DEFAULT 0,
                validated_actions INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS click_baselines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL REFERENCES workflows(id),
                action_index INTEGER NOT NULL,
                action_kind TEXT NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                image BLOB NOT NULL,
                image_hash TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                match_threshold REAL NOT NULL DEFAULT 0.95,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(workflow_id, action_index)
            );

            CREATE TABLE IF NOT EXISTS workflow_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL REFERENCES workflows(id),
                job_id TEXT,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                finished_at INTEGER,
                failed_action_index INTEGER,
                failure_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_workflow ON workflow_runs(workflow_id);

            CREATE TABLE IF NOT EXISTS run_screenshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES workflow_runs(id),
                action_index INTEGER NOT NULL,
                image BLOB NOT NULL,
                image_hash TEXT NOT NULL,
                similarity REAL,
                is_match INTEGER,
                captured_at INTEGER NOT NULL,
                UNIQUE(run_id, action_index)
            );

            CREATE TABLE IF NOT EXISTS workflow_corrections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL REFERENCES workflows(id),
                action_index INTEGER NOT NULL,
                old_x INTEGER NOT NULL,
                old_y INTEGER NOT NULL,
                new_x INTEGER NOT NULL,
                new_y INTEGER NOT NULL,
                old_image BLOB,
                new_image BLOB,
                reason TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_corrections_workflow
                ON workflow_corrections(workflow_id, action_index);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn workflow_id(conn: &Connection, name: &str) -> Result<i64> {
        conn.query_row(
            "SELECT id FROM workflows WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("workflow '{name}'")))
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    /// Register a workflow or refresh its action counts.
    pub fn upsert_workflow(
        &self,
        name: &str,
        total_actions: usize,
        validated_actions: usize,
    ) -> Result<WorkflowRow> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO workflows (name, total_actions, validated_actions, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 total_actions = excluded.total_actions,
                 validated_actions = excluded.validated_actions,
                 updated_at = excluded.updated_at",
            params![name, total_actions as i64, validated_actions as i64, now],
        )?;

        drop(conn);
        self.get_workflow(name)?
            .ok_or_else(|| StoreError::NotFound(format!("workflow '{name}'")))
    }

    pub fn get_workflow(&self, name: &str) -> Result<Option<WorkflowRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, total_actions, validated_actions, created_at, updated_at
                 FROM workflows WHERE name = ?1",
                params![name],
                |row| {
                    Ok(WorkflowRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        total_actions: row.get::<_, i64>(2)? as usize,
                        validated_actions: row.get::<_, i64>(3)? as usize,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ========================================================================
    // Baselines
    // ========================================================================

    /// Create or replace the baseline for (workflow, action index).
    /// The content hash is always recomputed from the image bytes.
    pub fn save_baseline(&self, args: SaveBaseline<'_>) -> Result<()> {
        let conn = self.conn.lock();
        let workflow_id = Self::workflow_id(&conn, args.workflow)?;
        let now = chrono::Utc::now().timestamp();
        let hash = blake3::hash(args.image).to_hex().to_string();

        conn.execute(
            "INSERT INTO click_baselines
                 (workflow_id, action_index, action_kind, x, y, image, image_hash,
                  description, match_threshold, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(workflow_id, action_index) DO UPDATE SET
                 action_kind = excluded.action_kind,
                 x = excluded.x,
                 y = excluded.y,
                 image = excluded.image,
                 image_hash = excluded.image_hash,
                 description = excluded.description,
                 match_threshold = excluded.match_threshold,
                 updated_at = excluded.updated_at",
            params![
                workflow_id,
                args.action_index as i64,
                args.action_kind,
                args.x,
                args.y,
                args.image,
                hash,
                args.description,
                args.match_threshold,
                now,
            ],
        )?;

        debug!(
            "Saved baseline for workflow '{}' action {}",
            args.workflow, args.action_index
        );
        Ok(())
    }

    pub fn get_baseline(&self, workflow: &str, action_index: usize) -> Result<Option<BaselineRow>> {
        let conn = self.conn.lock();
        let workflow_id = Self::workflow_id(&conn, workflow)?;
        let row = conn
            .query_row(
                "SELECT id, workflow_id, action_index, action_kind, x, y, image, image_hash,
                        description, match_threshold, created_at, updated_at
                 FROM click_baselines WHERE workflow_id = ?1 AND action_index = ?2",
                params![workflow_id, action_index as i64],
                Self::map_baseline,
            )
            .optional()?;
        Ok(row)
    }

    /// All baselines for a workflow, ordered by action index.
    pub fn list_baselines(&self, workflow: &str) -> Result<Vec<BaselineRow>> {
        let conn = self.conn.lock();
        let workflow_id = Self::workflow_id(&conn, workflow)?;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, action_index, action_kind, x, y, image, image_hash,
                    description, match_threshold, created_at, updated_at
             FROM click_baselines WHERE workflow_id = ?1 ORDER BY action_index ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id], Self::map_baseline)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// How many of the given click actions have a baseline.
    pub fn coverage(&self, workflow: &str, click_indices: &[usize]) -> Result<BaselineCoverage> {
        let covered: std::collections::HashSet<usize> = self
            .list_baselines(workflow)?
            .into_iter()
            .map(|b| b.action_index)
            .collect();
        let with_baseline = click_indices.iter().filter(|i| covered.contains(i)).count();
        Ok(BaselineCoverage {
            with_baseline,
            without_baseline: click_indices.len() - with_baseline,
        })
    }

    fn map_baseline(row: &rusqlite::Row<'_>) -> rusqlite::Result<BaselineRow> {
        Ok(BaselineRow {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            action_index: row.get::<_, i64>(2)? as usize,
            action_kind: row.get(3)?,
            x: row.get(4)?,
            y: row.get(5)?,
            image: row.get(6)?,
            image_hash: row.get(7)?,
            description: row.get(8)?,
            match_threshold: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    // ========================================================================
    // Runs & screenshots
    // ========================================================================

    /// Create a run in `running` state, returning its id.
    pub fn create_run(&self, workflow: &str, job_id: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock();
        let workflow_id = Self::workflow_id(&conn, workflow)?;
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO workflow_runs (workflow_id, job_id, status, started_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![workflow_id, job_id, RunStatus::Running.as_str(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Heartbeat: refresh the run's liveness timestamp. The stale-run reaper
    /// keys on `last_seen`, not `started_at`, so a legitimately long run
    /// stays alive as long as it keeps touching.
    pub fn touch_run(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let updated = conn.execute(
            "UPDATE workflow_runs SET last_seen = ?1 WHERE id = ?2 AND status = ?3",
            params![now, run_id, RunStatus::Running.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("running run {run_id}")));
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<RunRow> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, workflow_id, job_id, status, started_at, last_seen, finished_at,
                    failed_action_index, failure_reason
             FROM workflow_runs WHERE id = ?1",
            params![run_id],
            Self::map_run,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
    }

    fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
        let status_str: String = row.get(3)?;
        Ok(RunRow {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            job_id: row.get(2)?,
            status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
            started_at: row.get(4)?,
            last_seen: row.get(5)?,
            finished_at: row.get(6)?,
            failed_action_index: row.get::<_, Option<i64>>(7)?.map(|i| i as usize),
            failure_reason: row.get(8)?,
        })
    }

    /// Persist one captured region. Durable before the click executes, so a
    /// crash mid-run leaves the evidence behind. Returns the content hash.
    pub fn record_screenshot(&self, run_id: i64, action_index: usize, image: &[u8]) -> Result<String> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let hash = blake3::hash(image).to_hex().to_string();

        conn.execute(
            "INSERT INTO run_screenshots (run_id, action_index, image, image_hash, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, action_index as i64, image, hash, now],
        )?;
        // A capture is activity; keep the run's heartbeat fresh.
        conn.execute(
            "UPDATE workflow_runs SET last_seen = ?1 WHERE id = ?2",
            params![now, run_id],
        )?;
        Ok(hash)
    }

    /// Attach the comparison result to an already-persisted screenshot.
    pub fn update_screenshot_verdict(
        &self,
        run_id: i64,
        action_index: usize,
        similarity: f64,
        is_match: bool,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE run_screenshots SET similarity = ?1, is_match = ?2
             WHERE run_id = ?3 AND action_index = ?4",
            params![similarity, is_match, run_id, action_index as i64],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "screenshot for run {run_id} action {action_index}"
            )));
        }
        Ok(())
    }

    pub fn list_screenshots(&self, run_id: i64) -> Result<Vec<ScreenshotRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, action_index, image, image_hash, similarity, is_match, captured_at
             FROM run_screenshots WHERE run_id = ?1 ORDER BY action_index ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(ScreenshotRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                action_index: row.get::<_, i64>(2)? as usize,
                image: row.get(3)?,
                image_hash: row.get(4)?,
                similarity: row.get(5)?,
                is_match: row.get(6)?,
                captured_at: row.get(7)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Finalize a run. A run is finalized exactly once; a second call is an
    /// invariant violation.
    pub fn finalize_run(
        &self,
        run_id: i64,
        status: RunStatus,
        failed_action_index: Option<usize>,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        if !status.is_final() {
            return Err(StoreError::InvariantViolation(format!(
                "cannot finalize run {run_id} back to '{}'",
                status.as_str()
            )));
        }

        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let updated = conn.execute(
            "UPDATE workflow_runs
             SET status = ?1, finished_at = ?2, failed_action_index = ?3, failure_reason = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                now,
                failed_action_index.map(|i| i as i64),
                failure_reason,
                run_id,
                RunStatus::Running.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::InvariantViolation(format!(
                "run {run_id} is not in 'running' state, refusing to finalize twice"
            )));
        }
        debug!("Run {run_id} finalized as {}", status.as_str());
        Ok(())
    }

    /// Count the trailing finalized runs that failed validation at exactly
    /// this action index. The streak breaks at the first run that succeeded,
    /// failed elsewhere, or failed for a non-validation reason — so a healed
    /// re-run (success, or a later failure index) resets the count.
    pub fn consecutive_failures_at(&self, workflow: &str, action_index: usize) -> Result<u32> {
        let conn = self.conn.lock();
        let workflow_id = Self::workflow_id(&conn, workflow)?;
        let mut stmt = conn.prepare(
            "SELECT status, failed_action_index FROM workflow_runs
             WHERE workflow_id = ?1 AND finished_at IS NOT NULL
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![workflow_id], |row| {
            let status: String = row.get(0)?;
            let index: Option<i64> = row.get(1)?;
            Ok((status, index))
        })?;

        let mut count = 0u32;
        for row in rows {
            let (status, index) = row?;
            if RunStatus::parse(&status) == Some(RunStatus::ValidationFailed)
                && index == Some(action_index as i64)
            {
                count += 1;
            } else {
                break;
            }
        }
        Ok(count)
    }

    /// Finalize abandoned `running` rows as failed. Abandonment means no
    /// heartbeat (`last_seen`) within the staleness window, never mere age:
    /// a long run that keeps producing captures and touches is left alone.
    /// Reconciliation pass for runs that died without reaching finalize.
    pub fn reap_stale_runs(&self, staleness: Duration) -> Result<usize> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let cutoff = now - staleness.as_secs() as i64;

        let reaped = conn.execute(
            "UPDATE workflow_runs
             SET status = ?1, finished_at = ?2, failure_reason = 'aborted'
             WHERE status = ?3 AND last_seen < ?4",
            params![
                RunStatus::Failed.as_str(),
                now,
                RunStatus::Running.as_str(),
                cutoff,
            ],
        )?;
        if reaped > 0 {
            warn!("Reaped {reaped} stale run(s) as aborted");
        }
        Ok(reaped)
    }

    // ========================================================================
    // Corrections
    // ========================================================================

    /// Append a correction audit record. There is deliberately no update or
    /// delete counterpart.
    pub fn append_correction(&self, record: CorrectionRecord<'_>) -> Result<i64> {
        let conn = self.conn.lock();
        let workflow_id = Self::workflow_id(&conn, record.workflow)?;
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO workflow_corrections
                 (workflow_id, action_index, old_x, old_y, new_x, new_y,
                  old_image, new_image, reason, consecutive_failures, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                workflow_id,
                record.action_index as i64,
                record.old_x,
                record.old_y,
                record.new_x,
                record.new_y,
                record.old_image,
                record.new_image,
                record.reason,
                record.consecutive_failures,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_corrections(&self, workflow: &str) -> Result<Vec<CorrectionRow>> {
        let conn = self.conn.lock();
        let workflow_id = Self::workflow_id(&conn, workflow)?;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, action_index, old_x, old_y, new_x, new_y,
                    old_image, new_image, reason, consecutive_failures, created_at
             FROM workflow_corrections WHERE workflow_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id], |row| {
            Ok(CorrectionRow {
                id: row.get(0)?,
                workflow_id: row.get(1)?,
                action_index: row.get::<_, i64>(2)? as usize,
                old_x: row.get(3)?,
                old_y: row.get(4)?,
                new_x: row.get(5)?,
                new_y: row.get(6)?,
                old_image: row.get(7)?,
                new_image: row.get(8)?,
                reason: row.get(9)?,
                consecutive_failures: row.get(10)?,
                created_at: row.get(11)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
