use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::model::StorageConfig;
use crate::model::{
    Artifact, Generation, GenerationOutcome, GenerationStatus, NewGeneration, OperationKind,
};
use crate::storage::BlobStore;
use crate::util;

pub(crate) mod lineage;

const SCHEMA_VERSION: i32 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const GENERATION_COLUMNS: &str = "id, kind, prompt, model, params, status, error_message, elapsed_ms, artifacts, created_at, finalized_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Generation,
    Session,
    Step,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Generation => "generation",
            RecordKind::Session => "session",
            RecordKind::Step => "step",
        })
    }
}

/// Failures surfaced by the history store and the session state machine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: RecordKind, id: String },
    #[error("generation {0} has already been finalized")]
    AlreadyFinalized(i64),
    #[error("session '{session}' cannot do that: {reason}")]
    InvalidState { session: String, reason: String },
    #[error("a session named '{0}' already exists")]
    DuplicateName(String),
    #[error("step {step} is not an ancestor of the current step of session '{session}'")]
    NotAnAncestor { session: String, step: i64 },
    #[error("history storage unavailable")]
    StorageUnavailable(#[source] Box<dyn StdError + Send + Sync>),
}

impl StoreError {
    pub(crate) fn not_found(kind: RecordKind, id: impl fmt::Display) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        StoreError::StorageUnavailable(message.into().into())
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::StorageUnavailable(Box::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::StorageUnavailable(Box::new(err))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Filter for [`HistoryStore::query`]. The default returns every generation.
#[derive(Debug, Clone, Default)]
pub struct GenerationFilter {
    /// Case-insensitive substring of the prompt.
    pub prompt_contains: Option<String>,
    pub model: Option<String>,
    pub success_only: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelStats {
    pub count: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Mean elapsed seconds over successful generations that reported timing.
    pub avg_elapsed_secs: Option<f64>,
}

/// Aggregate counts over finalized generations. Pending rows are reported
/// separately so that `succeeded + failed == total` holds for every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub models: IndexMap<String, ModelStats>,
}

impl HistoryStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupCandidate {
    pub id: i64,
    pub created_at: i64,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub candidates: Vec<CleanupCandidate>,
    pub files_removed: usize,
    pub file_errors: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    #[must_use]
    pub fn count(&self) -> usize {
        self.candidates.len()
    }
}

/// Durable repository of generations, sessions, and steps.
///
/// One writer connection is shared behind a mutex so write transactions
/// serialize; every read opens its own connection and runs inside a single
/// read transaction, which gives WAL snapshot semantics.
pub struct HistoryStore {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HistoryStore {
    /// Open the store described by the storage configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the directory or database
    /// cannot be created, or the schema version is unknown.
    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        Self::open_path(&config.database)
    }

    /// Open or create the `SQLite` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the database file cannot be
    /// opened or initialized.
    pub fn open_path(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::StorageUnavailable(
                    format!("failed to create {}: {err}", parent.display()).into(),
                )
            })?;
        }
        let conn = Connection::open(path).map_err(|err| {
            StoreError::StorageUnavailable(
                format!("failed to open database at {}: {err}", path.display()).into(),
            )
        })?;
        configure(&conn)?;
        migrate(&conn)?;
        debug!(path = %path.display(), "history store opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_writer(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::unavailable("history writer lock poisoned"))
    }

    /// Run `f` inside one immediate write transaction; commits on `Ok`.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` against a fresh read connection inside a single read transaction.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&*tx)?;
        tx.finish()?;
        Ok(value)
    }

    /// Insert a provisional generation and return it with its new id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the insert fails.
    pub fn record_generation(&self, new: &NewGeneration) -> StoreResult<Generation> {
        let created_at = util::unix_timestamp();
        let params_json = serde_json::to_string(&new.params)?;
        let id = self.write(|tx| {
            tx.execute(
                r"
                INSERT INTO generations (kind, prompt, model, params, status, artifacts, created_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', '[]', ?5)
                ",
                params![
                    new.kind.as_str(),
                    new.prompt,
                    new.model,
                    params_json,
                    created_at
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;
        debug!(id, model = %new.model, kind = %new.kind, "recorded provisional generation");
        Ok(Generation {
            id,
            kind: new.kind,
            prompt: new.prompt.clone(),
            model: new.model.clone(),
            params: new.params.clone(),
            status: GenerationStatus::Pending,
            error_message: None,
            elapsed: None,
            artifacts: Vec::new(),
            created_at,
            finalized_at: None,
        })
    }

    /// Record the terminal outcome of a provisional generation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id and
    /// [`StoreError::AlreadyFinalized`] if the generation already has an outcome;
    /// in that case the stored outcome is left untouched.
    pub fn finalize_generation(
        &self,
        id: i64,
        outcome: &GenerationOutcome,
    ) -> StoreResult<Generation> {
        let finalized_at = util::unix_timestamp();
        let generation = self.write(|tx| {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM generations WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            match status.as_deref() {
                None => return Err(StoreError::not_found(RecordKind::Generation, id)),
                Some("pending") => {}
                Some(_) => return Err(StoreError::AlreadyFinalized(id)),
            }

            let (status, error_message, elapsed, artifacts) = match outcome {
                GenerationOutcome::Succeeded { artifacts, elapsed } => (
                    GenerationStatus::Succeeded,
                    None,
                    Some(*elapsed),
                    artifacts.as_slice(),
                ),
                GenerationOutcome::Failed { message, elapsed } => (
                    GenerationStatus::Failed,
                    Some(message.as_str()),
                    *elapsed,
                    &[][..],
                ),
            };
            let elapsed_ms = elapsed.map(duration_to_millis);
            tx.execute(
                r"
                UPDATE generations
                SET status = ?2, error_message = ?3, elapsed_ms = ?4, artifacts = ?5, finalized_at = ?6
                WHERE id = ?1 AND status = 'pending'
                ",
                params![
                    id,
                    status.as_str(),
                    error_message,
                    elapsed_ms,
                    serde_json::to_string(artifacts)?,
                    finalized_at,
                ],
            )?;
            fetch_generation(tx, id)
        })?;
        info!(
            id,
            status = generation.status.as_str(),
            artifacts = generation.artifacts.len(),
            "generation finalized"
        );
        Ok(generation)
    }

    /// Fetch a generation by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no generation has this id.
    pub fn generation(&self, id: i64) -> StoreResult<Generation> {
        self.read(|conn| fetch_generation(conn, id))
    }

    /// Query generations newest-first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the query fails.
    pub fn query(&self, filter: &GenerationFilter) -> StoreResult<Vec<Generation>> {
        let mut sql = format!("SELECT {GENERATION_COLUMNS} FROM generations");
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(term) = filter.prompt_contains.as_deref().filter(|t| !t.is_empty()) {
            clauses.push("instr(lower(prompt), lower(?)) > 0");
            values.push(SqlValue::from(term.to_string()));
        }
        if let Some(model) = filter.model.as_deref() {
            clauses.push("model = ?");
            values.push(SqlValue::from(model.to_string()));
        }
        if filter.success_only {
            clauses.push("status = 'succeeded'");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        values.push(SqlValue::from(
            filter
                .limit
                .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX)),
        ));
        values.push(SqlValue::from(
            i64::try_from(filter.offset).unwrap_or(i64::MAX),
        ));

        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), map_generation)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Id of the most recently created generation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the query fails.
    pub fn latest_generation_id(&self) -> StoreResult<Option<i64>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM generations ORDER BY created_at DESC, id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Count every generation row, pending ones included.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the count query fails.
    pub fn count_generations(&self) -> StoreResult<i64> {
        self.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM generations", [], |row| row.get(0))?)
        })
    }

    /// Aggregate counts from one statement so every figure comes from the same snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the aggregate query fails.
    pub fn stats(&self) -> StoreResult<HistoryStats> {
        let rows = self.read(|conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT model, status, COUNT(*), AVG(elapsed_ms)
                FROM generations
                GROUP BY model, status
                ORDER BY model
                ",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut stats = HistoryStats::default();
        for (model, status, count, avg_ms) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match GenerationStatus::from_db(&status) {
                Some(GenerationStatus::Pending) => stats.pending += count,
                Some(GenerationStatus::Succeeded) => {
                    let entry = stats.models.entry(model).or_default();
                    entry.count += count;
                    entry.succeeded += count;
                    entry.avg_elapsed_secs = avg_ms.map(|ms| ms / 1000.0);
                    stats.succeeded += count;
                }
                Some(GenerationStatus::Failed) => {
                    let entry = stats.models.entry(model).or_default();
                    entry.count += count;
                    entry.failed += count;
                    stats.failed += count;
                }
                None => warn!(status, "ignoring generations with unknown status"),
            }
        }
        stats.total = stats.succeeded + stats.failed;
        Ok(stats)
    }

    /// Remove finalized generations created strictly before `cutoff` (unix
    /// seconds) together with their image files.
    ///
    /// Pending generations and generations wrapped by a step of a live session
    /// are never removed. With `dry_run` the same set is computed and nothing
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if selecting or deleting rows
    /// fails. File deletion failures are collected in the report instead.
    pub fn cleanup(
        &self,
        cutoff: i64,
        dry_run: bool,
        blobs: &dyn BlobStore,
    ) -> StoreResult<CleanupReport> {
        let candidates = self.write(|tx| {
            let mut stmt = tx.prepare(
                r"
                SELECT id, created_at, artifacts
                FROM generations
                WHERE created_at < ?1
                  AND status != 'pending'
                  AND id NOT IN (SELECT generation_id FROM steps)
                ORDER BY id
                ",
            )?;
            let rows = stmt.query_map([cutoff], |row| {
                let artifacts: Vec<Artifact> = json_column(row, 2)?;
                Ok(CleanupCandidate {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    paths: artifacts.into_iter().map(|artifact| artifact.path).collect(),
                })
            })?;
            let mut candidates = Vec::new();
            for row in rows {
                candidates.push(row?);
            }
            drop(stmt);

            if !dry_run {
                let mut delete = tx.prepare("DELETE FROM generations WHERE id = ?1")?;
                for candidate in &candidates {
                    delete.execute([candidate.id])?;
                }
            }
            Ok(candidates)
        })?;

        let mut report = CleanupReport {
            dry_run,
            candidates,
            ..CleanupReport::default()
        };
        if !dry_run {
            for path in report.candidates.iter().flat_map(|c| c.paths.iter()) {
                match blobs.delete(path) {
                    Ok(()) => report.files_removed += 1,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to delete image");
                        report.file_errors.push((path.clone(), err.to_string()));
                    }
                }
            }
        }
        info!(
            cutoff,
            dry_run,
            removed = report.count(),
            files = report.files_removed,
            "history cleanup complete"
        );
        Ok(report)
    }
}

fn configure(conn: &Connection) -> StoreResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        r"
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
        ",
    )?;
    Ok(())
}

fn migrate(conn: &Connection) -> StoreResult<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    match current {
        0 => create_schema(conn),
        SCHEMA_VERSION => Ok(()),
        other => Err(StoreError::unavailable(format!(
            "history database schema version {other} is newer than supported version {SCHEMA_VERSION}"
        ))),
    }
}

fn create_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS generations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            prompt TEXT NOT NULL,
            model TEXT NOT NULL,
            params TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL CHECK (status IN ('pending', 'succeeded', 'failed')),
            error_message TEXT,
            elapsed_ms INTEGER,
            artifacts TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            finalized_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            trigger_word TEXT,
            current_step_id INTEGER REFERENCES steps(id),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            sequence INTEGER NOT NULL,
            depth INTEGER NOT NULL,
            parent_id INTEGER REFERENCES steps(id),
            generation_id INTEGER NOT NULL UNIQUE REFERENCES generations(id),
            edit TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE (session_id, sequence)
        );

        CREATE INDEX IF NOT EXISTS idx_generations_created ON generations(created_at, id);
        CREATE INDEX IF NOT EXISTS idx_generations_model ON generations(model);
        CREATE INDEX IF NOT EXISTS idx_generations_status ON generations(status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live_name ON sessions(name) WHERE deleted_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_steps_session ON steps(session_id, sequence);
        ",
    )?;

    let pragma = format!("PRAGMA user_version = {SCHEMA_VERSION}");
    conn.execute(&pragma, [])?;
    Ok(())
}

pub(crate) fn fetch_generation(conn: &Connection, id: i64) -> StoreResult<Generation> {
    conn.query_row(
        &format!("SELECT {GENERATION_COLUMNS} FROM generations WHERE id = ?1"),
        [id],
        map_generation,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(RecordKind::Generation, id))
}

fn map_generation(row: &Row<'_>) -> rusqlite::Result<Generation> {
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    let elapsed_ms: Option<i64> = row.get("elapsed_ms")?;
    Ok(Generation {
        id: row.get("id")?,
        kind: kind
            .parse::<OperationKind>()
            .map_err(|err| conversion_error(1, err))?,
        prompt: row.get("prompt")?,
        model: row.get("model")?,
        params: json_column(row, 4)?,
        status: GenerationStatus::from_db(&status)
            .ok_or_else(|| conversion_error(5, format!("unknown status '{status}'")))?,
        error_message: row.get("error_message")?,
        elapsed: elapsed_ms.map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0))),
        artifacts: json_column(row, 8)?,
        created_at: row.get("created_at")?,
        finalized_at: row.get("finalized_at")?,
    })
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn conversion_error(idx: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into().into())
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests;
