//! Row-level access for sessions and steps. Invariants live in
//! [`crate::lineage::SessionMachine`]; these helpers run inside its transactions.

use std::path::PathBuf;

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::db::{StoreResult, json_column};
use crate::model::{Artifact, EditDescription, Session, SessionRef, SessionSummary, Step};

const SESSION_COLUMNS: &str =
    "id, name, trigger_word, current_step_id, created_at, updated_at, deleted_at";
const STEP_COLUMNS: &str =
    "id, session_id, sequence, depth, parent_id, generation_id, edit, created_at";

pub(crate) struct NewStep<'a> {
    pub session_id: i64,
    pub sequence: i64,
    pub depth: i64,
    pub parent_id: Option<i64>,
    pub generation_id: i64,
    pub edit: Option<&'a EditDescription>,
    pub created_at: i64,
}

pub(crate) fn insert_session(
    conn: &Connection,
    name: &str,
    trigger_word: Option<&str>,
    now: i64,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO sessions (name, trigger_word, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        params![name, trigger_word, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn live_name_taken(conn: &Connection, name: &str) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM sessions WHERE name = ?1 AND deleted_at IS NULL",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Resolve a session; names prefer the live session, then the newest deleted one.
pub(crate) fn find_session(conn: &Connection, reference: &SessionRef) -> StoreResult<Option<Session>> {
    let session = match reference {
        SessionRef::Id(id) => conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                [id],
                map_session,
            )
            .optional()?,
        SessionRef::Name(name) => conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE name = ?1 \
                     ORDER BY deleted_at IS NOT NULL, id DESC LIMIT 1"
                ),
                [name],
                map_session,
            )
            .optional()?,
    };
    Ok(session)
}

pub(crate) fn find_step(conn: &Connection, id: i64) -> StoreResult<Option<Step>> {
    Ok(conn
        .query_row(
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
            [id],
            map_step,
        )
        .optional()?)
}

pub(crate) fn step_for_generation(conn: &Connection, generation_id: i64) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM steps WHERE generation_id = ?1",
            [generation_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn steps_for_session(conn: &Connection, session_id: i64) -> StoreResult<Vec<Step>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM steps WHERE session_id = ?1 ORDER BY sequence"
    ))?;
    let rows = stmt.query_map([session_id], map_step)?;
    let mut steps = Vec::new();
    for row in rows {
        steps.push(row?);
    }
    Ok(steps)
}

pub(crate) fn next_sequence(conn: &Connection, session_id: i64) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(sequence) + 1, 0) FROM steps WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?)
}

pub(crate) fn insert_step(conn: &Connection, step: &NewStep<'_>) -> StoreResult<i64> {
    let edit = step.edit.map(serde_json::to_string).transpose()?;
    conn.execute(
        r"
        INSERT INTO steps (session_id, sequence, depth, parent_id, generation_id, edit, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![
            step.session_id,
            step.sequence,
            step.depth,
            step.parent_id,
            step.generation_id,
            edit,
            step.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn set_current_step(
    conn: &Connection,
    session_id: i64,
    step_id: i64,
    now: i64,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE sessions SET current_step_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![session_id, step_id, now],
    )?;
    Ok(())
}

/// Soft-delete: the row stays for name resolution, its steps go.
pub(crate) fn mark_deleted(conn: &Connection, session_id: i64, now: i64) -> StoreResult<usize> {
    conn.execute(
        "UPDATE sessions SET current_step_id = NULL, deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
        params![session_id, now],
    )?;
    Ok(conn.execute("DELETE FROM steps WHERE session_id = ?1", [session_id])?)
}

pub(crate) fn list_sessions(
    conn: &Connection,
    include_deleted: bool,
) -> StoreResult<Vec<SessionSummary>> {
    let filter = if include_deleted {
        ""
    } else {
        "WHERE s.deleted_at IS NULL"
    };
    let sql = format!(
        r"
        SELECT s.id, s.name, s.trigger_word, s.current_step_id, s.created_at, s.updated_at, s.deleted_at,
               (SELECT COUNT(*) FROM steps st WHERE st.session_id = s.id) AS step_count,
               (SELECT g.prompt FROM steps st JOIN generations g ON g.id = st.generation_id
                 WHERE st.session_id = s.id ORDER BY st.sequence LIMIT 1) AS base_prompt,
               cg.prompt AS current_prompt,
               cg.artifacts AS current_artifacts
        FROM sessions s
        LEFT JOIN steps cs ON cs.id = s.current_step_id
        LEFT JOIN generations cg ON cg.id = cs.generation_id
        {filter}
        ORDER BY s.updated_at DESC, s.id DESC
        "
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        let session = map_session(row)?;
        let artifacts: Option<String> = row.get("current_artifacts")?;
        let current_path = artifacts
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<Artifact>>(raw).ok())
            .and_then(|artifacts| artifacts.into_iter().next())
            .map(|artifact| artifact.path);
        Ok(SessionSummary {
            session,
            step_count: row.get("step_count")?,
            base_prompt: row.get("base_prompt")?,
            current_prompt: row.get("current_prompt")?,
            current_path,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn generation_path(conn: &Connection, generation_id: i64) -> StoreResult<Option<PathBuf>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT artifacts FROM generations WHERE id = ?1",
            [generation_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let artifacts: Vec<Artifact> = serde_json::from_str(&raw)?;
    Ok(artifacts.into_iter().next().map(|artifact| artifact.path))
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get("id")?,
        name: row.get("name")?,
        trigger_word: row.get("trigger_word")?,
        current_step: row.get("current_step_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}

fn map_step(row: &Row<'_>) -> rusqlite::Result<Step> {
    let edit: Option<String> = row.get("edit")?;
    let edit = match edit {
        Some(_) => Some(json_column::<EditDescription>(row, 6)?),
        None => None,
    };
    Ok(Step {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        sequence: row.get("sequence")?,
        depth: row.get("depth")?,
        parent_id: row.get("parent_id")?,
        generation_id: row.get("generation_id")?,
        edit,
        created_at: row.get("created_at")?,
    })
}
