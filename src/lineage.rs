use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::db::lineage::{self as rows, NewStep};
use crate::db::{HistoryStore, RecordKind, StoreError, StoreResult, fetch_generation};
use crate::model::{
    EditDescription, GenerationStatus, Session, SessionRef, SessionState, SessionSummary, Step,
};
use crate::util;

/// Enforces the session lifecycle and step lineage on top of a [`HistoryStore`].
///
/// Every transition runs in one write transaction: the step insert and the
/// current-step pointer move commit together or not at all.
#[derive(Debug, Clone, Copy)]
pub struct SessionMachine<'a> {
    store: &'a HistoryStore,
}

impl<'a> SessionMachine<'a> {
    #[must_use]
    pub fn new(store: &'a HistoryStore) -> Self {
        Self { store }
    }

    /// Create an empty session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateName`] if a live session already uses the name.
    pub fn create_session(&self, name: &str, trigger_word: Option<&str>) -> StoreResult<Session> {
        let name = validate_name(name)?;
        let session = self.store.write(|tx| {
            let id = create_row(tx, name, trigger_word)?;
            require_session(tx, &SessionRef::Id(id))
        })?;
        info!(session = session.id, name = %session.name, "session created");
        Ok(session)
    }

    /// Create a session whose base step wraps `generation_id`, atomically.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::create_session`] and [`Self::append_step`]; nothing
    /// is persisted on failure.
    pub fn begin_session(
        &self,
        name: &str,
        trigger_word: Option<&str>,
        generation_id: i64,
    ) -> StoreResult<(Session, Step)> {
        let name = validate_name(name)?;
        let (session, step) = self.store.write(|tx| {
            let id = create_row(tx, name, trigger_word)?;
            let session = require_session(tx, &SessionRef::Id(id))?;
            let step = append_in(tx, &session, generation_id, None)?;
            Ok((require_session(tx, &SessionRef::Id(id))?, step))
        })?;
        info!(session = session.id, name = %session.name, step = step.id, "session started");
        Ok((session, step))
    }

    /// Append a step wrapping a successful generation and advance the pointer.
    ///
    /// The first step of an empty session becomes its base; later steps are
    /// children of the current step.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] when the session is deleted, the
    /// generation has not succeeded, or the generation already backs a step.
    pub fn append_step(
        &self,
        session: &SessionRef,
        generation_id: i64,
        edit: Option<&EditDescription>,
    ) -> StoreResult<Step> {
        let step = self.store.write(|tx| {
            let session = require_session(tx, session)?;
            append_in(tx, &session, generation_id, edit)
        })?;
        info!(
            session = step.session_id,
            step = step.id,
            sequence = step.sequence,
            depth = step.depth,
            "step appended"
        );
        Ok(step)
    }

    /// Move the current pointer back to `step_id`, which must lie on the active chain.
    ///
    /// Steps past the target stay stored as detached history.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotAnAncestor`] when the step is not the current
    /// step or one of its ancestors, and [`StoreError::InvalidState`] for
    /// deleted or empty sessions.
    pub fn rewind(&self, session: &SessionRef, step_id: i64) -> StoreResult<Session> {
        let session = self.store.write(|tx| {
            let session = require_session(tx, session)?;
            let current = match session.state() {
                SessionState::Deleted => return Err(invalid(&session, "session is deleted")),
                SessionState::Empty => return Err(invalid(&session, "session has no steps")),
                SessionState::Active => session.current_step,
            };
            let chain = chain_from(tx, current)?;
            if !chain.iter().any(|step| step.id == step_id) {
                return Err(StoreError::NotAnAncestor {
                    session: session.name.clone(),
                    step: step_id,
                });
            }
            rows::set_current_step(tx, session.id, step_id, util::unix_timestamp())?;
            require_session(tx, &SessionRef::Id(session.id))
        })?;
        info!(session = session.id, step = step_id, "session rewound");
        Ok(session)
    }

    /// Soft-delete a session and discard its steps. Generations are kept.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] if the session is already deleted.
    pub fn delete_session(&self, session: &SessionRef) -> StoreResult<Session> {
        let session = self.store.write(|tx| {
            let session = require_session(tx, session)?;
            if session.state() == SessionState::Deleted {
                return Err(invalid(&session, "session is already deleted"));
            }
            let removed = rows::mark_deleted(tx, session.id, util::unix_timestamp())?;
            debug!(session = session.id, removed, "removed session steps");
            require_session(tx, &SessionRef::Id(session.id))
        })?;
        info!(session = session.id, name = %session.name, "session deleted");
        Ok(session)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown sessions.
    pub fn session(&self, session: &SessionRef) -> StoreResult<Session> {
        self.store.read(|conn| require_session(conn, session))
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown steps.
    pub fn step(&self, step_id: i64) -> StoreResult<Step> {
        self.store.read(|conn| {
            rows::find_step(conn, step_id)?
                .ok_or_else(|| StoreError::not_found(RecordKind::Step, step_id))
        })
    }

    /// Root-first chain from the base step to the current step.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown sessions.
    pub fn active_chain(&self, session: &SessionRef) -> StoreResult<Vec<Step>> {
        self.store.read(|conn| {
            let session = require_session(conn, session)?;
            chain_from(conn, session.current_step)
        })
    }

    /// Every stored step of a session in sequence order, detached ones included.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown sessions.
    pub fn steps(&self, session: &SessionRef) -> StoreResult<Vec<Step>> {
        self.store.read(|conn| {
            let session = require_session(conn, session)?;
            rows::steps_for_session(conn, session.id)
        })
    }

    /// Steps that are no longer on the active chain, for example after a rewind.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown sessions.
    pub fn detached_steps(&self, session: &SessionRef) -> StoreResult<Vec<Step>> {
        self.store.read(|conn| {
            let session = require_session(conn, session)?;
            let chain = chain_from(conn, session.current_step)?;
            let steps = rows::steps_for_session(conn, session.id)?;
            Ok(steps
                .into_iter()
                .filter(|step| !chain.iter().any(|active| active.id == step.id))
                .collect())
        })
    }

    /// Sessions ordered by most recent activity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the listing query fails.
    pub fn list_sessions(&self, include_deleted: bool) -> StoreResult<Vec<SessionSummary>> {
        self.store
            .read(|conn| rows::list_sessions(conn, include_deleted))
    }

    /// Image of the current step, used as input for the next edit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] if the session has no current step.
    pub fn current_image(&self, session: &SessionRef) -> StoreResult<(Session, Step, PathBuf)> {
        self.store.read(|conn| {
            let session = require_session(conn, session)?;
            if session.state() != SessionState::Active {
                return Err(invalid(
                    &session,
                    &format!("session is {}", session.state().as_str()),
                ));
            }
            let step_id = session
                .current_step
                .ok_or_else(|| invalid(&session, "session has no current step"))?;
            let step = rows::find_step(conn, step_id)?
                .ok_or_else(|| StoreError::not_found(RecordKind::Step, step_id))?;
            let path = rows::generation_path(conn, step.generation_id)?
                .ok_or_else(|| invalid(&session, "current step has no saved image"))?;
            Ok((session, step, path))
        })
    }
}

fn validate_name(name: &str) -> StoreResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidState {
            session: name.to_string(),
            reason: "session name must not be empty".to_string(),
        });
    }
    Ok(trimmed)
}

fn create_row(conn: &Connection, name: &str, trigger_word: Option<&str>) -> StoreResult<i64> {
    if rows::live_name_taken(conn, name)? {
        return Err(StoreError::DuplicateName(name.to_string()));
    }
    rows::insert_session(conn, name, trigger_word, util::unix_timestamp())
}

fn require_session(conn: &Connection, reference: &SessionRef) -> StoreResult<Session> {
    rows::find_session(conn, reference)?
        .ok_or_else(|| StoreError::not_found(RecordKind::Session, reference))
}

fn invalid(session: &Session, reason: &str) -> StoreError {
    StoreError::InvalidState {
        session: session.name.clone(),
        reason: reason.to_string(),
    }
}

fn append_in(
    conn: &Connection,
    session: &Session,
    generation_id: i64,
    edit: Option<&EditDescription>,
) -> StoreResult<Step> {
    if session.state() == SessionState::Deleted {
        return Err(invalid(session, "session is deleted"));
    }
    let generation = fetch_generation(conn, generation_id)?;
    if generation.status != GenerationStatus::Succeeded {
        return Err(invalid(
            session,
            &format!(
                "generation {generation_id} is {} and cannot become a step",
                generation.status.as_str()
            ),
        ));
    }
    if let Some(existing) = rows::step_for_generation(conn, generation_id)? {
        return Err(invalid(
            session,
            &format!("generation {generation_id} already backs step {existing}"),
        ));
    }

    let parent = match session.current_step {
        Some(step_id) => Some(
            rows::find_step(conn, step_id)?
                .ok_or_else(|| StoreError::not_found(RecordKind::Step, step_id))?,
        ),
        None => None,
    };
    let now = util::unix_timestamp();
    let new_step = NewStep {
        session_id: session.id,
        sequence: rows::next_sequence(conn, session.id)?,
        depth: parent.as_ref().map_or(0, |parent| parent.depth + 1),
        parent_id: parent.as_ref().map(|parent| parent.id),
        generation_id,
        edit,
        created_at: now,
    };
    let step_id = rows::insert_step(conn, &new_step)?;
    rows::set_current_step(conn, session.id, step_id, now)?;
    rows::find_step(conn, step_id)?.ok_or_else(|| StoreError::not_found(RecordKind::Step, step_id))
}

/// Walk parent links from `current` to the base step and return them root-first.
fn chain_from(conn: &Connection, current: Option<i64>) -> StoreResult<Vec<Step>> {
    let Some(current) = current else {
        return Ok(Vec::new());
    };
    let first = rows::find_step(conn, current)?
        .ok_or_else(|| StoreError::not_found(RecordKind::Step, current))?;
    let by_id: HashMap<i64, Step> = rows::steps_for_session(conn, first.session_id)?
        .into_iter()
        .map(|step| (step.id, step))
        .collect();

    let mut chain = Vec::new();
    let mut cursor = Some(current);
    while let Some(id) = cursor {
        let step = by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(RecordKind::Step, id))?;
        cursor = step.parent_id;
        chain.push(step);
        if chain.len() > by_id.len() {
            return Err(StoreError::unavailable(format!(
                "step lineage for session {} contains a cycle",
                first.session_id
            )));
        }
    }
    chain.reverse();
    Ok(chain)
}
