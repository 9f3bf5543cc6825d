use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Which remote operation produced a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Generate,
    Edit,
    Inpaint,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Generate => "generate",
            OperationKind::Edit => "edit",
            OperationKind::Inpaint => "inpaint",
        }
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "generate" => Ok(OperationKind::Generate),
            "edit" => Ok(OperationKind::Edit),
            "inpaint" => Ok(OperationKind::Inpaint),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single model parameter value. Parameters vary per model, so the set of
/// value kinds is closed while the keys are free-form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    /// Interpret a raw command-line value: booleans and numbers first, text otherwise.
    #[must_use]
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "true" => return ParamValue::Bool(true),
            "false" => return ParamValue::Bool(false),
            _ => {}
        }
        match trimmed.parse::<f64>() {
            Ok(number) if number.is_finite() => ParamValue::Number(number),
            _ => ParamValue::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{value}"),
            ParamValue::Number(value) => write!(f, "{value}"),
            ParamValue::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("invalid parameter '{0}', expected KEY=VALUE")]
    MissingValue(String),
    #[error("invalid parameter key '{0}': use lowercase letters, digits, and underscores")]
    InvalidKey(String),
}

/// Ordered parameter map stored alongside each generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationParams(IndexMap<String, ParamValue>);

impl GenerationParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `KEY=VALUE` pairs, validating keys before they reach the store.
    ///
    /// # Errors
    ///
    /// Returns an error when an entry has no `=` or the key contains characters
    /// outside `[a-z0-9_]`.
    pub fn parse_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Self, ParamError> {
        let mut params = Self::new();
        for entry in pairs {
            let entry = entry.as_ref();
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ParamError::MissingValue(entry.to_string()))?;
            params.insert(key.trim(), ParamValue::infer(value))?;
        }
        Ok(params)
    }

    /// Insert a parameter after validating its key.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::InvalidKey`] when the key is empty or malformed.
    pub fn insert(&mut self, key: &str, value: ParamValue) -> Result<(), ParamError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
        if !valid {
            return Err(ParamError::InvalidKey(key.to_string()));
        }
        self.0.insert(key.to_string(), value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as `key=value` pairs for list views.
    #[must_use]
    pub fn summary(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Pending,
    Succeeded,
    Failed,
}

impl GenerationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Succeeded => "succeeded",
            GenerationStatus::Failed => "failed",
        }
    }

    pub(crate) fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(GenerationStatus::Pending),
            "succeeded" => Some(GenerationStatus::Succeeded),
            "failed" => Some(GenerationStatus::Failed),
            _ => None,
        }
    }
}

/// One saved image and the remote URL it was downloaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Everything needed to insert a provisional generation.
#[derive(Debug, Clone)]
pub struct NewGeneration {
    pub kind: OperationKind,
    pub prompt: String,
    pub model: String,
    pub params: GenerationParams,
}

impl NewGeneration {
    pub fn new(kind: OperationKind, prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            model: model.into(),
            params: GenerationParams::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// Terminal result of a remote call, recorded exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Succeeded {
        artifacts: Vec<Artifact>,
        elapsed: Duration,
    },
    Failed {
        message: String,
        elapsed: Option<Duration>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub id: i64,
    pub kind: OperationKind,
    pub prompt: String,
    pub model: String,
    pub params: GenerationParams,
    pub status: GenerationStatus,
    pub error_message: Option<String>,
    pub elapsed: Option<Duration>,
    pub artifacts: Vec<Artifact>,
    pub created_at: i64,
    pub finalized_at: Option<i64>,
}

impl Generation {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == GenerationStatus::Succeeded
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == GenerationStatus::Pending
    }

    /// First saved image, used for previews and the viewer.
    #[must_use]
    pub fn primary_path(&self) -> Option<&Path> {
        self.artifacts.first().map(|artifact| artifact.path.as_path())
    }
}

/// How a step was derived from its parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditDescription {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
}

impl EditDescription {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mask: None,
            strength: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but no base step yet.
    Empty,
    Active,
    Deleted,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Empty => "empty",
            SessionState::Active => "active",
            SessionState::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: i64,
    pub name: String,
    pub trigger_word: Option<String>,
    pub current_step: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Session {
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.deleted_at.is_some() {
            SessionState::Deleted
        } else if self.current_step.is_none() {
            SessionState::Empty
        } else {
            SessionState::Active
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: i64,
    pub session_id: i64,
    pub sequence: i64,
    pub depth: i64,
    pub parent_id: Option<i64>,
    pub generation_id: i64,
    pub edit: Option<EditDescription>,
    pub created_at: i64,
}

/// Sessions listing row with aggregate data for tables and the browser.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session: Session,
    pub step_count: i64,
    pub base_prompt: Option<String>,
    pub current_prompt: Option<String>,
    pub current_path: Option<PathBuf>,
}

/// Names a session either by its unique name or its numeric id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRef {
    Id(i64),
    Name(String),
}

impl SessionRef {
    /// Interpret CLI input: `#12` is always an id, anything else is a name.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('#').map(str::parse::<i64>) {
            Some(Ok(id)) => SessionRef::Id(id),
            _ => SessionRef::Name(raw.to_string()),
        }
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRef::Id(id) => write!(f, "#{id}"),
            SessionRef::Name(name) => f.write_str(name),
        }
    }
}

impl From<&Session> for SessionRef {
    fn from(session: &Session) -> Self {
        SessionRef::Id(session.id)
    }
}

impl From<&str> for SessionRef {
    fn from(name: &str) -> Self {
        SessionRef::Name(name.to_string())
    }
}
