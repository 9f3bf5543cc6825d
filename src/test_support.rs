use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::{LazyLock, Mutex};
use std::thread;
use std::time::Duration;

use crate::backend::{Backend, BackendOutcome, BackendRequest};

/// Global mutex for tests that mutate process-wide environment variables such
/// as `NH_CONFIG_DIR`, `NH_DATA_DIR`, or `PATH`.
pub static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Restores an environment variable when dropped.
///
/// Callers should hold [`ENV_LOCK`] while constructing instances of this type.
#[derive(Debug)]
pub struct EnvOverride {
    key: String,
    original: Option<OsString>,
}

impl EnvOverride {
    #[must_use]
    pub fn set_var(key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        let key = key.into();
        let original = std::env::var_os(&key);
        // SAFETY: callers hold ENV_LOCK, so no other test thread touches the environment.
        unsafe {
            std::env::set_var(&key, value);
        }
        Self { key, original }
    }

    #[must_use]
    pub fn set_path(key: impl Into<String>, path: &Path) -> Self {
        Self::set_var(key, path.as_os_str())
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        // SAFETY: see `set_var`.
        unsafe {
            match &self.original {
                Some(value) => std::env::set_var(&self.key, value),
                None => std::env::remove_var(&self.key),
            }
        }
    }
}

/// Backend that replays queued outcomes in order and records every request.
///
/// Once the queue is empty every submission fails.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    outcomes: Mutex<VecDeque<BackendOutcome>>,
    requests: Mutex<Vec<BackendRequest>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a success returning the given image sources.
    #[must_use]
    pub fn succeed_with<S: AsRef<str>>(self, sources: &[S]) -> Self {
        self.push(BackendOutcome::Success {
            artifact_urls: sources.iter().map(|s| s.as_ref().to_string()).collect(),
            timing: Some(Duration::from_millis(1500)),
        })
    }

    /// Queue a backend failure.
    #[must_use]
    pub fn fail_with(self, message: &str) -> Self {
        self.push(BackendOutcome::Failure {
            message: message.to_string(),
        })
    }

    /// Sleep this long before answering each request.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, outcome: BackendOutcome) -> Self {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(outcome);
        }
        self
    }

    /// Requests submitted so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Backend for ScriptedBackend {
    fn submit(&self, request: &BackendRequest) -> BackendOutcome {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front())
            .unwrap_or_else(|| BackendOutcome::Failure {
                message: "no scripted outcome left".to_string(),
            })
    }
}

/// Render a filesystem path so it can be embedded inside a TOML string
/// without triggering escape sequences on Windows.
#[must_use]
pub fn toml_path(path: &Path) -> String {
    let rendered = path.to_string_lossy();
    #[cfg(windows)]
    {
        rendered.replace('\\', "\\\\")
    }
    #[cfg(not(windows))]
    {
        rendered.to_string()
    }
}
