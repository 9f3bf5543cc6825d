use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{GenerationParams, OperationKind};

/// Payload handed to the remote image backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendRequest {
    pub kind: OperationKind,
    pub model: String,
    pub prompt: String,
    pub params: GenerationParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_image: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendOutcome {
    Success {
        artifact_urls: Vec<String>,
        /// Inference time reported by the backend, when it reports one.
        timing: Option<Duration>,
    },
    Failure {
        message: String,
    },
}

/// Remote generation service. Implementations may block for seconds.
pub trait Backend: Send + Sync {
    fn submit(&self, request: &BackendRequest) -> BackendOutcome;
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    images: Vec<WireImage>,
    #[serde(default)]
    timings: Option<WireTimings>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireTimings {
    inference: Option<f64>,
}

/// Runs an external program per request: JSON request on stdin, JSON response on stdout.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    argv: Vec<String>,
}

impl CommandBackend {
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn run(&self, request: &BackendRequest) -> Result<Vec<u8>, String> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| "no backend command configured".to_string())?;
        let payload = serde_json::to_vec(request).map_err(|err| err.to_string())?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("failed to start backend '{program}': {err}"))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .map_err(|err| format!("failed to send request to backend: {err}"))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|err| format!("backend did not finish: {err}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "backend exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        Ok(output.stdout)
    }
}

impl Backend for CommandBackend {
    fn submit(&self, request: &BackendRequest) -> BackendOutcome {
        debug!(kind = %request.kind, model = %request.model, "submitting to backend command");
        match self.run(request) {
            Ok(stdout) => parse_response(&stdout),
            Err(message) => BackendOutcome::Failure { message },
        }
    }
}

pub(crate) fn parse_response(raw: &[u8]) -> BackendOutcome {
    let response: WireResponse = match serde_json::from_slice(raw) {
        Ok(response) => response,
        Err(err) => {
            return BackendOutcome::Failure {
                message: format!("unreadable backend response: {err}"),
            };
        }
    };
    if let Some(message) = response.error {
        return BackendOutcome::Failure { message };
    }
    BackendOutcome::Success {
        artifact_urls: response.images.into_iter().map(|image| image.url).collect(),
        timing: response
            .timings
            .and_then(|timings| timings.inference)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64),
    }
}

/// A backend submission running on its own thread that yields exactly one outcome.
#[derive(Debug)]
pub struct PendingOutcome {
    receiver: Receiver<BackendOutcome>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PendingOutcome {
    pub fn spawn(backend: Arc<dyn Backend>, request: BackendRequest) -> Self {
        let (sender, receiver) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let handle = thread::spawn(move || {
            let outcome = backend.submit(&request);
            if flag.load(Ordering::SeqCst) {
                debug!("dropping outcome of cancelled backend request");
                return;
            }
            let _ = sender.send(outcome);
        });
        Self {
            receiver,
            cancelled,
            handle: Some(handle),
        }
    }

    /// Block until the backend answers.
    #[must_use]
    pub fn wait(mut self) -> BackendOutcome {
        let outcome = self
            .receiver
            .recv()
            .unwrap_or_else(|_| BackendOutcome::Failure {
                message: "backend worker exited without an outcome".to_string(),
            });
        self.join();
        outcome
    }

    /// Wait up to `timeout`. A request still running is handed back so the
    /// caller can keep waiting or [`cancel`](Self::cancel) it.
    ///
    /// # Errors
    ///
    /// Returns `self` when no outcome arrived in time.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<BackendOutcome, Self> {
        let outcome = match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => return Err(self),
            Err(RecvTimeoutError::Disconnected) => BackendOutcome::Failure {
                message: "backend worker exited without an outcome".to_string(),
            },
        };
        self.join();
        Ok(outcome)
    }

    /// Discard the eventual outcome. The worker thread is detached.
    pub fn cancel(mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.handle.take();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("backend worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(BackendOutcome);

    impl Backend for Fixed {
        fn submit(&self, _request: &BackendRequest) -> BackendOutcome {
            self.0.clone()
        }
    }

    fn request() -> BackendRequest {
        BackendRequest {
            kind: OperationKind::Generate,
            model: "flux".into(),
            prompt: "a lighthouse".into(),
            params: GenerationParams::new(),
            input_image: None,
            mask: None,
            strength: None,
        }
    }

    #[test]
    fn parses_success_and_error_payloads() {
        let ok = parse_response(br#"{"images":[{"url":"https://x/1.jpg"}],"timings":{"inference":1.5}}"#);
        assert_eq!(
            ok,
            BackendOutcome::Success {
                artifact_urls: vec!["https://x/1.jpg".into()],
                timing: Some(Duration::from_millis(1500)),
            }
        );
        let err = parse_response(br#"{"error":"nsfw content"}"#);
        assert_eq!(
            err,
            BackendOutcome::Failure {
                message: "nsfw content".into()
            }
        );
        assert!(matches!(
            parse_response(b"not json"),
            BackendOutcome::Failure { .. }
        ));
    }

    #[test]
    fn pending_outcome_delivers_once() {
        let backend = Arc::new(Fixed(BackendOutcome::Failure {
            message: "boom".into(),
        }));
        let pending = PendingOutcome::spawn(backend, request());
        assert_eq!(
            pending.wait(),
            BackendOutcome::Failure {
                message: "boom".into()
            }
        );
    }

    struct Slow(Duration);

    impl Backend for Slow {
        fn submit(&self, _request: &BackendRequest) -> BackendOutcome {
            thread::sleep(self.0);
            BackendOutcome::Success {
                artifact_urls: vec!["file:///late.png".into()],
                timing: None,
            }
        }
    }

    #[test]
    fn wait_timeout_hands_back_a_running_request() {
        let pending = PendingOutcome::spawn(Arc::new(Slow(Duration::from_millis(300))), request());
        let pending = pending
            .wait_timeout(Duration::from_millis(10))
            .expect_err("still running");
        let outcome = pending
            .wait_timeout(Duration::from_secs(10))
            .expect("finishes");
        assert!(matches!(outcome, BackendOutcome::Success { .. }));
    }

    #[test]
    fn cancelled_requests_drop_their_outcome() {
        let pending = PendingOutcome::spawn(Arc::new(Slow(Duration::from_millis(500))), request());
        let pending = pending
            .wait_timeout(Duration::from_millis(1))
            .expect_err("still running");
        let flag = Arc::clone(&pending.cancelled);
        let receiver = pending.receiver.clone();
        pending.cancel();
        assert!(flag.load(Ordering::SeqCst));
        assert!(receiver.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn missing_command_is_a_failure() {
        let outcome = CommandBackend::new(Vec::new()).submit(&request());
        assert!(matches!(outcome, BackendOutcome::Failure { .. }));
    }
}
