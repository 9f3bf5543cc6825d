use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::backend::{Backend, BackendOutcome, BackendRequest, PendingOutcome};
use crate::db::{HistoryStore, StoreResult};
use crate::lineage::SessionMachine;
use crate::model::{
    Artifact, EditDescription, Generation, GenerationOutcome, GenerationParams, NewGeneration,
    OperationKind, SessionRef, Step,
};
use crate::storage::BlobStore;
use crate::util;

/// Result of an edit: the recorded generation, plus the new step when it succeeded.
#[derive(Debug, Clone)]
pub struct EditResult {
    pub generation: Generation,
    pub step: Option<Step>,
}

/// Drives one backend call end to end: provisional record, submission, image
/// download, and a single finalize.
pub struct Recorder<'a> {
    store: &'a HistoryStore,
    backend: Arc<dyn Backend>,
    blobs: &'a dyn BlobStore,
    timeout: Option<Duration>,
}

impl<'a> Recorder<'a> {
    pub fn new(store: &'a HistoryStore, backend: Arc<dyn Backend>, blobs: &'a dyn BlobStore) -> Self {
        Self {
            store,
            backend,
            blobs,
            timeout: None,
        }
    }

    /// Abandon backend calls that take longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generate from a prompt. Backend failures are recorded, not returned as errors.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::db::StoreError`] only when the history itself cannot be written.
    pub fn generate(&self, new: &NewGeneration) -> StoreResult<Generation> {
        self.run(new, None, None, None)
    }

    /// Edit the current image of a session and append a step on success.
    ///
    /// A mask turns the edit into an inpaint. A failed edit is recorded as a
    /// failed generation and leaves the session pointer where it was.
    ///
    /// # Errors
    ///
    /// Returns [`crate::db::StoreError::InvalidState`] when the session has no
    /// current image, plus any store failure.
    pub fn edit_session(
        &self,
        session: &SessionRef,
        edit: &EditDescription,
        model: &str,
        params: GenerationParams,
    ) -> StoreResult<EditResult> {
        let machine = SessionMachine::new(self.store);
        let (session, current, input) = machine.current_image(session)?;
        let kind = if edit.mask.is_some() {
            OperationKind::Inpaint
        } else {
            OperationKind::Edit
        };
        let new = NewGeneration::new(kind, edit.prompt.clone(), model).with_params(params);
        let generation = self.run(&new, Some(&input), edit.mask.as_deref(), edit.strength)?;
        if !generation.succeeded() {
            warn!(
                session = session.id,
                parent = current.id,
                generation = generation.id,
                "edit failed; session pointer unchanged"
            );
            return Ok(EditResult {
                generation,
                step: None,
            });
        }
        let step = machine.append_step(&SessionRef::Id(session.id), generation.id, Some(edit))?;
        Ok(EditResult {
            generation,
            step: Some(step),
        })
    }

    fn run(
        &self,
        new: &NewGeneration,
        input_image: Option<&Path>,
        mask: Option<&Path>,
        strength: Option<f64>,
    ) -> StoreResult<Generation> {
        let provisional = self.store.record_generation(new)?;
        let request = BackendRequest {
            kind: new.kind,
            model: new.model.clone(),
            prompt: new.prompt.clone(),
            params: new.params.clone(),
            input_image: input_image.map(Path::to_path_buf),
            mask: mask.map(Path::to_path_buf),
            strength,
        };
        let started = Instant::now();
        let pending = PendingOutcome::spawn(Arc::clone(&self.backend), request);
        let outcome = match self.timeout {
            None => pending.wait(),
            Some(limit) => pending.wait_timeout(limit).unwrap_or_else(|pending| {
                pending.cancel();
                warn!(id = provisional.id, ?limit, "backend timed out; request abandoned");
                BackendOutcome::Failure {
                    message: format!(
                        "backend did not answer within {}",
                        humantime::format_duration(limit)
                    ),
                }
            }),
        };
        let measured = started.elapsed();

        let outcome = match outcome {
            BackendOutcome::Success {
                artifact_urls,
                timing,
            } => {
                let elapsed = timing.unwrap_or(measured);
                if artifact_urls.is_empty() {
                    GenerationOutcome::Failed {
                        message: "backend returned no images".to_string(),
                        elapsed: Some(elapsed),
                    }
                } else {
                    match self.save_all(&provisional, &artifact_urls) {
                        Ok(artifacts) => GenerationOutcome::Succeeded { artifacts, elapsed },
                        Err(message) => GenerationOutcome::Failed {
                            message,
                            elapsed: Some(elapsed),
                        },
                    }
                }
            }
            BackendOutcome::Failure { message } => GenerationOutcome::Failed {
                message,
                elapsed: Some(measured),
            },
        };
        let generation = self.store.finalize_generation(provisional.id, &outcome)?;
        if let Some(message) = &generation.error_message {
            warn!(id = generation.id, error = %message, "generation failed");
        } else {
            info!(id = generation.id, images = generation.artifacts.len(), "generation saved");
        }
        Ok(generation)
    }

    fn save_all(&self, generation: &Generation, urls: &[String]) -> Result<Vec<Artifact>, String> {
        let mut artifacts = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let filename = image_filename(generation, index, url);
            match self.blobs.save(url, &filename) {
                Ok(path) => artifacts.push(Artifact {
                    path,
                    url: Some(url.clone()),
                }),
                Err(err) => {
                    for saved in &artifacts {
                        if let Err(cleanup) = self.blobs.delete(&saved.path) {
                            warn!(path = %saved.path.display(), error = %cleanup, "failed to remove partial image");
                        }
                    }
                    return Err(format!("failed to save image {}: {err}", index + 1));
                }
            }
        }
        Ok(artifacts)
    }
}

/// `{kind}_{YYYYmmdd_HHMMSS}_{id}_{n}.{ext}` with the extension taken from the URL.
pub(crate) fn image_filename(generation: &Generation, index: usize, url: &str) -> String {
    let ext = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "jpg".to_string());
    format!(
        "{}_{}_{}_{}.{ext}",
        generation.kind,
        util::file_stamp(generation.created_at),
        generation.id,
        index + 1
    )
}
