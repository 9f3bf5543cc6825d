use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use crate::db::{GenerationFilter, HistoryStore};
use crate::lineage::SessionMachine;
use crate::preview::ThumbnailRenderer;
use crate::tui::sanitize::sanitize_render;
use crate::tui::state::{Completion, Effect, Entry, EntryKey, Thumbnail, View, filter_candidates};

/// Jobs for the lane that talks to the store and ranks candidates.
#[derive(Debug)]
pub(crate) enum QueryJob {
    Load {
        id: u64,
        view: View,
        limit: usize,
    },
    Filter {
        id: u64,
        query: String,
        candidates: Arc<Vec<Entry>>,
    },
}

#[derive(Debug)]
pub(crate) struct PreviewJob {
    id: u64,
    key: EntryKey,
    path: PathBuf,
    width: u16,
    height: u16,
}

trait Job: Send + 'static {
    fn id(&self) -> u64;
}

impl Job for QueryJob {
    fn id(&self) -> u64 {
        match self {
            QueryJob::Load { id, .. } | QueryJob::Filter { id, .. } => *id,
        }
    }
}

impl Job for PreviewJob {
    fn id(&self) -> u64 {
        self.id
    }
}

/// A background thread that only ever works on the newest request it has seen.
struct Lane<J: Job> {
    name: &'static str,
    sender: Option<Sender<J>>,
    latest: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<J: Job> Lane<J> {
    fn spawn<F>(name: &'static str, completions: Sender<Completion>, mut work: F) -> Self
    where
        F: FnMut(J) -> Completion + Send + 'static,
    {
        let (sender, receiver) = unbounded::<J>();
        let latest = Arc::new(AtomicU64::new(0));
        let cancelled = Arc::new(AtomicBool::new(false));
        let thread_latest = Arc::clone(&latest);
        let thread_cancelled = Arc::clone(&cancelled);
        let handle = thread::spawn(move || {
            while let Ok(mut job) = receiver.recv() {
                while let Ok(newer) = receiver.try_recv() {
                    job = newer;
                }
                if thread_cancelled.load(Ordering::SeqCst) {
                    break;
                }
                let id = job.id();
                if id != thread_latest.load(Ordering::SeqCst) {
                    continue;
                }
                let completion = work(job);
                if thread_cancelled.load(Ordering::SeqCst) {
                    break;
                }
                if id != thread_latest.load(Ordering::SeqCst) {
                    debug!(lane = name, id, "dropping superseded result");
                    continue;
                }
                if completions.send(completion).is_err() {
                    break;
                }
            }
        });
        Self {
            name,
            sender: Some(sender),
            latest,
            cancelled,
            handle: Some(handle),
        }
    }

    fn submit(&self, job: J) {
        self.latest.store(job.id(), Ordering::SeqCst);
        if let Some(sender) = &self.sender
            && sender.send(job).is_err()
        {
            warn!(lane = self.name, "background lane stopped");
        }
    }

    fn supersede(&self, id: u64) {
        self.latest.store(id, Ordering::SeqCst);
    }

    fn shutdown(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.sender.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!(lane = self.name, "background lane panicked");
        }
    }
}

/// The browser's background lanes and the channel their results arrive on.
pub(crate) struct Workers {
    query: Lane<QueryJob>,
    preview: Lane<PreviewJob>,
    completions: Receiver<Completion>,
}

impl Workers {
    pub(crate) fn spawn(store: Arc<HistoryStore>, renderer: Arc<dyn ThumbnailRenderer>) -> Self {
        let (sender, completions) = unbounded();
        let query = Lane::spawn("query", sender.clone(), move |job: QueryJob| run_query(&store, job));
        let preview = Lane::spawn("preview", sender, move |job: PreviewJob| {
            let thumbnail = match renderer.render(&job.path, job.width, job.height) {
                Ok(raw) => {
                    let text = sanitize_render(&raw);
                    if text.styled.is_some() {
                        Thumbnail::Rendered(text)
                    } else {
                        Thumbnail::Unavailable("renderer produced no output".to_string())
                    }
                }
                Err(err) => Thumbnail::Unavailable(err.to_string()),
            };
            Completion::Previewed {
                id: job.id,
                key: job.key,
                thumbnail,
            }
        });
        Self {
            query,
            preview,
            completions,
        }
    }

    /// Route a controller effect to its lane. `Open` is handled by the caller.
    pub(crate) fn dispatch(&self, effect: Effect) {
        match effect {
            Effect::Load { id, view, limit } => self.query.submit(QueryJob::Load { id, view, limit }),
            Effect::Filter {
                id,
                query,
                candidates,
            } => self.query.submit(QueryJob::Filter {
                id,
                query,
                candidates,
            }),
            Effect::CancelFilter { id } => self.query.supersede(id),
            Effect::Preview {
                id,
                key,
                path,
                width,
                height,
            } => self.preview.submit(PreviewJob {
                id,
                key,
                path,
                width,
                height,
            }),
            Effect::Open { .. } => {}
        }
    }

    pub(crate) fn completions(&self) -> &Receiver<Completion> {
        &self.completions
    }

    /// Cancel outstanding work and wait for both lanes to stop.
    pub(crate) fn shutdown(mut self) {
        self.query.shutdown();
        self.preview.shutdown();
    }
}

fn run_query(store: &HistoryStore, job: QueryJob) -> Completion {
    match job {
        QueryJob::Load { id, view, limit } => {
            let result = match view {
                View::Generations => store
                    .query(&GenerationFilter {
                        limit: Some(limit),
                        ..GenerationFilter::default()
                    })
                    .map(|generations| {
                        generations
                            .iter()
                            .map(Entry::from_generation)
                            .collect::<Vec<_>>()
                    }),
                View::Sessions => SessionMachine::new(store)
                    .list_sessions(false)
                    .map(|sessions| {
                        sessions
                            .iter()
                            .take(limit)
                            .map(Entry::from_session)
                            .collect::<Vec<_>>()
                    }),
            }
            .map_err(|err| {
                warn!(error = %err, "browser query failed");
                err.to_string()
            });
            Completion::Loaded { id, view, result }
        }
        QueryJob::Filter {
            id,
            query,
            candidates,
        } => {
            let matches = filter_candidates(&query, &candidates);
            Completion::Filtered { id, query, matches }
        }
    }
}
