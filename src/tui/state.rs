use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::config::model::BrowserConfig;
use crate::model::{Generation, GenerationStatus, SessionSummary};
use crate::search;
use crate::tui::sanitize::SanitizedText;
use crate::util;

const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum View {
    Generations,
    Sessions,
}

impl View {
    pub(crate) fn title(self) -> &'static str {
        match self {
            View::Generations => "Generations",
            View::Sessions => "Sessions",
        }
    }

    fn toggled(self) -> Self {
        match self {
            View::Generations => View::Sessions,
            View::Sessions => View::Generations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EntryKey {
    Generation(i64),
    Session(i64),
}

/// One browsable record, flattened for listing, filtering, and previews.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub key: EntryKey,
    pub title: String,
    pub search_text: String,
    /// Creation order used to break ranking ties, newest highest.
    pub order: i64,
    pub primary_path: Option<PathBuf>,
    pub details: Vec<String>,
    pub failed: bool,
}

impl Entry {
    pub(crate) fn from_generation(generation: &Generation) -> Self {
        let marker = match generation.status {
            GenerationStatus::Succeeded => "✔",
            GenerationStatus::Failed => "✘",
            GenerationStatus::Pending => "…",
        };
        let mut details = vec![
            format!("Prompt: {}", generation.prompt),
            format!("Model: {}  Kind: {}", generation.model, generation.kind),
            format!("Status: {}", generation.status.as_str()),
            format!("Created: {}", util::format_timestamp(Some(generation.created_at))),
        ];
        if let Some(elapsed) = generation.elapsed {
            details.push(format!("Time: {:.1}s", elapsed.as_secs_f64()));
        }
        if !generation.params.is_empty() {
            details.push(format!("Params: {}", generation.params.summary()));
        }
        details.push(format!("Images: {}", generation.artifacts.len()));
        if let Some(error) = &generation.error_message {
            details.push(format!("Error: {error}"));
        }
        Self {
            key: EntryKey::Generation(generation.id),
            title: format!("{marker} #{} {}", generation.id, generation.prompt),
            search_text: format!("{} {}", generation.prompt, generation.model),
            order: generation.id,
            primary_path: generation.primary_path().map(PathBuf::from),
            details,
            failed: generation.status == GenerationStatus::Failed,
        }
    }

    pub(crate) fn from_session(summary: &SessionSummary) -> Self {
        let session = &summary.session;
        let mut details = vec![
            format!("Session: {} (#{})", session.name, session.id),
            format!("State: {}  Steps: {}", session.state().as_str(), summary.step_count),
            format!("Updated: {}", util::format_timestamp(Some(session.updated_at))),
        ];
        if let Some(trigger) = &session.trigger_word {
            details.push(format!("Trigger: {trigger}"));
        }
        if let Some(base) = &summary.base_prompt {
            details.push(format!("Base: {base}"));
        }
        if let Some(current) = &summary.current_prompt {
            details.push(format!("Current: {current}"));
        }
        let search_text = [
            Some(session.name.as_str()),
            session.trigger_word.as_deref(),
            summary.base_prompt.as_deref(),
            summary.current_prompt.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
        Self {
            key: EntryKey::Session(session.id),
            title: format!("{} ({} steps)", session.name, summary.step_count),
            search_text,
            order: session.updated_at,
            primary_path: summary.current_path.clone(),
            details,
            failed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Thumbnail {
    Loading,
    NoImage,
    Rendered(SanitizedText),
    Unavailable(String),
}

/// Work the controller asks the runtime to perform.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
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
    /// Supersede whatever the query lane is doing without queuing new work.
    CancelFilter {
        id: u64,
    },
    Preview {
        id: u64,
        key: EntryKey,
        path: PathBuf,
        width: u16,
        height: u16,
    },
    Open {
        path: PathBuf,
    },
}

/// Results delivered back into the loop.
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Loaded {
        id: u64,
        view: View,
        result: Result<Vec<Entry>, String>,
    },
    Filtered {
        id: u64,
        query: String,
        matches: Vec<usize>,
    },
    Previewed {
        id: u64,
        key: EntryKey,
        thumbnail: Thumbnail,
    },
    Opened {
        path: PathBuf,
        result: Result<(), String>,
    },
}

/// Rank `candidates` for `query`; returns indices in display order.
pub(crate) fn filter_candidates(query: &str, candidates: &[Entry]) -> Vec<usize> {
    search::rank(query, candidates, |entry| {
        (entry.search_text.as_str(), entry.order)
    })
    .into_iter()
    .map(|found| found.index)
    .collect()
}

/// View state of the browser. Pure: input events and completions go in,
/// [`Effect`]s come out, and nothing here touches the terminal or the store.
#[derive(Debug)]
pub(crate) struct BrowserState {
    pub view: View,
    pub query: String,
    /// Query whose results are currently visible.
    pub applied_query: String,
    pub candidates: Arc<Vec<Entry>>,
    pub visible: Vec<usize>,
    pub index: usize,
    pub window_start: usize,
    pub page_size: usize,
    pub thumbnail: Option<(EntryKey, Thumbnail)>,
    pub error: Option<String>,
    pub should_quit: bool,
    settings: BrowserConfig,
    dirty_since: Option<Instant>,
    next_id: u64,
    pending_load: Option<u64>,
    pending_filter: Option<u64>,
    pending_preview: Option<(u64, EntryKey)>,
    preview_cache: HashMap<EntryKey, Thumbnail>,
    status: Option<(String, Instant)>,
    effects: Vec<Effect>,
}

impl BrowserState {
    pub(crate) fn new(settings: BrowserConfig) -> Self {
        let mut state = Self {
            view: View::Generations,
            query: String::new(),
            applied_query: String::new(),
            candidates: Arc::new(Vec::new()),
            visible: Vec::new(),
            index: 0,
            window_start: 0,
            page_size: DEFAULT_PAGE_SIZE,
            thumbnail: None,
            error: None,
            should_quit: false,
            settings,
            dirty_since: None,
            next_id: 0,
            pending_load: None,
            pending_filter: None,
            pending_preview: None,
            preview_cache: HashMap::new(),
            status: None,
            effects: Vec::new(),
        };
        state.request_load();
        state
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn next_request(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.pending_load.is_some() || self.pending_filter.is_some() || self.dirty_since.is_some()
    }

    pub(crate) fn selected(&self) -> Option<&Entry> {
        self.visible
            .get(self.index)
            .and_then(|candidate| self.candidates.get(*candidate))
    }

    pub(crate) fn visible_entries(&self) -> impl Iterator<Item = &Entry> {
        self.visible
            .iter()
            .filter_map(|candidate| self.candidates.get(*candidate))
    }

    pub(crate) fn set_status(&mut self, message: impl Into<String>, now: Instant) {
        self.status = Some((message.into(), now + self.settings.status_duration));
    }

    pub(crate) fn status_message(&self, now: Instant) -> Option<&str> {
        match &self.status {
            Some((message, until)) if now < *until => Some(message.as_str()),
            _ => self.error.as_deref(),
        }
    }

    pub(crate) fn set_page_size(&mut self, rows: usize) {
        self.page_size = rows.max(1);
        self.ensure_visible();
    }

    fn request_load(&mut self) {
        let id = self.next_request();
        self.pending_load = Some(id);
        self.pending_filter = None;
        self.effects.push(Effect::Load {
            id,
            view: self.view,
            limit: self.settings.candidate_limit,
        });
    }

    fn dispatch_filter(&mut self) {
        let id = self.next_request();
        self.dirty_since = None;
        self.pending_filter = Some(id);
        self.effects.push(Effect::Filter {
            id,
            query: self.query.clone(),
            candidates: Arc::clone(&self.candidates),
        });
    }

    fn query_changed(&mut self, now: Instant) {
        self.dirty_since = Some(now);
        if self.pending_filter.take().is_some() {
            let id = self.next_request();
            self.effects.push(Effect::CancelFilter { id });
        }
    }

    /// Fire the debounced filter once input has been quiet long enough.
    pub(crate) fn tick(&mut self, now: Instant) {
        if self.pending_load.is_some() {
            return;
        }
        if let Some(since) = self.dirty_since
            && now.saturating_duration_since(since) >= self.settings.debounce
        {
            self.dispatch_filter();
        }
    }

    /// Time until the pending debounce fires, for sizing the input poll.
    pub(crate) fn debounce_remaining(&self, now: Instant) -> Option<Duration> {
        self.dirty_since
            .map(|since| self.settings.debounce.saturating_sub(now.saturating_duration_since(since)))
    }

    pub(crate) fn handle_key(&mut self, key: KeyEvent, now: Instant) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => self.should_quit = true,
            KeyCode::Char('r') if ctrl => self.refresh(now),
            KeyCode::Esc => {
                if self.query.is_empty() {
                    self.should_quit = true;
                } else {
                    self.query.clear();
                    self.query_changed(now);
                }
            }
            KeyCode::Tab => {
                self.view = self.view.toggled();
                self.query.clear();
                self.applied_query.clear();
                self.dirty_since = None;
                self.candidates = Arc::new(Vec::new());
                self.visible.clear();
                self.index = 0;
                self.window_start = 0;
                self.thumbnail = None;
                self.request_load();
            }
            KeyCode::Enter => self.open_selected(now),
            KeyCode::Up => self.move_selection(-1),
            KeyCode::Down => self.move_selection(1),
            KeyCode::PageUp => self.move_selection(-isize::try_from(self.page_size).unwrap_or(1)),
            KeyCode::PageDown => self.move_selection(isize::try_from(self.page_size).unwrap_or(1)),
            KeyCode::Home => self.select(0),
            KeyCode::End => self.select(self.visible.len().saturating_sub(1)),
            KeyCode::Backspace => {
                if self.query.pop().is_some() {
                    self.query_changed(now);
                }
            }
            KeyCode::Char(ch) if !ctrl => {
                self.query.push(ch);
                self.query_changed(now);
            }
            _ => {}
        }
    }

    /// Discard the cached view and re-query the store from scratch.
    pub(crate) fn refresh(&mut self, now: Instant) {
        self.preview_cache.clear();
        self.pending_preview = None;
        self.thumbnail = None;
        self.error = None;
        self.dirty_since = None;
        self.request_load();
        self.set_status("Refreshing…", now);
    }

    fn move_selection(&mut self, delta: isize) {
        self.select(self.index.saturating_add_signed(delta));
    }

    fn select(&mut self, index: usize) {
        if self.visible.is_empty() {
            self.index = 0;
            self.window_start = 0;
            self.thumbnail = None;
            self.pending_preview = None;
            return;
        }
        let next = index.min(self.visible.len() - 1);
        let changed = next != self.index || self.thumbnail.is_none();
        self.index = next;
        self.ensure_visible();
        if changed {
            self.request_preview();
        }
    }

    fn ensure_visible(&mut self) {
        if self.index < self.window_start {
            self.window_start = self.index;
        } else if self.index >= self.window_start + self.page_size {
            self.window_start = self.index + 1 - self.page_size;
        }
    }

    fn request_preview(&mut self) {
        let Some(entry) = self.selected() else {
            self.thumbnail = None;
            self.pending_preview = None;
            return;
        };
        let key = entry.key;
        let path = entry.primary_path.clone();
        if let Some(cached) = self.preview_cache.get(&key) {
            self.thumbnail = Some((key, cached.clone()));
            self.pending_preview = None;
            return;
        }
        let Some(path) = path else {
            self.thumbnail = Some((key, Thumbnail::NoImage));
            self.pending_preview = None;
            return;
        };
        let id = self.next_request();
        self.pending_preview = Some((id, key));
        self.thumbnail = Some((key, Thumbnail::Loading));
        self.effects.push(Effect::Preview {
            id,
            key,
            path,
            width: self.settings.preview_width,
            height: self.settings.preview_height,
        });
    }

    fn open_selected(&mut self, now: Instant) {
        match self.selected().map(|entry| entry.primary_path.clone()) {
            Some(Some(path)) => self.effects.push(Effect::Open { path }),
            Some(None) => self.set_status("No image for this entry", now),
            None => {}
        }
    }

    /// Apply a background result if it is still the newest request for its slot.
    /// Returns whether the completion was applied.
    pub(crate) fn apply(&mut self, completion: Completion, now: Instant) -> bool {
        match completion {
            Completion::Loaded { id, view, result } => {
                if self.pending_load != Some(id) || view != self.view {
                    return false;
                }
                self.pending_load = None;
                match result {
                    Ok(entries) => {
                        self.error = None;
                        self.candidates = Arc::new(entries);
                        self.dispatch_filter();
                    }
                    Err(message) => {
                        self.error = Some(format!("{message} (Ctrl-R to retry)"));
                        self.dirty_since = None;
                    }
                }
                true
            }
            Completion::Filtered { id, query, matches } => {
                if self.pending_filter != Some(id) {
                    return false;
                }
                self.pending_filter = None;
                self.applied_query = query;
                self.visible = matches;
                self.index = 0;
                self.window_start = 0;
                self.thumbnail = None;
                self.select(0);
                true
            }
            Completion::Previewed { id, key, thumbnail } => {
                if self.pending_preview != Some((id, key))
                    || self.selected().map(|entry| entry.key) != Some(key)
                {
                    return false;
                }
                self.pending_preview = None;
                self.preview_cache.insert(key, thumbnail.clone());
                self.thumbnail = Some((key, thumbnail));
                true
            }
            Completion::Opened { path, result } => {
                match result {
                    Ok(()) => self.set_status(format!("Opened {}", path.display()), now),
                    Err(message) => self.set_status(format!("Open failed: {message}"), now),
                }
                true
            }
        }
    }
}
