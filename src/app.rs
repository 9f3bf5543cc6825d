use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde_json::json;
use tracing::info;
use which::which;

use crate::backend::{Backend, CommandBackend};
use crate::cli::{
    Cli, ConfigCommand, GenerateCommand, HistoryCleanupCommand, HistoryCommand,
    HistoryListCommand, HistoryOpenCommand, HistoryShowCommand, ModelArgs, SessionAppendCommand,
    SessionCommand, SessionEditCommand, SessionListCommand, SessionShowCommand,
    SessionStartCommand,
};
use crate::config::LoadedConfig;
use crate::config::model::DiagnosticLevel;
use crate::db::{CleanupReport, GenerationFilter, HistoryStats, HistoryStore, StoreError};
use crate::lineage::SessionMachine;
use crate::model::{
    EditDescription, Generation, GenerationParams, NewGeneration, OperationKind, Session,
    SessionRef, SessionState, SessionSummary, Step,
};
use crate::preview::{CommandRenderer, SystemViewer, Viewer};
use crate::recorder::Recorder;
use crate::storage::LocalBlobStore;
use crate::tui;
use crate::util;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("generation {id} failed: {message}")]
    GenerationFailed { id: i64, message: String },
    #[error("no backend command configured; set `command` under [backend] in config.toml")]
    BackendNotConfigured,
    #[error("no generations recorded yet")]
    EmptyHistory,
    #[error("generation {id} has {count} image(s); index {index} is out of range")]
    ImageIndex { id: i64, count: usize, index: usize },
}

pub struct App<'cli> {
    pub cli: &'cli Cli,
    pub loaded: LoadedConfig,
    pub store: Arc<HistoryStore>,
    backend: Option<Arc<dyn Backend>>,
}

impl<'cli> App<'cli> {
    /// Construct the application, loading configuration and opening the history store.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or the `SQLite`
    /// database cannot be opened and prepared.
    pub fn bootstrap(cli: &'cli Cli) -> Result<Self> {
        let loaded = crate::config::load(cli.config_dir.as_deref())?;
        let database = &loaded.config.storage.database;
        let store = HistoryStore::open(&loaded.config.storage)
            .wrap_err_with(|| format!("failed to open history at {}", database.display()))?;
        let command = &loaded.config.backend.command;
        let backend = (!command.is_empty())
            .then(|| Arc::new(CommandBackend::new(command.clone())) as Arc<dyn Backend>);
        Ok(Self {
            cli,
            loaded,
            store: Arc::new(store),
            backend,
        })
    }

    fn json(&self, local: bool) -> bool {
        local || self.cli.json
    }

    fn backend(&self) -> Result<Arc<dyn Backend>> {
        self.backend
            .clone()
            .ok_or_else(|| AppError::BackendNotConfigured.into())
    }

    fn viewer(&self) -> SystemViewer {
        SystemViewer::new(&self.loaded.config.viewer)
    }

    fn model_and_params(&self, args: &ModelArgs) -> Result<(String, GenerationParams)> {
        let model = args
            .model
            .clone()
            .unwrap_or_else(|| self.loaded.config.backend.model.clone());
        let params = GenerationParams::parse_pairs(&args.params).wrap_err("invalid --param")?;
        Ok((model, params))
    }

    /// Generate images for a prompt and record the attempt.
    ///
    /// # Errors
    ///
    /// Returns an error when no backend is configured, the history cannot be
    /// written, or the backend reports a failure (which is still recorded).
    pub fn generate(&self, cmd: &GenerateCommand) -> Result<()> {
        let backend = self.backend()?;
        let (model, params) = self.model_and_params(&cmd.model)?;
        let blobs = LocalBlobStore::new(&self.loaded.config.storage);
        let recorder = Recorder::new(&self.store, backend, &blobs)
            .with_timeout(self.loaded.config.backend.timeout);
        let generation = recorder.generate(
            &NewGeneration::new(OperationKind::Generate, cmd.prompt.as_str(), model)
                .with_params(params),
        )?;
        self.report_generation(&generation)?;
        ensure_succeeded(&generation)
    }

    /// Dispatch a `history` subcommand.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen subcommand fails.
    pub fn history(&self, cmd: &HistoryCommand) -> Result<()> {
        match cmd {
            HistoryCommand::List(list) => self.history_list(list),
            HistoryCommand::Show(show) => self.history_show(show),
            HistoryCommand::Open(open) => self.history_open(open),
            HistoryCommand::Stats => self.history_stats(),
            HistoryCommand::Cleanup(cleanup) => {
                let stdin = io::stdin();
                self.history_cleanup(cleanup, &mut stdin.lock(), &mut io::stdout())
            }
            HistoryCommand::Browse => self.run_ui(),
        }
    }

    fn history_list(&self, cmd: &HistoryListCommand) -> Result<()> {
        let generations = self.store.query(&GenerationFilter {
            prompt_contains: cmd.search.clone(),
            model: cmd.model.clone(),
            success_only: !cmd.all,
            limit: Some(cmd.limit),
            offset: cmd.offset,
        })?;

        if self.json(cmd.json) {
            let payload: Vec<_> = generations.iter().map(generation_to_json).collect();
            println!("{}", serde_json::to_string_pretty(&payload)?);
            return Ok(());
        }

        if generations.is_empty() {
            println!("No generations found.");
            return Ok(());
        }

        print_generations_table(&generations);
        Ok(())
    }

    fn resolve_generation(&self, id: Option<i64>) -> Result<Generation> {
        let id = match id {
            Some(id) => id,
            None => self
                .store
                .latest_generation_id()?
                .ok_or(AppError::EmptyHistory)?,
        };
        Ok(self.store.generation(id)?)
    }

    fn history_show(&self, cmd: &HistoryShowCommand) -> Result<()> {
        let generation = self.resolve_generation(cmd.id)?;
        if self.json(cmd.json) {
            println!(
                "{}",
                serde_json::to_string_pretty(&generation_to_json(&generation))?
            );
            return Ok(());
        }
        print_generation_details(&generation);
        Ok(())
    }

    fn history_open(&self, cmd: &HistoryOpenCommand) -> Result<()> {
        let generation = self.resolve_generation(cmd.id)?;
        let artifact = cmd
            .index
            .checked_sub(1)
            .and_then(|index| generation.artifacts.get(index))
            .ok_or(AppError::ImageIndex {
                id: generation.id,
                count: generation.artifacts.len(),
                index: cmd.index,
            })?;
        open_image(&self.viewer(), &artifact.path)
    }

    fn history_stats(&self) -> Result<()> {
        let stats = self.store.stats()?;
        if self.cli.json {
            let mut payload = serde_json::to_value(&stats)?;
            payload["success_rate"] = json!(stats.success_rate());
            println!("{}", serde_json::to_string_pretty(&payload)?);
            return Ok(());
        }
        print_stats(&stats);
        Ok(())
    }

    /// Remove old generations, asking for confirmation on `input` unless `--yes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried or modified, or the
    /// confirmation cannot be read.
    pub fn history_cleanup(
        &self,
        cmd: &HistoryCleanupCommand,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<()> {
        let age = cmd.older_than.unwrap_or(self.loaded.config.retention.keep);
        let cutoff = util::unix_timestamp()
            .saturating_sub(i64::try_from(age.as_secs()).unwrap_or(i64::MAX));
        let blobs = LocalBlobStore::new(&self.loaded.config.storage);

        let preview = self.store.cleanup(cutoff, true, &blobs)?;
        if cmd.dry_run || preview.count() == 0 {
            return write_cleanup_report(output, &preview, age, self.cli.json);
        }

        if !cmd.yes {
            write!(
                output,
                "Delete {} generation(s) older than {}? [y/N] ",
                preview.count(),
                humantime::format_duration(age)
            )?;
            output.flush()?;
            let mut answer = String::new();
            input.read_line(&mut answer)?;
            if !matches!(answer.trim(), "y" | "Y" | "yes" | "YES") {
                writeln!(output, "Cleanup cancelled.")?;
                return Ok(());
            }
        }

        let report = self.store.cleanup(cutoff, false, &blobs)?;
        write_cleanup_report(output, &report, age, self.cli.json)
    }

    /// Dispatch a `session` subcommand.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen subcommand fails; lineage violations surface
    /// as [`StoreError`] values in the chain.
    pub fn session(&self, cmd: &SessionCommand) -> Result<()> {
        let machine = SessionMachine::new(&self.store);
        match cmd {
            SessionCommand::Create(create) => {
                let session = machine.create_session(&create.name, create.trigger.as_deref())?;
                println!("Created session '{}' (#{})", session.name, session.id);
                Ok(())
            }
            SessionCommand::Start(start) => self.session_start(start),
            SessionCommand::Append(append) => self.session_append(append),
            SessionCommand::List(list) => self.session_list(list),
            SessionCommand::Show(show) => self.session_show(show),
            SessionCommand::Edit(edit) => self.session_edit(edit),
            SessionCommand::Rewind(rewind) => {
                let session = machine.rewind(&rewind.session, rewind.step)?;
                println!(
                    "Session '{}' now at step {}",
                    session.name,
                    session.current_step.unwrap_or(rewind.step)
                );
                Ok(())
            }
            SessionCommand::Delete(delete) => {
                let session = machine.delete_session(&delete.session)?;
                println!(
                    "Deleted session '{}'; its generations remain in the history.",
                    session.name
                );
                Ok(())
            }
            SessionCommand::Open(open) => {
                let (_, _, path) = machine.current_image(&open.session)?;
                open_image(&self.viewer(), &path)
            }
        }
    }

    fn session_start(&self, cmd: &SessionStartCommand) -> Result<()> {
        let machine = SessionMachine::new(&self.store);
        if let Ok(existing) = machine.session(&SessionRef::Name(cmd.name.clone()))
            && existing.state() != SessionState::Deleted
        {
            return Err(StoreError::DuplicateName(existing.name).into());
        }
        let backend = self.backend()?;
        let (model, params) = self.model_and_params(&cmd.model)?;
        if let Some(trigger) = &cmd.trigger {
            trigger_tip(trigger, &cmd.prompt);
        }

        let blobs = LocalBlobStore::new(&self.loaded.config.storage);
        let recorder = Recorder::new(&self.store, backend, &blobs)
            .with_timeout(self.loaded.config.backend.timeout);
        let generation = recorder.generate(
            &NewGeneration::new(OperationKind::Generate, cmd.prompt.as_str(), model)
                .with_params(params),
        )?;
        self.report_generation(&generation)?;
        ensure_succeeded(&generation)?;

        let (session, step) =
            machine.begin_session(&cmd.name, cmd.trigger.as_deref(), generation.id)?;
        info!(session = session.id, step = step.id, "session started");
        println!("Started session '{}' (#{}) at step {}", session.name, session.id, step.id);
        Ok(())
    }

    fn session_append(&self, cmd: &SessionAppendCommand) -> Result<()> {
        let edit = cmd.prompt.as_deref().map(EditDescription::new);
        let step = SessionMachine::new(&self.store).append_step(
            &cmd.session,
            cmd.generation,
            edit.as_ref(),
        )?;
        println!(
            "Appended generation {} to session {} as step {}",
            cmd.generation, cmd.session, step.id
        );
        Ok(())
    }

    fn session_list(&self, cmd: &SessionListCommand) -> Result<()> {
        let sessions = SessionMachine::new(&self.store).list_sessions(cmd.all)?;
        if self.json(cmd.json) {
            let payload: Vec<_> = sessions.iter().map(session_summary_to_json).collect();
            println!("{}", serde_json::to_string_pretty(&payload)?);
            return Ok(());
        }
        if sessions.is_empty() {
            println!("No sessions found.");
            return Ok(());
        }
        print_sessions_table(&sessions);
        Ok(())
    }

    fn session_show(&self, cmd: &SessionShowCommand) -> Result<()> {
        let machine = SessionMachine::new(&self.store);
        let session = machine.session(&cmd.session)?;
        let chain = machine.active_chain(&cmd.session)?;
        let detached = machine.detached_steps(&cmd.session)?;
        let chain = self.with_prompts(chain)?;
        let detached = self.with_prompts(detached)?;

        if self.json(cmd.json) {
            let payload = json!({
                "session": session_to_json(&session),
                "chain": chain.iter().map(|(step, prompt)| step_to_json(step, prompt)).collect::<Vec<_>>(),
                "detached": detached.iter().map(|(step, prompt)| step_to_json(step, prompt)).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            return Ok(());
        }

        print_session_details(&session, &chain, &detached);
        Ok(())
    }

    fn with_prompts(&self, steps: Vec<Step>) -> Result<Vec<(Step, String)>> {
        steps
            .into_iter()
            .map(|step| -> Result<(Step, String)> {
                let prompt = self.store.generation(step.generation_id)?.prompt;
                Ok((step, prompt))
            })
            .collect()
    }

    fn session_edit(&self, cmd: &SessionEditCommand) -> Result<()> {
        let backend = self.backend()?;
        let (model, params) = self.model_and_params(&cmd.model)?;
        let session = SessionMachine::new(&self.store).session(&cmd.session)?;
        if let Some(trigger) = &session.trigger_word {
            trigger_tip(trigger, &cmd.prompt);
        }

        let edit = EditDescription {
            prompt: cmd.prompt.clone(),
            mask: cmd.mask.clone(),
            strength: cmd.strength,
        };
        let blobs = LocalBlobStore::new(&self.loaded.config.storage);
        let recorder = Recorder::new(&self.store, backend, &blobs)
            .with_timeout(self.loaded.config.backend.timeout);
        let result = recorder.edit_session(&cmd.session, &edit, &model, params)?;
        self.report_generation(&result.generation)?;
        ensure_succeeded(&result.generation)?;
        if let Some(step) = result.step {
            println!(
                "Session '{}' advanced to step {} (depth {})",
                session.name, step.id, step.depth
            );
        }
        Ok(())
    }

    fn report_generation(&self, generation: &Generation) -> Result<()> {
        if self.cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&generation_to_json(generation))?
            );
            return Ok(());
        }
        if generation.succeeded() {
            println!(
                "Generation {} succeeded with {} image(s)",
                generation.id,
                generation.artifacts.len()
            );
            for artifact in &generation.artifacts {
                println!("  saved {}", artifact.path.display());
            }
        }
        Ok(())
    }

    /// Dispatch a `config` subcommand.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration output cannot be rendered or lint finds errors.
    pub fn config(&self, cmd: &ConfigCommand) -> Result<()> {
        match cmd {
            ConfigCommand::Dump => self.config_dump(),
            ConfigCommand::Where => {
                self.config_where();
                Ok(())
            }
            ConfigCommand::Schema => {
                let schema = crate::config::model::schema();
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
            ConfigCommand::Lint => self.config_lint(),
        }
    }

    /// Run environment diagnostics.
    ///
    /// # Errors
    ///
    /// Returns an error if the history store cannot be queried.
    pub fn doctor(&self) -> Result<()> {
        run_doctor(&self.loaded, &self.store)
    }

    /// Launch the interactive history browser.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be driven.
    pub fn run_ui(&self) -> Result<()> {
        let config = &self.loaded.config;
        let renderer = Arc::new(CommandRenderer::new(&config.preview));
        tui::run(Arc::clone(&self.store), config, renderer, &self.viewer())
    }

    fn config_dump(&self) -> Result<()> {
        let toml_text = toml::to_string_pretty(&self.loaded.merged)?;
        println!("{toml_text}");
        Ok(())
    }

    fn config_where(&self) {
        println!(
            "Configuration directory: {}",
            self.loaded.directories.config_dir.display()
        );
        println!(
            "Data directory: {}",
            self.loaded.directories.data_dir.display()
        );
        println!(
            "History database: {}",
            self.loaded.config.storage.database.display()
        );
        println!(
            "Images directory: {}",
            self.loaded.config.storage.images_dir.display()
        );
        println!("Sources (in load order):");
        for source in &self.loaded.sources {
            println!("  - {} ({})", source.path.display(), source.kind.as_str());
        }
        for var in &self.loaded.env_applied {
            println!("  - ${var} (environment)");
        }
    }

    fn config_lint(&self) -> Result<()> {
        if self.loaded.diagnostics.is_empty() {
            println!("Configuration looks good.");
            return Ok(());
        }

        let mut has_error = false;
        for diag in &self.loaded.diagnostics {
            match diag.level {
                DiagnosticLevel::Warning => println!("warning: {}", diag.message),
                DiagnosticLevel::Error => {
                    println!("error: {}", diag.message);
                    has_error = true;
                }
            }
        }

        if has_error {
            Err(eyre!("configuration contains errors"))
        } else {
            Ok(())
        }
    }
}

fn ensure_succeeded(generation: &Generation) -> Result<()> {
    if generation.succeeded() {
        return Ok(());
    }
    Err(AppError::GenerationFailed {
        id: generation.id,
        message: generation
            .error_message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string()),
    }
    .into())
}

fn trigger_tip(trigger: &str, prompt: &str) {
    if !prompt.to_lowercase().contains(&trigger.to_lowercase()) {
        println!("Tip: include '{trigger}' in your prompt for best results");
    }
}

fn open_image(viewer: &dyn Viewer, path: &Path) -> Result<()> {
    viewer
        .open(path)
        .wrap_err_with(|| format!("failed to open {}", path.display()))?;
    println!("Opened {}", path.display());
    Ok(())
}

fn write_cleanup_report(
    output: &mut dyn Write,
    report: &CleanupReport,
    age: Duration,
    json: bool,
) -> Result<()> {
    if json {
        let payload = json!({
            "dry_run": report.dry_run,
            "older_than": humantime::format_duration(age).to_string(),
            "generations": report.candidates.iter().map(|candidate| json!({
                "id": candidate.id,
                "created_at": candidate.created_at,
                "paths": candidate.paths,
            })).collect::<Vec<_>>(),
            "files_removed": report.files_removed,
            "file_errors": report.file_errors.iter().map(|(path, error)| json!({
                "path": path,
                "error": error,
            })).collect::<Vec<_>>(),
        });
        writeln!(output, "{}", serde_json::to_string_pretty(&payload)?)?;
        return Ok(());
    }

    let age = humantime::format_duration(age);
    if report.count() == 0 {
        writeln!(output, "No generations older than {age}.")?;
        return Ok(());
    }
    if report.dry_run {
        writeln!(
            output,
            "Would delete {} generation(s) older than {age}:",
            report.count()
        )?;
        for candidate in &report.candidates {
            writeln!(
                output,
                "  #{} {} ({} image(s))",
                candidate.id,
                util::format_timestamp(Some(candidate.created_at)),
                candidate.paths.len()
            )?;
        }
        return Ok(());
    }
    writeln!(
        output,
        "Deleted {} generation(s) and {} image file(s).",
        report.count(),
        report.files_removed
    )?;
    for (path, error) in &report.file_errors {
        writeln!(output, "  could not remove {}: {error}", path.display())?;
    }
    Ok(())
}

fn generation_to_json(generation: &Generation) -> serde_json::Value {
    json!({
        "id": generation.id,
        "kind": generation.kind.as_str(),
        "prompt": generation.prompt,
        "model": generation.model,
        "params": generation.params,
        "status": generation.status.as_str(),
        "error": generation.error_message,
        "elapsed_secs": generation.elapsed.map(|elapsed| elapsed.as_secs_f64()),
        "images": generation.artifacts,
        "created_at": generation.created_at,
        "finalized_at": generation.finalized_at,
    })
}

fn session_to_json(session: &Session) -> serde_json::Value {
    json!({
        "id": session.id,
        "name": session.name,
        "trigger_word": session.trigger_word,
        "state": session.state().as_str(),
        "current_step": session.current_step,
        "created_at": session.created_at,
        "updated_at": session.updated_at,
        "deleted_at": session.deleted_at,
    })
}

fn session_summary_to_json(summary: &SessionSummary) -> serde_json::Value {
    let mut value = session_to_json(&summary.session);
    value["steps"] = json!(summary.step_count);
    value["base_prompt"] = json!(summary.base_prompt);
    value["current_prompt"] = json!(summary.current_prompt);
    value["current_image"] = json!(summary.current_path);
    value
}

fn step_to_json(step: &Step, prompt: &str) -> serde_json::Value {
    json!({
        "id": step.id,
        "sequence": step.sequence,
        "depth": step.depth,
        "parent_id": step.parent_id,
        "generation_id": step.generation_id,
        "prompt": prompt,
        "edit": step.edit,
        "created_at": step.created_at,
    })
}

fn print_generations_table(generations: &[Generation]) {
    println!(
        "{:<6} {:<9} {:<8} {:<16} {:<19} {:<6} Prompt",
        "ID", "Status", "Kind", "Model", "Created", "Images"
    );
    println!("{}", "-".repeat(110));
    for generation in generations {
        println!(
            "{:<6} {:<9} {:<8} {:<16} {:<19} {:<6} {}",
            generation.id,
            generation.status.as_str(),
            generation.kind.as_str(),
            util::truncate(&generation.model, 16),
            util::format_timestamp(Some(generation.created_at)),
            generation.artifacts.len(),
            util::truncate(&generation.prompt, 40),
        );
    }
}

fn print_generation_details(generation: &Generation) {
    println!("Generation {}", generation.id);
    println!("{}", "-".repeat(48));
    println!("Kind:      {}", generation.kind);
    println!("Status:    {}", generation.status.as_str());
    println!("Model:     {}", generation.model);
    println!("Prompt:    {}", generation.prompt);
    if !generation.params.is_empty() {
        println!("Params:    {}", generation.params.summary());
    }
    println!(
        "Created:   {}",
        util::format_timestamp(Some(generation.created_at))
    );
    println!("Finalized: {}", util::format_timestamp(generation.finalized_at));
    if let Some(elapsed) = generation.elapsed {
        println!("Time:      {:.1}s", elapsed.as_secs_f64());
    }
    if let Some(error) = &generation.error_message {
        println!("Error:     {error}");
    }
    if generation.artifacts.is_empty() {
        return;
    }
    println!("Images:");
    for (index, artifact) in generation.artifacts.iter().enumerate() {
        let marker = if artifact.path.exists() { "✔" } else { "✘ missing" };
        println!("  {}. {} {marker}", index + 1, artifact.path.display());
    }
}

fn print_stats(stats: &HistoryStats) {
    println!("Total generations: {}", stats.total);
    println!("Succeeded:         {}", stats.succeeded);
    println!("Failed:            {}", stats.failed);
    if stats.pending > 0 {
        println!("In flight:         {}", stats.pending);
    }
    println!("Success rate:      {:.1}%", stats.success_rate());
    if stats.models.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<24} {:>6} {:>9} {:>6} {:>9}",
        "Model", "Count", "Succeeded", "Failed", "Avg time"
    );
    println!("{}", "-".repeat(58));
    for (model, entry) in &stats.models {
        let avg = entry
            .avg_elapsed_secs
            .map_or_else(|| "-".to_string(), |secs| format!("{secs:.1}s"));
        println!(
            "{:<24} {:>6} {:>9} {:>6} {:>9}",
            util::truncate(model, 24),
            entry.count,
            entry.succeeded,
            entry.failed,
            avg
        );
    }
}

fn print_sessions_table(sessions: &[SessionSummary]) {
    println!(
        "{:<5} {:<20} {:<8} {:<5} {:<19} Current prompt",
        "ID", "Name", "State", "Steps", "Updated"
    );
    println!("{}", "-".repeat(100));
    for summary in sessions {
        let session = &summary.session;
        println!(
            "{:<5} {:<20} {:<8} {:<5} {:<19} {}",
            session.id,
            util::truncate(&session.name, 20),
            session.state().as_str(),
            summary.step_count,
            util::format_timestamp(Some(session.updated_at)),
            util::truncate(summary.current_prompt.as_deref().unwrap_or("-"), 40),
        );
    }
}

fn print_session_details(session: &Session, chain: &[(Step, String)], detached: &[(Step, String)]) {
    println!("Session '{}' (#{})", session.name, session.id);
    println!("State:   {}", session.state().as_str());
    if let Some(trigger) = &session.trigger_word {
        println!("Trigger: {trigger}");
    }
    println!(
        "Updated: {}",
        util::format_timestamp(Some(session.updated_at))
    );
    if chain.is_empty() {
        println!("No steps yet.");
    } else {
        println!("Active chain (base first):");
        for (step, prompt) in chain {
            let marker = if session.current_step == Some(step.id) {
                "*"
            } else {
                " "
            };
            println!(
                "{marker} step {:<5} depth {:<3} gen {:<6} {}",
                step.id,
                step.depth,
                step.generation_id,
                util::truncate(prompt, 60)
            );
        }
    }
    if !detached.is_empty() {
        println!("Detached steps (kept after rewind):");
        for (step, prompt) in detached {
            println!(
                "  step {:<5} depth {:<3} gen {:<6} {}",
                step.id,
                step.depth,
                step.generation_id,
                util::truncate(prompt, 60)
            );
        }
    }
}

fn run_doctor(loaded: &LoadedConfig, store: &HistoryStore) -> Result<()> {
    println!("nh doctor");
    println!("=========");

    let config = &loaded.config;
    match config.backend.command.first() {
        Some(program) => match which(program) {
            Ok(path) => println!("✔ backend command found at {}", path.display()),
            Err(_) => println!("✘ backend command '{program}' not found on PATH"),
        },
        None => println!("✘ no backend command configured"),
    }
    match config.preview.command.first() {
        Some(program) => match which(program) {
            Ok(path) => println!("✔ preview renderer found at {}", path.display()),
            Err(_) => println!("✘ preview renderer '{program}' not found on PATH"),
        },
        None => println!("✘ no preview renderer configured"),
    }
    let viewer = config
        .viewer
        .command
        .first()
        .map(String::as_str)
        .into_iter()
        .chain(["open", "xdg-open"])
        .find(|program| which(program).is_ok());
    match viewer {
        Some(program) => println!("✔ image viewer '{program}' available"),
        None => println!("✘ no image viewer found"),
    }

    let images = &config.storage.images_dir;
    if images.is_dir() {
        println!("✔ images directory {}", images.display());
    } else {
        println!("  images directory {} will be created on first save", images.display());
    }

    println!("\nDatabase: {}", store.path().display());
    println!("Recorded generations: {}", store.count_generations()?);

    for diag in &loaded.diagnostics {
        let prefix = match diag.level {
            DiagnosticLevel::Warning => "warning",
            DiagnosticLevel::Error => "error",
        };
        println!("{prefix}: {}", diag.message);
    }
    Ok(())
}
