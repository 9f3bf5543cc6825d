use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::model::SessionRef;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None, name = "nh", bin_name = "nh")]
pub struct Cli {
    /// Override the configuration directory.
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
    /// Emit machine-readable output when supported.
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    pub json: bool,
    /// Increase log verbosity (use -vv for trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Silence all log output.
    #[arg(short, long, action = ArgAction::SetTrue, global = true)]
    pub quiet: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate images from a prompt and record the attempt.
    Generate(GenerateCommand),
    /// Inspect and maintain the generation history.
    #[command(subcommand)]
    History(HistoryCommand),
    /// Manage iterative editing sessions.
    #[command(subcommand)]
    Session(SessionCommand),
    /// Inspect configuration files.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Run environment diagnostics.
    Doctor,
}

/// Model selection and parameters shared by every command that calls the backend.
#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    /// Model to use (defaults to `backend.model`).
    #[arg(long, short)]
    pub model: Option<String>,
    /// Model parameter as KEY=VALUE (repeatable).
    #[arg(long = "param", short = 'p', value_name = "KEY=VALUE", action = ArgAction::Append)]
    pub params: Vec<String>,
}

#[derive(Debug, Args)]
pub struct GenerateCommand {
    /// Description of the image to generate.
    pub prompt: String,
    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    /// List recent generations, newest first.
    List(HistoryListCommand),
    /// Show every recorded detail of one generation.
    Show(HistoryShowCommand),
    /// Open a generated image in the system viewer.
    Open(HistoryOpenCommand),
    /// Summarise success rates and timings per model.
    Stats,
    /// Delete old generations and their images.
    Cleanup(HistoryCleanupCommand),
    /// Browse history interactively.
    Browse,
}

#[derive(Debug, Args)]
pub struct HistoryListCommand {
    /// Only show generations whose prompt contains this text.
    #[arg(long, short)]
    pub search: Option<String>,
    /// Only show generations for this model.
    #[arg(long, short)]
    pub model: Option<String>,
    /// Number of results to show.
    #[arg(long, short, default_value_t = 20)]
    pub limit: usize,
    /// Skip this many results.
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
    /// Include failed and in-flight generations.
    #[arg(long, action = ArgAction::SetTrue)]
    pub all: bool,
    /// Emit JSON results.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryShowCommand {
    /// Generation id (defaults to the most recent).
    pub id: Option<i64>,
    /// Emit JSON.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryOpenCommand {
    /// Generation id (defaults to the most recent).
    pub id: Option<i64>,
    /// Image index to open (1-based).
    #[arg(long, short, default_value_t = 1)]
    pub index: usize,
}

#[derive(Debug, Args)]
pub struct HistoryCleanupCommand {
    /// Keep generations newer than this (e.g. 30d, 12h); defaults to `retention.keep`.
    #[arg(long, value_parser = parse_age)]
    pub older_than: Option<Duration>,
    /// Show what would be deleted without deleting anything.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
    /// Skip the confirmation prompt.
    #[arg(long, short, action = ArgAction::SetTrue)]
    pub yes: bool,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Create an empty session.
    Create(SessionCreateCommand),
    /// Generate a base image and start a session from it.
    Start(SessionStartCommand),
    /// Attach an existing successful generation as the next step.
    Append(SessionAppendCommand),
    /// List sessions by last activity.
    List(SessionListCommand),
    /// Show a session's active chain and detached steps.
    Show(SessionShowCommand),
    /// Edit the session's current image and advance on success.
    Edit(SessionEditCommand),
    /// Move the session pointer back to an earlier step.
    Rewind(SessionRewindCommand),
    /// Delete a session. Its generations stay in the history.
    Delete(SessionDeleteCommand),
    /// Open the session's current image.
    Open(SessionOpenCommand),
}

#[derive(Debug, Args)]
pub struct SessionCreateCommand {
    /// Unique session name.
    pub name: String,
    /// Trigger word for a fine-tuned model.
    #[arg(long, short)]
    pub trigger: Option<String>,
}

#[derive(Debug, Args)]
pub struct SessionStartCommand {
    /// Unique session name.
    pub name: String,
    /// Prompt for the base image.
    pub prompt: String,
    /// Trigger word for a fine-tuned model.
    #[arg(long, short)]
    pub trigger: Option<String>,
    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Debug, Args)]
pub struct SessionAppendCommand {
    /// Session name, or `#ID`.
    #[arg(value_parser = parse_session_ref)]
    pub session: SessionRef,
    /// Generation to attach.
    pub generation: i64,
    /// Describe the edit that produced the generation.
    #[arg(long)]
    pub prompt: Option<String>,
}

#[derive(Debug, Args)]
pub struct SessionListCommand {
    /// Include deleted sessions.
    #[arg(long, action = ArgAction::SetTrue)]
    pub all: bool,
    /// Emit JSON results.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SessionShowCommand {
    /// Session name, or `#ID`.
    #[arg(value_parser = parse_session_ref)]
    pub session: SessionRef,
    /// Emit JSON.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SessionEditCommand {
    /// Session name, or `#ID`.
    #[arg(value_parser = parse_session_ref)]
    pub session: SessionRef,
    /// Description of the desired change.
    pub prompt: String,
    /// Mask image; white areas are repainted.
    #[arg(long, short = 'k')]
    pub mask: Option<PathBuf>,
    /// Edit strength between 0.0 and 1.0.
    #[arg(long, short, value_parser = parse_strength)]
    pub strength: Option<f64>,
    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Debug, Args)]
pub struct SessionRewindCommand {
    /// Session name, or `#ID`.
    #[arg(value_parser = parse_session_ref)]
    pub session: SessionRef,
    /// Step id to make current.
    pub step: i64,
}

#[derive(Debug, Args)]
pub struct SessionDeleteCommand {
    /// Session name, or `#ID`.
    #[arg(value_parser = parse_session_ref)]
    pub session: SessionRef,
}

#[derive(Debug, Args)]
pub struct SessionOpenCommand {
    /// Session name, or `#ID`.
    #[arg(value_parser = parse_session_ref)]
    pub session: SessionRef,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Dump the merged configuration TOML.
    Dump,
    /// Show configuration search paths.
    Where,
    /// Print the JSON schema for configuration files.
    Schema,
    /// Validate configured programs and settings.
    Lint,
}

fn parse_age(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw).map_err(|err| format!("invalid duration '{raw}': {err}"))
}

fn parse_session_ref(raw: &str) -> Result<SessionRef, String> {
    if raw.trim().is_empty() {
        return Err("session name must not be empty".to_string());
    }
    Ok(SessionRef::parse(raw))
}

fn parse_strength(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("invalid strength '{raw}'"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("strength must be between 0.0 and 1.0, got {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn session_refs_accept_names_and_ids() {
        let cli = Cli::try_parse_from(["nh", "session", "rewind", "#4", "12"]).expect("parse");
        let Some(Command::Session(SessionCommand::Rewind(cmd))) = cli.command else {
            panic!("expected session rewind");
        };
        assert_eq!(cmd.session, SessionRef::Id(4));
        assert_eq!(cmd.step, 12);

        let cli = Cli::try_parse_from(["nh", "session", "show", "john_model"]).expect("parse");
        let Some(Command::Session(SessionCommand::Show(cmd))) = cli.command else {
            panic!("expected session show");
        };
        assert_eq!(cmd.session, SessionRef::Name("john_model".into()));
    }

    #[test]
    fn cleanup_age_uses_humantime() {
        let cli = Cli::try_parse_from(["nh", "history", "cleanup", "--older-than", "7d", "--dry-run"])
            .expect("parse");
        let Some(Command::History(HistoryCommand::Cleanup(cmd))) = cli.command else {
            panic!("expected cleanup");
        };
        assert_eq!(cmd.older_than, Some(Duration::from_secs(7 * 86_400)));
        assert!(cmd.dry_run);
    }

    #[test]
    fn strength_outside_unit_range_is_rejected() {
        let err = Cli::try_parse_from(["nh", "session", "edit", "s", "brighter", "--strength", "1.5"])
            .expect_err("out of range");
        assert!(err.to_string().contains("between 0.0 and 1.0"));
    }
}
