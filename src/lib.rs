pub mod backend;
pub mod config;
pub mod db;
pub mod lineage;
pub mod model;
pub mod preview;
pub mod recorder;
pub mod search;
pub mod storage;

mod app;
pub mod cli;
pub mod test_support;
mod tui;
mod util;

use std::io::{self, Write};

use clap::CommandFactory;
use cli::{Command, HistoryCommand};

pub use app::AppError;
pub use cli::Cli;
pub use db::StoreError;

/// Run the nh CLI entrypoint.
///
/// # Errors
///
/// Returns an error when initialization or the chosen command fails to execute.
pub fn run(cli: &Cli) -> color_eyre::Result<()> {
    init_tracing(cli);

    let app = app::App::bootstrap(cli)?;

    match &cli.command {
        Some(Command::Generate(cmd)) => app.generate(cmd),
        Some(Command::History(cmd)) => app.history(cmd),
        Some(Command::Session(cmd)) => app.session(cmd),
        Some(Command::Config(cmd)) => app.config(cmd),
        Some(Command::Doctor) => app.doctor(),
        None => app.history(&HistoryCommand::Browse),
    }
}

/// Parse process arguments. Colors are disabled on macOS terminals.
#[cfg(target_os = "macos")]
#[must_use]
pub fn parse_cli() -> Cli {
    use clap::{ColorChoice, FromArgMatches};

    let matches = Cli::command().color(ColorChoice::Never).get_matches();
    Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit())
}

#[cfg(not(target_os = "macos"))]
#[must_use]
pub fn parse_cli() -> Cli {
    use clap::Parser;

    Cli::parse()
}

/// Map a failed run to a process exit code.
///
/// `3` when a record does not exist, `4` for lineage rule violations, `5` when
/// the history store is unavailable, `6` when the backend failed a generation,
/// and `1` for everything else.
#[must_use]
pub fn exit_code_for_error(err: &color_eyre::Report) -> i32 {
    for cause in err.chain() {
        if let Some(store) = cause.downcast_ref::<StoreError>() {
            return match store {
                StoreError::NotFound { .. } => 3,
                StoreError::AlreadyFinalized(_)
                | StoreError::InvalidState { .. }
                | StoreError::DuplicateName(_)
                | StoreError::NotAnAncestor { .. } => 4,
                StoreError::StorageUnavailable(_) => 5,
            };
        }
        if let Some(AppError::GenerationFailed { .. }) = cause.downcast_ref::<AppError>() {
            return 6;
        }
    }
    1
}

/// Print an error and its causes, one per line.
///
/// # Errors
///
/// Returns the underlying I/O error when `out` cannot be written.
pub fn write_cli_error<W: Write>(err: &color_eyre::Report, mut out: W) -> io::Result<()> {
    let mut chain = err.chain();
    if let Some(top) = chain.next() {
        writeln!(out, "nh: {top}")?;
    }
    for cause in chain {
        writeln!(out, "  caused by: {cause}")?;
    }
    out.flush()
}

fn init_tracing(cli: &Cli) {
    let level = desired_level(cli);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn desired_level(cli: &Cli) -> tracing::level_filters::LevelFilter {
    if cli.quiet {
        return tracing::level_filters::LevelFilter::ERROR;
    }

    match cli.verbose {
        0 => tracing::level_filters::LevelFilter::WARN,
        1 => tracing::level_filters::LevelFilter::INFO,
        2 => tracing::level_filters::LevelFilter::DEBUG,
        _ => tracing::level_filters::LevelFilter::TRACE,
    }
}

#[must_use]
pub fn command() -> clap::Command {
    Cli::command()
}
