use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use schemars::{JsonSchema, Schema};
use serde::Deserialize;
use shellexpand::full;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::Value;

const DEFAULT_DATABASE: &str = "history.sqlite3";
const DEFAULT_IMAGES_DIR: &str = "images";
const DEFAULT_DOWNLOAD_TIMEOUT: &str = "60s";
const DEFAULT_MODEL: &str = "flux-dev";
const DEFAULT_DEBOUNCE_MS: u64 = 60;
const DEFAULT_CANDIDATE_LIMIT: usize = 5_000;
const DEFAULT_PREVIEW_WIDTH: u16 = 60;
const DEFAULT_PREVIEW_HEIGHT: u16 = 30;
const DEFAULT_STATUS_SECONDS: u64 = 3;
const DEFAULT_RENDERER: &str = "chafa --colors=full --format=symbols";
const DEFAULT_RETENTION: &str = "30d";

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub backend: BackendConfig,
    pub browser: BrowserConfig,
    pub preview: PreviewConfig,
    pub viewer: ViewerConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub images_dir: PathBuf,
    pub download_timeout: Duration,
}

impl StorageConfig {
    /// Default layout under a data directory.
    #[must_use]
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            database: data_dir.join(DEFAULT_DATABASE),
            images_dir: data_dir.join(DEFAULT_IMAGES_DIR),
            download_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Program and arguments; empty when no backend is configured.
    pub command: Vec<String>,
    pub model: String,
    /// Give up on a backend call after this long; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserConfig {
    pub debounce: Duration,
    /// Most recent records loaded into the browser per view.
    pub candidate_limit: usize,
    pub preview_width: u16,
    pub preview_height: u16,
    pub status_duration: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            preview_width: DEFAULT_PREVIEW_WIDTH,
            preview_height: DEFAULT_PREVIEW_HEIGHT,
            status_duration: Duration::from_secs(DEFAULT_STATUS_SECONDS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerConfig {
    /// Explicit viewer; empty means `open`/`xdg-open` from `PATH`.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Default age threshold for `history cleanup`.
    pub keep: Duration,
}

#[derive(Debug, Clone)]
pub struct ConfigDiagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

impl Config {
    /// Parse a merged configuration [`Value`], resolving relative defaults
    /// against `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when a value has the wrong type, a duration or
    /// command line cannot be parsed, or a path cannot be expanded.
    pub fn from_value(value: &Value, data_dir: &Path) -> Result<Self> {
        let raw: RawConfig = value
            .clone()
            .try_into()
            .map_err(|err: toml::de::Error| eyre!("failed to decode configuration: {err}"))?;
        raw.into_config(data_dir)
    }

    #[must_use]
    pub fn lint(&self) -> Vec<ConfigDiagnostic> {
        let mut diags = Vec::new();
        if self.backend.command.is_empty() {
            diags.push(ConfigDiagnostic {
                level: DiagnosticLevel::Warning,
                message: "no [backend] command configured; `nh generate` and `nh session edit` are unavailable".to_string(),
            });
        } else if let Some(program) = self.backend.command.first()
            && which::which(program).is_err()
        {
            diags.push(ConfigDiagnostic {
                level: DiagnosticLevel::Error,
                message: format!("backend command '{program}' not found on PATH"),
            });
        }

        match self.preview.command.first() {
            None => diags.push(ConfigDiagnostic {
                level: DiagnosticLevel::Warning,
                message: "no [preview] command configured; the browser shows text placeholders"
                    .to_string(),
            }),
            Some(program) if which::which(program).is_err() => {
                diags.push(ConfigDiagnostic {
                    level: DiagnosticLevel::Warning,
                    message: format!(
                        "preview renderer '{program}' not found on PATH; the browser shows text placeholders"
                    ),
                });
            }
            Some(_) => {}
        }

        if let Some(program) = self.viewer.command.first()
            && which::which(program).is_err()
        {
            diags.push(ConfigDiagnostic {
                level: DiagnosticLevel::Error,
                message: format!("viewer command '{program}' not found on PATH"),
            });
        }

        if self.browser.debounce > Duration::from_secs(1) {
            diags.push(ConfigDiagnostic {
                level: DiagnosticLevel::Warning,
                message: format!(
                    "browser.debounce_ms = {} makes typing feel sluggish",
                    self.browser.debounce.as_millis()
                ),
            });
        }
        diags
    }
}

/// JSON schema for `config.toml`.
#[must_use]
pub fn schema() -> Schema {
    schemars::schema_for!(RawConfig)
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub(crate) struct RawConfig {
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    backend: RawBackend,
    #[serde(default)]
    browser: RawBrowser,
    #[serde(default)]
    preview: RawPreview,
    #[serde(default)]
    viewer: RawViewer,
    #[serde(default)]
    retention: RawRetention,
}

impl RawConfig {
    fn into_config(self, data_dir: &Path) -> Result<Config> {
        Ok(Config {
            storage: self.storage.into_storage(data_dir)?,
            backend: self.backend.into_backend()?,
            browser: self.browser.into_browser()?,
            preview: PreviewConfig {
                command: parse_command_args(
                    self.preview.command.as_deref().unwrap_or(DEFAULT_RENDERER),
                )
                .wrap_err("invalid [preview] command")?,
            },
            viewer: ViewerConfig {
                command: parse_command_args(self.viewer.command.as_deref().unwrap_or(""))
                    .wrap_err("invalid [viewer] command")?,
            },
            retention: RetentionConfig {
                keep: parse_duration(
                    self.retention.keep.as_deref().unwrap_or(DEFAULT_RETENTION),
                    "retention.keep",
                )?,
            },
        })
    }
}

/// Where history and images are kept.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub(crate) struct RawStorage {
    /// Path to the `SQLite` history database.
    database: Option<String>,
    /// Directory for downloaded images.
    images_dir: Option<String>,
    /// Download timeout, e.g. "60s".
    download_timeout: Option<String>,
}

impl RawStorage {
    fn into_storage(self, data_dir: &Path) -> Result<StorageConfig> {
        let database = match self.database {
            Some(raw) => expand_path(&raw)?,
            None => data_dir.join(DEFAULT_DATABASE),
        };
        let images_dir = match self.images_dir {
            Some(raw) => expand_path(&raw)?,
            None => data_dir.join(DEFAULT_IMAGES_DIR),
        };
        let download_timeout = parse_duration(
            self.download_timeout
                .as_deref()
                .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT),
            "storage.download_timeout",
        )?;
        Ok(StorageConfig {
            database,
            images_dir,
            download_timeout,
        })
    }
}

/// External program that talks to the image model.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub(crate) struct RawBackend {
    /// Command line; receives the request as JSON on stdin.
    command: Option<String>,
    /// Model used when `--model` is not given.
    model: Option<String>,
    /// Abandon a request after this long, e.g. "5m". Unset waits indefinitely.
    timeout: Option<String>,
}

impl RawBackend {
    fn into_backend(self) -> Result<BackendConfig> {
        let command = match self.command.as_deref() {
            Some(raw) => parse_command_args(raw).wrap_err("invalid [backend] command")?,
            None => Vec::new(),
        };
        let model = self
            .model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let timeout = self
            .timeout
            .as_deref()
            .map(|raw| parse_duration(raw, "backend.timeout"))
            .transpose()?;
        Ok(BackendConfig {
            command,
            model,
            timeout,
        })
    }
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub(crate) struct RawBrowser {
    /// Quiet period after a keystroke before filtering.
    debounce_ms: Option<u64>,
    candidate_limit: Option<usize>,
    preview_width: Option<u16>,
    preview_height: Option<u16>,
    /// How long transient status messages stay visible.
    status_seconds: Option<u64>,
}

impl RawBrowser {
    fn into_browser(self) -> Result<BrowserConfig> {
        let defaults = BrowserConfig::default();
        let candidate_limit = self.candidate_limit.unwrap_or(defaults.candidate_limit);
        if candidate_limit == 0 {
            return Err(eyre!("browser.candidate_limit must be greater than zero"));
        }
        Ok(BrowserConfig {
            debounce: self
                .debounce_ms
                .map_or(defaults.debounce, Duration::from_millis),
            candidate_limit,
            preview_width: self.preview_width.unwrap_or(defaults.preview_width).max(8),
            preview_height: self.preview_height.unwrap_or(defaults.preview_height).max(4),
            status_duration: self
                .status_seconds
                .map_or(defaults.status_duration, Duration::from_secs),
        })
    }
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub(crate) struct RawPreview {
    /// Thumbnail renderer; `--size WxH <path>` is appended.
    command: Option<String>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub(crate) struct RawViewer {
    /// Image viewer; the image path is appended.
    command: Option<String>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub(crate) struct RawRetention {
    /// Default age for `history cleanup`, e.g. "30d".
    keep: Option<String>,
}

fn parse_command_args(raw: &str) -> Result<Vec<String>> {
    shlex::split(raw).ok_or_else(|| eyre!("failed to parse command line '{raw}'"))
}

fn parse_duration(raw: &str, key: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim()).map_err(|err| eyre!("invalid {key} '{raw}': {err}"))
}

fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = full(raw)
        .with_context(|| format!("failed to expand path '{raw}': environment variable missing"))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config> {
        let value: Value = toml::from_str(text).expect("parse toml");
        Config::from_value(&value, Path::new("/data"))
    }

    #[test]
    fn empty_config_uses_defaults() -> Result<()> {
        let config = parse("")?;
        assert_eq!(config.storage, StorageConfig::in_dir(Path::new("/data")));
        assert_eq!(config.backend.model, DEFAULT_MODEL);
        assert!(config.backend.command.is_empty());
        assert_eq!(config.backend.timeout, None);
        assert_eq!(config.browser, BrowserConfig::default());
        assert_eq!(
            config.preview.command,
            vec!["chafa", "--colors=full", "--format=symbols"]
        );
        assert!(config.viewer.command.is_empty());
        assert_eq!(config.retention.keep, Duration::from_secs(30 * 86_400));
        Ok(())
    }

    #[test]
    fn sections_override_defaults() -> Result<()> {
        let config = parse(
            r#"
            [storage]
            database = "/srv/nh/db.sqlite3"
            download_timeout = "5s"

            [backend]
            command = "fal-run --queue 'fast lane'"
            model = "flux-pro"
            timeout = "90s"

            [browser]
            debounce_ms = 15
            preview_width = 2

            [retention]
            keep = "12h"
        "#,
        )?;
        assert_eq!(config.storage.database, PathBuf::from("/srv/nh/db.sqlite3"));
        assert_eq!(config.storage.images_dir, PathBuf::from("/data/images"));
        assert_eq!(config.storage.download_timeout, Duration::from_secs(5));
        assert_eq!(config.backend.command, vec!["fal-run", "--queue", "fast lane"]);
        assert_eq!(config.backend.model, "flux-pro");
        assert_eq!(config.backend.timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.browser.debounce, Duration::from_millis(15));
        assert_eq!(config.browser.preview_width, 8);
        assert_eq!(config.retention.keep, Duration::from_secs(12 * 3_600));
        Ok(())
    }

    #[test]
    fn rejects_bad_durations_and_commands() {
        let err = parse("[retention]\nkeep = \"soon\"\n").expect_err("bad duration");
        assert!(format!("{err:?}").contains("retention.keep"));

        let err = parse("[backend]\ntimeout = \"later\"\n").expect_err("bad timeout");
        assert!(format!("{err:?}").contains("backend.timeout"));

        let err = parse("[backend]\ncommand = \"unterminated 'quote\"\n").expect_err("bad command");
        assert!(format!("{err:?}").contains("failed to parse command line"));

        let err = parse("[browser]\ncandidate_limit = 0\n").expect_err("zero limit");
        assert!(format!("{err:?}").contains("candidate_limit"));
    }

    #[test]
    fn lint_flags_missing_programs() {
        let mut config = parse("").expect("defaults");
        config.backend.command = vec!["nh-definitely-missing-backend".into()];
        config.viewer.command = vec!["nh-definitely-missing-viewer".into()];
        let diagnostics = config.lint();
        assert!(diagnostics.iter().any(|diag| {
            diag.level == DiagnosticLevel::Error
                && diag.message.contains("nh-definitely-missing-backend")
        }));
        assert!(diagnostics.iter().any(|diag| {
            diag.level == DiagnosticLevel::Error
                && diag.message.contains("nh-definitely-missing-viewer")
        }));
    }

    #[test]
    fn schema_lists_sections() {
        let schema = serde_json::to_value(schema()).expect("serialize schema");
        let properties = schema
            .get("properties")
            .and_then(serde_json::Value::as_object)
            .expect("properties");
        for section in ["storage", "backend", "browser", "preview", "viewer", "retention"] {
            assert!(properties.contains_key(section), "missing {section}");
        }
    }
}
