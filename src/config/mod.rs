use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use directories::ProjectDirs;
use itertools::Itertools;
use toml::Value;
use toml::map::Map;
use tracing::debug;

mod merge;
pub mod model;

pub use model::{Config, ConfigDiagnostic};

const APP_NAME: &str = "nh";

pub const CONFIG_DIR_ENV: &str = "NH_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "NH_DATA_DIR";

/// Environment variables that override single keys after every file is merged.
pub const ENV_BINDINGS: [EnvBinding; 3] = [
    EnvBinding {
        var: "NH_BACKEND",
        section: "backend",
        key: "command",
    },
    EnvBinding {
        var: "NH_MODEL",
        section: "backend",
        key: "model",
    },
    EnvBinding {
        var: "NH_IMAGES_DIR",
        section: "storage",
        key: "images_dir",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvBinding {
    pub var: &'static str,
    pub section: &'static str,
    pub key: &'static str,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub merged: Value,
    pub directories: AppDirectories,
    pub sources: Vec<ConfigSource>,
    /// Names of the environment variables that replaced file values.
    pub env_applied: Vec<&'static str>,
    pub diagnostics: Vec<ConfigDiagnostic>,
}

#[derive(Debug, Clone)]
pub struct AppDirectories {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppDirectories {
    /// Resolve directories from the override, the environment, then platform defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when no home directory can be determined and neither
    /// directory is overridden.
    pub fn resolve(config_override: Option<&Path>) -> Result<Self> {
        let config_dir = config_override
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_DIR_ENV).map(PathBuf::from));
        let data_dir = env::var_os(DATA_DIR_ENV).map(PathBuf::from);
        if let (Some(config_dir), Some(data_dir)) = (&config_dir, &data_dir) {
            return Ok(Self {
                config_dir: config_dir.clone(),
                data_dir: data_dir.clone(),
            });
        }

        let platform = ProjectDirs::from("", "", APP_NAME)
            .ok_or_else(|| eyre!("unable to resolve platform directories for {APP_NAME}"))?;
        Ok(Self {
            config_dir: config_dir.unwrap_or_else(|| platform.config_dir().to_path_buf()),
            data_dir: data_dir.unwrap_or_else(|| platform.data_dir().to_path_buf()),
        })
    }

    /// Create both directories when missing. A config path that names a
    /// single file is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error when a directory cannot be created.
    pub fn ensure_all(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir] {
            if dir.is_file() {
                continue;
            }
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSourceKind {
    Main,
    DropIn,
    Project,
    ProjectDropIn,
}

impl ConfigSourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSourceKind::Main => "main",
            ConfigSourceKind::DropIn => "drop-in",
            ConfigSourceKind::Project => "project",
            ConfigSourceKind::ProjectDropIn => "project drop-in",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub kind: ConfigSourceKind,
    pub path: PathBuf,
}

impl ConfigSource {
    fn read_table(&self) -> Result<Map<String, Value>> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let value: Value = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        match value {
            Value::Table(table) => Ok(table),
            _ => Err(eyre!(
                "{} must contain a TOML table at the top level",
                self.path.display()
            )),
        }
    }
}

/// One file plus its drop-in directory. User layers come before project layers.
struct Layer {
    file: PathBuf,
    file_kind: ConfigSourceKind,
    dropins: PathBuf,
    dropin_kind: ConfigSourceKind,
}

impl Layer {
    fn user(config_dir: &Path) -> Self {
        Self {
            file: config_dir.join("config.toml"),
            file_kind: ConfigSourceKind::Main,
            dropins: config_dir.join("conf.d"),
            dropin_kind: ConfigSourceKind::DropIn,
        }
    }

    fn project(cwd: &Path) -> Self {
        Self {
            file: cwd.join(".nh.toml"),
            file_kind: ConfigSourceKind::Project,
            dropins: cwd.join(".nh.d"),
            dropin_kind: ConfigSourceKind::ProjectDropIn,
        }
    }

    fn sources(&self) -> Result<Vec<ConfigSource>> {
        let mut sources = Vec::new();
        if self.file.is_file() {
            sources.push(ConfigSource {
                kind: self.file_kind,
                path: self.file.clone(),
            });
        }
        if self.dropins.is_dir() {
            sources.extend(toml_files(&self.dropins)?.into_iter().map(|path| ConfigSource {
                kind: self.dropin_kind,
                path,
            }));
        }
        Ok(sources)
    }
}

/// Load and merge configuration files into a [`LoadedConfig`].
///
/// # Errors
///
/// Returns an error if any configuration file cannot be read, parsed, or merged,
/// or if a value fails validation.
pub fn load(dir_override: Option<&Path>) -> Result<LoadedConfig> {
    let directories = AppDirectories::resolve(dir_override)?;
    directories.ensure_all()?;
    let cwd = env::current_dir().context("failed to resolve current directory")?;

    let sources = discover(&directories.config_dir, &cwd)?;
    let mut table = Map::new();
    for source in &sources {
        merge::merge_tables(&mut table, source.read_table()?, Some(&source.path))?;
    }
    let env_applied = apply_env_overrides(&mut table, |var| env::var(var).ok());
    debug!(
        sources = sources.len(),
        env = %env_applied.iter().join(","),
        "configuration merged"
    );

    let merged = Value::Table(table);
    let config = Config::from_value(&merged, &directories.data_dir)?;
    let diagnostics = config.lint();
    Ok(LoadedConfig {
        config,
        merged,
        directories,
        sources,
        env_applied,
        diagnostics,
    })
}

fn discover(config_dir: &Path, cwd: &Path) -> Result<Vec<ConfigSource>> {
    // An explicit path to a single file replaces the user layer.
    let mut sources = if config_dir.is_file() {
        vec![ConfigSource {
            kind: ConfigSourceKind::Main,
            path: config_dir.to_path_buf(),
        }]
    } else {
        Layer::user(config_dir).sources()?
    };
    sources.extend(Layer::project(cwd).sources()?);
    Ok(sources)
}

fn apply_env_overrides(
    table: &mut Map<String, Value>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<&'static str> {
    let mut applied = Vec::new();
    for binding in &ENV_BINDINGS {
        let Some(value) = lookup(binding.var).filter(|value| !value.trim().is_empty()) else {
            continue;
        };
        let section = table
            .entry(binding.section.to_string())
            .or_insert_with(|| Value::Table(Map::new()));
        if !section.is_table() {
            *section = Value::Table(Map::new());
        }
        if let Value::Table(section) = section {
            section.insert(binding.key.to_string(), Value::String(value));
            applied.push(binding.var);
        }
    }
    applied
}

/// `*.toml` files directly inside `dir`, sorted by path.
fn toml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml && path.is_file() {
            files.push(path);
        }
    }
    Ok(files.into_iter().sorted().collect())
}
