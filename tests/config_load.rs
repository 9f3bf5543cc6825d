use std::time::Duration;

use assert_fs::TempDir;
use assert_fs::prelude::*;
use color_eyre::Result;
use nano_history::config::{self, ConfigSourceKind, DATA_DIR_ENV};
use nano_history::config::model::DiagnosticLevel;
use nano_history::test_support::{ENV_LOCK, EnvOverride};

#[test]
fn dropins_override_main_config_in_name_order() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    let temp = TempDir::new()?;
    let config_dir = temp.child("config");
    config_dir
        .child("config.toml")
        .write_str("[backend]\ncommand = \"true\"\nmodel = \"flux-dev\"\n\n[retention]\nkeep = \"14d\"\n")?;
    let dropin = config_dir.child("conf.d");
    dropin
        .child("20-model.toml")
        .write_str("[backend]\nmodel = \"john-lora\"\n")?;
    dropin
        .child("10-model.toml")
        .write_str("[backend]\nmodel = \"flux-pro\"\n")?;
    let _data = EnvOverride::set_path(DATA_DIR_ENV, temp.child("data").path());

    let loaded = config::load(Some(config_dir.path()))?;
    assert_eq!(loaded.config.backend.model, "john-lora");
    assert_eq!(loaded.config.backend.command, vec!["true".to_string()]);
    assert_eq!(loaded.config.retention.keep, Duration::from_secs(14 * 86_400));
    let kinds: Vec<_> = loaded.sources.iter().map(|source| source.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ConfigSourceKind::Main,
            ConfigSourceKind::DropIn,
            ConfigSourceKind::DropIn
        ]
    );
    Ok(())
}

#[test]
fn missing_config_falls_back_to_data_dir_defaults() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    let temp = TempDir::new()?;
    let config_dir = temp.child("config");
    let data_dir = temp.child("data");
    let _data = EnvOverride::set_path(DATA_DIR_ENV, data_dir.path());

    let loaded = config::load(Some(config_dir.path()))?;
    assert!(config_dir.path().is_dir());
    assert!(data_dir.path().is_dir());
    assert!(loaded.sources.is_empty());
    assert_eq!(
        loaded.config.storage.database,
        data_dir.path().join("history.sqlite3")
    );
    assert_eq!(loaded.config.storage.images_dir, data_dir.path().join("images"));
    assert_eq!(loaded.config.backend.model, "flux-dev");
    assert!(loaded.config.backend.command.is_empty());
    assert!(
        loaded
            .diagnostics
            .iter()
            .any(|diag| diag.level == DiagnosticLevel::Warning
                && diag.message.contains("no [backend] command"))
    );
    Ok(())
}

#[test]
fn invalid_durations_are_rejected() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    let temp = TempDir::new()?;
    let config_dir = temp.child("config");
    config_dir
        .child("config.toml")
        .write_str("[retention]\nkeep = \"forever\"\n")?;
    let _data = EnvOverride::set_path(DATA_DIR_ENV, temp.child("data").path());

    let err = config::load(Some(config_dir.path())).expect_err("bad duration");
    assert!(format!("{err:#}").contains("retention.keep"));
    Ok(())
}
