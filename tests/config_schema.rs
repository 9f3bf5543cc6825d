use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use color_eyre::Result;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::{contains, is_empty};
use serde_json::Value;

#[allow(deprecated)]
fn nh(temp: &TempDir) -> Result<Command> {
    let mut cmd = Command::cargo_bin("nh")?;
    let config_dir = temp.child("config");
    config_dir.create_dir_all()?;
    let data_dir = temp.child("data");
    data_dir.create_dir_all()?;
    cmd.env("NH_CONFIG_DIR", config_dir.path());
    cmd.env("NH_DATA_DIR", data_dir.path());
    cmd.env("HOME", temp.path());
    Ok(cmd)
}

#[test]
fn config_schema_outputs_json_object() -> Result<()> {
    let temp = TempDir::new()?;
    let assert = nh(&temp)?.args(["config", "schema"]).assert().success().stderr(is_empty());
    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;
    let schema: Value = serde_json::from_str(&stdout)?;

    let root = schema.as_object().expect("root schema to be an object");
    assert!(root.contains_key("$schema"), "schema draft url missing");
    let properties = root
        .get("properties")
        .and_then(Value::as_object)
        .expect("root properties");
    for section in ["storage", "backend", "browser", "preview", "viewer", "retention"] {
        assert!(properties.contains_key(section), "missing [{section}]");
    }
    Ok(())
}

#[test]
fn config_where_lists_directories_and_sources() -> Result<()> {
    let temp = TempDir::new()?;
    temp.child("config")
        .child("config.toml")
        .write_str("[browser]\ndebounce_ms = 40\n")?;
    nh(&temp)?
        .args(["config", "where"])
        .assert()
        .success()
        .stdout(
            contains("Configuration directory:")
                .and(contains("history.sqlite3"))
                .and(contains("config.toml (main)")),
        );
    Ok(())
}

#[test]
fn config_dump_shows_merged_values() -> Result<()> {
    let temp = TempDir::new()?;
    temp.child("config")
        .child("config.toml")
        .write_str("[backend]\nmodel = \"flux-dev\"\n")?;
    temp.child("config")
        .child("conf.d")
        .child("10-lora.toml")
        .write_str("[backend]\nmodel = \"john-lora\"\n")?;
    nh(&temp)?
        .args(["config", "dump"])
        .assert()
        .success()
        .stdout(contains("model = \"john-lora\"").and(contains("flux-dev").not()));
    Ok(())
}

#[test]
fn config_lint_fails_on_missing_programs() -> Result<()> {
    let temp = TempDir::new()?;
    temp.child("config")
        .child("config.toml")
        .write_str("[backend]\ncommand = \"definitely-not-a-real-backend-xyz --json\"\n")?;
    nh(&temp)?
        .args(["config", "lint"])
        .assert()
        .failure()
        .stdout(contains("error: backend command 'definitely-not-a-real-backend-xyz'"))
        .stderr(contains("nh: configuration contains errors"));
    Ok(())
}
