use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::str::contains;

/// Exercises the error-chain printing when parsing config fails.
#[test]
fn config_parse_error_prints_error_chain() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let config_dir = temp.child("bad-config");
    config_dir.create_dir_all()?;
    config_dir.child("config.toml").write_str("backend =")?;
    let data_dir = temp.child("data-root");
    data_dir.create_dir_all()?;

    #[allow(deprecated)]
    Command::cargo_bin("nh-dev")?
        .env("NH_CONFIG_DIR", config_dir.path())
        .env("NH_DATA_DIR", data_dir.path())
        .args(["config", "lint"])
        .assert()
        .code(1)
        .stderr(contains("nh: failed to parse"))
        .stderr(contains("caused by:"));

    Ok(())
}

/// A database written by a newer release is refused rather than modified.
#[test]
fn newer_database_schema_exits_with_storage_code() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let config_dir = temp.child("config");
    config_dir.create_dir_all()?;
    let data_dir = temp.child("data");
    data_dir.create_dir_all()?;
    let conn = rusqlite::Connection::open(data_dir.child("history.sqlite3").path())?;
    conn.execute_batch("PRAGMA user_version = 42;")?;
    drop(conn);

    #[allow(deprecated)]
    Command::cargo_bin("nh-dev")?
        .env("NH_CONFIG_DIR", config_dir.path())
        .env("NH_DATA_DIR", data_dir.path())
        .args(["history", "list"])
        .assert()
        .code(5)
        .stderr(contains("failed to open history"))
        .stderr(contains("42"));

    Ok(())
}

#[test]
fn unknown_generation_exits_with_not_found_code() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let config_dir = temp.child("config");
    config_dir.create_dir_all()?;

    #[allow(deprecated)]
    Command::cargo_bin("nh-dev")?
        .env("NH_CONFIG_DIR", config_dir.path())
        .env("NH_DATA_DIR", temp.child("data").path())
        .args(["history", "show", "404"])
        .assert()
        .code(3)
        .stderr(contains("nh: generation 404 not found"));

    Ok(())
}
