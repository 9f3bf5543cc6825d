use std::time::Duration;

use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use color_eyre::Result;
use nano_history::db::HistoryStore;
use nano_history::lineage::SessionMachine;
use nano_history::model::{Artifact, GenerationOutcome, NewGeneration, OperationKind};
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use rusqlite::Connection;

struct Seeded {
    temp: TempDir,
    old_image: std::path::PathBuf,
    session_image: std::path::PathBuf,
}

fn seed() -> Result<Seeded> {
    let temp = TempDir::new()?;
    temp.child("config").create_dir_all()?;
    let data = temp.child("data");
    let images = data.child("images");
    images.create_dir_all()?;
    let db_path = data.child("history.sqlite3");
    let store = HistoryStore::open_path(db_path.path())?;

    let mut paths = Vec::new();
    for prompt in ["old render", "session base", "fresh render"] {
        let generation =
            store.record_generation(&NewGeneration::new(OperationKind::Generate, prompt, "flux-dev"))?;
        let image = images.child(format!("generate_{}_1.jpg", generation.id));
        image.write_binary(b"jpeg")?;
        store.finalize_generation(
            generation.id,
            &GenerationOutcome::Succeeded {
                artifacts: vec![Artifact {
                    path: image.path().to_path_buf(),
                    url: None,
                }],
                elapsed: Duration::from_secs(2),
            },
        )?;
        paths.push(image.path().to_path_buf());
    }
    store.record_generation(&NewGeneration::new(OperationKind::Generate, "hung", "flux-dev"))?;
    SessionMachine::new(&store).begin_session("keeper", None, 2)?;
    drop(store);

    let conn = Connection::open(db_path.path())?;
    conn.execute(
        "UPDATE generations SET created_at = created_at - 90 * 86400 WHERE id IN (1, 2, 4)",
        [],
    )?;

    Ok(Seeded {
        old_image: paths[0].clone(),
        session_image: paths[1].clone(),
        temp,
    })
}

#[allow(deprecated)]
fn nh(seeded: &Seeded) -> Command {
    let mut cmd = Command::cargo_bin("nh-dev").expect("nh-dev binary available");
    cmd.env("NH_CONFIG_DIR", seeded.temp.child("config").path());
    cmd.env("NH_DATA_DIR", seeded.temp.child("data").path());
    cmd
}

#[test]
fn dry_run_lists_only_unreferenced_finalized_rows() -> Result<()> {
    let seeded = seed()?;
    nh(&seeded)
        .args(["history", "cleanup", "--older-than", "30d", "--dry-run"])
        .assert()
        .success()
        .stdout(
            contains("Would delete 1 generation(s) older than 30days")
                .and(contains("#1 "))
                .and(contains("#2 ").not())
                .and(contains("#4 ").not()),
        );
    assert!(seeded.old_image.exists());
    Ok(())
}

#[test]
fn confirmed_cleanup_removes_rows_and_files() -> Result<()> {
    let seeded = seed()?;
    nh(&seeded)
        .args(["history", "cleanup", "--older-than", "30d", "--yes"])
        .assert()
        .success()
        .stdout(contains("Deleted 1 generation(s) and 1 image file(s)."));
    assert!(!seeded.old_image.exists());
    assert!(seeded.session_image.exists());

    nh(&seeded)
        .args(["history", "show", "1"])
        .assert()
        .code(3)
        .stderr(contains("generation 1 not found"));
    Ok(())
}

#[test]
fn unanswered_prompt_cancels_cleanup() -> Result<()> {
    let seeded = seed()?;
    nh(&seeded)
        .args(["history", "cleanup", "--older-than", "30d"])
        .write_stdin("\n")
        .assert()
        .success()
        .stdout(contains("[y/N]").and(contains("Cleanup cancelled.")));
    assert!(seeded.old_image.exists());
    Ok(())
}

#[test]
fn deleting_the_session_frees_its_generations() -> Result<()> {
    let seeded = seed()?;
    nh(&seeded)
        .args(["session", "delete", "keeper"])
        .assert()
        .success();
    nh(&seeded)
        .args(["history", "cleanup", "--older-than", "30d", "--yes"])
        .assert()
        .success()
        .stdout(contains("Deleted 2 generation(s) and 2 image file(s)."));
    assert!(!seeded.session_image.exists());
    Ok(())
}
