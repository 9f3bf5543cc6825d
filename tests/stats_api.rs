use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use color_eyre::Result;
use nano_history::db::HistoryStore;
use nano_history::model::{Artifact, GenerationOutcome, NewGeneration, OperationKind};
use serde_json::Value;

fn finish(store: &HistoryStore, id: i64, ok: bool) -> Result<()> {
    let outcome = if ok {
        GenerationOutcome::Succeeded {
            artifacts: vec![Artifact {
                path: format!("/images/generate_{id}_1.jpg").into(),
                url: None,
            }],
            elapsed: Duration::from_millis(1200),
        }
    } else {
        GenerationOutcome::Failed {
            message: "timeout".into(),
            elapsed: None,
        }
    };
    store.finalize_generation(id, &outcome)?;
    Ok(())
}

#[test]
fn stats_never_observe_half_finalized_rows() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.child("history.sqlite3").path().to_path_buf();
    let store = Arc::new(HistoryStore::open_path(&path)?);

    let writers: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || -> Result<()> {
                for i in 0..25 {
                    let generation = store.record_generation(&NewGeneration::new(
                        OperationKind::Generate,
                        format!("worker {worker} prompt {i}"),
                        if worker % 2 == 0 { "flux-dev" } else { "flux-pro" },
                    ))?;
                    finish(&store, generation.id, i % 3 != 0)?;
                }
                Ok(())
            })
        })
        .collect();

    // A second handle on the same file reads while the writers run.
    let reader = HistoryStore::open_path(&path)?;
    for _ in 0..50 {
        let stats = reader.stats()?;
        assert_eq!(stats.succeeded + stats.failed, stats.total);
        let per_model: u64 = stats.models.values().map(|model| model.count).sum();
        assert_eq!(per_model, stats.total);
    }

    for writer in writers {
        writer.join().expect("writer thread")?;
    }

    let stats = store.stats()?;
    assert_eq!(stats.total, 100);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.failed, 36);
    assert_eq!(stats.models["flux-dev"].count, 50);
    Ok(())
}

#[test]
fn in_flight_generations_are_excluded_from_stats() -> Result<()> {
    let temp = TempDir::new()?;
    let store = HistoryStore::open_path(temp.child("history.sqlite3").path())?;

    let done = store.record_generation(&NewGeneration::new(
        OperationKind::Generate,
        "finished",
        "flux-dev",
    ))?;
    finish(&store, done.id, true)?;
    store.record_generation(&NewGeneration::new(
        OperationKind::Edit,
        "still rendering",
        "flux-dev",
    ))?;

    let stats = store.stats()?;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 1);
    assert!((stats.success_rate() - 100.0).abs() < f64::EPSILON);
    assert_eq!(stats.models["flux-dev"].avg_elapsed_secs, Some(1.2));
    Ok(())
}

#[test]
fn stats_command_reports_per_model_rows() -> Result<()> {
    let temp = TempDir::new()?;
    let config_dir = temp.child("config");
    config_dir.create_dir_all()?;
    let data_dir = temp.child("data");
    data_dir.create_dir_all()?;

    let store = HistoryStore::open_path(data_dir.child("history.sqlite3").path())?;
    for (model, ok) in [("flux-dev", true), ("flux-dev", false), ("john-lora", true)] {
        let generation =
            store.record_generation(&NewGeneration::new(OperationKind::Generate, "p", model))?;
        finish(&store, generation.id, ok)?;
    }
    drop(store);

    #[allow(deprecated)]
    let output = Command::cargo_bin("nh-dev")?
        .env("NH_CONFIG_DIR", config_dir.path())
        .env("NH_DATA_DIR", data_dir.path())
        .args(["history", "stats"])
        .output()?;
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout)?;
    assert!(text.contains("Total generations: 3"));
    assert!(text.contains("Success rate:      66.7%"));
    assert!(text.contains("john-lora"));
    assert!(!text.contains("In flight"));

    #[allow(deprecated)]
    let output = Command::cargo_bin("nh-dev")?
        .env("NH_CONFIG_DIR", config_dir.path())
        .env("NH_DATA_DIR", data_dir.path())
        .args(["--json", "history", "stats"])
        .output()?;
    let stats: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(stats["models"]["flux-dev"]["failed"], 1);
    assert_eq!(stats["models"]["john-lora"]["avg_elapsed_secs"], 1.2);
    Ok(())
}
