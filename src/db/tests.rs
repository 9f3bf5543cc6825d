use super::*;
use tempfile::TempDir;

use crate::lineage::SessionMachine;
use crate::model::{EditDescription, GenerationParams, OperationKind, ParamValue};
use crate::storage::StorageError;

fn store() -> (TempDir, HistoryStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = HistoryStore::open_path(&dir.path().join("history.db")).expect("open store");
    (dir, store)
}

fn record(store: &HistoryStore, prompt: &str, model: &str) -> Generation {
    store
        .record_generation(&NewGeneration::new(OperationKind::Generate, prompt, model))
        .expect("record")
}

fn succeed(store: &HistoryStore, id: i64, millis: u64) -> Generation {
    store
        .finalize_generation(
            id,
            &GenerationOutcome::Succeeded {
                artifacts: vec![Artifact {
                    path: PathBuf::from(format!("/images/generate_{id}_0.jpg")),
                    url: Some(format!("https://cdn.example/{id}.jpg")),
                }],
                elapsed: Duration::from_millis(millis),
            },
        )
        .expect("finalize success")
}

fn fail(store: &HistoryStore, id: i64, message: &str) -> Generation {
    store
        .finalize_generation(
            id,
            &GenerationOutcome::Failed {
                message: message.to_string(),
                elapsed: None,
            },
        )
        .expect("finalize failure")
}

fn backdate(store: &HistoryStore, id: i64, created_at: i64) {
    store
        .write(|tx| {
            tx.execute(
                "UPDATE generations SET created_at = ?2 WHERE id = ?1",
                params![id, created_at],
            )?;
            Ok(())
        })
        .expect("backdate");
}

#[derive(Default)]
struct RecordingBlobs {
    deleted: Mutex<Vec<PathBuf>>,
}

impl BlobStore for RecordingBlobs {
    fn save(&self, _source: &str, filename: &str) -> Result<PathBuf, StorageError> {
        Ok(PathBuf::from("/images").join(filename))
    }

    fn delete(&self, path: &Path) -> Result<(), StorageError> {
        self.deleted.lock().expect("lock").push(path.to_path_buf());
        Ok(())
    }
}

#[test]
fn provisional_record_is_pending_until_finalized() {
    let (_dir, store) = store();
    let mut params = GenerationParams::new();
    params
        .insert("seed", ParamValue::Number(42.0))
        .expect("seed");
    let pending = store
        .record_generation(
            &NewGeneration::new(OperationKind::Generate, "a lighthouse", "flux-dev")
                .with_params(params.clone()),
        )
        .expect("record");
    assert!(pending.is_pending());

    let fetched = store.generation(pending.id).expect("fetch");
    assert_eq!(fetched.status, GenerationStatus::Pending);
    assert_eq!(fetched.params, params);
    assert!(fetched.artifacts.is_empty());

    let done = succeed(&store, pending.id, 2500);
    assert!(done.succeeded());
    assert_eq!(done.elapsed, Some(Duration::from_millis(2500)));
    assert_eq!(done.artifacts.len(), 1);
    assert!(done.finalized_at.is_some());
}

#[test]
fn finalizing_twice_keeps_the_first_outcome() {
    let (_dir, store) = store();
    let generation = record(&store, "p", "flux-dev");
    fail(&store, generation.id, "quota exceeded");

    let err = store
        .finalize_generation(
            generation.id,
            &GenerationOutcome::Succeeded {
                artifacts: Vec::new(),
                elapsed: Duration::from_secs(1),
            },
        )
        .expect_err("second finalize");
    assert!(matches!(err, StoreError::AlreadyFinalized(id) if id == generation.id));

    let stored = store.generation(generation.id).expect("fetch");
    assert_eq!(stored.status, GenerationStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("quota exceeded"));
}

#[test]
fn unknown_generation_is_not_found() {
    let (_dir, store) = store();
    assert!(store.generation(99).expect_err("missing").is_not_found());
    let err = store
        .finalize_generation(
            99,
            &GenerationOutcome::Failed {
                message: "x".into(),
                elapsed: None,
            },
        )
        .expect_err("missing");
    assert!(err.is_not_found());
}

#[test]
fn query_filters_and_orders_newest_first() {
    let (_dir, store) = store();
    let cat = record(&store, "A Cat on a mat", "flux-dev");
    succeed(&store, cat.id, 1000);
    let dog = record(&store, "a dog", "flux-pro");
    succeed(&store, dog.id, 1000);
    let failed_cat = record(&store, "another cat", "flux-dev");
    fail(&store, failed_cat.id, "nsfw");
    backdate(&store, cat.id, 100);
    backdate(&store, dog.id, 200);
    backdate(&store, failed_cat.id, 300);

    let all = store.query(&GenerationFilter::default()).expect("all");
    let ids: Vec<_> = all.iter().map(|g| g.id).collect();
    assert_eq!(ids, vec![failed_cat.id, dog.id, cat.id]);

    let cats = store
        .query(&GenerationFilter {
            prompt_contains: Some("CAT".into()),
            ..GenerationFilter::default()
        })
        .expect("cats");
    assert_eq!(cats.len(), 2);

    let ok_cats = store
        .query(&GenerationFilter {
            prompt_contains: Some("cat".into()),
            success_only: true,
            ..GenerationFilter::default()
        })
        .expect("ok cats");
    assert_eq!(ok_cats.iter().map(|g| g.id).collect::<Vec<_>>(), vec![cat.id]);

    let pro = store
        .query(&GenerationFilter {
            model: Some("flux-pro".into()),
            ..GenerationFilter::default()
        })
        .expect("pro");
    assert_eq!(pro.len(), 1);

    let page = store
        .query(&GenerationFilter {
            limit: Some(1),
            offset: 1,
            ..GenerationFilter::default()
        })
        .expect("page");
    assert_eq!(page[0].id, dog.id);

    assert_eq!(store.latest_generation_id().expect("latest"), Some(failed_cat.id));
    assert_eq!(store.count_generations().expect("count"), 3);
}

#[test]
fn stats_count_finalized_rows_per_model() {
    let (_dir, store) = store();
    for (model, ok) in [("flux-dev", true), ("flux-dev", false), ("flux-pro", true)] {
        let generation = record(&store, "p", model);
        if ok {
            succeed(&store, generation.id, 2000);
        } else {
            fail(&store, generation.id, "boom");
        }
    }
    record(&store, "still running", "flux-dev");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.total, 3);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 1);
    assert!((stats.success_rate() - 66.666).abs() < 0.01);

    let dev = &stats.models["flux-dev"];
    assert_eq!((dev.count, dev.succeeded, dev.failed), (2, 1, 1));
    assert_eq!(dev.avg_elapsed_secs, Some(2.0));
    assert_eq!(stats.models["flux-pro"].count, 1);
}

#[test]
fn empty_history_has_zero_success_rate() {
    let (_dir, store) = store();
    let stats = store.stats().expect("stats");
    assert_eq!(stats.total, 0);
    assert!(stats.success_rate().abs() < f64::EPSILON);
    assert!(stats.models.is_empty());
}

#[test]
fn cleanup_spares_pending_recent_and_session_generations() {
    let (_dir, store) = store();
    let old_ok = record(&store, "old ok", "flux-dev");
    succeed(&store, old_ok.id, 1000);
    let old_failed = record(&store, "old failed", "flux-dev");
    fail(&store, old_failed.id, "boom");
    let old_pending = record(&store, "old pending", "flux-dev");
    let in_session = record(&store, "session base", "flux-dev");
    succeed(&store, in_session.id, 1000);
    let recent = record(&store, "recent", "flux-dev");
    succeed(&store, recent.id, 1000);

    for id in [old_ok.id, old_failed.id, old_pending.id, in_session.id] {
        backdate(&store, id, 1_000);
    }
    backdate(&store, recent.id, 50_000);
    SessionMachine::new(&store)
        .begin_session("keeper", None, in_session.id)
        .expect("session");

    let blobs = RecordingBlobs::default();
    let preview = store.cleanup(10_000, true, &blobs).expect("dry run");
    assert!(preview.dry_run);
    let mut expected = vec![old_ok.id, old_failed.id];
    expected.sort_unstable();
    assert_eq!(
        preview.candidates.iter().map(|c| c.id).collect::<Vec<_>>(),
        expected
    );
    assert!(blobs.deleted.lock().expect("lock").is_empty());
    assert_eq!(store.count_generations().expect("count"), 5);

    let report = store.cleanup(10_000, false, &blobs).expect("cleanup");
    assert_eq!(report.candidates, preview.candidates);
    assert_eq!(report.files_removed, 1);
    assert_eq!(
        blobs.deleted.lock().expect("lock").as_slice(),
        [PathBuf::from(format!("/images/generate_{}_0.jpg", old_ok.id))]
    );
    assert_eq!(store.count_generations().expect("count"), 3);
    assert!(store.generation(old_ok.id).expect_err("removed").is_not_found());
    assert!(store.generation(old_pending.id).is_ok());
    assert!(store.generation(in_session.id).is_ok());
}

#[test]
fn cleanup_releases_generations_of_deleted_sessions() {
    let (_dir, store) = store();
    let base = record(&store, "base", "flux-dev");
    succeed(&store, base.id, 1000);
    let machine = SessionMachine::new(&store);
    machine
        .begin_session("gone", Some("ohwx"), base.id)
        .expect("session");
    let edit = record(&store, "edit", "flux-dev");
    succeed(&store, edit.id, 1000);
    machine
        .append_step(&"gone".into(), edit.id, Some(&EditDescription::new("edit")))
        .expect("append");
    backdate(&store, base.id, 10);
    backdate(&store, edit.id, 10);

    let blobs = RecordingBlobs::default();
    assert_eq!(store.cleanup(100, true, &blobs).expect("dry").count(), 0);

    machine.delete_session(&"gone".into()).expect("delete");
    assert_eq!(store.cleanup(100, false, &blobs).expect("cleanup").count(), 2);
}

#[test]
fn reopening_keeps_data_and_schema_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("history.db");
    let id = {
        let store = HistoryStore::open_path(&path).expect("open");
        let generation = record(&store, "persisted", "flux-dev");
        succeed(&store, generation.id, 1000).id
    };
    let store = HistoryStore::open_path(&path).expect("reopen");
    assert_eq!(store.generation(id).expect("fetch").prompt, "persisted");
    assert_eq!(store.path(), path.as_path());
}

#[test]
fn newer_schema_versions_are_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("history.db");
    {
        let conn = Connection::open(&path).expect("raw open");
        conn.execute_batch("PRAGMA user_version = 99;")
            .expect("bump version");
    }
    let err = HistoryStore::open_path(&path).err().expect("refused");
    assert!(matches!(err, StoreError::StorageUnavailable(_)));
    assert!(format!("{err:?}").contains("99"));
}
