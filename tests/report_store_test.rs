//! Filesystem report store behaviour under concurrent writers and resumed
//! runs.

mod common;

use std::sync::Arc;

use chrono::Utc;

use common::{fs_store, temp_dir, RUN_ID};
use patchgrade::domain::models::{RunManifest, Verdict, VerdictKind};
use patchgrade::services::summarize;
use patchgrade::{FsReportStore, ReportStore};

fn verdict(id: &str, kind: VerdictKind) -> Verdict {
    let mut verdict = Verdict::infra_error(RUN_ID, id, "model-a", "placeholder", Utc::now());
    verdict.kind = kind;
    if kind != VerdictKind::InfraError {
        verdict.error = None;
        verdict.patch_applied = kind != VerdictKind::PatchRejected;
        verdict.resolved = kind == VerdictKind::Resolved;
    }
    verdict
}

fn manifest(selected: &[&str]) -> RunManifest {
    RunManifest::new(
        RUN_ID,
        "fixtures",
        "test",
        selected.iter().map(|s| (*s).to_string()).collect(),
    )
}

#[tokio::test]
async fn test_concurrent_writers_produce_complete_reports() {
    let dir = temp_dir();
    let store = fs_store(&dir);
    let ids: Vec<String> = (0..32).map(|i| format!("inst-{i:02}")).collect();
    store
        .prepare_run(&manifest(&ids.iter().map(String::as_str).collect::<Vec<_>>()), false)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let store = Arc::clone(&store);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let kind = if i % 2 == 0 {
                VerdictKind::Resolved
            } else {
                VerdictKind::Unresolved
            };
            store
                .write_artifact(RUN_ID, &id, "test_output.post.txt", "PASSED x")
                .await
                .unwrap();
            store.write(RUN_ID, &id, &verdict(&id, kind)).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let all = store.read_all(RUN_ID).await.unwrap();
    assert_eq!(all.len(), 32);
    let mut seen: Vec<_> = all.iter().map(|v| v.instance_id.clone()).collect();
    seen.sort();
    assert_eq!(seen, ids);

    let (summary, _) = summarize(store.as_ref(), RUN_ID).await.unwrap();
    assert_eq!(summary.reported, 32);
    assert_eq!(summary.count(VerdictKind::Resolved), 16);
    assert!(summary.complete);
    assert!((summary.resolved_rate() - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_overwrite_replaces_whole_verdict() {
    let dir = temp_dir();
    let store = fs_store(&dir);
    store.prepare_run(&manifest(&["a-1"]), false).await.unwrap();

    store
        .write(RUN_ID, "a-1", &verdict("a-1", VerdictKind::InfraError))
        .await
        .unwrap();
    let replacement = verdict("a-1", VerdictKind::Resolved);
    store.write(RUN_ID, "a-1", &replacement).await.unwrap();

    assert_eq!(store.read(RUN_ID, "a-1").await.unwrap(), Some(replacement));
    assert_eq!(store.read_all(RUN_ID).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_summary_lists_missing_instances() {
    let dir = temp_dir();
    let store = fs_store(&dir);
    store
        .prepare_run(&manifest(&["a-1", "b-2", "c-3"]), false)
        .await
        .unwrap();
    store
        .write(RUN_ID, "b-2", &verdict("b-2", VerdictKind::PatchRejected))
        .await
        .unwrap();

    let (summary, verdicts) = summarize(store.as_ref(), RUN_ID).await.unwrap();
    assert_eq!(verdicts.len(), 1);
    assert_eq!(summary.selected, Some(3));
    assert_eq!(summary.missing, vec!["a-1".to_string(), "c-3".to_string()]);
    assert!(!summary.complete);
}

#[tokio::test]
async fn test_resumed_run_keeps_creation_time() {
    let dir = temp_dir();
    let store = FsReportStore::new(dir.path().join("reports"));

    let first = manifest(&["a-1"]);
    store.prepare_run(&first, false).await.unwrap();
    let mut second = manifest(&["a-1", "b-2"]);
    second.created_at = Utc::now();
    store.prepare_run(&second, false).await.unwrap();

    let stored = store.read_manifest(RUN_ID).await.unwrap().unwrap();
    assert_eq!(stored.created_at, first.created_at);
    assert_eq!(stored.selected, vec!["a-1".to_string(), "b-2".to_string()]);
    assert!(stored.updated_at >= stored.created_at);
}

#[tokio::test]
async fn test_runs_are_namespaced() {
    let dir = temp_dir();
    let store = fs_store(&dir);

    let mut other = verdict("a-1", VerdictKind::Resolved);
    other.run_id = "other-run".to_string();
    store.write("other-run", "a-1", &other).await.unwrap();

    assert!(!store.has_report(RUN_ID, "a-1").await.unwrap());
    assert!(store.has_report("other-run", "a-1").await.unwrap());
    assert!(store.read_all(RUN_ID).await.unwrap().is_empty());
}
