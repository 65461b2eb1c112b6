//! End-to-end scenarios against a real in-process engine instance: one
//! temp directory, a real scheduler, fixture packages produced by
//! [`silo::testing::mock::MockArchive`]'s naming convention.

use std::time::Duration;

use silo::Manager;
use silo::jobs::{JobKind, Queue};
use silo::testing::Harness;
use silo::testing::fixtures::{nano_package, nano_releases};

const TIMEOUT: Duration = Duration::from_secs(10);

fn import_paths(manager: &Manager, repo_id: &str, paths: &[std::path::PathBuf]) -> Vec<u8> {
    let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    manager.bulk_add(repo_id, paths).unwrap()
}

/// S1: create a repo, add two releases of one package, index it; the
/// published tip is the higher release.
#[tokio::test]
async fn s1_index_publishes_highest_release() {
    let mut harness = Harness::new();
    let incoming = tempfile::tempdir().unwrap();
    let packages = nano_releases(incoming.path(), &[68, 69]);

    harness
        .run_to_completion(JobKind::CreateRepo, vec!["unstable".to_string()], TIMEOUT)
        .await
        .unwrap();

    let paths: Vec<String> = packages.iter().map(|p| p.display().to_string()).collect();
    let mut params = vec!["unstable".to_string()];
    params.extend(paths);
    let entry = harness.run_to_completion(JobKind::BulkAdd, params, TIMEOUT).await.unwrap();
    assert!(!entry.failed, "bulk add failed: {:?}", entry.error);

    // BulkAdd enqueues its own IndexRepo job; wait for that one instead of
    // enqueuing a second.
    wait_for_history(&harness, "IndexRepo(unstable)").await;

    let xml_path = harness.engine().ctx.repo_path("unstable").join("eopkg-index.xml");
    let xml = std::fs::read_to_string(&xml_path).unwrap();
    assert_eq!(xml.matches("<Package>").count(), 1);
    let uri_line = xml.lines().find(|l| l.contains("<PackageURI>")).unwrap();
    assert!(uri_line.contains("nano-69-1-x86_64.eopkg"), "{uri_line}");

    harness.shutdown().await;
}

/// S2: delta the repo; the delta lands in the pool and the re-published
/// index embeds one delta descriptor with ReleaseFrom = 68.
#[tokio::test]
async fn s2_delta_repo_embeds_descriptor() {
    let mut harness = Harness::new();
    let incoming = tempfile::tempdir().unwrap();
    let packages = nano_releases(incoming.path(), &[68, 69]);

    harness
        .run_to_completion(JobKind::CreateRepo, vec!["unstable".to_string()], TIMEOUT)
        .await
        .unwrap();
    import_paths(&harness.manager, "unstable", &packages);
    wait_for_history(&harness, "IndexRepo(unstable)").await;

    harness
        .run_to_completion(JobKind::DeltaRepo, vec!["unstable".to_string()], TIMEOUT)
        .await
        .unwrap();
    // DeltaRepo fans out an async Delta job per base name; wait for it too.
    wait_for_history(&harness, "Delta(unstable, nano)").await;
    // Delta schedules a sequential IncludeDelta job on success.
    wait_for_history_prefix(&harness, "IncludeDelta(unstable,").await;

    let pool_items = harness.manager.list_pool().unwrap();
    assert!(
        pool_items.iter().any(|item| item.id == "nano-68-69-1-x86_64.delta.eopkg"),
        "pool: {pool_items:?}"
    );

    // Re-index and check the embedded delta descriptor.
    harness
        .run_to_completion(JobKind::IndexRepo, vec!["unstable".to_string()], TIMEOUT)
        .await
        .unwrap();
    let xml_path = harness.engine().ctx.repo_path("unstable").join("eopkg-index.xml");
    let xml = std::fs::read_to_string(&xml_path).unwrap();
    assert!(xml.contains("<ReleaseFrom>68</ReleaseFrom>"), "{xml}");

    harness.shutdown().await;
}

/// S3/S4: clone with copy_all, check refcounts double, then delete the
/// clone and check refcounts return to 1.
#[tokio::test]
async fn s3_s4_clone_and_delete_restore_refcounts() {
    let mut harness = Harness::new();
    let incoming = tempfile::tempdir().unwrap();
    let packages = nano_releases(incoming.path(), &[68, 69]);

    harness
        .run_to_completion(JobKind::CreateRepo, vec!["unstable".to_string()], TIMEOUT)
        .await
        .unwrap();
    import_paths(&harness.manager, "unstable", &packages);
    wait_for_history(&harness, "IndexRepo(unstable)").await;

    harness
        .run_to_completion(
            JobKind::CloneRepo,
            vec!["unstable".to_string(), "stable".to_string(), "true".to_string()],
            TIMEOUT,
        )
        .await
        .unwrap();

    let refcount_of = |harness: &Harness, id: &str| {
        harness
            .manager
            .list_pool()
            .unwrap()
            .into_iter()
            .find(|item| item.id == id)
            .map(|item| item.ref_count)
    };

    assert_eq!(refcount_of(&harness, "nano-68-1-x86_64.eopkg"), Some(2));
    assert_eq!(refcount_of(&harness, "nano-69-1-x86_64.eopkg"), Some(2));

    let stable_entry = harness.manager.engine.repos.get_entry("stable", "nano").unwrap();
    let unstable_entry = harness.manager.engine.repos.get_entry("unstable", "nano").unwrap();
    assert_eq!(stable_entry.available, unstable_entry.available);
    assert_eq!(stable_entry.published, unstable_entry.published);

    harness
        .run_to_completion(JobKind::DeleteRepo, vec!["stable".to_string()], TIMEOUT)
        .await
        .unwrap();

    assert_eq!(refcount_of(&harness, "nano-68-1-x86_64.eopkg"), Some(1));
    assert_eq!(refcount_of(&harness, "nano-69-1-x86_64.eopkg"), Some(1));
    assert!(!harness.manager.engine.repos.exists("stable").unwrap());

    // unstable's index is untouched by the clone/delete of stable.
    let xml_path = harness.engine().ctx.repo_path("unstable").join("eopkg-index.xml");
    let xml_before = std::fs::read_to_string(&xml_path).unwrap();
    assert!(xml_before.contains("nano-69-1-x86_64.eopkg"));

    harness.shutdown().await;
}

/// S5: adding a package whose release is lower than the current tip is
/// accepted into `available` but does not move `published`.
#[tokio::test]
async fn s5_lower_release_does_not_move_tip() {
    let mut harness = Harness::new();
    let incoming = tempfile::tempdir().unwrap();
    let high = nano_package(incoming.path(), 69);
    let low = nano_package(incoming.path(), 68);

    harness
        .run_to_completion(JobKind::CreateRepo, vec!["unstable".to_string()], TIMEOUT)
        .await
        .unwrap();
    import_paths(&harness.manager, "unstable", &[high]);
    wait_for_history(&harness, "IndexRepo(unstable)").await;

    let entry = harness.manager.engine.repos.get_entry("unstable", "nano").unwrap();
    assert_eq!(entry.published, "nano-69-1-x86_64.eopkg");

    import_paths(&harness.manager, "unstable", &[low]);
    wait_for_history_nth(&harness, "IndexRepo(unstable)", 2).await;

    let entry = harness.manager.engine.repos.get_entry("unstable", "nano").unwrap();
    assert_eq!(entry.published, "nano-69-1-x86_64.eopkg");
    assert!(entry.available.contains(&"nano-68-1-x86_64.eopkg".to_string()));
    let mut sorted = entry.available.clone();
    sorted.sort();
    assert_eq!(entry.available, sorted);

    harness.shutdown().await;
}

/// S6: a worker claims jobs but the engine is closed before they retire.
/// Reopening against the same directory clears every `claimed` flag.
#[tokio::test]
async fn s6_recovery_clears_claimed_flags() {
    use silo::context::Context;
    use silo::manager::Engine;
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    {
        let ctx = Context::new(dir.path());
        let engine = Engine::open(ctx, Arc::new(silo::testing::mock::MockArchive::default())).unwrap();
        engine
            .jobs
            .enqueue(JobKind::Delta, vec!["unstable".to_string(), "nano".to_string()])
            .unwrap();
        engine
            .jobs
            .enqueue(JobKind::Delta, vec!["unstable".to_string(), "vim".to_string()])
            .unwrap();
        engine
            .jobs
            .enqueue(JobKind::Delta, vec!["unstable".to_string(), "bash".to_string()])
            .unwrap();
        for _ in 0..3 {
            engine.jobs.claim(Queue::Async).unwrap();
        }
        let claimed = engine.jobs.list_queue(Queue::Async).unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|r| r.claimed));
        // engine (and its sled handles) drop at the end of this block.
    }

    let ctx = Context::new(dir.path());
    let engine = Engine::open(ctx, Arc::new(silo::testing::mock::MockArchive::default())).unwrap();
    let records = engine.jobs.list_queue(Queue::Async).unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| !r.claimed), "{records:?}");
}

async fn wait_for_history(harness: &Harness, description: &str) {
    wait_for_history_nth(harness, description, 1).await;
}

async fn wait_for_history_nth(harness: &Harness, description: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let matches = harness
            .manager
            .engine
            .jobs
            .list_history(false)
            .unwrap()
            .into_iter()
            .filter(|e| e.description == description)
            .count();
        if matches >= count {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("history entry {description:?} (x{count}) did not appear within {TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_history_prefix(harness: &Harness, prefix: &str) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let found = harness
            .manager
            .engine
            .jobs
            .list_history(false)
            .unwrap()
            .into_iter()
            .any(|e| e.description.starts_with(prefix));
        if found {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no history entry starting with {prefix:?} within {TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
