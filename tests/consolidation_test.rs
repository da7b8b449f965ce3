//! Coverage consolidation scenarios: overlapping watch requests share one
//! OS watch, merges displace child watchers, and splits restore them.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use common::{EventLog, ManualHub, wait_until};
use pathwatch::{ChangeEvent, EventAction, PathWatcherManager, WatchOptions};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn fixture_root(dirs: &[&str]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    for sub in dirs {
        std::fs::create_dir_all(dir.path().join(sub)).unwrap();
    }
    let canonical = tokio::fs::canonicalize(dir.path()).await.unwrap();
    (dir, canonical)
}

fn created(path: PathBuf) -> ChangeEvent {
    ChangeEvent::new(EventAction::Created, path)
}

#[tokio::test]
async fn scenario_a_parent_then_child_share_one_watcher() {
    let (_dir, root) = fixture_root(&["sub"]).await;
    let hub = ManualHub::new();
    let manager = PathWatcherManager::with_backend(hub.factory(), 64);

    let parent = manager.watch(root.clone(), WatchOptions::default()).await.unwrap();
    let child = manager
        .watch(root.join("sub"), WatchOptions::default())
        .await
        .unwrap();

    assert_eq!(manager.native_count(), 1);
    assert_eq!(hub.active_roots(), vec![root.clone()]);

    let parent_log = EventLog::new();
    let child_log = EventLog::new();
    let _sub_parent = parent.on_did_change(parent_log.callback());
    let _sub_child = child.on_did_change(child_log.callback());

    // A change inside sub reaches both consumers.
    let inside = root.join("sub/file.txt");
    assert!(hub.emit(&root, vec![created(inside.clone())]));
    assert!(
        wait_until(TIMEOUT, || {
            parent_log.saw_path(&inside) && child_log.saw_path(&inside)
        })
        .await
    );

    // A change outside sub reaches only the parent consumer.
    let outside = root.join("top.txt");
    assert!(hub.emit(&root, vec![created(outside.clone())]));
    assert!(wait_until(TIMEOUT, || parent_log.saw_path(&outside)).await);
    assert!(!child_log.saw_path(&outside));

    manager.stop_all().await;
}

#[tokio::test]
async fn watching_same_path_twice_shares_identity() {
    let (_dir, root) = fixture_root(&[]).await;
    let hub = ManualHub::new();
    let manager = PathWatcherManager::with_backend(hub.factory(), 64);

    let _first = manager.watch(root.clone(), WatchOptions::default()).await.unwrap();
    let _second = manager.watch(root.clone(), WatchOptions::default()).await.unwrap();

    assert_eq!(manager.native_count(), 1);
    assert_eq!(hub.active_roots(), vec![root.clone()]);

    manager.stop_all().await;
}

#[tokio::test]
async fn scenario_b_parent_consolidates_children_and_routes_correctly() {
    let (_dir, root) = fixture_root(&["x", "y"]).await;
    let hub = ManualHub::new();
    let manager = PathWatcherManager::with_backend(hub.factory(), 64);

    let watcher_x = manager
        .watch(root.join("x"), WatchOptions::default())
        .await
        .unwrap();
    let watcher_y = manager
        .watch(root.join("y"), WatchOptions::default())
        .await
        .unwrap();
    assert_eq!(manager.native_count(), 2);
    assert_eq!(hub.active_roots(), vec![root.join("x"), root.join("y")]);

    // Readiness of the merged watcher implies the displaced consumers have
    // already rebound to it.
    let watcher_root = manager.watch(root.clone(), WatchOptions::default()).await.unwrap();

    assert_eq!(manager.native_count(), 1);
    assert!(
        wait_until(TIMEOUT, || hub.active_roots() == vec![root.clone()]).await,
        "child watchers should be stopped after the merge, got {:?}",
        hub.active_roots()
    );

    let log_x = EventLog::new();
    let log_y = EventLog::new();
    let log_root = EventLog::new();
    let _sub_x = watcher_x.on_did_change(log_x.callback());
    let _sub_y = watcher_y.on_did_change(log_y.callback());
    let _sub_root = watcher_root.on_did_change(log_root.callback());

    // A change under x is delivered to the x and root consumers only.
    let under_x = root.join("x/file.txt");
    assert!(hub.emit(&root, vec![created(under_x.clone())]));
    assert!(
        wait_until(TIMEOUT, || {
            log_x.saw_path(&under_x) && log_root.saw_path(&under_x)
        })
        .await
    );
    assert!(log_y.is_empty());

    manager.stop_all().await;
}

#[tokio::test]
async fn split_recreates_coverage_for_adopted_consumers() {
    let (_dir, root) = fixture_root(&["x"]).await;
    let hub = ManualHub::new();
    let manager = PathWatcherManager::with_backend(hub.factory(), 64);

    let watcher_root = manager.watch(root.clone(), WatchOptions::default()).await.unwrap();
    let watcher_x = manager
        .watch(root.join("x"), WatchOptions::default())
        .await
        .unwrap();
    assert_eq!(manager.native_count(), 1);

    let log_x = EventLog::new();
    let _sub_x = watcher_x.on_did_change(log_x.callback());

    // Stopping the broad watcher splits coverage: the adopted consumer
    // gets its own narrower watcher.
    manager.stop_all().await;

    assert!(
        wait_until(TIMEOUT, || hub.active_roots() == vec![root.join("x")]).await,
        "expected a recreated watcher at x, got {:?}",
        hub.active_roots()
    );
    assert_eq!(manager.native_count(), 1);

    // The adopted consumer rebound before the new backend came up, so the
    // first batch already reaches it.
    let under_x = root.join("x/file.txt");
    assert!(hub.emit(&root.join("x"), vec![created(under_x.clone())]));
    assert!(wait_until(TIMEOUT, || log_x.saw_path(&under_x)).await);

    drop(watcher_root);
    manager.stop_all().await;
}

#[tokio::test]
async fn rename_across_a_consumer_boundary_is_split() {
    let (_dir, root) = fixture_root(&["x", "y"]).await;
    let hub = ManualHub::new();
    let manager = PathWatcherManager::with_backend(hub.factory(), 64);

    let watcher_root = manager.watch(root.clone(), WatchOptions::default()).await.unwrap();
    let watcher_x = manager
        .watch(root.join("x"), WatchOptions::default())
        .await
        .unwrap();

    let log_x = EventLog::new();
    let log_root = EventLog::new();
    let _sub_x = watcher_x.on_did_change(log_x.callback());
    let _sub_root = watcher_root.on_did_change(log_root.callback());

    let old_path = root.join("x/doc.txt");
    let new_path = root.join("y/doc.txt");
    assert!(hub.emit(&root, vec![ChangeEvent::renamed(old_path.clone(), new_path.clone())]));
    assert!(wait_until(TIMEOUT, || !log_x.is_empty() && !log_root.is_empty()).await);

    // Leaving x's scope: delivered as a delete of the old path.
    let first_x = &log_x.snapshot()[0];
    assert_eq!(first_x.action, EventAction::Deleted);
    assert_eq!(first_x.path, old_path);
    assert_eq!(first_x.old_path, None);

    // Entirely inside the root scope: passes through unchanged.
    let first_root = &log_root.snapshot()[0];
    assert_eq!(first_root.action, EventAction::Renamed);
    assert_eq!(first_root.path, new_path);
    assert_eq!(first_root.old_path.as_deref(), Some(old_path.as_path()));

    manager.stop_all().await;
}
