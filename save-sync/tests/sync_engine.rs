//! End-to-end engine and watcher behavior on real directories.

use save_sync::backup::clock::FixedClock;
use save_sync::backup::BackupStore;
use save_sync::config::BusyPolicy;
use save_sync::engine::{EngineOptions, ReconcileOutcome, SyncEngine};
use save_sync::events::{SyncEvent, Trigger};
use save_sync::fs::{copy_tree, last_modified};
use save_sync::watcher::{ChangeWatcher, WatchOptions};
use save_sync::{Direction, PairRegistry, SavePair, Side, SyncError};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::broadcast;

const NOW: i64 = 1_700_000_000;

fn write_at(path: &Path, content: &[u8], secs: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn pair(root: &Path, name: &str) -> SavePair {
    let key = name.to_lowercase();
    SavePair::new(name, root.join("yuzu").join(&key), root.join("ryujinx").join(&key))
}

fn engine(pairs: Vec<SavePair>, options: EngineOptions) -> SyncEngine {
    SyncEngine::new(
        Arc::new(PairRegistry::new(pairs).unwrap()),
        BackupStore::with_clock(Arc::new(FixedClock(NOW))),
        options,
    )
}

fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn started_by(events: &[SyncEvent], by: Trigger) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::SyncStarted { trigger, .. } if *trigger == by))
        .count()
}

#[tokio::test]
async fn zelda_newer_source_overwrites_dest_with_backups() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("progress.sav"), b"master sword", 1_000);
    write_at(&zelda.dest_path.join("progress.sav"), b"wooden stick", 500);

    let engine = engine(vec![zelda.clone()], EngineOptions::default());
    let results = engine.auto_reconcile(&[zelda.clone()]).await;

    assert_eq!(results.len(), 1);
    let report = results[0].report().expect("pair should have synced");
    assert_eq!(report.direction, Some(Direction::SourceToDest));

    let source_backup = temp_dir.path().join(format!("yuzu/zelda_{NOW}"));
    let dest_backup = temp_dir.path().join(format!("ryujinx/zelda_{NOW}"));
    assert_eq!(report.operation.source_backup, source_backup);
    assert_eq!(report.operation.dest_backup, dest_backup);
    assert_eq!(fs::read(source_backup.join("progress.sav")).unwrap(), b"master sword");
    assert_eq!(fs::read(dest_backup.join("progress.sav")).unwrap(), b"wooden stick");

    assert_eq!(fs::read(zelda.dest_path.join("progress.sav")).unwrap(), b"master sword");
    assert_eq!(
        last_modified(&zelda.dest_path).unwrap(),
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)
    );
}

#[tokio::test]
async fn reconcile_twice_is_sync_then_noop() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("a.sav"), b"a", 100);
    write_at(&zelda.dest_path.join("b.sav"), b"b", 200);

    let engine = engine(vec![zelda.clone()], EngineOptions::default());

    let first = engine.reconcile_all().await;
    assert_eq!(
        first[0].report().and_then(|r| r.direction),
        Some(Direction::DestToSource)
    );

    let second = engine.reconcile_all().await;
    assert!(matches!(second[0].outcome, Ok(ReconcileOutcome::InSync)));
    assert_eq!(engine.backups().list(&zelda.source_path).unwrap().len(), 1);
}

#[tokio::test]
async fn newer_dest_is_never_overwritten() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"old", 1_000);
    write_at(&zelda.dest_path.join("save.bin"), b"new", 1_001);

    let engine = engine(vec![zelda.clone()], EngineOptions::default());
    let results = engine.reconcile_all().await;

    assert_eq!(
        results[0].report().and_then(|r| r.direction),
        Some(Direction::DestToSource)
    );
    assert_eq!(fs::read(zelda.dest_path.join("save.bin")).unwrap(), b"new");
    assert_eq!(fs::read(zelda.source_path.join("save.bin")).unwrap(), b"new");
}

#[tokio::test]
async fn tolerance_treats_close_timestamps_as_equal() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"one", 1_001);
    write_at(&zelda.dest_path.join("save.bin"), b"two", 1_000);

    let options = EngineOptions {
        tolerance: Duration::from_secs(2),
        ..EngineOptions::default()
    };
    let engine = engine(vec![zelda.clone()], options);
    let results = engine.reconcile_all().await;

    assert!(matches!(results[0].outcome, Ok(ReconcileOutcome::InSync)));
    assert_eq!(fs::read(zelda.dest_path.join("save.bin")).unwrap(), b"two");
}

#[tokio::test]
async fn empty_side_is_always_older() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    fs::create_dir_all(zelda.source_path.join("never-played")).unwrap();
    write_at(&zelda.dest_path.join("save.bin"), b"ryujinx", 1);

    let mario = pair(temp_dir.path(), "Mario");
    fs::create_dir_all(&mario.source_path).unwrap();
    fs::create_dir_all(&mario.dest_path).unwrap();

    let engine = engine(vec![zelda.clone(), mario.clone()], EngineOptions::default());
    let results = engine.reconcile_all().await;

    assert_eq!(results[0].pair, "Zelda");
    assert_eq!(
        results[0].report().and_then(|r| r.direction),
        Some(Direction::DestToSource)
    );
    assert_eq!(fs::read(zelda.source_path.join("save.bin")).unwrap(), b"ryujinx");

    assert_eq!(results[1].pair, "Mario");
    assert!(matches!(results[1].outcome, Ok(ReconcileOutcome::BothEmpty)));
}

#[tokio::test]
async fn missing_side_fails_only_its_pair() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"x", 1);

    let mario = pair(temp_dir.path(), "Mario");
    write_at(&mario.source_path.join("save.bin"), b"new", 20);
    write_at(&mario.dest_path.join("save.bin"), b"old", 10);

    let engine = engine(vec![zelda, mario.clone()], EngineOptions::default());
    let results = engine.reconcile_all().await;

    assert!(matches!(results[0].outcome, Err(SyncError::SourceMissing(_))));
    assert!(results[1].report().is_some());
    assert_eq!(fs::read(mario.dest_path.join("save.bin")).unwrap(), b"new");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_pairs_sync_concurrently() {
    let temp_dir = TempDir::new().unwrap();
    let pairs: Vec<SavePair> = ["Zelda", "Mario", "Metroid", "Kirby"]
        .iter()
        .map(|name| pair(temp_dir.path(), name))
        .collect();
    for (i, p) in pairs.iter().enumerate() {
        for n in 0..20 {
            write_at(&p.source_path.join(format!("slot{n}.sav")), b"newer", 2_000 + i as u64);
        }
        write_at(&p.dest_path.join("slot0.sav"), b"older", 1_000);
    }

    let engine = engine(pairs.clone(), EngineOptions::default());
    let results = engine.auto_reconcile(&pairs).await;

    let names: Vec<&str> = results.iter().map(|r| r.pair.as_str()).collect();
    assert_eq!(names, ["Zelda", "Mario", "Metroid", "Kirby"]);
    for (result, p) in results.iter().zip(&pairs) {
        assert_eq!(result.report().map(|r| r.operation.files), Some(20));
        assert_eq!(fs::read_dir(&p.dest_path).unwrap().count(), 20);
    }
}

#[tokio::test]
async fn fail_fast_rejects_overlapping_sync_of_same_pair() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"new", 2);
    write_at(&zelda.dest_path.join("save.bin"), b"old", 1);

    let options = EngineOptions {
        on_busy: BusyPolicy::FailFast,
        ..EngineOptions::default()
    };
    let engine = engine(vec![zelda.clone()], options);

    let (first, second) = tokio::join!(
        engine.sync_pair(&zelda, Direction::SourceToDest, Trigger::Manual),
        engine.sync_pair(&zelda, Direction::DestToSource, Trigger::Manual),
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::AlreadySyncing(name)) if name == "Zelda"));
    assert_eq!(fs::read(zelda.dest_path.join("save.bin")).unwrap(), b"new");
}

#[tokio::test]
async fn queued_syncs_of_same_pair_run_one_after_another() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"yuzu", 2);
    write_at(&zelda.dest_path.join("save.bin"), b"ryujinx", 1);

    let engine = engine(vec![zelda.clone()], EngineOptions::default());
    let (first, second) = tokio::join!(
        engine.sync_pair(&zelda, Direction::SourceToDest, Trigger::Manual),
        engine.sync_pair(&zelda, Direction::DestToSource, Trigger::Manual),
    );

    first.unwrap();
    let second = second.unwrap();
    // Same-second backups of the same tree get a counter suffix
    assert_eq!(
        second.operation.dest_backup,
        temp_dir.path().join(format!("yuzu/zelda_{NOW}-1"))
    );
    assert_eq!(fs::read(zelda.source_path.join("save.bin")).unwrap(), b"yuzu");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_ignores_own_writes_but_syncs_user_edits() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"yuzu", 1_000);
    write_at(&zelda.dest_path.join("save.bin"), b"ryujinx", 500);

    let engine = engine(vec![zelda.clone()], EngineOptions::default());
    let mut events = engine.events().subscribe();
    let watcher = ChangeWatcher::start(
        engine.clone(),
        WatchOptions {
            debounce: Duration::from_millis(150),
        },
    )
    .unwrap();
    assert_eq!(watcher.watched_roots().len(), 2);
    assert!(watcher.failed_roots().is_empty());

    engine
        .sync_pair(&zelda, Direction::SourceToDest, Trigger::Manual)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let seen = drain(&mut events);
    assert_eq!(started_by(&seen, Trigger::Manual), 1);
    assert_eq!(started_by(&seen, Trigger::Watcher), 0, "sync echoed back: {seen:?}");

    write_at(&zelda.dest_path.join("save.bin"), b"played on ryujinx", 3_000);
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let seen = drain(&mut events);
    assert_eq!(started_by(&seen, Trigger::Watcher), 1, "events: {seen:?}");
    assert_eq!(
        fs::read(zelda.source_path.join("save.bin")).unwrap(),
        b"played on ryujinx"
    );

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_keeps_following_a_restored_root() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"yuzu", 1_000);
    write_at(&zelda.dest_path.join("save.bin"), b"ryujinx", 500);
    let snapshot = temp_dir.path().join("snapshot");
    copy_tree(&zelda.dest_path, &snapshot).unwrap();

    let engine = engine(vec![zelda.clone()], EngineOptions::default());
    let mut events = engine.events().subscribe();
    let watcher = ChangeWatcher::start(
        engine.clone(),
        WatchOptions {
            debounce: Duration::from_millis(150),
        },
    )
    .unwrap();

    engine
        .restore_backup(&zelda, Side::Dest, &snapshot)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The restore swapped the dest directory; edits to the new one still count
    write_at(&zelda.dest_path.join("save.bin"), b"played on ryujinx", 3_000);
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let seen = drain(&mut events);
    assert_eq!(started_by(&seen, Trigger::Watcher), 1, "events: {seen:?}");
    assert_eq!(
        fs::read(zelda.source_path.join("save.bin")).unwrap(),
        b"played on ryujinx"
    );

    watcher.stop().await;
}

#[tokio::test]
async fn watcher_recovers_after_missing_engine_events() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"yuzu", 1_000);
    write_at(&zelda.dest_path.join("save.bin"), b"ryujinx", 500);

    let engine = engine(vec![zelda.clone()], EngineOptions::default());
    let watcher = ChangeWatcher::start(
        engine.clone(),
        WatchOptions {
            debounce: Duration::from_millis(150),
        },
    )
    .unwrap();

    // Overflow the dispatcher's event queue before it gets to run
    for _ in 0..1_000 {
        engine.events().publish(SyncEvent::InSync {
            pair: "Zelda".to_string(),
            both_empty: false,
        });
    }
    let mut events = engine.events().subscribe();
    tokio::time::sleep(Duration::from_millis(300)).await;

    write_at(&zelda.source_path.join("save.bin"), b"new run", 3_000);
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let seen = drain(&mut events);
    assert_eq!(started_by(&seen, Trigger::Watcher), 1, "events: {seen:?}");
    assert_eq!(fs::read(zelda.dest_path.join("save.bin")).unwrap(), b"new run");
    assert!(watcher.is_running());

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_debounces_bursts_into_one_sync() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    write_at(&zelda.source_path.join("save.bin"), b"v0", 100);
    write_at(&zelda.dest_path.join("save.bin"), b"v0", 100);

    let engine = engine(vec![zelda.clone()], EngineOptions::default());
    let mut events = engine.events().subscribe();
    let watcher = ChangeWatcher::start(
        engine.clone(),
        WatchOptions {
            debounce: Duration::from_millis(200),
        },
    )
    .unwrap();

    for n in 0..10 {
        write_at(&zelda.source_path.join(format!("slot{n}.sav")), b"burst", 5_000 + n);
    }
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let seen = drain(&mut events);
    assert_eq!(started_by(&seen, Trigger::Watcher), 1, "events: {seen:?}");
    assert_eq!(fs::read_dir(&zelda.dest_path).unwrap().count(), 11);

    watcher.stop().await;
}

#[tokio::test]
async fn unwatchable_root_is_reported_and_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let zelda = pair(temp_dir.path(), "Zelda");
    fs::create_dir_all(&zelda.source_path).unwrap();

    let engine = engine(vec![zelda.clone()], EngineOptions::default());
    let mut events = engine.events().subscribe();
    let watcher = ChangeWatcher::start(engine.clone(), WatchOptions::default()).unwrap();

    assert_eq!(watcher.watched_roots(), [zelda.source_path.clone()]);
    assert_eq!(watcher.failed_roots().len(), 1);
    assert_eq!(watcher.failed_roots()[0].path, zelda.dest_path);
    assert!(matches!(events.try_recv(), Ok(SyncEvent::WatchFailed { .. })));
    assert!(watcher.is_running());

    watcher.stop().await;
}

#[test]
fn crate_result_is_the_error_module_alias() {
    fn load() -> save_sync::utils::errors::Result<usize> {
        Err(SyncError::UnknownPair("Metroid".to_string()))
    }
    let result: save_sync::Result<usize> = load();
    assert_eq!(result.unwrap_err().kind(), "unknown-pair");
}
