mod common;

use common::{at, harness, script_target, test_config, PAYLOAD};
use custodian_server::db::connection::with_conn;
use custodian_server::models::archive::{self, ArchiveFilter, ArchiveStatus};
use custodian_server::models::job;
use custodian_server::models::retention;
use custodian_server::models::task::{self, TaskStatus};
use std::time::Duration;

const WEEK: i64 = 604_800;

#[tokio::test]
async fn daily_backup_is_archived_then_purged_when_expired() {
    let h = harness(test_config(), "2024-01-01T01:00:00Z");
    let target = h.target("bytes").await;
    let store = h.store().await;
    let j = h.job(&target, &store, "daily at 02:00", WEEK, 50).await;

    // Nothing is due at 01:00; the job is scheduled for 02:00.
    assert!(h.state.scheduler.tick().await.unwrap().is_empty());
    let uuid = j.uuid.clone();
    let scheduled = with_conn(&h.state.db, move |c| job::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert_eq!(scheduled.next_run, Some(at("2024-01-01T02:00:00Z").timestamp()));

    h.clock.set(at("2024-01-01T02:00:00Z"));
    let mut handles = h.state.scheduler.tick().await.unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles.remove(0).wait().await, TaskStatus::Done);

    let archives = with_conn(&h.state.db, |c| archive::find_all(c, &ArchiveFilter::default()))
        .await
        .unwrap();
    assert_eq!(archives.len(), 1);
    let a = &archives[0];
    assert_eq!(a.taken_at, at("2024-01-01T02:00:00Z").timestamp());
    assert_eq!(a.expires_at, at("2024-01-08T02:00:00Z").timestamp());
    assert_eq!(a.status, ArchiveStatus::Valid);
    assert_eq!(a.job_uuid.as_deref(), Some(j.uuid.as_str()));
    assert!(h.memory.contains(&a.store_key));

    let uuid = j.uuid.clone();
    let ran = with_conn(&h.state.db, move |c| job::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert_eq!(ran.last_run, Some(at("2024-01-01T02:00:00Z").timestamp()));
    assert_eq!(ran.next_run, Some(at("2024-01-02T02:00:00Z").timestamp()));

    // A week later the archive has expired and is purged.
    h.clock.set(at("2024-01-08T03:00:00Z"));
    let candidates = h.state.retention.sweep_expired(h.clock_now()).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].0.uuid, a.uuid);

    let mut purges = h.state.retention.sweep().await.unwrap();
    assert_eq!(purges.len(), 1);
    assert_eq!(purges.remove(0).wait().await, TaskStatus::Done);

    let id = a.uuid.clone();
    let purged = with_conn(&h.state.db, move |c| archive::find_by_id(c, &id)).await.unwrap().unwrap();
    assert_eq!(purged.status, ArchiveStatus::Purged);
    assert_eq!(purged.purge_reason.as_deref(), Some("expired"));
    assert!(h.memory.is_empty());

    // Purged archives are not swept again.
    assert!(h.state.retention.sweep().await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_target_fails_the_store_and_the_task() {
    let h = harness(test_config(), "2024-01-01T01:00:00Z");
    script_target(
        &h.plugin_dir,
        "flaky",
        "printf 'partial archive bytes'; echo 'disk on fire' >&2; exit 3",
    );
    let target = h.target("flaky").await;
    let store = h.store().await;
    let j = h.job(&target, &store, "daily", WEEK, 50).await;

    let handle = h.state.engine.submit(task::NewTask::backup(&j, "tests")).await.unwrap();
    let uuid = handle.uuid.clone();
    assert_eq!(handle.wait().await, TaskStatus::Failed);

    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert!(t.log.contains("disk on fire"), "stderr forwarded: {}", t.log);
    assert!(t.log.contains("target plugin 'flaky' failed during backup"), "log: {}", t.log);
    assert!(t.stopped_at.is_some());
    assert!(t.started_at <= t.stopped_at);

    assert!(h.memory.is_empty(), "store must not keep a truncated object");
    let archives = with_conn(&h.state.db, |c| archive::find_all(c, &ArchiveFilter::default()))
        .await
        .unwrap();
    assert!(archives.is_empty());
}

#[tokio::test]
async fn timed_out_task_is_cancelled_and_its_plugin_killed() {
    let config = custodian_server::config::AppConfig {
        task_timeout: Duration::from_millis(500),
        ..test_config()
    };
    let h = harness(config, "2024-01-01T01:00:00Z");
    let marker = h.plugin_dir.join("finished");
    script_target(
        &h.plugin_dir,
        "slow",
        &format!("printf 'begin'; sleep 2; touch '{}'", marker.display()),
    );
    let target = h.target("slow").await;
    let store = h.store().await;
    let j = h.job(&target, &store, "daily", WEEK, 50).await;

    let handle = h.state.engine.submit(task::NewTask::backup(&j, "tests")).await.unwrap();
    let uuid = handle.uuid.clone();
    assert_eq!(handle.wait().await, TaskStatus::Cancelled);

    let id = uuid.clone();
    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &id)).await.unwrap().unwrap();
    assert!(t.log.contains("timeout"), "log: {}", t.log);
    assert!(t.stopped_at.is_some());

    // Cancelling again is a no-op.
    assert_eq!(h.state.engine.cancel(&uuid).await.unwrap(), TaskStatus::Cancelled);
    assert_eq!(h.state.engine.cancel(&uuid).await.unwrap(), TaskStatus::Cancelled);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!marker.exists(), "plugin process group outlived its task");
    assert!(h.memory.is_empty());
    let archives = with_conn(&h.state.db, |c| archive::find_all(c, &ArchiveFilter::default()))
        .await
        .unwrap();
    assert!(archives.is_empty());
}

#[tokio::test]
async fn archive_expiry_is_fixed_at_creation() {
    let h = harness(test_config(), "2024-03-01T00:00:00Z");
    let target = h.target("bytes").await;
    let store = h.store().await;
    let j = h.job(&target, &store, "daily", WEEK, 50).await;

    let handle = h.state.engine.submit(task::NewTask::backup(&j, "tests")).await.unwrap();
    assert_eq!(handle.wait().await, TaskStatus::Done);

    let policy = j.retention_uuid.clone();
    with_conn(&h.state.db, move |c| retention::update_expiry(c, &policy, 86_400))
        .await
        .unwrap();

    let archives = with_conn(&h.state.db, |c| archive::find_all(c, &ArchiveFilter::default()))
        .await
        .unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].expires_at - archives[0].taken_at, WEEK);
}

#[tokio::test]
async fn archive_restores_through_the_target() {
    let h = harness(test_config(), "2024-03-01T00:00:00Z");
    let target = h.target("bytes").await;
    let store = h.store().await;
    let j = h.job(&target, &store, "daily", WEEK, 50).await;

    let handle = h.state.engine.submit(task::NewTask::backup(&j, "tests")).await.unwrap();
    assert_eq!(handle.wait().await, TaskStatus::Done);
    let archives = with_conn(&h.state.db, |c| archive::find_all(c, &ArchiveFilter::default()))
        .await
        .unwrap();
    let a = archives[0].clone();
    assert_eq!(a.compression, custodian_plugin::Compression::Zstd);

    let handle = h
        .state
        .engine
        .submit(task::NewTask::restore(&a, None, "tests"))
        .await
        .unwrap();
    let uuid = handle.uuid.clone();
    assert_eq!(handle.wait().await, TaskStatus::Done);
    assert_eq!(h.bytes.restored.lock().unwrap().as_slice(), PAYLOAD);

    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert_eq!(t.archive_uuid.as_deref(), Some(a.uuid.as_str()));
    assert_eq!(t.restore_key.as_deref(), Some(a.store_key.as_str()));
}
