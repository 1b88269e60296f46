mod common;

use common::{harness, test_config, write_script};
use custodian_plugin::{Compression, Endpoint, Operation};
use custodian_server::db::connection::with_conn;
use custodian_server::error::EngineError;
use custodian_server::models::archive::{self, Archive, ArchiveFilter, ArchiveStatus, PurgeReason};
use custodian_server::models::job;
use custodian_server::models::target::{self, NewTarget};
use custodian_server::models::task::{self, NewTask, Snapshot, TaskStatus};
use std::time::Duration;

const WEEK: i64 = 604_800;

#[tokio::test]
async fn one_task_per_target_at_a_time() {
    let h = harness(test_config(), "2024-01-01T00:00:00Z");
    let target = h.target("gate").await;
    let store = h.store().await;
    let first = h.job(&target, &store, "daily", WEEK, 50).await;
    let second = h.job(&target, &store, "daily", WEEK, 50).await;

    let running = h.state.engine.submit(NewTask::backup(&first, "tests")).await.unwrap();
    let err = h.state.engine.submit(NewTask::backup(&second, "tests")).await.unwrap_err();
    assert!(matches!(err, EngineError::Busy(ref key) if key == &format!("target:{target}")));
    assert!(matches!(
        h.state.engine.submit(NewTask::backup(&first, "tests")).await,
        Err(EngineError::Busy(_))
    ));

    // A rejected submission leaves no record behind.
    let tasks = with_conn(&h.state.db, |c| task::find_all(c, None, 10)).await.unwrap();
    assert_eq!(tasks.len(), 1);

    h.gate.gate.add_permits(1);
    assert_eq!(running.wait().await, TaskStatus::Done);

    let next = h.state.engine.submit(NewTask::backup(&second, "tests")).await.unwrap();
    h.gate.gate.add_permits(1);
    assert_eq!(next.wait().await, TaskStatus::Done);
}

#[tokio::test]
async fn scheduler_prefers_urgent_jobs_and_leaves_busy_ones_due() {
    let h = harness(test_config(), "2024-01-01T01:00:00Z");
    let target = h.target("gate").await;
    let store = h.store().await;
    let relaxed = h.job(&target, &store, "daily at 2:00", WEEK, 90).await;
    let urgent = h.job(&target, &store, "daily at 2:00", WEEK, 10).await;

    assert!(h.state.scheduler.tick().await.unwrap().is_empty());
    h.clock.set(common::at("2024-01-01T02:00:00Z"));

    let mut handles = h.state.scheduler.tick().await.unwrap();
    assert_eq!(handles.len(), 1);
    let first = handles.remove(0);
    let id = first.uuid.clone();
    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &id)).await.unwrap().unwrap();
    assert_eq!(t.job_uuid.as_deref(), Some(urgent.uuid.as_str()));

    let uuid = relaxed.uuid.clone();
    let waiting = with_conn(&h.state.db, move |c| job::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert_eq!(waiting.next_run, Some(common::at("2024-01-01T02:00:00Z").timestamp()));
    assert_eq!(waiting.last_run, None);

    h.gate.gate.add_permits(1);
    assert_eq!(first.wait().await, TaskStatus::Done);

    let mut handles = h.state.scheduler.tick().await.unwrap();
    assert_eq!(handles.len(), 1);
    h.gate.gate.add_permits(1);
    assert_eq!(handles.remove(0).wait().await, TaskStatus::Done);
}

#[tokio::test]
async fn paused_jobs_are_never_scheduled() {
    let h = harness(test_config(), "2024-01-01T01:00:00Z");
    let target = h.target("bytes").await;
    let store = h.store().await;
    let j = h.job(&target, &store, "hourly at 15", WEEK, 50).await;
    let uuid = j.uuid.clone();
    with_conn(&h.state.db, move |c| job::set_paused(c, &uuid, true)).await.unwrap();

    h.clock.set(common::at("2024-01-03T00:00:00Z"));
    assert!(h.state.scheduler.tick().await.unwrap().is_empty());
    let uuid = j.uuid.clone();
    let paused = with_conn(&h.state.db, move |c| job::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert_eq!(paused.next_run, None);
}

#[tokio::test]
async fn unreachable_agent_is_retried_then_failed() {
    let config = custodian_server::config::AppConfig {
        max_task_attempts: 2,
        ..test_config()
    };
    let h = harness(config, "2024-01-01T00:00:00Z");
    let target_uuid = with_conn(&h.state.db, |c| {
        target::create(
            c,
            &NewTarget {
                name: "remote db".into(),
                plugin: "bytes".into(),
                agent: "db-host-7".into(),
                ..Default::default()
            },
        )
    })
    .await
    .unwrap()
    .uuid;
    let store = h.store().await;
    let j = h.job(&target_uuid, &store, "daily", WEEK, 50).await;

    let handle = h.state.engine.submit(NewTask::backup(&j, "tests")).await.unwrap();
    let uuid = handle.uuid.clone();
    assert_eq!(handle.wait().await, TaskStatus::Failed);

    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert_eq!(t.attempts, 2);
    assert_eq!(t.agent, "db-host-7");
    assert!(t.log.contains("unreachable after 2 attempt(s)"), "log: {}", t.log);
}

fn orphan(store_plugin: &str) -> Archive {
    Archive {
        uuid: "orphan-1".into(),
        job_uuid: None,
        target_uuid: "deleted-target".into(),
        store_uuid: "deleted-store".into(),
        store_key: "k-orphan".into(),
        taken_at: 0,
        expires_at: i64::MAX,
        notes: String::new(),
        purge_reason: None,
        status: ArchiveStatus::Valid,
        size: 10,
        compression: Compression::None,
        agent: "local".into(),
        store_plugin: store_plugin.into(),
        store_endpoint: Endpoint::new(),
        purge_failures: 0,
    }
}

#[tokio::test]
async fn orphaned_archive_purge_is_retried_until_it_succeeds() {
    let config = custodian_server::config::AppConfig {
        purge_alert_threshold: 2,
        ..test_config()
    };
    let h = harness(config, "2024-01-01T00:00:00Z");
    let healed = h.plugin_dir.join("healed");
    write_script(
        &h.plugin_dir,
        "shaky",
        &format!(
            r#"case "$1" in
  info) echo '{{"name":"shaky","author":"tests","version":"0.1","features":{{"target":false,"store":true}},"fields":[]}}' ;;
  purge) [ -f '{}' ] && exit 0; echo 'bucket unreachable' >&2; exit 2 ;;
  *) exit 10 ;;
esac"#,
            healed.display()
        ),
    );
    with_conn(&h.state.db, |c| archive::insert(c, &orphan("shaky"))).await.unwrap();

    for expected_failures in 1..=2 {
        let mut handles = h.state.retention.sweep().await.unwrap();
        assert_eq!(handles.len(), 1);
        let handle = handles.remove(0);
        let uuid = handle.uuid.clone();
        assert_eq!(handle.wait().await, TaskStatus::Failed);

        let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &uuid)).await.unwrap().unwrap();
        assert!(t.log.contains("purge of archive orphan-1 failed"), "log: {}", t.log);
        assert_eq!(t.store_plugin, "shaky");

        let a = with_conn(&h.state.db, |c| archive::find_by_id(c, "orphan-1")).await.unwrap().unwrap();
        assert_eq!(a.status, ArchiveStatus::Valid);
        assert_eq!(a.purge_failures, expected_failures);
    }

    std::fs::write(&healed, b"").unwrap();
    let mut handles = h.state.retention.sweep().await.unwrap();
    assert_eq!(handles.remove(0).wait().await, TaskStatus::Done);

    let a = with_conn(&h.state.db, |c| archive::find_by_id(c, "orphan-1")).await.unwrap().unwrap();
    assert_eq!(a.status, ArchiveStatus::Purged);
    assert_eq!(a.purge_reason.as_deref(), Some("unused"));
}

#[tokio::test]
async fn restart_fails_interrupted_tasks_and_resumes_pending_ones() {
    let h = harness(test_config(), "2024-01-01T00:00:00Z");
    let store = h.store().await;
    let now = h.clock_now();

    let (interrupted, pending) = with_conn(&h.state.db, move |c| {
        let running = task::insert(c, &NewTask::test_store(&store, "tests"), now, now + 3600)?;
        task::mark_running(
            c,
            &running.uuid,
            now,
            &Snapshot {
                agent: "local".into(),
                target_plugin: String::new(),
                target_endpoint: Endpoint::new(),
                store_plugin: "memory".into(),
                store_endpoint: Endpoint::new().set("bucket", "backups"),
                restore_key: None,
                compression: Compression::None,
            },
        )?;
        let pending = task::insert(c, &NewTask::test_store(&store, "tests"), now, now + 3600)?;
        Ok((running.uuid, pending.uuid))
    })
    .await
    .unwrap();

    let handles = h.state.engine.recover().await.unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].uuid, pending);
    for handle in handles {
        assert_eq!(handle.wait().await, TaskStatus::Done);
    }

    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &interrupted)).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.log.contains("interrupted by server restart"));
    assert!(t.stopped_at.is_some());

    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &pending)).await.unwrap().unwrap();
    assert_eq!(t.op, Operation::TestStore);
    assert_eq!(t.attempts, 1);
    assert!(h.memory.is_empty(), "test-store cleans up its probe");
}

#[tokio::test]
async fn cancel_is_idempotent_and_never_resurrects() {
    let h = harness(test_config(), "2024-01-01T00:00:00Z");
    let target = h.target("gate").await;
    let store = h.store().await;
    let j = h.job(&target, &store, "daily", WEEK, 50).await;

    let handle = h.state.engine.submit(NewTask::backup(&j, "tests")).await.unwrap();
    let uuid = handle.uuid.clone();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.state.engine.cancel(&uuid).await.unwrap(), TaskStatus::Cancelled);
    assert_eq!(handle.wait().await, TaskStatus::Cancelled);
    assert_eq!(h.state.engine.cancel(&uuid).await.unwrap(), TaskStatus::Cancelled);

    // The target is free again.
    h.gate.gate.add_permits(1);
    let next = h.state.engine.submit(NewTask::backup(&j, "tests")).await.unwrap();
    assert_eq!(next.wait().await, TaskStatus::Done);

    assert_eq!(status_of(&h, &uuid).await, TaskStatus::Cancelled);
    assert!(matches!(
        h.state.engine.cancel("no-such-task").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn purge_waits_for_a_backup_of_the_same_target() {
    let h = harness(test_config(), "2024-01-01T00:00:00Z");
    let target = h.target("gate").await;
    let store = h.store().await;
    let j = h.job(&target, &store, "daily", WEEK, 50).await;

    h.gate.gate.add_permits(1);
    let first = h.state.engine.submit(NewTask::backup(&j, "tests")).await.unwrap();
    assert_eq!(first.wait().await, TaskStatus::Done);
    let filter = ArchiveFilter {
        target: Some(target.clone()),
        ..Default::default()
    };
    let archives = with_conn(&h.state.db, move |c| archive::find_all(c, &filter)).await.unwrap();
    assert_eq!(archives.len(), 1);
    let old = archives[0].uuid.clone();

    let second = h.state.engine.submit(NewTask::backup(&j, "tests")).await.unwrap();
    let err = h.state.retention.purge(&old, PurgeReason::Manual, "tests").await.unwrap_err();
    assert!(matches!(err, EngineError::Busy(ref key) if key == &format!("target:{target}")));

    h.gate.gate.add_permits(1);
    assert_eq!(second.wait().await, TaskStatus::Done);

    let purge = h.state.retention.purge(&old, PurgeReason::Manual, "tests").await.unwrap();
    assert_eq!(purge.wait().await, TaskStatus::Done);
    let id = old.clone();
    let a = with_conn(&h.state.db, move |c| archive::find_by_id(c, &id)).await.unwrap().unwrap();
    assert_eq!(a.status, ArchiveStatus::Purged);
}

#[tokio::test]
async fn task_cancelled_while_queued_still_gets_both_timestamps() {
    let config = custodian_server::config::AppConfig {
        max_concurrent_tasks: 1,
        ..test_config()
    };
    let h = harness(config, "2024-01-01T00:00:00Z");
    let store = h.store().await;
    let busy_target = h.target("gate").await;
    let queued_target = h.target("gate").await;
    let busy = h.job(&busy_target, &store, "daily", WEEK, 50).await;
    let queued = h.job(&queued_target, &store, "daily", WEEK, 50).await;

    let running = h.state.engine.submit(NewTask::backup(&busy, "tests")).await.unwrap();
    let waiting = h.state.engine.submit(NewTask::backup(&queued, "tests")).await.unwrap();
    let uuid = waiting.uuid.clone();
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.clock.set(common::at("2024-01-01T00:05:00Z"));
    assert_eq!(h.state.engine.cancel(&uuid).await.unwrap(), TaskStatus::Cancelled);

    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Cancelled);
    assert_eq!(t.attempts, 0);
    assert_eq!(t.started_at, Some(common::at("2024-01-01T00:05:00Z").timestamp()));
    assert_eq!(t.stopped_at, t.started_at);

    h.gate.gate.add_permits(1);
    assert_eq!(running.wait().await, TaskStatus::Done);
}

#[tokio::test]
async fn tainted_archive_is_never_restored() {
    let h = harness(test_config(), "2024-01-01T00:00:00Z");
    let tainted = Archive {
        uuid: "tainted-1".into(),
        status: ArchiveStatus::Tainted,
        ..orphan("memory")
    };
    let record = tainted.clone();
    with_conn(&h.state.db, move |c| archive::insert(c, &record)).await.unwrap();

    let handle = h
        .state
        .engine
        .submit(NewTask::restore(&tainted, None, "tests"))
        .await
        .unwrap();
    let uuid = handle.uuid.clone();
    assert_eq!(handle.wait().await, TaskStatus::Failed);

    let t = with_conn(&h.state.db, move |c| task::find_by_id(c, &uuid)).await.unwrap().unwrap();
    assert!(t.log.contains("archive tainted-1 is tainted"), "log: {}", t.log);
    assert_eq!(t.attempts, 0);
    assert!(t.started_at.is_some());
    assert_eq!(t.started_at, t.stopped_at);

    let err = h
        .state
        .retention
        .purge("tainted-1", PurgeReason::Manual, "tests")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

async fn status_of(h: &common::Harness, uuid: &str) -> TaskStatus {
    let uuid = uuid.to_string();
    with_conn(&h.state.db, move |c| task::find_by_id(c, &uuid))
        .await
        .unwrap()
        .unwrap()
        .status
}
