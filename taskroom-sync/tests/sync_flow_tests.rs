//! End-to-end coordinator behavior against the in-memory remote.

use std::time::Duration;

use serde_json::json;
use taskroom_core::{Clock, TaskStatus};
use taskroom_sync::{CoordinatorState, DrainOutcome};
use taskroom_test_utils::assertions::*;
use taskroom_test_utils::fixtures::*;
use taskroom_test_utils::{eventually, record_status, record_tasks, Harness};

fn task_status(doc: &serde_json::Value, task: &str) -> serde_json::Value {
    doc["taskStatusMap"][task]["status"].clone()
}

#[tokio::test]
async fn test_offline_write_is_queued_then_replayed() {
    let h = Harness::start().await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();
    h.wait_for_status("first snapshot", |st| !st.is_syncing).await;

    h.network.set_online(false);
    assert!(h
        .engine
        .record_status("t1", TaskStatus::InProgress, None)
        .await
        .unwrap());
    let status = h
        .wait_for_status("offline with one pending", |st| !st.is_online)
        .await;
    assert_eq!(status.pending_count, 1);
    assert!(h.remote_live(&s).unwrap().get("taskStatusMap").is_none());

    h.network.set_online(true);
    h.wait_for_status("drained", |st| st.is_online && st.pending_count == 0)
        .await;
    let doc = h.remote_live(&s).unwrap();
    assert_eq!(task_status(&doc, "t1"), json!("in_progress"));
    assert_eq!(doc["currentTaskId"], json!("t1"));
}

#[tokio::test]
async fn test_online_write_goes_straight_to_remote() {
    let h = Harness::start().await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();
    h.engine
        .record_status("t1", TaskStatus::Completed, Some("easy".to_string()))
        .await
        .unwrap();

    assert_eq!(h.pending_count().await, 0);
    let doc = h.remote_live(&s).unwrap();
    assert_eq!(task_status(&doc, "t1"), json!("completed"));
    assert_eq!(doc["taskStatusMap"]["t1"]["comment"], json!("easy"));
}

#[tokio::test]
async fn test_observers_share_one_subscription() {
    let h = Harness::start().await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();

    let (first, first_guard) = record_tasks(&h.engine);
    let (second, second_guard) = record_tasks(&h.engine);
    h.engine
        .record_status("t1", TaskStatus::Completed, None)
        .await
        .unwrap();

    let sees_t1 = |tasks: Option<Vec<taskroom_core::Task>>| {
        tasks.is_some_and(|tasks| {
            tasks
                .iter()
                .any(|t| t.task_id.as_str() == "t1" && t.status == TaskStatus::Completed)
        })
    };
    eventually("both observers see t1", || {
        sees_t1(first.last()) && sees_t1(second.last())
    })
    .await;
    assert_eq!(h.remote.subscriptions_opened(), 1);

    drop(first_guard);
    drop(second_guard);
    eventually("subscription closed", || h.remote.active_subscriptions() == 0).await;

    let (third, _third_guard) = record_tasks(&h.engine);
    eventually("subscription reopened", || {
        h.remote.subscriptions_opened() == 2 && h.remote.active_subscriptions() == 1
    })
    .await;
    eventually("new observer gets current list", || sees_t1(third.last())).await;
}

#[tokio::test]
async fn test_drain_is_fifo_and_stops_at_first_failure() {
    let h = Harness::start().await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();
    h.wait_for_status("first snapshot", |st| !st.is_syncing).await;

    h.network.set_online(false);
    h.wait_for_status("offline", |st| !st.is_online).await;
    for (task, status) in [
        ("t1", TaskStatus::InProgress),
        ("t2", TaskStatus::Completed),
        ("t3", TaskStatus::NeedsHelp),
    ] {
        h.engine.record_status(task, status, None).await.unwrap();
    }
    assert_eq!(h.pending_count().await, 3);

    h.remote.reject_writes_touching("taskStatusMap.t2.");
    h.network.set_online(true);
    h.wait_for_status("first drain pass", |st| {
        st.is_online && !st.is_syncing && st.pending_count == 2
    })
    .await;

    let doc = h.remote_live(&s).unwrap();
    assert_eq!(task_status(&doc, "t1"), json!("in_progress"));
    assert!(doc["taskStatusMap"].get("t2").is_none());
    assert!(doc["taskStatusMap"].get("t3").is_none());

    let queued = h.engine.context().queue.list_for_session(&s).await.unwrap();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].target_id(), "t2");
    assert_eq!(queued[0].retry_count, 1);
    assert_eq!(queued[1].target_id(), "t3");

    h.remote.clear_rejections();
    let report = h.engine.drain_now().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Completed);
    assert_eq!(report.replayed, 2);
    assert_eq!(report.remaining, 0);

    let replayed: Vec<String> = h
        .remote
        .writes()
        .iter()
        .filter_map(|w| w.fields.get("currentTaskId"))
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    assert_eq!(replayed, vec!["t1", "t2", "t3"]);
}

#[tokio::test(start_paused = true)]
async fn test_hung_write_times_out_into_queue() {
    let h = Harness::start().await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();

    h.remote.set_hang_writes(true);
    assert!(h
        .engine
        .record_status("t1", TaskStatus::InProgress, None)
        .await
        .unwrap());
    assert_eq!(h.pending_count().await, 1);

    h.remote.set_hang_writes(false);
    let report = h.engine.drain_now().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Completed);
    assert_eq!(task_status(&h.remote_live(&s).unwrap(), "t1"), json!("in_progress"));
}

#[tokio::test]
async fn test_teardown_mid_drain_keeps_unacknowledged_operation() {
    let mut config = fast_config();
    config.write_timeout_ms = 60_000;
    let h = Harness::with_config(config).await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();
    h.wait_for_status("first snapshot", |st| !st.is_syncing).await;

    h.network.set_online(false);
    h.wait_for_status("offline", |st| !st.is_online).await;
    h.engine
        .record_status("t1", TaskStatus::Completed, None)
        .await
        .unwrap();

    let (statuses, _guard) = record_status(&h.engine);
    // Registration must land before the hung drain occupies the coordinator.
    h.engine.sync_status().await.unwrap();
    h.remote.set_hang_writes(true);
    h.network.set_online(true);
    eventually("drain started", || {
        statuses
            .last()
            .is_some_and(|st| st.is_online && st.is_syncing && st.pending_count == 1)
    })
    .await;

    h.engine.destroy().await.unwrap();
    assert_eq!(h.engine.state().await.unwrap(), CoordinatorState::TornDown);
    assert_eq!(h.engine.context().queue.count_for_session(&s).await.unwrap(), 1);

    h.remote.set_hang_writes(false);
    h.engine.initialize(s.clone()).await.unwrap();
    h.wait_for_status("replayed after re-initialize", |st| st.pending_count == 0)
        .await;
    assert_eq!(task_status(&h.remote_live(&s).unwrap(), "t1"), json!("completed"));
}

#[tokio::test]
async fn test_write_not_accepted_when_queue_cannot_persist() {
    let h = Harness::start().await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();
    h.wait_for_status("first snapshot", |st| !st.is_syncing).await;

    h.network.set_online(false);
    h.wait_for_status("offline", |st| !st.is_online).await;
    h.backend.set_fail_writes(true);
    assert!(!h
        .engine
        .record_status("t1", TaskStatus::InProgress, None)
        .await
        .unwrap());
    assert_eq!(h.pending_count().await, 0);

    h.backend.set_fail_writes(false);
    assert!(h
        .engine
        .record_status("t2", TaskStatus::Completed, None)
        .await
        .unwrap());
    assert_eq!(h.pending_count().await, 1);
}

#[tokio::test]
async fn test_subscription_held_until_first_snapshot() {
    let h = Harness::start().await;
    let s = session("s1");
    h.remote.set_available(false);

    let (_tasks, guard) = record_tasks(&h.engine);
    h.engine.initialize(s.clone()).await.unwrap();
    assert!(matches!(
        h.engine.state().await.unwrap(),
        CoordinatorState::Initializing { .. }
    ));
    drop(guard);
    h.engine.sync_status().await.unwrap();
    assert_eq!(h.remote.active_subscriptions(), 1);

    h.remote.set_available(true);
    h.wait_for_status("first snapshot", |st| !st.is_syncing).await;
    assert!(matches!(
        h.engine.state().await.unwrap(),
        CoordinatorState::Subscribed { .. }
    ));
    eventually("subscription released", || h.remote.active_subscriptions() == 0).await;
}

#[tokio::test]
async fn test_misuse_is_reported() {
    let h = Harness::start().await;
    let s1 = session("s1");

    assert_not_initialized(&h.engine.record_status("t1", TaskStatus::Completed, None).await);
    assert_not_initialized(&h.engine.force_reload_from_cache().await);
    assert_not_initialized(&h.engine.forget_me().await);
    assert_invalid_session_id(&h.engine.initialize(session("a/b")).await);
    assert_invalid_session_id(&h.engine.initialize(session("")).await);

    h.engine.initialize(s1.clone()).await.unwrap();
    h.engine.initialize(s1.clone()).await.unwrap();
    assert_session_conflict(&h.engine.initialize(session("s2")).await, &s1);

    assert_invalid_task_id(&h.engine.record_status("", TaskStatus::Completed, None).await);
    assert_invalid_task_id(&h.engine.record_status("a.b", TaskStatus::Completed, None).await);
    assert_eq!(h.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_pause_after_repeated_failures() {
    let mut config = fast_config();
    config.heartbeat_interval_ms = 1_000;
    config.heartbeat_max_failures = 3;
    let h = Harness::with_config(config).await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();

    let heartbeats = || {
        h.remote
            .writes()
            .iter()
            .filter(|w| w.fields.len() == 1 && w.fields.contains_key("lastSeenAt"))
            .count()
    };

    h.remote.set_available(false);
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.remote.set_available(true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(heartbeats(), 0);

    h.network.set_online(false);
    h.wait_for_status("offline", |st| !st.is_online).await;
    h.network.set_online(true);
    h.wait_for_status("online", |st| st.is_online).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(heartbeats() >= 1);
}

#[tokio::test]
async fn test_cached_tasks_survive_restart_without_network() {
    let h = Harness::start().await;
    let s = session("s1");
    seed_remote(
        &h.remote,
        &live_state(&s, "Ada", h.clock.now(), &[("t1", TaskStatus::NeedsHelp)]),
    );
    let (seen, guard) = record_tasks(&h.engine);
    h.engine.initialize(s.clone()).await.unwrap();
    eventually("remote list delivered", || seen.last().is_some_and(|t| t.len() == 1)).await;
    drop(guard);
    h.engine.destroy().await.unwrap();

    h.remote.set_available(false);
    h.network.set_online(false);
    let restarted = h.restart().await;
    let (tasks, _guard) = record_tasks(&restarted.engine);
    restarted.engine.initialize(s.clone()).await.unwrap();

    eventually("cached list delivered", || tasks.last().is_some_and(|t| t.len() == 1)).await;
    let cached = restarted.engine.force_reload_from_cache().await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].task_id.as_str(), "t1");
    assert_eq!(cached[0].status, TaskStatus::NeedsHelp);
}

#[tokio::test]
async fn test_forget_me_erases_local_session_data() {
    let h = Harness::start().await;
    let s = session("s1");
    h.engine.initialize(s.clone()).await.unwrap();
    h.engine.join("Ada").await.unwrap();
    h.network.set_online(false);
    h.engine
        .record_status("t1", TaskStatus::InProgress, None)
        .await
        .unwrap();

    h.engine.forget_me().await.unwrap();
    assert_eq!(h.engine.state().await.unwrap(), CoordinatorState::TornDown);
    assert_eq!(h.engine.context().queue.count_for_session(&s).await.unwrap(), 0);
    let cached: Vec<taskroom_core::Task> = h
        .engine
        .context()
        .store
        .get_collection(&taskroom_sync::context::tasks_store_name(&s))
        .await;
    assert!(cached.is_empty());
}
