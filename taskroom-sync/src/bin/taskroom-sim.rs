//! Scripted walk through an offline session against the in-memory remote.
//!
//! Usage: taskroom-sim [--config PATH] [--json]
//! Without a config file the default settings are used.

use std::sync::Arc;
use std::time::Duration;

use taskroom_core::{ConfigError, SessionId, SyncConfig, TaskStatus, TaskroomResult};
use taskroom_sync::{init_tracing, MemoryRemoteStore, NetworkMonitor, OfflineEngine};

#[tokio::main]
async fn main() -> TaskroomResult<()> {
    let json = std::env::args().any(|arg| arg == "--json");
    init_tracing(json);

    let config = match SyncConfig::load() {
        Ok(config) => config,
        Err(ConfigError::MissingConfigPath) => {
            tracing::warn!("No config file given, using defaults");
            SyncConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkMonitor::new(true);
    let engine = OfflineEngine::open(config, remote.clone(), network.clone()).await?;

    let session_id = SessionId::parse(format!("sim-{}", std::process::id()))?;
    engine.initialize(session_id.clone()).await?;
    let _tasks = engine.on_tasks_changed(|tasks| {
        tracing::info!(count = tasks.len(), "Task list changed");
    });
    let _status = engine.on_sync_status_changed(|status| {
        tracing::info!(
            online = status.is_online,
            pending = status.pending_count,
            syncing = status.is_syncing,
            "Sync status changed"
        );
    });

    engine.join("Sim Participant").await?;
    engine
        .record_status("t1", TaskStatus::InProgress, None)
        .await?;

    network.set_online(false);
    engine
        .record_status("t1", TaskStatus::Completed, Some("offline".to_string()))
        .await?;
    engine
        .record_status("t2", TaskStatus::NeedsHelp, None)
        .await?;
    tracing::info!(status = ?engine.sync_status().await?, "Recorded while offline");

    network.set_online(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = engine.drain_now().await?;
    tracing::info!(?report, "Drained pending operations");

    match engine.finalize_session(&session_id).await? {
        Some(record) => tracing::info!(
            label = %record.anonymized_label,
            duration_ms = record.duration_ms,
            tasks = record.per_task_metrics.len(),
            retain_until = %record.retain_until,
            "Finalized session"
        ),
        None => tracing::warn!("Nothing to finalize"),
    }

    Ok(())
}
