//! Sync service driven through its handle

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pantry_core::{
    spawn_sync_service, ConflictStrategy, EntityKey, EntityType, Operation, Resolution,
    SyncConfig, SyncConfigPatch, SyncError, SyncHandle, SyncState, SyncStatus,
};
use serde_json::json;
use tempfile::TempDir;

use common::{at, engine_at, recipe, seed_synced, test_config, ScriptedRemote};

async fn wait_until(handle: &SyncHandle, condition: impl FnMut(&SyncStatus) -> bool) {
    let mut rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
        .await
        .expect("status condition not reached in time")
        .unwrap();
}

#[tokio::test]
async fn handle_runs_edits_and_cycles() {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    let handle = spawn_sync_service(engine_at(dir.path(), test_config(), &remote, true));

    handle
        .queue_recipe_change("r1", Operation::Create, Some(json!({"name": "Soup"})))
        .await
        .unwrap();
    assert_eq!(handle.status().pending_changes, 1);

    let report = handle.force_sync().await.unwrap();
    assert_eq!(report.pushed, 1);

    let status = handle.status();
    assert_eq!(status.pending_changes, 0);
    assert!(status.last_sync_time.is_some());
    assert!(!status.sync_in_progress);

    let local = handle.get(EntityKey::recipe("r1")).await.unwrap().unwrap();
    assert_eq!(local.payload.name(), Some("Soup"));
    assert_eq!(handle.list(EntityType::Recipe).await.unwrap().len(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn listeners_receive_every_snapshot() {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    let handle = spawn_sync_service(engine_at(dir.path(), test_config(), &remote, true));

    let seen: Arc<Mutex<Vec<SyncStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = handle.add_listener(move |s| sink.lock().unwrap().push(s.clone()));

    handle
        .queue_collection_change("c1", Operation::Create, Some(json!({"name": "Quick"})))
        .await
        .unwrap();
    handle.force_sync().await.unwrap();

    {
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|s| s.pending_changes == 1));
        assert!(seen.iter().any(|s| s.sync_in_progress));
        let last = seen.last().unwrap();
        assert_eq!(last.pending_changes, 0);
        assert!(!last.sync_in_progress);
    }

    assert!(handle.remove_listener(subscription.id()));
    let count = seen.lock().unwrap().len();
    handle
        .queue_collection_change("c1", Operation::Update, Some(json!({"name": "Quicker"})))
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().len(), count);

    handle.shutdown().await;
}

#[tokio::test]
async fn reconnect_starts_a_cycle() {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    let handle = spawn_sync_service(engine_at(dir.path(), test_config(), &remote, false));

    handle
        .queue_recipe_change("r1", Operation::Create, Some(json!({"name": "Soup"})))
        .await
        .unwrap();
    assert!(matches!(handle.force_sync().await, Err(SyncError::Offline)));
    assert!(remote.push_calls().is_empty());

    handle.set_online(true);
    wait_until(&handle, |s| s.is_online && s.pending_changes == 0).await;

    assert_eq!(remote.push_calls().len(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn interval_timer_starts_cycles() {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    let config = SyncConfig {
        auto_sync_enabled: true,
        sync_interval_ms: 1_000,
        ..SyncConfig::default()
    };
    let handle = spawn_sync_service(engine_at(dir.path(), config, &remote, true));

    handle
        .queue_recipe_change("r1", Operation::Create, Some(json!({"name": "Soup"})))
        .await
        .unwrap();
    wait_until(&handle, |s| s.pending_changes == 0 && s.last_sync_time.is_some()).await;

    assert_eq!(remote.push_calls().len(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn config_updates_are_validated() {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    let handle = spawn_sync_service(engine_at(dir.path(), test_config(), &remote, true));

    let err = handle
        .update_config(SyncConfigPatch {
            sync_interval_ms: Some(10),
            ..SyncConfigPatch::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));

    let config = handle
        .update_config(SyncConfigPatch {
            conflict_resolution: Some(ConflictStrategy::Remote),
            max_retries: Some(7),
            ..SyncConfigPatch::default()
        })
        .await
        .unwrap();
    assert_eq!(config.conflict_resolution, ConflictStrategy::Remote);
    assert_eq!(config.max_retries, 7);
    assert_eq!(config.sync_interval_ms, test_config().sync_interval_ms);

    handle.shutdown().await;
}

#[tokio::test]
async fn conflicts_are_resolved_through_handle() {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    seed_synced(dir.path(), &remote, recipe("r1", json!({"name": "Old"}), 1), 5);

    let mut engine = engine_at(
        dir.path(),
        SyncConfig {
            conflict_resolution: ConflictStrategy::Manual,
            ..test_config()
        },
        &remote,
        true,
    );
    engine
        .queue_change_at(
            EntityKey::recipe("r1"),
            Operation::Update,
            Some(json!({"name": "Mine"})),
            at(10),
        )
        .unwrap();
    remote.remote_edit(recipe("r1", json!({"name": "Theirs"}), 12));
    let handle = spawn_sync_service(engine);

    handle.force_pull().await.unwrap();
    let conflicts = handle.get_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(handle.status().conflicts, 1);

    handle
        .resolve_conflict(&conflicts[0].id, Resolution::Local, None)
        .await
        .unwrap();
    assert!(handle.get_conflicts().await.unwrap().is_empty());

    handle.force_push().await.unwrap();
    let server = remote.entity(&EntityKey::recipe("r1")).unwrap();
    assert_eq!(server.payload.name(), Some("Mine"));

    assert!(matches!(
        handle.resolve_conflict("missing", Resolution::Remote, None).await,
        Err(SyncError::ConflictNotFound(_))
    ));
    assert_eq!(handle.resolve_all_conflicts(Resolution::Remote).await.unwrap(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn queue_and_errors_can_be_cleared() {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    let handle = spawn_sync_service(engine_at(dir.path(), test_config(), &remote, false));

    handle
        .queue_recipe_change("r1", Operation::Create, Some(json!({"name": "Soup"})))
        .await
        .unwrap();
    assert_eq!(handle.clear_queue().await.unwrap(), 1);
    assert_eq!(handle.status().pending_changes, 0);
    assert!(handle.get(EntityKey::recipe("r1")).await.unwrap().is_some());

    assert_eq!(handle.clear_errors().await.unwrap(), 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn clear_queue_waits_for_running_cycle() {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    let handle = spawn_sync_service(engine_at(dir.path(), test_config(), &remote, true));

    handle
        .queue_recipe_change("r1", Operation::Create, Some(json!({"name": "Soup"})))
        .await
        .unwrap();
    remote.delay_next_push(Duration::from_millis(300));

    let (report, cleared) = tokio::join!(handle.force_sync(), async {
        wait_until(&handle, |s| s.state == SyncState::Pushing).await;
        let cleared = handle.clear_queue().await;
        (cleared, handle.status())
    });
    let (cleared, status_after_clear) = cleared;

    // The push went out with the record
    assert_eq!(report.unwrap().pushed, 1);
    let pushed = remote.pushed();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].key(), EntityKey::recipe("r1"));
    assert!(remote.entity(&EntityKey::recipe("r1")).is_some());

    // The clear ran after the cycle, with nothing left to drop
    assert_eq!(cleared.unwrap(), 0);
    assert!(!status_after_clear.sync_in_progress);
    assert_eq!(status_after_clear.state, SyncState::Idle);
    assert_eq!(status_after_clear.pending_changes, 0);

    handle.shutdown().await;
}
