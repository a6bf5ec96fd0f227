//! Integration tests for the sync runtime.
//!
//! Each test runs a real engine against the in-process gateway with its
//! state in a temporary directory.

use futures::StreamExt;
use laguna_sync::laguna_engine::{
    BackoffPolicy, ChangeOrigin, Error as EngineError, FailureReason, Fields, RemoteRevision,
    Replica,
};
use laguna_sync::{
    default_schema, GatewayError, MemoryGateway, Observer, Session, SyncConfig, SyncEngine,
    SyncError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Helper to build a figura payload.
fn figura(nombre: &str, precio: f64) -> Fields {
    json!({"nombre": nombre, "precio": precio})
        .as_object()
        .cloned()
        .unwrap()
}

fn session() -> Session {
    Session::sign_in("user-1", "device-1", "token")
}

/// Fast retries for tests that stay online.
fn fast_config(dir: &TempDir) -> SyncConfig {
    SyncConfig::default()
        .with_data_dir(dir.path())
        .with_retry_policy(BackoffPolicy::new(10, 50, 0.0), 10)
}

/// Retries far enough apart that nothing is retried unless connectivity is
/// restored explicitly.
fn slow_config(dir: &TempDir) -> SyncConfig {
    SyncConfig::default()
        .with_data_dir(dir.path())
        .with_retry_policy(BackoffPolicy::new(60_000, 60_000, 0.0), 10)
}

async fn start(config: &SyncConfig, session: Session, gateway: &Arc<MemoryGateway>) -> SyncEngine {
    SyncEngine::start(config, default_schema(), session, gateway.clone())
        .await
        .unwrap()
}

/// Wait until the replica satisfies `check`.
async fn settle<F>(engine: &SyncEngine, check: F)
where
    F: Fn(&Replica) -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if engine.read(|replica| check(replica)).await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "replica did not settle in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `check` holds.
async fn wait_for<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn acknowledged(replica: &Replica, key: &str) -> Option<RemoteRevision> {
    replica
        .get("figuras", key)
        .ok()
        .flatten()
        .and_then(|record| record.remote_revision.clone())
}

#[cfg(test)]
mod push_tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_write_confirmed_after_reconnect() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()).with_next_revision(7));
        gateway.set_online(false);
        let engine = start(&slow_config(&dir), session(), &gateway).await;

        let written = engine
            .create("figuras", "r1", figura("Goku", 30.5))
            .await
            .unwrap();
        assert_eq!(written.op_id.as_deref(), Some("device-1-1"));

        // Visible immediately, unconfirmed
        let record = engine.get("figuras", "r1").await.unwrap().unwrap();
        assert_eq!(record.field("nombre"), Some(&json!("Goku")));
        assert_eq!(record.remote_revision, None);

        settle(&engine, |r| {
            r.pending("figuras", "r1")
                .is_some_and(|op| op.retry_count == 1 && !op.is_in_flight())
        })
        .await;

        gateway.set_online(true);
        engine.connectivity_restored().await;

        settle(&engine, |r| r.pending_count() == 0).await;
        let record = engine.get("figuras", "r1").await.unwrap().unwrap();
        assert_eq!(record.remote_revision, Some(RemoteRevision::new("v7")));
        assert_eq!(gateway.document("figuras", "r1").unwrap().fields, figura("Goku", 30.5));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_to_one_key_fold_into_one_push() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.hold_pushes();
        let engine = start(&fast_config(&dir), session(), &gateway).await;

        engine
            .create("figuras", "r1", figura("Goku", 30.5))
            .await
            .unwrap();
        settle(&engine, |r| {
            r.pending("figuras", "r1").is_some_and(|op| op.is_in_flight())
        })
        .await;

        engine
            .update("figuras", "r1", figura("Goku SSJ", 45.0))
            .await
            .unwrap();
        engine
            .update("figuras", "r1", figura("Goku SSJ3", 60.0))
            .await
            .unwrap();
        assert_eq!(engine.pending_count().await, 1);

        gateway.release_pushes();
        settle(&engine, |r| r.pending_count() == 0).await;

        // The first push plus one for the folded updates
        assert_eq!(gateway.push_count(), 2);
        let document = gateway.document("figuras", "r1").unwrap();
        assert_eq!(document.fields, figura("Goku SSJ3", 60.0));
        assert_eq!(document.revision, RemoteRevision::new("v2"));

        let record = engine.get("figuras", "r1").await.unwrap().unwrap();
        assert_eq!(record.field("nombre"), Some(&json!("Goku SSJ3")));
        assert_eq!(record.remote_revision, Some(RemoteRevision::new("v2")));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_create_is_purged_and_reported() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.deny_writes("figuras", "permission denied");
        let engine = start(&fast_config(&dir), session(), &gateway).await;
        let mut failures = engine.failures();
        let mut changes = engine.observe_collection("figuras");

        engine
            .create("figuras", "r9", figura("Freezer", 25.0))
            .await
            .unwrap();

        let failure = tokio::time::timeout(TIMEOUT, failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.operation.key, "r9");
        assert_eq!(
            failure.reason,
            FailureReason::Rejected("permission denied".into())
        );

        assert!(engine.get("figuras", "r9").await.unwrap().is_none());
        assert_eq!(engine.pending_count().await, 0);

        // The feed shows the purge after the optimistic write coalesced away
        let change = changes.next().await.unwrap();
        assert_eq!(change.origin, ChangeOrigin::Rollback);
        assert!(change.is_purge());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_update_rolls_back_to_confirmed_state() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &gateway).await;
        let mut failures = engine.failures();

        engine
            .create("figuras", "r5", figura("Vegeta", 40.0))
            .await
            .unwrap();
        settle(&engine, |r| acknowledged(r, "r5").is_some()).await;

        gateway.deny_writes("figuras", "read only");
        engine
            .update("figuras", "r5", figura("Vegeta Blue", 80.0))
            .await
            .unwrap();

        let failure = tokio::time::timeout(TIMEOUT, failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.reason, FailureReason::Rejected("read only".into()));

        let record = engine.get("figuras", "r5").await.unwrap().unwrap();
        assert_eq!(record.fields, figura("Vegeta", 40.0));
        assert_eq!(record.remote_revision, Some(RemoteRevision::new("v1")));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.set_online(false);
        let config = SyncConfig::default()
            .with_data_dir(dir.path())
            .with_retry_policy(BackoffPolicy::new(5, 10, 0.0), 2);
        let engine = start(&config, session(), &gateway).await;
        let mut failures = engine.failures();

        engine
            .create("figuras", "r1", figura("Krilin", 10.0))
            .await
            .unwrap();

        let failure = tokio::time::timeout(TIMEOUT, failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.reason, FailureReason::RetriesExhausted);
        assert_eq!(failure.operation.retry_count, 3);
        assert!(engine.get("figuras", "r1").await.unwrap().is_none());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_write_is_refused_locally() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &gateway).await;

        let missing_precio = json!({"nombre": "Bulma"}).as_object().cloned().unwrap();
        let err = engine
            .create("figuras", "r1", missing_precio)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = engine
            .update("figuras", "missing", figura("Yamcha", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Engine(EngineError::RecordNotFound(_))
        ));

        assert_eq!(engine.pending_count().await, 0);
        assert_eq!(gateway.push_count(), 0);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_of_unconfirmed_record_never_reaches_remote() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.set_online(false);
        let engine = start(&slow_config(&dir), session(), &gateway).await;

        engine
            .create("figuras", "r1", figura("Gohan", 20.0))
            .await
            .unwrap();
        settle(&engine, |r| {
            r.pending("figuras", "r1")
                .is_some_and(|op| !op.is_in_flight() && op.retry_count == 1)
        })
        .await;

        let deleted = engine.delete("figuras", "r1").await.unwrap();
        assert_eq!(deleted.op_id, None);
        assert_eq!(engine.pending_count().await, 0);

        gateway.set_online(true);
        engine.connectivity_restored().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(gateway.document("figuras", "r1").is_none());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_generated_keys_are_unique() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &gateway).await;

        let (first, _) = engine
            .create_with_generated_key("figuras", figura("Piccolo", 15.0))
            .await
            .unwrap();
        let (second, _) = engine
            .create_with_generated_key("figuras", figura("Piccolo", 15.0))
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(engine.list("figuras").await.records.len(), 2);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_held_push() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.hold_pushes();
        let engine = start(&fast_config(&dir), session(), &gateway).await;

        engine.create("figuras", "r1", figura("Goku", 30.5)).await.unwrap();
        settle(&engine, |r| {
            r.pending("figuras", "r1").is_some_and(|op| op.is_in_flight())
        })
        .await;

        tokio::time::timeout(TIMEOUT, engine.shutdown())
            .await
            .unwrap()
            .unwrap();

        // The interrupted push does not resume behind the stopped engine
        gateway.release_pushes();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.push_count(), 0);

        let restarted = start(&fast_config(&dir), session(), &gateway).await;
        assert_eq!(restarted.startup_report().pending_operations, 1);
        settle(&restarted, |r| r.pending_count() == 0).await;
        assert!(gateway.document("figuras", "r1").is_some());

        restarted.shutdown().await.unwrap();
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::*;

    #[tokio::test]
    async fn test_remote_change_reaches_observers() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &gateway).await;
        let mut changes = engine.observe_collection("notificaciones");

        let fields = json!({"titulo": "Nueva figura", "mensaje": "Llegó Goku"})
            .as_object()
            .cloned()
            .unwrap();
        gateway.inject_remote("notificaciones", "n1", Some(fields.clone()));

        let change = tokio::time::timeout(TIMEOUT, changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert_eq!(change.key, "n1");
        assert_eq!(change.record.unwrap().fields, fields);

        settle(&engine, |r| {
            r.cursor("notificaciones").map(|c| c.as_str()) == Some("1")
        })
        .await;

        gateway.inject_remote("notificaciones", "n1", None);
        let change = tokio::time::timeout(TIMEOUT, changes.next())
            .await
            .unwrap()
            .unwrap();
        assert!(change.is_purge());
        assert!(engine.get("notificaciones", "n1").await.unwrap().is_none());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_change_waits_behind_pending_write() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &gateway).await;

        engine
            .create("figuras", "r2", figura("Cell", 35.0))
            .await
            .unwrap();
        settle(&engine, |r| acknowledged(r, "r2").is_some()).await;

        gateway.hold_pushes();
        engine
            .update("figuras", "r2", figura("Cell Perfecto", 50.0))
            .await
            .unwrap();
        settle(&engine, |r| {
            r.pending("figuras", "r2").is_some_and(|op| op.is_in_flight())
        })
        .await;

        let remote = gateway.inject_remote("figuras", "r2", Some(figura("Cell Imperfecto", 5.0)));
        assert_eq!(remote, RemoteRevision::new("v2"));
        settle(&engine, |r| r.deferred("figuras", "r2").is_some()).await;

        // Local state wins while the write is unconfirmed
        let record = engine.get("figuras", "r2").await.unwrap().unwrap();
        assert_eq!(record.field("nombre"), Some(&json!("Cell Perfecto")));

        gateway.release_pushes();
        settle(&engine, |r| {
            r.pending_count() == 0 && r.deferred_count() == 0
        })
        .await;

        // The acknowledged revision is newer than the held remote change
        let record = engine.get("figuras", "r2").await.unwrap().unwrap();
        assert_eq!(record.field("nombre"), Some(&json!("Cell Perfecto")));
        assert_eq!(record.remote_revision, Some(RemoteRevision::new("v3")));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_from_cursor_after_reconnect() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&slow_config(&dir), session(), &gateway).await;

        gateway.inject_remote("figuras", "a", Some(figura("Trunks", 22.0)));
        settle(&engine, |r| r.cursor("figuras").is_some()).await;

        gateway.set_online(false);
        gateway.inject_remote("figuras", "b", Some(figura("Goten", 18.0)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.get("figuras", "b").await.unwrap().is_none());

        gateway.set_online(true);
        engine.connectivity_restored().await;

        settle(&engine, |r| {
            r.get("figuras", "b").ok().flatten().is_some()
        })
        .await;
        assert_eq!(
            engine.read(|r| r.cursor("figuras").cloned()).await.unwrap().as_str(),
            "2"
        );

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreground_refresh_restarts_subscriptions() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &gateway).await;

        let usuario = |email: &str, rol: &str| {
            json!({"email": email, "rol": rol})
                .as_object()
                .cloned()
                .unwrap()
        };

        gateway.inject_remote("usuarios", "u1", Some(usuario("bulma@capsule.corp", "admin")));
        settle(&engine, |r| r.cursor("usuarios").is_some()).await;

        engine.foreground_refresh();
        gateway.inject_remote("usuarios", "u2", Some(usuario("chichi@monte.fry", "cliente")));

        settle(&engine, |r| r.query("usuarios").count() == 2).await;

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_denied_subscription_stops_until_refresh() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.deny_subscriptions("figuras", "missing read permission");
        let engine = start(&fast_config(&dir), session(), &gateway).await;
        let stopped = engine.stopped_subscriptions();

        wait_for(|| stopped.borrow().contains_key("figuras")).await;
        assert_eq!(
            stopped.borrow()["figuras"],
            GatewayError::Denied("missing read permission".into())
        );

        // Other collections keep syncing
        let aviso = json!({"titulo": "Aviso", "mensaje": "Nuevo stock"})
            .as_object()
            .cloned()
            .unwrap();
        gateway.inject_remote("notificaciones", "n1", Some(aviso));
        settle(&engine, |r| {
            r.get("notificaciones", "n1").ok().flatten().is_some()
        })
        .await;

        gateway.inject_remote("figuras", "a", Some(figura("Trunks", 22.0)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.get("figuras", "a").await.unwrap().is_none());
        assert_eq!(stopped.borrow().len(), 1);

        gateway.allow_subscriptions("figuras");
        engine.foreground_refresh();

        settle(&engine, |r| r.get("figuras", "a").ok().flatten().is_some()).await;
        wait_for(|| stopped.borrow().is_empty()).await;

        engine.shutdown().await.unwrap();
    }
}

#[cfg(test)]
mod observer_tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_observer_gets_latest_state() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.set_online(false);
        let engine = start(&slow_config(&dir), session(), &gateway).await;
        let mut changes = engine.observe_collection("figuras");

        engine
            .create("figuras", "r1", figura("Majin Buu", 55.0))
            .await
            .unwrap();
        engine
            .update("figuras", "r1", figura("Super Buu", 65.0))
            .await
            .unwrap();
        engine
            .update("figuras", "r1", figura("Kid Buu", 75.0))
            .await
            .unwrap();

        assert_eq!(Observer::buffered(&changes), 1);
        let change = changes.next().await.unwrap();
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert_eq!(
            change.record.unwrap().field("nombre"),
            Some(&json!("Kid Buu"))
        );

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_observe_with_snapshot() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.set_online(false);
        let engine = start(&slow_config(&dir), session(), &gateway).await;

        engine.create("figuras", "r1", figura("Goku", 30.5)).await.unwrap();
        engine.create("figuras", "r2", figura("Vegeta", 40.0)).await.unwrap();
        engine
            .create(
                "notificaciones",
                "n1",
                json!({"titulo": "Hola", "mensaje": "Mundo"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();

        let mut changes = engine
            .observe_with_snapshot(|change| change.collection == "figuras")
            .await;

        let first = changes.next().await.unwrap();
        let second = changes.next().await.unwrap();
        assert_eq!(first.origin, ChangeOrigin::Snapshot);
        assert_eq!(second.origin, ChangeOrigin::Snapshot);
        assert_eq!((first.key.as_str(), second.key.as_str()), ("r1", "r2"));
        assert!(first.seq < second.seq);

        engine.create("figuras", "r3", figura("Gohan", 20.0)).await.unwrap();
        let third = changes.next().await.unwrap();
        assert_eq!(third.origin, ChangeOrigin::Local);
        assert_eq!(third.key, "r3");
        assert!(third.seq > second.seq);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_observer_stops_receiving() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.set_online(false);
        let engine = start(&slow_config(&dir), session(), &gateway).await;

        let mut changes = engine.observe(|_| true);
        changes.cancel();

        engine.create("figuras", "r1", figura("Goku", 30.5)).await.unwrap();
        assert!(changes.next().await.is_none());

        engine.shutdown().await.unwrap();
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();

        let offline = Arc::new(MemoryGateway::new(session()));
        offline.set_online(false);
        let engine = start(&slow_config(&dir), session(), &offline).await;
        engine.create("figuras", "r1", figura("Goku", 30.5)).await.unwrap();
        engine.create("figuras", "r2", figura("Vegeta", 40.0)).await.unwrap();
        engine.shutdown().await.unwrap();

        // Damage one record and drop its queued push
        let path = dir.path().join(laguna_sync::storage::STATE_FILE);
        let mut state: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        state["collections"]["figuras"]["r2"] = json!("garbage");
        state["pending"]
            .as_array_mut()
            .unwrap()
            .retain(|op| op["key"] != "r2");
        std::fs::write(&path, state.to_string()).unwrap();

        let online = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &online).await;

        let report = engine.startup_report();
        assert!(report.restored);
        assert_eq!(report.pending_operations, 1);
        assert_eq!(report.corrupt_records.len(), 1);
        assert_eq!(report.corrupt_records[0].key, "r2");

        settle(&engine, |r| r.pending_count() == 0).await;
        assert!(acknowledged_record(&engine, "r1").await);
        assert!(online.document("figuras", "r1").is_some());

        // Reads of the damaged record fail; the rest of the store works
        let err = engine.get("figuras", "r2").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Engine(EngineError::StorageCorruption { .. })
        ));
        let listing = engine.list("figuras").await;
        assert_eq!(listing.records.len(), 1);
        assert_eq!(listing.records[0].key, "r1");
        assert_eq!(listing.corrupt.len(), 1);
        assert_eq!(listing.corrupt[0].key, "r2");

        // A full replacement repairs it
        engine.put("figuras", "r2", figura("Vegeta", 41.0)).await.unwrap();
        settle(&engine, |r| acknowledged(r, "r2").is_some()).await;
        let listing = engine.list("figuras").await;
        assert_eq!(listing.records.len(), 2);
        assert!(listing.corrupt.is_empty());

        engine.shutdown().await.unwrap();
    }

    async fn acknowledged_record(engine: &SyncEngine, key: &str) -> bool {
        engine.read(|r| acknowledged(r, key).is_some()).await
    }

    #[tokio::test]
    async fn test_unreadable_state_file_is_set_aside() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(laguna_sync::storage::STATE_FILE), "not json").unwrap();

        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &gateway).await;

        let report = engine.startup_report();
        assert!(!report.restored);
        let quarantined = report.quarantined.clone().unwrap();
        assert!(quarantined.exists());

        engine.create("figuras", "r1", figura("Goku", 30.5)).await.unwrap();
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_from_other_schema_version_is_set_aside() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.set_online(false);
        let engine = start(&slow_config(&dir), session(), &gateway).await;
        engine.create("figuras", "r1", figura("Goku", 30.5)).await.unwrap();
        engine.shutdown().await.unwrap();

        let mut schema = default_schema();
        schema.version += 1;
        let engine = SyncEngine::start(&slow_config(&dir), schema, session(), gateway.clone())
            .await
            .unwrap();

        let report = engine.startup_report();
        assert!(!report.restored);
        assert!(report
            .quarantine_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("schema version")));

        // The queued write is kept in the moved file, not in the new replica
        let quarantined = report.quarantined.clone().unwrap();
        let kept = std::fs::read_to_string(&quarantined).unwrap();
        assert!(kept.contains("device-1-1"));
        assert_eq!(engine.pending_count().await, 0);
        assert!(engine.get("figuras", "r1").await.unwrap().is_none());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sign_out_stops_engine() {
        let dir = TempDir::new().unwrap();
        let session = session();
        let gateway = Arc::new(MemoryGateway::new(session.clone()));
        let engine = start(&fast_config(&dir), session.clone(), &gateway).await;
        let mut changes = engine.observe(|_| true);

        session.sign_out();

        wait_for(|| !engine.is_running()).await;
        let err = engine
            .create("figuras", "r1", figura("Goku", 30.5))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ShutDown));
        assert!(
            tokio::time::timeout(TIMEOUT, changes.next())
                .await
                .unwrap()
                .is_none()
        );

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_active_session() {
        let dir = TempDir::new().unwrap();
        let session = session();
        session.sign_out();
        let gateway = Arc::new(MemoryGateway::new(session.clone()));

        let err = SyncEngine::start(&fast_config(&dir), default_schema(), session, gateway)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionClosed));
    }

    #[tokio::test]
    async fn test_shutdown_keeps_queued_writes() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        gateway.set_online(false);
        let engine = start(&slow_config(&dir), session(), &gateway).await;

        engine.create("figuras", "r1", figura("Goku", 30.5)).await.unwrap();
        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());

        let restarted = start(&slow_config(&dir), session(), &gateway).await;
        let op = restarted.pending("figuras", "r1").await.unwrap();
        assert_eq!(op.op_id, "device-1-1");
        // Restarted with the revision counter where it left off
        let next = restarted
            .create("figuras", "r2", figura("Vegeta", 40.0))
            .await
            .unwrap();
        assert_eq!(next.local_revision, 2);

        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_right_after_start() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(MemoryGateway::new(session()));
        let engine = start(&fast_config(&dir), session(), &gateway).await;

        // No yield between start and shutdown: the workers have not run yet
        tokio::time::timeout(TIMEOUT, engine.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert!(!engine.is_running());
    }
}
