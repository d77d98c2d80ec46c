//! End-to-end lifecycle tests for the connection state machine.
//!
//! Drives `InstanceManager` with the scriptable transport, the in-memory
//! store and the recording webhook sender. Time is paused, so backoff and
//! readiness timers run instantly and deterministically.

use futures::future::join_all;
use serde_json::json;
use session_relay::persistence::{DeliveryStatus, LogFilter, MemoryStore, PersistenceGateway};
use session_relay::retry::LinearBackoff;
use session_relay::transport::{DisconnectReason, MockTransport, TransportEvent};
use session_relay::webhook::{DeliveryError, MockSender, WebhookDispatcher};
use session_relay::{
    InitOptions, InstanceManager, InstanceStatus, ManagerSettings, NonFatalError,
    NonFatalReporter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;

const HOOK: &str = "https://hooks.example.com/relay";

// === Fixtures ===

struct Relay {
    manager: InstanceManager,
    transport: MockTransport,
    store: Arc<MemoryStore>,
    sender: MockSender,
    errors: UnboundedReceiver<NonFatalError>,
}

fn relay() -> Relay {
    let transport = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let sender = MockSender::new();
    let (reporter, errors) = NonFatalReporter::channel();

    let dispatcher = WebhookDispatcher::new(
        Arc::new(sender.clone()),
        store.clone(),
        LinearBackoff::new(Duration::from_secs(5), 3),
        reporter.clone(),
    );
    let manager = InstanceManager::new(
        Arc::new(transport.clone()),
        store.clone(),
        dispatcher,
        ManagerSettings::default(),
        reporter,
    );

    Relay {
        manager,
        transport,
        store,
        sender,
        errors,
    }
}

fn hooked() -> InitOptions {
    InitOptions {
        webhook_url: Some(HOOK.to_string()),
        force: false,
    }
}

/// Deliver an event and let the event loop process it.
async fn emit(relay: &Relay, id: &str, event: TransportEvent) {
    assert!(relay.transport.emit(id, event).await, "no live session for {}", id);
    sleep(Duration::from_millis(1)).await;
}

async fn session_logs(relay: &Relay) -> Vec<serde_json::Value> {
    let filter = LogFilter {
        event: Some("session.status".to_string()),
        ..LogFilter::default()
    };
    relay
        .store
        .query_webhook_logs(&filter)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.payload)
        .collect()
}

fn drain(errors: &mut UnboundedReceiver<NonFatalError>) -> Vec<NonFatalError> {
    let mut out = Vec::new();
    while let Ok(error) = errors.try_recv() {
        out.push(error);
    }
    out
}

// === Scenarios ===

#[tokio::test(start_paused = true)]
async fn test_qr_scan_to_ready() {
    let relay = relay();
    relay.manager.init("shop", hooked()).await.unwrap();

    emit(&relay, "shop", TransportEvent::Qr { code: "2@abc".into() }).await;
    emit(&relay, "shop", TransportEvent::Qr { code: "2@def".into() }).await;
    emit(&relay, "shop", TransportEvent::CredsUpdated).await;
    emit(
        &relay,
        "shop",
        TransportEvent::ConnectionOpened {
            user: Some("4915112345678".into()),
        },
    )
    .await;
    emit(&relay, "shop", TransportEvent::AppStateSynced).await;

    let instance = relay.manager.snapshot("shop").await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Connected);
    assert_eq!(instance.qr_code(), None);
    assert!(relay.manager.is_ready("shop").await);

    let requests = relay.sender.requests();
    let statuses: Vec<_> = requests
        .iter()
        .map(|r| r.request.body["data"]["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("qr"), json!("qr"), json!("connected")]);
    assert_eq!(requests[1].request.body["data"]["qrCode"], "2@def");
    assert_eq!(requests[2].request.body["instanceId"], "shop");

    let record = relay.store.find_instance("shop").await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Connected);
    assert_eq!(record.phone_number.as_deref(), Some("4915112345678"));
}

#[tokio::test(start_paused = true)]
async fn test_logged_out_emits_one_disconnect_and_never_reconnects() {
    let relay = relay();
    relay.manager.init("shop", hooked()).await.unwrap();
    emit(&relay, "shop", TransportEvent::ConnectionOpened { user: None }).await;

    emit(
        &relay,
        "shop",
        TransportEvent::ConnectionClosed {
            reason: DisconnectReason::from_code(401),
        },
    )
    .await;
    sleep(Duration::from_secs(300)).await;

    assert_eq!(
        relay.manager.status("shop").await,
        Some(InstanceStatus::LoggedOut)
    );
    assert_eq!(relay.transport.connect_count("shop"), 1);
    assert_eq!(relay.transport.removed_artifacts(), vec!["shop".to_string()]);

    let disconnects: Vec<_> = session_logs(&relay)
        .await
        .into_iter()
        .filter(|payload| payload["data"]["status"] == "disconnected")
        .collect();
    assert_eq!(disconnects.len(), 1);
    assert_eq!(disconnects[0]["data"]["reason"], "logged_out");
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_is_linear_and_bounded() {
    let mut relay = relay();
    relay.manager.init("shop", hooked()).await.unwrap();
    emit(
        &relay,
        "shop",
        TransportEvent::ConnectionOpened {
            user: Some("4915112345678".into()),
        },
    )
    .await;
    relay.transport.fail_next_connects(u32::MAX);

    let start = tokio::time::Instant::now();
    emit(
        &relay,
        "shop",
        TransportEvent::ConnectionClosed {
            reason: DisconnectReason::from_code(428),
        },
    )
    .await;

    let reconnecting = relay.manager.snapshot("shop").await.unwrap();
    assert_eq!(reconnecting.status(), InstanceStatus::Connecting);
    assert_eq!(reconnecting.phone_number(), None);

    // Attempts fire at 5, 15, 30, 50 and 75 seconds after the close.
    let checkpoints = [(4, 1), (6, 2), (16, 3), (31, 4), (51, 5), (76, 6)];
    for (secs, connects) in checkpoints {
        tokio::time::sleep_until(start + Duration::from_secs(secs)).await;
        assert_eq!(
            relay.transport.connect_count("shop"),
            connects,
            "connect count at {}s",
            secs
        );
    }

    let instance = relay.manager.snapshot("shop").await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Disconnected);
    assert_eq!(instance.reconnect_attempts(), 5);
    assert_eq!(instance.phone_number(), None);
    let record = relay.store.find_instance("shop").await.unwrap().unwrap();
    assert_eq!(record.phone_number, None);

    sleep(Duration::from_secs(3600)).await;
    assert_eq!(relay.transport.connect_count("shop"), 6);

    let reasons: Vec<_> = session_logs(&relay)
        .await
        .into_iter()
        .filter_map(|payload| payload["data"]["reason"].as_str().map(str::to_string))
        .collect();
    assert_eq!(reasons, vec!["reconnect_exhausted".to_string()]);

    let reconnect_errors = drain(&mut relay.errors)
        .into_iter()
        .filter(|e| matches!(e, NonFatalError::Reconnect { .. }))
        .count();
    assert_eq!(reconnect_errors, 5);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_success_resets_budget() {
    let relay = relay();
    relay.manager.init("shop", InitOptions::default()).await.unwrap();

    for _ in 0..3 {
        emit(&relay, "shop", TransportEvent::ConnectionOpened { user: None }).await;
        emit(
            &relay,
            "shop",
            TransportEvent::ConnectionClosed {
                reason: DisconnectReason::from_code(408),
            },
        )
        .await;
        assert_eq!(
            relay.manager.snapshot("shop").await.unwrap().reconnect_attempts(),
            1
        );
        sleep(Duration::from_secs(6)).await;
    }

    assert_eq!(relay.transport.connect_count("shop"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_fires_once_per_session() {
    let relay = relay();
    relay.manager.init("shop", InitOptions::default()).await.unwrap();
    emit(&relay, "shop", TransportEvent::ConnectionOpened { user: None }).await;

    sleep(Duration::from_secs(9)).await;
    assert!(!relay.manager.is_ready("shop").await);
    sleep(Duration::from_secs(2)).await;
    assert!(relay.manager.is_ready("shop").await);

    // A reconnect starts a fresh readiness window
    emit(
        &relay,
        "shop",
        TransportEvent::ConnectionClosed {
            reason: DisconnectReason::from_code(503),
        },
    )
    .await;
    assert!(!relay.manager.is_ready("shop").await);
    sleep(Duration::from_secs(6)).await;
    emit(&relay, "shop", TransportEvent::ConnectionOpened { user: None }).await;
    emit(&relay, "shop", TransportEvent::AppStateSynced).await;
    assert!(relay.manager.is_ready("shop").await);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_init_opens_one_session() {
    let relay = relay();
    let results = join_all((0..8).map(|_| relay.manager.init("shop", InitOptions::default()))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(relay.transport.connect_count("shop"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_instances_do_not_interfere() {
    let relay = relay();
    relay.manager.init("a", hooked()).await.unwrap();
    relay.manager.init("b", InitOptions::default()).await.unwrap();

    emit(&relay, "a", TransportEvent::ConnectionOpened { user: None }).await;
    emit(
        &relay,
        "b",
        TransportEvent::ConnectionClosed {
            reason: DisconnectReason::from_code(401),
        },
    )
    .await;

    assert_eq!(relay.manager.status("a").await, Some(InstanceStatus::Connected));
    assert_eq!(relay.manager.status("b").await, Some(InstanceStatus::LoggedOut));
    // Only "a" has a webhook
    assert_eq!(relay.sender.request_count(), 1);

    let ids: Vec<_> = relay
        .manager
        .list()
        .await
        .iter()
        .map(|i| i.id().to_string())
        .collect();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_pairing_code_replaces_qr() {
    let relay = relay();
    relay.manager.init("shop", hooked()).await.unwrap();
    emit(&relay, "shop", TransportEvent::Qr { code: "2@abc".into() }).await;

    let code = relay
        .manager
        .request_pairing_code("shop", "4915112345678")
        .await
        .unwrap();

    let instance = relay.manager.snapshot("shop").await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::PairingPending);
    assert_eq!(instance.pairing_code(), Some(code.as_str()));
    assert_eq!(instance.qr_code(), None);

    // Late QR refreshes from the handshake do not displace the pairing code
    emit(&relay, "shop", TransportEvent::Qr { code: "2@ghi".into() }).await;
    let instance = relay.manager.snapshot("shop").await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::PairingPending);
    assert_eq!(instance.qr_code(), None);
    assert_eq!(instance.pairing_code(), Some(code.as_str()));

    emit(
        &relay,
        "shop",
        TransportEvent::ConnectionOpened {
            user: Some("4915112345678".into()),
        },
    )
    .await;
    let instance = relay.manager.snapshot("shop").await.unwrap();
    assert!(instance.is_connected());
    assert_eq!(instance.pairing_code(), None);
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_backoff_cancels_reconnect() {
    let mut relay = relay();
    relay.manager.init("shop", hooked()).await.unwrap();
    emit(&relay, "shop", TransportEvent::ConnectionOpened { user: None }).await;
    emit(
        &relay,
        "shop",
        TransportEvent::ConnectionClosed {
            reason: DisconnectReason::from_code(500),
        },
    )
    .await;

    relay.manager.delete_instance("shop").await.unwrap();
    sleep(Duration::from_secs(120)).await;

    assert_eq!(relay.transport.connect_count("shop"), 1);
    assert!(relay.manager.snapshot("shop").await.is_none());
    assert!(relay.store.find_instance("shop").await.unwrap().is_none());
    assert!(drain(&mut relay.errors).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_webhook_failures_never_block_transitions() {
    let relay = relay();
    relay
        .sender
        .set_fallback(Err(DeliveryError::Status(503)));
    relay.manager.init("shop", hooked()).await.unwrap();

    emit(&relay, "shop", TransportEvent::Qr { code: "2@abc".into() }).await;
    emit(&relay, "shop", TransportEvent::ConnectionOpened { user: None }).await;
    assert!(relay.manager.is_connected("shop").await);
    assert_eq!(relay.manager.dispatcher().pending_retries(), 2);

    relay.manager.dispatcher().wait_idle().await;
    // 2 events x (1 attempt + 3 retries)
    assert_eq!(relay.sender.request_count(), 8);

    let rows = relay
        .store
        .query_webhook_logs(&LogFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .all(|row| row.status == DeliveryStatus::Failed && row.attempts == 4));
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_is_reported_not_raised() {
    let mut relay = relay();
    relay.store.set_unavailable(true);

    relay.manager.init("shop", hooked()).await.unwrap();
    emit(&relay, "shop", TransportEvent::ConnectionOpened { user: None }).await;

    assert!(relay.manager.is_connected("shop").await);
    // The webhook still went out even though its log row could not be written
    assert_eq!(relay.sender.request_count(), 1);

    let errors = drain(&mut relay.errors);
    assert!(!errors.is_empty());
    assert!(errors
        .iter()
        .all(|e| matches!(e, NonFatalError::Persistence { .. })));

    relay.store.set_unavailable(false);
    emit(&relay, "shop", TransportEvent::CredsUpdated).await;
    let record = relay.store.find_instance("shop").await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_active_instances() {
    let relay = relay();
    relay.manager.init("shop", hooked()).await.unwrap();
    emit(&relay, "shop", TransportEvent::ConnectionOpened { user: None }).await;
    relay.manager.init("idle", InitOptions::default()).await.unwrap();
    emit(
        &relay,
        "idle",
        TransportEvent::ConnectionClosed {
            reason: DisconnectReason::from_code(401),
        },
    )
    .await;

    // The old process goes away without logging out
    relay.manager.remove_from_memory("shop").await.unwrap();
    relay.manager.remove_from_memory("idle").await.unwrap();

    // A new process over the same store and transport
    let (reporter, _errors) = NonFatalReporter::channel();
    let dispatcher = WebhookDispatcher::new(
        Arc::new(MockSender::new()),
        relay.store.clone(),
        LinearBackoff::new(Duration::from_secs(5), 3),
        reporter.clone(),
    );
    let restarted = InstanceManager::new(
        Arc::new(relay.transport.clone()),
        relay.store.clone(),
        dispatcher,
        ManagerSettings::default(),
        reporter,
    );

    assert_eq!(restarted.restore_all().await, 2);
    assert_eq!(restarted.status("shop").await, Some(InstanceStatus::Connecting));
    assert_eq!(restarted.status("idle").await, Some(InstanceStatus::LoggedOut));
    assert_eq!(relay.transport.connect_count("shop"), 2);
    assert_eq!(relay.transport.connect_count("idle"), 1);

    let shop = restarted.snapshot("shop").await.unwrap();
    assert_eq!(shop.webhook_url(), Some(HOOK));
}
