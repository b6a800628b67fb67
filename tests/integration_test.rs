//! Integration tests for the full chat flow between two endpoints.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rfcomm_chat::bluetooth::{
    Address, AllowAll, Capability, Device, MemoryAir, MemoryRadio, PermissionCheck,
    SessionSettings, SERVICE_UUID,
};
use rfcomm_chat::{BluetoothController, ChatError, Config, ConnectionEvent, ConnectionEvents};

async fn controller(radio: &MemoryRadio, permissions: Arc<dyn PermissionCheck>) -> BluetoothController {
    BluetoothController::new(
        Arc::new(radio.clone()),
        permissions,
        SessionSettings::default(),
    )
    .await
}

async fn next_event(events: &mut ConnectionEvents) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no connection event")
        .expect("event channel closed")
}

fn endpoints() -> (MemoryRadio, MemoryRadio) {
    let air = MemoryAir::new();
    (
        air.radio("AA:AA:AA:AA:AA:01".parse().unwrap(), "Phone A"),
        air.radio("BB:BB:BB:BB:BB:02".parse().unwrap(), "Phone B"),
    )
}

#[tokio::test]
async fn test_end_to_end_chat() {
    let (a, b) = endpoints();
    let host_a = controller(&a, Arc::new(AllowAll)).await;
    let host_b = controller(&b, Arc::new(AllowAll)).await;

    let mut b_events = host_b.start_server().await.unwrap();
    let mut a_events = host_a.connect_to_device(&b.device()).unwrap();

    assert_eq!(
        next_event(&mut a_events).await,
        ConnectionEvent::Established { device: b.device() }
    );
    assert_eq!(
        next_event(&mut b_events).await,
        ConnectionEvent::Established { device: a.device() }
    );
    // exactly one event per attempt
    assert!(a_events.recv().await.is_none());
    assert!(b_events.recv().await.is_none());

    assert!(host_a.is_connected());
    assert_eq!(*host_a.last_connected_device().borrow(), Some(b.device()));
    assert!(!b.is_listening(SERVICE_UUID));

    let mut b_log = host_b.subscribe_messages().unwrap();
    let sent = host_a.try_send_message("hi").await.unwrap();
    assert!(sent.is_local);
    assert_eq!(sent.body, "hi");

    let snapshot = tokio::time::timeout(Duration::from_secs(1), b_log.next())
        .await
        .unwrap()
        .unwrap();
    let received = snapshot.last().unwrap();
    assert!(!received.is_local);
    assert_eq!(received.body, "hi");
    assert_eq!(received.sender, "Phone A");
}

#[tokio::test]
async fn test_connect_without_permission() {
    let (a, b) = endpoints();
    let no_connect = Arc::new(|cap: Capability| cap == Capability::Scan);
    let host_a = controller(&a, no_connect).await;
    let host_b = controller(&b, Arc::new(AllowAll)).await;
    let _b_events = host_b.start_server().await.unwrap();
    let mut errors = host_a.errors();

    assert_eq!(
        host_a.connect_to_device(&b.device()).unwrap_err(),
        ChatError::PermissionDenied(Capability::Connect)
    );
    assert!(!host_a.is_connected());
    assert!(host_b.subscribe_messages().is_err());
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_peer_drop_ends_receive() {
    let (a, b) = endpoints();
    let host_a = controller(&a, Arc::new(AllowAll)).await;
    let host_b = controller(&b, Arc::new(AllowAll)).await;

    let mut b_events = host_b.start_server().await.unwrap();
    let mut a_events = host_a.connect_to_device(&b.device()).unwrap();
    assert!(next_event(&mut a_events).await.is_established());
    assert!(next_event(&mut b_events).await.is_established());

    let mut b_log = host_b.subscribe_messages().unwrap();
    let mut b_connected = host_b.connected();
    let mut b_errors = host_b.errors();

    drop(host_a);

    let end = tokio::time::timeout(Duration::from_secs(1), b_log.next())
        .await
        .unwrap();
    assert!(end.is_none());
    b_connected.wait_for(|c| !*c).await.unwrap();
    assert!(matches!(
        b_errors.recv().await.unwrap(),
        ChatError::TransferFailed(_)
    ));

    // B can serve again
    let _again = host_b.start_server().await.unwrap();
    assert!(b.is_listening(SERVICE_UUID));
}

#[tokio::test]
async fn test_concurrent_attempts_are_rejected() {
    let (a, b) = endpoints();
    let host_a = controller(&a, Arc::new(AllowAll)).await;

    let _listening = host_a.start_server().await.unwrap();
    assert_eq!(
        host_a.connect_to_device(&b.device()).unwrap_err(),
        ChatError::Busy
    );

    host_a.close_connection();
    host_a.close_connection();
    let _listening = host_a.start_server().await.unwrap();
}

#[tokio::test]
async fn test_discovery_then_connect() {
    let (a, b) = endpoints();
    let host_a = controller(&a, Arc::new(AllowAll)).await;
    let host_b = controller(&b, Arc::new(AllowAll)).await;
    let _b_events = host_b.start_server().await.unwrap();

    let mut scanned = host_a.scanned_devices();
    let mut scanning = host_a.scanning();
    host_a.start_discovery().await;
    scanning.wait_for(|s| *s).await.unwrap();
    let found: Vec<Device> = scanned
        .wait_for(|d| !d.is_empty())
        .await
        .unwrap()
        .clone();
    assert_eq!(found, vec![b.device()]);

    let mut events = host_a.connect_to_device(&found[0]).unwrap();
    assert!(next_event(&mut events).await.is_established());
    scanning.wait_for(|s| !*s).await.unwrap();
    assert_eq!(a.discovery_cancels(), 1);
    // results survive the implicit stop
    assert_eq!(scanned.borrow().len(), 1);
}

#[tokio::test]
async fn test_configured_settings_drive_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[bluetooth]\nservice_name = \"bench\"\nconnect_timeout_ms = 50\n",
    )
    .unwrap();
    let config = Config::load_from(&path).unwrap();

    let air = MemoryAir::new();
    let a = air.radio(Address::new([1; 6]), "a");
    let b = air.radio(Address::new([2; 6]), "b");
    let host_a =
        BluetoothController::new(Arc::new(a.clone()), Arc::new(AllowAll), config.session_settings())
            .await;
    let host_b =
        BluetoothController::new(Arc::new(b.clone()), Arc::new(AllowAll), config.session_settings())
            .await;
    let _b_events = host_b.start_server().await.unwrap();
    b.stall();

    let mut events = host_a.connect_to_device(&b.device()).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Error(ChatError::Timeout.to_string())
    );
}
