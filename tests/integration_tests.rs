//! Integration tests for the IngeLight session layer
//!
//! Every scenario drives a real `SessionManager` through the in-memory radio:
//! commands are observed with `next_command()`, adapter events are injected
//! with `emit()`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use ingelight::ble::{
    AdapterError, AdapterState, CharacteristicDescriptor, CharacteristicProperties,
    CharacteristicSession, ConnectionState, DeviceSession, MockRadio, RadioCommand, RadioEvent,
    ScanFilter, ServiceDescriptor, SessionError, SessionManager, WriteMode,
};
use ingelight::config::SessionConfig;
use uuid::Uuid;

const LIGHT_SERVICE: Uuid = Uuid::from_u128(0x0000_ff00_0000_1000_8000_0080_5f9b_34fb);
const BRIGHTNESS: Uuid = Uuid::from_u128(0x0000_ff01_0000_1000_8000_0080_5f9b_34fb);
const COLOR: Uuid = Uuid::from_u128(0x0000_ff02_0000_1000_8000_0080_5f9b_34fb);

fn manual_config() -> SessionConfig {
    SessionConfig {
        auto_discover_characteristics: false,
        ..SessionConfig::default()
    }
}

async fn powered_manager(config: SessionConfig) -> (Arc<MockRadio>, SessionManager) {
    let radio = MockRadio::powered_on();
    let manager = SessionManager::new(radio.clone(), config);
    manager
        .adapter_state()
        .wait_for(|state| state.is_ready())
        .await
        .unwrap();
    (radio, manager)
}

async fn discover(radio: &MockRadio, manager: &SessionManager, id: &str, rssi: i16) -> DeviceSession {
    radio.emit(RadioEvent::DeviceDiscovered {
        id: id.to_string(),
        name: Some("IngeLight".to_string()),
        rssi,
    });
    manager
        .discovered_devices()
        .wait_for(|devices| devices.iter().any(|d| d.id() == id))
        .await
        .unwrap();
    manager.device(id).unwrap()
}

async fn connect(radio: &MockRadio, manager: &SessionManager, id: &str) -> DeviceSession {
    let task = tokio::spawn({
        let manager = manager.clone();
        let id = id.to_string();
        async move { manager.connect(&id).await }
    });
    assert_eq!(radio.next_command().await, Some(RadioCommand::Connect(id.to_string())));
    radio.emit(RadioEvent::Connected { id: id.to_string() });
    task.await.unwrap().unwrap()
}

/// Connected device "A" with one service holding BRIGHTNESS and COLOR
async fn light_session(radio: &MockRadio, manager: &SessionManager) -> (DeviceSession, CharacteristicSession) {
    discover(radio, manager, "A", -40).await;
    let device = connect(radio, manager, "A").await;

    let discovery = tokio::spawn({
        let device = device.clone();
        async move { device.discover_services().await }
    });
    assert_eq!(
        radio.next_command().await,
        Some(RadioCommand::DiscoverServices("A".to_string()))
    );
    radio.emit(RadioEvent::ServicesDiscovered {
        id: "A".to_string(),
        services: vec![ServiceDescriptor {
            uuid: LIGHT_SERVICE,
            is_primary: true,
        }],
        error: None,
    });
    assert_eq!(discovery.await.unwrap().unwrap().len(), 1);

    let service = device.require_service(LIGHT_SERVICE).unwrap();
    let discovery = tokio::spawn(async move { service.discover_characteristics().await });
    assert_eq!(
        radio.next_command().await,
        Some(RadioCommand::DiscoverCharacteristics {
            device: "A".to_string(),
            service: LIGHT_SERVICE,
        })
    );
    radio.emit(characteristics_discovered());
    assert_eq!(discovery.await.unwrap().unwrap().len(), 2);

    let brightness = manager.characteristic("A", LIGHT_SERVICE, BRIGHTNESS).unwrap();
    (device, brightness)
}

fn characteristics_discovered() -> RadioEvent {
    RadioEvent::CharacteristicsDiscovered {
        id: "A".to_string(),
        service: LIGHT_SERVICE,
        characteristics: vec![
            CharacteristicDescriptor::new(
                BRIGHTNESS,
                CharacteristicProperties::READ
                    | CharacteristicProperties::WRITE
                    | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
                    | CharacteristicProperties::NOTIFY,
            ),
            CharacteristicDescriptor::new(COLOR, CharacteristicProperties::WRITE),
        ],
        error: None,
    }
}

fn value_updated(value: &[u8]) -> RadioEvent {
    RadioEvent::ValueUpdated {
        id: "A".to_string(),
        service: LIGHT_SERVICE,
        characteristic: BRIGHTNESS,
        value: Some(value.to_vec()),
        error: None,
    }
}

fn read_command() -> Option<RadioCommand> {
    Some(RadioCommand::Read {
        device: "A".to_string(),
        service: LIGHT_SERVICE,
        characteristic: BRIGHTNESS,
    })
}

#[tokio::test]
async fn test_scan_connect_scenario() {
    let (radio, manager) = powered_manager(manual_config()).await;

    manager.start_scanning(None).await.unwrap();
    assert_eq!(
        radio.next_command().await,
        Some(RadioCommand::Scan(ScanFilter {
            services: Vec::new(),
            allow_duplicates: false,
        }))
    );
    assert!(manager.is_scanning().current());

    discover(&radio, &manager, "A", -40).await;
    let devices = manager.discovered_devices().current();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id(), "A");
    assert_eq!(devices[0].name().as_deref(), Some("IngeLight"));

    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("A").await }
    });
    assert_eq!(radio.next_command().await, Some(RadioCommand::StopScan));
    assert_eq!(radio.next_command().await, Some(RadioCommand::Connect("A".to_string())));
    radio.emit(RadioEvent::Connected { id: "A".to_string() });

    let device = task.await.unwrap().unwrap();
    assert_eq!(device.state(), ConnectionState::Connected);
    let connected = manager.connected_device().current().unwrap();
    assert!(connected.same_session(&device));
    assert!(!manager.is_scanning().current());
}

#[tokio::test]
async fn test_discovery_deduplicates_and_tracks_rssi() {
    let (radio, manager) = powered_manager(manual_config()).await;

    radio.emit(RadioEvent::DeviceDiscovered {
        id: "A".to_string(),
        name: None,
        rssi: -40,
    });
    radio.emit(RadioEvent::DeviceDiscovered {
        id: "A".to_string(),
        name: Some("IngeLight".to_string()),
        rssi: -55,
    });
    radio.emit(RadioEvent::DeviceDiscovered {
        id: "B".to_string(),
        name: None,
        rssi: -70,
    });

    let devices = manager
        .discovered_devices()
        .wait_for(|devices| devices.len() == 2)
        .await
        .unwrap();
    assert_eq!(devices[0].id(), "A");
    assert_eq!(devices[1].id(), "B");
    assert_eq!(devices[0].rssi().current(), -55);
    assert_eq!(devices[0].name().as_deref(), Some("IngeLight"));
    assert_eq!(manager.stats().known_devices, 2);
}

#[tokio::test]
async fn test_connect_unknown_device_issues_no_command() {
    let (radio, manager) = powered_manager(manual_config()).await;

    let result = manager.connect("ghost").await;
    assert_eq!(result.unwrap_err(), SessionError::UnknownDevice("ghost".to_string()));
    assert!(radio.commands().is_empty());
    assert!(manager.last_error().current().is_some());
}

#[tokio::test]
async fn test_scan_requires_powered_adapter() {
    let radio = MockRadio::new();
    let manager = SessionManager::new(radio.clone(), manual_config());

    assert_eq!(
        manager.start_scanning(None).await,
        Err(SessionError::AdapterNotReady(AdapterState::Unknown))
    );
    assert!(radio.commands().is_empty());

    // stop is unconditional
    manager.stop_scanning().await;
    assert_eq!(radio.commands(), vec![RadioCommand::StopScan]);
}

#[tokio::test]
async fn test_connecting_second_device_disconnects_first() {
    let (radio, manager) = powered_manager(manual_config()).await;
    discover(&radio, &manager, "A", -40).await;
    discover(&radio, &manager, "B", -50).await;
    let a = connect(&radio, &manager, "A").await;

    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("B").await }
    });
    assert_eq!(radio.next_command().await, Some(RadioCommand::Disconnect("A".to_string())));
    assert_eq!(a.state(), ConnectionState::Disconnecting);
    radio.emit(RadioEvent::Disconnected {
        id: "A".to_string(),
        error: None,
    });
    assert_eq!(radio.next_command().await, Some(RadioCommand::Connect("B".to_string())));
    radio.emit(RadioEvent::Connected { id: "B".to_string() });

    let b = task.await.unwrap().unwrap();
    assert_eq!(a.state(), ConnectionState::Disconnected);
    assert_eq!(b.state(), ConnectionState::Connected);
    assert_eq!(manager.stats().connected_device.as_deref(), Some("B"));
}

#[tokio::test]
async fn test_second_connect_while_connecting_is_rejected() {
    let (radio, manager) = powered_manager(manual_config()).await;
    discover(&radio, &manager, "A", -40).await;
    discover(&radio, &manager, "B", -50).await;

    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("A").await }
    });
    assert_eq!(radio.next_command().await, Some(RadioCommand::Connect("A".to_string())));

    assert_eq!(
        manager.connect("B").await.unwrap_err(),
        SessionError::ConnectionInProgress("A".to_string())
    );
    assert_eq!(
        manager.disconnect("A").await.unwrap_err(),
        SessionError::InvalidState {
            device: "A".to_string(),
            operation: "disconnect",
            state: ConnectionState::Connecting,
        }
    );

    radio.emit(RadioEvent::Connected { id: "A".to_string() });
    task.await.unwrap().unwrap();
    assert_eq!(radio.commands().len(), 1);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    let (radio, manager) = powered_manager(manual_config()).await;
    discover(&radio, &manager, "A", -40).await;

    let (first, second, _) = tokio::join!(manager.connect("A"), manager.connect("A"), async {
        assert_eq!(radio.next_command().await, Some(RadioCommand::Connect("A".to_string())));
        radio.emit(RadioEvent::Connected { id: "A".to_string() });
    });
    assert!(first.unwrap().same_session(&second.unwrap()));
    assert_eq!(radio.commands(), vec![RadioCommand::Connect("A".to_string())]);

    // already connected resolves without a command
    manager.connect("A").await.unwrap();
    assert_eq!(radio.commands().len(), 1);
}

#[tokio::test]
async fn test_connect_failure_returns_to_disconnected() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let device = discover(&radio, &manager, "A", -40).await;

    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("A").await }
    });
    assert_eq!(radio.next_command().await, Some(RadioCommand::Connect("A".to_string())));
    radio.emit(RadioEvent::ConnectFailed {
        id: "A".to_string(),
        error: Some(AdapterError::Platform("out of range".to_string())),
    });

    assert_eq!(
        task.await.unwrap().unwrap_err(),
        SessionError::TransportRejected {
            operation: "connect",
            source: AdapterError::Platform("out of range".to_string()),
        }
    );
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(manager.connected_device().current().is_none());
}

#[tokio::test]
async fn test_connect_timeout_rolls_back() {
    let config = SessionConfig {
        connect_timeout_ms: Some(50),
        ..manual_config()
    };
    let (radio, manager) = powered_manager(config).await;
    let device = discover(&radio, &manager, "A", -40).await;

    assert_eq!(
        manager.connect("A").await.unwrap_err(),
        SessionError::OperationTimedOut("connect")
    );
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(
        radio.commands(),
        vec![
            RadioCommand::Connect("A".to_string()),
            RadioCommand::Disconnect("A".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_joined_connect_times_out_with_the_attempt() {
    let config = SessionConfig {
        connect_timeout_ms: Some(50),
        ..manual_config()
    };
    let (radio, manager) = powered_manager(config).await;
    discover(&radio, &manager, "A", -40).await;

    let (first, second) = tokio::join!(manager.connect("A"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.connect("A").await
    });
    assert_eq!(first.unwrap_err(), SessionError::OperationTimedOut("connect"));
    assert_eq!(second.unwrap_err(), SessionError::OperationTimedOut("connect"));

    let connects = radio
        .commands()
        .into_iter()
        .filter(|c| matches!(c, RadioCommand::Connect(_)))
        .count();
    assert_eq!(connects, 1);
}

#[tokio::test]
async fn test_disconnect_waits_for_event() {
    let (radio, manager) = powered_manager(manual_config()).await;
    discover(&radio, &manager, "A", -40).await;
    let device = connect(&radio, &manager, "A").await;

    let task = tokio::spawn({
        let device = device.clone();
        async move { device.disconnect().await }
    });
    assert_eq!(radio.next_command().await, Some(RadioCommand::Disconnect("A".to_string())));
    radio.emit(RadioEvent::Disconnected {
        id: "A".to_string(),
        error: None,
    });
    task.await.unwrap().unwrap();

    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(manager.connected_device().current().is_none());
    // disconnected already: no further command
    manager.disconnect("A").await.unwrap();
    assert_eq!(radio.commands().len(), 2);
}

#[tokio::test]
async fn test_reads_resolve_in_order() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (_device, brightness) = light_session(&radio, &manager).await;

    let first = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());
    let second = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());

    radio.emit(value_updated(&[1]));
    radio.emit(value_updated(&[2]));

    assert_eq!(first.await.unwrap().unwrap(), Some(vec![1]));
    assert_eq!(second.await.unwrap().unwrap(), Some(vec![2]));
    assert_eq!(brightness.value().current(), Some(vec![2]));
}

#[tokio::test]
async fn test_read_ignores_previously_cached_value() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (_device, brightness) = light_session(&radio, &manager).await;

    radio.emit(value_updated(&[7]));
    brightness
        .value()
        .wait_for(|value| value.as_deref() == Some(&[7][..]))
        .await
        .unwrap();

    let read = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());
    radio.emit(value_updated(&[8]));
    assert_eq!(read.await.unwrap().unwrap(), Some(vec![8]));
}

#[tokio::test]
async fn test_failed_read_keeps_cached_value() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (_device, brightness) = light_session(&radio, &manager).await;
    radio.emit(value_updated(&[5]));
    brightness.value().wait_for(|v| v.is_some()).await.unwrap();

    let read = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());
    radio.emit(RadioEvent::ValueUpdated {
        id: "A".to_string(),
        service: LIGHT_SERVICE,
        characteristic: BRIGHTNESS,
        value: None,
        error: Some(AdapterError::Rejected("insufficient authorization".to_string())),
    });

    assert!(matches!(
        read.await.unwrap(),
        Err(SessionError::TransportRejected { operation: "read", .. })
    ));
    assert_eq!(brightness.value().current(), Some(vec![5]));
}

#[tokio::test]
async fn test_read_timeout_then_recovers() {
    let config = SessionConfig {
        operation_timeout_ms: Some(50),
        ..manual_config()
    };
    let (radio, manager) = powered_manager(config).await;
    let (_device, brightness) = light_session(&radio, &manager).await;

    assert_eq!(
        brightness.read().await,
        Err(SessionError::OperationTimedOut("read"))
    );
    assert_eq!(radio.next_command().await, read_command());
    assert_eq!(
        manager.last_error().current().as_deref(),
        Some("read timed out")
    );

    let read = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());

    // late reply to the timed-out read, then the reply to the new one
    radio.emit(value_updated(&[0xaa]));
    radio.emit(value_updated(&[0xbb]));
    assert_eq!(read.await.unwrap().unwrap(), Some(vec![0xbb]));
    assert_eq!(manager.stats().stale_events_dropped, 1);
}

#[tokio::test]
async fn test_cancelled_read_discards_its_reply() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (_device, brightness) = light_session(&radio, &manager).await;

    let cancelled = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());
    cancelled.abort();
    assert!(cancelled.await.unwrap_err().is_cancelled());

    let read = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());

    radio.emit(value_updated(&[0xaa]));
    radio.emit(value_updated(&[0xbb]));
    assert_eq!(read.await.unwrap().unwrap(), Some(vec![0xbb]));
    assert_eq!(manager.stats().stale_events_dropped, 1);
    assert_eq!(brightness.value().current(), Some(vec![0xbb]));
}

#[tokio::test]
async fn test_value_stream_sees_every_update() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (_device, brightness) = light_session(&radio, &manager).await;
    let values = brightness.value().into_stream();

    radio.emit(value_updated(&[1]));
    radio.emit(value_updated(&[2]));
    radio.emit(value_updated(&[3]));

    let seen: Vec<Option<Vec<u8>>> = values.take(4).collect().await;
    assert_eq!(seen, vec![None, Some(vec![1]), Some(vec![2]), Some(vec![3])]);
}

#[tokio::test]
async fn test_write_modes() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (_device, brightness) = light_session(&radio, &manager).await;

    brightness.write(&[0x10], WriteMode::WithoutResponse).await.unwrap();
    assert!(matches!(
        radio.next_command().await,
        Some(RadioCommand::Write { mode: WriteMode::WithoutResponse, .. })
    ));

    let mut write = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.write(&[0x20], WriteMode::WithResponse).await }
    });
    assert_eq!(
        radio.next_command().await,
        Some(RadioCommand::Write {
            device: "A".to_string(),
            service: LIGHT_SERVICE,
            characteristic: BRIGHTNESS,
            data: vec![0x20],
            mode: WriteMode::WithResponse,
        })
    );
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut write)
        .await
        .is_err());

    radio.emit(RadioEvent::WriteCompleted {
        id: "A".to_string(),
        service: LIGHT_SERVICE,
        characteristic: BRIGHTNESS,
        error: None,
    });
    write.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_write_is_reported() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (_device, _brightness) = light_session(&radio, &manager).await;
    let color = manager.characteristic("A", LIGHT_SERVICE, COLOR).unwrap();

    radio.fail_next_command(AdapterError::Rejected("busy".to_string()));
    assert_eq!(
        color.write(&[1, 2, 3], WriteMode::WithResponse).await,
        Err(SessionError::TransportRejected {
            operation: "write",
            source: AdapterError::Rejected("busy".to_string()),
        })
    );
}

#[tokio::test]
async fn test_notify_resolves_on_issue() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (_device, brightness) = light_session(&radio, &manager).await;

    brightness.set_notify(true).await.unwrap();
    assert!(matches!(
        radio.next_command().await,
        Some(RadioCommand::SetNotify { enabled: true, .. })
    ));
    assert!(!brightness.is_notifying().current());

    radio.emit(RadioEvent::NotifyStateChanged {
        id: "A".to_string(),
        service: LIGHT_SERVICE,
        characteristic: BRIGHTNESS,
        is_notifying: true,
        error: None,
    });
    brightness.is_notifying().wait_for(|on| *on).await.unwrap();

    let mut values = brightness.value();
    radio.emit(value_updated(&[0x42]));
    assert_eq!(values.changed().await.unwrap(), Some(vec![0x42]));
}

#[tokio::test]
async fn test_rediscovery_keeps_characteristic_sessions() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (device, brightness) = light_session(&radio, &manager).await;
    let mut values = brightness.value();

    let service = device.require_service(LIGHT_SERVICE).unwrap();
    let (rediscovered, _) = tokio::join!(service.discover_characteristics(), async {
        radio.next_command().await;
        radio.emit(characteristics_discovered());
    });
    let rediscovered = rediscovered.unwrap();
    assert_eq!(rediscovered.len(), 2);
    assert!(rediscovered[0].same_session(&brightness));

    radio.emit(value_updated(&[9]));
    assert_eq!(values.changed().await.unwrap(), Some(vec![9]));
}

#[tokio::test]
async fn test_concurrent_service_discovery_issues_one_command() {
    let (radio, manager) = powered_manager(manual_config()).await;
    discover(&radio, &manager, "A", -40).await;
    let device = connect(&radio, &manager, "A").await;

    let (first, second, _) = tokio::join!(device.discover_services(), device.discover_services(), async {
        assert_eq!(
            radio.next_command().await,
            Some(RadioCommand::DiscoverServices("A".to_string()))
        );
        radio.emit(RadioEvent::ServicesDiscovered {
            id: "A".to_string(),
            services: vec![ServiceDescriptor {
                uuid: LIGHT_SERVICE,
                is_primary: true,
            }],
            error: None,
        });
    });

    assert_eq!(first.unwrap().len(), 1);
    assert_eq!(second.unwrap().len(), 1);
    let discoveries = radio
        .commands()
        .into_iter()
        .filter(|c| matches!(c, RadioCommand::DiscoverServices(_)))
        .count();
    assert_eq!(discoveries, 1);
}

#[tokio::test]
async fn test_services_trigger_characteristic_discovery() {
    let (radio, manager) = powered_manager(SessionConfig::default()).await;
    discover(&radio, &manager, "A", -40).await;
    let device = connect(&radio, &manager, "A").await;

    let (services, _) = tokio::join!(device.discover_services(), async {
        radio.next_command().await;
        radio.emit(RadioEvent::ServicesDiscovered {
            id: "A".to_string(),
            services: vec![ServiceDescriptor {
                uuid: LIGHT_SERVICE,
                is_primary: true,
            }],
            error: None,
        });
    });
    assert_eq!(services.unwrap().len(), 1);

    assert_eq!(
        radio.next_command().await,
        Some(RadioCommand::DiscoverCharacteristics {
            device: "A".to_string(),
            service: LIGHT_SERVICE,
        })
    );
    radio.emit(characteristics_discovered());
    let service = device.require_service(LIGHT_SERVICE).unwrap();
    let characteristics = service
        .characteristics()
        .wait_for(|list| list.len() == 2)
        .await
        .unwrap();
    assert_eq!(characteristics[0].uuid(), BRIGHTNESS);
    assert_eq!(characteristics[1].uuid(), COLOR);
}

#[tokio::test]
async fn test_link_loss_keeps_caches() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (device, brightness) = light_session(&radio, &manager).await;

    let read = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());

    radio.emit(RadioEvent::Disconnected {
        id: "A".to_string(),
        error: Some(AdapterError::LinkLost),
    });
    assert_eq!(read.await.unwrap(), Err(SessionError::SessionNotAvailable));

    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(manager.connected_device().current().is_none());
    assert_eq!(device.services().current().len(), 1);
    let cached = manager.characteristic("A", LIGHT_SERVICE, BRIGHTNESS).unwrap();
    assert!(cached.same_session(&brightness));

    assert_eq!(brightness.read().await, Err(SessionError::SessionNotAvailable));
}

#[tokio::test]
async fn test_power_loss_drops_connection() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let (device, brightness) = light_session(&radio, &manager).await;
    manager.start_scanning(None).await.unwrap();
    assert!(matches!(radio.next_command().await, Some(RadioCommand::Scan(_))));

    let read = tokio::spawn({
        let brightness = brightness.clone();
        async move { brightness.read().await }
    });
    assert_eq!(radio.next_command().await, read_command());

    radio.emit(RadioEvent::PowerStateChanged(AdapterState::PoweredOff));
    assert_eq!(read.await.unwrap(), Err(SessionError::SessionNotAvailable));

    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(!manager.is_scanning().current());
    assert_eq!(
        manager.start_scanning(None).await,
        Err(SessionError::AdapterNotReady(AdapterState::PoweredOff))
    );
    assert_eq!(manager.stats().connected_device, None);
}

#[tokio::test]
async fn test_stale_events_are_dropped() {
    let (radio, manager) = powered_manager(manual_config()).await;

    radio.emit(RadioEvent::ValueUpdated {
        id: "ghost".to_string(),
        service: LIGHT_SERVICE,
        characteristic: BRIGHTNESS,
        value: Some(vec![1]),
        error: None,
    });
    radio.emit(RadioEvent::Connected {
        id: "ghost".to_string(),
    });
    discover(&radio, &manager, "A", -40).await;

    assert_eq!(manager.stats().stale_events_dropped, 2);
    assert!(manager.last_error().current().is_none());
}

#[tokio::test]
async fn test_unrequested_connected_event_keeps_current_connection() {
    let (radio, manager) = powered_manager(manual_config()).await;
    discover(&radio, &manager, "A", -40).await;
    let b = discover(&radio, &manager, "B", -50).await;
    let a = connect(&radio, &manager, "A").await;

    radio.emit(RadioEvent::Connected { id: "B".to_string() });
    discover(&radio, &manager, "C", -60).await;

    assert_eq!(manager.stats().stale_events_dropped, 1);
    assert_eq!(b.state(), ConnectionState::Disconnected);
    assert_eq!(a.state(), ConnectionState::Connected);
    assert_eq!(manager.stats().connected_device.as_deref(), Some("A"));
    assert_eq!(radio.commands(), vec![RadioCommand::Connect("A".to_string())]);
}

#[tokio::test]
async fn test_gatt_requires_connection() {
    let (radio, manager) = powered_manager(manual_config()).await;
    let device = discover(&radio, &manager, "A", -40).await;

    assert_eq!(
        device.discover_services().await.unwrap_err(),
        SessionError::SessionNotAvailable
    );
    assert_eq!(
        manager.characteristic("A", LIGHT_SERVICE, BRIGHTNESS).unwrap_err(),
        SessionError::UnknownService {
            device: "A".to_string(),
            service: LIGHT_SERVICE,
        }
    );
    assert!(radio.commands().is_empty());
}
