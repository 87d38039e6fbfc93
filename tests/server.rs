//! Server core behavior driven through a fake radio and a recording bridge.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use uuid::Uuid;

use textbeam::bridge::TransportBridge;
use textbeam::gatt::{
    AdvertiseParams, AdvertisingController, GattServerCore, PermissionGate, ServerState,
    ServiceDefinition, StartError, CHARACTERISTIC_UUID, CCCD_UUID, SERVICE_UUID,
};
use textbeam::radio::{
    AdvertiseError, DeviceId, LinkState, NotifyError, Radio, RadioEvent, ReadError, ReadReply,
    WriteError, WriteReply,
};

const DEV_A: DeviceId = DeviceId::new([0xaa, 0x01, 0x02, 0x03, 0x04, 0x05]);
const DEV_B: DeviceId = DeviceId::new([0xbb, 0x01, 0x02, 0x03, 0x04, 0x05]);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    OpenServer,
    RegisterService,
    StartAdvertising,
    StopAdvertising,
    Notify(DeviceId, Vec<u8>),
    CloseServer,
}

#[derive(Default, Clone)]
struct FakeRadio {
    calls: Arc<Mutex<Vec<Call>>>,
    fail_open: bool,
    fail_advertising: bool,
    fail_notify: HashSet<DeviceId>,
}

impl FakeRadio {
    fn new() -> Self {
        FakeRadio::default()
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn notified(&self) -> Vec<(DeviceId, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Notify(device, value) => Some((device, value)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn open_server(&mut self) -> anyhow::Result<()> {
        if self.fail_open {
            anyhow::bail!("no adapter");
        }
        self.calls.lock().unwrap().push(Call::OpenServer);
        Ok(())
    }

    async fn register_service(&mut self, _service: &ServiceDefinition) {
        self.calls.lock().unwrap().push(Call::RegisterService);
    }

    async fn start_advertising(&mut self, _params: &AdvertiseParams) -> Result<(), AdvertiseError> {
        if self.fail_advertising {
            return Err(AdvertiseError {
                code: "data too large".to_string(),
            });
        }
        self.calls.lock().unwrap().push(Call::StartAdvertising);
        Ok(())
    }

    async fn stop_advertising(&mut self) {
        self.calls.lock().unwrap().push(Call::StopAdvertising);
    }

    async fn notify(&mut self, device: DeviceId, value: &[u8]) -> Result<(), NotifyError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Notify(device, value.to_vec()));
        if self.fail_notify.contains(&device) {
            return Err(NotifyError("link lost".to_string()));
        }
        Ok(())
    }

    async fn close_server(&mut self) {
        self.calls.lock().unwrap().push(Call::CloseServer);
    }
}

#[derive(Default, Clone)]
struct RecordingBridge {
    texts: Arc<Mutex<Vec<String>>>,
}

impl RecordingBridge {
    fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

impl TransportBridge for RecordingBridge {
    fn on_text_received(&mut self, text: &str) {
        self.texts.lock().unwrap().push(text.to_string());
    }
}

struct FixedGate(bool);

#[async_trait]
impl PermissionGate for FixedGate {
    async fn can_operate(&self) -> bool {
        self.0
    }
}

type TestCore = GattServerCore<FakeRadio, RecordingBridge, FixedGate>;

fn new_core(radio: FakeRadio, bridge: RecordingBridge, allowed: bool) -> TestCore {
    GattServerCore::new(
        ServiceDefinition::text_exchange(),
        AdvertiseParams::low_latency(SERVICE_UUID, "test".to_string()),
        radio,
        bridge,
        FixedGate(allowed),
    )
}

/// Start the server and confirm the service registration.
async fn ready_core(radio: FakeRadio, bridge: RecordingBridge) -> TestCore {
    let mut core = new_core(radio, bridge, true);
    core.start().await.unwrap();
    core.handle_event(RadioEvent::ServiceAdded { success: true })
        .await;
    assert_eq!(core.state(), ServerState::Ready);
    core
}

fn connection(device: DeviceId, state: LinkState) -> RadioEvent {
    RadioEvent::ConnectionState { device, state }
}

fn write(device: DeviceId, value: &[u8], offset: u16, reply: Option<WriteReply>) -> RadioEvent {
    RadioEvent::CharacteristicWrite {
        device,
        characteristic: CHARACTERISTIC_UUID,
        value: value.to_vec(),
        offset,
        reply,
    }
}

#[tokio::test]
async fn start_refused_without_permissions() {
    let radio = FakeRadio::new();
    let mut core = new_core(radio.clone(), RecordingBridge::default(), false);

    assert_eq!(core.start().await, Err(StartError::PermissionDenied));
    assert_eq!(core.state(), ServerState::Idle);
    // No radio state was touched.
    assert!(radio.calls().is_empty());
}

#[tokio::test]
async fn start_fails_when_server_cannot_open() {
    let mut radio = FakeRadio::new();
    radio.fail_open = true;
    let mut core = new_core(radio.clone(), RecordingBridge::default(), true);

    assert_eq!(core.start().await, Err(StartError::ServerOpenFailed));
    assert_eq!(
        core.state(),
        ServerState::Stopped(Some(StartError::ServerOpenFailed))
    );
    assert!(radio.calls().is_empty());
}

#[tokio::test]
async fn advertising_waits_for_service_confirmation() {
    let radio = FakeRadio::new();
    let mut core = new_core(radio.clone(), RecordingBridge::default(), true);

    core.start().await.unwrap();
    assert_eq!(core.state(), ServerState::Registering);
    assert_eq!(radio.calls(), vec![Call::OpenServer, Call::RegisterService]);

    core.handle_event(RadioEvent::ServiceAdded { success: true })
        .await;
    assert_eq!(core.state(), ServerState::Ready);
    assert!(core.is_advertising());
    assert_eq!(
        radio.calls(),
        vec![
            Call::OpenServer,
            Call::RegisterService,
            Call::StartAdvertising
        ]
    );
}

#[tokio::test]
async fn registration_failure_is_fatal_to_the_attempt() {
    let radio = FakeRadio::new();
    let mut core = new_core(radio.clone(), RecordingBridge::default(), true);

    core.start().await.unwrap();
    core.handle_event(RadioEvent::ServiceAdded { success: false })
        .await;

    assert_eq!(
        core.state(),
        ServerState::Stopped(Some(StartError::ServiceRegistrationFailed))
    );
    assert!(!radio.calls().contains(&Call::StartAdvertising));

    // A retry from scratch is allowed.
    core.start().await.unwrap();
    assert_eq!(core.state(), ServerState::Registering);
    assert_eq!(
        radio.calls(),
        vec![
            Call::OpenServer,
            Call::RegisterService,
            Call::OpenServer,
            Call::RegisterService
        ]
    );
}

#[tokio::test]
async fn start_is_a_noop_outside_idle_and_stopped() {
    let radio = FakeRadio::new();
    let mut core = ready_core(radio.clone(), RecordingBridge::default()).await;

    core.start().await.unwrap();
    assert_eq!(core.state(), ServerState::Ready);
    let opens = radio
        .calls()
        .iter()
        .filter(|c| **c == Call::OpenServer)
        .count();
    assert_eq!(opens, 1);
}

#[tokio::test]
async fn advertising_failure_leaves_the_server_ready() {
    let mut radio = FakeRadio::new();
    radio.fail_advertising = true;
    let bridge = RecordingBridge::default();
    let mut core = ready_core(radio.clone(), bridge.clone()).await;

    assert_eq!(core.state(), ServerState::Ready);
    assert!(!core.is_advertising());

    // Connected devices can still reach the server.
    core.handle_event(connection(DEV_A, LinkState::Connected))
        .await;
    let (reply, result) = WriteReply::channel();
    core.handle_event(write(DEV_A, b"still here", 0, Some(reply)))
        .await;
    assert_eq!(result.await.unwrap(), Ok(()));
    assert_eq!(bridge.texts(), vec!["still here"]);
}

#[tokio::test]
async fn registry_tracks_latest_connection_state() {
    let radio = FakeRadio::new();
    let mut core = ready_core(radio, RecordingBridge::default()).await;

    core.handle_event(connection(DEV_A, LinkState::Connecting))
        .await;
    assert!(core.registry().is_empty());

    core.handle_event(connection(DEV_A, LinkState::Connected))
        .await;
    core.handle_event(connection(DEV_A, LinkState::Connected))
        .await;
    core.handle_event(connection(DEV_B, LinkState::Connected))
        .await;
    assert_eq!(core.registry().len(), 2);

    core.handle_event(connection(DEV_A, LinkState::Disconnected))
        .await;
    assert_eq!(core.registry().snapshot(), vec![DEV_B]);

    // Disconnect of an unknown device is a no-op.
    core.handle_event(connection(DEV_A, LinkState::Disconnected))
        .await;
    assert_eq!(core.registry().snapshot(), vec![DEV_B]);

    core.handle_event(connection(DEV_B, LinkState::Disconnecting))
        .await;
    assert_eq!(core.registry().snapshot(), vec![DEV_B]);
    core.handle_event(connection(DEV_B, LinkState::Disconnected))
        .await;
    assert!(core.registry().is_empty());
}

#[tokio::test]
async fn accepted_write_is_forwarded_then_acknowledged_once() {
    let radio = FakeRadio::new();
    let bridge = RecordingBridge::default();
    let mut core = ready_core(radio, bridge.clone()).await;

    core.handle_event(connection(DEV_A, LinkState::Connected))
        .await;
    let (reply, result) = WriteReply::channel();
    core.handle_event(write(DEV_A, b"ping", 0, Some(reply))).await;

    assert_eq!(bridge.texts(), vec!["ping"]);
    // The oneshot resolves exactly once, success.
    assert_eq!(result.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn write_without_response_is_still_forwarded() {
    let radio = FakeRadio::new();
    let bridge = RecordingBridge::default();
    let mut core = ready_core(radio, bridge.clone()).await;

    core.handle_event(write(DEV_A, b"fire and forget", 0, None))
        .await;
    assert_eq!(bridge.texts(), vec!["fire and forget"]);
}

#[tokio::test]
async fn nonzero_offset_write_is_rejected() {
    let radio = FakeRadio::new();
    let bridge = RecordingBridge::default();
    let mut core = ready_core(radio, bridge.clone()).await;

    let (reply, result) = WriteReply::channel();
    core.handle_event(write(DEV_A, b"partial", 3, Some(reply)))
        .await;

    assert_eq!(result.await.unwrap(), Err(WriteError::NonZeroOffset));
    assert!(bridge.texts().is_empty());
}

#[tokio::test]
async fn unknown_characteristic_write_is_rejected() {
    let radio = FakeRadio::new();
    let bridge = RecordingBridge::default();
    let mut core = ready_core(radio, bridge.clone()).await;

    let (reply, result) = WriteReply::channel();
    core.handle_event(RadioEvent::CharacteristicWrite {
        device: DEV_A,
        characteristic: Uuid::from_u128(0xdead_beef),
        value: b"misdirected".to_vec(),
        offset: 0,
        reply: Some(reply),
    })
    .await;

    assert_eq!(result.await.unwrap(), Err(WriteError::UnknownCharacteristic));
    assert!(bridge.texts().is_empty());
}

#[tokio::test]
async fn invalid_utf8_is_replaced_not_dropped() {
    let radio = FakeRadio::new();
    let bridge = RecordingBridge::default();
    let mut core = ready_core(radio, bridge.clone()).await;

    let (reply, result) = WriteReply::channel();
    core.handle_event(write(DEV_A, &[0xff, b'h', b'i'], 0, Some(reply)))
        .await;

    assert_eq!(result.await.unwrap(), Ok(()));
    assert_eq!(bridge.texts(), vec!["\u{fffd}hi"]);
}

#[tokio::test]
async fn descriptor_write_is_acknowledged() {
    let radio = FakeRadio::new();
    let mut core = ready_core(radio, RecordingBridge::default()).await;

    let (reply, result) = WriteReply::channel();
    core.handle_event(RadioEvent::DescriptorWrite {
        device: DEV_A,
        descriptor: CCCD_UUID,
        offset: 0,
        reply: Some(reply),
    })
    .await;

    assert_eq!(result.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn send_fans_out_to_every_registered_device() {
    let radio = FakeRadio::new();
    let mut core = ready_core(radio.clone(), RecordingBridge::default()).await;

    core.handle_event(connection(DEV_A, LinkState::Connected))
        .await;
    core.handle_event(connection(DEV_B, LinkState::Connected))
        .await;
    core.send("hi").await;

    let mut notified = radio.notified();
    notified.sort();
    assert_eq!(
        notified,
        vec![(DEV_A, b"hi".to_vec()), (DEV_B, b"hi".to_vec())]
    );
    assert_eq!(core.read_value(), b"hi");
}

#[tokio::test]
async fn send_round_trips_through_read_value() {
    let radio = FakeRadio::new();
    let mut core = ready_core(radio, RecordingBridge::default()).await;

    core.send("héllo → 🚀").await;
    assert_eq!(core.read_value(), "héllo → 🚀".as_bytes());

    core.send("").await;
    assert_eq!(core.read_value(), b"");
}

#[tokio::test]
async fn send_with_empty_registry_still_updates_the_value() {
    let radio = FakeRadio::new();
    let mut core = ready_core(radio.clone(), RecordingBridge::default()).await;

    core.send("nobody listening").await;
    assert!(radio.notified().is_empty());
    assert_eq!(core.read_value(), b"nobody listening");
}

#[tokio::test]
async fn notification_failure_never_removes_a_device() {
    let mut radio = FakeRadio::new();
    radio.fail_notify.insert(DEV_A);
    let mut core = ready_core(radio.clone(), RecordingBridge::default()).await;

    core.handle_event(connection(DEV_A, LinkState::Connected))
        .await;
    core.handle_event(connection(DEV_B, LinkState::Connected))
        .await;
    core.send("one of these fails").await;

    assert_eq!(core.registry().len(), 2);
    // The next send still tries both.
    core.send("again").await;
    let attempts = radio
        .notified()
        .into_iter()
        .filter(|(d, _)| *d == DEV_A)
        .count();
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn send_is_dropped_unless_ready() {
    let radio = FakeRadio::new();
    let mut core = new_core(radio.clone(), RecordingBridge::default(), true);

    core.send("too early").await;
    assert!(radio.notified().is_empty());
    assert_eq!(core.read_value(), b"");
}

#[tokio::test]
async fn reads_serve_the_current_value_from_the_offset() {
    let radio = FakeRadio::new();
    let mut core = ready_core(radio, RecordingBridge::default()).await;
    core.send("hello").await;

    let (reply, result) = ReadReply::channel();
    core.handle_event(RadioEvent::CharacteristicRead {
        device: DEV_A,
        offset: 0,
        reply,
    })
    .await;
    assert_eq!(result.await.unwrap(), Ok(b"hello".to_vec()));

    let (reply, result) = ReadReply::channel();
    core.handle_event(RadioEvent::CharacteristicRead {
        device: DEV_A,
        offset: 2,
        reply,
    })
    .await;
    assert_eq!(result.await.unwrap(), Ok(b"llo".to_vec()));

    let (reply, result) = ReadReply::channel();
    core.handle_event(RadioEvent::CharacteristicRead {
        device: DEV_A,
        offset: 6,
        reply,
    })
    .await;
    assert_eq!(result.await.unwrap(), Err(ReadError::InvalidOffset));
}

#[tokio::test]
async fn connect_then_disconnect_without_writes() {
    let radio = FakeRadio::new();
    let bridge = RecordingBridge::default();
    let mut core = ready_core(radio, bridge.clone()).await;

    core.handle_event(connection(DEV_A, LinkState::Connected))
        .await;
    core.handle_event(connection(DEV_A, LinkState::Disconnected))
        .await;

    assert!(core.registry().is_empty());
    assert!(bridge.texts().is_empty());
}

#[tokio::test]
async fn stop_tears_down_and_allows_restart() {
    let radio = FakeRadio::new();
    let mut core = ready_core(radio.clone(), RecordingBridge::default()).await;

    core.handle_event(connection(DEV_A, LinkState::Connected))
        .await;
    core.stop().await;

    assert_eq!(core.state(), ServerState::Idle);
    assert!(core.registry().is_empty());
    let calls = radio.calls();
    assert!(calls.contains(&Call::StopAdvertising));
    assert!(calls.contains(&Call::CloseServer));

    core.start().await.unwrap();
    assert_eq!(core.state(), ServerState::Registering);
}

#[tokio::test]
async fn restarting_advertising_cancels_the_previous_set() {
    let mut radio = FakeRadio::new();
    let mut advertiser = AdvertisingController::new(AdvertiseParams::low_latency(
        SERVICE_UUID,
        "test".to_string(),
    ));

    advertiser.start(&mut radio).await;
    advertiser.start(&mut radio).await;

    assert_eq!(
        radio.calls(),
        vec![
            Call::StartAdvertising,
            Call::StopAdvertising,
            Call::StartAdvertising
        ]
    );
    assert!(advertiser.is_active());
}
