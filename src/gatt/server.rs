use std::fmt;

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::TransportBridge;
use crate::gatt::{
    AdvertiseParams, AdvertisingController, DeviceRegistry, NotificationDispatcher,
    PermissionGate, ServiceDefinition,
};
use crate::radio::{
    DeviceId, LinkState, Radio, RadioEvent, ReadError, ReadReply, WriteError, WriteReply,
};

/// Lifecycle of one server start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Starting,
    Registering,
    Ready,
    Stopped(Option<StartError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    PermissionDenied,
    ServerOpenFailed,
    ServiceRegistrationFailed,
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::PermissionDenied => write!(f, "bluetooth permissions missing"),
            StartError::ServerOpenFailed => write!(f, "unable to open gatt server"),
            StartError::ServiceRegistrationFailed => write!(f, "service registration failed"),
        }
    }
}

impl std::error::Error for StartError {}

/// The GATT server core: owns the service definition, the connected device
/// registry and the advertising controller, and drives them from the single
/// queue of [`RadioEvent`]s.
pub struct GattServerCore<R, B, G> {
    radio: R,
    bridge: B,
    gate: G,
    service: ServiceDefinition,
    state: ServerState,
    registry: DeviceRegistry,
    advertiser: AdvertisingController,
    dispatcher: NotificationDispatcher,
}

impl<R, B, G> GattServerCore<R, B, G>
where
    R: Radio,
    B: TransportBridge,
    G: PermissionGate,
{
    pub fn new(
        service: ServiceDefinition,
        advertise: AdvertiseParams,
        radio: R,
        bridge: B,
        gate: G,
    ) -> Self {
        GattServerCore {
            radio,
            bridge,
            gate,
            service,
            state: ServerState::Idle,
            registry: DeviceRegistry::new(),
            advertiser: AdvertisingController::new(advertise),
            dispatcher: NotificationDispatcher::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.is_active()
    }

    /// The last value set by a send, empty if none was set yet.
    pub fn read_value(&self) -> &[u8] {
        self.dispatcher.value()
    }

    /// Open the server and submit the service registration.
    ///
    /// Valid from `Idle` and, for a retry from scratch, from `Stopped`;
    /// anywhere else the call is a logged no-op. A refused permission check
    /// touches no radio state. The registration outcome arrives later as a
    /// [`RadioEvent::ServiceAdded`]; advertising begins only then.
    pub async fn start(&mut self) -> Result<(), StartError> {
        match self.state {
            ServerState::Idle | ServerState::Stopped(_) => {}
            _ => {
                warn!("start requested while {:?}, ignoring", self.state);
                return Ok(());
            }
        }

        if !self.gate.can_operate().await {
            error!("missing permissions for connect or advertise role");
            return Err(StartError::PermissionDenied);
        }

        self.state = ServerState::Starting;
        info!("starting gatt server");
        if let Err(e) = self.radio.open_server().await {
            error!("unable to open gatt server: {e:?}");
            self.state = ServerState::Stopped(Some(StartError::ServerOpenFailed));
            return Err(StartError::ServerOpenFailed);
        }

        self.state = ServerState::Registering;
        self.radio.register_service(&self.service).await;
        Ok(())
    }

    /// Tear everything down and return to `Idle` so start may run again.
    pub async fn stop(&mut self) {
        self.advertiser.stop(&mut self.radio).await;
        self.radio.close_server().await;
        self.registry.clear();
        self.state = ServerState::Idle;
        info!("gatt server stopped");
    }

    /// Feed one platform event into the state machine. Never blocks on I/O.
    pub async fn handle_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::ServiceAdded { success } => self.on_service_added(success).await,
            RadioEvent::ConnectionState { device, state } => {
                self.on_connection_state(device, state)
            }
            RadioEvent::CharacteristicWrite {
                device,
                characteristic,
                value,
                offset,
                reply,
            } => self.on_characteristic_write(device, characteristic, value, offset, reply),
            RadioEvent::DescriptorWrite {
                device,
                descriptor,
                offset,
                reply,
            } => self.on_descriptor_write(device, descriptor, offset, reply),
            RadioEvent::CharacteristicRead {
                device,
                offset,
                reply,
            } => self.on_characteristic_read(device, offset, reply),
        }
    }

    /// Application initiated send. A logged no-op unless the server is
    /// Ready.
    pub async fn send(&mut self, text: &str) {
        if self.state != ServerState::Ready {
            warn!("send requested while {:?}, dropping message", self.state);
            return;
        }
        self.dispatcher
            .send(&mut self.radio, &self.registry, text)
            .await;
    }

    async fn on_service_added(&mut self, success: bool) {
        if self.state != ServerState::Registering {
            warn!("service added result while {:?}, ignoring", self.state);
            return;
        }
        if success {
            info!("service registered");
            self.state = ServerState::Ready;
            // Advertising may begin only now that the service is in place.
            self.advertiser.start(&mut self.radio).await;
        } else {
            error!("service registration failed");
            self.state = ServerState::Stopped(Some(StartError::ServiceRegistrationFailed));
        }
    }

    fn on_connection_state(&mut self, device: DeviceId, state: LinkState) {
        if self.state != ServerState::Ready {
            debug!("connection event for {} while {:?}", device, self.state);
            return;
        }
        match state {
            LinkState::Connected => {
                if self.registry.add(device) {
                    info!("device connected: {}", device);
                }
            }
            LinkState::Disconnected => {
                if self.registry.remove(&device) {
                    info!("device disconnected: {}", device);
                }
            }
            LinkState::Connecting | LinkState::Disconnecting => {
                debug!("device {} is {:?}", device, state);
            }
        }
    }

    fn on_characteristic_write(
        &mut self,
        device: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
        offset: u16,
        reply: Option<WriteReply>,
    ) {
        if offset != 0 {
            // Only single complete writes, no prepared or long writes.
            warn!("rejecting write from {} with offset {}", device, offset);
            if let Some(reply) = reply {
                reply.failure(WriteError::NonZeroOffset);
            }
            return;
        }
        if characteristic != self.service.descriptor.characteristic {
            warn!(
                "rejecting write from {} to unknown characteristic {}",
                device, characteristic
            );
            if let Some(reply) = reply {
                reply.failure(WriteError::UnknownCharacteristic);
            }
            return;
        }

        debug!("write from {}: {} bytes", device, value.len());
        let text = String::from_utf8_lossy(&value);
        // Forward before acknowledging; the bridge must not block this call.
        self.bridge.on_text_received(&text);
        if let Some(reply) = reply {
            reply.success();
        }
    }

    fn on_descriptor_write(
        &mut self,
        device: DeviceId,
        descriptor: Uuid,
        offset: u16,
        reply: Option<WriteReply>,
    ) {
        // Subscription state does not gate notifications; acknowledge and
        // move on.
        debug!(
            "descriptor {} written by {} at offset {}",
            descriptor, device, offset
        );
        if let Some(reply) = reply {
            reply.success();
        }
    }

    fn on_characteristic_read(&mut self, device: DeviceId, offset: u16, reply: ReadReply) {
        let value = self.dispatcher.value();
        if offset as usize > value.len() {
            warn!(
                "rejecting read from {} at offset {} past {} bytes",
                device,
                offset,
                value.len()
            );
            reply.failure(ReadError::InvalidOffset);
            return;
        }
        reply.value(value[offset as usize..].to_vec());
    }
}
