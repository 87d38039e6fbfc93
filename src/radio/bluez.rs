//! BlueZ backed radio, serving the GATT application through bluer.
//!
//! BlueZ does not expose Android-style per-request callbacks, so this
//! backend adapts: read and write handlers forward into the event queue and
//! await the core's reply before answering D-Bus; connection transitions
//! are observed by polling the adapter's device list; notification sessions
//! opened by subscribing centrals are bound to the most recently connected
//! device without one.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bluer::{
    adv::{Advertisement, AdvertisementHandle, Type},
    gatt::local::{
        Application, ApplicationHandle, Characteristic, CharacteristicNotify,
        CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
        CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError,
        Service,
    },
    Adapter, Address, Session,
};
use log::{debug, error, info, warn};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::gatt::{AdvertiseParams, CharacteristicProperty, PermissionGate, ServiceDefinition};
use crate::radio::{
    AdvertiseError, DeviceId, LinkState, NotifyError, Radio, RadioEvent, ReadReply, WriteError,
    WriteReply,
};

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);
const SESSION_QUEUE: usize = 8;

impl From<Address> for DeviceId {
    fn from(addr: Address) -> Self {
        DeviceId::new(addr.0)
    }
}

impl From<DeviceId> for Address {
    fn from(device: DeviceId) -> Self {
        Address(device.bytes())
    }
}

#[derive(Default)]
struct Shared {
    /// Currently linked centrals, in connection order.
    connected: Vec<Address>,
    /// Notification sessions keyed by the device they were bound to.
    sessions: HashMap<Address, mpsc::Sender<Vec<u8>>>,
    /// Sessions whose device binding is not known yet.
    unbound: Vec<mpsc::Sender<Vec<u8>>>,
}

impl Shared {
    /// Pair parked sessions with connected devices that lack one, newest
    /// connection first.
    fn bind_sessions(&mut self) {
        let mut still_unbound = Vec::new();
        for tx in self.unbound.drain(..) {
            if tx.is_closed() {
                continue;
            }
            let target = self
                .connected
                .iter()
                .rev()
                .copied()
                .find(|a| !self.sessions.contains_key(a));
            match target {
                Some(addr) => {
                    debug!("notification session bound to {addr}");
                    self.sessions.insert(addr, tx);
                }
                None => still_unbound.push(tx),
            }
        }
        self.unbound = still_unbound;
    }

    fn last_connected(&self) -> DeviceId {
        self.connected
            .last()
            .copied()
            .map(DeviceId::from)
            .unwrap_or(DeviceId::new([0; 6]))
    }
}

/// Authorization probe for the connect and advertise roles. On BlueZ both
/// map to an available, powered adapter.
pub struct AdapterGate {
    adapter: Adapter,
}

impl AdapterGate {
    pub fn new(adapter: Adapter) -> Self {
        AdapterGate { adapter }
    }
}

#[async_trait]
impl PermissionGate for AdapterGate {
    async fn can_operate(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }
}

pub struct BluezRadio {
    _session: Session,
    adapter: Adapter,
    events: mpsc::Sender<RadioEvent>,
    shared: Arc<Mutex<Shared>>,
    app_handle: Option<ApplicationHandle>,
    adv_handle: Option<AdvertisementHandle>,
    monitor: Option<JoinHandle<()>>,
}

impl BluezRadio {
    pub async fn new(alias: &str, events: mpsc::Sender<RadioEvent>) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = session
            .default_adapter()
            .await
            .context("no bluetooth adapter available")?;
        adapter.set_alias(alias.to_string()).await?;

        info!(
            "using bluetooth adapter `{}` with address `{}`",
            adapter.name(),
            adapter.address().await?,
        );

        Ok(BluezRadio {
            _session: session,
            adapter,
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
            app_handle: None,
            adv_handle: None,
            monitor: None,
        })
    }

    pub fn adapter(&self) -> Adapter {
        self.adapter.clone()
    }
}

#[async_trait]
impl Radio for BluezRadio {
    async fn open_server(&mut self) -> Result<()> {
        self.adapter
            .set_powered(true)
            .await
            .context("failed to power on adapter")?;
        if self.monitor.is_none() {
            self.monitor = Some(spawn_monitor(
                self.adapter.clone(),
                self.shared.clone(),
                self.events.clone(),
            ));
        }
        Ok(())
    }

    async fn register_service(&mut self, service: &ServiceDefinition) {
        let app = build_application(service, self.events.clone(), self.shared.clone());
        let success = match self.adapter.serve_gatt_application(app).await {
            Ok(handle) => {
                self.app_handle = Some(handle);
                true
            }
            Err(e) => {
                error!("failed to register gatt application: {e}");
                false
            }
        };
        if self
            .events
            .send(RadioEvent::ServiceAdded { success })
            .await
            .is_err()
        {
            warn!("event queue closed before registration result");
        }
    }

    async fn start_advertising(&mut self, params: &AdvertiseParams) -> Result<(), AdvertiseError> {
        let advert = Advertisement {
            advertisement_type: if params.connectable {
                Type::Peripheral
            } else {
                Type::Broadcast
            },
            service_uuids: Some(params.service_uuid).into_iter().collect(),
            discoverable: Some(true),
            // BlueZ moves the name into the scan response; the primary
            // packet carries only the service uuid.
            local_name: Some(params.device_name.clone()),
            tx_power: Some(params.tx_power_dbm),
            min_interval: Some(params.min_interval),
            max_interval: Some(params.max_interval),
            timeout: params.timeout,
            ..Default::default()
        };
        match self.adapter.advertise(advert).await {
            Ok(handle) => {
                self.adv_handle = Some(handle);
                Ok(())
            }
            Err(e) => Err(AdvertiseError {
                code: e.to_string(),
            }),
        }
    }

    async fn stop_advertising(&mut self) {
        if self.adv_handle.take().is_some() {
            debug!("advertisement set dropped");
        }
    }

    async fn notify(&mut self, device: DeviceId, value: &[u8]) -> Result<(), NotifyError> {
        let addr = Address::from(device);
        let tx = {
            let mut shared = self.shared.lock().await;
            shared.bind_sessions();
            match shared.sessions.get(&addr) {
                Some(tx) if !tx.is_closed() => tx.clone(),
                Some(_) => {
                    shared.sessions.remove(&addr);
                    return Err(NotifyError("notification session closed".to_string()));
                }
                None => return Err(NotifyError("no notification session".to_string())),
            }
        };
        tx.send(value.to_vec())
            .await
            .map_err(|_| NotifyError("notification session closed".to_string()))
    }

    async fn close_server(&mut self) {
        self.adv_handle.take();
        self.app_handle.take();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        let mut shared = self.shared.lock().await;
        shared.connected.clear();
        shared.sessions.clear();
        shared.unbound.clear();
    }
}

/// Build the bluer GATT application for the service definition.
///
/// BlueZ derives attribute permissions from the declared operations and
/// attaches the client configuration descriptor itself.
fn build_application(
    service: &ServiceDefinition,
    events: mpsc::Sender<RadioEvent>,
    shared: Arc<Mutex<Shared>>,
) -> Application {
    let descriptor = service.descriptor;
    let props = service.properties;

    let read = if props.contains(CharacteristicProperty::Read) {
        let events = events.clone();
        let shared = shared.clone();
        Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
                let events = events.clone();
                let shared = shared.clone();
                Box::pin(async move {
                    let device = shared.lock().await.last_connected();
                    let (reply, result) = ReadReply::channel();
                    let event = RadioEvent::CharacteristicRead {
                        device,
                        offset: req.offset,
                        reply,
                    };
                    if events.send(event).await.is_err() {
                        return Err(ReqError::Failed);
                    }
                    match result.await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(_)) => Err(ReqError::InvalidOffset),
                        Err(_) => Err(ReqError::Failed),
                    }
                })
            }),
            ..Default::default()
        })
    } else {
        None
    };

    let write = if props.contains(CharacteristicProperty::Write) {
        let events = events.clone();
        let shared = shared.clone();
        let characteristic = descriptor.characteristic;
        Some(CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                    let events = events.clone();
                    let shared = shared.clone();
                    Box::pin(async move {
                        let device = shared.lock().await.last_connected();
                        let (reply, result) = WriteReply::channel();
                        let event = RadioEvent::CharacteristicWrite {
                            device,
                            characteristic,
                            value,
                            offset: req.offset,
                            reply: Some(reply),
                        };
                        if events.send(event).await.is_err() {
                            return Err(ReqError::Failed);
                        }
                        match result.await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(WriteError::NonZeroOffset)) => Err(ReqError::InvalidOffset),
                            Ok(Err(WriteError::UnknownCharacteristic)) => {
                                Err(ReqError::NotSupported)
                            }
                            Err(_) => Err(ReqError::Failed),
                        }
                    })
                },
            )),
            ..Default::default()
        })
    } else {
        None
    };

    let notify = if props.contains(CharacteristicProperty::Notify) {
        let shared = shared.clone();
        Some(CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                let shared = shared.clone();
                Box::pin(async move {
                    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SESSION_QUEUE);
                    {
                        let mut shared = shared.lock().await;
                        shared.unbound.push(tx);
                        shared.bind_sessions();
                    }
                    debug!("notification session opened");
                    while let Some(value) = rx.recv().await {
                        if let Err(e) = notifier.notify(value).await {
                            debug!("notification session ended: {e}");
                            break;
                        }
                    }
                    debug!("notification session closed");
                })
            })),
            ..Default::default()
        })
    } else {
        None
    };

    Application {
        services: vec![Service {
            uuid: descriptor.service,
            primary: true,
            characteristics: vec![Characteristic {
                uuid: descriptor.characteristic,
                read,
                write,
                notify,
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Poll the adapter for link transitions and feed them into the event
/// queue. BlueZ reports no connect callback for incoming centrals, the
/// device list is the observable surface.
fn spawn_monitor(
    adapter: Adapter,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::Sender<RadioEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("connection monitor started");
        loop {
            tokio::time::sleep(MONITOR_INTERVAL).await;

            let addresses = match adapter.device_addresses().await {
                Ok(x) => x,
                Err(e) => {
                    debug!("failed to list devices: {e}");
                    continue;
                }
            };

            let mut now = Vec::new();
            for addr in addresses {
                let device = match adapter.device(addr) {
                    Ok(x) => x,
                    Err(_) => continue,
                };
                match device.is_connected().await {
                    Ok(true) => now.push(addr),
                    Ok(false) => {}
                    Err(e) => debug!("failed to query {addr}: {e}"),
                }
            }

            // Diff under the lock, send after releasing it; the consumer of
            // the queue also takes this lock.
            let (fresh, gone) = {
                let mut shared = shared.lock().await;
                let gone: Vec<Address> = shared
                    .connected
                    .iter()
                    .copied()
                    .filter(|a| !now.contains(a))
                    .collect();
                let fresh: Vec<Address> = now
                    .iter()
                    .copied()
                    .filter(|a| !shared.connected.contains(a))
                    .collect();
                shared.connected.retain(|a| now.contains(a));
                shared.connected.extend(fresh.iter().copied());
                for addr in &gone {
                    shared.sessions.remove(addr);
                }
                (fresh, gone)
            };

            for addr in fresh {
                let event = RadioEvent::ConnectionState {
                    device: addr.into(),
                    state: LinkState::Connected,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            for addr in gone {
                let event = RadioEvent::ConnectionState {
                    device: addr.into(),
                    state: LinkState::Disconnected,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    })
}
