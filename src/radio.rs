//! Seam between the GATT server core and the platform BLE stack.
//!
//! The stack delivers its asynchronous callbacks as [`RadioEvent`]s into a
//! single-consumer queue, so connection transitions and request handling for
//! one server never interleave. Requests that demand a response carry a reply
//! handle which is consumed exactly once.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::gatt::{AdvertiseParams, ServiceDefinition};

pub mod bluez;

/// Stable identity of a remote device, its BD address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; 6]);

impl DeviceId {
    pub const fn new(addr: [u8; 6]) -> Self {
        DeviceId(addr)
    }

    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// Link state reported by the platform for a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Reasons a write request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Only single complete writes are accepted, not prepared or long
    /// writes.
    NonZeroOffset,
    UnknownCharacteristic,
}

/// Reasons a read request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    InvalidOffset,
}

/// Reply handle for a write request that demands a response.
///
/// Consuming the handle is the response. Dropping it unanswered surfaces as
/// a failure on the platform side, so every accepted or rejected path must
/// resolve it.
#[derive(Debug)]
pub struct WriteReply(oneshot::Sender<Result<(), WriteError>>);

impl WriteReply {
    pub fn channel() -> (Self, oneshot::Receiver<Result<(), WriteError>>) {
        let (tx, rx) = oneshot::channel();
        (WriteReply(tx), rx)
    }

    pub fn success(self) {
        let _ = self.0.send(Ok(()));
    }

    pub fn failure(self, error: WriteError) {
        let _ = self.0.send(Err(error));
    }
}

/// Reply handle for a characteristic read request.
#[derive(Debug)]
pub struct ReadReply(oneshot::Sender<Result<Vec<u8>, ReadError>>);

impl ReadReply {
    pub fn channel() -> (Self, oneshot::Receiver<Result<Vec<u8>, ReadError>>) {
        let (tx, rx) = oneshot::channel();
        (ReadReply(tx), rx)
    }

    pub fn value(self, value: Vec<u8>) {
        let _ = self.0.send(Ok(value));
    }

    pub fn failure(self, error: ReadError) {
        let _ = self.0.send(Err(error));
    }
}

/// Asynchronous events delivered by the platform BLE stack.
#[derive(Debug)]
pub enum RadioEvent {
    /// Outcome of the submitted service registration.
    ServiceAdded { success: bool },
    /// Link state change for a remote device.
    ConnectionState { device: DeviceId, state: LinkState },
    /// Write request against a characteristic. `reply` is present when the
    /// remote requires a response.
    CharacteristicWrite {
        device: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
        offset: u16,
        reply: Option<WriteReply>,
    },
    /// Write request against a descriptor, the CCCD subscription switch.
    DescriptorWrite {
        device: DeviceId,
        descriptor: Uuid,
        offset: u16,
        reply: Option<WriteReply>,
    },
    /// Read request against the characteristic value.
    CharacteristicRead {
        device: DeviceId,
        offset: u16,
        reply: ReadReply,
    },
}

/// Advertising start failure, reported by the platform stack. Non fatal to
/// the server, only discovery of it.
#[derive(Debug)]
pub struct AdvertiseError {
    pub code: String,
}

impl fmt::Display for AdvertiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "advertising failed: {}", self.code)
    }
}

impl std::error::Error for AdvertiseError {}

/// A notification could not be delivered to one device.
#[derive(Debug)]
pub struct NotifyError(pub String);

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for NotifyError {}

/// The platform BLE stack as seen by the server core.
///
/// Implementations push their callbacks into the event queue they were
/// constructed with; the core drives them through these operations only.
#[async_trait]
pub trait Radio {
    /// Open the GATT server on the adapter.
    async fn open_server(&mut self) -> anyhow::Result<()>;

    /// Submit the service definition. The outcome arrives later as a
    /// [`RadioEvent::ServiceAdded`].
    async fn register_service(&mut self, service: &ServiceDefinition);

    async fn start_advertising(&mut self, params: &AdvertiseParams) -> Result<(), AdvertiseError>;

    /// Safe to call when not advertising.
    async fn stop_advertising(&mut self);

    /// Push the current characteristic value to one device.
    async fn notify(&mut self, device: DeviceId, value: &[u8]) -> Result<(), NotifyError>;

    /// Tear the server down, dropping the advertisement set and the service
    /// registration.
    async fn close_server(&mut self);
}
