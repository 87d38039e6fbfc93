use async_trait::async_trait;
use enumflags2::{bitflags, BitFlags};
use uuid::Uuid;

mod advertise;
mod notify;
mod registry;
mod server;

pub use advertise::{AdvertiseParams, AdvertisingController};
pub use notify::NotificationDispatcher;
pub use registry::DeviceRegistry;
pub use server::{GattServerCore, ServerState, StartError};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xbf27730d_860a_4e09_889c_2d8b6a9e0fe7);
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbf27730d_860a_4e09_889c_2d8b6a9e0fe8);
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Fixed identifiers of the text exchange service. Created once at startup,
/// never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub cccd: Uuid,
}

impl ServiceDescriptor {
    pub const fn text_exchange() -> Self {
        ServiceDescriptor {
            service: SERVICE_UUID,
            characteristic: CHARACTERISTIC_UUID,
            cccd: CCCD_UUID,
        }
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicProperty {
    Read,
    Write,
    Notify,
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributePermission {
    Read,
    Write,
}

/// The single service this server exposes: one characteristic with its
/// properties and attribute permissions.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub descriptor: ServiceDescriptor,
    pub properties: BitFlags<CharacteristicProperty>,
    pub permissions: BitFlags<AttributePermission>,
}

impl ServiceDefinition {
    pub fn text_exchange() -> Self {
        ServiceDefinition {
            descriptor: ServiceDescriptor::text_exchange(),
            properties: CharacteristicProperty::Read
                | CharacteristicProperty::Write
                | CharacteristicProperty::Notify,
            permissions: AttributePermission::Read | AttributePermission::Write,
        }
    }
}

/// Runtime authorization for the connect and advertise roles.
///
/// Queried before any radio state is touched. No side effects and no
/// retries; the caller decides whether to prompt for authorization and call
/// start again.
#[async_trait]
pub trait PermissionGate {
    async fn can_operate(&self) -> bool;
}
