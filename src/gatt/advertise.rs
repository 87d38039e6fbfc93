use std::time::Duration;

use log::{error, info};
use uuid::Uuid;

use crate::radio::Radio;

/// Parameters of the advertisement set.
///
/// The primary packet carries the service UUID and stays name-free to keep
/// it small; the scan response carries the device name.
#[derive(Debug, Clone)]
pub struct AdvertiseParams {
    pub service_uuid: Uuid,
    pub device_name: String,
    pub connectable: bool,
    /// `None` advertises indefinitely until explicitly stopped.
    pub timeout: Option<Duration>,
    pub tx_power_dbm: i16,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl AdvertiseParams {
    /// Low-latency interval, maximum transmit power, no timeout.
    pub fn low_latency(service_uuid: Uuid, device_name: String) -> Self {
        AdvertiseParams {
            service_uuid,
            device_name,
            connectable: true,
            timeout: None,
            tx_power_dbm: 20,
            min_interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(100),
        }
    }
}

/// Starts and stops the advertisement set, strictly after the service has
/// been confirmed added.
#[derive(Debug)]
pub struct AdvertisingController {
    params: AdvertiseParams,
    active: bool,
}

impl AdvertisingController {
    pub fn new(params: AdvertiseParams) -> Self {
        AdvertisingController {
            params,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Idempotent: an already active set is cancelled first, stacks refuse
    /// re-adding the same set without cancellation. A start failure is non
    /// fatal, the server stays reachable for devices already connected.
    pub async fn start<R: Radio>(&mut self, radio: &mut R) {
        if self.active {
            radio.stop_advertising().await;
            self.active = false;
        }
        match radio.start_advertising(&self.params).await {
            Ok(()) => {
                self.active = true;
                info!("advertising started as `{}`", self.params.device_name);
            }
            Err(e) => {
                error!("{}", e);
            }
        }
    }

    /// Safe to call when not advertising.
    pub async fn stop<R: Radio>(&mut self, radio: &mut R) {
        if self.active {
            radio.stop_advertising().await;
            self.active = false;
            info!("advertising stopped");
        }
    }
}
