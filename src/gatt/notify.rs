use log::warn;

use crate::gatt::DeviceRegistry;
use crate::radio::Radio;

/// Holds the characteristic's current value and fans it out as
/// notifications to every registered device.
#[derive(Debug, Default)]
pub struct NotificationDispatcher {
    value: Vec<u8>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        NotificationDispatcher::default()
    }

    /// The last value set, empty before the first send.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Encode `text`, store it as the current value and notify every device
    /// in the registry. An empty registry still updates the value for any
    /// future reader.
    ///
    /// Delivery failures are logged and never touch the registry; removal
    /// happens only on connection state events, a failed notification is
    /// not a disconnect.
    pub async fn send<R: Radio>(&mut self, radio: &mut R, registry: &DeviceRegistry, text: &str) {
        self.value = text.as_bytes().to_vec();
        for device in registry.snapshot() {
            if let Err(e) = radio.notify(device, &self.value).await {
                warn!("notification to {} failed: {}", device, e);
            }
        }
    }
}
