//! Hand-off of inbound text to the application layer.

use std::borrow::Cow;

use log::error;
use serde::{Deserialize, Serialize};

/// Receives each accepted inbound write, in delivery order.
///
/// Called on the event delivery sequence; implementations must not block,
/// delaying this call starves further BLE event delivery.
pub trait TransportBridge {
    fn on_text_received(&mut self, text: &str);
}

/// Message framing on the application side of the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeMsg<'a> {
    Received {
        #[serde(borrow)]
        text: Cow<'a, str>,
    },
}

/// Emits every received message as a JSON line on stdout.
pub struct JsonLineBridge;

impl TransportBridge for JsonLineBridge {
    fn on_text_received(&mut self, text: &str) {
        let msg = BridgeMsg::Received {
            text: Cow::Borrowed(text),
        };
        match serde_json::to_string(&msg) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("failed to encode bridge message: {}", e),
        }
    }
}
