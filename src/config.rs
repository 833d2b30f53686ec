use crate::banner::feature;
use crate::protocol::{AdbError, MAX_PAYLOAD};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default receive window offered per socket when delayed ack is negotiated.
pub const DEFAULT_INITIAL_DELAYED_ACK_BYTES: u32 = 32 * 1024 * 1024;

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConfig {
    /// Payload size offered in `CNXN`; the device may lower it.
    pub max_payload_size: u32,
    /// Per-socket receive window for delayed ack. `0` disables the feature.
    pub initial_delayed_ack_bytes: u32,
    /// Host features advertised in `CNXN`.
    pub features: Vec<String>,
    /// Name sent with the public key when no stored key carries one.
    pub host_name: String,
    /// Inbound chunks buffered per socket before that socket stops acknowledging.
    pub read_queue_capacity: usize,
    /// Abort the handshake after this many milliseconds.
    pub handshake_timeout_ms: Option<u64>,
    /// Leave the underlying stream open when the client is closed.
    pub preserve_connection: bool,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD,
            initial_delayed_ack_bytes: DEFAULT_INITIAL_DELAYED_ACK_BYTES,
            features: feature::DEFAULT.iter().map(|f| f.to_string()).collect(),
            host_name: "webadb".to_string(),
            read_queue_capacity: 16,
            handshake_timeout_ms: None,
            preserve_connection: false,
        }
    }
}

impl AdbConfig {
    pub fn validate(&self) -> Result<(), AdbError> {
        if self.max_payload_size == 0 {
            return Err(AdbError::InvalidConfig(
                "max_payload_size must be greater than 0".to_string(),
            ));
        }
        if self.read_queue_capacity == 0 {
            return Err(AdbError::InvalidConfig(
                "read_queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// Features actually sent: `delayed_ack` is dropped when the window is zero.
    pub fn advertised_features(&self) -> Vec<String> {
        self.features
            .iter()
            .filter(|f| self.initial_delayed_ack_bytes > 0 || f.as_str() != feature::DELAYED_ACK)
            .cloned()
            .collect()
    }

    /// Disable delayed ack entirely.
    pub fn without_delayed_ack(mut self) -> Self {
        self.initial_delayed_ack_bytes = 0;
        self
    }
}
