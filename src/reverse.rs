//! Reverse tunnels: connections the device accepts on one of its addresses
//! are opened back over the transport and served by a handler on this side.

use crate::dispatcher::{PacketDispatcher, ReverseTunnelHandler};
use crate::protocol::AdbError;
use crate::socket::AdbSocket;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rsa::rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// What adbd answers to `reverse:` requests over a wireless connection
/// on older Android versions.
const NOT_SUPPORTED_MESSAGE: &str = "more than one device/emulator";

/// Registers local listeners for device-initiated connections.
#[async_trait]
pub trait ReverseTunnelConnector: Send + Sync {
    /// Start routing `OPEN`s for `address` to `handler`. Picks an address
    /// when none is given and returns the one in use.
    async fn add_reverse_tunnel(&self, handler: ReverseTunnelHandler, address: Option<String>) -> Result<String, AdbError>;

    async fn remove_reverse_tunnel(&self, address: &str) -> Result<(), AdbError>;

    async fn clear_reverse_tunnels(&self) -> Result<(), AdbError>;
}

#[async_trait]
impl ReverseTunnelConnector for PacketDispatcher {
    async fn add_reverse_tunnel(&self, handler: ReverseTunnelHandler, address: Option<String>) -> Result<String, AdbError> {
        let address = address.unwrap_or_else(|| format!("localabstract:reverse_{:08x}", OsRng.next_u32()));
        self.register_handler(address.clone(), handler);
        Ok(address)
    }

    async fn remove_reverse_tunnel(&self, address: &str) -> Result<(), AdbError> {
        self.unregister_handler(address);
        Ok(())
    }

    async fn clear_reverse_tunnels(&self) -> Result<(), AdbError> {
        self.clear_handlers();
        Ok(())
    }
}

/// One line of `reverse:list-forward`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseTunnelEntry {
    pub device_serial: String,
    /// Address listened on by the device.
    pub local_name: String,
    /// Address the device connects back to on this side.
    pub remote_name: String,
}

/// Device-address to local-address mappings of one connection.
pub struct ReverseTunnelRegistry {
    dispatcher: PacketDispatcher,
    connector: Arc<dyn ReverseTunnelConnector>,
    tunnels: Mutex<HashMap<String, String>>,
}

impl ReverseTunnelRegistry {
    pub fn new(dispatcher: PacketDispatcher) -> Self {
        let connector = Arc::new(dispatcher.clone());
        Self::with_connector(dispatcher, connector)
    }

    /// Use `connector` for local listeners; control requests still go through `dispatcher`.
    pub fn with_connector(dispatcher: PacketDispatcher, connector: Arc<dyn ReverseTunnelConnector>) -> Self {
        Self {
            dispatcher,
            connector,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.tunnels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forward connections to `device_address` on the device to `handler`.
    ///
    /// Returns the device address actually bound, which differs from the
    /// requested one for `tcp:0`.
    pub async fn add(
        &self,
        device_address: &str,
        handler: ReverseTunnelHandler,
        local_address: Option<String>,
    ) -> Result<String, AdbError> {
        let local_address = self.connector.add_reverse_tunnel(handler, local_address).await?;

        match self.forward(device_address, &local_address).await {
            Ok(bound) => {
                log::info!("Reverse tunnel {} -> {}", bound, local_address);
                self.lock().insert(bound.clone(), local_address);
                Ok(bound)
            }
            Err(e) => {
                log::warn!("Reverse tunnel {} failed: {}", device_address, e);
                if let Err(rollback) = self.connector.remove_reverse_tunnel(&local_address).await {
                    log::warn!("Failed to remove listener {}: {}", local_address, rollback);
                }
                Err(e)
            }
        }
    }

    async fn forward(&self, device_address: &str, local_address: &str) -> Result<String, AdbError> {
        let mut response = self
            .request(&format!("reverse:forward:{};{}", device_address, local_address))
            .await?;

        let bound = if device_address.starts_with("tcp:") {
            Self::read_bound_port(&mut response).await
        } else {
            Ok(None)
        };
        response.close();

        Ok(bound?
            .map(|port| format!("tcp:{}", port))
            .unwrap_or_else(|| device_address.to_string()))
    }

    /// Android 8+ echoes the bound port; older versions just close.
    async fn read_bound_port(response: &mut ResponseReader) -> Result<Option<u16>, AdbError> {
        let Some(length) = response.read_exact_or_end(4).await? else {
            return Ok(None);
        };
        let length = parse_hex_length(&length)?;
        let port = response.read_exact(length).await?;
        std::str::from_utf8(&port)
            .ok()
            .and_then(|p| p.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| AdbError::ReverseTunnel(format!("invalid port in response: {:?}", port)))
    }

    /// Stop forwarding `device_address`.
    pub async fn remove(&self, device_address: &str) -> Result<(), AdbError> {
        let local_address = self.lock().remove(device_address);
        if let Some(local_address) = local_address {
            self.connector.remove_reverse_tunnel(&local_address).await?;
        }

        self.request(&format!("reverse:killforward:{}", device_address))
            .await?
            .close();
        log::info!("Reverse tunnel {} removed", device_address);
        Ok(())
    }

    /// Stop every reverse tunnel on the device, including ones this
    /// registry did not create.
    pub async fn remove_all(&self) -> Result<(), AdbError> {
        self.connector.clear_reverse_tunnels().await?;
        self.lock().clear();

        self.request("reverse:killforward-all").await?.close();
        log::info!("All reverse tunnels removed");
        Ok(())
    }

    /// Reverse tunnels as reported by the device.
    pub async fn list(&self) -> Result<Vec<ReverseTunnelEntry>, AdbError> {
        let mut response = self.request("reverse:list-forward").await?;
        let listing = response.read_string().await?;
        response.close();

        Ok(listing
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                Some(ReverseTunnelEntry {
                    device_serial: parts.next()?.to_string(),
                    local_name: parts.next()?.to_string(),
                    remote_name: parts.next()?.to_string(),
                })
            })
            .collect())
    }

    /// Local address registered for `device_address` by this registry.
    pub fn local_address(&self, device_address: &str) -> Option<String> {
        self.lock().get(device_address).cloned()
    }

    /// Send a control request and consume its `OKAY`/`FAIL` status.
    async fn request(&self, service: &str) -> Result<ResponseReader, AdbError> {
        let socket = self.dispatcher.create_socket(service).await?;
        let mut response = ResponseReader::new(socket);

        let status = response.read_exact(4).await?;
        match &status[..] {
            b"OKAY" => Ok(response),
            b"FAIL" => {
                let message = response.read_string().await?;
                response.close();
                if message == NOT_SUPPORTED_MESSAGE {
                    Err(AdbError::ReverseNotSupported)
                } else {
                    Err(AdbError::ReverseTunnel(message))
                }
            }
            other => {
                response.close();
                Err(AdbError::ReverseTunnel(format!(
                    "unexpected status {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        }
    }
}

fn parse_hex_length(bytes: &[u8]) -> Result<usize, AdbError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| AdbError::ReverseTunnel(format!("invalid length prefix: {:?}", bytes)))
}

/// Buffers socket chunks so responses can be read by exact length.
struct ResponseReader {
    socket: AdbSocket,
    buffer: BytesMut,
    ended: bool,
}

impl ResponseReader {
    fn new(socket: AdbSocket) -> Self {
        Self {
            socket,
            buffer: BytesMut::new(),
            ended: false,
        }
    }

    /// Buffer at least `n` bytes unless the socket ends first.
    async fn fill(&mut self, n: usize) -> Result<(), AdbError> {
        while self.buffer.len() < n && !self.ended {
            match self.socket.read().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => self.ended = true,
            }
        }
        Ok(())
    }

    /// `Ok(None)` if the socket ended before any of the `n` bytes arrived.
    async fn read_exact_or_end(&mut self, n: usize) -> Result<Option<Bytes>, AdbError> {
        self.fill(n).await?;
        if self.buffer.is_empty() && n > 0 {
            return Ok(None);
        }
        if self.buffer.len() < n {
            return Err(AdbError::ReverseTunnel(format!(
                "response ended after {} of {} bytes",
                self.buffer.len(),
                n
            )));
        }
        Ok(Some(self.buffer.split_to(n).freeze()))
    }

    async fn read_exact(&mut self, n: usize) -> Result<Bytes, AdbError> {
        self.read_exact_or_end(n)
            .await?
            .ok_or_else(|| AdbError::ReverseTunnel("response ended early".to_string()))
    }

    /// A 4-hex-digit length followed by that many bytes of text.
    async fn read_string(&mut self) -> Result<String, AdbError> {
        let length = self.read_exact(4).await?;
        let length = parse_hex_length(&length)?;
        if length == 0 {
            return Ok(String::new());
        }
        let text = self.read_exact(length).await?;
        Ok(String::from_utf8_lossy(&text).into_owned())
    }

    fn close(&self) {
        self.socket.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_length() {
        assert_eq!(parse_hex_length(b"001c").unwrap(), 28);
        assert_eq!(parse_hex_length(b"0000").unwrap(), 0);
        assert!(matches!(parse_hex_length(b"zz12"), Err(AdbError::ReverseTunnel(_))));
    }
}
