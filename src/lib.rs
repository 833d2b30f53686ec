//! webadb-transport - the transport layer of an ADB (Android Debug Bridge) host
//!
//! This library speaks the ADB daemon protocol over any async byte stream
//! (USB bulk endpoints, a TCP socket to `adbd`, an in-memory pipe): packet
//! framing, the CNXN/AUTH handshake with RSA key cycling, multiplexed logical
//! sockets with flow control, and reverse tunnels.
//!
//! # Example
//!
//! ```no_run
//! use webadb_transport::{AdbClient, AdbConfig, MemoryCredentialStore};
//!
//! # async fn run() -> Result<(), webadb_transport::AdbError> {
//! let stream = tokio::net::TcpStream::connect("192.168.1.20:5555")
//!     .await
//!     .map_err(webadb_transport::AdbError::from)?;
//! let keys = MemoryCredentialStore::new();
//!
//! // Connect (the device may ask the user to accept the key)
//! let client = AdbClient::connect(stream, &keys, AdbConfig::default()).await?;
//! println!("Connected to {:?}", client.banner().model);
//!
//! // Run a command
//! let output = client.create_socket_and_wait("shell:ls /sdcard").await?;
//! println!("{}", output);
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod auth;
pub mod banner;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod reverse;
pub mod socket;
pub mod transport;

// Re-export main types
pub use auth::{AdbKeyPair, AuthObserver, CredentialProvider, MemoryCredentialStore};
pub use banner::AdbBanner;
pub use client::{AdbClient, HandshakeFailure};
pub use config::AdbConfig;
pub use dispatcher::{PacketDispatcher, ReverseTunnelHandler, SocketEvent};
pub use protocol::{AdbError, Command, Message, Packet};
pub use reverse::{ReverseTunnelConnector, ReverseTunnelEntry, ReverseTunnelRegistry};
pub use socket::{AdbSocket, SocketReader, SocketState, SocketWriter};
