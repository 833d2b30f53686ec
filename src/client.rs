use crate::auth::{AuthObserver, AuthProcessor, CredentialProvider};
use crate::banner::{feature, AdbBanner};
use crate::config::AdbConfig;
use crate::dispatcher::{DispatcherOptions, PacketDispatcher, SocketEvent};
use crate::protocol::{AdbError, Command, Packet, ADB_VERSION, ADB_VERSION_SKIP_CHECKSUM};
use crate::reverse::ReverseTunnelRegistry;
use crate::socket::AdbSocket;
use crate::transport::{self, PacketReader, PacketWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

/// Values agreed on in the `CNXN` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub version: u32,
    pub max_payload_size: u32,
    pub banner: AdbBanner,
    /// Per-socket receive window; `0` when delayed ack is off.
    pub initial_delayed_ack_bytes: u32,
}

/// A handshake that did not complete, with the transport handed back
/// so it can be retried or released by the caller.
pub struct HandshakeFailure<T> {
    pub error: AdbError,
    pub stream: T,
}

impl<T> std::fmt::Debug for HandshakeFailure<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeFailure")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// An authenticated connection to one device.
pub struct AdbClient {
    negotiated: Negotiated,
    dispatcher: PacketDispatcher,
    reverse: ReverseTunnelRegistry,
}

impl AdbClient {
    /// Run the handshake over `stream` and start dispatching.
    pub async fn connect<T>(stream: T, credentials: &dyn CredentialProvider, config: AdbConfig) -> Result<Self, AdbError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::connect_with_observer(stream, credentials, &(), config).await
    }

    /// Like [`connect`](Self::connect), reporting each authentication step to `observer`.
    pub async fn connect_with_observer<T>(
        stream: T,
        credentials: &dyn CredentialProvider,
        observer: &dyn AuthObserver,
        config: AdbConfig,
    ) -> Result<Self, AdbError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::try_connect(stream, credentials, observer, config)
            .await
            .map_err(|failure| failure.error)
    }

    /// Like [`connect_with_observer`](Self::connect_with_observer), but a
    /// failed or timed-out handshake returns the stream instead of dropping it.
    pub async fn try_connect<T>(
        stream: T,
        credentials: &dyn CredentialProvider,
        observer: &dyn AuthObserver,
        config: AdbConfig,
    ) -> Result<Self, HandshakeFailure<T>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(error) = config.validate() {
            return Err(HandshakeFailure { error, stream });
        }
        let (mut reader, mut writer) = transport::split(stream, config.max_payload_size);

        let handshake = handshake(&mut reader, &mut writer, credentials, observer, &config);
        let result = match config.handshake_timeout() {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .unwrap_or(Err(AdbError::Timeout)),
            None => handshake.await,
        };
        let negotiated = match result {
            Ok(negotiated) => negotiated,
            Err(error) => {
                log::warn!("Handshake failed: {}", error);
                let stream = reader.into_inner().unsplit(writer.into_inner());
                return Err(HandshakeFailure { error, stream });
            }
        };

        log::info!(
            "Connected: version {:#010x}, max payload {}, banner {:?}",
            negotiated.version,
            negotiated.max_payload_size,
            negotiated.banner
        );

        let options = DispatcherOptions {
            calculate_checksum: negotiated.version < ADB_VERSION_SKIP_CHECKSUM,
            append_null_to_service: negotiated.version < ADB_VERSION_SKIP_CHECKSUM,
            max_payload_size: negotiated.max_payload_size,
            initial_delayed_ack_bytes: negotiated.initial_delayed_ack_bytes,
            read_queue_capacity: config.read_queue_capacity,
            preserve_connection: config.preserve_connection,
        };
        let dispatcher = PacketDispatcher::spawn(reader, writer, options);
        let reverse = ReverseTunnelRegistry::new(dispatcher.clone());

        Ok(Self {
            negotiated,
            dispatcher,
            reverse,
        })
    }

    pub fn version(&self) -> u32 {
        self.negotiated.version
    }

    pub fn max_payload_size(&self) -> u32 {
        self.negotiated.max_payload_size
    }

    pub fn banner(&self) -> &AdbBanner {
        &self.negotiated.banner
    }

    pub fn initial_delayed_ack_bytes(&self) -> u32 {
        self.negotiated.initial_delayed_ack_bytes
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Open a socket to `service`, e.g. `shell,v2,raw:ls`.
    pub async fn create_socket(&self, service: &str) -> Result<AdbSocket, AdbError> {
        self.dispatcher.create_socket(service).await
    }

    /// Open `service`, read until the device closes it and return the output as text.
    pub async fn create_socket_and_wait(&self, service: &str) -> Result<String, AdbError> {
        let mut socket = self.create_socket(service).await?;
        let output = socket.read_to_end().await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    pub fn reverse(&self) -> &ReverseTunnelRegistry {
        &self.reverse
    }

    pub fn dispatcher(&self) -> &PacketDispatcher {
        &self.dispatcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.dispatcher.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }

    /// Close every socket and the connection.
    pub async fn close(&self) {
        self.dispatcher.close().await;
    }

    /// Resolves once the connection is gone, for whatever reason.
    pub async fn closed(&self) {
        self.dispatcher.closed().await;
    }
}

/// Exchange `CNXN`, answering `AUTH` challenges until the device accepts.
async fn handshake<R, W>(
    reader: &mut PacketReader<R>,
    writer: &mut PacketWriter<W>,
    credentials: &dyn CredentialProvider,
    observer: &dyn AuthObserver,
    config: &AdbConfig,
) -> Result<Negotiated, AdbError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let features = config.advertised_features();
    let identity = format!("host::features={}", features.join(","));
    log::debug!("Sending CNXN: {}", identity);
    let connect = Packet::new(Command::Cnxn, ADB_VERSION, config.max_payload_size, identity.into_bytes());
    writer.write_packet(&connect, true).await?;

    let mut auth = AuthProcessor::new(credentials, observer, config.host_name.clone());

    loop {
        let Some((message, payload)) = reader.read_message().await? else {
            return Err(AdbError::ConnectionClosed);
        };

        match message.command {
            Command::Cnxn => {
                let banner = AdbBanner::parse(&String::from_utf8_lossy(&payload));
                let delayed_ack = config.initial_delayed_ack_bytes > 0
                    && features.iter().any(|f| f == feature::DELAYED_ACK)
                    && banner.has_feature(feature::DELAYED_ACK);

                return Ok(Negotiated {
                    version: message.arg0.min(ADB_VERSION),
                    max_payload_size: message.arg1.min(config.max_payload_size),
                    banner,
                    initial_delayed_ack_bytes: if delayed_ack {
                        config.initial_delayed_ack_bytes
                    } else {
                        0
                    },
                });
            }
            Command::Auth => {
                if !message.verify_data(&payload) {
                    return Err(AdbError::MalformedPacket("AUTH checksum mismatch".to_string()));
                }
                let reply = auth.process(&Packet::new(Command::Auth, message.arg0, message.arg1, payload))?;
                writer.write_packet(&reply, true).await?;
            }
            other => {
                // Left over from a previous session.
                log::debug!("Discarding {} during handshake", other);
            }
        }
    }
}
