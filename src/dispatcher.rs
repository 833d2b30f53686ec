//! Packet dispatcher for an authenticated connection.
//!
//! Owns the only reader task and the only writer task of the transport.
//! Incoming packets are handled strictly in order and synchronously: every
//! side effect (id table change, credit update, payload staging) is done
//! before the next packet is read. Outgoing packets from all sockets go
//! through one unbounded queue, so wire order equals submission order.

use crate::protocol::{AdbError, Command, Packet};
use crate::socket::{AdbSocket, Outbound, PacketSender, SocketController, SocketInit, WriteCredit};
use crate::transport::{PacketReader, PacketWriter};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};

/// Accepts sockets the device opens towards a registered reverse-tunnel
/// address. Long-running work should be spawned; returning an error closes
/// the socket.
pub type ReverseTunnelHandler = Arc<dyn Fn(AdbSocket) -> Result<(), AdbError> + Send + Sync>;

/// Dispatcher settings fixed at handshake time.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Fill in payload checksums (protocol versions before skip-checksum).
    pub calculate_checksum: bool,
    /// Terminate `OPEN` service strings with NUL (same versions).
    pub append_null_to_service: bool,
    pub max_payload_size: u32,
    /// Negotiated receive window per socket; `0` selects classic flow control.
    pub initial_delayed_ack_bytes: u32,
    pub read_queue_capacity: usize,
    /// Keep the underlying stream open after the dispatcher stops.
    pub preserve_connection: bool,
}

impl DispatcherOptions {
    fn delayed_ack(&self) -> bool {
        self.initial_delayed_ack_bytes != 0
    }
}

/// Socket table changes, for observers such as connection managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Added {
        local_id: u32,
        remote_id: u32,
        service: String,
        local_created: bool,
    },
    Removed {
        local_id: u32,
        remote_id: u32,
    },
}

enum Slot {
    /// `OPEN` sent, waiting for `OKAY` or `CLSE`. Only the local id is known.
    Opening {
        service: String,
        reply: oneshot::Sender<Result<AdbSocket, AdbError>>,
    },
    Open {
        controller: Arc<SocketController>,
        inbound: mpsc::UnboundedSender<Bytes>,
    },
}

struct Table {
    next_local_id: u32,
    sockets: HashMap<u32, Slot>,
    handlers: HashMap<String, ReverseTunnelHandler>,
    error: Option<AdbError>,
}

impl Table {
    /// Ids are never reused while a socket with that id is live; 0 is reserved.
    fn allocate_local_id(&mut self) -> u32 {
        loop {
            let id = self.next_local_id;
            self.next_local_id = self.next_local_id.wrapping_add(1).max(1);
            if id != 0 && !self.sockets.contains_key(&id) {
                return id;
            }
        }
    }
}

struct Shared {
    options: DispatcherOptions,
    sender: PacketSender,
    table: Mutex<Table>,
    events: broadcast::Sender<SocketEvent>,
    stop_reading: Notify,
    closed: watch::Sender<bool>,
}

/// Routes packets between the transport and the logical sockets.
#[derive(Clone)]
pub struct PacketDispatcher {
    shared: Arc<Shared>,
}

impl PacketDispatcher {
    /// Take over both halves of an authenticated transport and start the
    /// reader and writer tasks.
    pub fn spawn<R, W>(reader: PacketReader<R>, writer: PacketWriter<W>, options: DispatcherOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            options,
            sender: PacketSender::new(tx),
            table: Mutex::new(Table {
                next_local_id: 1,
                sockets: HashMap::new(),
                handlers: HashMap::new(),
                error: None,
            }),
            events,
            stop_reading: Notify::new(),
            closed,
        });

        tokio::spawn(read_loop(shared.clone(), reader));
        tokio::spawn(write_loop(shared.clone(), writer, rx));

        Self { shared }
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.shared.options
    }

    /// Open a socket to `service` on the device and wait for it to accept.
    pub async fn create_socket(&self, service: &str) -> Result<AdbSocket, AdbError> {
        let (reply, accepted) = oneshot::channel();
        let local_id = {
            let mut table = self.shared.lock();
            if let Some(error) = &table.error {
                return Err(error.clone());
            }
            let local_id = table.allocate_local_id();
            table.sockets.insert(
                local_id,
                Slot::Opening {
                    service: service.to_string(),
                    reply,
                },
            );
            local_id
        };

        let mut payload = service.as_bytes().to_vec();
        if self.shared.options.append_null_to_service {
            payload.push(0);
        }

        log::debug!("Opening socket {} for {}", local_id, service);
        let open = Packet::new(
            Command::Open,
            local_id,
            self.shared.options.initial_delayed_ack_bytes,
            payload,
        );
        if let Err(e) = self.shared.sender.send(open) {
            self.shared.lock().sockets.remove(&local_id);
            return Err(e);
        }

        match accepted.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.error().unwrap_or(AdbError::ConnectionClosed)),
        }
    }

    /// Route device-initiated `OPEN`s for `address` to `handler`.
    pub fn register_handler(&self, address: impl Into<String>, handler: ReverseTunnelHandler) {
        self.shared.lock().handlers.insert(address.into(), handler);
    }

    pub fn unregister_handler(&self, address: &str) {
        self.shared.lock().handlers.remove(address);
    }

    pub fn clear_handlers(&self) {
        self.shared.lock().handlers.clear();
    }

    /// Number of sockets currently in the id table, including pending opens.
    pub fn socket_count(&self) -> usize {
        self.shared.lock().sockets.len()
    }

    /// Subscribe to socket add/remove events; drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Why the dispatcher stopped, once it has.
    pub fn error(&self) -> Option<AdbError> {
        self.shared.error()
    }

    /// Resolves once the dispatcher has torn down.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close every socket, flush the send queue and stop both tasks.
    pub async fn close(&self) {
        let controllers: Vec<Arc<SocketController>> = self
            .shared
            .lock()
            .sockets
            .values()
            .filter_map(|slot| match slot {
                Slot::Open { controller, .. } => Some(controller.clone()),
                Slot::Opening { .. } => None,
            })
            .collect();
        for controller in controllers {
            controller.close();
        }

        self.shared.teardown(AdbError::ConnectionClosed);
        self.closed().await;
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn error(&self) -> Option<AdbError> {
        self.lock().error.clone()
    }

    fn emit(&self, event: SocketEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn send(&self, command: Command, arg0: u32, arg1: u32, payload: Bytes) {
        if let Err(e) = self.sender.send(Packet::new(command, arg0, arg1, payload)) {
            log::debug!("Dropping {} for a stopped connection: {}", command, e);
        }
    }

    fn new_socket(&self, local_id: u32, remote_id: u32, service: String, local_created: bool, credit: WriteCredit) -> (Slot, AdbSocket) {
        let (controller, socket, inbound) = SocketController::create(
            SocketInit {
                local_id,
                remote_id,
                service,
                local_created,
                delayed_ack: self.options.delayed_ack(),
                max_payload_size: self.options.max_payload_size,
                credit,
                read_queue_capacity: self.options.read_queue_capacity,
            },
            self.sender.clone(),
        );
        (Slot::Open { controller, inbound }, socket)
    }

    fn handle_packet(&self, packet: Packet) -> Result<(), AdbError> {
        log::trace!("<- {}", packet);
        match packet.command {
            Command::Open => self.handle_open(packet),
            Command::Okay => self.handle_okay(packet),
            Command::Wrte => {
                self.handle_write(packet);
                Ok(())
            }
            Command::Clse => {
                self.handle_close(packet);
                Ok(())
            }
            Command::Cnxn | Command::Auth => Err(AdbError::Protocol(format!(
                "unexpected {} after handshake",
                packet.command
            ))),
        }
    }

    /// Credit carried by an `OKAY`: a 4-byte count in delayed-ack mode,
    /// nothing in classic mode.
    fn okay_credit(&self, packet: &Packet) -> Result<u32, AdbError> {
        if self.options.delayed_ack() {
            let bytes: [u8; 4] = packet.payload[..].try_into().map_err(|_| {
                AdbError::Protocol(format!(
                    "OKAY payload must be 4 bytes with delayed ack, got {}",
                    packet.payload.len()
                ))
            })?;
            Ok(u32::from_le_bytes(bytes))
        } else if packet.payload.is_empty() {
            Ok(0)
        } else {
            Err(AdbError::Protocol(format!(
                "OKAY payload must be empty without delayed ack, got {} bytes",
                packet.payload.len()
            )))
        }
    }

    fn handle_okay(&self, packet: Packet) -> Result<(), AdbError> {
        let credit = self.okay_credit(&packet)?;
        let (remote_id, local_id) = (packet.arg0, packet.arg1);

        let mut table = self.lock();
        match table.sockets.remove(&local_id) {
            Some(Slot::Opening { service, reply }) => {
                let initial = WriteCredit::initial(self.options.delayed_ack().then_some(credit));
                let (slot, socket) = self.new_socket(local_id, remote_id, service.clone(), true, initial);
                table.sockets.insert(local_id, slot);
                drop(table);

                log::debug!("Socket {} ({}) opened, remote id {}", local_id, service, remote_id);
                self.emit(SocketEvent::Added {
                    local_id,
                    remote_id,
                    service,
                    local_created: true,
                });
                if let Err(Ok(socket)) = reply.send(Ok(socket)) {
                    // The opener gave up waiting.
                    socket.close();
                }
            }
            Some(Slot::Open { controller, inbound }) if controller.remote_id() == remote_id => {
                controller.ack(credit);
                table.sockets.insert(local_id, Slot::Open { controller, inbound });
            }
            other => {
                if let Some(slot) = other {
                    table.sockets.insert(local_id, slot);
                }
                drop(table);
                // Probably left over from a previous connection.
                log::debug!("OKAY for unknown socket {}/{}, closing it", local_id, remote_id);
                self.send(Command::Clse, local_id, remote_id, Bytes::new());
            }
        }
        Ok(())
    }

    fn handle_write(&self, packet: Packet) {
        let (remote_id, local_id) = (packet.arg0, packet.arg1);
        let table = self.lock();
        match table.sockets.get(&local_id) {
            Some(Slot::Open { controller, inbound }) if controller.remote_id() == remote_id => {
                let len = packet.payload.len();
                if inbound.send(packet.payload).is_err() {
                    // Delivery already stopped; keep the device flowing.
                    log::trace!("Socket {} not reading, discarding {} bytes", local_id, len);
                }
            }
            _ => {
                // Closed locally and the device has not noticed yet.
                log::trace!("WRTE for unknown socket {}/{}, ignored", local_id, remote_id);
            }
        }
    }

    fn handle_close(&self, packet: Packet) {
        let (remote_id, local_id) = (packet.arg0, packet.arg1);
        let mut table = self.lock();
        match table.sockets.remove(&local_id) {
            Some(Slot::Opening { service, reply }) => {
                drop(table);
                log::debug!("Device refused to open {}", service);
                let _ = reply.send(Err(AdbError::OpenRejected(service)));
            }
            // Matched on the local id only: old adbd sends CLSE(0, local-id)
            // for ordinary closes too.
            Some(Slot::Open { controller, .. }) => {
                drop(table);
                log::debug!("Socket {} ({}) closed by device", local_id, controller.service());
                controller.remote_closed();
                self.emit(SocketEvent::Removed {
                    local_id,
                    remote_id: controller.remote_id(),
                });
            }
            None => {
                log::trace!("CLSE for unknown socket {}/{}, ignored", local_id, remote_id);
            }
        }
    }

    fn handle_open(&self, packet: Packet) -> Result<(), AdbError> {
        let remote_id = packet.arg0;
        let service = String::from_utf8_lossy(&packet.payload)
            .trim_end_matches('\0')
            .to_string();

        let initial = if self.options.delayed_ack() {
            if packet.arg1 == 0 {
                log::warn!("OPEN {} without initial credit, refusing", service);
                self.send(Command::Clse, 0, remote_id, Bytes::new());
                return Ok(());
            }
            WriteCredit::initial(Some(packet.arg1))
        } else {
            if packet.arg1 != 0 {
                log::warn!("OPEN {} with unexpected credit {}, refusing", service, packet.arg1);
                self.send(Command::Clse, 0, remote_id, Bytes::new());
                return Ok(());
            }
            WriteCredit::initial(None)
        };

        let mut table = self.lock();
        let Some(handler) = table.handlers.get(&service).cloned() else {
            drop(table);
            log::debug!("No reverse tunnel for {}, refusing", service);
            self.send(Command::Clse, 0, remote_id, Bytes::new());
            return Ok(());
        };

        let local_id = table.allocate_local_id();
        let (slot, socket) = self.new_socket(local_id, remote_id, service.clone(), false, initial);
        table.sockets.insert(local_id, slot);
        drop(table);

        let window = if self.options.delayed_ack() {
            Bytes::copy_from_slice(&self.options.initial_delayed_ack_bytes.to_le_bytes())
        } else {
            Bytes::new()
        };
        self.send(Command::Okay, local_id, remote_id, window);

        log::debug!("Device opened socket {} to {}", local_id, service);
        self.emit(SocketEvent::Added {
            local_id,
            remote_id,
            service: service.clone(),
            local_created: false,
        });

        let controller = socket.controller().clone();
        if let Err(e) = handler(socket) {
            log::warn!("Reverse tunnel handler for {} failed: {}", service, e);
            controller.close();
        }
        Ok(())
    }

    /// Fail every socket and pending open with `error` and stop both tasks.
    /// Only the first call has an effect.
    fn teardown(&self, error: AdbError) {
        let slots: Vec<(u32, Slot)> = {
            let mut table = self.lock();
            if table.error.is_some() {
                return;
            }
            table.error = Some(error.clone());
            table.handlers.clear();
            table.sockets.drain().collect()
        };

        match &error {
            AdbError::ConnectionClosed => log::info!("Connection closed"),
            other => log::warn!("Connection failed: {}", other),
        }

        for (local_id, slot) in slots {
            match slot {
                Slot::Opening { reply, .. } => {
                    let _ = reply.send(Err(error.clone()));
                }
                Slot::Open { controller, .. } => {
                    controller.fail(error.clone());
                    self.emit(SocketEvent::Removed {
                        local_id,
                        remote_id: controller.remote_id(),
                    });
                }
            }
        }

        self.sender.close_writer(!self.options.preserve_connection);
        self.stop_reading.notify_one();
        self.closed.send_replace(true);
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: PacketReader<R>)
where
    R: AsyncRead + Unpin,
{
    let error = loop {
        let packet = tokio::select! {
            _ = shared.stop_reading.notified() => break AdbError::ConnectionClosed,
            packet = reader.read_packet() => packet,
        };
        match packet {
            Ok(Some(packet)) => {
                if let Err(e) = shared.handle_packet(packet) {
                    break e;
                }
            }
            Ok(None) => break AdbError::ConnectionClosed,
            Err(e) => break e,
        }
    };
    shared.teardown(error);
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: PacketWriter<W>, mut queue: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    let checksum = shared.options.calculate_checksum;
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Packet(packet) => {
                if let Err(e) = writer.write_packet(&packet, checksum).await {
                    shared.teardown(e);
                    break;
                }
            }
            Outbound::Close { shutdown_stream } => {
                if shutdown_stream {
                    let _ = writer.shutdown().await;
                }
                break;
            }
        }
    }
}
