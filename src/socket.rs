//! Logical sockets multiplexed over one connection.
//!
//! Each socket has two halves that evolve independently: an inbound byte
//! stream fed by the dispatcher, and an outbound stream gated by
//! [`WriteCredit`]. The dispatcher keeps the shared [`SocketController`] in its
//! id table; consumers hold an [`AdbSocket`] (or its split halves).

use crate::protocol::{AdbError, Command, Packet};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};

/// Lifecycle of an established socket. Sockets still waiting for the
/// device's `OKAY` live only in the dispatcher's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Both directions live.
    Open,
    /// `CLSE` sent locally; waiting for the device's `CLSE`.
    Closing,
    /// Removed from the dispatcher; no further traffic.
    Closed,
}

/// Outbound flow-control credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCredit {
    /// Classic mode: one unacknowledged `WRTE` at a time.
    Classic { in_flight: bool },
    /// Delayed-ack mode: bytes the device is still willing to accept.
    Bytes(u64),
}

impl WriteCredit {
    /// Credit from the `OKAY` that answered `OPEN` (or the `OPEN` itself for
    /// device-initiated sockets). `None` means classic mode.
    pub fn initial(delayed_ack_bytes: Option<u32>) -> Self {
        match delayed_ack_bytes {
            Some(bytes) => WriteCredit::Bytes(bytes as u64),
            None => WriteCredit::Classic { in_flight: false },
        }
    }

    pub fn can_send(&self, len: usize) -> bool {
        match *self {
            WriteCredit::Classic { in_flight } => !in_flight,
            WriteCredit::Bytes(available) => available >= len as u64,
        }
    }

    /// Take credit for a chunk of `len` bytes. Returns false, leaving the
    /// credit untouched, if the chunk may not be sent yet.
    pub fn try_consume(&mut self, len: usize) -> bool {
        if !self.can_send(len) {
            return false;
        }
        match self {
            WriteCredit::Classic { in_flight } => *in_flight = true,
            WriteCredit::Bytes(available) => *available -= len as u64,
        }
        true
    }

    /// Apply an `OKAY` from the device.
    pub fn ack(&mut self, bytes: u32) {
        match self {
            WriteCredit::Classic { in_flight } => *in_flight = false,
            WriteCredit::Bytes(available) => *available = available.saturating_add(bytes as u64),
        }
    }
}

/// Cheap cloneable handle onto the dispatcher's ordered send queue.
#[derive(Clone)]
pub(crate) struct PacketSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

pub(crate) enum Outbound {
    Packet(Packet),
    /// Flush everything queued before this, then stop the writer.
    Close { shutdown_stream: bool },
}

impl PacketSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub(crate) fn send(&self, packet: Packet) -> Result<(), AdbError> {
        log::trace!("-> {}", packet);
        self.tx
            .send(Outbound::Packet(packet))
            .map_err(|_| AdbError::ConnectionClosed)
    }

    pub(crate) fn close_writer(&self, shutdown_stream: bool) {
        let _ = self.tx.send(Outbound::Close { shutdown_stream });
    }
}

struct Inner {
    credit: WriteCredit,
    close_sent: bool,
    error: Option<AdbError>,
}

/// Per-socket state shared between the dispatcher and the consumer.
pub struct SocketController {
    local_id: u32,
    remote_id: u32,
    service: String,
    local_created: bool,
    delayed_ack: bool,
    max_payload_size: usize,
    sender: PacketSender,
    inner: Mutex<Inner>,
    credit_changed: Notify,
    // Serializes writers so chunks of one write are never interleaved with another's.
    write_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<SocketState>,
    aborted: watch::Sender<bool>,
}

pub(crate) struct SocketInit {
    pub local_id: u32,
    pub remote_id: u32,
    pub service: String,
    pub local_created: bool,
    pub delayed_ack: bool,
    pub max_payload_size: u32,
    pub credit: WriteCredit,
    pub read_queue_capacity: usize,
}

impl SocketController {
    /// Build the controller, its consumer handle, and the staging queue the
    /// dispatcher pushes inbound payloads into.
    pub(crate) fn create(
        init: SocketInit,
        sender: PacketSender,
    ) -> (Arc<SocketController>, AdbSocket, mpsc::UnboundedSender<Bytes>) {
        let (state, _) = watch::channel(SocketState::Open);
        let (aborted, _) = watch::channel(false);
        let controller = Arc::new(SocketController {
            local_id: init.local_id,
            remote_id: init.remote_id,
            service: init.service,
            local_created: init.local_created,
            delayed_ack: init.delayed_ack,
            max_payload_size: init.max_payload_size.max(1) as usize,
            sender,
            inner: Mutex::new(Inner {
                credit: init.credit,
                close_sent: false,
                error: None,
            }),
            credit_changed: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
            state,
            aborted,
        });

        let (staged_tx, staged_rx) = mpsc::unbounded_channel();
        let (consumer_tx, consumer_rx) = mpsc::channel(init.read_queue_capacity.max(1));
        tokio::spawn(deliver(controller.clone(), staged_rx, consumer_tx));

        let socket = AdbSocket {
            controller: controller.clone(),
            inbound: consumer_rx,
            _close_on_drop: Arc::new(CloseOnDrop(controller.clone())),
        };
        (controller, socket, staged_tx)
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn local_created(&self) -> bool {
        self.local_created
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Current outbound credit.
    pub fn credit(&self) -> WriteCredit {
        self.lock().credit
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Error explaining why writes are refused, if they are.
    fn write_error(inner: &Inner) -> Option<AdbError> {
        if let Some(error) = &inner.error {
            return Some(error.clone());
        }
        if inner.close_sent {
            return Some(AdbError::SocketClosed);
        }
        None
    }

    /// Write `data`, split into `WRTE` packets of at most the negotiated
    /// payload size. Each chunk waits for credit on its own, so a large write
    /// may block after some chunks were already sent.
    pub async fn write(&self, data: Bytes) -> Result<(), AdbError> {
        let _guard = self.write_lock.lock().await;

        if let Some(error) = Self::write_error(&self.lock()) {
            return Err(error);
        }

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.max_payload_size).min(data.len());
            self.send_chunk(data.slice(offset..end)).await?;
            offset = end;
        }
        Ok(())
    }

    /// Wait for credit, then queue the `WRTE`. Queuing happens under the same
    /// lock `close` takes, so no chunk can follow this socket's `CLSE`.
    async fn send_chunk(&self, chunk: Bytes) -> Result<(), AdbError> {
        loop {
            let notified = self.credit_changed.notified();
            {
                let mut inner = self.lock();
                if let Some(error) = Self::write_error(&inner) {
                    return Err(error);
                }
                if inner.credit.try_consume(chunk.len()) {
                    return self
                        .sender
                        .send(Packet::new(Command::Wrte, self.local_id, self.remote_id, chunk));
                }
            }
            notified.await;
        }
    }

    /// Credit granted by an `OKAY` from the device.
    pub(crate) fn ack(&self, bytes: u32) {
        self.lock().credit.ack(bytes);
        self.credit_changed.notify_one();
    }

    /// Acknowledge `len` inbound bytes the consumer queue accepted.
    fn send_okay(&self, len: usize) {
        let payload = if self.delayed_ack {
            Bytes::copy_from_slice(&(len as u32).to_le_bytes())
        } else {
            Bytes::new()
        };
        let _ = self
            .sender
            .send(Packet::new(Command::Okay, self.local_id, self.remote_id, payload));
    }

    /// Send `CLSE` once. Pending and future writes fail with `SocketClosed`;
    /// already buffered inbound data stays readable.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.close_sent || inner.error.is_some() {
                return;
            }
            inner.close_sent = true;
        }
        self.state.send_if_modified(|state| {
            if *state == SocketState::Open {
                *state = SocketState::Closing;
                true
            } else {
                false
            }
        });
        self.credit_changed.notify_one();

        log::debug!("Closing socket {} ({})", self.local_id, self.service);
        let _ = self
            .sender
            .send(Packet::new(Command::Clse, self.local_id, self.remote_id, Bytes::new()));
    }

    /// The device sent `CLSE`: answer it if we have not closed yet, then
    /// finish. The inbound stream ends once buffered data is delivered.
    pub(crate) fn remote_closed(&self) {
        self.close();
        self.state.send_replace(SocketState::Closed);
        self.credit_changed.notify_one();
    }

    /// The connection died: every pending and future operation fails with `error`.
    pub(crate) fn fail(&self, error: AdbError) {
        {
            let mut inner = self.lock();
            if inner.error.is_none() {
                inner.error = Some(error);
            }
        }
        self.aborted.send_replace(true);
        self.state.send_replace(SocketState::Closed);
        self.credit_changed.notify_one();
    }

    fn error(&self) -> Option<AdbError> {
        self.lock().error.clone()
    }

    /// Resolves once the socket reached [`SocketState::Closed`].
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SocketState::Closed).await;
    }

    async fn aborted(&self) {
        let mut rx = self.aborted.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

/// Moves staged payloads into the consumer's bounded queue, acknowledging
/// each one once it is queued. Only this socket stalls when its consumer is slow.
async fn deliver(
    controller: Arc<SocketController>,
    mut staged: mpsc::UnboundedReceiver<Bytes>,
    consumer: mpsc::Sender<Bytes>,
) {
    while let Some(chunk) = staged.recv().await {
        let len = chunk.len();
        tokio::select! {
            biased;
            _ = controller.aborted() => break,
            result = consumer.send(chunk) => {
                if result.is_err() {
                    log::trace!("Socket {} reader dropped, discarding {} bytes", controller.local_id, len);
                }
            }
        }
        if controller.state() == SocketState::Open {
            controller.send_okay(len);
        }
    }
}

/// Sends `CLSE` once the last consumer handle of a socket is dropped.
struct CloseOnDrop(Arc<SocketController>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Consumer handle for one logical socket. Dropping it (and every half
/// split from it) closes the socket.
pub struct AdbSocket {
    controller: Arc<SocketController>,
    inbound: mpsc::Receiver<Bytes>,
    _close_on_drop: Arc<CloseOnDrop>,
}

impl std::fmt::Debug for AdbSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbSocket")
            .field("local_id", &self.controller.local_id)
            .field("remote_id", &self.controller.remote_id)
            .field("service", &self.controller.service)
            .field("state", &self.controller.state())
            .finish()
    }
}

impl AdbSocket {
    pub fn local_id(&self) -> u32 {
        self.controller.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.controller.remote_id
    }

    pub fn service(&self) -> &str {
        &self.controller.service
    }

    /// True if this side sent the `OPEN`.
    pub fn local_created(&self) -> bool {
        self.controller.local_created
    }

    pub fn state(&self) -> SocketState {
        self.controller.state()
    }

    pub fn controller(&self) -> &Arc<SocketController> {
        &self.controller
    }

    /// Next inbound chunk; `Ok(None)` once the device closed the socket and
    /// everything it sent has been read.
    pub async fn read(&mut self) -> Result<Option<Bytes>, AdbError> {
        read_next(&self.controller, &mut self.inbound).await
    }

    /// Read until the device closes the socket.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, AdbError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), AdbError> {
        self.controller.write(data.into()).await
    }

    /// Send `CLSE` without waiting for the device. Calling it again is a no-op.
    pub fn close(&self) {
        self.controller.close();
    }

    /// Resolves when the socket is fully torn down.
    pub async fn closed(&self) {
        self.controller.closed().await;
    }

    /// Separate the inbound and outbound halves.
    pub fn split(self) -> (SocketReader, SocketWriter) {
        let writer = SocketWriter {
            controller: self.controller.clone(),
            _close_on_drop: self._close_on_drop.clone(),
        };
        let reader = SocketReader {
            controller: self.controller,
            inbound: self.inbound,
            _close_on_drop: self._close_on_drop,
        };
        (reader, writer)
    }
}

async fn read_next(
    controller: &SocketController,
    inbound: &mut mpsc::Receiver<Bytes>,
) -> Result<Option<Bytes>, AdbError> {
    match inbound.recv().await {
        Some(chunk) => Ok(Some(chunk)),
        None => match controller.error() {
            Some(error) => Err(error),
            None => Ok(None),
        },
    }
}

/// Inbound half of a split socket.
pub struct SocketReader {
    controller: Arc<SocketController>,
    inbound: mpsc::Receiver<Bytes>,
    _close_on_drop: Arc<CloseOnDrop>,
}

impl SocketReader {
    pub async fn read(&mut self) -> Result<Option<Bytes>, AdbError> {
        read_next(&self.controller, &mut self.inbound).await
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, AdbError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Outbound half of a split socket; clones share the same flow-control credit.
#[derive(Clone)]
pub struct SocketWriter {
    controller: Arc<SocketController>,
    _close_on_drop: Arc<CloseOnDrop>,
}

impl SocketWriter {
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), AdbError> {
        self.controller.write(data.into()).await
    }

    pub fn close(&self) {
        self.controller.close();
    }

    pub async fn closed(&self) {
        self.controller.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn socket(credit: WriteCredit, max_payload: u32) -> (AdbSocket, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_, socket, _) = SocketController::create(
            SocketInit {
                local_id: 1,
                remote_id: 100,
                service: "shell:".to_string(),
                local_created: true,
                delayed_ack: matches!(credit, WriteCredit::Bytes(_)),
                max_payload_size: max_payload,
                credit,
                read_queue_capacity: 4,
            },
            PacketSender::new(tx),
        );
        (socket, rx)
    }

    fn next_packet(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<Packet> {
        match rx.try_recv() {
            Ok(Outbound::Packet(packet)) => Some(packet),
            _ => None,
        }
    }

    #[test]
    fn test_classic_credit() {
        let mut credit = WriteCredit::initial(None);
        assert!(credit.try_consume(1 << 20));
        assert!(!credit.can_send(1));
        assert!(!credit.try_consume(1));
        credit.ack(0);
        assert!(credit.can_send(usize::MAX));
    }

    #[test]
    fn test_delayed_credit_never_negative() {
        let mut credit = WriteCredit::initial(Some(10));
        assert!(credit.try_consume(6));
        assert!(!credit.try_consume(5));
        assert_eq!(credit, WriteCredit::Bytes(4));
        credit.ack(1);
        assert!(credit.try_consume(5));
        assert_eq!(credit, WriteCredit::Bytes(0));
    }

    #[tokio::test]
    async fn test_write_waits_for_okay_in_classic_mode() {
        let (socket, mut rx) = socket(WriteCredit::initial(None), 4);
        let controller = socket.controller().clone();

        let writer = tokio::spawn(async move { socket.write(&b"abcdefgh"[..]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = next_packet(&mut rx).unwrap();
        assert_eq!(&first.payload[..], b"abcd");
        assert!(next_packet(&mut rx).is_none(), "second chunk must wait for OKAY");

        controller.ack(0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = next_packet(&mut rx).unwrap();
        assert_eq!(&second.payload[..], b"efgh");

        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_write() {
        let (socket, mut rx) = socket(WriteCredit::initial(Some(0)), 16);
        let (_reader, writer) = socket.split();

        let pending = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.write(&b"blocked"[..]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        writer.close();
        writer.close();
        assert_eq!(pending.await.unwrap(), Err(AdbError::SocketClosed));

        let close = next_packet(&mut rx).unwrap();
        assert_eq!(close.command, Command::Clse);
        assert_eq!((close.arg0, close.arg1), (1, 100));
        assert!(next_packet(&mut rx).is_none(), "CLSE is sent only once");

        assert_eq!(writer.write(&b"late"[..]).await, Err(AdbError::SocketClosed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_write_after_close_when_racing() {
        for _ in 0..200 {
            let (socket, mut rx) = socket(WriteCredit::initial(Some(u32::MAX)), 4);
            let (_reader, writer) = socket.split();

            let pending = {
                let writer = writer.clone();
                tokio::spawn(async move { writer.write(vec![0x61u8; 64]).await })
            };
            tokio::task::yield_now().await;
            writer.close();
            let _ = pending.await.unwrap();

            let mut closed = false;
            while let Ok(Outbound::Packet(packet)) = rx.try_recv() {
                match packet.command {
                    Command::Clse => closed = true,
                    Command::Wrte => assert!(!closed, "WRTE queued after CLSE"),
                    other => panic!("unexpected {}", other),
                }
            }
            assert!(closed);
        }
    }

    #[tokio::test]
    async fn test_dropping_last_half_closes() {
        let (socket, mut rx) = socket(WriteCredit::initial(None), 16);
        let (reader, writer) = socket.split();

        drop(writer);
        assert!(next_packet(&mut rx).is_none(), "reader still alive");

        drop(reader);
        let close = next_packet(&mut rx).unwrap();
        assert_eq!(close.command, Command::Clse);
        assert_eq!((close.arg0, close.arg1), (1, 100));
    }

    #[tokio::test]
    async fn test_fail_surfaces_error_to_reader() {
        let (mut socket, _rx) = socket(WriteCredit::initial(None), 16);
        socket.controller().fail(AdbError::Transport("usb gone".to_string()));
        assert_eq!(
            socket.read().await,
            Err(AdbError::Transport("usb gone".to_string()))
        );
        assert_eq!(socket.state(), SocketState::Closed);
    }
}
