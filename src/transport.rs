//! Packet framing over a duplex byte stream.
//!
//! The physical link (USB bulk endpoints, a TCP socket, an in-memory pipe in
//! tests) only has to provide `AsyncRead`/`AsyncWrite`. The reader and writer
//! halves are framed separately so that the handshake can borrow them and the
//! dispatcher can later take ownership of each half in its own task.

use crate::protocol::{AdbError, Message, Packet, MESSAGE_HEADER_SIZE};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Split a duplex stream into framed halves.
pub fn split<T>(stream: T, max_payload: u32) -> (PacketReader<ReadHalf<T>>, PacketWriter<WriteHalf<T>>)
where
    T: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (PacketReader::new(read, max_payload), PacketWriter::new(write))
}

/// Reads whole packets from the inbound half of the transport.
pub struct PacketReader<R> {
    inner: R,
    max_payload: u32,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// `max_payload` bounds how large a payload this reader will allocate for.
    pub fn new(inner: R, max_payload: u32) -> Self {
        Self { inner, max_payload }
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Read one header and its payload.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a packet boundary.
    /// A stream that ends inside a header or payload is a malformed packet.
    pub async fn read_message(&mut self) -> Result<Option<(Message, Bytes)>, AdbError> {
        let mut header = [0u8; MESSAGE_HEADER_SIZE];
        if !self.fill(&mut header, true).await? {
            return Ok(None);
        }
        let message = Message::from_bytes(&header)?;

        if message.data_length > self.max_payload {
            return Err(AdbError::MalformedPacket(format!(
                "{} payload of {} bytes exceeds limit of {}",
                message.command, message.data_length, self.max_payload
            )));
        }

        let mut payload = BytesMut::zeroed(message.data_length as usize);
        if !payload.is_empty() {
            self.fill(&mut payload, false).await?;
        }
        Ok(Some((message, payload.freeze())))
    }

    /// Like [`read_message`](Self::read_message), returning the assembled packet.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, AdbError> {
        Ok(self
            .read_message()
            .await?
            .map(|(message, payload)| Packet::from_parts(&message, payload)))
    }

    /// Transports may hand back fewer bytes than requested, so keep reading
    /// until `buf` is full. Returns `false` only for a clean end of stream
    /// before the first byte when `eof_ok` is set.
    async fn fill(&mut self, buf: &mut [u8], eof_ok: bool) -> Result<bool, AdbError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 && eof_ok {
                    return Ok(false);
                }
                return Err(AdbError::MalformedPacket(format!(
                    "stream ended after {} of {} bytes",
                    filled,
                    buf.len()
                )));
            }
            filled += n;
        }
        Ok(true)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes whole packets to the outbound half of the transport.
///
/// Only one task may own a writer; the dispatcher funnels every send through
/// a single queue so headers and payloads never interleave.
pub struct PacketWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send an ADB packet
    pub async fn write_packet(&mut self, packet: &Packet, with_checksum: bool) -> Result<(), AdbError> {
        let header = packet.header(with_checksum);
        self.inner.write_all(&header.to_bytes()).await?;
        if !packet.payload.is_empty() {
            self.inner.write_all(&packet.payload).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the outbound half of the transport.
    pub async fn shutdown(&mut self) -> Result<(), AdbError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
