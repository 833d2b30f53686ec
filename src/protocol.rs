use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Oldest protocol version; packets carry a payload checksum.
pub const ADB_VERSION_MIN: u32 = 0x01000000;

/// From this version on the checksum is skipped and service strings lose their NUL.
pub const ADB_VERSION_SKIP_CHECKSUM: u32 = 0x01000001;

/// Highest version this implementation offers in `CNXN`.
pub const ADB_VERSION: u32 = ADB_VERSION_SKIP_CHECKSUM;

/// Maximum data payload offered during the handshake (Android 9+ accepts 1 MiB).
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// Size of the fixed packet header.
pub const MESSAGE_HEADER_SIZE: usize = 24;

/// Packet command; the discriminant is the ASCII tag read as a little-endian `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Cnxn = 0x4e584e43,
    Auth = 0x48545541,
    /// Open a socket to a service; `arg0` is the opener's id.
    Open = 0x4e45504f,
    /// Socket ready, or acknowledgement of a `WRTE`.
    Okay = 0x59414b4f,
    Clse = 0x45534c43,
    Wrte = 0x45545257,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Cnxn,
        Command::Auth,
        Command::Open,
        Command::Okay,
        Command::Clse,
        Command::Wrte,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u32 == value)
    }

    /// Value of the header's `magic` field for this command.
    pub fn magic(self) -> u32 {
        (self as u32) ^ 0xffffffff
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = (*self as u32).to_le_bytes();
        f.write_str(std::str::from_utf8(&tag).map_err(|_| fmt::Error)?)
    }
}

/// `arg0` of an `AUTH` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Challenge sent by the device.
    Token = 1,
    Signature = 2,
    RsaPublicKey = 3,
}

impl AuthType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AuthType::Token),
            2 => Some(AuthType::Signature),
            3 => Some(AuthType::RsaPublicKey),
            _ => None,
        }
    }
}

/// Fixed packet header as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_crc32: u32,
    pub magic: u32,
}

impl Message {
    /// Create a new message header, checksumming `data`
    pub fn new(command: Command, arg0: u32, arg1: u32, data: &[u8]) -> Self {
        let mut message = Self::without_checksum(command, arg0, arg1, data.len());
        message.data_crc32 = checksum(data);
        message
    }

    /// Create a header whose checksum field is left at zero (protocol v2+).
    pub fn without_checksum(command: Command, arg0: u32, arg1: u32, data_length: usize) -> Self {
        Self {
            command,
            arg0,
            arg1,
            data_length: data_length as u32,
            data_crc32: 0,
            magic: command.magic(),
        }
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut bytes = [0u8; MESSAGE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&(self.command as u32).to_le_bytes());
        bytes[4..8].copy_from_slice(&self.arg0.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.arg1.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.data_length.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.data_crc32.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.magic.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(AdbError::MalformedPacket(format!(
                "header too short: {} bytes",
                bytes.len()
            )));
        }

        let word = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        let raw_command = word(0);
        let magic = word(20);

        // Magic first: a corrupted header is not an unknown command.
        if magic != raw_command ^ 0xffffffff {
            return Err(AdbError::MalformedPacket(format!(
                "magic mismatch: command 0x{:08x}, magic 0x{:08x}",
                raw_command, magic
            )));
        }

        let command = Command::from_u32(raw_command).ok_or_else(|| {
            AdbError::MalformedPacket(format!("unknown command: 0x{:08x}", raw_command))
        })?;

        Ok(Self {
            command,
            arg0: word(4),
            arg1: word(8),
            data_length: word(12),
            data_crc32: word(16),
            magic,
        })
    }

    /// Whether `data` matches the header's length and checksum.
    pub fn verify_data(&self, data: &[u8]) -> bool {
        if self.data_length as usize != data.len() {
            return false;
        }
        checksum(data) == self.data_crc32
    }
}

/// A complete wire unit: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// Header for this packet; the checksum is only filled in when asked for.
    pub fn header(&self, with_checksum: bool) -> Message {
        if with_checksum {
            Message::new(self.command, self.arg0, self.arg1, &self.payload)
        } else {
            Message::without_checksum(self.command, self.arg0, self.arg1, self.payload.len())
        }
    }

    /// Header followed by payload.
    pub fn encode(&self, with_checksum: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header(with_checksum).to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one packet from a complete buffer.
    ///
    /// Trailing bytes after the payload are rejected; use
    /// [`crate::transport::PacketReader`] for stream input.
    pub fn decode(bytes: &[u8]) -> Result<Self, AdbError> {
        let header = Message::from_bytes(bytes)?;
        let body = &bytes[MESSAGE_HEADER_SIZE..];
        if body.len() != header.data_length as usize {
            return Err(AdbError::MalformedPacket(format!(
                "payload length {} does not match header length {}",
                body.len(),
                header.data_length
            )));
        }
        Ok(Self::from_parts(&header, Bytes::copy_from_slice(body)))
    }

    pub(crate) fn from_parts(header: &Message, payload: Bytes) -> Self {
        Self {
            command: header.command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({:#x}, {:#x}, {} bytes)",
            self.command,
            self.arg0,
            self.arg1,
            self.payload.len()
        )
    }
}

/// Sum of payload bytes, as used by the ADB header
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdbError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Socket open rejected by device: {0}")]
    OpenRejected(String),

    #[error("Socket closed")]
    SocketClosed,

    #[error("ADB reverse tunnel is not supported on this device when connected wirelessly")]
    ReverseNotSupported,

    #[error("Reverse tunnel error: {0}")]
    ReverseTunnel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

impl From<std::io::Error> for AdbError {
    fn from(err: std::io::Error) -> Self {
        AdbError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let message = Message::new(Command::Wrte, 7, 9, b"abc");
        let bytes = message.to_bytes();
        assert_eq!(&bytes[0..4], b"WRTE");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 9);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
        assert_eq!(
            u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            b'a' as u32 + b'b' as u32 + b'c' as u32
        );
        assert_eq!(
            u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            Command::Wrte as u32 ^ 0xffffffff
        );
    }

    #[test]
    fn test_without_checksum_leaves_zero() {
        let packet = Packet::new(Command::Wrte, 1, 2, &b"payload"[..]);
        assert_eq!(packet.header(false).data_crc32, 0);
        assert_eq!(packet.header(true).data_crc32, checksum(b"payload"));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let packet = Packet::new(Command::Okay, 1, 2, Bytes::new());
        let mut bytes = packet.encode(false).to_vec();
        bytes.push(0);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(AdbError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_empty_data_checksum() {
        let message = Message::new(Command::Okay, 0, 0, &[]);
        assert_eq!(message.data_crc32, 0);
        assert!(message.verify_data(&[]));
    }
}
