//! Packet encoding and decoding for the Tinkamo protocol.
//!
//! Every notification and every command shares one layout:
//! ```text
//! ┌──────┬──────┬────────┬──────────┬─────────┬────────┬──────┬─────────┬───────────┐
//! │ 0x5A │ 0xAB │ len+7  │ reserved │ version │ module │ port │ command │ payload   │
//! │  1   │  1   │   1    │    2     │    1    │   1    │  1   │    1    │ len bytes │
//! └──────┴──────┴────────┴──────────┴─────────┴────────┴──────┴─────────┴───────────┘
//! ```
//!
//! Analog values travel as `(integer, fraction)` byte pairs meaning
//! `integer + fraction / 255`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::ModuleType;

/// Sync bytes opening every packet.
pub const SYNC: [u8; 2] = [0x5A, 0xAB];

/// Number of header bytes before the payload.
pub const HEADER_LEN: usize = 9;

/// Shortest packet that carries a payload byte.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + 1;

/// Value added to the payload length in byte 2.
pub const LENGTH_BIAS: usize = 7;

/// Longest payload the length byte can describe.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - LENGTH_BIAS;

/// Protocol version assumed until the core reports its own.
pub const DEFAULT_PROTOCOL_VERSION: u8 = 2;

/// A packet split into its header fields and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    /// Whether the two sync bytes matched.
    pub header_valid: bool,
    /// Byte 2, informational only.
    pub total_length: u8,
    /// Protocol version of the sender.
    pub protocol_version: u8,
    /// Raw module type id.
    pub module_type: u8,
    /// Port the module sits on.
    pub port: u8,
    /// Command id.
    pub command_id: u8,
    /// Everything after the header.
    pub payload: Bytes,
}

impl DecodedPacket {
    /// Returns the module type if the id is known.
    #[must_use]
    pub const fn module(&self) -> Option<ModuleType> {
        ModuleType::from_byte(self.module_type)
    }
}

/// Decodes a raw notification.
///
/// Packets shorter than [`MIN_PACKET_LEN`] are a transport truncation and
/// carry no sensor data. The sync bytes are reported through
/// `header_valid` but not enforced, since cores in the field are known to
/// send packets that only differ in framing.
pub fn decode(raw: &[u8]) -> Result<DecodedPacket, ProtocolError> {
    if raw.len() < MIN_PACKET_LEN {
        return Err(ProtocolError::Truncated { len: raw.len() });
    }

    Ok(DecodedPacket {
        header_valid: raw[..2] == SYNC,
        total_length: raw[2],
        protocol_version: raw[5],
        module_type: raw[6],
        port: raw[7],
        command_id: raw[8],
        payload: Bytes::copy_from_slice(&raw[HEADER_LEN..]),
    })
}

/// A command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    /// A single byte.
    Byte(u8),
    /// A 16-bit value, sent high byte first.
    Word(u16),
    /// Text, sent as its character bytes.
    Text(&'a str),
    /// Raw bytes, sent as-is.
    Bytes(&'a [u8]),
}

impl Arg<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Byte(_) => 1,
            Self::Word(_) => 2,
            Self::Text(s) => s.len(),
            Self::Bytes(b) => b.len(),
        }
    }
}

impl From<u8> for Arg<'_> {
    fn from(value: u8) -> Self {
        Self::Byte(value)
    }
}

impl From<u16> for Arg<'_> {
    fn from(value: u16) -> Self {
        Self::Word(value)
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Self::Text(value)
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Self::Bytes(value)
    }
}

/// Flattens arguments into payload bytes.
#[must_use]
pub fn encode_args(args: &[Arg<'_>]) -> Bytes {
    let mut buf = BytesMut::with_capacity(args.iter().map(Arg::encoded_len).sum());
    for arg in args {
        match arg {
            Arg::Byte(b) => buf.put_u8(*b),
            Arg::Word(w) => buf.put_u16(*w),
            Arg::Text(s) => buf.put_slice(s.as_bytes()),
            Arg::Bytes(b) => buf.put_slice(b),
        }
    }
    buf.freeze()
}

/// Header fields for an outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Protocol version to stamp into byte 5.
    pub protocol_version: u8,
    /// Target module type id.
    pub module_type: u8,
    /// Target port.
    pub port: u8,
    /// Command id.
    pub command_id: u8,
}

impl PacketHeader {
    /// Creates a header with the default protocol version.
    #[must_use]
    pub const fn new(module_type: u8, port: u8, command_id: u8) -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            module_type,
            port,
            command_id,
        }
    }

    /// Sets the protocol version.
    #[must_use]
    pub const fn protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }
}

/// Encodes a packet from already-flattened payload bytes.
pub fn encode_payload(header: PacketHeader, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLong {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&SYNC);
    buf.put_u8((payload.len() + LENGTH_BIAS) as u8);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u8(header.protocol_version);
    buf.put_u8(header.module_type);
    buf.put_u8(header.port);
    buf.put_u8(header.command_id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encodes a packet from typed arguments.
pub fn encode(header: PacketHeader, args: &[Arg<'_>]) -> Result<Bytes, ProtocolError> {
    encode_payload(header, &encode_args(args))
}

/// Combines an `(integer, fraction)` pair into `integer + fraction / 255`.
#[must_use]
pub fn fixed_point(integer: u8, fraction: u8) -> f64 {
    f64::from(integer) + f64::from(fraction) / 255.0
}
