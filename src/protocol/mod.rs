//! Protocol definitions for Tinkamo communication.
//!
//! This module contains the low-level protocol types including:
//! - Packet encoding/decoding
//! - Module type ids
//! - Command ids

pub mod command;
pub mod module_type;
pub mod packet;

pub use command::{
    CalibrationPoint, Command, CoreCommand, MotorCommand, PixelCommand, ServoCommand,
};
pub use module_type::ModuleType;
pub use packet::{
    Arg, DEFAULT_PROTOCOL_VERSION, DecodedPacket, MIN_PACKET_LEN, PacketHeader, SYNC, decode,
    encode, encode_payload, fixed_point,
};
