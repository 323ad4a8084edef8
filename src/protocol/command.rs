//! Command ids for the Tinkamo protocol.
//!
//! Command ids are scoped by module type: `0x00` means "read input" to a
//! button and "set power" to a motor. Core-level ids live in the high range
//! so they never collide with top commands.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::protocol::ModuleType;
use crate::protocol::packet::{Arg, PacketHeader, encode_args, encode_payload};

/// Command ids understood by every core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreCommand {
    /// Ask a module for its current input value.
    ReadInput = 0x00,
    /// Set the power LED color (color index 0-7).
    SetLedColor = 0xFD,
    /// Battery/power status.
    PowerStatus = 0xFE,
    /// Protocol version of the core firmware.
    ProtocolVersion = 0xFF,
}

impl CoreCommand {
    /// Attempts to parse a core command from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::ReadInput),
            0xFD => Some(Self::SetLedColor),
            0xFE => Some(Self::PowerStatus),
            0xFF => Some(Self::ProtocolVersion),
            _ => None,
        }
    }
}

impl From<CoreCommand> for u8 {
    fn from(cmd: CoreCommand) -> Self {
        cmd as Self
    }
}

/// Motor command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MotorCommand {
    /// Set direction and power.
    SetPower = 0x00,
}

impl From<MotorCommand> for u8 {
    fn from(cmd: MotorCommand) -> Self {
        cmd as Self
    }
}

/// Servo command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServoCommand {
    /// Turn to a calibrated angle.
    SetAngle = 0x00,
    /// Swing back and forth.
    Swing = 0x01,
    /// Stop powering the servo.
    Rest = 0x02,
    /// Store the current position as a calibration point.
    Calibrate = 0x03,
    /// Reset calibration to factory defaults.
    ClearCalibration = 0x04,
    /// Turn to an uncalibrated angle.
    SetRawAngle = 0x06,
}

impl From<ServoCommand> for u8 {
    fn from(cmd: ServoCommand) -> Self {
        cmd as Self
    }
}

/// Servo calibration points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CalibrationPoint {
    /// Leftmost position.
    Left = 0,
    /// Center position.
    Center = 1,
    /// Rightmost position.
    Right = 2,
}

/// LED matrix command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PixelCommand {
    /// Set one pixel.
    DrawPixel = 0x00,
    /// Replace the whole 5x5 bitmap.
    DrawBitmap = 0x01,
}

impl From<PixelCommand> for u8 {
    fn from(cmd: PixelCommand) -> Self {
        cmd as Self
    }
}

/// An outgoing command.
///
/// The port and protocol version are filled in by the session that sends
/// it, since only the session knows which port the top sits on and which
/// firmware generation it is talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Target module type.
    pub module_type: ModuleType,
    /// Command id.
    pub command_id: u8,
    /// Flattened argument bytes.
    pub payload: Bytes,
    /// Whether the write is repeated until the module echoes the command id.
    pub verify: bool,
}

impl Command {
    /// Creates an unverified command.
    #[must_use]
    pub fn new(module_type: ModuleType, command_id: impl Into<u8>, args: &[Arg<'_>]) -> Self {
        Self {
            module_type,
            command_id: command_id.into(),
            payload: encode_args(args),
            verify: false,
        }
    }

    /// Marks the command as a verified write.
    #[must_use]
    pub fn verified(mut self) -> Self {
        self.verify = true;
        self
    }

    /// Asks a module for its current input value.
    #[must_use]
    pub fn read_input(module_type: ModuleType) -> Self {
        Self::new(module_type, CoreCommand::ReadInput, &[])
    }

    /// Asks the core which top is attached. The reply is a connection
    /// marker.
    #[must_use]
    pub fn check_ports() -> Self {
        Self::read_input(ModuleType::Core)
    }

    /// Sets the core's power LED color.
    #[must_use]
    pub fn set_led_color(color: u8) -> Self {
        Self::new(ModuleType::Core, CoreCommand::SetLedColor, &[Arg::Byte(color)]).verified()
    }

    /// Requests the battery status.
    #[must_use]
    pub fn request_battery() -> Self {
        Self::new(ModuleType::Core, CoreCommand::PowerStatus, &[])
    }

    /// Requests the firmware protocol version.
    #[must_use]
    pub fn request_protocol_version() -> Self {
        Self::new(ModuleType::Core, CoreCommand::ProtocolVersion, &[])
    }

    /// Encodes the command into a wire packet.
    pub fn encode(&self, port: u8, protocol_version: u8) -> Result<Bytes, ProtocolError> {
        let header = PacketHeader::new(self.module_type.id(), port, self.command_id)
            .protocol_version(protocol_version);
        encode_payload(header, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_command_values() {
        assert_eq!(CoreCommand::ReadInput as u8, 0x00);
        assert_eq!(CoreCommand::SetLedColor as u8, 0xFD);
        assert_eq!(CoreCommand::PowerStatus as u8, 0xFE);
        assert_eq!(CoreCommand::ProtocolVersion as u8, 0xFF);
        assert_eq!(CoreCommand::from_byte(0xFE), Some(CoreCommand::PowerStatus));
        assert_eq!(CoreCommand::from_byte(0x42), None);
    }

    #[test]
    fn test_servo_command_values() {
        assert_eq!(ServoCommand::SetAngle as u8, 0x00);
        assert_eq!(ServoCommand::Rest as u8, 0x02);
        assert_eq!(ServoCommand::SetRawAngle as u8, 0x06);
    }

    #[test]
    fn test_led_color_is_verified() {
        let cmd = Command::set_led_color(4);
        assert!(cmd.verify);
        assert_eq!(cmd.module_type, ModuleType::Core);
        assert_eq!(&cmd.payload[..], &[4]);
    }

    #[test]
    fn test_status_requests() {
        let ports = Command::check_ports();
        assert_eq!((ports.module_type, ports.command_id), (ModuleType::Core, 0x00));
        assert!(!ports.verify);
        let battery = Command::request_battery();
        assert_eq!(battery.command_id, 0xFE);
        assert!(battery.payload.is_empty());
    }

    #[test]
    fn test_command_encode() {
        let cmd = Command::read_input(ModuleType::Knob);
        let bytes = cmd.encode(1, 3).unwrap();
        assert_eq!(&bytes[..], &[0x5A, 0xAB, 7, 0, 0, 3, 2, 1, 0]);
    }
}
