//! Module type identifiers for the Tinkamo protocol.
//!
//! Byte 6 of every packet names the module the packet is about. This table
//! is the only place the numeric ids are spelled out; everything else
//! dispatches on [`ModuleType`].

/// Protocol-defined module type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModuleType {
    /// The core itself; also carries connection-marker packets.
    Core = 0,

    // Input tops
    /// Push button.
    Button = 1,
    /// Rotary knob.
    Knob = 2,
    /// Linear slider.
    Slider = 3,
    /// Two-axis joystick.
    Joystick = 4,

    // Output tops
    /// DC motor.
    Motor = 5,
    /// Servo motor.
    Servo = 6,
    /// 5x5 LED matrix.
    LedMatrix = 11,

    // Sensor tops
    /// Laser distance sensor.
    Distance = 23,
    /// Color and lightness sensor (early 2019).
    Color = 27,
    /// Color and lightness sensor (late 2019, improved LEDs).
    Color2019 = 28,
}

impl ModuleType {
    /// Attempts to parse a module type from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Core),
            1 => Some(Self::Button),
            2 => Some(Self::Knob),
            3 => Some(Self::Slider),
            4 => Some(Self::Joystick),
            5 => Some(Self::Motor),
            6 => Some(Self::Servo),
            11 => Some(Self::LedMatrix),
            23 => Some(Self::Distance),
            27 => Some(Self::Color),
            28 => Some(Self::Color2019),
            _ => None,
        }
    }

    /// Returns the wire id.
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Returns the canonical top name used in events and OSC addresses.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Core => "connection",
            Self::Button => "button",
            Self::Knob => "knob",
            Self::Slider => "slider",
            Self::Joystick => "joystick",
            Self::Motor => "motor",
            Self::Servo => "servo",
            Self::LedMatrix => "pixel",
            Self::Distance => "distance",
            Self::Color | Self::Color2019 => "color",
        }
    }

    /// Returns true for tops that only accept commands.
    #[must_use]
    pub const fn is_actuator(self) -> bool {
        matches!(self, Self::Motor | Self::Servo | Self::LedMatrix)
    }
}

impl From<ModuleType> for u8 {
    fn from(module: ModuleType) -> Self {
        module as Self
    }
}

impl TryFrom<u8> for ModuleType {
    type Error = crate::error::ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_byte(byte).ok_or(crate::error::ProtocolError::UnknownModuleType(byte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_module_type_from_byte() {
        assert_eq!(ModuleType::from_byte(0), Some(ModuleType::Core));
        assert_eq!(ModuleType::from_byte(3), Some(ModuleType::Slider));
        assert_eq!(ModuleType::from_byte(23), Some(ModuleType::Distance));
        assert_eq!(ModuleType::from_byte(28), Some(ModuleType::Color2019));
        assert_eq!(ModuleType::from_byte(7), None);
        assert_eq!(ModuleType::from_byte(0xFF), None);
    }

    #[test]
    fn test_ids_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(module) = ModuleType::from_byte(byte) {
                assert_eq!(module.id(), byte);
            }
        }
    }

    #[test]
    fn test_slider_and_knob_names_differ() {
        assert_eq!(ModuleType::Knob.name(), "knob");
        assert_eq!(ModuleType::Slider.name(), "slider");
    }

    #[test]
    fn test_both_color_generations_share_name() {
        assert_eq!(ModuleType::Color.name(), ModuleType::Color2019.name());
    }

    #[test]
    fn test_try_from_unknown() {
        assert_eq!(
            ModuleType::try_from(99),
            Err(ProtocolError::UnknownModuleType(99))
        );
    }
}
