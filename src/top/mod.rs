//! Interpretation of the tops that snap onto a core.
//!
//! A [`Top`] is a plain value: which kind of module is attached. Turning a
//! payload into a [`Reading`] is a pure function of the top kind and the
//! payload, so the session never holds per-top state beyond "which top".
//!
//! Output tops (motor, servo, LED matrix) have command builders in
//! [`actuator`].

pub mod actuator;
pub mod mapping;
mod sensor;

pub use sensor::DISTANCE_MAX;

use crate::protocol::ModuleType;
use crate::types::Reading;

/// The kind of top attached to a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Top {
    /// A module type this library knows how to talk to.
    Known(ModuleType),
    /// A connection marker named an id with no known interpretation.
    Unsupported(u8),
}

/// Why a payload produced no reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuppressReason {
    /// The value is the sensor's "nothing in range" report.
    OutOfRange,
    /// The color sensor sent an all-zero frame.
    BlankFrame,
    /// The payload is too short for this top.
    ShortPayload,
    /// This top does not report input.
    NoInput,
}

/// Result of interpreting a payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sensed {
    /// A reading to publish.
    Reading(Reading),
    /// Nothing to publish.
    Suppressed(SuppressReason),
}

impl Sensed {
    /// Returns the reading, if any.
    #[must_use]
    pub const fn reading(self) -> Option<Reading> {
        match self {
            Self::Reading(r) => Some(r),
            Self::Suppressed(_) => None,
        }
    }
}

impl Top {
    /// Looks up the top for a module type id.
    ///
    /// The core's own id is not a top and maps to [`Top::Unsupported`].
    #[must_use]
    pub const fn from_id(id: u8) -> Self {
        match ModuleType::from_byte(id) {
            Some(ModuleType::Core) | None => Self::Unsupported(id),
            Some(module) => Self::Known(module),
        }
    }

    /// Returns the module type id.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Known(module) => module.id(),
            Self::Unsupported(id) => id,
        }
    }

    /// Returns the module type, if known.
    #[must_use]
    pub const fn module_type(self) -> Option<ModuleType> {
        match self {
            Self::Known(module) => Some(module),
            Self::Unsupported(_) => None,
        }
    }

    /// Returns the canonical name used in events and OSC addresses.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Known(module) => module.name(),
            Self::Unsupported(_) => "unsupported",
        }
    }

    /// Interprets a payload sent by this top.
    ///
    /// Never panics; malformed payloads come back as
    /// [`SuppressReason::ShortPayload`]. The command id is accepted for
    /// symmetry with the wire format but no input top distinguishes on it.
    #[must_use]
    pub fn sense(self, _command_id: u8, payload: &[u8]) -> Sensed {
        let Self::Known(module) = self else {
            return Sensed::Suppressed(SuppressReason::NoInput);
        };
        match module {
            ModuleType::Button => sensor::button(payload),
            ModuleType::Knob => sensor::knob(payload),
            ModuleType::Slider => sensor::slider(payload),
            ModuleType::Joystick => sensor::joystick(payload),
            ModuleType::Distance => sensor::distance(payload),
            ModuleType::Color | ModuleType::Color2019 => sensor::color(payload),
            ModuleType::Motor => sensor::motor(payload),
            ModuleType::Core | ModuleType::Servo | ModuleType::LedMatrix => {
                Sensed::Suppressed(SuppressReason::NoInput)
            }
        }
    }
}

impl From<ModuleType> for Top {
    fn from(module: ModuleType) -> Self {
        Self::from_id(module.id())
    }
}
