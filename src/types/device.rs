//! Device identity and status types.

use std::fmt;

/// Stable identity of a physical core, as assigned by the transport
/// (a BLE address or platform handle).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No live link.
    #[default]
    Disconnected,
    /// A link was handed over and the subscription is being set up.
    Connecting,
    /// Notifications are flowing.
    Connected,
}

/// Battery status reported by a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryLevel {
    /// Plugged in and charging.
    Charging,
    /// Remaining charge in percent.
    Percent(u8),
}

impl BatteryLevel {
    /// Parses the power status byte (`0xFF` means charging).
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0xFF => Self::Charging,
            pct => Self::Percent(pct),
        }
    }
}
