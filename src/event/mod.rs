//! Event system for decoded device activity.
//!
//! Sessions and the registry each own an [`EventHub`]. Listeners registered
//! with [`EventHub::on`] run synchronously inside `emit`; async consumers
//! use [`EventHub::subscribe`] instead.

pub mod hub;

pub use hub::{EventHub, HubEvent, Listener, Subscription, Topic};

use crate::top::Top;
use crate::types::{BatteryLevel, DeviceId, Reading};

/// Why a session stopped being connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The host asked for it.
    Requested,
    /// The transport reported the link gone.
    TransportLost,
}

/// Events emitted by sessions and the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A link was established and notifications are flowing.
    Connected { device: DeviceId },
    /// The session no longer has a live link.
    Disconnected {
        device: DeviceId,
        reason: DisconnectReason,
    },
    /// A top was attached or detached.
    ///
    /// On detach, `top` is the top that was attached before, if any.
    TopChanged {
        device: DeviceId,
        top: Option<Top>,
        attached: bool,
    },
    /// An input top produced a reading.
    Reading {
        device: DeviceId,
        top: Top,
        value: Reading,
    },
    /// A verified write was echoed by the module.
    WriteAcknowledged { device: DeviceId, command_id: u8 },
    /// The core reported its battery status.
    Battery {
        device: DeviceId,
        level: BatteryLevel,
    },
    /// The core reported its firmware protocol version.
    ProtocolVersion { device: DeviceId, version: u8 },
}

/// Discriminant of [`Event`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::Connected`].
    Connected,
    /// [`Event::Disconnected`].
    Disconnected,
    /// [`Event::TopChanged`].
    TopChanged,
    /// [`Event::Reading`].
    Reading,
    /// [`Event::WriteAcknowledged`].
    WriteAcknowledged,
    /// [`Event::Battery`].
    Battery,
    /// [`Event::ProtocolVersion`].
    ProtocolVersion,
}

impl Event {
    /// Returns the device the event is about.
    #[must_use]
    pub const fn device(&self) -> &DeviceId {
        match self {
            Self::Connected { device }
            | Self::Disconnected { device, .. }
            | Self::TopChanged { device, .. }
            | Self::Reading { device, .. }
            | Self::WriteAcknowledged { device, .. }
            | Self::Battery { device, .. }
            | Self::ProtocolVersion { device, .. } => device,
        }
    }

    /// Returns the top name for top-related events.
    ///
    /// A detach with nothing attached before reports `"none"`.
    #[must_use]
    pub const fn top_name(&self) -> Option<&'static str> {
        match self {
            Self::TopChanged { top: Some(top), .. } | Self::Reading { top, .. } => Some(top.name()),
            Self::TopChanged { top: None, .. } => Some("none"),
            _ => None,
        }
    }
}

impl HubEvent for Event {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::TopChanged { .. } => EventKind::TopChanged,
            Self::Reading { .. } => EventKind::Reading,
            Self::WriteAcknowledged { .. } => EventKind::WriteAcknowledged,
            Self::Battery { .. } => EventKind::Battery,
            Self::ProtocolVersion { .. } => EventKind::ProtocolVersion,
        }
    }
}

impl From<EventKind> for Topic<EventKind> {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}
