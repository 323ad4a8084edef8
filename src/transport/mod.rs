//! Transport layer for Tinkamo communication.
//!
//! This module provides the abstraction over the radio link. A transport
//! finds a core matching some [`ConnectCriteria`], hands back an opaque
//! link, and moves raw packets over it. Framing, decoding and retries all
//! live above this layer.
//!
//! [`MemoryTransport`] is an in-process implementation with scripted
//! devices, used for tests and demos.

pub mod memory;

use std::fmt::Debug;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::DeviceId;

/// Advertised name prefix of Tinkamo cores.
pub const DEFAULT_NAME_PREFIX: &str = "Tinka";

/// GATT service carrying Tinkamo notifications.
pub const TINKAMO_SERVICE: u16 = 0xFFFA;

/// Which device a transport should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCriteria {
    /// Advertised name must start with this.
    pub name_prefix: String,
    /// Service the device must expose.
    pub service: u16,
    /// Connect to this device only.
    pub device_id: Option<DeviceId>,
}

impl Default for ConnectCriteria {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            service: TINKAMO_SERVICE,
            device_id: None,
        }
    }
}

impl ConnectCriteria {
    /// Criteria matching any Tinkamo core.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Criteria matching one known device.
    #[must_use]
    pub fn for_device(id: DeviceId) -> Self {
        Self {
            device_id: Some(id),
            ..Self::default()
        }
    }

    /// Sets the name prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Sets the service id.
    #[must_use]
    pub const fn service(mut self, service: u16) -> Self {
        self.service = service;
        self
    }

    /// Returns true if a device with this id and advertised name matches.
    #[must_use]
    pub fn matches(&self, id: &DeviceId, name: &str) -> bool {
        name.starts_with(&self.name_prefix) && self.device_id.as_ref().is_none_or(|want| want == id)
    }
}

/// A device found by [`Transport::connect`].
#[derive(Debug, Clone)]
pub struct Discovered<L> {
    /// Stable id of the device.
    pub device_id: DeviceId,
    /// Link to hand to a session.
    pub link: L,
}

/// Trait for transport implementations.
///
/// A link is owned by at most one session at a time. A session treats
/// either [`Transport::on_disconnect`] resolving or the notification
/// receiver closing as the link being lost.
pub trait Transport: Send + Sync + 'static {
    /// Handle to one live connection.
    type Link: Clone + Debug + Send + Sync + 'static;

    /// Finds and connects to a device matching `criteria`.
    fn connect<'a>(
        &'a self,
        criteria: &'a ConnectCriteria,
    ) -> BoxFuture<'a, Result<Discovered<Self::Link>>>;

    /// Starts notifications on a link.
    fn subscribe<'a>(&'a self, link: &'a Self::Link)
    -> BoxFuture<'a, Result<mpsc::Receiver<Bytes>>>;

    /// Writes one packet.
    fn write<'a>(&'a self, link: &'a Self::Link, data: Bytes) -> BoxFuture<'a, Result<()>>;

    /// Resolves once the link is gone. Resolves immediately for a stale link.
    fn on_disconnect(&self, link: &Self::Link) -> BoxFuture<'static, ()>;
}

pub use memory::{MemoryDevice, MemoryLink, MemoryTransport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_defaults() {
        let criteria = ConnectCriteria::new();
        assert_eq!(criteria.name_prefix, "Tinka");
        assert_eq!(criteria.service, 0xFFFA);
        assert!(criteria.device_id.is_none());
    }

    #[test]
    fn test_criteria_matches() {
        let any = ConnectCriteria::new();
        let a = DeviceId::from("a");
        let b = DeviceId::from("b");
        assert!(any.matches(&a, "Tinkamo Core"));
        assert!(!any.matches(&a, "Speaker"));

        let only_b = ConnectCriteria::for_device(b.clone());
        assert!(only_b.matches(&b, "Tinkamo"));
        assert!(!only_b.matches(&a, "Tinkamo"));
    }

    #[test]
    fn test_criteria_builder() {
        let criteria = ConnectCriteria::new().name_prefix("Core").service(0x1234);
        assert_eq!(criteria.name_prefix, "Core");
        assert_eq!(criteria.service, 0x1234);
    }
}
