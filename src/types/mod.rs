//! Data types for Tinkamo entities.
//!
//! This module contains the core data structures used throughout the library:
//! - Device ids and connection state
//! - Battery status
//! - Decoded readings

pub mod device;
pub mod reading;

pub use device::{BatteryLevel, ConnectionState, DeviceId};
pub use reading::Reading;
