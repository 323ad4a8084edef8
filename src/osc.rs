//! OSC bridge.
//!
//! Maps decoded events onto Open Sound Control messages so readings can
//! drive external tools. Attachment changes go to `/tinkamo/connection`,
//! readings to `/tinkamo/<top>`:
//!
//! ```text
//! /tinkamo/connection  i attached  s top name or "none"
//! /tinkamo/button      i pressed
//! /tinkamo/knob        f value
//! /tinkamo/slider      f value
//! /tinkamo/distance    f value
//! /tinkamo/joystick    f horizontal  f vertical
//! /tinkamo/color       i r  i g  i b
//! /tinkamo/motor       i direction  f intensity
//! ```
//!
//! Sending the messages (UDP or otherwise) is left to the caller.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::event::{Event, EventHub, Topic};
use crate::protocol::ModuleType;
use crate::types::Reading;

/// Default address prefix.
pub const DEFAULT_PREFIX: &str = "/tinkamo";

/// Default capacity of the channel returned by [`OscBridge::attach`].
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    /// 32-bit integer, tag `i`.
    Int(i32),
    /// 32-bit float, tag `f`.
    Float(f32),
    /// String, tag `s`.
    Str(String),
}

impl OscArg {
    /// Returns the OSC type tag.
    #[must_use]
    pub const fn type_tag(&self) -> char {
        match self {
            Self::Int(_) => 'i',
            Self::Float(_) => 'f',
            Self::Str(_) => 's',
        }
    }
}

/// An OSC message.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    /// Returns the type tag string, e.g. `",iis"`.
    #[must_use]
    pub fn type_tags(&self) -> String {
        std::iter::once(',')
            .chain(self.args.iter().map(OscArg::type_tag))
            .collect()
    }

    /// Encodes the message in OSC 1.0 binary form.
    ///
    /// Strings are NUL terminated and padded to four bytes; numbers are big
    /// endian.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        put_padded_str(&mut buf, &self.address);
        put_padded_str(&mut buf, &self.type_tags());
        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.put_i32(*v),
                OscArg::Float(v) => buf.put_f32(*v),
                OscArg::Str(s) => put_padded_str(&mut buf, s),
            }
        }
        buf.freeze()
    }
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    let pad = 4 - s.len() % 4;
    buf.put_bytes(0, pad);
}

/// Turns events into OSC messages.
#[derive(Debug, Clone)]
pub struct OscBridge {
    prefix: String,
}

impl Default for OscBridge {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl OscBridge {
    /// Creates a bridge using `prefix` as the address root.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Returns the address root.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn address(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Returns the OSC message for an event, if it has one.
    ///
    /// Only [`Event::Reading`] and [`Event::TopChanged`] map to messages.
    #[must_use]
    pub fn message_for(&self, event: &Event) -> Option<OscMessage> {
        match event {
            Event::TopChanged { top, attached, .. } => {
                let name = match top {
                    Some(top) if *attached => top.name(),
                    _ => "none",
                };
                Some(OscMessage {
                    address: self.address(ModuleType::Core.name()),
                    args: vec![OscArg::Int(i32::from(*attached)), OscArg::Str(name.into())],
                })
            }
            Event::Reading { top, value, .. } => Some(OscMessage {
                address: self.address(top.name()),
                args: reading_args(value),
            }),
            _ => None,
        }
    }

    /// Forwards every mappable event on `hub` into a channel.
    ///
    /// Messages are dropped while the channel is full or closed.
    pub fn attach(&self, hub: &EventHub<Event>, capacity: usize) -> mpsc::Receiver<OscMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        let bridge = self.clone();
        hub.on(
            Topic::All,
            Arc::new(move |event: &Event| {
                if tx.is_closed() {
                    return;
                }
                if let Some(message) = bridge.message_for(event) {
                    if let Err(e) = tx.try_send(message) {
                        tracing::debug!("osc message dropped: {}", e);
                    }
                }
            }),
        );
        rx
    }
}

fn reading_args(reading: &Reading) -> Vec<OscArg> {
    match *reading {
        Reading::Button(pressed) => vec![OscArg::Int(i32::from(pressed))],
        Reading::Knob(v) | Reading::Slider(v) | Reading::Distance(v) => {
            vec![OscArg::Float(v as f32)]
        }
        Reading::Joystick {
            horizontal,
            vertical,
        } => vec![
            OscArg::Float(horizontal as f32),
            OscArg::Float(vertical as f32),
        ],
        Reading::Color { r, g, b } => vec![
            OscArg::Int(i32::from(r)),
            OscArg::Int(i32::from(g)),
            OscArg::Int(i32::from(b)),
        ],
        Reading::Motor {
            direction,
            intensity,
        } => vec![
            OscArg::Int(i32::from(direction)),
            OscArg::Float(intensity as f32),
        ],
    }
}
