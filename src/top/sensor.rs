//! Payload interpretation for input tops.
//!
//! Analog tops send their value in the trailing bytes of the payload, so
//! indexing is done from the end. Every function checks the payload length
//! first and reports [`SuppressReason::ShortPayload`] instead of indexing
//! out of bounds.

use crate::protocol::fixed_point;
use crate::top::mapping::clamp_map;
use crate::top::{Sensed, SuppressReason};
use crate::types::Reading;

/// Knob full-scale fixed-point value.
const KNOB_FULL_SCALE: f64 = 3.45;

/// Joystick full-scale fixed-point value per axis.
const JOYSTICK_FULL_SCALE: f64 = 4.0;

/// Distances above this are the sensor's "nothing in range" value.
pub const DISTANCE_MAX: f64 = 60.0;

/// Returns the last `N` bytes of the payload, if there are that many.
fn tail<const N: usize>(payload: &[u8]) -> Option<[u8; N]> {
    let start = payload.len().checked_sub(N)?;
    payload[start..].try_into().ok()
}

pub(crate) fn button(payload: &[u8]) -> Sensed {
    match payload.first() {
        Some(&pressed) => Sensed::Reading(Reading::Button(pressed != 0)),
        None => Sensed::Suppressed(SuppressReason::ShortPayload),
    }
}

pub(crate) fn knob(payload: &[u8]) -> Sensed {
    let Some([int, frac]) = tail::<2>(payload) else {
        return Sensed::Suppressed(SuppressReason::ShortPayload);
    };
    let value = clamp_map(fixed_point(int, frac), 0.0, KNOB_FULL_SCALE, -10.0, 10.0);
    Sensed::Reading(Reading::Knob(value))
}

/// The slider reports 255 at the bottom, so the byte is inverted first.
pub(crate) fn slider(payload: &[u8]) -> Sensed {
    let Some([raw]) = tail::<1>(payload) else {
        return Sensed::Suppressed(SuppressReason::ShortPayload);
    };
    let value = clamp_map(f64::from(255 - raw), 0.0, 255.0, 0.0, 10.0);
    Sensed::Reading(Reading::Slider(value))
}

/// Vertical axis is negated so that pushing up reads positive.
pub(crate) fn joystick(payload: &[u8]) -> Sensed {
    let Some([h_int, h_frac, v_int, v_frac]) = tail::<4>(payload) else {
        return Sensed::Suppressed(SuppressReason::ShortPayload);
    };
    let axis = |int, frac| clamp_map(fixed_point(int, frac), 0.0, JOYSTICK_FULL_SCALE, -10.0, 10.0);
    Sensed::Reading(Reading::Joystick {
        horizontal: axis(h_int, h_frac),
        vertical: -axis(v_int, v_frac),
    })
}

pub(crate) fn distance(payload: &[u8]) -> Sensed {
    let Some([int, frac]) = tail::<2>(payload) else {
        return Sensed::Suppressed(SuppressReason::ShortPayload);
    };
    let value = fixed_point(int, frac);
    if value > DISTANCE_MAX {
        return Sensed::Suppressed(SuppressReason::OutOfRange);
    }
    Sensed::Reading(Reading::Distance(value))
}

/// An all-zero frame is a sensor glitch, not black.
pub(crate) fn color(payload: &[u8]) -> Sensed {
    let Some(&[r, g, b]) = payload.first_chunk::<3>() else {
        return Sensed::Suppressed(SuppressReason::ShortPayload);
    };
    if r == 0 && g == 0 && b == 0 {
        return Sensed::Suppressed(SuppressReason::BlankFrame);
    }
    Sensed::Reading(Reading::Color { r, g, b })
}

pub(crate) fn motor(payload: &[u8]) -> Sensed {
    let Some(&[direction, int, frac]) = payload.first_chunk::<3>() else {
        return Sensed::Suppressed(SuppressReason::ShortPayload);
    };
    Sensed::Reading(Reading::Motor {
        direction,
        intensity: fixed_point(int, frac),
    })
}
