//! Decoded sensor readings.

/// A decoded reading, tagged by the top that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Pressed state.
    Button(bool),
    /// Knob position in `[-10, 10]`.
    Knob(f64),
    /// Slider position in `[0, 10]`.
    Slider(f64),
    /// Joystick deflection, both axes in `[-10, 10]`, up is positive.
    Joystick { horizontal: f64, vertical: f64 },
    /// Distance in sensor units (roughly cm), at most 60.
    Distance(f64),
    /// Raw color channels.
    Color { r: u8, g: u8, b: u8 },
    /// Motor echo: direction byte and intensity.
    Motor { direction: u8, intensity: f64 },
}

impl Reading {
    /// Returns the name of the top that produces this reading.
    #[must_use]
    pub const fn top_name(&self) -> &'static str {
        match self {
            Self::Button(_) => "button",
            Self::Knob(_) => "knob",
            Self::Slider(_) => "slider",
            Self::Joystick { .. } => "joystick",
            Self::Distance(_) => "distance",
            Self::Color { .. } => "color",
            Self::Motor { .. } => "motor",
        }
    }
}
