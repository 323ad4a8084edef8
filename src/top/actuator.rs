//! Command builders for output tops.
//!
//! These only build [`Command`] values; sending them (and picking the port
//! and protocol version) is the session's job.

use crate::protocol::{
    Arg, CalibrationPoint, Command, ModuleType, MotorCommand, PixelCommand, ServoCommand,
};
use crate::top::mapping::clamp_map;

/// Minimum motor power that actually turns the shaft.
pub const MOTOR_SPIN_UP_POWER: f64 = 300.0;

/// Maximum motor power.
pub const MOTOR_MAX_POWER: f64 = 1000.0;

/// Clockwise direction byte.
pub const MOTOR_CLOCKWISE: u8 = 0xFF;

/// Counter-clockwise direction byte.
pub const MOTOR_COUNTER_CLOCKWISE: u8 = 0x00;

/// Servo angle limit on protocol version 2 firmware.
pub const SERVO_V2_LIMIT: f64 = 90.0;

/// Width and height of the LED matrix.
pub const PIXEL_SIDE: usize = 5;

/// Number of pixels on the LED matrix.
pub const PIXEL_COUNT: usize = PIXEL_SIDE * PIXEL_SIDE;

/// Sets motor speed from a signed value in `[-10, 10]`.
///
/// Positive values turn clockwise. Magnitudes below 1 stop the motor;
/// anything else is mapped onto the range the motor actually spins in.
#[must_use]
pub fn motor_speed(value: f64) -> Command {
    let direction = if value >= 0.0 {
        MOTOR_CLOCKWISE
    } else {
        MOTOR_COUNTER_CLOCKWISE
    };
    Command::new(
        ModuleType::Motor,
        MotorCommand::SetPower,
        &[Arg::Byte(direction), Arg::Word(motor_power(value.abs()))],
    )
    .verified()
}

fn motor_power(magnitude: f64) -> u16 {
    if magnitude < 1.0 {
        return 0;
    }
    clamp_map(magnitude, 1.0, 10.0, MOTOR_SPIN_UP_POWER, MOTOR_MAX_POWER).round() as u16
}

/// Turns the servo to `angle` degrees.
///
/// Protocol version 3 firmware takes an offset-by-90 word; older firmware
/// takes the angle clamped to `[-90, 90]` and offset by 90 into one byte. `raw` bypasses the stored
/// calibration.
#[must_use]
pub fn servo_angle(angle: f64, raw: bool, protocol_version: u8) -> Command {
    let command = if raw {
        ServoCommand::SetRawAngle
    } else {
        ServoCommand::SetAngle
    };
    let cmd = if protocol_version >= 3 {
        let word = ((angle + 90.0).round() as i32).rem_euclid(0x1_0000) as u16;
        Command::new(ModuleType::Servo, command, &[Arg::Word(word)])
    } else {
        let byte = (angle.clamp(-SERVO_V2_LIMIT, SERVO_V2_LIMIT) + 90.0).round() as u8;
        Command::new(ModuleType::Servo, command, &[Arg::Byte(byte)])
    };
    cmd.verified()
}

/// Stops powering the servo so it can be turned by hand.
#[must_use]
pub fn servo_rest() -> Command {
    Command::new(ModuleType::Servo, ServoCommand::Rest, &[]).verified()
}

/// Starts the servo's built-in swing motion.
#[must_use]
pub fn servo_swing() -> Command {
    Command::new(ModuleType::Servo, ServoCommand::Swing, &[])
}

/// Stores the current position as the given calibration point.
#[must_use]
pub fn servo_calibrate(point: CalibrationPoint) -> Command {
    Command::new(ModuleType::Servo, ServoCommand::Calibrate, &[Arg::Byte(point as u8)])
}

/// Resets calibration to factory defaults.
#[must_use]
pub fn servo_clear_calibration() -> Command {
    Command::new(ModuleType::Servo, ServoCommand::ClearCalibration, &[])
}

/// Sets one pixel, addressed row-major from the top-left as seen by the user.
///
/// Returns `None` if `index` is off the grid. Colors are 3-bit RGB.
#[must_use]
pub fn pixel_draw(index: u8, color: u8) -> Option<Command> {
    let index = usize::from(index);
    if index >= PIXEL_COUNT {
        return None;
    }
    let (x, y) = (index % PIXEL_SIDE, index / PIXEL_SIDE);
    let device_index = u8::try_from((PIXEL_SIDE - 1 - x) * PIXEL_SIDE + y).ok()?;
    Some(Command::new(
        ModuleType::LedMatrix,
        PixelCommand::DrawPixel,
        &[Arg::Byte(device_index), Arg::Byte(color)],
    ))
}

/// Replaces the whole matrix.
///
/// With `color` set, every lit cell of `bitmap` is drawn in that color.
#[must_use]
pub fn pixel_bitmap(bitmap: &[u8; PIXEL_COUNT], color: Option<u8>) -> Command {
    let mut rotated = [0u8; PIXEL_COUNT];
    for x in 0..PIXEL_SIDE {
        for y in 0..PIXEL_SIDE {
            let cell = bitmap[y * PIXEL_SIDE + PIXEL_SIDE - 1 - x];
            rotated[x * PIXEL_SIDE + y] = match color {
                Some(c) if cell != 0 => c,
                Some(_) => 0,
                None => cell,
            };
        }
    }
    Command::new(
        ModuleType::LedMatrix,
        PixelCommand::DrawBitmap,
        &[Arg::Bytes(&rotated)],
    )
}

/// Turns every pixel off.
#[must_use]
pub fn pixel_clear() -> Command {
    pixel_bitmap(&[0; PIXEL_COUNT], None)
}

/// Draws a number from 0 to 19; anything larger shows `!`.
#[must_use]
pub fn pixel_digit(number: u8, color: u8) -> Command {
    let glyph = FONT_DIGIT
        .get(usize::from(number))
        .unwrap_or(&FONT_DIGIT[FONT_DIGIT.len() - 1]);
    pixel_bitmap(glyph, Some(color))
}

/// 5x5 glyphs for 0-19, then `!`.
#[rustfmt::skip]
pub const FONT_DIGIT: [[u8; PIXEL_COUNT]; 21] = [
    [0,1,1,1,0, 0,1,0,1,0, 0,1,0,1,0, 0,1,0,1,0, 0,1,1,1,0],
    [0,0,1,0,0, 0,1,1,0,0, 0,0,1,0,0, 0,0,1,0,0, 0,1,1,1,0],
    [0,1,1,1,0, 0,0,0,1,0, 0,1,1,1,0, 0,1,0,0,0, 0,1,1,1,0],
    [0,1,1,1,0, 0,0,0,1,0, 0,0,1,1,0, 0,0,0,1,0, 0,1,1,1,0],
    [0,1,0,1,0, 0,1,0,1,0, 0,1,1,1,0, 0,0,0,1,0, 0,0,0,1,0],
    [0,1,1,1,0, 0,1,0,0,0, 0,1,1,1,0, 0,0,0,1,0, 0,1,1,1,0],
    [0,1,1,1,0, 0,1,0,0,0, 0,1,1,1,0, 0,1,0,1,0, 0,1,1,1,0],
    [0,1,1,1,0, 0,0,0,1,0, 0,0,0,1,0, 0,0,0,1,0, 0,0,0,1,0],
    [0,1,1,1,0, 0,1,0,1,0, 0,1,1,1,0, 0,1,0,1,0, 0,1,1,1,0],
    [0,1,1,1,0, 0,1,0,1,0, 0,1,1,1,0, 0,0,0,1,0, 0,1,1,1,0],
    [1,0,1,1,1, 1,0,1,0,1, 1,0,1,0,1, 1,0,1,0,1, 1,0,1,1,1],
    [0,1,0,1,0, 1,1,1,1,0, 0,1,0,1,0, 0,1,0,1,0, 0,1,0,1,0],
    [1,0,1,1,1, 1,0,0,0,1, 1,0,1,1,1, 1,0,1,0,0, 1,0,1,1,1],
    [1,0,1,1,1, 1,0,0,0,1, 1,0,0,1,1, 1,0,0,0,1, 1,0,1,1,1],
    [1,0,1,0,1, 1,0,1,0,1, 1,0,1,1,1, 1,0,0,0,1, 1,0,0,0,1],
    [1,0,1,1,1, 1,0,1,0,0, 1,0,1,1,1, 1,0,0,0,1, 1,0,1,1,1],
    [1,0,1,1,1, 1,0,1,0,0, 1,0,1,1,1, 1,0,1,0,1, 1,0,1,1,1],
    [1,0,1,1,1, 1,0,0,0,1, 1,0,0,0,1, 1,0,0,0,1, 1,0,0,0,1],
    [1,0,1,1,1, 1,0,1,0,1, 1,0,1,1,1, 1,0,1,0,1, 1,0,1,1,1],
    [1,0,1,1,1, 1,0,1,0,1, 1,0,1,1,1, 1,0,0,0,1, 1,0,1,1,1],
    [0,0,1,0,0, 0,0,1,0,0, 0,0,1,0,0, 0,0,0,0,0, 0,0,1,0,0],
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_full_forward() {
        let cmd = motor_speed(10.0);
        assert!(cmd.verify);
        assert_eq!(cmd.command_id, 0x00);
        assert_eq!(&cmd.payload[..], &[0xFF, 0x03, 0xE8]);
    }

    #[test]
    fn test_motor_reverse_spin_up() {
        let cmd = motor_speed(-1.0);
        assert_eq!(&cmd.payload[..], &[0x00, 0x01, 0x2C]);
    }

    #[test]
    fn test_motor_dead_zone_stops() {
        let cmd = motor_speed(0.5);
        assert_eq!(&cmd.payload[..], &[0xFF, 0x00, 0x00]);
        let cmd = motor_speed(-0.9);
        assert_eq!(&cmd.payload[..], &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_servo_angle_v3_word() {
        let cmd = servo_angle(0.0, false, 3);
        assert_eq!(cmd.command_id, ServoCommand::SetAngle as u8);
        assert_eq!(&cmd.payload[..], &[0x00, 90]);

        // Below -90 wraps into the upper half of the word.
        let cmd = servo_angle(-100.0, true, 3);
        assert_eq!(cmd.command_id, ServoCommand::SetRawAngle as u8);
        assert_eq!(&cmd.payload[..], &[0xFF, 0xF6]);
    }

    #[test]
    fn test_servo_angle_v2_clamped_byte() {
        assert_eq!(&servo_angle(0.0, false, 2).payload[..], &[90]);
        assert_eq!(&servo_angle(-90.0, false, 2).payload[..], &[0]);
        assert_eq!(&servo_angle(90.0, false, 2).payload[..], &[180]);
        assert_eq!(&servo_angle(-45.0, false, 2).payload[..], &[45]);
        assert_eq!(&servo_angle(120.0, false, 2).payload[..], &[180]);
        assert_eq!(&servo_angle(-200.0, true, 2).payload[..], &[0]);
    }

    #[test]
    fn test_servo_calibration_commands() {
        let cmd = servo_calibrate(CalibrationPoint::Right);
        assert!(!cmd.verify);
        assert_eq!(cmd.command_id, 0x03);
        assert_eq!(&cmd.payload[..], &[2]);
        assert_eq!(servo_clear_calibration().command_id, 0x04);
        assert!(servo_rest().verify);
    }

    #[test]
    fn test_pixel_draw_rotates_index() {
        // Top-left as seen by the user is the device's index 20.
        let cmd = pixel_draw(0, 7).unwrap();
        assert_eq!(&cmd.payload[..], &[20, 7]);
        // Bottom-right maps to 4.
        let cmd = pixel_draw(24, 1).unwrap();
        assert_eq!(&cmd.payload[..], &[4, 1]);
        assert!(pixel_draw(25, 1).is_none());
    }

    #[test]
    fn test_pixel_bitmap_matches_single_pixel_rotation() {
        for index in 0..PIXEL_COUNT {
            let mut bitmap = [0u8; PIXEL_COUNT];
            bitmap[index] = 1;
            let cmd = pixel_bitmap(&bitmap, None);
            let lit: Vec<usize> = cmd
                .payload
                .iter()
                .enumerate()
                .filter(|(_, v)| **v != 0)
                .map(|(i, _)| i)
                .collect();
            let single = pixel_draw(u8::try_from(index).unwrap(), 1).unwrap();
            assert_eq!(lit, vec![usize::from(single.payload[0])]);
        }
    }

    #[test]
    fn test_pixel_bitmap_recolors_lit_cells() {
        let mut bitmap = [0u8; PIXEL_COUNT];
        bitmap[3] = 1;
        bitmap[7] = 5;
        let cmd = pixel_bitmap(&bitmap, Some(2));
        assert_eq!(cmd.payload.len(), PIXEL_COUNT);
        assert_eq!(cmd.payload.iter().filter(|v| **v == 2).count(), 2);
        assert!(cmd.payload.iter().all(|v| *v == 0 || *v == 2));
    }

    #[test]
    fn test_pixel_digit_overflow_glyph() {
        let big = pixel_digit(200, 1);
        let bang = pixel_bitmap(&FONT_DIGIT[20], Some(1));
        assert_eq!(big, bang);
        assert_eq!(pixel_clear().payload.iter().sum::<u8>(), 0);
    }
}
