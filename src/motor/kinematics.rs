// Skid-steer kinematics for the four-wheel base
// Converts drive commands (forward / backward / tank turns) into per-wheel
// signed duty percentages, plus the clamp and ramp-step math shared by the
// motor driver.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RobotError;

/// Maximum duty magnitude in percent
pub const MAX_SPEED: i8 = 100;

/// The four driven wheels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wheel {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
}

impl Wheel {
    pub const ALL: [Wheel; 4] = [
        Wheel::FrontLeft,
        Wheel::FrontRight,
        Wheel::RearLeft,
        Wheel::RearRight,
    ];

    pub fn index(self) -> usize {
        match self {
            Wheel::FrontLeft => 0,
            Wheel::FrontRight => 1,
            Wheel::RearLeft => 2,
            Wheel::RearRight => 3,
        }
    }

    pub fn is_left(self) -> bool {
        matches!(self, Wheel::FrontLeft | Wheel::RearLeft)
    }

    /// Short label used on the wiring harness
    pub fn label(self) -> &'static str {
        match self {
            Wheel::FrontLeft => "VL",
            Wheel::FrontRight => "VR",
            Wheel::RearLeft => "HL",
            Wheel::RearRight => "HR",
        }
    }
}

impl fmt::Display for Wheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Wheel {
    type Err = RobotError;

    /// Accepts harness labels (VL/VR/HL/HR) and snake_case names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vl" | "front_left" => Ok(Wheel::FrontLeft),
            "vr" | "front_right" => Ok(Wheel::FrontRight),
            "hl" | "rear_left" => Ok(Wheel::RearLeft),
            "hr" | "rear_right" => Ok(Wheel::RearRight),
            _ => Err(RobotError::InvalidCommand(format!("unknown wheel: {:?}", s))),
        }
    }
}

/// Discrete motion commands issued by the follower and teleop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveCommand {
    Forward(i8),
    Backward(i8),
    /// Counter-clockwise in place: right side forward, left side backward
    TurnLeft(i8),
    /// Clockwise in place: left side forward, right side backward
    TurnRight(i8),
    Stop,
}

impl DriveCommand {
    /// Signed duty per wheel, indexed by `Wheel::index()`
    pub fn wheel_speeds(self) -> WheelSpeeds {
        let mut speeds = WheelSpeeds::zero();
        for wheel in Wheel::ALL {
            let speed = match self {
                DriveCommand::Forward(s) => clamp_speed(f32::from(s)),
                DriveCommand::Backward(s) => -clamp_speed(f32::from(s)),
                DriveCommand::TurnLeft(s) if wheel.is_left() => -clamp_speed(f32::from(s)),
                DriveCommand::TurnLeft(s) => clamp_speed(f32::from(s)),
                DriveCommand::TurnRight(s) if wheel.is_left() => clamp_speed(f32::from(s)),
                DriveCommand::TurnRight(s) => -clamp_speed(f32::from(s)),
                DriveCommand::Stop => 0,
            };
            speeds.set(wheel, speed);
        }
        speeds
    }
}

/// Signed duty for all four wheels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelSpeeds([i8; 4]);

impl WheelSpeeds {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn get(&self, wheel: Wheel) -> i8 {
        self.0[wheel.index()]
    }

    pub fn set(&mut self, wheel: Wheel, speed: i8) {
        self.0[wheel.index()] = speed;
    }

    pub fn as_array(&self) -> [i8; 4] {
        self.0
    }
}

/// Clamp to [-100, 100] and truncate toward zero. NaN maps to 0.
pub fn clamp_speed(speed: f32) -> i8 {
    if speed.is_nan() {
        return 0;
    }
    speed.clamp(-f32::from(MAX_SPEED), f32::from(MAX_SPEED)) as i8
}

/// Move `current` toward `target` by at most `step`, never overshooting.
/// A zero step leaves `current` where it is.
pub fn step_toward(current: i8, target: i8, step: u8) -> i8 {
    let step = i16::from(step);
    let (current, target) = (i16::from(current), i16::from(target));
    let next = if current < target {
        (current + step).min(target)
    } else {
        (current - step).max(target)
    };
    next as i8
}

/// Polarity duties (A, B) for a signed speed; at most one is nonzero
pub fn polarity_duties(speed: i8) -> (u8, u8) {
    match speed {
        s if s > 0 => (s as u8, 0),
        s if s < 0 => (0, s.unsigned_abs()),
        _ => (0, 0),
    }
}
