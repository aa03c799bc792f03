// Motor control module for the four-wheel skid-steer base
//
// Provides:
// - Drive kinematics (commands -> per-wheel signed duty) and ramp math
// - The PWM motor driver owning all eight H-bridge lines

mod driver;
pub mod kinematics;

pub use driver::{Drivetrain, MotorDriveController, RampSettings};
pub use kinematics::{DriveCommand, MAX_SPEED, Wheel, WheelSpeeds, clamp_speed};
