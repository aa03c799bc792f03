// Four-wheel PWM motor driver
//
// Each wheel has two polarity lines on an H-bridge (A = forward, B = reverse).
// The driver owns all eight lines, keeps the per-wheel ramp state
// (current / target duty) and guarantees that at most one polarity line of a
// wheel carries duty at any time.

use std::time::Duration;

use tracing::{debug, info};

use super::kinematics::{
    DriveCommand, Wheel, WheelSpeeds, clamp_speed, polarity_duties, step_toward,
};
use crate::config::{MotorConfig, MotorPins};
use crate::error::Result;
use crate::hal::{DigitalIo, OutputLine, SharedClock};

/// What the follower needs from a drivetrain. Lets the decision logic run
/// against a recording fake in tests.
pub trait Drivetrain: Send {
    /// Issue a motion command (ramped or immediate, depending on the driver)
    fn command(&mut self, command: DriveCommand);

    /// Advance ramping by one step; true if any wheel changed
    fn tick(&mut self) -> bool;

    fn stop_immediate(&mut self);
}

/// How commanded speeds reach the wheels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSettings {
    pub enabled: bool,
    pub step: u8,
    pub delay: Duration,
}

impl From<&MotorConfig> for RampSettings {
    fn from(config: &MotorConfig) -> Self {
        Self {
            enabled: config.ramped,
            step: config.ramp_step,
            delay: config.ramp_delay,
        }
    }
}

struct WheelChannels {
    a: Box<dyn OutputLine>,
    b: Box<dyn OutputLine>,
}

/// Owns the motor lines and the ramp state for all four wheels
pub struct MotorDriveController {
    channels: Vec<WheelChannels>, // indexed by Wheel::index()
    current: WheelSpeeds,
    target: WheelSpeeds,
    ramp: RampSettings,
    clock: SharedClock,
    released: bool,
}

impl MotorDriveController {
    /// Claim all motor lines and start them at zero duty
    pub fn new(
        io: &dyn DigitalIo,
        pins: &MotorPins,
        ramp: RampSettings,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut channels = Vec::with_capacity(Wheel::ALL.len());
        for wheel in Wheel::ALL {
            let p = pins.for_wheel(wheel);
            info!("Wheel {}: A=GPIO{} B=GPIO{}", wheel, p.a, p.b);
            let mut a = io.output(p.a)?;
            let mut b = io.output(p.b)?;
            a.set_duty(0);
            b.set_duty(0);
            channels.push(WheelChannels { a, b });
        }

        Ok(Self {
            channels,
            current: WheelSpeeds::zero(),
            target: WheelSpeeds::zero(),
            ramp,
            clock,
            released: false,
        })
    }

    pub fn ramp_settings(&self) -> RampSettings {
        self.ramp
    }

    pub fn current_speed(&self, wheel: Wheel) -> i8 {
        self.current.get(wheel)
    }

    pub fn target_speed(&self, wheel: Wheel) -> i8 {
        self.target.get(wheel)
    }

    /// Set a wheel's duty right now. Out-of-range speeds clamp to ±100 and
    /// fractions truncate. Also resets the wheel's ramp target.
    pub fn set_wheel(&mut self, wheel: Wheel, speed: f32) {
        let speed = clamp_speed(speed);
        self.current.set(wheel, speed);
        self.target.set(wheel, speed);
        self.write_duty(wheel, speed);
    }

    /// Record a ramp target; `ramp_tick` moves the wheel there
    pub fn set_target(&mut self, wheel: Wheel, speed: f32) {
        self.target.set(wheel, clamp_speed(speed));
    }

    pub fn set_targets(&mut self, command: DriveCommand) {
        let speeds = command.wheel_speeds();
        for wheel in Wheel::ALL {
            self.set_target(wheel, f32::from(speeds.get(wheel)));
        }
    }

    /// Apply a command to all wheels immediately
    pub fn apply(&mut self, command: DriveCommand) {
        let speeds = command.wheel_speeds();
        for wheel in Wheel::ALL {
            self.set_wheel(wheel, f32::from(speeds.get(wheel)));
        }
    }

    pub fn forward(&mut self, speed: i8) {
        self.apply(DriveCommand::Forward(speed));
    }

    pub fn backward(&mut self, speed: i8) {
        self.apply(DriveCommand::Backward(speed));
    }

    pub fn turn_left(&mut self, speed: i8) {
        self.apply(DriveCommand::TurnLeft(speed));
    }

    pub fn turn_right(&mut self, speed: i8) {
        self.apply(DriveCommand::TurnRight(speed));
    }

    /// Move every wheel at most `step` percent toward its target. Sleeps
    /// `delay` after a step that changed something. Returns whether anything
    /// changed; call until it returns false to settle.
    pub fn ramp_tick(&mut self, step: u8, delay: Duration) -> bool {
        let mut changed = false;
        for wheel in Wheel::ALL {
            let current = self.current.get(wheel);
            let target = self.target.get(wheel);
            let next = step_toward(current, target, step);
            if next == current {
                continue;
            }
            changed = true;
            self.current.set(wheel, next);
            self.write_duty(wheel, next);
        }
        if changed {
            self.clock.sleep(delay);
        }
        changed
    }

    /// Zero every duty channel without ramping (emergency stop / cleanup)
    pub fn stop_immediate(&mut self) {
        for wheel in Wheel::ALL {
            self.set_wheel(wheel, 0.0);
        }
    }

    /// Ramp every wheel down to zero, blocking until settled. Without a
    /// usable step the wheels are cut immediately.
    pub fn stop_ramped(&mut self) {
        if self.ramp.step == 0 {
            self.stop_immediate();
            return;
        }
        self.set_targets(DriveCommand::Stop);
        let step = self.ramp.step;
        let delay = self.ramp.delay;
        while self.ramp_tick(step, delay) {}
    }

    /// Stop PWM generation and release all lines. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.released {
            return;
        }
        info!("Releasing motor lines");
        self.current = WheelSpeeds::zero();
        self.target = WheelSpeeds::zero();
        for ch in &mut self.channels {
            ch.a.set_duty(0);
            ch.b.set_duty(0);
            ch.a.release();
            ch.b.release();
        }
        self.released = true;
    }

    pub fn is_shut_down(&self) -> bool {
        self.released
    }

    fn write_duty(&mut self, wheel: Wheel, speed: i8) {
        if self.released {
            debug!("Ignoring duty for {} after shutdown", wheel);
            return;
        }
        let (duty_a, duty_b) = polarity_duties(speed);
        let ch = &mut self.channels[wheel.index()];
        // Drop the active side first so both lines are never driven together
        if duty_a == 0 {
            ch.a.set_duty(0);
            ch.b.set_duty(duty_b);
        } else {
            ch.b.set_duty(0);
            ch.a.set_duty(duty_a);
        }
    }
}

impl Drivetrain for MotorDriveController {
    fn command(&mut self, command: DriveCommand) {
        debug!("Drive command: {:?}", command);
        if self.ramp.enabled {
            self.set_targets(command);
        } else {
            self.apply(command);
        }
    }

    fn tick(&mut self) -> bool {
        if !self.ramp.enabled {
            return false;
        }
        self.ramp_tick(self.ramp.step, self.ramp.delay)
    }

    fn stop_immediate(&mut self) {
        MotorDriveController::stop_immediate(self);
    }
}

impl Drop for MotorDriveController {
    fn drop(&mut self) {
        // Motors must never keep running after the driver is gone
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::Sim;

    fn ramp(step: u8) -> RampSettings {
        RampSettings {
            enabled: true,
            step,
            delay: Duration::from_millis(20),
        }
    }

    fn controller(sim: &Sim, step: u8) -> MotorDriveController {
        MotorDriveController::new(sim, &MotorPins::default(), ramp(step), sim.clock()).unwrap()
    }

    fn duties(sim: &Sim, wheel: Wheel) -> (u8, u8) {
        let p = MotorPins::default().for_wheel(wheel);
        (sim.duty(p.a), sim.duty(p.b))
    }

    #[test]
    fn test_set_wheel_polarity() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 5);

        motors.set_wheel(Wheel::FrontLeft, 42.7);
        assert_eq!(duties(&sim, Wheel::FrontLeft), (42, 0));

        motors.set_wheel(Wheel::FrontLeft, -250.0);
        assert_eq!(duties(&sim, Wheel::FrontLeft), (0, 100));
        assert_eq!(motors.current_speed(Wheel::FrontLeft), -100);
        assert_eq!(motors.target_speed(Wheel::FrontLeft), -100);

        motors.set_wheel(Wheel::FrontLeft, 0.0);
        assert_eq!(duties(&sim, Wheel::FrontLeft), (0, 0));
    }

    #[test]
    fn test_target_is_clamped() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 5);
        for s in [-500.0, -100.0, -3.9, 0.0, 64.2, 100.0, 101.0, f32::MAX] {
            motors.set_target(Wheel::RearRight, s);
            let t = motors.target_speed(Wheel::RearRight);
            assert!(t.unsigned_abs() <= 100);
            assert_eq!(t, clamp_speed(s));
        }
    }

    #[test]
    fn test_turn_left_drives_right_side_forward() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 5);
        motors.turn_left(60);
        assert_eq!(duties(&sim, Wheel::FrontRight), (60, 0));
        assert_eq!(duties(&sim, Wheel::RearRight), (60, 0));
        assert_eq!(duties(&sim, Wheel::FrontLeft), (0, 60));
        assert_eq!(duties(&sim, Wheel::RearLeft), (0, 60));

        motors.turn_right(30);
        assert_eq!(duties(&sim, Wheel::FrontRight), (0, 30));
        assert_eq!(duties(&sim, Wheel::FrontLeft), (30, 0));
    }

    #[test]
    fn test_ramp_tick_bounded_step() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 5);
        motors.set_targets(DriveCommand::Forward(40));

        let mut previous = motors.current_speed(Wheel::FrontLeft);
        let mut ticks = 0;
        while motors.ramp_tick(5, Duration::from_millis(20)) {
            let now = motors.current_speed(Wheel::FrontLeft);
            assert!((i16::from(now) - i16::from(previous)).abs() <= 5);
            previous = now;
            ticks += 1;
        }
        assert_eq!(ticks, 8);
        assert_eq!(duties(&sim, Wheel::FrontLeft), (40, 0));
    }

    #[test]
    fn test_ramp_converges_within_bound() {
        for step in [1u8, 3, 5, 7, 20, 100] {
            for (from, to) in [(0i8, 40i8), (40, -40), (-100, 100), (13, 12), (-7, 0)] {
                let sim = Sim::new();
                let mut motors = controller(&sim, step);
                motors.set_wheel(Wheel::RearLeft, f32::from(from));
                motors.set_target(Wheel::RearLeft, f32::from(to));

                let distance = (i32::from(to) - i32::from(from)).unsigned_abs();
                let bound = distance.div_ceil(u32::from(step));
                let mut ticks = 0;
                while motors.ramp_tick(step, Duration::ZERO) {
                    ticks += 1;
                    assert!(ticks <= bound, "step {} {}->{} exceeded {}", step, from, to, bound);
                }
                assert_eq!(motors.current_speed(Wheel::RearLeft), to);
            }
        }
    }

    #[test]
    fn test_reversal_never_drives_both_channels() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 10);
        motors.set_wheel(Wheel::FrontRight, 50.0);
        motors.set_target(Wheel::FrontRight, -50.0);
        while motors.ramp_tick(10, Duration::ZERO) {
            let (a, b) = duties(&sim, Wheel::FrontRight);
            assert!(a == 0 || b == 0, "A={} B={}", a, b);
        }
        assert_eq!(duties(&sim, Wheel::FrontRight), (0, 50));
    }

    #[test]
    fn test_ramp_tick_sleeps_only_when_changed() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 5);
        let before = sim.elapsed();
        assert!(!motors.ramp_tick(5, Duration::from_millis(20)));
        assert!(sim.elapsed() - before < Duration::from_millis(1));

        motors.set_target(Wheel::FrontLeft, 5.0);
        assert!(motors.ramp_tick(5, Duration::from_millis(20)));
        assert!(sim.elapsed() - before >= Duration::from_millis(20));
    }

    #[test]
    fn test_zero_step_never_moves_a_wheel() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 0);
        motors.set_target(Wheel::FrontLeft, 40.0);
        assert!(!motors.ramp_tick(0, Duration::from_millis(20)));
        assert_eq!(motors.current_speed(Wheel::FrontLeft), 0);
        assert_eq!(duties(&sim, Wheel::FrontLeft), (0, 0));

        motors.forward(30);
        motors.stop_ramped();
        for wheel in Wheel::ALL {
            assert_eq!(duties(&sim, wheel), (0, 0));
        }
    }

    #[test]
    fn test_stop_ramped_settles_at_zero() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 5);
        motors.forward(33);
        motors.stop_ramped();
        for wheel in Wheel::ALL {
            assert_eq!(motors.current_speed(wheel), 0);
            assert_eq!(duties(&sim, wheel), (0, 0));
        }
    }

    #[test]
    fn test_stop_immediate_zeroes_everything() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 5);
        motors.backward(70);
        motors.stop_immediate();
        for wheel in Wheel::ALL {
            assert_eq!(duties(&sim, wheel), (0, 0));
        }
    }

    #[test]
    fn test_shutdown_is_idempotent_and_releases() {
        let sim = Sim::new();
        let mut motors = controller(&sim, 5);
        motors.forward(50);
        motors.shutdown();
        motors.shutdown();
        assert!(motors.is_shut_down());
        let pins = MotorPins::default();
        for wheel in Wheel::ALL {
            let p = pins.for_wheel(wheel);
            assert!(sim.is_released(p.a) && sim.is_released(p.b));
        }
        // Writes after shutdown are ignored
        motors.forward(50);
        assert_eq!(duties(&sim, Wheel::FrontLeft), (0, 0));
    }

    #[test]
    fn test_drop_releases_lines() {
        let sim = Sim::new();
        {
            let mut motors = controller(&sim, 5);
            motors.forward(80);
        }
        let p = MotorPins::default().for_wheel(Wheel::RearRight);
        assert!(sim.is_released(p.a));
        assert_eq!(sim.duty(p.a), 0);
        assert!(!sim.is_claimed(p.a));
    }

    #[test]
    fn test_unavailable_pin_fails_construction() {
        let sim = Sim::new();
        sim.reject_pin(MotorPins::default().rear_left.b);
        let result = MotorDriveController::new(&sim, &MotorPins::default(), ramp(5), sim.clock());
        assert!(matches!(
            result,
            Err(crate::error::RobotError::HardwareUnavailable { .. })
        ));
    }

    #[test]
    fn test_drivetrain_immediate_mode_ignores_tick() {
        let sim = Sim::new();
        let settings = RampSettings {
            enabled: false,
            ..ramp(5)
        };
        let mut motors =
            MotorDriveController::new(&sim, &MotorPins::default(), settings, sim.clock()).unwrap();
        Drivetrain::command(&mut motors, DriveCommand::Forward(30));
        assert_eq!(duties(&sim, Wheel::RearLeft), (30, 0));
        assert!(!motors.tick());
    }
}
