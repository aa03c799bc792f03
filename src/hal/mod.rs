// Hardware capabilities consumed by the control loop
//
// Provides:
// - Clock: monotonic time + blocking sleep
// - DigitalIo: claims output/input lines by BCM pin number
// - OutputLine / InputLine: the claimed lines (level, PWM duty, edge callbacks)
//
// Backends: `rpi` (rppal, real hardware) and `sim` (tests and dry runs).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;

#[cfg(feature = "rpi")]
pub mod rpi;
pub mod sim;

/// Logic level of a digital line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Input bias
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

/// Monotonic time source
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Clock shared by every component of one robot
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by `Instant` and `thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// A claimed output line. Dropping it releases the pin.
pub trait OutputLine: Send {
    fn pin(&self) -> u8;

    fn write(&mut self, level: Level);

    /// Set PWM duty in percent (0..=100). Best effort: backends log failures
    /// instead of returning them, actuation must never abort the loop.
    fn set_duty(&mut self, percent: u8);

    /// Stop PWM generation and drive the line low
    fn release(&mut self);
}

/// A claimed input line
pub trait InputLine: Send {
    fn pin(&self) -> u8;

    fn read(&self) -> Level;

    /// Register a handler invoked on every rising edge. The handler runs on a
    /// backend-owned context, not on the control thread.
    fn on_rising_edge(&mut self, handler: Box<dyn FnMut() + Send>) -> Result<()>;
}

/// Factory for lines
pub trait DigitalIo {
    fn output(&self, pin: u8) -> Result<Box<dyn OutputLine>>;

    fn input(&self, pin: u8, pull: Pull) -> Result<Box<dyn InputLine>>;
}
