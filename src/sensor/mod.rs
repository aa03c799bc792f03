// Sensors feeding the control loop
//
// Provides:
// - Edge-frequency line/color sensing (interrupt-counted pulse trains)
// - HC-SR04 ultrasonic ranging
// - ESP32 UART bridge for pre-classified line readings
// - Plain digital line inputs and the debounced start switch

pub mod bridge;
pub mod frequency;
pub mod ultrasonic;

use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, RobotError};
use crate::hal::{DigitalIo, InputLine, Level, Pull, SharedClock};

pub use bridge::SerialLineBridge;
pub use frequency::{EdgeFrequencyCounter, FrequencyLineSource, classify};
pub use ultrasonic::{RangeReading, UltrasonicRangefinder};

/// Classified reading of one line sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineReading {
    /// Black line under the sensor
    OnLine,
    /// White background
    OffLine,
}

impl LineReading {
    pub fn is_on_line(self) -> bool {
        self == LineReading::OnLine
    }
}

/// Everything the follower looks at in one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineState {
    pub left: bool,
    pub right: bool,
    pub marker: bool,
}

impl LineState {
    pub fn new(left: bool, right: bool, marker: bool) -> Self {
        Self {
            left,
            right,
            marker,
        }
    }
}

/// Sensor side selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl FromStr for Side {
    type Err = RobotError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l" | "left" => Ok(Side::Left),
            "r" | "right" => Ok(Side::Right),
            _ => Err(RobotError::InvalidCommand(format!(
                "sensor must be 'l' or 'r', got {:?}",
                s
            ))),
        }
    }
}

/// Source of left/right line readings. `None` means no usable data this
/// cycle; the caller simply tries again next cycle.
pub trait LineSource: Send {
    fn read_line(&mut self) -> Option<(LineReading, LineReading)>;
}

/// Two digital inputs, high = on line
pub struct DigitalLineSource {
    left: Box<dyn InputLine>,
    right: Box<dyn InputLine>,
}

impl DigitalLineSource {
    pub fn new(io: &dyn DigitalIo, left_pin: u8, right_pin: u8) -> Result<Self> {
        Ok(Self {
            left: io.input(left_pin, Pull::None)?,
            right: io.input(right_pin, Pull::None)?,
        })
    }
}

fn level_to_reading(level: Level) -> LineReading {
    match level {
        Level::High => LineReading::OnLine,
        Level::Low => LineReading::OffLine,
    }
}

impl LineSource for DigitalLineSource {
    fn read_line(&mut self) -> Option<(LineReading, LineReading)> {
        Some((
            level_to_reading(self.left.read()),
            level_to_reading(self.right.read()),
        ))
    }
}

/// Active-low push button with internal pull-up.
///
/// Debounced across polls instead of by sleeping: the switch counts as pressed
/// once every poll for at least `debounce` has read low. Any high read
/// releases it at once.
pub struct EnableSwitch {
    line: Box<dyn InputLine>,
    clock: SharedClock,
    debounce: Duration,
    low_since: Option<Instant>,
}

impl EnableSwitch {
    pub fn new(io: &dyn DigitalIo, pin: u8, clock: SharedClock, debounce: Duration) -> Result<Self> {
        Ok(Self {
            line: io.input(pin, Pull::Up)?,
            clock,
            debounce,
            low_since: None,
        })
    }

    pub fn is_active(&mut self) -> bool {
        let now = self.clock.now();
        if self.line.read() != Level::Low {
            if self.low_since.take().is_some() {
                debug!("Switch on GPIO {} reads high", self.line.pin());
            }
            return false;
        }
        let since = *self.low_since.get_or_insert(now);
        now.saturating_duration_since(since) >= self.debounce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::Sim;

    #[test]
    fn test_side_selector() {
        assert_eq!("l".parse::<Side>().unwrap(), Side::Left);
        assert_eq!("Right".parse::<Side>().unwrap(), Side::Right);
        assert!(matches!(
            "links".parse::<Side>(),
            Err(RobotError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_digital_line_source() {
        let sim = Sim::new();
        let mut source = DigitalLineSource::new(&sim, 5, 6).unwrap();
        sim.set_level(5, Level::High);
        assert_eq!(
            source.read_line(),
            Some((LineReading::OnLine, LineReading::OffLine))
        );
    }

    #[test]
    fn test_enable_switch_debounced() {
        let sim = Sim::new();
        let clock = sim.clock();
        let mut switch = EnableSwitch::new(&sim, 25, clock.clone(), Duration::from_millis(20)).unwrap();
        assert!(!switch.is_active(), "pull-up idles high = released");

        sim.set_level(25, Level::Low);
        let before = sim.elapsed();
        assert!(!switch.is_active());
        // Polling never sleeps
        assert!(sim.elapsed() - before < Duration::from_millis(1));

        clock.sleep(Duration::from_millis(10));
        assert!(!switch.is_active());
        clock.sleep(Duration::from_millis(10));
        assert!(switch.is_active());
    }

    #[test]
    fn test_enable_switch_bounce_restarts_debounce() {
        let sim = Sim::new();
        let clock = sim.clock();
        let mut switch = EnableSwitch::new(&sim, 25, clock.clone(), Duration::from_millis(20)).unwrap();

        sim.set_level(25, Level::Low);
        assert!(!switch.is_active());
        clock.sleep(Duration::from_millis(15));
        sim.set_level(25, Level::High);
        assert!(!switch.is_active());
        sim.set_level(25, Level::Low);
        assert!(!switch.is_active());
        clock.sleep(Duration::from_millis(15));
        assert!(!switch.is_active(), "low run restarted at the bounce");
        clock.sleep(Duration::from_millis(5));
        assert!(switch.is_active());

        sim.set_level(25, Level::High);
        assert!(!switch.is_active(), "release is immediate");
    }
}
