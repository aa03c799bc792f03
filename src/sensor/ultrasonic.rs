// HC-SR04 ultrasonic ranging
//
// Trigger: hold low briefly, then a 10 us high pulse. The sensor answers with
// an echo pulse whose width is the round-trip time of flight. Both echo edges
// are awaited with a bounded busy-poll; a missed edge is a normal outcome
// (nothing in range, soft target) and yields no reading.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, RobotError};
use crate::hal::{DigitalIo, InputLine, Level, OutputLine, Pull, SharedClock};

/// Speed of sound in cm/s
pub const SPEED_OF_SOUND_CM_S: f64 = 34_300.0;

/// Trigger line settles low this long before each pulse
pub const TRIGGER_SETTLE: Duration = Duration::from_micros(200);

/// Trigger pulse width
pub const TRIGGER_PULSE: Duration = Duration::from_micros(10);

/// Distance in centimeters, `None` when no echo arrived in time
pub type RangeReading = Option<f64>;

/// Round-trip echo width -> one-way distance
pub fn echo_to_distance_cm(echo: Duration) -> f64 {
    echo.as_secs_f64() * SPEED_OF_SOUND_CM_S / 2.0
}

pub struct UltrasonicRangefinder {
    name: &'static str,
    trigger: Box<dyn OutputLine>,
    echo: Box<dyn InputLine>,
    clock: SharedClock,
}

impl UltrasonicRangefinder {
    pub fn new(
        io: &dyn DigitalIo,
        name: &'static str,
        trigger_pin: u8,
        echo_pin: u8,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut trigger = io.output(trigger_pin)?;
        trigger.write(Level::Low);
        let echo = io.input(echo_pin, Pull::None)?;
        info!(
            "Rangefinder '{}': TRIG=GPIO{} ECHO=GPIO{}",
            name, trigger_pin, echo_pin
        );
        Ok(Self {
            name,
            trigger,
            echo,
            clock,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// One ping. Each echo edge may take up to `timeout`.
    pub fn measure_distance(&mut self, timeout: Duration) -> RangeReading {
        self.fire_trigger();

        let start = match self.wait_for_echo(Level::High, timeout, "echo start") {
            Ok(t) => t,
            Err(e) => {
                debug!("{}: {}", self.name, e);
                return None;
            }
        };
        let end = match self.wait_for_echo(Level::Low, timeout, "echo end") {
            Ok(t) => t,
            Err(e) => {
                debug!("{}: {}", self.name, e);
                return None;
            }
        };

        let distance = echo_to_distance_cm(end.saturating_duration_since(start));
        debug!("{}: {:.1} cm", self.name, distance);
        Some(distance)
    }

    fn fire_trigger(&mut self) {
        self.trigger.write(Level::Low);
        self.clock.sleep(TRIGGER_SETTLE);
        self.trigger.write(Level::High);
        self.clock.sleep(TRIGGER_PULSE);
        self.trigger.write(Level::Low);
    }

    /// Busy-poll the echo line until it reads `level` or the deadline passes
    fn wait_for_echo(
        &self,
        level: Level,
        timeout: Duration,
        what: &'static str,
    ) -> Result<Instant> {
        let deadline = self.clock.now() + timeout;
        loop {
            let now = self.clock.now();
            if self.echo.read() == level {
                return Ok(now);
            }
            if now > deadline {
                return Err(RobotError::SensorTimeout { what });
            }
            std::hint::spin_loop();
        }
    }
}

/// Ping `first`, wait `inter_sample_delay` so its echo dies down, then ping
/// `second`
pub fn measure_both(
    first: &mut UltrasonicRangefinder,
    second: &mut UltrasonicRangefinder,
    inter_sample_delay: Duration,
    timeout: Duration,
) -> (RangeReading, RangeReading) {
    let a = first.measure_distance(timeout);
    first.clock.sleep(inter_sample_delay);
    let b = second.measure_distance(timeout);
    (a, b)
}
