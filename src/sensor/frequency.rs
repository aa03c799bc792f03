// Edge-frequency sensing
//
// TCS-style color / line sensors emit a pulse train whose frequency tracks
// reflected light. We count rising edges in an interrupt handler and sample
// the count over a short window. Two edges are counted per reported period
// (frequency = count / (2 * elapsed)), which keeps readings comparable with
// the ESP32 firmware the thresholds were calibrated against.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{LineReading, LineSource, Side};
use crate::error::{Result, RobotError};
use crate::hal::{DigitalIo, InputLine, Level, Pull, SharedClock};

/// Rising-edge count for one pin. Written by the edge handler, drained by
/// the measuring thread with a single atomic swap.
#[derive(Debug, Default)]
pub struct EdgeCounter(AtomicU64);

impl EdgeCounter {
    pub fn record_edge(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the count and reset it to zero in one step
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// Frequency for `count` edges over `elapsed`; 0 when no time has passed
pub fn edges_to_frequency(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    count as f64 / (2.0 * secs)
}

/// `OnLine` strictly above the threshold
pub fn classify(frequency: f64, threshold: f64) -> LineReading {
    if frequency > threshold {
        LineReading::OnLine
    } else {
        LineReading::OffLine
    }
}

struct Channel {
    _line: Box<dyn InputLine>,
    counter: Arc<EdgeCounter>,
}

/// Edge counters for a set of attached pins
pub struct EdgeFrequencyCounter {
    clock: SharedClock,
    channels: HashMap<u8, Channel>,
}

impl EdgeFrequencyCounter {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            channels: HashMap::new(),
        }
    }

    /// Claim `pin` as an input and count its rising edges
    pub fn attach(&mut self, io: &dyn DigitalIo, pin: u8) -> Result<()> {
        let mut line = io.input(pin, Pull::None)?;
        let counter = Arc::new(EdgeCounter::default());
        let handler_counter = counter.clone();
        line.on_rising_edge(Box::new(move || handler_counter.record_edge()))?;
        info!("Counting rising edges on GPIO {}", pin);

        self.channels.insert(
            pin,
            Channel {
                _line: line,
                counter,
            },
        );
        Ok(())
    }

    fn counter(&self, pin: u8) -> Result<&Arc<EdgeCounter>> {
        self.channels
            .get(&pin)
            .map(|c| &c.counter)
            .ok_or_else(|| RobotError::InvalidCommand(format!("GPIO {} is not attached", pin)))
    }

    /// Count edges on `pin` for `window` and return the frequency in Hz
    pub fn measure(&mut self, pin: u8, window: Duration) -> Result<f64> {
        let counter = self.counter(pin)?.clone();

        counter.take();
        let start = self.clock.now();
        self.clock.sleep(window);
        let count = counter.take();
        let elapsed = self.clock.now().saturating_duration_since(start);

        let frequency = edges_to_frequency(count, elapsed);
        debug!("GPIO {}: {} edges in {:?} -> {:.0} Hz", pin, count, elapsed, frequency);
        Ok(frequency)
    }

    /// Measure two pins over one shared window
    pub fn measure_both(&mut self, left: u8, right: u8, window: Duration) -> Result<(f64, f64)> {
        let left_counter = self.counter(left)?.clone();
        let right_counter = self.counter(right)?.clone();

        left_counter.take();
        right_counter.take();
        let start = self.clock.now();
        self.clock.sleep(window);
        let left_count = left_counter.take();
        let right_count = right_counter.take();
        let elapsed = self.clock.now().saturating_duration_since(start);

        Ok((
            edges_to_frequency(left_count, elapsed),
            edges_to_frequency(right_count, elapsed),
        ))
    }

    /// Measure one side selected by name ("l"/"left", "r"/"right")
    pub fn measure_side(
        &mut self,
        selector: &str,
        left: u8,
        right: u8,
        window: Duration,
    ) -> Result<f64> {
        match selector.parse::<Side>()? {
            Side::Left => self.measure(left, window),
            Side::Right => self.measure(right, window),
        }
    }
}

/// Estimate frequency from the width of one HIGH pulse: `1 / (2 * high)`.
///
/// Skips a pulse that is already in progress, then waits for the next rising
/// edge. Returns 0 if no pulse starts within `window`; a pulse still high
/// after `window` is cut off there.
pub fn measure_pulse_width(line: &dyn InputLine, clock: &SharedClock, window: Duration) -> f64 {
    let deadline = clock.now() + window;
    if wait_for(line, clock, Level::Low, deadline).is_none() {
        return 0.0;
    }
    let Some(rise) = wait_for(line, clock, Level::High, deadline) else {
        return 0.0;
    };
    let fall = wait_for(line, clock, Level::Low, rise + window).unwrap_or_else(|| clock.now());

    let high = fall.saturating_duration_since(rise).as_secs_f64();
    if high <= 0.0 {
        return 0.0;
    }
    1.0 / (2.0 * high)
}

fn wait_for(
    line: &dyn InputLine,
    clock: &SharedClock,
    level: Level,
    deadline: Instant,
) -> Option<Instant> {
    loop {
        let now = clock.now();
        if line.read() == level {
            return Some(now);
        }
        if now > deadline {
            return None;
        }
        std::hint::spin_loop();
    }
}

/// Line state from two frequency outputs
pub struct FrequencyLineSource {
    counter: EdgeFrequencyCounter,
    left_pin: u8,
    right_pin: u8,
    window: Duration,
    threshold_hz: f64,
}

impl FrequencyLineSource {
    pub fn new(
        io: &dyn DigitalIo,
        clock: SharedClock,
        left_pin: u8,
        right_pin: u8,
        window: Duration,
        threshold_hz: f64,
    ) -> Result<Self> {
        let mut counter = EdgeFrequencyCounter::new(clock);
        counter.attach(io, left_pin)?;
        counter.attach(io, right_pin)?;
        Ok(Self {
            counter,
            left_pin,
            right_pin,
            window,
            threshold_hz,
        })
    }
}

impl LineSource for FrequencyLineSource {
    fn read_line(&mut self) -> Option<(LineReading, LineReading)> {
        let (left, right) = self
            .counter
            .measure_both(self.left_pin, self.right_pin, self.window)
            .ok()?;
        Some((
            classify(left, self.threshold_hz),
            classify(right, self.threshold_hz),
        ))
    }
}
