// Simulated GPIO + clock
//
// Time is virtual: it only moves when someone sleeps or observes the clock
// (each `now()` costs a small fixed tick, so bounded busy-polls terminate).
// Inputs can carry a square wave (edges fire as time passes), a forced level,
// or a scheduled echo pulse that starts relative to a trigger's falling edge.
// Used by the unit tests and by `--simulate` dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{Clock, DigitalIo, InputLine, Level, OutputLine, Pull, SharedClock};
use crate::error::{Result, RobotError};

/// Virtual time consumed by each clock observation
pub const DEFAULT_TICK: Duration = Duration::from_micros(1);

#[derive(Debug, Clone, Copy, Default)]
struct OutputRecord {
    level: Option<Level>,
    duty: u8,
    released: bool,
}

#[derive(Debug, Clone, Copy)]
struct EchoScript {
    echo_pin: u8,
    delay: Duration,
    width: Duration,
}

type EdgeHandler = Box<dyn FnMut() + Send>;

struct SimState {
    elapsed: Duration,
    tick: Duration,
    realtime: bool,
    claimed: HashSet<u8>,
    rejected: HashSet<u8>,
    no_edge_detect: HashSet<u8>,
    outputs: HashMap<u8, OutputRecord>,
    pulls: HashMap<u8, Pull>,
    forced: HashMap<u8, Level>,
    waves: HashMap<u8, f64>,
    echo_scripts: HashMap<u8, EchoScript>,
    echo_windows: HashMap<u8, (Duration, Duration)>,
    handlers: Vec<(u8, EdgeHandler)>,
}

impl SimState {
    fn advance(&mut self, by: Duration) {
        let t0 = self.elapsed.as_secs_f64();
        self.elapsed += by;
        let t1 = self.elapsed.as_secs_f64();

        let fired: Vec<(u8, u64)> = self
            .waves
            .iter()
            .map(|(&pin, &hz)| {
                let edges = (t1 * hz).floor() - (t0 * hz).floor();
                (pin, edges.max(0.0) as u64)
            })
            .filter(|&(_, n)| n > 0)
            .collect();

        for (pin, n) in fired {
            self.fire(pin, n);
        }
    }

    fn fire(&mut self, pin: u8, n: u64) {
        for (handler_pin, handler) in self.handlers.iter_mut() {
            if *handler_pin == pin {
                for _ in 0..n {
                    handler();
                }
            }
        }
    }

    fn input_level(&self, pin: u8) -> Level {
        if let Some(&(start, end)) = self.echo_windows.get(&pin) {
            if self.elapsed >= start && self.elapsed < end {
                return Level::High;
            }
        }
        if let Some(&hz) = self.waves.get(&pin) {
            let phase = (self.elapsed.as_secs_f64() * hz).fract();
            return if phase < 0.5 { Level::High } else { Level::Low };
        }
        if let Some(&level) = self.forced.get(&pin) {
            return level;
        }
        match self.pulls.get(&pin) {
            Some(Pull::Up) => Level::High,
            _ => Level::Low,
        }
    }
}

/// Handle to one simulated board. Cheap to clone, all clones share state.
#[derive(Clone)]
pub struct Sim {
    base: Instant,
    state: Arc<Mutex<SimState>>,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Arc::new(Mutex::new(SimState {
                elapsed: Duration::ZERO,
                tick: DEFAULT_TICK,
                realtime: false,
                claimed: HashSet::new(),
                rejected: HashSet::new(),
                no_edge_detect: HashSet::new(),
                outputs: HashMap::new(),
                pulls: HashMap::new(),
                forced: HashMap::new(),
                waves: HashMap::new(),
                echo_scripts: HashMap::new(),
                echo_windows: HashMap::new(),
                handlers: Vec::new(),
            })),
        }
    }

    /// Sleeps also block the calling thread for real (dry runs)
    pub fn realtime(self) -> Self {
        self.state().realtime = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn clock(&self) -> SharedClock {
        Arc::new(SimClock { sim: self.clone() })
    }

    /// Virtual time since the board was created
    pub fn elapsed(&self) -> Duration {
        self.state().elapsed
    }

    pub fn set_level(&self, pin: u8, level: Level) {
        self.state().forced.insert(pin, level);
    }

    /// Drive `pin` with a 50% square wave; `hz <= 0` removes it
    pub fn set_square_wave(&self, pin: u8, hz: f64) {
        let mut state = self.state();
        if hz > 0.0 {
            state.waves.insert(pin, hz);
        } else {
            state.waves.remove(&pin);
        }
    }

    /// After every falling edge on `trigger`, raise `echo` for `width`,
    /// starting `delay` later
    pub fn script_echo(&self, trigger: u8, echo: u8, delay: Duration, width: Duration) {
        self.state().echo_scripts.insert(
            trigger,
            EchoScript {
                echo_pin: echo,
                delay,
                width,
            },
        );
    }

    /// Fire `n` rising edges on `pin` right now
    pub fn inject_edges(&self, pin: u8, n: u64) {
        self.state().fire(pin, n);
    }

    /// Claiming `pin` will fail
    pub fn reject_pin(&self, pin: u8) {
        self.state().rejected.insert(pin);
    }

    /// Edge detection on `pin` will fail
    pub fn reject_edge_detection(&self, pin: u8) {
        self.state().no_edge_detect.insert(pin);
    }

    /// Last duty written to an output (0 if never written)
    pub fn duty(&self, pin: u8) -> u8 {
        self.state().outputs.get(&pin).map_or(0, |o| o.duty)
    }

    pub fn output_level(&self, pin: u8) -> Option<Level> {
        self.state().outputs.get(&pin).and_then(|o| o.level)
    }

    pub fn is_released(&self, pin: u8) -> bool {
        self.state().outputs.get(&pin).is_some_and(|o| o.released)
    }

    pub fn is_claimed(&self, pin: u8) -> bool {
        self.state().claimed.contains(&pin)
    }

    fn claim(&self, pin: u8) -> Result<()> {
        let mut state = self.state();
        if state.rejected.contains(&pin) {
            return Err(RobotError::unavailable(pin, "pin rejected by board"));
        }
        if !state.claimed.insert(pin) {
            return Err(RobotError::unavailable(pin, "pin already claimed"));
        }
        Ok(())
    }
}

impl DigitalIo for Sim {
    fn output(&self, pin: u8) -> Result<Box<dyn OutputLine>> {
        self.claim(pin)?;
        self.state().outputs.insert(
            pin,
            OutputRecord {
                level: Some(Level::Low),
                ..Default::default()
            },
        );
        Ok(Box::new(SimOutput {
            pin,
            sim: self.clone(),
        }))
    }

    fn input(&self, pin: u8, pull: Pull) -> Result<Box<dyn InputLine>> {
        self.claim(pin)?;
        self.state().pulls.insert(pin, pull);
        Ok(Box::new(SimInput {
            pin,
            sim: self.clone(),
        }))
    }
}

struct SimClock {
    sim: Sim,
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        let mut state = self.sim.state();
        let tick = state.tick;
        state.advance(tick);
        self.sim.base + state.elapsed
    }

    fn sleep(&self, duration: Duration) {
        let realtime = {
            let mut state = self.sim.state();
            state.advance(duration);
            state.realtime
        };
        if realtime && !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

struct SimOutput {
    pin: u8,
    sim: Sim,
}

impl OutputLine for SimOutput {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn write(&mut self, level: Level) {
        let mut state = self.sim.state();
        let previous = state.outputs.get(&self.pin).and_then(|o| o.level);
        state.outputs.entry(self.pin).or_default().level = Some(level);

        if previous == Some(Level::High) && level == Level::Low {
            if let Some(script) = state.echo_scripts.get(&self.pin).copied() {
                let start = state.elapsed + script.delay;
                state
                    .echo_windows
                    .insert(script.echo_pin, (start, start + script.width));
            }
        }
    }

    fn set_duty(&mut self, percent: u8) {
        self.sim.state().outputs.entry(self.pin).or_default().duty = percent.min(100);
    }

    fn release(&mut self) {
        let mut state = self.sim.state();
        let record = state.outputs.entry(self.pin).or_default();
        record.duty = 0;
        record.level = Some(Level::Low);
        record.released = true;
    }
}

impl Drop for SimOutput {
    fn drop(&mut self) {
        self.sim.state().claimed.remove(&self.pin);
    }
}

struct SimInput {
    pin: u8,
    sim: Sim,
}

impl InputLine for SimInput {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn read(&self) -> Level {
        self.sim.state().input_level(self.pin)
    }

    fn on_rising_edge(&mut self, handler: Box<dyn FnMut() + Send>) -> Result<()> {
        let mut state = self.sim.state();
        if state.no_edge_detect.contains(&self.pin) {
            return Err(RobotError::unavailable(self.pin, "edge detection rejected"));
        }
        state.handlers.push((self.pin, handler));
        Ok(())
    }
}

impl Drop for SimInput {
    fn drop(&mut self) {
        let mut state = self.sim.state();
        state.claimed.remove(&self.pin);
        let pin = self.pin;
        state.handlers.retain(|(p, _)| *p != pin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_advances_virtual_time() {
        let sim = Sim::new();
        let clock = sim.clock();
        let t0 = clock.now();
        clock.sleep(Duration::from_millis(5));
        let dt = clock.now() - t0;
        assert!(dt >= Duration::from_millis(5));
        assert!(dt < Duration::from_millis(5) + Duration::from_micros(10));
    }

    #[test]
    fn test_square_wave_fires_edges() {
        let sim = Sim::new();
        let clock = sim.clock();
        let mut input = sim.input(4, Pull::None).unwrap();
        let count = Arc::new(Mutex::new(0u64));
        let seen = count.clone();
        input
            .on_rising_edge(Box::new(move || *seen.lock().unwrap() += 1))
            .unwrap();

        sim.set_square_wave(4, 1000.0);
        clock.sleep(Duration::from_millis(10));
        assert_eq!(*count.lock().unwrap(), 10);
    }

    #[test]
    fn test_double_claim_rejected() {
        let sim = Sim::new();
        let _first = sim.output(12).unwrap();
        assert!(matches!(
            sim.output(12),
            Err(RobotError::HardwareUnavailable { pin: 12, .. })
        ));
    }

    #[test]
    fn test_pull_up_reads_high_by_default() {
        let sim = Sim::new();
        let input = sim.input(25, Pull::Up).unwrap();
        assert_eq!(input.read(), Level::High);
        sim.set_level(25, Level::Low);
        assert_eq!(input.read(), Level::Low);
    }
}
