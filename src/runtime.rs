// Fixed-period control loop
//
// The loop itself is plain blocking code (sensor windows, echo timing and
// scripted turns all sleep or busy-poll for bounded times), so it runs on a tokio
// blocking worker. The async side only waits for SIGINT/SIGTERM and raises
// the shutdown flag, which the loop checks between cycles. Whatever ends the
// loop, the motors are stopped and released on the way out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, LineInput, UltrasonicConfig};
use crate::error::Result;
use crate::follower::{Decision, LineFollower};
use crate::hal::sim::Sim;
use crate::hal::{DigitalIo, InputLine, Level, Pull, SharedClock};
use crate::motor::{MotorDriveController, RampSettings};
use crate::sensor::ultrasonic::{self, UltrasonicRangefinder};
use crate::sensor::{
    DigitalLineSource, EnableSwitch, FrequencyLineSource, LineSource, LineState,
    SerialLineBridge,
};

struct Rangefinders {
    front: UltrasonicRangefinder,
    right: UltrasonicRangefinder,
    config: UltrasonicConfig,
}

/// The assembled robot: sensors, follower and motor driver
pub struct Robot {
    follower: LineFollower<MotorDriveController>,
    line: Box<dyn LineSource>,
    marker: Option<Box<dyn InputLine>>,
    enable: Option<EnableSwitch>,
    rangefinders: Option<Rangefinders>,
    clock: SharedClock,
    period: Duration,
}

impl Robot {
    /// Claim every line named in `config`. Any unavailable pin aborts startup.
    pub fn build(config: &Config, io: &dyn DigitalIo, clock: SharedClock) -> Result<Self> {
        let motors = MotorDriveController::new(
            io,
            &config.motor.pins,
            RampSettings::from(&config.motor),
            clock.clone(),
        )?;

        let line: Box<dyn LineSource> = match &config.line {
            LineInput::Digital {
                left_pin,
                right_pin,
            } => Box::new(DigitalLineSource::new(io, *left_pin, *right_pin)?),
            LineInput::Frequency {
                left_pin,
                right_pin,
                window,
                threshold_hz,
            } => Box::new(FrequencyLineSource::new(
                io,
                clock.clone(),
                *left_pin,
                *right_pin,
                *window,
                *threshold_hz,
            )?),
            LineInput::Serial { port, baud_rate } => {
                Box::new(SerialLineBridge::open(port, *baud_rate)?)
            }
        };

        let marker = match config.marker_pin {
            Some(pin) if config.follower.marker_enabled => Some(io.input(pin, Pull::None)?),
            _ => None,
        };

        let enable = config
            .enable_pin
            .map(|pin| EnableSwitch::new(io, pin, clock.clone(), config.debounce))
            .transpose()?;

        let rangefinders = match config.ultrasonic {
            Some(us) => Some(Rangefinders {
                front: UltrasonicRangefinder::new(
                    io,
                    "front",
                    us.front_trigger,
                    us.front_echo,
                    clock.clone(),
                )?,
                right: UltrasonicRangefinder::new(
                    io,
                    "right",
                    us.right_trigger,
                    us.right_echo,
                    clock.clone(),
                )?,
                config: us,
            }),
            None => None,
        };

        Ok(Self {
            follower: LineFollower::new(config.follower, motors, clock.clone()),
            line,
            marker,
            enable,
            rangefinders,
            clock,
            period: config.loop_period(),
        })
    }

    /// Fresh enable state and line state for this cycle
    fn sample(&mut self) -> (bool, Option<LineState>) {
        let enabled = self.enable.as_mut().is_none_or(|s| s.is_active());
        if !enabled {
            return (false, None);
        }
        let marker = self
            .marker
            .as_ref()
            .is_some_and(|m| m.read() == Level::High);
        let line = self
            .line
            .read_line()
            .map(|(l, r)| LineState::new(l.is_on_line(), r.is_on_line(), marker));
        (true, line)
    }

    /// One poll / decide / actuate cycle
    pub fn step(&mut self) -> Decision {
        let (enabled, line) = self.sample();
        let decision = self.follower.cycle(enabled, line);

        if decision == Decision::Idle {
            if let Some(r) = self.rangefinders.as_mut() {
                let (front, right) = ultrasonic::measure_both(
                    &mut r.front,
                    &mut r.right,
                    r.config.inter_sample_delay,
                    r.config.timeout,
                );
                debug!("Idle ranging: front={:?} cm right={:?} cm", front, right);
            }
        }
        decision
    }

    /// Run cycles at the configured period until `shutdown` is raised
    pub fn run_until(&mut self, shutdown: &AtomicBool) {
        info!("Control loop started: {:?} period", self.period);
        let mut overruns: u64 = 0;
        while !shutdown.load(Ordering::Acquire) {
            let started = self.clock.now();
            self.step();
            let spent = self.clock.now().saturating_duration_since(started);
            match self.period.checked_sub(spent) {
                Some(rest) => self.clock.sleep(rest),
                None => {
                    overruns += 1;
                    debug!("Cycle overran period: {:?}", spent);
                }
            }
        }
        info!("Control loop stopping ({} overrun cycles)", overruns);
        self.shutdown();
    }

    /// Stop the wheels and release the motor lines
    pub fn shutdown(&mut self) {
        self.follower.stop();
        self.follower.drive_mut().shutdown();
    }

    pub fn follower(&self) -> &LineFollower<MotorDriveController> {
        &self.follower
    }
}

/// Board used for `--simulate`: switch pressed, both sensors on a line,
/// an obstacle ~20 cm in front
fn dry_run_board(config: &Config) -> Sim {
    let sim = Sim::new().realtime();
    if let Some(pin) = config.enable_pin {
        sim.set_level(pin, Level::Low);
    }
    match &config.line {
        LineInput::Digital {
            left_pin,
            right_pin,
        } => {
            sim.set_level(*left_pin, Level::High);
            sim.set_level(*right_pin, Level::High);
        }
        LineInput::Frequency {
            left_pin,
            right_pin,
            threshold_hz,
            ..
        } => {
            // Reported frequency is half the edge rate
            sim.set_square_wave(*left_pin, threshold_hz * 4.0);
            sim.set_square_wave(*right_pin, threshold_hz * 4.0);
        }
        LineInput::Serial { .. } => {}
    }
    if let Some(us) = config.ultrasonic {
        sim.script_echo(
            us.front_trigger,
            us.front_echo,
            Duration::from_micros(400),
            Duration::from_micros(1_166),
        );
    }
    sim
}

#[cfg(feature = "rpi")]
fn open_board(config: &Config) -> Result<(Box<dyn DigitalIo>, SharedClock)> {
    let gpio = crate::hal::rpi::RpiGpio::with_pwm_frequency(config.motor.pwm_frequency_hz)?;
    Ok((Box::new(gpio), Arc::new(crate::hal::SystemClock)))
}

#[cfg(not(feature = "rpi"))]
fn open_board(_config: &Config) -> Result<(Box<dyn DigitalIo>, SharedClock)> {
    Err(crate::error::RobotError::unavailable(
        0,
        "built without the `rpi` feature, run with --simulate",
    ))
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Resolves with the signal's name on SIGINT or SIGTERM
async fn stop_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => interrupted.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|()| "Ctrl-C")
    }
}

/// Wait for `stop` or for the loop to end on its own. On every path the flag
/// is raised and the loop joined before returning, so the motor lines are
/// released before the process can exit.
async fn supervise<F>(
    mut control: JoinHandle<()>,
    shutdown: &AtomicBool,
    stop: F,
) -> std::result::Result<(), BoxError>
where
    F: Future<Output = std::io::Result<&'static str>>,
{
    tokio::select! {
        signal = stop => {
            shutdown.store(true, Ordering::Release);
            match &signal {
                Ok(name) => info!("{} received, shutting down", name),
                Err(e) => warn!("Signal handling failed ({}), shutting down", e),
            }
            let joined = (&mut control).await;
            joined?;
            signal?;
        }
        finished = &mut control => {
            // Only reachable if the loop panicked; the motor driver's Drop
            // has already zeroed the wheels during unwinding
            shutdown.store(true, Ordering::Release);
            finished?;
        }
    }
    Ok(())
}

/// Build the robot on real or simulated hardware and run it until SIGINT or
/// SIGTERM
pub async fn run(config: Config, simulate: bool) -> std::result::Result<(), BoxError> {
    let mut robot = {
        let (io, clock): (Box<dyn DigitalIo>, SharedClock) = if simulate {
            warn!("Running against simulated GPIO");
            let sim = dry_run_board(&config);
            let clock = sim.clock();
            (Box::new(sim), clock)
        } else {
            open_board(&config)?
        };
        Robot::build(&config, io.as_ref(), clock)?
    };

    info!(
        "Robot ready: {}Hz loop, base {}%, turn {}%, marker {}, end zone {:?}",
        config.loop_hz,
        config.follower.base_speed,
        config.follower.turn_speed,
        if config.follower.marker_enabled { "on" } else { "off" },
        config.follower.end_zone.map(|e| e.threshold)
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let control = tokio::task::spawn_blocking(move || robot.run_until(&flag));

    supervise(control, &shutdown, stop_signal()).await?;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DEBOUNCE, MARKER_PIN, MotorPins, SENSOR_LEFT_PIN, SENSOR_RIGHT_PIN, SWITCH_PIN,
    };
    use crate::follower::FollowState;
    use crate::motor::Wheel;

    fn sim_config() -> Config {
        Config {
            ultrasonic: None,
            ..Config::default()
        }
    }

    /// Hold the switch down long enough to pass the debounce
    fn press_switch(sim: &Sim, robot: &mut Robot) {
        sim.set_level(SWITCH_PIN, Level::Low);
        assert_eq!(robot.step(), Decision::Idle);
        sim.clock().sleep(DEBOUNCE);
    }

    fn both_on_line(sim: &Sim) {
        sim.set_level(SENSOR_LEFT_PIN, Level::High);
        sim.set_level(SENSOR_RIGHT_PIN, Level::High);
    }

    fn assert_motors_released(sim: &Sim, pins: &MotorPins) {
        for wheel in Wheel::ALL {
            let p = pins.for_wheel(wheel);
            assert_eq!((sim.duty(p.a), sim.duty(p.b)), (0, 0), "{}", wheel);
            assert!(sim.is_released(p.a) && sim.is_released(p.b), "{}", wheel);
        }
    }

    #[test]
    fn test_build_claims_all_lines() {
        let sim = Sim::new();
        let config = Config::default();
        let _robot = Robot::build(&config, &sim, sim.clock()).unwrap();
        let pins = MotorPins::default();
        for wheel in Wheel::ALL {
            assert!(sim.is_claimed(pins.for_wheel(wheel).a));
        }
        assert!(sim.is_claimed(SWITCH_PIN));
        assert!(sim.is_claimed(crate::config::US_FRONT_TRIG));
    }

    #[test]
    fn test_pin_conflict_aborts_startup() {
        let sim = Sim::new();
        let config = Config {
            marker_pin: Some(SENSOR_LEFT_PIN),
            ..sim_config()
        };
        assert!(matches!(
            Robot::build(&config, &sim, sim.clock()),
            Err(crate::error::RobotError::HardwareUnavailable { .. })
        ));
    }

    #[test]
    fn test_switch_released_stays_idle() {
        let sim = Sim::new();
        let mut robot = Robot::build(&sim_config(), &sim, sim.clock()).unwrap();
        assert_eq!(robot.step(), Decision::Idle);
        assert_eq!(robot.follower().state(), FollowState::Idle);
    }

    #[test]
    fn test_pressed_switch_follows_line() {
        let sim = Sim::new();
        let config = sim_config();
        let mut robot = Robot::build(&config, &sim, sim.clock()).unwrap();
        both_on_line(&sim);
        press_switch(&sim, &mut robot);

        assert_eq!(robot.step(), Decision::Straight);
        let fl = config.motor.pins.front_left;
        assert_eq!(sim.duty(fl.a), config.follower.base_speed as u8);
        assert_eq!(sim.duty(fl.b), 0);
    }

    #[test]
    fn test_default_step_fits_loop_period() {
        let sim = Sim::new();
        let config = Config::default();
        let mut robot = Robot::build(&config, &sim, sim.clock()).unwrap();
        both_on_line(&sim);
        press_switch(&sim, &mut robot);

        let before = sim.elapsed();
        assert_eq!(robot.step(), Decision::Straight);
        assert!(sim.elapsed() - before < config.loop_period());
    }

    #[test]
    fn test_marker_input_triggers_half_turn() {
        let sim = Sim::new();
        let config = sim_config();
        let mut robot = Robot::build(&config, &sim, sim.clock()).unwrap();
        both_on_line(&sim);
        sim.set_level(MARKER_PIN, Level::High);
        press_switch(&sim, &mut robot);

        let before = sim.elapsed();
        assert_eq!(
            robot.step(),
            Decision::Marker(crate::follower::MarkerTurn::Half)
        );
        assert!(sim.elapsed() - before >= config.follower.half_turn);
    }

    #[test]
    fn test_frequency_line_input() {
        let sim = Sim::new();
        let config = Config {
            line: LineInput::frequency(),
            marker_pin: None,
            ..sim_config()
        };
        let mut robot = Robot::build(&config, &sim, sim.clock()).unwrap();
        sim.set_square_wave(crate::config::FREQ_LEFT_PIN, 40_000.0);
        press_switch(&sim, &mut robot);

        assert_eq!(robot.step(), Decision::CorrectLeft);
    }

    #[test]
    fn test_run_until_shuts_down_motors() {
        let sim = Sim::new();
        let config = sim_config();
        let mut robot = Robot::build(&config, &sim, sim.clock()).unwrap();
        both_on_line(&sim);
        press_switch(&sim, &mut robot);
        robot.step();

        let shutdown = AtomicBool::new(true);
        robot.run_until(&shutdown);

        assert_motors_released(&sim, &config.motor.pins);
        assert_eq!(robot.follower().state(), FollowState::Idle);
    }

    #[test]
    fn test_flag_raised_from_another_thread_releases_motors() {
        let sim = Sim::new();
        let config = sim_config();
        let mut robot = Robot::build(&config, &sim, sim.clock()).unwrap();
        both_on_line(&sim);
        sim.set_level(SWITCH_PIN, Level::Low);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let control = std::thread::spawn(move || robot.run_until(&flag));

        // Let the loop get past the debounce and drive
        while sim.duty(config.motor.pins.front_left.a) == 0 {
            std::thread::yield_now();
        }
        shutdown.store(true, Ordering::Release);
        control.join().unwrap();

        assert_motors_released(&sim, &config.motor.pins);
    }

    fn driving_robot(sim: &Sim, config: &Config) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let mut robot = Robot::build(config, sim, sim.clock()).unwrap();
        both_on_line(sim);
        press_switch(sim, &mut robot);
        assert_eq!(robot.step(), Decision::Straight);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let control = tokio::task::spawn_blocking(move || robot.run_until(&flag));
        (control, shutdown)
    }

    #[tokio::test]
    async fn test_terminate_signal_releases_motors() {
        let sim = Sim::new();
        let config = sim_config();
        let (control, shutdown) = driving_robot(&sim, &config);

        supervise(control, &shutdown, async { Ok::<_, std::io::Error>("SIGTERM") })
            .await
            .unwrap();

        assert!(shutdown.load(Ordering::Acquire));
        assert_motors_released(&sim, &config.motor.pins);
    }

    #[tokio::test]
    async fn test_failed_signal_handler_still_releases_motors() {
        let sim = Sim::new();
        let config = sim_config();
        let (control, shutdown) = driving_robot(&sim, &config);

        let failed = async { Err::<&'static str, _>(std::io::Error::other("no signal handler")) };
        assert!(supervise(control, &shutdown, failed).await.is_err());

        assert!(shutdown.load(Ordering::Acquire));
        assert_motors_released(&sim, &config.motor.pins);
    }

    #[test]
    fn test_idle_polls_rangefinders() {
        let sim = Sim::new();
        let config = Config::default();
        let us = config.ultrasonic.unwrap();
        let mut robot = Robot::build(&config, &sim, sim.clock()).unwrap();

        let before = sim.elapsed();
        assert_eq!(robot.step(), Decision::Idle);
        // Two missed echoes plus the gap between pings
        assert!(sim.elapsed() - before >= us.timeout * 2 + us.inter_sample_delay);
    }

    #[test]
    fn test_dry_run_board_levels() {
        let config = sim_config();
        let sim = dry_run_board(&config);
        let switch = sim.input(SWITCH_PIN, Pull::Up).unwrap();
        let left = sim.input(SENSOR_LEFT_PIN, Pull::None).unwrap();
        let right = sim.input(SENSOR_RIGHT_PIN, Pull::None).unwrap();
        assert_eq!(switch.read(), Level::Low);
        assert_eq!(left.read(), Level::High);
        assert_eq!(right.read(), Level::High);
    }
}
