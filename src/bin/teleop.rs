// Keyboard teleop: W forward, S backward, A/D rotate, 1-4 spin one wheel, Q quit
//
// Talks straight to the motor driver with ramping on. A key keeps acting for
// HOLD_TIME after its last press so terminal auto-repeat gaps don't make the
// wheels stutter.

use std::time::{Duration, Instant};

use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use linebot_runtime::config::Config;
use linebot_runtime::hal::sim::Sim;
use linebot_runtime::hal::{DigitalIo, SharedClock};
use linebot_runtime::motor::{DriveCommand, MotorDriveController, RampSettings, Wheel};
use tracing::info;

const SPEED: i8 = 40; // duty percent
const HOLD_TIME: Duration = Duration::from_millis(180);
const KEY_POLL: Duration = Duration::from_millis(50);
const IDLE: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(about = "Drive the robot from the keyboard")]
struct Args {
    /// JSON config (pin map, ramp step and delay)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Duty percent for every motion key
    #[arg(long, default_value_t = SPEED)]
    speed: i8,

    /// Use simulated GPIO
    #[arg(long)]
    simulate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Drive(DriveCommand),
    Single(Wheel),
}

fn key_action(key: char, speed: i8) -> Option<Action> {
    match key.to_ascii_lowercase() {
        'w' => Some(Action::Drive(DriveCommand::Forward(speed))),
        's' => Some(Action::Drive(DriveCommand::Backward(speed))),
        'a' => Some(Action::Drive(DriveCommand::TurnLeft(speed))),
        'd' => Some(Action::Drive(DriveCommand::TurnRight(speed))),
        '1' => Some(Action::Single(Wheel::FrontLeft)),
        '2' => Some(Action::Single(Wheel::FrontRight)),
        '3' => Some(Action::Single(Wheel::RearLeft)),
        '4' => Some(Action::Single(Wheel::RearRight)),
        _ => None,
    }
}

type Board = (Box<dyn DigitalIo>, SharedClock);

fn open_board(simulate: bool, pwm_hz: f64) -> Result<Board, Box<dyn std::error::Error>> {
    if simulate {
        let sim = Sim::new().realtime();
        let clock = sim.clock();
        return Ok((Box::new(sim), clock));
    }
    open_gpio(pwm_hz)
}

#[cfg(feature = "rpi")]
fn open_gpio(pwm_hz: f64) -> Result<Board, Box<dyn std::error::Error>> {
    let gpio = linebot_runtime::hal::rpi::RpiGpio::with_pwm_frequency(pwm_hz)?;
    Ok((Box::new(gpio), std::sync::Arc::new(linebot_runtime::hal::SystemClock)))
}

#[cfg(not(feature = "rpi"))]
fn open_gpio(_pwm_hz: f64) -> Result<Board, Box<dyn std::error::Error>> {
    Err("built without the `rpi` feature, use --simulate".into())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let (io, clock) = open_board(args.simulate, config.motor.pwm_frequency_hz)?;
    let ramp = RampSettings {
        enabled: true,
        ..RampSettings::from(&config.motor)
    };
    let mut motors = MotorDriveController::new(io.as_ref(), &config.motor.pins, ramp, clock)?;

    info!("Controls: W=forward S=backward A/D=rotate 1-4=single wheel (VL VR HL HR) Q=quit");
    info!("Speed: {}%", args.speed);

    enable_raw_mode()?;
    let result = run_teleop(&mut motors, args.speed);
    disable_raw_mode()?;

    info!("Stopping...");
    motors.stop_ramped();
    motors.shutdown();
    result
}

fn run_teleop(motors: &mut MotorDriveController, speed: i8) -> Result<(), Box<dyn std::error::Error>> {
    let ramp = motors.ramp_settings();
    let mut held: Option<(Action, Instant)> = None;

    loop {
        if event::poll(KEY_POLL)? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                match code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Char(c) if pressed => {
                        if let Some(action) = key_action(c, speed) {
                            held = Some((action, Instant::now()));
                        }
                    }
                    _ => {}
                }
            }
        }

        if held.is_some_and(|(_, at)| at.elapsed() > HOLD_TIME) {
            held = None;
        }

        match held {
            Some((Action::Drive(command), _)) => motors.set_targets(command),
            Some((Action::Single(wheel), _)) => {
                motors.set_targets(DriveCommand::Stop);
                motors.set_target(wheel, f32::from(speed));
            }
            None => motors.set_targets(DriveCommand::Stop),
        }
        motors.ramp_tick(ramp.step, ramp.delay);

        std::thread::sleep(IDLE);
    }
}
