// Sensor probe: stream raw readings to check wiring and thresholds
//
// Usage:
//   cargo run --example sensor_probe -- color              (edge counting, both sides)
//   cargo run --example sensor_probe -- color --pulse      (single pulse width)
//   cargo run --example sensor_probe -- color --side l
//   cargo run --example sensor_probe -- range
//
// The color sensors and the right rangefinder share GPIO 27, so the two
// probes run separately. Ctrl+C to stop.

use std::time::Duration;

use clap::{Parser, Subcommand};
use linebot_runtime::config::{self, UltrasonicConfig};
use linebot_runtime::hal::sim::Sim;
use linebot_runtime::hal::{DigitalIo, Pull, SharedClock};
use linebot_runtime::sensor::ultrasonic::{self, UltrasonicRangefinder};
use linebot_runtime::sensor::{EdgeFrequencyCounter, classify, frequency::measure_pulse_width};

const PRINT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(about = "Print raw sensor readings")]
struct Args {
    /// Use simulated GPIO (fixed synthetic signals)
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    probe: Probe,
}

#[derive(Subcommand, Debug)]
enum Probe {
    /// Color sensor frequencies and their line classification
    Color {
        /// Estimate from one HIGH pulse instead of counting edges
        #[arg(long)]
        pulse: bool,
        /// Only one side ("l" or "r")
        #[arg(long)]
        side: Option<String>,
    },
    /// Front and right ultrasonic distances
    Range,
}

type Board = (Box<dyn DigitalIo>, SharedClock);

fn open_board(simulate: bool) -> Result<Board, Box<dyn std::error::Error>> {
    if simulate {
        let sim = Sim::new().realtime();
        sim.set_square_wave(config::FREQ_LEFT_PIN, 16_000.0);
        sim.set_square_wave(config::FREQ_RIGHT_PIN, 4_000.0);
        sim.script_echo(
            config::US_FRONT_TRIG,
            config::US_FRONT_ECHO,
            Duration::from_micros(300),
            Duration::from_micros(2_915),
        );
        let clock = sim.clock();
        return Ok((Box::new(sim), clock));
    }
    open_gpio()
}

#[cfg(feature = "rpi")]
fn open_gpio() -> Result<Board, Box<dyn std::error::Error>> {
    let gpio = linebot_runtime::hal::rpi::RpiGpio::new()?;
    Ok((Box::new(gpio), std::sync::Arc::new(linebot_runtime::hal::SystemClock)))
}

#[cfg(not(feature = "rpi"))]
fn open_gpio() -> Result<Board, Box<dyn std::error::Error>> {
    Err("built without the `rpi` feature, use --simulate".into())
}

fn label(frequency: f64) -> &'static str {
    if classify(frequency, config::LINE_THRESHOLD_HZ).is_on_line() {
        "BLACK"
    } else {
        "WHITE"
    }
}

fn probe_color(
    io: &dyn DigitalIo,
    clock: SharedClock,
    pulse: bool,
    side: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (left, right) = (config::FREQ_LEFT_PIN, config::FREQ_RIGHT_PIN);
    let window = config::MEASUREMENT_WINDOW;
    println!(
        "Color probe on GPIO {}/{}, {:?} window, threshold {} Hz",
        left,
        right,
        window,
        config::LINE_THRESHOLD_HZ
    );

    if pulse {
        let left_line = io.input(left, Pull::None)?;
        let right_line = io.input(right, Pull::None)?;
        loop {
            let fl = measure_pulse_width(left_line.as_ref(), &clock, window);
            let fr = measure_pulse_width(right_line.as_ref(), &clock, window);
            println!("{:>8.0} {:>8.0}   {} {}", fl, fr, label(fl), label(fr));
            clock.sleep(PRINT_INTERVAL);
        }
    }

    let mut counter = EdgeFrequencyCounter::new(clock.clone());
    counter.attach(io, left)?;
    counter.attach(io, right)?;
    loop {
        match side {
            Some(selector) => {
                let f = counter.measure_side(selector, left, right, window)?;
                println!("{:>8.0}   {}", f, label(f));
            }
            None => {
                let (fl, fr) = counter.measure_both(left, right, window)?;
                println!("{:>8.0} {:>8.0}   {} {}", fl, fr, label(fl), label(fr));
            }
        }
        clock.sleep(PRINT_INTERVAL);
    }
}

fn probe_range(io: &dyn DigitalIo, clock: SharedClock) -> Result<(), Box<dyn std::error::Error>> {
    let us = UltrasonicConfig::default();
    let mut front =
        UltrasonicRangefinder::new(io, "front", us.front_trigger, us.front_echo, clock.clone())?;
    let mut right =
        UltrasonicRangefinder::new(io, "right", us.right_trigger, us.right_echo, clock.clone())?;

    let show = |reading: Option<f64>| match reading {
        Some(cm) => format!("{:>6.1} cm", cm),
        None => "    -- cm".to_string(),
    };
    loop {
        let (f, r) = ultrasonic::measure_both(&mut front, &mut right, us.inter_sample_delay, us.timeout);
        println!("{}: {}   {}: {}", front.name(), show(f), right.name(), show(r));
        clock.sleep(PRINT_INTERVAL);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let (io, clock) = open_board(args.simulate)?;

    match args.probe {
        Probe::Color { pulse, side } => probe_color(io.as_ref(), clock, pulse, side.as_deref()),
        Probe::Range => probe_range(io.as_ref(), clock),
    }
}
