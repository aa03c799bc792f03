// Pins, speeds, timings and behavior switches
//
// Every tunable lives here as a named default. A JSON file passed with
// `--config` can override any subset of them (missing fields keep defaults).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RobotError};
use crate::motor::Wheel;

// Control loop frequency
pub const LOOP_HZ: u64 = 100;

// Motor PWM
pub const PWM_FREQUENCY_HZ: f64 = 1000.0;
pub const RAMP_STEP_PERCENT: u8 = 5; // percent per ramp tick
pub const RAMP_STEP_DELAY: Duration = Duration::from_millis(20);

// Line following speeds (percent duty)
pub const BASE_SPEED: i8 = 20;
pub const TURN_SPEED: i8 = 80;
pub const SEARCH_SPEED: i8 = BASE_SPEED / 2; // neither sensor sees the line

// How long a correction turn is held before driving forward again
pub const CORRECTION_PULSE: Duration = Duration::from_millis(40);

// Marker maneuvers (timed turns at TURN_SPEED)
pub const QUARTER_TURN: Duration = Duration::from_millis(600);
pub const HALF_TURN: Duration = Duration::from_millis(1200);

// End zone: both sensors off the line for this long
pub const END_ZONE_THRESHOLD: Duration = Duration::from_secs(4);
pub const END_ZONE_PAUSE: Duration = Duration::from_millis(500);
pub const END_ZONE_TURN: Duration = HALF_TURN;

// Start switch (active low, internal pull-up)
pub const SWITCH_PIN: u8 = 25;
pub const DEBOUNCE: Duration = Duration::from_millis(20);

// Line sensors
pub const SENSOR_LEFT_PIN: u8 = 5;
pub const SENSOR_RIGHT_PIN: u8 = 6;
pub const MARKER_PIN: u8 = 22;
pub const FREQ_LEFT_PIN: u8 = 22;
pub const FREQ_RIGHT_PIN: u8 = 27;
pub const MEASUREMENT_WINDOW: Duration = Duration::from_millis(5);
pub const LINE_THRESHOLD_HZ: f64 = 7000.0; // above = black line
pub const BRIDGE_PORT: &str = "/dev/serial0";
pub const BRIDGE_BAUDRATE: u32 = 115_200;

// Ultrasonic rangefinders (HC-SR04)
pub const US_FRONT_TRIG: u8 = 23;
pub const US_FRONT_ECHO: u8 = 24;
pub const US_RIGHT_TRIG: u8 = 17;
pub const US_RIGHT_ECHO: u8 = 27;
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(20);
pub const INTER_SAMPLE_DELAY: Duration = Duration::from_millis(10);

/// Durations are written as integer milliseconds in config files
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub loop_hz: u64,
    pub motor: MotorConfig,
    pub line: LineInput,
    /// Marker ("green") input, high = active
    pub marker_pin: Option<u8>,
    /// Start switch; `None` runs without one
    pub enable_pin: Option<u8>,
    #[serde(with = "millis")]
    pub debounce: Duration,
    pub follower: FollowerConfig,
    pub ultrasonic: Option<UltrasonicConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loop_hz: LOOP_HZ,
            motor: MotorConfig::default(),
            line: LineInput::default(),
            marker_pin: Some(MARKER_PIN),
            enable_pin: Some(SWITCH_PIN),
            debounce: DEBOUNCE,
            follower: FollowerConfig::default(),
            ultrasonic: Some(UltrasonicConfig::default()),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse and validate; missing fields keep their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.motor.ramp_step == 0 {
            return Err(RobotError::InvalidConfig(
                "motor.ramp_step must be at least 1".into(),
            ));
        }
        if self.loop_hz == 0 {
            return Err(RobotError::InvalidConfig("loop_hz must be at least 1".into()));
        }
        Ok(())
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.loop_hz.max(1))
    }
}

/// One wheel's polarity lines: A drives forward, B drives reverse
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WheelPins {
    pub a: u8,
    pub b: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MotorPins {
    pub front_left: WheelPins,
    pub front_right: WheelPins,
    pub rear_left: WheelPins,
    pub rear_right: WheelPins,
}

impl MotorPins {
    pub fn for_wheel(&self, wheel: Wheel) -> WheelPins {
        match wheel {
            Wheel::FrontLeft => self.front_left,
            Wheel::FrontRight => self.front_right,
            Wheel::RearLeft => self.rear_left,
            Wheel::RearRight => self.rear_right,
        }
    }
}

impl Default for MotorPins {
    fn default() -> Self {
        Self {
            front_left: WheelPins { a: 18, b: 21 },
            front_right: WheelPins { a: 20, b: 13 },
            rear_left: WheelPins { a: 26, b: 19 },
            rear_right: WheelPins { a: 16, b: 12 },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub pins: MotorPins,
    pub pwm_frequency_hz: f64,
    /// Ramp toward commanded speeds instead of jumping
    pub ramped: bool,
    pub ramp_step: u8,
    #[serde(with = "millis")]
    pub ramp_delay: Duration,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            pins: MotorPins::default(),
            pwm_frequency_hz: PWM_FREQUENCY_HZ,
            ramped: false,
            ramp_step: RAMP_STEP_PERCENT,
            ramp_delay: RAMP_STEP_DELAY,
        }
    }
}

/// Where left/right line state comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineInput {
    /// Plain digital levels (high = on line), e.g. pre-classified by an ESP32
    Digital { left_pin: u8, right_pin: u8 },
    /// TCS-style pulse outputs classified by edge frequency
    Frequency {
        left_pin: u8,
        right_pin: u8,
        #[serde(with = "millis")]
        window: Duration,
        threshold_hz: f64,
    },
    /// "<left> <right>" lines from an ESP32 over UART
    Serial { port: String, baud_rate: u32 },
}

impl Default for LineInput {
    fn default() -> Self {
        LineInput::Digital {
            left_pin: SENSOR_LEFT_PIN,
            right_pin: SENSOR_RIGHT_PIN,
        }
    }
}

impl LineInput {
    /// Color sensors on the frequency pins with the stock window and threshold
    pub fn frequency() -> Self {
        LineInput::Frequency {
            left_pin: FREQ_LEFT_PIN,
            right_pin: FREQ_RIGHT_PIN,
            window: MEASUREMENT_WINDOW,
            threshold_hz: LINE_THRESHOLD_HZ,
        }
    }

    /// ESP32 bridge on the Pi's primary UART
    pub fn serial() -> Self {
        LineInput::Serial {
            port: BRIDGE_PORT.to_string(),
            baud_rate: BRIDGE_BAUDRATE,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FollowerConfig {
    pub base_speed: i8,
    pub turn_speed: i8,
    pub search_speed: i8,
    #[serde(with = "millis")]
    pub correction_pulse: Duration,
    /// Scripted turns on the marker signal
    pub marker_enabled: bool,
    #[serde(with = "millis")]
    pub quarter_turn: Duration,
    #[serde(with = "millis")]
    pub half_turn: Duration,
    /// Recovery turn after a prolonged loss of line; `None` disables it
    pub end_zone: Option<EndZoneConfig>,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            base_speed: BASE_SPEED,
            turn_speed: TURN_SPEED,
            search_speed: SEARCH_SPEED,
            correction_pulse: CORRECTION_PULSE,
            marker_enabled: true,
            quarter_turn: QUARTER_TURN,
            half_turn: HALF_TURN,
            end_zone: Some(EndZoneConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndZoneConfig {
    #[serde(with = "millis")]
    pub threshold: Duration,
    #[serde(with = "millis")]
    pub pause: Duration,
    #[serde(with = "millis")]
    pub turn: Duration,
}

impl Default for EndZoneConfig {
    fn default() -> Self {
        Self {
            threshold: END_ZONE_THRESHOLD,
            pause: END_ZONE_PAUSE,
            turn: END_ZONE_TURN,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UltrasonicConfig {
    pub front_trigger: u8,
    pub front_echo: u8,
    pub right_trigger: u8,
    pub right_echo: u8,
    #[serde(with = "millis")]
    pub timeout: Duration,
    #[serde(with = "millis")]
    pub inter_sample_delay: Duration,
}

impl Default for UltrasonicConfig {
    fn default() -> Self {
        Self {
            front_trigger: US_FRONT_TRIG,
            front_echo: US_FRONT_ECHO,
            right_trigger: US_RIGHT_TRIG,
            right_echo: US_RIGHT_ECHO,
            timeout: ECHO_TIMEOUT,
            inter_sample_delay: INTER_SAMPLE_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "follower": { "base_speed": 35, "end_zone": null },
            "line": { "kind": "frequency", "left_pin": 22, "right_pin": 27,
                      "window": 5, "threshold_hz": 6500.0 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.follower.base_speed, 35);
        assert_eq!(config.follower.turn_speed, TURN_SPEED);
        assert!(config.follower.end_zone.is_none());
        assert_eq!(
            config.line,
            LineInput::Frequency {
                left_pin: 22,
                right_pin: 27,
                window: Duration::from_millis(5),
                threshold_hz: 6500.0,
            }
        );
        assert_eq!(config.motor.ramp_step, RAMP_STEP_PERCENT);
    }

    #[test]
    fn test_defaults_round_trip_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.follower, config.follower);
        assert_eq!(back.motor.pins, config.motor.pins);
        assert_eq!(back.loop_period(), Duration::from_millis(10));
    }

    #[test]
    fn test_zero_ramp_step_rejected() {
        let err = Config::from_json(r#"{ "motor": { "ramp_step": 0 } }"#).unwrap_err();
        assert!(matches!(err, RobotError::InvalidConfig(_)));
        assert!(Config::from_json(r#"{ "loop_hz": 0 }"#).is_err());
        assert!(Config::from_json(r#"{ "motor": { "ramp_step": 1 } }"#).is_ok());
    }

    #[test]
    fn test_line_input_presets() {
        assert_eq!(
            LineInput::serial(),
            LineInput::Serial {
                port: "/dev/serial0".into(),
                baud_rate: 115_200
            }
        );
        let json = serde_json::to_string(&LineInput::frequency()).unwrap();
        assert!(json.contains(r#""kind":"frequency""#));
        assert!(json.contains(r#""window":5"#));
    }

    #[test]
    fn test_default_motor_pins_are_distinct() {
        let pins = MotorPins::default();
        let mut all: Vec<u8> = Wheel::ALL
            .iter()
            .flat_map(|&w| {
                let p = pins.for_wheel(w);
                [p.a, p.b]
            })
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8);
    }
}
