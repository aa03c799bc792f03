// Error types shared by the hardware layer, sensors and motor controller

/// Everything that can go wrong between the control loop and the hardware
#[derive(Debug, thiserror::Error)]
pub enum RobotError {
    /// A pin could not be claimed or configured the way we asked.
    /// Fatal at startup, never raised mid-loop.
    #[error("GPIO {pin} unavailable: {reason}")]
    HardwareUnavailable { pin: u8, reason: String },

    /// No edge / echo within the allowed window. Callers turn this into an
    /// absent reading instead of failing.
    #[error("Timed out waiting for {what}")]
    SensorTimeout { what: &'static str },

    /// Programmer error: unknown wheel name, bad sensor selector, unattached pin
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Config parsed but holds a value the runtime cannot work with
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl RobotError {
    pub fn unavailable(pin: u8, reason: impl Into<String>) -> Self {
        Self::HardwareUnavailable {
            pin,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RobotError>;
