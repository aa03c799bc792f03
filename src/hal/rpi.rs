// Raspberry Pi GPIO backend built on rppal
//
// Motor lines use rppal's software PWM (same as RPi.GPIO's PWM objects), edge
// counting uses async interrupts which run on rppal's own interrupt thread.

use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
use tracing::{debug, warn};

use super::{DigitalIo, InputLine, Level, OutputLine, Pull};
use crate::error::{Result, RobotError};

pub struct RpiGpio {
    gpio: Gpio,
    pwm_hz: f64,
}

impl RpiGpio {
    pub fn new() -> Result<Self> {
        Self::with_pwm_frequency(crate::config::PWM_FREQUENCY_HZ)
    }

    pub fn with_pwm_frequency(pwm_hz: f64) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| RobotError::unavailable(0, e.to_string()))?;
        Ok(Self { gpio, pwm_hz })
    }
}

impl DigitalIo for RpiGpio {
    fn output(&self, pin: u8) -> Result<Box<dyn OutputLine>> {
        let mut out = self
            .gpio
            .get(pin)
            .map_err(|e| RobotError::unavailable(pin, e.to_string()))?
            .into_output();
        out.set_low();
        debug!("GPIO {} claimed as output", pin);

        Ok(Box::new(RpiOutput {
            pin: out,
            pwm_hz: self.pwm_hz,
        }))
    }

    fn input(&self, pin: u8, pull: Pull) -> Result<Box<dyn InputLine>> {
        let raw = self
            .gpio
            .get(pin)
            .map_err(|e| RobotError::unavailable(pin, e.to_string()))?;
        let input = match pull {
            Pull::None => raw.into_input(),
            Pull::Up => raw.into_input_pullup(),
            Pull::Down => raw.into_input_pulldown(),
        };
        debug!("GPIO {} claimed as input ({:?})", pin, pull);

        Ok(Box::new(RpiInput { pin: input }))
    }
}

struct RpiOutput {
    pin: OutputPin,
    pwm_hz: f64,
}

impl OutputLine for RpiOutput {
    fn pin(&self) -> u8 {
        self.pin.pin()
    }

    fn write(&mut self, level: Level) {
        match level {
            Level::High => self.pin.set_high(),
            Level::Low => self.pin.set_low(),
        }
    }

    fn set_duty(&mut self, percent: u8) {
        let duty = f64::from(percent.min(100)) / 100.0;
        if let Err(e) = self.pin.set_pwm_frequency(self.pwm_hz, duty) {
            warn!("GPIO {}: failed to set duty {}%: {}", self.pin.pin(), percent, e);
        }
    }

    fn release(&mut self) {
        if let Err(e) = self.pin.clear_pwm() {
            warn!("GPIO {}: failed to stop PWM: {}", self.pin.pin(), e);
        }
        self.pin.set_low();
    }
}

struct RpiInput {
    pin: InputPin,
}

impl InputLine for RpiInput {
    fn pin(&self) -> u8 {
        self.pin.pin()
    }

    fn read(&self) -> Level {
        match self.pin.read() {
            rppal::gpio::Level::High => Level::High,
            rppal::gpio::Level::Low => Level::Low,
        }
    }

    fn on_rising_edge(&mut self, mut handler: Box<dyn FnMut() + Send>) -> Result<()> {
        let pin = self.pin.pin();
        self.pin
            // No debounce: every edge of a sensor's pulse train counts
            .set_async_interrupt(Trigger::RisingEdge, None, move |_event| handler())
            .map_err(|e| RobotError::unavailable(pin, format!("edge detection rejected: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_gpio_is_hardware_unavailable() {
        // Off the Pi there is no /dev/gpiomem; on the Pi this just opens it
        if let Err(e) = RpiGpio::new() {
            assert!(matches!(e, RobotError::HardwareUnavailable { pin: 0, .. }));
        }
    }
}
