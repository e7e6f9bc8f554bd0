//! Hardware bus ports and their mock adapters.
//!
//! Drivers talk to small port traits instead of concrete buses so the same
//! driver code runs against real peripherals on the device and against
//! mocks in tests and off-target builds. Real bus adapters are wired by the
//! deployment; the default build ships the mocks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Errors surfaced by bus adapters.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("bus transfer failed: {0}")]
    Transfer(String),
    #[error("no hardware bus available")]
    Unavailable,
}

/// A byte-register oriented I²C bus, addressed to one peripheral.
pub trait I2cBus: Send {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), HardwareError>;
    fn read_register(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), HardwareError>;
}

/// A single GPIO pin driven as an output.
pub trait GpioOutputPin: Send {
    fn set_high(&mut self) -> Result<(), HardwareError>;
    fn set_low(&mut self) -> Result<(), HardwareError>;
}

/// A single GPIO pin read as an input.
pub trait GpioInputPin: Send {
    fn is_high(&mut self) -> Result<bool, HardwareError>;
}

// ---------------------------------------------------------------------------
// Mock adapters
// ---------------------------------------------------------------------------

/// I²C mock with scripted read responses.
///
/// Writes are recorded; each `read_register` pops the next scripted
/// response. An exhausted script fails the transfer, which the driver
/// manager logs like any other read failure.
#[derive(Default)]
pub struct MockI2cBus {
    pub writes: Vec<(u8, u8)>,
    responses: VecDeque<Vec<u8>>,
}

impl MockI2cBus {
    pub fn new() -> Self {
        MockI2cBus::default()
    }

    /// Queue the response for the next `read_register` call.
    pub fn push_response(&mut self, response: Vec<u8>) {
        self.responses.push_back(response);
    }
}

impl I2cBus for MockI2cBus {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), HardwareError> {
        self.writes.push((register, value));
        Ok(())
    }

    fn read_register(&mut self, _register: u8, buffer: &mut [u8]) -> Result<(), HardwareError> {
        let response = self.responses.pop_front().ok_or(HardwareError::Unavailable)?;
        if response.len() != buffer.len() {
            return Err(HardwareError::Transfer(format!(
                "scripted response has {} bytes, read asked for {}",
                response.len(),
                buffer.len()
            )));
        }
        buffer.copy_from_slice(&response);
        Ok(())
    }
}

/// In-memory GPIO pin level shared between an output and an input end.
#[derive(Clone, Default)]
pub struct MockGpioPin {
    level: Arc<Mutex<bool>>,
}

impl MockGpioPin {
    pub fn new() -> Self {
        MockGpioPin::default()
    }

    pub fn level(&self) -> bool {
        *self.level.lock().expect("pin level mutex")
    }
}

impl GpioOutputPin for MockGpioPin {
    fn set_high(&mut self) -> Result<(), HardwareError> {
        *self.level.lock().expect("pin level mutex") = true;
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), HardwareError> {
        *self.level.lock().expect("pin level mutex") = false;
        Ok(())
    }
}

impl GpioInputPin for MockGpioPin {
    fn is_high(&mut self) -> Result<bool, HardwareError> {
        Ok(self.level())
    }
}

// ---------------------------------------------------------------------------
// Bus factories
// ---------------------------------------------------------------------------

/// Open the I²C bus for one peripheral address.
pub fn open_i2c(_address: u8) -> Box<dyn I2cBus> {
    Box::new(MockI2cBus::new())
}

/// Claim a GPIO pin as an output.
pub fn open_gpio_output(_pin: u8) -> Box<dyn GpioOutputPin> {
    Box::new(MockGpioPin::new())
}

/// Claim a GPIO pin as an input.
pub fn open_gpio_input(_pin: u8) -> Box<dyn GpioInputPin> {
    Box::new(MockGpioPin::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_i2c_replays_scripted_responses_in_order() {
        let mut bus = MockI2cBus::new();
        bus.push_response(vec![1, 2]);
        bus.push_response(vec![3, 4]);

        let mut buffer = [0u8; 2];
        bus.read_register(0x00, &mut buffer).unwrap();
        assert_eq!(buffer, [1, 2]);
        bus.read_register(0x00, &mut buffer).unwrap();
        assert_eq!(buffer, [3, 4]);
        assert!(bus.read_register(0x00, &mut buffer).is_err());
    }

    #[test]
    fn mock_gpio_pin_shares_its_level() {
        let pin = MockGpioPin::new();
        let mut output = pin.clone();
        let mut input = pin.clone();

        output.set_high().unwrap();
        assert!(input.is_high().unwrap());
        output.set_low().unwrap();
        assert!(!input.is_high().unwrap());
    }
}
