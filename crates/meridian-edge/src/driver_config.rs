//! Driver configuration primitives shared by the device and the server.
//!
//! The concrete drivers live on the device; the server only ever sees the
//! [`DriverMetadata`] carried in `device_config` messages. The validated
//! pin/address newtypes and the address-space check live here so that every
//! driver config model reuses the same rules.

use serde::{Deserialize, Serialize};

use crate::units::UnitOfMeasurement;

/// Maximum length of driver and signal identifiers.
pub const DRIVER_IDENTIFIER_LENGTH: usize = 64;

/// GPIO pins reserved for the I²C bus.
pub const I2C_PINS: [u8; 2] = [2, 3];

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Signal direction of a driver, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverDirection {
    Input,
    Output,
    Bidirectional,
}

impl DriverDirection {
    pub fn is_input(self) -> bool {
        matches!(self, DriverDirection::Input | DriverDirection::Bidirectional)
    }

    pub fn is_output(self) -> bool {
        matches!(self, DriverDirection::Output | DriverDirection::Bidirectional)
    }
}

impl std::fmt::Display for DriverDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DriverDirection::Input => "input",
            DriverDirection::Output => "output",
            DriverDirection::Bidirectional => "bidirectional",
        })
    }
}

// ---------------------------------------------------------------------------
// Validated bus primitives
// ---------------------------------------------------------------------------

/// Errors produced while validating driver configuration.
#[derive(Debug, thiserror::Error)]
pub enum DriverConfigError {
    #[error("GPIO pin {0} is outside the usable range 2..=27")]
    InvalidGpioPin(u8),
    #[error("I2C address {0:#04x} is outside the valid range 0x03..=0x77")]
    InvalidI2cAddress(u8),
    #[error("driver identifier '{0}' is configured more than once")]
    DuplicateIdentifier(String),
    #[error("GPIO pin {0} is configured more than once")]
    DuplicateGpioPin(u8),
    #[error("GPIO pins 2 and 3 are reserved for I2C when an I2C driver is configured")]
    GpioPinReservedForI2c,
    #[error("I2C address {0} is configured more than once")]
    DuplicateI2cAddress(I2cAddress),
}

/// A GPIO pin number, restricted to the usable header pins 2..=27.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct GpioPin(u8);

impl GpioPin {
    pub fn new(pin: u8) -> Result<Self, DriverConfigError> {
        if (2..=27).contains(&pin) {
            Ok(GpioPin(pin))
        } else {
            Err(DriverConfigError::InvalidGpioPin(pin))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl<'de> Deserialize<'de> for GpioPin {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let pin = u8::deserialize(deserializer)?;
        GpioPin::new(pin).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for GpioPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 7-bit I²C address in the conventional usable range 0x03..=0x77.
///
/// Deserializes from an integer or a hex string with or without the `0x`
/// prefix, the way addresses are written in datasheets and config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct I2cAddress(u8);

impl I2cAddress {
    pub fn new(address: u8) -> Result<Self, DriverConfigError> {
        if (0x03..=0x77).contains(&address) {
            Ok(I2cAddress(address))
        } else {
            Err(DriverConfigError::InvalidI2cAddress(address))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl From<I2cAddress> for String {
    fn from(address: I2cAddress) -> String {
        format!("{address}")
    }
}

impl std::fmt::Display for I2cAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl<'de> Deserialize<'de> for I2cAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u8),
            Text(String),
        }

        let raw = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n,
            Raw::Text(text) => {
                let digits = text.strip_prefix("0x").unwrap_or(&text);
                u8::from_str_radix(digits, 16).map_err(|_| {
                    serde::de::Error::custom(format!(
                        "I2C address '{text}' is not a valid hexadecimal value"
                    ))
                })?
            }
        };
        I2cAddress::new(raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Signals and metadata
// ---------------------------------------------------------------------------

/// One signal a driver produces or consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSignal {
    /// Unique identifier of the signal within its driver.
    pub signal_identifier: String,
    pub unit_of_measurement: UnitOfMeasurement,
}

/// The metadata a device announces for one of its drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverMetadata {
    /// Unique identifier of the driver within its device.
    pub identifier: String,
    /// Module name the driver was built from.
    pub driver_module: String,
    pub direction: DriverDirection,
    pub signals: Vec<DriverSignal>,
}

// ---------------------------------------------------------------------------
// Address-space validation
// ---------------------------------------------------------------------------

/// The bus resource a configured driver occupies, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusClaim {
    Gpio(GpioPin),
    I2c(I2cAddress),
}

/// Ensures the configured identifiers, pins and addresses of a device are
/// unique and do not collide with the I²C bus pins.
///
/// Violations are configuration errors and must fail startup.
pub fn validate_device_address_space<'a, I>(drivers: I) -> Result<(), DriverConfigError>
where
    I: IntoIterator<Item = (&'a str, Option<BusClaim>)>,
{
    let mut identifiers = std::collections::HashSet::new();
    let mut gpio_pins: Vec<GpioPin> = Vec::new();
    let mut i2c_addresses: Vec<I2cAddress> = Vec::new();

    for (identifier, claim) in drivers {
        if !identifiers.insert(identifier.to_owned()) {
            return Err(DriverConfigError::DuplicateIdentifier(identifier.to_owned()));
        }
        match claim {
            Some(BusClaim::Gpio(pin)) => {
                if gpio_pins.contains(&pin) {
                    return Err(DriverConfigError::DuplicateGpioPin(pin.get()));
                }
                gpio_pins.push(pin);
            }
            Some(BusClaim::I2c(address)) => {
                if i2c_addresses.contains(&address) {
                    return Err(DriverConfigError::DuplicateI2cAddress(address));
                }
                i2c_addresses.push(address);
            }
            None => {}
        }
    }

    if !i2c_addresses.is_empty() && gpio_pins.iter().any(|pin| I2C_PINS.contains(&pin.get())) {
        return Err(DriverConfigError::GpioPinReservedForI2c);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(n: u8) -> GpioPin {
        GpioPin::new(n).unwrap()
    }

    fn addr(n: u8) -> I2cAddress {
        I2cAddress::new(n).unwrap()
    }

    #[test]
    fn gpio_pin_range_is_enforced() {
        assert!(GpioPin::new(2).is_ok());
        assert!(GpioPin::new(27).is_ok());
        assert!(GpioPin::new(1).is_err());
        assert!(GpioPin::new(28).is_err());
    }

    #[test]
    fn i2c_address_parses_hex_strings_and_integers() {
        let parsed: I2cAddress = serde_json::from_str(r#""0x44""#).unwrap();
        assert_eq!(parsed.get(), 0x44);
        let parsed: I2cAddress = serde_json::from_str(r#""45""#).unwrap();
        assert_eq!(parsed.get(), 0x45);
        let parsed: I2cAddress = serde_json::from_str("104").unwrap();
        assert_eq!(parsed.get(), 0x68);
        assert!(serde_json::from_str::<I2cAddress>(r#""0x02""#).is_err());
        assert!(serde_json::from_str::<I2cAddress>(r#""0x78""#).is_err());
        assert!(serde_json::from_str::<I2cAddress>(r#""zz""#).is_err());
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let result = validate_device_address_space([
            ("relay-a", Some(BusClaim::Gpio(pin(17)))),
            ("relay-a", Some(BusClaim::Gpio(pin(18)))),
        ]);
        assert!(matches!(result, Err(DriverConfigError::DuplicateIdentifier(id)) if id == "relay-a"));
    }

    #[test]
    fn duplicate_gpio_pins_are_rejected() {
        let result = validate_device_address_space([
            ("relay-a", Some(BusClaim::Gpio(pin(17)))),
            ("relay-b", Some(BusClaim::Gpio(pin(17)))),
        ]);
        assert!(matches!(result, Err(DriverConfigError::DuplicateGpioPin(17))));
    }

    #[test]
    fn i2c_reserves_pins_two_and_three() {
        let result = validate_device_address_space([
            ("climate", Some(BusClaim::I2c(addr(0x44)))),
            ("relay-a", Some(BusClaim::Gpio(pin(2)))),
        ]);
        assert!(matches!(result, Err(DriverConfigError::GpioPinReservedForI2c)));

        // Without an I2C driver the pins are free to use.
        assert!(
            validate_device_address_space([("relay-a", Some(BusClaim::Gpio(pin(2))))]).is_ok()
        );
    }

    #[test]
    fn duplicate_i2c_addresses_are_rejected() {
        let result = validate_device_address_space([
            ("climate-a", Some(BusClaim::I2c(addr(0x44)))),
            ("climate-b", Some(BusClaim::I2c(addr(0x44)))),
        ]);
        assert!(matches!(result, Err(DriverConfigError::DuplicateI2cAddress(_))));
    }

    #[test]
    fn mixed_valid_setup_passes() {
        assert!(
            validate_device_address_space([
                ("climate", Some(BusClaim::I2c(addr(0x44)))),
                ("light", Some(BusClaim::I2c(addr(0x60)))),
                ("relay-a", Some(BusClaim::Gpio(pin(17)))),
                ("door", Some(BusClaim::Gpio(pin(27)))),
                ("host", None),
            ])
            .is_ok()
        );
    }
}
