//! SI1145 visible/IR/UV light sensor.
//!
//! The sensor sits at the fixed I²C address 0x60 and, once configured for
//! autonomous measurements, exposes the latest readings in little-endian
//! data registers.
//!
//! Data sheet:
//! https://www.silabs.com/documents/public/data-sheets/Si1145-46-47.pdf

use std::collections::BTreeMap;

use meridian_edge::driver_config::{
    BusClaim, DriverDirection, DriverMetadata, DriverSignal, I2cAddress,
};
use meridian_edge::units::UnitOfMeasurement;
use serde::Deserialize;

use crate::driver::{
    AnalogInputDriver, BusProtocol, DeviceDriver, DriverCore, DriverError, require_direction,
};
use crate::hw::{self, I2cBus};
use crate::registry::{RegistryError, parse_config};

pub const MODULE: &str = "si1145";

fn default_protocol() -> BusProtocol {
    BusProtocol::I2c
}

fn default_direction() -> DriverDirection {
    DriverDirection::Input
}

fn default_address() -> I2cAddress {
    I2cAddress::new(Si1145::I2C_ADDRESS).expect("0x60 is a valid address")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Si1145Config {
    pub identifier: String,
    pub driver_module: String,
    #[serde(default = "default_protocol")]
    pub protocol: BusProtocol,
    #[serde(default = "default_direction")]
    pub direction: DriverDirection,
    #[serde(default = "default_address")]
    pub address: I2cAddress,
}

pub struct Si1145 {
    identifier: String,
    driver_module: String,
    bus: Option<Box<dyn I2cBus>>,
}

impl Si1145 {
    /// The sensor has a static I²C address.
    pub const I2C_ADDRESS: u8 = 0x60;

    const REG_INTCFG: u8 = 0x03;
    const REG_IRQEN: u8 = 0x04;
    const REG_IRQMODE1: u8 = 0x05;
    const REG_IRQMODE2: u8 = 0x06;
    const REG_HWKEY: u8 = 0x07;
    const REG_MEASRATE0: u8 = 0x08;
    const REG_MEASRATE1: u8 = 0x09;
    const REG_UCOEFF0: u8 = 0x13;
    const REG_UCOEFF1: u8 = 0x14;
    const REG_UCOEFF2: u8 = 0x15;
    const REG_UCOEFF3: u8 = 0x16;
    const REG_PARAMWR: u8 = 0x17;
    const REG_COMMAND: u8 = 0x18;
    const REG_IRQSTAT: u8 = 0x21;
    const REG_ALSVISDATA0: u8 = 0x22;
    const REG_ALSIRDATA0: u8 = 0x24;
    const REG_UVINDEX0: u8 = 0x2C;

    const CMD_RESET: u8 = 0x01;
    const CMD_PSALS_AUTO: u8 = 0x0F;
    const PARAM_SET: u8 = 0xA0;

    const PARAM_CHLIST: u8 = 0x01;
    const CHLIST_ENUV: u8 = 0x80;
    const CHLIST_ENALSIR: u8 = 0x20;
    const CHLIST_ENALSVIS: u8 = 0x10;

    /// Raw counts the channels report in complete darkness.
    const DARK_OFFSET_VIS: u16 = 259;
    const DARK_OFFSET_IR: u16 = 253;

    pub fn new(config: Si1145Config, driver_module: &str) -> Result<Self, DriverError> {
        if config.protocol != BusProtocol::I2c {
            return Err(DriverError::InvalidConfig {
                identifier: config.identifier,
                reason: "si1145 is an i2c driver".to_owned(),
            });
        }
        require_direction(&config.identifier, config.direction, DriverDirection::Input)?;
        if config.address.get() != Self::I2C_ADDRESS {
            return Err(DriverError::InvalidConfig {
                identifier: config.identifier,
                reason: format!(
                    "the SI1145 address is fixed at 0x60, got {}",
                    config.address
                ),
            });
        }

        Ok(Si1145 {
            identifier: config.identifier,
            driver_module: driver_module.to_owned(),
            bus: None,
        })
    }

    fn write_param(bus: &mut dyn I2cBus, parameter: u8, value: u8) -> Result<(), DriverError> {
        bus.write_register(Self::REG_PARAMWR, value)?;
        bus.write_register(Self::REG_COMMAND, parameter | Self::PARAM_SET)?;
        Ok(())
    }

    fn reset(bus: &mut dyn I2cBus) -> Result<(), DriverError> {
        bus.write_register(Self::REG_MEASRATE0, 0x00)?;
        bus.write_register(Self::REG_MEASRATE1, 0x00)?;
        bus.write_register(Self::REG_IRQEN, 0x00)?;
        bus.write_register(Self::REG_IRQMODE1, 0x00)?;
        bus.write_register(Self::REG_IRQMODE2, 0x00)?;
        bus.write_register(Self::REG_INTCFG, 0x00)?;
        bus.write_register(Self::REG_IRQSTAT, 0xFF)?;

        bus.write_register(Self::REG_COMMAND, Self::CMD_RESET)?;
        std::thread::sleep(std::time::Duration::from_millis(10));
        // The hardware key must be written after a reset.
        bus.write_register(Self::REG_HWKEY, 0x17)?;
        std::thread::sleep(std::time::Duration::from_millis(10));
        Ok(())
    }

    fn load_calibration(bus: &mut dyn I2cBus) -> Result<(), DriverError> {
        // UV index measurement coefficients.
        bus.write_register(Self::REG_UCOEFF0, 0x29)?;
        bus.write_register(Self::REG_UCOEFF1, 0x89)?;
        bus.write_register(Self::REG_UCOEFF2, 0x02)?;
        bus.write_register(Self::REG_UCOEFF3, 0x00)?;

        Self::write_param(
            bus,
            Self::PARAM_CHLIST,
            Self::CHLIST_ENUV | Self::CHLIST_ENALSIR | Self::CHLIST_ENALSVIS,
        )?;

        // 255 * 31.25 µs measurement rate, autonomous mode.
        bus.write_register(Self::REG_MEASRATE0, 0xFF)?;
        bus.write_register(Self::REG_COMMAND, Self::CMD_PSALS_AUTO)?;
        Ok(())
    }

    fn read_u16(bus: &mut dyn I2cBus, register: u8) -> Result<u16, DriverError> {
        let mut data = [0u8; 2];
        bus.read_register(register, &mut data)?;
        Ok(u16::from_le_bytes(data))
    }

    /// Dark-offset and calibrate a raw ALS count into lux.
    fn raw_to_lux(raw: u16, dark_offset: u16, calibration_factor: f64) -> f64 {
        let corrected = raw.saturating_sub(dark_offset);
        // 2.44 raw counts per lux at gain 1.
        f64::from(corrected) / 2.44 * calibration_factor
    }
}

impl DriverCore for Si1145 {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            identifier: self.identifier.clone(),
            driver_module: self.driver_module.clone(),
            direction: DriverDirection::Input,
            signals: vec![
                DriverSignal {
                    signal_identifier: "visual-light-raw".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::UnitLess,
                },
                DriverSignal {
                    signal_identifier: "visual-light".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::Lux,
                },
                DriverSignal {
                    signal_identifier: "infrared-light-raw".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::UnitLess,
                },
                DriverSignal {
                    signal_identifier: "infrared-light".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::Lux,
                },
                DriverSignal {
                    signal_identifier: "uv-index".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::UnitLess,
                },
            ],
        }
    }

    fn setup(&mut self) -> Result<(), DriverError> {
        let mut bus = hw::open_i2c(Self::I2C_ADDRESS);
        Self::reset(bus.as_mut())?;
        Self::load_calibration(bus.as_mut())?;
        self.bus = Some(bus);
        Ok(())
    }

    fn bus_claim(&self) -> Option<BusClaim> {
        Some(BusClaim::I2c(default_address()))
    }
}

impl AnalogInputDriver for Si1145 {
    fn read(&mut self) -> Result<BTreeMap<String, f64>, DriverError> {
        let bus = self.bus.as_mut().ok_or(DriverError::NotSetUp)?;

        let visible_raw = Self::read_u16(bus.as_mut(), Self::REG_ALSVISDATA0)?;
        let infrared_raw = Self::read_u16(bus.as_mut(), Self::REG_ALSIRDATA0)?;
        // The register holds UV index * 100, plus a /10 sunlight calibration.
        let uv_raw = Self::read_u16(bus.as_mut(), Self::REG_UVINDEX0)?;

        Ok(BTreeMap::from([
            ("visual-light-raw".to_owned(), f64::from(visible_raw)),
            (
                "visual-light".to_owned(),
                Self::raw_to_lux(visible_raw, Self::DARK_OFFSET_VIS, 100.0),
            ),
            ("infrared-light-raw".to_owned(), f64::from(infrared_raw)),
            (
                "infrared-light".to_owned(),
                Self::raw_to_lux(infrared_raw, Self::DARK_OFFSET_IR, 50.0),
            ),
            ("uv-index".to_owned(), f64::from(uv_raw) / 1000.0),
        ]))
    }
}

/// Registry constructor.
pub fn build(driver_module: &str, raw: &serde_yaml::Value) -> Result<DeviceDriver, RegistryError> {
    let config: Si1145Config = parse_config(raw)?;
    Ok(DeviceDriver::AnalogInput(Box::new(Si1145::new(
        config,
        driver_module,
    )?)))
}
