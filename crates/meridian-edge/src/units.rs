//! Unit-of-measurement taxonomy shared by drivers and the server metadata.
//!
//! Unit codes are grouped in blocks of one hundred; the block index is the
//! physical quantity, i.e. `quantity = code / 100`.

use serde::{Deserialize, Serialize};

/// The physical quantity a unit of measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum PhysicalQuantity {
    Identity,
    Temperature,
    Humidity,
    Illuminance,
    Ratio,
}

impl From<PhysicalQuantity> for i16 {
    fn from(quantity: PhysicalQuantity) -> i16 {
        match quantity {
            PhysicalQuantity::Identity => 0,
            PhysicalQuantity::Temperature => 1,
            PhysicalQuantity::Humidity => 2,
            PhysicalQuantity::Illuminance => 3,
            PhysicalQuantity::Ratio => 4,
        }
    }
}

impl TryFrom<i16> for PhysicalQuantity {
    type Error = String;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => PhysicalQuantity::Identity,
            1 => PhysicalQuantity::Temperature,
            2 => PhysicalQuantity::Humidity,
            3 => PhysicalQuantity::Illuminance,
            4 => PhysicalQuantity::Ratio,
            other => return Err(format!("unknown physical quantity code: {other}")),
        })
    }
}

/// The supported units of measurement.
///
/// Serialized as the numeric code (stored in the `device_signal` table and
/// carried in `device_config` payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum UnitOfMeasurement {
    UnitLess,
    Percentage,
    Celsius,
    Fahrenheit,
    HumidityPercentage,
    Lux,
}

impl UnitOfMeasurement {
    /// The numeric wire/storage code of this unit.
    pub fn code(self) -> i16 {
        match self {
            UnitOfMeasurement::UnitLess => 0,
            UnitOfMeasurement::Percentage => 100,
            UnitOfMeasurement::Celsius => 200,
            UnitOfMeasurement::Fahrenheit => 201,
            UnitOfMeasurement::HumidityPercentage => 300,
            UnitOfMeasurement::Lux => 400,
        }
    }

    /// The physical quantity encoded in the unit's hundreds block.
    pub fn physical_quantity(self) -> PhysicalQuantity {
        match self {
            UnitOfMeasurement::UnitLess => PhysicalQuantity::Identity,
            UnitOfMeasurement::Percentage => PhysicalQuantity::Ratio,
            UnitOfMeasurement::Celsius | UnitOfMeasurement::Fahrenheit => {
                PhysicalQuantity::Temperature
            }
            UnitOfMeasurement::HumidityPercentage => PhysicalQuantity::Humidity,
            UnitOfMeasurement::Lux => PhysicalQuantity::Illuminance,
        }
    }
}

impl From<UnitOfMeasurement> for i16 {
    fn from(unit: UnitOfMeasurement) -> i16 {
        unit.code()
    }
}

impl TryFrom<i16> for UnitOfMeasurement {
    type Error = String;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => UnitOfMeasurement::UnitLess,
            100 => UnitOfMeasurement::Percentage,
            200 => UnitOfMeasurement::Celsius,
            201 => UnitOfMeasurement::Fahrenheit,
            300 => UnitOfMeasurement::HumidityPercentage,
            400 => UnitOfMeasurement::Lux,
            other => return Err(format!("unknown unit of measurement code: {other}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_is_the_hundreds_block_of_the_code() {
        for unit in [
            UnitOfMeasurement::UnitLess,
            UnitOfMeasurement::Percentage,
            UnitOfMeasurement::Celsius,
            UnitOfMeasurement::Fahrenheit,
            UnitOfMeasurement::HumidityPercentage,
            UnitOfMeasurement::Lux,
        ] {
            let expected = PhysicalQuantity::try_from(unit.code() / 100).unwrap();
            assert_eq!(unit.physical_quantity(), expected);
        }
    }

    #[test]
    fn units_serialize_as_numeric_codes() {
        let json = serde_json::to_string(&UnitOfMeasurement::Celsius).unwrap();
        assert_eq!(json, "200");
        let unit: UnitOfMeasurement = serde_json::from_str("300").unwrap();
        assert_eq!(unit, UnitOfMeasurement::HumidityPercentage);
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert!(serde_json::from_str::<UnitOfMeasurement>("999").is_err());
    }
}
