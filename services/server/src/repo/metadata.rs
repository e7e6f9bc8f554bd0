//! Driver and signal metadata: the server-side mirror of what each device
//! announces in its `device_config` message.
//!
//! Creating a signal row assigns the surrogate `timeseries_id` the device
//! learns through the config response.

use std::collections::BTreeMap;

use meridian_edge::DeviceId;
use meridian_edge::driver_config::DriverMetadata;
use sqlx::PgPool;

use crate::data::DataError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceDriverRow {
    pub device_id: DeviceId,
    pub driver_identifier: String,
    pub direction: String,
    pub driver_module: String,
    pub display_name: String,
    pub is_visible_on_dashboard: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceSignalRow {
    pub timeseries_id: i64,
    pub driver_identifier: String,
    pub signal_identifier: String,
    pub unit_of_measurement: i16,
}

pub async fn get_device_drivers(
    pool: &PgPool,
    device_id: DeviceId,
) -> Result<Vec<DeviceDriverRow>, DataError> {
    let drivers = sqlx::query_as(
        "SELECT device_id, driver_identifier, direction, driver_module, display_name,
                is_visible_on_dashboard
         FROM device_driver WHERE device_id = $1
         ORDER BY driver_identifier",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;
    Ok(drivers)
}

pub async fn get_device_signals(
    pool: &PgPool,
    device_id: DeviceId,
    driver_identifier: &str,
) -> Result<Vec<DeviceSignalRow>, DataError> {
    let signals = sqlx::query_as(
        "SELECT timeseries_id, driver_identifier, signal_identifier, unit_of_measurement
         FROM device_signal WHERE device_id = $1 AND driver_identifier = $2
         ORDER BY signal_identifier",
    )
    .bind(device_id)
    .bind(driver_identifier)
    .fetch_all(pool)
    .await?;
    Ok(signals)
}

/// Insert any drivers and signals of the announced inventory that the
/// server does not know yet. Existing rows are left untouched so operator
/// edits (display names, dashboard flags) survive reconnects.
pub async fn upsert_driver_metadata(
    pool: &PgPool,
    device_id: DeviceId,
    drivers: &[DriverMetadata],
) -> Result<(), DataError> {
    for driver in drivers {
        sqlx::query(
            "INSERT INTO device_driver
                 (device_id, driver_identifier, direction, driver_module, display_name)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (device_id, driver_identifier) DO NOTHING",
        )
        .bind(device_id)
        .bind(&driver.identifier)
        .bind(driver.direction.to_string())
        .bind(&driver.driver_module)
        .bind(&driver.identifier)
        .execute(pool)
        .await?;

        for signal in &driver.signals {
            sqlx::query(
                "INSERT INTO device_signal
                     (device_id, driver_identifier, signal_identifier, display_name,
                      unit_of_measurement)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (device_id, driver_identifier, signal_identifier) DO NOTHING",
            )
            .bind(device_id)
            .bind(&driver.identifier)
            .bind(&signal.signal_identifier)
            .bind(&signal.signal_identifier)
            .bind(signal.unit_of_measurement.code())
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

/// The full driver → signal → timeseries id index of one device.
pub async fn build_timeseries_index(
    pool: &PgPool,
    device_id: DeviceId,
) -> Result<BTreeMap<String, BTreeMap<String, i64>>, DataError> {
    let signals: Vec<DeviceSignalRow> = sqlx::query_as(
        "SELECT timeseries_id, driver_identifier, signal_identifier, unit_of_measurement
         FROM device_signal WHERE device_id = $1
         ORDER BY driver_identifier, signal_identifier",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;

    let mut index: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    for signal in signals {
        index
            .entry(signal.driver_identifier)
            .or_default()
            .insert(signal.signal_identifier, signal.timeseries_id);
    }
    Ok(index)
}
