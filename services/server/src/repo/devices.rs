//! Device rows: registration metadata and liveness.

use chrono::{DateTime, Duration, Utc};
use meridian_edge::DeviceId;
use serde::Serialize;
use sqlx::PgPool;

use crate::data::DataError;

/// A device is online when it has been seen within this window.
pub const DEVICE_ONLINE_THRESHOLD: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: DeviceId,
    pub display_name: String,
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.last_seen_at
            .is_some_and(|seen| Utc::now() - seen < DEVICE_ONLINE_THRESHOLD)
    }
}

/// Register a new device.
pub async fn create_device(
    pool: &PgPool,
    display_name: &str,
    description: Option<&str>,
) -> Result<Device, DataError> {
    let device = sqlx::query_as(
        "INSERT INTO device (display_name, description, registered_at)
         VALUES ($1, $2, now())
         RETURNING device_id, display_name, description, registered_at, last_seen_at",
    )
    .bind(display_name)
    .bind(description)
    .fetch_one(pool)
    .await?;
    Ok(device)
}

pub async fn get_device(pool: &PgPool, device_id: DeviceId) -> Result<Device, DataError> {
    sqlx::query_as(
        "SELECT device_id, display_name, description, registered_at, last_seen_at
         FROM device WHERE device_id = $1",
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DataError::NotFound(format!("no device registered with id {device_id}")))
}

pub async fn does_device_exist(pool: &PgPool, device_id: DeviceId) -> Result<bool, DataError> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT FROM device WHERE device_id = $1)")
            .bind(device_id)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

/// Fails with `NotFound` when the device is not registered.
pub async fn ensure_device_exists(pool: &PgPool, device_id: DeviceId) -> Result<(), DataError> {
    if does_device_exist(pool, device_id).await? {
        Ok(())
    } else {
        Err(DataError::NotFound(format!(
            "no device registered with id {device_id}"
        )))
    }
}

/// Bump the device's last-seen timestamp.
pub async fn set_device_seen(pool: &PgPool, device_id: DeviceId) -> Result<(), DataError> {
    sqlx::query("UPDATE device SET last_seen_at = now() WHERE device_id = $1")
        .bind(device_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_recently_seen_device_is_online() {
        let device = Device {
            device_id: uuid::Uuid::nil(),
            display_name: "greenhouse".to_owned(),
            description: None,
            registered_at: Utc::now() - Duration::days(1),
            last_seen_at: Some(Utc::now() - Duration::minutes(1)),
        };
        assert!(device.is_online());
    }

    #[test]
    fn a_stale_or_never_seen_device_is_offline() {
        let mut device = Device {
            device_id: uuid::Uuid::nil(),
            display_name: "greenhouse".to_owned(),
            description: None,
            registered_at: Utc::now() - Duration::days(1),
            last_seen_at: Some(Utc::now() - DEVICE_ONLINE_THRESHOLD - Duration::seconds(1)),
        };
        assert!(!device.is_online());

        device.last_seen_at = None;
        assert!(!device.is_online());
    }
}
