//! Durable SQLite buffer for samples awaiting delivery.
//!
//! # Schema
//! - `timeseries_index`: driver+signal → local timeseries id, optionally
//!   mapped to the id the server assigned for the same signal.
//! - `timeseries_data`: one row per sample, keyed by (local id, unix
//!   timestamp); `staging_id`/`staged_at_utc` tag rows that are part of an
//!   in-flight batch.
//! - `api_token`: single-row cache of the bearer token used against the
//!   server's HTTP API.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.
//! PRAGMA integrity_check runs at open; returns an error if it fails.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use meridian_edge::messages::{DeviceDataPayload, DriverTimeseries, STAGING_ID_LEN};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::debug;

/// Staged rows older than this become eligible for staging again. This is
/// what turns a lost ack into a redelivery instead of a data loss.
pub const STAGING_TIMEOUT: Duration = Duration::minutes(30);

/// SQLite caps a statement at 999 bound variables; the staging update
/// spends two of them on the staging id and the staged-at timestamp.
pub const MAX_STAGE_VALUES: usize = 999 - 2;

/// Error type for blackbox operations.
#[derive(Debug, thiserror::Error)]
pub enum BlackboxError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("timeseries index entry {0} not found")]
    NotFound(i64),
    #[error("stage batch of {0} exceeds the {MAX_STAGE_VALUES} bound-variable cap")]
    BatchTooLarge(usize),
}

/// One row of the `timeseries_index` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeseriesIndexEntry {
    pub timeseries_id: i64,
    pub driver_identifier: String,
    pub driver_signal: String,
    pub server_timeseries_id: Option<i64>,
}

/// The bearer token the device presents to the server's HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiToken {
    pub token: String,
    pub valid_until_utc: DateTime<Utc>,
}

impl ApiToken {
    /// A token is only used while it has more than 30 seconds of life
    /// left, so a request never races its own expiry.
    pub fn is_valid(&self) -> bool {
        self.valid_until_utc > Utc::now() + Duration::seconds(30)
    }
}

/// Generate a fresh opaque staging id.
fn generate_staging_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STAGING_ID_LEN)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Blackbox
// ---------------------------------------------------------------------------

/// The device-local sample buffer.
pub struct Blackbox {
    conn: Connection,
    /// driver identifier → signal identifier → local timeseries id.
    /// Local ids never change once created, so the cache never needs
    /// invalidation.
    index_cache: HashMap<String, HashMap<String, i64>>,
}

impl Blackbox {
    /// Open (or create) the buffer at the given path.
    pub fn open(path: &Path) -> Result<Self, BlackboxError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Blackbox {
            conn,
            index_cache: HashMap::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Insert one reading: one sample per signal under the given timestamp.
    ///
    /// Index entries are created lazily with an unset server id; the server
    /// id arrives later through the config response.
    pub fn record(
        &mut self,
        driver_identifier: &str,
        timestamp: DateTime<Utc>,
        values: &BTreeMap<String, f64>,
    ) -> Result<(), BlackboxError> {
        let mut index = match self.index_cache.get(driver_identifier) {
            Some(cached) => cached.clone(),
            None => load_driver_index(&self.conn, driver_identifier)?,
        };

        let tx = self.conn.transaction()?;
        let timestamp_utc = timestamp.timestamp();
        for (signal, value) in values {
            let timeseries_id = match index.get(signal) {
                Some(&id) => id,
                None => {
                    tx.execute(
                        "INSERT INTO timeseries_index (driver_identifier, driver_signal)
                         VALUES (?1, ?2)",
                        params![driver_identifier, signal],
                    )?;
                    let id = tx.last_insert_rowid();
                    index.insert(signal.clone(), id);
                    id
                }
            };
            tx.execute(
                "INSERT INTO timeseries_data (timeseries_id, timestamp_utc, value)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (timeseries_id, timestamp_utc)
                 DO UPDATE SET value = excluded.value",
                params![timeseries_id, timestamp_utc, value],
            )?;
        }
        tx.commit()?;

        self.index_cache
            .insert(driver_identifier.to_owned(), index);
        debug!(driver = driver_identifier, "recorded reading");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Staging
    // -----------------------------------------------------------------------

    /// Tag up to `max_values` eligible samples with a fresh staging id and
    /// return them as one batch, grouped by server timeseries id.
    ///
    /// Eligible: the index entry has a server id, and the row is either
    /// unstaged or its staging is older than [`STAGING_TIMEOUT`]. Newest
    /// samples stage first. Returns `None` when nothing is eligible.
    pub fn stage(&mut self, max_values: usize) -> Result<Option<DeviceDataPayload>, BlackboxError> {
        if max_values > MAX_STAGE_VALUES {
            return Err(BlackboxError::BatchTooLarge(max_values));
        }

        let staging_id = generate_staging_id();
        let staged_at = Utc::now();
        let stale_before = (staged_at - STAGING_TIMEOUT).timestamp();

        let tx = self.conn.transaction()?;

        let rowids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT d.rowid
                 FROM timeseries_data d
                 JOIN timeseries_index i ON i.timeseries_id = d.timeseries_id
                 WHERE i.server_timeseries_id IS NOT NULL
                   AND (d.staging_id IS NULL OR d.staged_at_utc < ?1)
                 ORDER BY d.timestamp_utc DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![stale_before, max_values as i64], |row| {
                row.get::<_, i64>(0)
            })?;
            rows.collect::<Result<_, _>>()?
        };

        if rowids.is_empty() {
            return Ok(None);
        }

        let placeholders: Vec<String> = (0..rowids.len())
            .map(|offset| format!("?{}", offset + 3))
            .collect();
        let update_sql = format!(
            "UPDATE timeseries_data SET staging_id = ?1, staged_at_utc = ?2
             WHERE rowid IN ({})",
            placeholders.join(", ")
        );
        let mut bind: Vec<rusqlite::types::Value> = Vec::with_capacity(rowids.len() + 2);
        bind.push(staging_id.clone().into());
        bind.push(staged_at.timestamp().into());
        bind.extend(rowids.iter().map(|&rowid| rusqlite::types::Value::from(rowid)));
        tx.execute(&update_sql, params_from_iter(bind))?;

        let mut data: BTreeMap<i64, DriverTimeseries> = BTreeMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT i.server_timeseries_id, d.timestamp_utc, d.value
                 FROM timeseries_data d
                 JOIN timeseries_index i ON i.timeseries_id = d.timeseries_id
                 WHERE d.staging_id = ?1
                 ORDER BY i.server_timeseries_id ASC, d.timestamp_utc ASC",
            )?;
            let rows = stmt.query_map(params![staging_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?;
            for row in rows {
                let (server_id, timestamp_utc, value) = row?;
                let series = data.entry(server_id).or_default();
                series.timestamps_utc.push(timestamp_utc);
                series.values.push(value);
            }
        }

        tx.commit()?;
        debug!(staging_id = %staging_id, rows = rowids.len(), "staged batch");

        Ok(Some(DeviceDataPayload { staging_id, data }))
    }

    /// Delete every row tagged with the given staging id.
    ///
    /// Confirming an unknown id is a no-op, which makes replayed acks
    /// harmless.
    pub fn confirm(&mut self, staging_id: &str) -> Result<(), BlackboxError> {
        let deleted = self.conn.execute(
            "DELETE FROM timeseries_data WHERE staging_id = ?1",
            params![staging_id],
        )?;
        debug!(staging_id, deleted, "confirmed batch");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Index management
    // -----------------------------------------------------------------------

    /// All index entries, optionally filtered by driver and/or signal.
    pub fn find_index(
        &self,
        driver_identifier: Option<&str>,
        driver_signal: Option<&str>,
    ) -> Result<Vec<TimeseriesIndexEntry>, BlackboxError> {
        let mut sql = String::from(
            "SELECT timeseries_id, driver_identifier, driver_signal, server_timeseries_id
             FROM timeseries_index",
        );
        let mut bind: Vec<rusqlite::types::Value> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();
        if let Some(driver) = driver_identifier {
            bind.push(driver.to_owned().into());
            clauses.push(format!("driver_identifier = ?{}", bind.len()));
        }
        if let Some(signal) = driver_signal {
            bind.push(signal.to_owned().into());
            clauses.push(format!("driver_signal = ?{}", bind.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timeseries_id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), map_index_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Find or lazily create the index entry for a driver signal.
    pub fn ensure_index(
        &mut self,
        driver_identifier: &str,
        driver_signal: &str,
    ) -> Result<TimeseriesIndexEntry, BlackboxError> {
        if let Some(entry) = self
            .find_index(Some(driver_identifier), Some(driver_signal))?
            .into_iter()
            .next()
        {
            return Ok(entry);
        }
        self.conn.execute(
            "INSERT INTO timeseries_index (driver_identifier, driver_signal) VALUES (?1, ?2)",
            params![driver_identifier, driver_signal],
        )?;
        let timeseries_id = self.conn.last_insert_rowid();
        self.index_cache
            .entry(driver_identifier.to_owned())
            .or_default()
            .insert(driver_signal.to_owned(), timeseries_id);
        self.get_index(timeseries_id)
    }

    /// One index entry by local id; fails with `NotFound` for unknown ids.
    pub fn get_index(&self, timeseries_id: i64) -> Result<TimeseriesIndexEntry, BlackboxError> {
        self.conn
            .query_row(
                "SELECT timeseries_id, driver_identifier, driver_signal, server_timeseries_id
                 FROM timeseries_index WHERE timeseries_id = ?1",
                params![timeseries_id],
                map_index_entry,
            )
            .optional()?
            .ok_or(BlackboxError::NotFound(timeseries_id))
    }

    /// Set (or clear) the server-side id of one index entry.
    pub fn update_index(
        &mut self,
        timeseries_id: i64,
        server_timeseries_id: Option<i64>,
    ) -> Result<TimeseriesIndexEntry, BlackboxError> {
        let updated = self.conn.execute(
            "UPDATE timeseries_index SET server_timeseries_id = ?2 WHERE timeseries_id = ?1",
            params![timeseries_id, server_timeseries_id],
        )?;
        if updated == 0 {
            return Err(BlackboxError::NotFound(timeseries_id));
        }
        self.get_index(timeseries_id)
    }

    /// Remove one index entry.
    pub fn delete_index(&mut self, timeseries_id: i64) -> Result<(), BlackboxError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM timeseries_data WHERE timeseries_id = ?1",
            params![timeseries_id],
        )?;
        tx.execute(
            "DELETE FROM timeseries_index WHERE timeseries_id = ?1",
            params![timeseries_id],
        )?;
        tx.commit()?;
        self.index_cache.clear();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // API token
    // -----------------------------------------------------------------------

    /// The stored API token, if any.
    pub fn read_api_token(&self) -> Result<Option<ApiToken>, BlackboxError> {
        let token = self
            .conn
            .query_row(
                "SELECT token, valid_until_utc FROM api_token LIMIT 1",
                [],
                |row| {
                    Ok(ApiToken {
                        token: row.get(0)?,
                        valid_until_utc: timestamp_to_datetime(row.get(1)?),
                    })
                },
            )
            .optional()?;
        Ok(token)
    }

    /// Replace the stored API token.
    pub fn write_api_token(&mut self, token: &ApiToken) -> Result<(), BlackboxError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM api_token", [])?;
        tx.execute(
            "INSERT INTO api_token (token, valid_until_utc) VALUES (?1, ?2)",
            params![token.token, token.valid_until_utc.timestamp()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Number of buffered samples; used by tests and diagnostics.
    pub fn sample_count(&self) -> Result<i64, BlackboxError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM timeseries_data", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), BlackboxError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), BlackboxError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(BlackboxError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn load_driver_index(
    conn: &Connection,
    driver_identifier: &str,
) -> Result<HashMap<String, i64>, BlackboxError> {
    let mut stmt = conn.prepare(
        "SELECT driver_signal, timeseries_id FROM timeseries_index
         WHERE driver_identifier = ?1",
    )?;
    let rows = stmt.query_map(params![driver_identifier], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut index = HashMap::new();
    for row in rows {
        let (signal, id) = row?;
        index.insert(signal, id);
    }
    Ok(index)
}

fn map_index_entry(row: &rusqlite::Row<'_>) -> Result<TimeseriesIndexEntry, rusqlite::Error> {
    Ok(TimeseriesIndexEntry {
        timeseries_id: row.get(0)?,
        driver_identifier: row.get(1)?,
        driver_signal: row.get(2)?,
        server_timeseries_id: row.get(3)?,
    })
}

fn timestamp_to_datetime(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn make_blackbox() -> (Blackbox, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp file");
        let blackbox = Blackbox::open(file.path()).expect("open blackbox");
        (blackbox, file)
    }

    fn ts(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn reading(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries
            .iter()
            .map(|(signal, value)| ((*signal).to_owned(), *value))
            .collect()
    }

    #[test]
    fn record_creates_index_entries_lazily() {
        let (mut blackbox, _file) = make_blackbox();

        blackbox
            .record("climate", ts(1_705_320_000), &reading(&[("temperature", 21.5)]))
            .unwrap();

        let entries = blackbox.find_index(Some("climate"), None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].driver_signal, "temperature");
        assert_eq!(entries[0].server_timeseries_id, None);
        assert_eq!(blackbox.sample_count().unwrap(), 1);
    }

    #[test]
    fn stage_skips_samples_without_a_server_id() {
        let (mut blackbox, _file) = make_blackbox();
        blackbox
            .record("climate", ts(1_705_320_000), &reading(&[("temperature", 21.5)]))
            .unwrap();

        assert!(blackbox.stage(250).unwrap().is_none());
    }

    #[test]
    fn config_reconciliation_makes_samples_eligible() {
        let (mut blackbox, _file) = make_blackbox();
        for (offset, value) in [(0, 21.5), (30, 21.6), (60, 21.7)] {
            blackbox
                .record(
                    "climate",
                    ts(1_705_320_000 + offset),
                    &reading(&[("temperature", value)]),
                )
                .unwrap();
        }
        let local_id = blackbox.find_index(Some("climate"), None).unwrap()[0].timeseries_id;

        blackbox.update_index(local_id, Some(42)).unwrap();

        let batch = blackbox.stage(250).unwrap().expect("eligible batch");
        let series = &batch.data[&42];
        assert_eq!(series.timestamps_utc.len(), series.values.len());
        assert_eq!(
            series.timestamps_utc,
            vec![1_705_320_000, 1_705_320_030, 1_705_320_060]
        );
        assert_eq!(series.values, vec![21.5, 21.6, 21.7]);
    }

    #[test]
    fn newest_samples_stage_first_and_the_batch_is_bounded() {
        let (mut blackbox, _file) = make_blackbox();
        for offset in 0..5 {
            blackbox
                .record(
                    "climate",
                    ts(1_705_320_000 + offset * 30),
                    &reading(&[("temperature", offset as f64)]),
                )
                .unwrap();
        }
        let local_id = blackbox.find_index(None, None).unwrap()[0].timeseries_id;
        blackbox.update_index(local_id, Some(42)).unwrap();

        let batch = blackbox.stage(2).unwrap().expect("batch");
        // The two newest samples, returned in ascending timestamp order.
        assert_eq!(
            batch.data[&42].timestamps_utc,
            vec![1_705_320_090, 1_705_320_120]
        );
    }

    #[test]
    fn staged_rows_are_not_restaged_until_stale() {
        let (mut blackbox, _file) = make_blackbox();
        blackbox
            .record("climate", ts(1_705_320_000), &reading(&[("temperature", 21.5)]))
            .unwrap();
        let local_id = blackbox.find_index(None, None).unwrap()[0].timeseries_id;
        blackbox.update_index(local_id, Some(42)).unwrap();

        let first = blackbox.stage(250).unwrap().expect("first batch");
        assert!(blackbox.stage(250).unwrap().is_none());

        // Backdate the staging beyond the staleness window.
        let stale = (Utc::now() - STAGING_TIMEOUT - Duration::minutes(1)).timestamp();
        blackbox
            .conn
            .execute("UPDATE timeseries_data SET staged_at_utc = ?1", params![stale])
            .unwrap();

        let second = blackbox.stage(250).unwrap().expect("restaged batch");
        assert_ne!(first.staging_id, second.staging_id);
        assert_eq!(second.data[&42].values, vec![21.5]);
    }

    #[test]
    fn confirm_deletes_exactly_the_batch() {
        let (mut blackbox, _file) = make_blackbox();
        for offset in 0..3 {
            blackbox
                .record(
                    "climate",
                    ts(1_705_320_000 + offset * 30),
                    &reading(&[("temperature", 21.5)]),
                )
                .unwrap();
        }
        let local_id = blackbox.find_index(None, None).unwrap()[0].timeseries_id;
        blackbox.update_index(local_id, Some(42)).unwrap();

        let batch = blackbox.stage(2).unwrap().expect("batch");
        blackbox.confirm(&batch.staging_id).unwrap();
        assert_eq!(blackbox.sample_count().unwrap(), 1);

        // Confirming an unknown staging id is a no-op.
        blackbox.confirm("zzzzzz").unwrap();
        assert_eq!(blackbox.sample_count().unwrap(), 1);
    }

    #[test]
    fn stage_rejects_batches_beyond_the_parameter_cap() {
        let (mut blackbox, _file) = make_blackbox();
        assert!(matches!(
            blackbox.stage(MAX_STAGE_VALUES + 1),
            Err(BlackboxError::BatchTooLarge(_))
        ));
    }

    #[test]
    fn recording_the_same_timestamp_replaces_the_value() {
        let (mut blackbox, _file) = make_blackbox();
        blackbox
            .record("climate", ts(1_705_320_000), &reading(&[("temperature", 21.5)]))
            .unwrap();
        blackbox
            .record("climate", ts(1_705_320_000), &reading(&[("temperature", 22.0)]))
            .unwrap();

        assert_eq!(blackbox.sample_count().unwrap(), 1);
    }

    #[test]
    fn samples_survive_a_reopen() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut blackbox = Blackbox::open(file.path()).unwrap();
            blackbox
                .record("climate", ts(1_705_320_000), &reading(&[("temperature", 21.5)]))
                .unwrap();
        }
        let blackbox = Blackbox::open(file.path()).unwrap();
        assert_eq!(blackbox.sample_count().unwrap(), 1);
    }

    #[test]
    fn index_lookups_fail_loudly_for_unknown_ids() {
        let (mut blackbox, _file) = make_blackbox();
        assert!(matches!(
            blackbox.get_index(7),
            Err(BlackboxError::NotFound(7))
        ));
        assert!(matches!(
            blackbox.update_index(7, Some(42)),
            Err(BlackboxError::NotFound(7))
        ));
    }

    #[test]
    fn delete_index_removes_the_entry_and_its_samples() {
        let (mut blackbox, _file) = make_blackbox();
        blackbox
            .record("climate", ts(1_705_320_000), &reading(&[("temperature", 21.5)]))
            .unwrap();
        let local_id = blackbox.find_index(None, None).unwrap()[0].timeseries_id;

        blackbox.delete_index(local_id).unwrap();
        assert!(blackbox.find_index(None, None).unwrap().is_empty());
        assert_eq!(blackbox.sample_count().unwrap(), 0);
    }

    #[test]
    fn api_token_round_trips_and_expires() {
        let (mut blackbox, _file) = make_blackbox();
        assert!(blackbox.read_api_token().unwrap().is_none());

        let fresh = ApiToken {
            token: "bearer-token".to_owned(),
            valid_until_utc: Utc::now() + Duration::hours(1),
        };
        blackbox.write_api_token(&fresh).unwrap();
        let stored = blackbox.read_api_token().unwrap().expect("stored token");
        assert_eq!(stored.token, "bearer-token");
        assert!(stored.is_valid());

        let expiring = ApiToken {
            token: "stale".to_owned(),
            valid_until_utc: Utc::now() + Duration::seconds(10),
        };
        blackbox.write_api_token(&expiring).unwrap();
        let stored = blackbox.read_api_token().unwrap().expect("stored token");
        assert!(!stored.is_valid());
        // The write replaced the previous single row.
        let count: i64 = blackbox
            .conn
            .query_row("SELECT COUNT(*) FROM api_token", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn staging_ids_have_the_wire_length() {
        assert_eq!(generate_staging_id().len(), STAGING_ID_LEN);
        assert!(generate_staging_id().chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
