//! The partitioned sample store: idempotent batched upserts with
//! on-demand monthly partition creation, and the guarded read path.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;

use crate::data::partitions::{
    CHECK_VIOLATION, MonthlyPartition, create_partition, is_postgres_error_code,
};
use crate::data::values::prevent_real_overflow;

/// The partitioned table all samples land in.
const TIMESERIES_TABLE: &str = "timeseries";

/// Rows per upsert statement.
const TIMESERIES_MAX_BATCH_SIZE: usize = 1000;

/// The longest window a single read may cover. Guards the database
/// against runaway queries from callers that lost track of time.
pub const MAX_QUERY_RANGE: Duration = Duration::days(30);

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// One series of samples, the unit both the read API and the device data
/// handler work with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeseriesData {
    pub timeseries_id: i64,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<Option<f64>>,
}

/// A validated, non-empty time range.
#[derive(Debug, Clone, Copy)]
pub struct DatetimeRange {
    start_at_utc: DateTime<Utc>,
    end_at_utc: DateTime<Utc>,
}

impl DatetimeRange {
    pub fn new(start_at_utc: DateTime<Utc>, end_at_utc: DateTime<Utc>) -> Result<Self, DataError> {
        if start_at_utc > end_at_utc {
            return Err(DataError::Validation(
                "the start of the range must lie before its end".to_owned(),
            ));
        }
        if start_at_utc == end_at_utc {
            return Err(DataError::Validation("the requested range is empty".to_owned()));
        }
        Ok(DatetimeRange {
            start_at_utc,
            end_at_utc,
        })
    }

    pub fn start_at_utc(&self) -> DateTime<Utc> {
        self.start_at_utc
    }

    pub fn end_at_utc(&self) -> DateTime<Utc> {
        self.end_at_utc
    }

    pub fn span(&self) -> Duration {
        self.end_at_utc - self.start_at_utc
    }
}

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct SampleRow {
    timestamp_utc: DateTime<Utc>,
    value: Option<f64>,
}

/// Add samples to one timeseries.
///
/// Values are clamped into the REAL range (NaN/∞ become NULL), duplicate
/// timestamps within the batch coalesce to the first non-null value, and
/// conflicts on `(timeseries_id, timestamp_utc)` replace the stored value,
/// which makes redelivered batches idempotent.
///
/// When a chunk hits the partition range check, the missing monthly
/// partitions are created and the chunk is retried. Note that partition
/// creation commits independently of any surrounding transaction; calling
/// this inside a longer transaction can cost uncommitted work when the
/// rollback-and-create cycle runs.
pub async fn add_timeseries(
    pool: &PgPool,
    timeseries_id: i64,
    timestamps: &[DateTime<Utc>],
    values: &[Option<f64>],
) -> Result<(), DataError> {
    let rows = prepare_rows(timeseries_id, timestamps, values)?;

    for chunk in rows.chunks(TIMESERIES_MAX_BATCH_SIZE) {
        match upsert_chunk(pool, timeseries_id, chunk).await {
            Ok(()) => {}
            Err(err) if is_postgres_error_code(&err, CHECK_VIOLATION) => {
                // The only check on this table is the partition range, so
                // a violation means a missing partition.
                for partition in monthly_partitions_for(chunk) {
                    create_partition(pool, &partition).await?;
                }
                upsert_chunk(pool, timeseries_id, chunk).await?;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Validate lengths, clamp values and coalesce duplicate timestamps.
fn prepare_rows(
    timeseries_id: i64,
    timestamps: &[DateTime<Utc>],
    values: &[Option<f64>],
) -> Result<Vec<SampleRow>, DataError> {
    if timestamps.len() != values.len() {
        return Err(DataError::Validation(
            "timestamps and values must be of equal length".to_owned(),
        ));
    }

    let mut rows: Vec<SampleRow> = Vec::with_capacity(timestamps.len());
    let mut seen: HashMap<DateTime<Utc>, usize> = HashMap::new();
    for (&timestamp, &value) in timestamps.iter().zip(values) {
        let value = prevent_real_overflow(value);
        match seen.get(&timestamp) {
            Some(&at) => {
                warn!(
                    timeseries_id,
                    timestamp = %timestamp,
                    "duplicate timestamp in batch; coalescing values"
                );
                if rows[at].value.is_none() {
                    rows[at].value = value;
                }
            }
            None => {
                seen.insert(timestamp, rows.len());
                rows.push(SampleRow {
                    timestamp_utc: timestamp,
                    value,
                });
            }
        }
    }
    Ok(rows)
}

async fn upsert_chunk(
    pool: &PgPool,
    timeseries_id: i64,
    chunk: &[SampleRow],
) -> Result<(), sqlx::Error> {
    let mut builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
        "INSERT INTO timeseries (timeseries_id, timestamp_utc, value) ",
    );
    builder.push_values(chunk, |mut b, row| {
        b.push_bind(timeseries_id)
            .push_bind(row.timestamp_utc)
            .push_bind(row.value.map(|v| v as f32));
    });
    builder.push(" ON CONFLICT (timeseries_id, timestamp_utc) DO UPDATE SET value = EXCLUDED.value");
    builder.build().execute(pool).await?;
    Ok(())
}

/// The monthly partitions covering a chunk.
fn monthly_partitions_for(chunk: &[SampleRow]) -> HashSet<MonthlyPartition> {
    chunk
        .iter()
        .map(|row| MonthlyPartition::from_timestamp(row.timestamp_utc, TIMESERIES_TABLE))
        .collect()
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

/// Fetch the samples of the given timeseries within a range.
///
/// Ids that are not registered signals fail with `NotFound`; registered
/// ids without samples in the range come back with empty arrays.
pub async fn get_timeseries(
    pool: &PgPool,
    timeseries_ids: &[i64],
    range: &DatetimeRange,
) -> Result<Vec<TimeseriesData>, DataError> {
    if timeseries_ids.is_empty() {
        return Err(DataError::Validation(
            "at least one timeseries_id is required".to_owned(),
        ));
    }
    ensure_query_range(range)?;

    let mut ids: Vec<i64> = timeseries_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let rows: Vec<(i64, DateTime<Utc>, Option<f64>)> = sqlx::query_as(
        "SELECT timeseries_id, timestamp_utc, value::float8
         FROM timeseries
         WHERE timeseries_id = ANY($1)
           AND timestamp_utc >= $2
           AND timestamp_utc <= $3
         ORDER BY timeseries_id ASC, timestamp_utc ASC",
    )
    .bind(&ids)
    .bind(range.start_at_utc())
    .bind(range.end_at_utc())
    .fetch_all(pool)
    .await?;

    let mut series: Vec<TimeseriesData> = Vec::new();
    for (timeseries_id, timestamp, value) in rows {
        if series.last().map(|s| s.timeseries_id) != Some(timeseries_id) {
            series.push(TimeseriesData {
                timeseries_id,
                timestamps: Vec::new(),
                values: Vec::new(),
            });
        }
        let current = series.last_mut().expect("series was just pushed");
        current.timestamps.push(timestamp);
        current.values.push(value);
    }

    if series.len() == ids.len() {
        return Ok(series);
    }

    let existing: Vec<(i64,)> =
        sqlx::query_as("SELECT timeseries_id FROM device_signal WHERE timeseries_id = ANY($1)")
            .bind(&ids)
            .fetch_all(pool)
            .await?;
    let existing: HashSet<i64> = existing.into_iter().map(|(id,)| id).collect();

    let missing: Vec<i64> = ids.iter().copied().filter(|id| !existing.contains(id)).collect();
    if !missing.is_empty() {
        return Err(DataError::NotFound(format!(
            "timeseries {missing:?} are not registered signals"
        )));
    }

    // Registered signals without samples in the range get empty series.
    let with_data: HashSet<i64> = series.iter().map(|s| s.timeseries_id).collect();
    for id in ids {
        if !with_data.contains(&id) {
            series.push(TimeseriesData {
                timeseries_id: id,
                timestamps: Vec::new(),
                values: Vec::new(),
            });
        }
    }
    Ok(series)
}

/// Enforce the maximum query window.
pub fn ensure_query_range(range: &DatetimeRange) -> Result<(), DataError> {
    if range.span() > MAX_QUERY_RANGE {
        return Err(DataError::Validation(format!(
            "the requested range exceeds the maximum of {} days; split the request \
             into smaller chunks",
            MAX_QUERY_RANGE.num_days()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::values::MAX_ABS_REAL_VALUE;

    fn ts(text: &str) -> DateTime<Utc> {
        text.parse().unwrap()
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let result = prepare_rows(42, &[ts("2024-01-15T12:00:00Z")], &[Some(1.0), Some(2.0)]);
        assert!(matches!(result, Err(DataError::Validation(_))));
    }

    #[test]
    fn duplicate_timestamps_coalesce_to_the_first_non_null() {
        let t = ts("2024-01-15T12:00:00Z");
        let rows = prepare_rows(42, &[t, t, t], &[Some(10.0), None, Some(11.0)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Some(10.0));
    }

    #[test]
    fn a_null_first_occurrence_is_filled_by_a_later_value() {
        let t = ts("2024-01-15T12:00:00Z");
        let rows = prepare_rows(42, &[t, t], &[None, Some(11.0)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Some(11.0));
    }

    #[test]
    fn values_are_clamped_while_building_rows() {
        let rows = prepare_rows(
            42,
            &[
                ts("2024-01-15T12:00:00Z"),
                ts("2024-01-15T12:00:30Z"),
                ts("2024-01-15T12:01:00Z"),
            ],
            &[Some(f64::NAN), Some(f64::MAX), Some(-f64::MAX)],
        )
        .unwrap();
        assert_eq!(rows[0].value, None);
        assert_eq!(rows[1].value, Some(MAX_ABS_REAL_VALUE));
        assert_eq!(rows[2].value, Some(-MAX_ABS_REAL_VALUE));
    }

    #[test]
    fn a_chunk_spanning_two_months_needs_two_partitions() {
        let rows = prepare_rows(
            42,
            &[ts("2024-01-31T23:59:59Z"), ts("2024-02-01T00:00:00Z")],
            &[Some(21.5), Some(22.0)],
        )
        .unwrap();
        let partitions = monthly_partitions_for(&rows);
        assert_eq!(partitions.len(), 2);
        use crate::data::partitions::PartitionSpec;
        let names: HashSet<String> = partitions
            .iter()
            .map(PartitionSpec::partition_table_name)
            .collect();
        assert!(names.contains("timeseries_y2024m1"));
        assert!(names.contains("timeseries_y2024m2"));
    }

    #[test]
    fn empty_and_inverted_ranges_are_rejected() {
        let t = ts("2024-01-01T00:00:00Z");
        assert!(matches!(
            DatetimeRange::new(t, t),
            Err(DataError::Validation(_))
        ));
        assert!(matches!(
            DatetimeRange::new(t + Duration::hours(1), t),
            Err(DataError::Validation(_))
        ));
    }

    #[test]
    fn ranges_beyond_the_maximum_window_are_rejected() {
        let start = ts("2024-01-01T00:00:00Z");
        let at_limit = DatetimeRange::new(start, start + MAX_QUERY_RANGE).unwrap();
        assert!(ensure_query_range(&at_limit).is_ok());

        let beyond = DatetimeRange::new(start, start + MAX_QUERY_RANGE + Duration::seconds(1))
            .unwrap();
        assert!(matches!(
            ensure_query_range(&beyond),
            Err(DataError::Validation(_))
        ));
    }
}
