//! The read surface for stored samples.

use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::data::timeseries::{DatetimeRange, TimeseriesData, get_timeseries};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    /// Comma-separated list of timeseries ids.
    pub timeseries_ids: String,
    /// RFC 3339 with an explicit UTC offset.
    pub start_at_utc: String,
    pub end_at_utc: String,
}

/// `GET /data/timeseries?timeseries_ids=1,2&start_at_utc=…&end_at_utc=…`
pub async fn get_timeseries_route(
    State(state): State<AppState>,
    Query(query): Query<TimeseriesQuery>,
) -> Result<Json<Vec<TimeseriesData>>, ApiError> {
    let ids = parse_ids(&query.timeseries_ids)?;
    let range = DatetimeRange::new(
        parse_timestamp("start_at_utc", &query.start_at_utc)?,
        parse_timestamp("end_at_utc", &query.end_at_utc)?,
    )?;

    let series = get_timeseries(&state.pool, &ids, &range).await?;
    Ok(Json(series))
}

fn parse_ids(raw: &str) -> Result<Vec<i64>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>().map_err(|_| {
                ApiError::Validation(format!("'{part}' is not a valid timeseries id"))
            })
        })
        .collect()
}

/// Timestamps must carry an explicit offset; offset-less input is
/// rejected, not guessed at.
fn parse_timestamp(name: &str, raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| {
            ApiError::Validation(format!(
                "{name} must be an RFC 3339 timestamp with a timezone offset"
            ))
        })
}
