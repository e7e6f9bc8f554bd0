pub mod partitions;
pub mod timeseries;
pub mod values;

pub use timeseries::{DataError, DatetimeRange, MAX_QUERY_RANGE, TimeseriesData};
