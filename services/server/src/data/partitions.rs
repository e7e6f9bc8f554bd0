//! Partition planning for range-partitioned tables.
//!
//! Pure value types compute partition names and `[lower, upper)` bounds;
//! [`create_partition`] issues the DDL. Two partitions with the same
//! scheme and key compare and hash equal, so a batch can be mapped into a
//! set of partitions to create.

use chrono::{DateTime, Datelike, Utc};
use sqlx::PgPool;
use tracing::debug;

/// Postgres error code for a failed check constraint.
pub const CHECK_VIOLATION: &str = "23514";
/// Postgres error code for `CREATE TABLE` hitting an existing table.
pub const DUPLICATE_TABLE: &str = "42P07";

/// Whether an sqlx error carries the given Postgres error code.
pub fn is_postgres_error_code(err: &sqlx::Error, code: &str) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|c| c == code)
}

/// Common surface of every partition scheme.
pub trait PartitionSpec {
    /// The partitioned base table, optionally schema-qualified.
    fn base_table_name(&self) -> &str;
    /// The name of this partition.
    fn partition_table_name(&self) -> String;
    /// Lower bound as a SQL literal (inclusive).
    fn lower_bound(&self) -> String;
    /// Upper bound as a SQL literal (exclusive).
    fn upper_bound(&self) -> String;
}

fn month_after(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

// ---------------------------------------------------------------------------
// Yearly
// ---------------------------------------------------------------------------

/// One partition per calendar year, suffix `y{Y}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct YearlyPartition {
    pub table: String,
    pub year: i32,
}

impl YearlyPartition {
    pub fn from_timestamp(timestamp: DateTime<Utc>, table: &str) -> Self {
        YearlyPartition {
            table: table.to_owned(),
            year: timestamp.year(),
        }
    }
}

impl PartitionSpec for YearlyPartition {
    fn base_table_name(&self) -> &str {
        &self.table
    }

    fn partition_table_name(&self) -> String {
        format!("{}_y{}", self.table, self.year)
    }

    fn lower_bound(&self) -> String {
        format!("'{:04}-01-01'", self.year)
    }

    fn upper_bound(&self) -> String {
        format!("'{:04}-01-01'", self.year + 1)
    }
}

// ---------------------------------------------------------------------------
// Quarterly
// ---------------------------------------------------------------------------

/// One partition per quarter, suffix `y{Y}q{Q}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuarterlyPartition {
    pub table: String,
    pub year: i32,
    pub quarter: u32,
}

impl QuarterlyPartition {
    pub fn from_timestamp(timestamp: DateTime<Utc>, table: &str) -> Self {
        QuarterlyPartition {
            table: table.to_owned(),
            year: timestamp.year(),
            quarter: (timestamp.month() - 1) / 3 + 1,
        }
    }
}

impl PartitionSpec for QuarterlyPartition {
    fn base_table_name(&self) -> &str {
        &self.table
    }

    fn partition_table_name(&self) -> String {
        format!("{}_y{}q{}", self.table, self.year, self.quarter)
    }

    fn lower_bound(&self) -> String {
        format!("'{:04}-{:02}-01'", self.year, (self.quarter - 1) * 3 + 1)
    }

    fn upper_bound(&self) -> String {
        let month = self.quarter * 3 + 1;
        let (year, month) = if month > 12 {
            (self.year + 1, 1)
        } else {
            (self.year, month)
        };
        format!("'{year:04}-{month:02}-01'")
    }
}

// ---------------------------------------------------------------------------
// Monthly
// ---------------------------------------------------------------------------

/// One partition per calendar month, suffix `y{Y}m{M}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonthlyPartition {
    pub table: String,
    pub year: i32,
    pub month: u32,
}

impl MonthlyPartition {
    pub fn from_timestamp(timestamp: DateTime<Utc>, table: &str) -> Self {
        MonthlyPartition {
            table: table.to_owned(),
            year: timestamp.year(),
            month: timestamp.month(),
        }
    }
}

impl PartitionSpec for MonthlyPartition {
    fn base_table_name(&self) -> &str {
        &self.table
    }

    fn partition_table_name(&self) -> String {
        format!("{}_y{}m{}", self.table, self.year, self.month)
    }

    fn lower_bound(&self) -> String {
        format!("'{:04}-{:02}-01'", self.year, self.month)
    }

    fn upper_bound(&self) -> String {
        let (year, month) = month_after(self.year, self.month);
        format!("'{year:04}-{month:02}-01'")
    }
}

// ---------------------------------------------------------------------------
// Bucketed by integer id
// ---------------------------------------------------------------------------

/// Partitions an integer key space into buckets of `bucket_size` ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketPartition {
    pub table: String,
    pub actual_id: i64,
    pub bucket_size: i64,
}

impl BucketPartition {
    /// `bucket_size` must be at least 1.
    pub fn new(table: &str, actual_id: i64, bucket_size: i64) -> Result<Self, String> {
        if bucket_size < 1 {
            return Err("bucket_size must be greater than 0".to_owned());
        }
        Ok(BucketPartition {
            table: table.to_owned(),
            actual_id,
            bucket_size,
        })
    }

    pub fn partition_no(&self) -> i64 {
        self.actual_id / self.bucket_size
    }

    pub fn lower_bound_int(&self) -> i64 {
        self.partition_no() * self.bucket_size
    }

    pub fn upper_bound_int(&self) -> i64 {
        (self.partition_no() + 1) * self.bucket_size
    }
}

impl PartitionSpec for BucketPartition {
    fn base_table_name(&self) -> &str {
        &self.table
    }

    fn partition_table_name(&self) -> String {
        // Clean multiples of 10⁶/10³ get the compact m/k suffix.
        const BREAK_POINTS: [(i64, &str); 2] = [(1_000_000, "m"), (1000, "k")];

        let mut suffix = format!("{}_{}", self.lower_bound_int(), self.upper_bound_int());
        for (break_point, unit) in BREAK_POINTS {
            if self.bucket_size >= break_point && self.bucket_size % break_point == 0 {
                suffix = format!(
                    "{:04}{unit}_{:04}{unit}",
                    self.lower_bound_int() / break_point,
                    self.upper_bound_int() / break_point
                );
                break;
            }
        }
        format!("{}_{}", self.table, suffix)
    }

    fn lower_bound(&self) -> String {
        self.lower_bound_int().to_string()
    }

    fn upper_bound(&self) -> String {
        self.upper_bound_int().to_string()
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Create the partition unless it already exists.
///
/// Two writers may race to create the same partition; the loser's
/// duplicate-table error is swallowed. Runs in its own short statements on
/// purpose — serializing writers to avoid the race would cost more than
/// the race does.
pub async fn create_partition<P: PartitionSpec + Sync>(
    pool: &PgPool,
    partition: &P,
) -> Result<(), sqlx::Error> {
    let qualified = partition.partition_table_name();
    let (schema, table) = match qualified.split_once('.') {
        Some((schema, table)) => (schema.to_owned(), table.to_owned()),
        None => ("public".to_owned(), qualified.clone()),
    };

    if does_table_exist(pool, &schema, &table).await? {
        return Ok(());
    }

    let statement = format!(
        "CREATE TABLE {} PARTITION OF {} FOR VALUES FROM ({}) TO ({})",
        qualified,
        partition.base_table_name(),
        partition.lower_bound(),
        partition.upper_bound()
    );
    match sqlx::query(sqlx::AssertSqlSafe(statement))
        .execute(pool)
        .await
    {
        Ok(_) => {
            debug!(partition = %qualified, "created partition");
            Ok(())
        }
        Err(err) if is_postgres_error_code(&err, DUPLICATE_TABLE) => {
            // Another writer won the race.
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn does_table_exist(
    pool: &PgPool,
    schema_name: &str,
    table_name: &str,
) -> Result<bool, sqlx::Error> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (
             SELECT FROM information_schema.tables
             WHERE table_schema = $1 AND table_name = $2
         )",
    )
    .bind(schema_name)
    .bind(table_name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}
