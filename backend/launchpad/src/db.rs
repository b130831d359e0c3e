//! Database layer — connection pool and migrations.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{LaunchpadError, Result};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Every connection to `:memory:` opens its own empty database.
    let in_memory = url.contains(":memory:");
    let max_connections = if in_memory { 1 } else { DEFAULT_MAX_CONNECTIONS };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Timestamp format used in every TEXT column.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LaunchpadError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

pub fn decode_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(decode_ts).transpose()
}

/// Current time truncated to the stored precision, so a value read back
/// compares equal to the one that was written.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    decode_ts(&encode_ts(&now)).unwrap_or(now)
}

#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    init_pool("sqlite::memory:").await.unwrap()
}
