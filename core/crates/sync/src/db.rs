//! SQLite helpers shared by every store that lives in a workspace database.

use std::{path::Path, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use tracing::{debug, info};

use crate::Error;

/// Opens (creating if needed) the SQLite database at `path` in WAL mode.
pub async fn open_database(path: impl AsRef<Path>) -> Result<DatabaseConnection, DbErr> {
	let path = path.as_ref();

	let mut options = ConnectOptions::new(format!("sqlite://{}?mode=rwc", path.display()));
	options
		.max_connections(4)
		.acquire_timeout(Duration::from_secs(10))
		.sqlx_logging(false);

	let db = Database::connect(options).await?;

	// Persisted in the database file, so it holds for every pooled connection
	db.execute_unprepared("PRAGMA journal_mode = WAL;").await?;
	info!(path = %path.display(), "Opened database in WAL mode");

	Ok(db)
}

pub(crate) async fn execute_all<C: ConnectionTrait>(conn: &C, statements: &[&str]) -> Result<(), DbErr> {
	for statement in statements {
		conn.execute_unprepared(statement).await?;
	}

	debug!(statements_count = statements.len(), "Schema ensured");

	Ok(())
}

/// Sequences are `u64` in memory and `INTEGER` (`i64`) in SQLite.
pub fn sequence_to_db(sequence: u64) -> i64 {
	i64::try_from(sequence).unwrap_or(i64::MAX)
}

pub fn sequence_from_db(sequence: i64) -> Result<u64, Error> {
	u64::try_from(sequence).map_err(|_| Error::InvalidStoredValue {
		field: "sequence",
		value: sequence.to_string(),
	})
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
#[must_use]
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
	timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, Error> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|_| Error::InvalidStoredValue {
			field,
			value: value.to_string(),
		})
}

pub fn parse_column<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, Error> {
	value.parse().map_err(|_| Error::InvalidStoredValue {
		field,
		value: value.to_string(),
	})
}
