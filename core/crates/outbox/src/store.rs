//! SQLite-backed outbox queue.
//!
//! Tasks live in `outbox_tasks`, unique per `dedupe_key`. Once a task is done its key moves to
//! `outbox_processed` in the same transaction, which is what keeps a redelivered or re-enqueued
//! task from running its effect twice.

use crate::{
	config::OutboxConfig,
	handler::TaskError,
	task::{NewOutboxTask, OutboxStatus, OutboxTask, OutboxTaskId},
	OutboxError,
};

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use sea_orm::{
	ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement, TransactionTrait,
};
use tracing::{debug, info, instrument, warn};

/// Recorded on a task whose previous holder never reported back.
pub const LEASE_EXPIRED: &str = "lease expired before the task reported back";

const TASK_COLUMNS: &str = "id, kind, payload, dedupe_key, attempts, status, lease_owner, \
	lease_expires_at, available_at, last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct OutboxStore {
	db: DatabaseConnection,
}

impl OutboxStore {
	pub async fn open(db: DatabaseConnection) -> Result<Self, OutboxError> {
		let store = Self { db };
		store.init_tables().await?;

		Ok(store)
	}

	async fn init_tables(&self) -> Result<(), OutboxError> {
		for statement in [
			"CREATE TABLE IF NOT EXISTS outbox_tasks (
				id TEXT PRIMARY KEY,
				kind TEXT NOT NULL,
				payload TEXT NOT NULL,
				dedupe_key TEXT NOT NULL UNIQUE,
				attempts INTEGER NOT NULL DEFAULT 0,
				status TEXT NOT NULL,
				lease_owner TEXT,
				lease_expires_at TEXT,
				available_at TEXT NOT NULL,
				last_error TEXT,
				created_at TEXT NOT NULL,
				updated_at TEXT NOT NULL
			)",
			"CREATE INDEX IF NOT EXISTS idx_outbox_tasks_status_available
				ON outbox_tasks(status, available_at)",
			"CREATE TABLE IF NOT EXISTS outbox_processed (
				dedupe_key TEXT PRIMARY KEY,
				task_id TEXT NOT NULL,
				processed_at TEXT NOT NULL
			)",
		] {
			self.db.execute_unprepared(statement).await?;
		}

		Ok(())
	}

	#[must_use]
	pub const fn db(&self) -> &DatabaseConnection {
		&self.db
	}

	pub async fn enqueue(&self, task: NewOutboxTask) -> Result<bool, OutboxError> {
		Self::enqueue_on(&self.db, task).await
	}

	/// Queues `task` on `conn`, which may be a transaction shared with the change that produced
	/// it. Returns `false` when a task with the same key is already queued or was processed.
	pub async fn enqueue_on<C: ConnectionTrait>(
		conn: &C,
		task: NewOutboxTask,
	) -> Result<bool, OutboxError> {
		let now = format_timestamp(Utc::now());

		let res = conn
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"INSERT OR IGNORE INTO outbox_tasks
					(id, kind, payload, dedupe_key, attempts, status, available_at, created_at, updated_at)
				SELECT ?, ?, ?, ?, 0, ?, ?, ?, ?
				WHERE NOT EXISTS (SELECT 1 FROM outbox_processed WHERE dedupe_key = ?)",
				vec![
					OutboxTaskId::new().to_string().into(),
					task.kind.to_string().into(),
					serde_json::to_string(&task.payload)?.into(),
					task.dedupe_key.clone().into(),
					OutboxStatus::Queued.to_string().into(),
					now.clone().into(),
					now.clone().into(),
					now.into(),
					task.dedupe_key.clone().into(),
				],
			))
			.await?;

		let queued = res.rows_affected() == 1;
		if !queued {
			debug!(dedupe_key = %task.dedupe_key, "Outbox task already known, not queued again");
		}

		Ok(queued)
	}

	/// Claims the oldest runnable task for `owner` until `lease` elapses.
	///
	/// Runnable means queued and past its backoff, or in flight under a lease that expired. An
	/// expired lease means its holder died mid-run, which counts as an attempt.
	#[instrument(skip(self), err)]
	pub async fn lease_next(
		&self,
		owner: &str,
		lease: Duration,
	) -> Result<Option<OutboxTask>, OutboxError> {
		let now = Utc::now();
		let expires_at = TimeDelta::from_std(lease)
			.ok()
			.and_then(|lease| now.checked_add_signed(lease))
			.unwrap_or(DateTime::<Utc>::MAX_UTC);
		let now = format_timestamp(now);

		let Some(row) = self
			.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!(
					"UPDATE outbox_tasks
					SET status = ?, lease_owner = ?, lease_expires_at = ?, updated_at = ?,
						attempts = CASE WHEN status = ? THEN attempts + 1 ELSE attempts END,
						last_error = CASE WHEN status = ? THEN ? ELSE last_error END
					WHERE id = (
						SELECT id FROM outbox_tasks
						WHERE (status = ? AND available_at <= ?)
							OR (status = ? AND lease_expires_at <= ?)
						ORDER BY available_at, created_at
						LIMIT 1
					)
					RETURNING {TASK_COLUMNS}"
				),
				vec![
					OutboxStatus::InFlight.to_string().into(),
					owner.into(),
					format_timestamp(expires_at).into(),
					now.clone().into(),
					OutboxStatus::InFlight.to_string().into(),
					OutboxStatus::InFlight.to_string().into(),
					LEASE_EXPIRED.into(),
					OutboxStatus::Queued.to_string().into(),
					now.clone().into(),
					OutboxStatus::InFlight.to_string().into(),
					now.into(),
				],
			))
			.await?
		else {
			return Ok(None);
		};

		task_from_row(&row).map(Some)
	}

	/// Marks the task done and records its key as processed, both or neither. Returns `false` if
	/// `owner` no longer holds the lease.
	pub async fn complete(&self, id: OutboxTaskId, owner: &str) -> Result<bool, OutboxError> {
		let now = format_timestamp(Utc::now());
		let txn = self.db.begin().await?;

		let Some(row) = txn
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE outbox_tasks
				SET status = ?, lease_owner = NULL, lease_expires_at = NULL, last_error = NULL,
					updated_at = ?
				WHERE id = ? AND status = ? AND lease_owner = ?
				RETURNING dedupe_key",
				vec![
					OutboxStatus::Done.to_string().into(),
					now.clone().into(),
					id.to_string().into(),
					OutboxStatus::InFlight.to_string().into(),
					owner.into(),
				],
			))
			.await?
		else {
			txn.rollback().await?;
			warn!(%id, owner, "Lease lost before the task completed;");
			return Ok(false);
		};

		let dedupe_key: String = row.try_get("", "dedupe_key")?;

		txn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"INSERT OR IGNORE INTO outbox_processed (dedupe_key, task_id, processed_at)
			VALUES (?, ?, ?)",
			vec![dedupe_key.into(), id.to_string().into(), now.into()],
		))
		.await?;

		txn.commit().await?;

		Ok(true)
	}

	/// Records a failed execution. The task is queued again after backoff, or failed for good once
	/// it is out of attempts or the error is permanent. Returns `None` if `owner` lost the lease.
	pub async fn fail(
		&self,
		task: &OutboxTask,
		owner: &str,
		error: &TaskError,
		config: &OutboxConfig,
	) -> Result<Option<OutboxStatus>, OutboxError> {
		let attempts = task.attempts.saturating_add(1);
		let now = Utc::now();

		let status = if matches!(error, TaskError::Permanent(_)) || attempts >= config.max_attempts {
			OutboxStatus::Failed
		} else {
			OutboxStatus::Queued
		};

		let available_at = TimeDelta::from_std(config.backoff(attempts))
			.ok()
			.and_then(|delay| now.checked_add_signed(delay))
			.unwrap_or(now);

		let res = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE outbox_tasks
				SET status = ?, attempts = ?, last_error = ?, available_at = ?,
					lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
				WHERE id = ? AND status = ? AND lease_owner = ?",
				vec![
					status.to_string().into(),
					i64::from(attempts).into(),
					error.to_string().into(),
					format_timestamp(available_at).into(),
					format_timestamp(now).into(),
					task.id.to_string().into(),
					OutboxStatus::InFlight.to_string().into(),
					owner.into(),
				],
			))
			.await?;

		Ok((res.rows_affected() == 1).then_some(status))
	}

	/// Fails a leased task for good without counting another attempt. Used when the runs it
	/// already had used up its budget. Returns `false` if `owner` lost the lease.
	pub async fn give_up(
		&self,
		task: &OutboxTask,
		owner: &str,
		error: &TaskError,
	) -> Result<bool, OutboxError> {
		let now = format_timestamp(Utc::now());

		let res = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE outbox_tasks
				SET status = ?, last_error = ?, lease_owner = NULL, lease_expires_at = NULL,
					updated_at = ?
				WHERE id = ? AND status = ? AND lease_owner = ?",
				vec![
					OutboxStatus::Failed.to_string().into(),
					error.to_string().into(),
					now.into(),
					task.id.to_string().into(),
					OutboxStatus::InFlight.to_string().into(),
					owner.into(),
				],
			))
			.await?;

		Ok(res.rows_affected() == 1)
	}

	pub async fn get(&self, id: OutboxTaskId) -> Result<Option<OutboxTask>, OutboxError> {
		self.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!("SELECT {TASK_COLUMNS} FROM outbox_tasks WHERE id = ?"),
				vec![id.to_string().into()],
			))
			.await?
			.as_ref()
			.map(task_from_row)
			.transpose()
	}

	pub async fn get_by_key(&self, dedupe_key: &str) -> Result<Option<OutboxTask>, OutboxError> {
		self.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!("SELECT {TASK_COLUMNS} FROM outbox_tasks WHERE dedupe_key = ?"),
				vec![dedupe_key.into()],
			))
			.await?
			.as_ref()
			.map(task_from_row)
			.transpose()
	}

	pub async fn is_processed(&self, dedupe_key: &str) -> Result<bool, OutboxError> {
		Ok(self
			.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT 1 AS processed FROM outbox_processed WHERE dedupe_key = ?",
				vec![dedupe_key.into()],
			))
			.await?
			.is_some())
	}

	/// Tasks that gave up, oldest first.
	pub async fn failed(&self) -> Result<Vec<OutboxTask>, OutboxError> {
		self.db
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!(
					"SELECT {TASK_COLUMNS} FROM outbox_tasks WHERE status = ? ORDER BY created_at"
				),
				vec![OutboxStatus::Failed.to_string().into()],
			))
			.await?
			.iter()
			.map(task_from_row)
			.collect()
	}

	/// Gives a failed task a fresh set of attempts.
	pub async fn requeue_failed(&self, id: OutboxTaskId) -> Result<bool, OutboxError> {
		let now = format_timestamp(Utc::now());

		let res = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE outbox_tasks
				SET status = ?, attempts = 0, available_at = ?, updated_at = ?
				WHERE id = ? AND status = ?",
				vec![
					OutboxStatus::Queued.to_string().into(),
					now.clone().into(),
					now.into(),
					id.to_string().into(),
					OutboxStatus::Failed.to_string().into(),
				],
			))
			.await?;

		Ok(res.rows_affected() == 1)
	}

	/// Deletes done tasks and processed markers older than `retention`. Returns how many tasks went.
	pub async fn prune_done(&self, retention: Duration) -> Result<u64, OutboxError> {
		let Some(cutoff) = TimeDelta::from_std(retention)
			.ok()
			.and_then(|retention| Utc::now().checked_sub_signed(retention))
		else {
			return Ok(0);
		};
		let cutoff = format_timestamp(cutoff);

		let tasks = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"DELETE FROM outbox_tasks WHERE status = ? AND updated_at < ?",
				vec![OutboxStatus::Done.to_string().into(), cutoff.clone().into()],
			))
			.await?
			.rows_affected();

		let markers = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"DELETE FROM outbox_processed WHERE processed_at < ?",
				vec![cutoff.into()],
			))
			.await?
			.rows_affected();

		if tasks > 0 || markers > 0 {
			info!(tasks, markers, "Pruned processed outbox tasks");
		}

		Ok(tasks)
	}
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
	timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, OutboxError> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|_| OutboxError::InvalidStoredValue {
			field,
			value: value.to_string(),
		})
}

fn parse_column<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, OutboxError> {
	value.parse().map_err(|_| OutboxError::InvalidStoredValue {
		field,
		value: value.to_string(),
	})
}

fn task_from_row(row: &QueryResult) -> Result<OutboxTask, OutboxError> {
	let attempts: i64 = row.try_get("", "attempts")?;

	Ok(OutboxTask {
		id: parse_column("id", &row.try_get::<String>("", "id")?)?,
		kind: parse_column("kind", &row.try_get::<String>("", "kind")?)?,
		payload: serde_json::from_str(&row.try_get::<String>("", "payload")?)?,
		dedupe_key: row.try_get("", "dedupe_key")?,
		attempts: u32::try_from(attempts).map_err(|_| OutboxError::InvalidStoredValue {
			field: "attempts",
			value: attempts.to_string(),
		})?,
		status: parse_column("status", &row.try_get::<String>("", "status")?)?,
		lease_owner: row.try_get("", "lease_owner")?,
		lease_expires_at: row
			.try_get::<Option<String>>("", "lease_expires_at")?
			.map(|value| parse_timestamp("lease_expires_at", &value))
			.transpose()?,
		available_at: parse_timestamp("available_at", &row.try_get::<String>("", "available_at")?)?,
		last_error: row.try_get("", "last_error")?,
		created_at: parse_timestamp("created_at", &row.try_get::<String>("", "created_at")?)?,
		updated_at: parse_timestamp("updated_at", &row.try_get::<String>("", "updated_at")?)?,
	})
}
