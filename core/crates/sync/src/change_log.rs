//! Durable, per-workspace record of local changes and of the server's change stream.
//!
//! Local mutations are appended here before they are sent anywhere, so a crash between the
//! append and the send loses nothing: the session resends every `pending` entry in append order
//! once it reconnects. The same database keeps the applied-sequence watermark, the changes that
//! arrived ahead of it, and a compacted history of applied changes used to rebuild projections.

use crate::{
	db::{
		execute_all, format_timestamp, parse_column, parse_timestamp, sequence_from_db,
		sequence_to_db,
	},
	wire::MutationEnvelope,
	Error,
};

use td_core_shared_types::{
	AccountId, Change, ChangeId, ErrorKind, ErrorObject, NodeId, NodeMutation, Sequence,
	WorkspaceId,
};

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use sea_orm::{
	ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeStatus {
	Pending,
	Acknowledged,
	Failed,
}

/// A local mutation and its delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
	/// Append order within the workspace, used as the resend cursor.
	pub position: i64,
	pub local_id: ChangeId,
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub created_by: AccountId,
	pub mutation: NodeMutation,
	pub base_revision: Option<Sequence>,
	pub status: ChangeStatus,
	/// Sends performed so far, including the first one.
	pub retry_count: u32,
	pub sequence: Option<Sequence>,
	pub last_error: Option<ErrorObject>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl PendingChange {
	#[must_use]
	pub fn envelope(&self) -> MutationEnvelope {
		MutationEnvelope {
			id: self.local_id,
			workspace_id: self.workspace_id,
			node_id: self.node_id,
			mutation: self.mutation.clone(),
			base_revision: self.base_revision,
			created_at: self.created_at,
		}
	}
}

#[derive(Debug, Clone)]
pub struct NewChange {
	pub node_id: NodeId,
	pub created_by: AccountId,
	pub mutation: NodeMutation,
	pub base_revision: Option<Sequence>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
	pub acknowledged: u64,
	pub applied: u64,
}

#[derive(Debug, Clone)]
pub struct LocalChangeLog {
	db: DatabaseConnection,
	workspace_id: WorkspaceId,
}

const PENDING_COLUMNS: &str = "id, local_id, workspace_id, node_id, created_by, mutation, \
	base_revision, status, retry_count, sequence, error_kind, last_error, created_at, updated_at";

impl LocalChangeLog {
	pub async fn open(db: DatabaseConnection, workspace_id: WorkspaceId) -> Result<Self, Error> {
		Self::init_tables(&db).await?;

		let this = Self { db, workspace_id };

		debug!(
			%workspace_id,
			pending = this.pending_count().await?,
			watermark = this.watermark().await?,
			"Opened local change log",
		);

		Ok(this)
	}

	pub async fn init_tables<C: ConnectionTrait>(conn: &C) -> Result<(), Error> {
		execute_all(
			conn,
			&[
				"CREATE TABLE IF NOT EXISTS pending_changes (
					id INTEGER PRIMARY KEY AUTOINCREMENT,
					local_id TEXT NOT NULL UNIQUE,
					workspace_id TEXT NOT NULL,
					node_id TEXT NOT NULL,
					created_by TEXT NOT NULL,
					mutation TEXT NOT NULL,
					base_revision INTEGER,
					status TEXT NOT NULL,
					retry_count INTEGER NOT NULL DEFAULT 0,
					sequence INTEGER,
					error_kind TEXT,
					last_error TEXT,
					created_at TEXT NOT NULL,
					updated_at TEXT NOT NULL
				)",
				"CREATE INDEX IF NOT EXISTS idx_pending_changes_status
					ON pending_changes(workspace_id, status, id)",
				"CREATE TABLE IF NOT EXISTS sync_watermarks (
					workspace_id TEXT PRIMARY KEY,
					applied_sequence INTEGER NOT NULL,
					updated_at TEXT NOT NULL
				)",
				"CREATE TABLE IF NOT EXISTS incoming_changes (
					workspace_id TEXT NOT NULL,
					sequence INTEGER NOT NULL,
					change TEXT NOT NULL,
					received_at TEXT NOT NULL,
					PRIMARY KEY (workspace_id, sequence)
				)",
				"CREATE TABLE IF NOT EXISTS applied_changes (
					workspace_id TEXT NOT NULL,
					sequence INTEGER NOT NULL,
					change_id TEXT NOT NULL,
					node_id TEXT NOT NULL,
					mutation_type TEXT NOT NULL,
					change TEXT NOT NULL,
					applied_at TEXT NOT NULL,
					PRIMARY KEY (workspace_id, sequence)
				)",
				"CREATE INDEX IF NOT EXISTS idx_applied_changes_node
					ON applied_changes(workspace_id, node_id, sequence)",
			],
		)
		.await?;

		Ok(())
	}

	#[must_use]
	pub const fn workspace_id(&self) -> WorkspaceId {
		self.workspace_id
	}

	#[must_use]
	pub const fn db(&self) -> &DatabaseConnection {
		&self.db
	}

	/// Validates and durably records a local change as `pending`.
	#[instrument(skip_all, fields(workspace_id = %self.workspace_id, node_id = %change.node_id), err)]
	pub async fn append(&self, change: NewChange) -> Result<PendingChange, Error> {
		self.append_on(&self.db, change).await
	}

	/// Same as [`Self::append`] but on a caller-owned connection or transaction, so the append can
	/// be committed together with other local writes.
	pub async fn append_on<C: ConnectionTrait>(
		&self,
		conn: &C,
		change: NewChange,
	) -> Result<PendingChange, Error> {
		change.mutation.validate(change.node_id)?;

		let local_id = ChangeId::new();
		let now = Utc::now();

		let res = conn
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"INSERT INTO pending_changes
					(local_id, workspace_id, node_id, created_by, mutation, base_revision, status,
					retry_count, created_at, updated_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
				vec![
					local_id.to_string().into(),
					self.workspace_id.to_string().into(),
					change.node_id.to_string().into(),
					change.created_by.to_string().into(),
					serde_json::to_string(&change.mutation)?.into(),
					change.base_revision.map(sequence_to_db).into(),
					ChangeStatus::Pending.to_string().into(),
					format_timestamp(now).into(),
					format_timestamp(now).into(),
				],
			))
			.await?;

		let position = i64::try_from(res.last_insert_id()).map_err(|_| Error::InvalidStoredValue {
			field: "id",
			value: res.last_insert_id().to_string(),
		})?;

		debug!(%local_id, position, mutation = change.mutation.name(), "Appended local change");

		Ok(PendingChange {
			position,
			local_id,
			workspace_id: self.workspace_id,
			node_id: change.node_id,
			created_by: change.created_by,
			mutation: change.mutation,
			base_revision: change.base_revision,
			status: ChangeStatus::Pending,
			retry_count: 0,
			sequence: None,
			last_error: None,
			created_at: now,
			updated_at: now,
		})
	}

	pub async fn get(&self, local_id: ChangeId) -> Result<Option<PendingChange>, Error> {
		self.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!("SELECT {PENDING_COLUMNS} FROM pending_changes WHERE local_id = ?"),
				vec![local_id.to_string().into()],
			))
			.await?
			.map(|row| pending_from_row(&row))
			.transpose()
	}

	/// Moves a `pending` change to `acknowledged`. Returns `false` if it wasn't pending anymore.
	pub async fn mark_acknowledged(
		&self,
		local_id: ChangeId,
		sequence: Sequence,
	) -> Result<bool, Error> {
		let res = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE pending_changes
				SET status = ?, sequence = ?, error_kind = NULL, last_error = NULL, updated_at = ?
				WHERE local_id = ? AND status = ?",
				vec![
					ChangeStatus::Acknowledged.to_string().into(),
					sequence_to_db(sequence).into(),
					format_timestamp(Utc::now()).into(),
					local_id.to_string().into(),
					ChangeStatus::Pending.to_string().into(),
				],
			))
			.await?;

		Ok(res.rows_affected() == 1)
	}

	/// Moves a `pending` change to `failed`, keeping the reason for the reconciliation UI.
	pub async fn mark_failed(&self, local_id: ChangeId, error: &ErrorObject) -> Result<bool, Error> {
		let res = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE pending_changes
				SET status = ?, error_kind = ?, last_error = ?, updated_at = ?
				WHERE local_id = ? AND status = ?",
				vec![
					ChangeStatus::Failed.to_string().into(),
					error.kind.to_string().into(),
					error.message.clone().into(),
					format_timestamp(Utc::now()).into(),
					local_id.to_string().into(),
					ChangeStatus::Pending.to_string().into(),
				],
			))
			.await?;

		if res.rows_affected() == 1 {
			warn!(%local_id, %error, "Local change failed");
			Ok(true)
		} else {
			Ok(false)
		}
	}

	/// Counts one more send of a change and returns the new total.
	pub async fn record_attempt(&self, local_id: ChangeId) -> Result<u32, Error> {
		let row = self
			.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE pending_changes
				SET retry_count = retry_count + 1, updated_at = ?
				WHERE local_id = ?
				RETURNING retry_count",
				vec![
					format_timestamp(Utc::now()).into(),
					local_id.to_string().into(),
				],
			))
			.await?
			.ok_or(Error::ChangeNotFound(local_id))?;

		let count: i64 = row.try_get("", "retry_count")?;

		u32::try_from(count).map_err(|_| Error::InvalidStoredValue {
			field: "retry_count",
			value: count.to_string(),
		})
	}

	/// Pending changes appended after `position`, oldest first.
	pub async fn pending_since(&self, position: i64, limit: usize) -> Result<Vec<PendingChange>, Error> {
		self.db
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!(
					"SELECT {PENDING_COLUMNS} FROM pending_changes
					WHERE workspace_id = ? AND status = ? AND id > ?
					ORDER BY id ASC
					LIMIT ?"
				),
				vec![
					self.workspace_id.to_string().into(),
					ChangeStatus::Pending.to_string().into(),
					position.into(),
					i64::try_from(limit).unwrap_or(i64::MAX).into(),
				],
			))
			.await?
			.iter()
			.map(pending_from_row)
			.collect()
	}

	pub async fn pending_count(&self) -> Result<u64, Error> {
		self.count_with_status(ChangeStatus::Pending).await
	}

	async fn count_with_status(&self, status: ChangeStatus) -> Result<u64, Error> {
		let count: i64 = self
			.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT COUNT(*) AS count FROM pending_changes WHERE workspace_id = ? AND status = ?",
				vec![
					self.workspace_id.to_string().into(),
					status.to_string().into(),
				],
			))
			.await?
			.map(|row| row.try_get("", "count"))
			.transpose()?
			.unwrap_or_default();

		Ok(count.unsigned_abs())
	}

	/// Failed changes waiting for the user to retry or dismiss them, oldest first.
	pub async fn failed(&self) -> Result<Vec<PendingChange>, Error> {
		self.db
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!(
					"SELECT {PENDING_COLUMNS} FROM pending_changes
					WHERE workspace_id = ? AND status = ?
					ORDER BY id ASC"
				),
				vec![
					self.workspace_id.to_string().into(),
					ChangeStatus::Failed.to_string().into(),
				],
			))
			.await?
			.iter()
			.map(pending_from_row)
			.collect()
	}

	/// Puts a failed change back in the queue with a fresh retry budget.
	///
	/// It keeps its original position, so it's resent before anything appended after it.
	pub async fn retry_failed(&self, local_id: ChangeId) -> Result<PendingChange, Error> {
		let res = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE pending_changes
				SET status = ?, retry_count = 0, error_kind = NULL, last_error = NULL, updated_at = ?
				WHERE local_id = ? AND workspace_id = ? AND status = ?",
				vec![
					ChangeStatus::Pending.to_string().into(),
					format_timestamp(Utc::now()).into(),
					local_id.to_string().into(),
					self.workspace_id.to_string().into(),
					ChangeStatus::Failed.to_string().into(),
				],
			))
			.await?;

		if res.rows_affected() == 0 {
			return Err(Error::ChangeNotFound(local_id));
		}

		info!(%local_id, "Failed change queued again");

		self.get(local_id).await?.ok_or(Error::ChangeNotFound(local_id))
	}

	pub async fn dismiss_failed(&self, local_id: ChangeId) -> Result<(), Error> {
		let res = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"DELETE FROM pending_changes WHERE local_id = ? AND workspace_id = ? AND status = ?",
				vec![
					local_id.to_string().into(),
					self.workspace_id.to_string().into(),
					ChangeStatus::Failed.to_string().into(),
				],
			))
			.await?;

		if res.rows_affected() == 0 {
			return Err(Error::ChangeNotFound(local_id));
		}

		info!(%local_id, "Failed change dismissed");

		Ok(())
	}

	/// Highest server sequence applied to local state, 0 before the first change.
	pub async fn watermark(&self) -> Result<Sequence, Error> {
		self.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT applied_sequence FROM sync_watermarks WHERE workspace_id = ?",
				vec![self.workspace_id.to_string().into()],
			))
			.await?
			.map(|row| {
				row.try_get::<i64>("", "applied_sequence")
					.map_err(Error::from)
					.and_then(sequence_from_db)
			})
			.transpose()
			.map(Option::unwrap_or_default)
	}

	/// Records `change` as applied and moves the watermark to its sequence, atomically.
	///
	/// Only the change right after the watermark is accepted. Anything at or below the watermark
	/// returns `false` and leaves the log untouched.
	pub async fn commit_applied(&self, change: &Change) -> Result<bool, Error> {
		let txn = self.db.begin().await?;

		let watermark = txn
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT applied_sequence FROM sync_watermarks WHERE workspace_id = ?",
				vec![self.workspace_id.to_string().into()],
			))
			.await?
			.map(|row| row.try_get::<i64>("", "applied_sequence"))
			.transpose()?
			.map(sequence_from_db)
			.transpose()?
			.unwrap_or_default();

		if change.sequence <= watermark {
			return Ok(false);
		}

		if change.sequence != watermark + 1 {
			return Err(Error::Apply {
				sequence: change.sequence,
				message: format!("watermark is {watermark}, changes can't be skipped"),
			});
		}

		let now = format_timestamp(Utc::now());

		txn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"INSERT OR IGNORE INTO applied_changes
				(workspace_id, sequence, change_id, node_id, mutation_type, change, applied_at)
			VALUES (?, ?, ?, ?, ?, ?, ?)",
			vec![
				self.workspace_id.to_string().into(),
				sequence_to_db(change.sequence).into(),
				change.id.to_string().into(),
				change.node_id.to_string().into(),
				change.mutation.name().into(),
				serde_json::to_string(change)?.into(),
				now.clone().into(),
			],
		))
		.await?;

		txn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"INSERT INTO sync_watermarks (workspace_id, applied_sequence, updated_at)
			VALUES (?, ?, ?)
			ON CONFLICT (workspace_id) DO UPDATE SET
				applied_sequence = excluded.applied_sequence,
				updated_at = excluded.updated_at
			WHERE excluded.applied_sequence > sync_watermarks.applied_sequence",
			vec![
				self.workspace_id.to_string().into(),
				sequence_to_db(change.sequence).into(),
				now.into(),
			],
		))
		.await?;

		txn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"DELETE FROM incoming_changes WHERE workspace_id = ? AND sequence <= ?",
			vec![
				self.workspace_id.to_string().into(),
				sequence_to_db(change.sequence).into(),
			],
		))
		.await?;

		txn.commit().await?;

		Ok(true)
	}

	/// Applied history in sequence order. Older updates superseded by a newer change to the same
	/// node may have been compacted away by [`Self::prune`].
	pub async fn applied_changes(&self) -> Result<Vec<Change>, Error> {
		self.db
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT change FROM applied_changes WHERE workspace_id = ? ORDER BY sequence ASC",
				vec![self.workspace_id.to_string().into()],
			))
			.await?
			.iter()
			.map(|row| {
				let raw: String = row.try_get("", "change")?;
				serde_json::from_str(&raw).map_err(Error::from)
			})
			.collect()
	}

	/// Keeps changes that arrived ahead of the watermark until the gap before them closes.
	pub async fn stage_incoming(&self, changes: &[Change]) -> Result<(), Error> {
		let now = format_timestamp(Utc::now());

		let txn = self.db.begin().await?;
		for change in changes {
			txn.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"INSERT OR IGNORE INTO incoming_changes (workspace_id, sequence, change, received_at)
				VALUES (?, ?, ?, ?)",
				vec![
					self.workspace_id.to_string().into(),
					sequence_to_db(change.sequence).into(),
					serde_json::to_string(change)?.into(),
					now.clone().into(),
				],
			))
			.await?;
		}
		txn.commit().await?;

		Ok(())
	}

	/// The staged change that directly follows `after`, if it already arrived.
	pub async fn next_incoming(&self, after: Sequence) -> Result<Option<Change>, Error> {
		self.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT change FROM incoming_changes WHERE workspace_id = ? AND sequence = ?",
				vec![
					self.workspace_id.to_string().into(),
					sequence_to_db(after + 1).into(),
				],
			))
			.await?
			.map(|row| {
				let raw: String = row.try_get("", "change")?;
				serde_json::from_str(&raw).map_err(Error::from)
			})
			.transpose()
	}

	/// Lowest staged sequence. With the watermark it gives the bounds of the current gap.
	pub async fn lowest_incoming(&self) -> Result<Option<Sequence>, Error> {
		self.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT MIN(sequence) AS sequence FROM incoming_changes WHERE workspace_id = ?",
				vec![self.workspace_id.to_string().into()],
			))
			.await?
			.map(|row| row.try_get::<Option<i64>>("", "sequence"))
			.transpose()?
			.flatten()
			.map(sequence_from_db)
			.transpose()
	}

	pub async fn discard_incoming_through(&self, sequence: Sequence) -> Result<u64, Error> {
		Ok(self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"DELETE FROM incoming_changes WHERE workspace_id = ? AND sequence <= ?",
				vec![
					self.workspace_id.to_string().into(),
					sequence_to_db(sequence).into(),
				],
			))
			.await?
			.rows_affected())
	}

	pub async fn clear_incoming(&self) -> Result<u64, Error> {
		Ok(self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"DELETE FROM incoming_changes WHERE workspace_id = ?",
				vec![self.workspace_id.to_string().into()],
			))
			.await?
			.rows_affected())
	}

	/// Drops acknowledged changes older than `retention` and compacts the applied history.
	///
	/// Pending and failed changes are never touched. From the applied history only updates that
	/// a newer change to the same node supersedes are removed, so every node keeps its creation,
	/// its latest version and its deletion.
	#[instrument(skip(self), fields(workspace_id = %self.workspace_id), err)]
	pub async fn prune(&self, retention: Duration) -> Result<PruneStats, Error> {
		let Some(cutoff) = TimeDelta::from_std(retention)
			.ok()
			.and_then(|retention| Utc::now().checked_sub_signed(retention))
		else {
			return Ok(PruneStats::default());
		};
		let cutoff = format_timestamp(cutoff);

		let acknowledged = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"DELETE FROM pending_changes
				WHERE workspace_id = ? AND status = ? AND updated_at < ?",
				vec![
					self.workspace_id.to_string().into(),
					ChangeStatus::Acknowledged.to_string().into(),
					cutoff.clone().into(),
				],
			))
			.await?
			.rows_affected();

		let applied = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"DELETE FROM applied_changes
				WHERE workspace_id = ? AND mutation_type = 'update' AND applied_at < ?
					AND EXISTS (
						SELECT 1 FROM applied_changes AS newer
						WHERE newer.workspace_id = applied_changes.workspace_id
							AND newer.node_id = applied_changes.node_id
							AND newer.sequence > applied_changes.sequence
					)",
				vec![self.workspace_id.to_string().into(), cutoff.into()],
			))
			.await?
			.rows_affected();

		let stats = PruneStats {
			acknowledged,
			applied,
		};

		if stats != PruneStats::default() {
			info!(?stats, "Pruned change log");
		}

		Ok(stats)
	}
}

fn pending_from_row(row: &QueryResult) -> Result<PendingChange, Error> {
	let error_kind: Option<String> = row.try_get("", "error_kind")?;
	let last_error: Option<String> = row.try_get("", "last_error")?;

	let last_error = match (error_kind, last_error) {
		(Some(kind), message) => Some(ErrorObject::new(
			parse_column::<ErrorKind>("error_kind", &kind)?,
			message.unwrap_or_default(),
		)),
		(None, _) => None,
	};

	let retry_count: i64 = row.try_get("", "retry_count")?;

	Ok(PendingChange {
		position: row.try_get("", "id")?,
		local_id: parse_column("local_id", &row.try_get::<String>("", "local_id")?)?,
		workspace_id: parse_column("workspace_id", &row.try_get::<String>("", "workspace_id")?)?,
		node_id: parse_column("node_id", &row.try_get::<String>("", "node_id")?)?,
		created_by: parse_column("created_by", &row.try_get::<String>("", "created_by")?)?,
		mutation: serde_json::from_str(&row.try_get::<String>("", "mutation")?)?,
		base_revision: row
			.try_get::<Option<i64>>("", "base_revision")?
			.map(sequence_from_db)
			.transpose()?,
		status: parse_column("status", &row.try_get::<String>("", "status")?)?,
		retry_count: u32::try_from(retry_count).map_err(|_| Error::InvalidStoredValue {
			field: "retry_count",
			value: retry_count.to_string(),
		})?,
		sequence: row
			.try_get::<Option<i64>>("", "sequence")?
			.map(sequence_from_db)
			.transpose()?,
		last_error,
		created_at: parse_timestamp("created_at", &row.try_get::<String>("", "created_at")?)?,
		updated_at: parse_timestamp("updated_at", &row.try_get::<String>("", "updated_at")?)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::db::open_database;

	use serde_json::json;
	use td_core_shared_types::NodeType;
	use tempfile::TempDir;

	async fn open_log() -> (TempDir, LocalChangeLog) {
		let dir = TempDir::new().unwrap();
		let db = open_database(dir.path().join("workspace.db")).await.unwrap();
		let log = LocalChangeLog::open(db, WorkspaceId::new()).await.unwrap();
		(dir, log)
	}

	fn update(node_id: NodeId, text: &str) -> NewChange {
		NewChange {
			node_id,
			created_by: AccountId::new(),
			mutation: NodeMutation::Update {
				attributes: json!({ "text": text }),
				mentions: vec![],
			},
			base_revision: None,
		}
	}

	fn applied(log: &LocalChangeLog, sequence: Sequence, node_id: NodeId, mutation: NodeMutation) -> Change {
		Change {
			id: ChangeId::new(),
			workspace_id: log.workspace_id(),
			node_id,
			node_type: NodeType::Message,
			created_by: AccountId::new(),
			mutation,
			sequence,
			created_at: Utc::now(),
		}
	}

	#[tokio::test]
	async fn pending_changes_come_back_in_append_order() {
		let (_dir, log) = open_log().await;
		let node_id = NodeId::new();

		let mut appended = vec![];
		for i in 0..5 {
			appended.push(log.append(update(node_id, &i.to_string())).await.unwrap());
		}

		let all = log.pending_since(0, 100).await.unwrap();
		assert_eq!(
			all.iter().map(|c| c.local_id).collect::<Vec<_>>(),
			appended.iter().map(|c| c.local_id).collect::<Vec<_>>()
		);

		let page = log.pending_since(appended[1].position, 2).await.unwrap();
		assert_eq!(
			page.iter().map(|c| c.local_id).collect::<Vec<_>>(),
			vec![appended[2].local_id, appended[3].local_id]
		);

		assert!(log.mark_acknowledged(appended[0].local_id, 1).await.unwrap());
		assert_eq!(log.pending_count().await.unwrap(), 4);
		assert_eq!(log.pending_since(0, 1).await.unwrap()[0].local_id, appended[1].local_id);
	}

	#[tokio::test]
	async fn invalid_mutations_are_never_appended() {
		let (_dir, log) = open_log().await;

		let err = log
			.append(NewChange {
				node_id: NodeId::new(),
				created_by: AccountId::new(),
				mutation: NodeMutation::Update {
					attributes: json!([1, 2]),
					mentions: vec![],
				},
				base_revision: None,
			})
			.await
			.unwrap_err();

		assert_eq!(err.kind(), ErrorKind::Validation);
		assert_eq!(log.pending_count().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn failed_changes_stay_until_retried_or_dismissed() {
		let (_dir, log) = open_log().await;
		let node_id = NodeId::new();

		let first = log.append(update(node_id, "a")).await.unwrap();
		let second = log.append(update(node_id, "b")).await.unwrap();

		assert_eq!(log.record_attempt(first.local_id).await.unwrap(), 1);
		assert_eq!(log.record_attempt(first.local_id).await.unwrap(), 2);

		let conflict = ErrorObject::conflict("stale revision");
		assert!(log.mark_failed(first.local_id, &conflict).await.unwrap());
		// only pending changes can fail or be acknowledged
		assert!(!log.mark_failed(first.local_id, &conflict).await.unwrap());
		assert!(!log.mark_acknowledged(first.local_id, 3).await.unwrap());

		let failed = log.failed().await.unwrap();
		assert_eq!(failed.len(), 1);
		assert_eq!(failed[0].status, ChangeStatus::Failed);
		assert_eq!(failed[0].last_error, Some(conflict.clone()));

		// an old enough retention still never prunes failed or pending entries
		log.prune(Duration::ZERO).await.unwrap();
		assert_eq!(log.failed().await.unwrap().len(), 1);
		assert_eq!(log.pending_count().await.unwrap(), 1);

		let retried = log.retry_failed(first.local_id).await.unwrap();
		assert_eq!(retried.status, ChangeStatus::Pending);
		assert_eq!(retried.retry_count, 0);
		assert_eq!(retried.last_error, None);
		assert_eq!(
			log.pending_since(0, 10)
				.await
				.unwrap()
				.iter()
				.map(|c| c.local_id)
				.collect::<Vec<_>>(),
			vec![first.local_id, second.local_id]
		);

		assert!(log.mark_failed(second.local_id, &conflict).await.unwrap());
		log.dismiss_failed(second.local_id).await.unwrap();
		assert!(log.get(second.local_id).await.unwrap().is_none());
		assert!(matches!(
			log.dismiss_failed(first.local_id).await,
			Err(Error::ChangeNotFound(_))
		));
	}

	#[tokio::test]
	async fn watermark_only_moves_forward_one_change_at_a_time() {
		let (_dir, log) = open_log().await;
		let node_id = NodeId::new();

		assert_eq!(log.watermark().await.unwrap(), 0);

		let first = applied(&log, 1, node_id, NodeMutation::Delete);
		assert!(log.commit_applied(&first).await.unwrap());
		assert!(!log.commit_applied(&first).await.unwrap());
		assert_eq!(log.watermark().await.unwrap(), 1);

		let skipping = applied(&log, 3, node_id, NodeMutation::Delete);
		assert!(log.commit_applied(&skipping).await.is_err());
		assert_eq!(log.watermark().await.unwrap(), 1);
		assert_eq!(log.applied_changes().await.unwrap(), vec![first]);
	}

	#[tokio::test]
	async fn staged_changes_fill_in_once_the_gap_closes() {
		let (_dir, log) = open_log().await;
		let node_id = NodeId::new();

		let staged = [5, 6, 8].map(|seq| applied(&log, seq, node_id, NodeMutation::Delete));
		log.stage_incoming(&staged).await.unwrap();
		// staging twice is harmless
		log.stage_incoming(&staged[..1]).await.unwrap();

		assert_eq!(log.lowest_incoming().await.unwrap(), Some(5));
		assert_eq!(log.next_incoming(4).await.unwrap(), Some(staged[0].clone()));
		assert_eq!(log.next_incoming(6).await.unwrap(), None);

		assert_eq!(log.discard_incoming_through(6).await.unwrap(), 2);
		assert_eq!(log.lowest_incoming().await.unwrap(), Some(8));

		assert_eq!(log.clear_incoming().await.unwrap(), 1);
		assert_eq!(log.lowest_incoming().await.unwrap(), None);
	}

	#[tokio::test]
	async fn prune_compacts_superseded_updates_only() {
		let (_dir, log) = open_log().await;
		let node_id = NodeId::new();
		let other_node = NodeId::new();

		let history = [
			applied(
				&log,
				1,
				node_id,
				NodeMutation::Create {
					node_type: NodeType::Channel,
					parent_id: None,
					attributes: json!({}),
					mentions: vec![],
				},
			),
			applied(&log, 2, node_id, NodeMutation::Update { attributes: json!({ "v": 1 }), mentions: vec![] }),
			applied(&log, 3, other_node, NodeMutation::Update { attributes: json!({}), mentions: vec![] }),
			applied(&log, 4, node_id, NodeMutation::Update { attributes: json!({ "v": 2 }), mentions: vec![] }),
		];
		for change in &history {
			assert!(log.commit_applied(change).await.unwrap());
		}

		let acked = log.append(update(node_id, "x")).await.unwrap();
		log.mark_acknowledged(acked.local_id, 5).await.unwrap();

		// nothing is old enough yet
		assert_eq!(
			log.prune(Duration::from_secs(3600)).await.unwrap(),
			PruneStats::default()
		);

		tokio::time::sleep(Duration::from_millis(5)).await;

		assert_eq!(
			log.prune(Duration::ZERO).await.unwrap(),
			PruneStats {
				acknowledged: 1,
				applied: 1,
			}
		);
		assert_eq!(
			log.applied_changes()
				.await
				.unwrap()
				.iter()
				.map(|c| c.sequence)
				.collect::<Vec<_>>(),
			vec![1, 3, 4]
		);
		assert!(log.get(acked.local_id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn log_survives_reopening() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("workspace.db");
		let workspace_id = WorkspaceId::new();

		let appended = {
			let log = LocalChangeLog::open(open_database(&path).await.unwrap(), workspace_id)
				.await
				.unwrap();
			log.append(update(NodeId::new(), "durable")).await.unwrap()
		};

		let log = LocalChangeLog::open(open_database(&path).await.unwrap(), workspace_id)
			.await
			.unwrap();
		let pending = log.pending_since(0, 10).await.unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].local_id, appended.local_id);
		assert_eq!(pending[0].mutation, appended.mutation);
	}
}
