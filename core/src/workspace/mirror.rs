//! Local copy of the workspace's nodes, as of the last applied server change, plus the user's
//! own interactions with them.

use crate::CoreError;

use td_core_shared_types::{
	AccountId, Change, Interaction, InteractionKind, NodeId, NodeMutation, NodeType, Sequence,
	WorkspaceId,
};
use td_core_sync::db::{
	format_timestamp, parse_column, parse_timestamp, sequence_from_db, sequence_to_db,
};

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

const SCHEMA: &[&str] = &[
	"CREATE TABLE IF NOT EXISTS nodes (
		workspace_id TEXT NOT NULL,
		node_id TEXT NOT NULL,
		node_type TEXT NOT NULL,
		parent_id TEXT,
		attributes TEXT NOT NULL,
		created_by TEXT NOT NULL,
		revision INTEGER NOT NULL,
		deleted INTEGER NOT NULL DEFAULT 0,
		updated_at TEXT NOT NULL,
		PRIMARY KEY (workspace_id, node_id)
	)",
	"CREATE INDEX IF NOT EXISTS nodes_parent ON nodes (workspace_id, parent_id)",
	"CREATE TABLE IF NOT EXISTS interactions (
		workspace_id TEXT NOT NULL,
		node_id TEXT NOT NULL,
		account_id TEXT NOT NULL,
		kind TEXT NOT NULL,
		sequence INTEGER NOT NULL,
		occurred_at TEXT NOT NULL
	)",
	"CREATE INDEX IF NOT EXISTS interactions_account ON interactions (workspace_id, account_id)",
];

const SEEN: &str = "seen";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalNode {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub node_type: NodeType,
	pub parent_id: Option<NodeId>,
	pub attributes: Value,
	pub created_by: AccountId,
	/// Sequence of the last server change applied to this node.
	pub revision: Sequence,
	pub deleted: bool,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NodeMirror {
	db: DatabaseConnection,
	workspace_id: WorkspaceId,
}

impl NodeMirror {
	pub async fn open(
		db: DatabaseConnection,
		workspace_id: WorkspaceId,
	) -> Result<Self, CoreError> {
		for statement in SCHEMA {
			db.execute_unprepared(statement).await?;
		}

		Ok(Self { db, workspace_id })
	}

	/// Applies a server change. Returns the node as it is afterwards, or `None` when the node
	/// already reflects this change or a newer one.
	pub async fn apply(&self, change: &Change) -> Result<Option<LocalNode>, CoreError> {
		if self
			.node(change.node_id)
			.await?
			.is_some_and(|node| node.revision >= change.sequence)
		{
			trace!(node_id = %change.node_id, sequence = change.sequence, "Change already mirrored");
			return Ok(None);
		}

		let now = format_timestamp(Utc::now());
		let mut values = vec![
			self.workspace_id.to_string().into(),
			change.node_id.to_string().into(),
			change.node_type.to_string().into(),
		];

		// Updates and deletes of a node we never saw created still leave a row behind, so later
		// changes to it have a revision to compare against
		let sql = match &change.mutation {
			NodeMutation::Create {
				parent_id,
				attributes,
				..
			} => {
				values.extend([
					parent_id.map(|id| id.to_string()).into(),
					serde_json::to_string(attributes)?.into(),
				]);

				"INSERT INTO nodes
					(workspace_id, node_id, node_type, parent_id, attributes, created_by, revision,
						deleted, updated_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
				ON CONFLICT (workspace_id, node_id) DO UPDATE SET
					node_type = excluded.node_type,
					parent_id = excluded.parent_id,
					attributes = excluded.attributes,
					created_by = excluded.created_by,
					revision = excluded.revision,
					updated_at = excluded.updated_at"
			}

			NodeMutation::Update { attributes, .. } => {
				values.extend([
					None::<String>.into(),
					serde_json::to_string(attributes)?.into(),
				]);

				"INSERT INTO nodes
					(workspace_id, node_id, node_type, parent_id, attributes, created_by, revision,
						deleted, updated_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
				ON CONFLICT (workspace_id, node_id) DO UPDATE SET
					attributes = excluded.attributes,
					revision = excluded.revision,
					updated_at = excluded.updated_at"
			}

			NodeMutation::Delete => {
				values.extend([None::<String>.into(), "{}".into()]);

				"INSERT INTO nodes
					(workspace_id, node_id, node_type, parent_id, attributes, created_by, revision,
						deleted, updated_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
				ON CONFLICT (workspace_id, node_id) DO UPDATE SET
					deleted = 1,
					revision = excluded.revision,
					updated_at = excluded.updated_at"
			}
		};

		values.extend([
			change.created_by.to_string().into(),
			sequence_to_db(change.sequence).into(),
			now.into(),
		]);

		self.db
			.execute(Statement::from_sql_and_values(DbBackend::Sqlite, sql, values))
			.await?;

		self.node(change.node_id).await
	}

	/// The node, deleted or not.
	pub async fn node(&self, node_id: NodeId) -> Result<Option<LocalNode>, CoreError> {
		self.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT * FROM nodes WHERE workspace_id = ? AND node_id = ?",
				vec![
					self.workspace_id.to_string().into(),
					node_id.to_string().into(),
				],
			))
			.await?
			.as_ref()
			.map(node_from_row)
			.transpose()
	}

	/// Live children of `parent_id`, oldest revision first.
	pub async fn children(&self, parent_id: NodeId) -> Result<Vec<LocalNode>, CoreError> {
		self.db
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT * FROM nodes
				WHERE workspace_id = ? AND parent_id = ? AND deleted = 0
				ORDER BY revision ASC",
				vec![
					self.workspace_id.to_string().into(),
					parent_id.to_string().into(),
				],
			))
			.await?
			.iter()
			.map(node_from_row)
			.collect()
	}

	/// Highest revision of any mirrored node. Ahead of the change log watermark only while a
	/// change is between being mirrored and being committed.
	pub async fn max_revision(&self) -> Result<Sequence, CoreError> {
		self.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT MAX(revision) AS revision FROM nodes WHERE workspace_id = ?",
				vec![self.workspace_id.to_string().into()],
			))
			.await?
			.map(|row| row.try_get::<Option<i64>>("", "revision"))
			.transpose()?
			.flatten()
			.map(sequence_from_db)
			.transpose()
			.map(Option::unwrap_or_default)
			.map_err(Into::into)
	}

	pub async fn record_interaction(&self, interaction: &Interaction) -> Result<(), CoreError> {
		let InteractionKind::Seen { sequence } = interaction.kind;

		self.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"INSERT INTO interactions (workspace_id, node_id, account_id, kind, sequence, occurred_at)
				VALUES (?, ?, ?, ?, ?, ?)",
				vec![
					interaction.workspace_id.to_string().into(),
					interaction.node_id.to_string().into(),
					interaction.account_id.to_string().into(),
					SEEN.into(),
					sequence_to_db(sequence).into(),
					format_timestamp(interaction.occurred_at).into(),
				],
			))
			.await?;

		Ok(())
	}

	/// Every interaction of `account_id`, oldest first.
	pub async fn interactions(&self, account_id: AccountId) -> Result<Vec<Interaction>, CoreError> {
		self.db
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT * FROM interactions
				WHERE workspace_id = ? AND account_id = ?
				ORDER BY occurred_at ASC, rowid ASC",
				vec![
					self.workspace_id.to_string().into(),
					account_id.to_string().into(),
				],
			))
			.await?
			.iter()
			.map(interaction_from_row)
			.collect()
	}
}

fn node_from_row(row: &QueryResult) -> Result<LocalNode, CoreError> {
	Ok(LocalNode {
		workspace_id: parse_column("workspace_id", &row.try_get::<String>("", "workspace_id")?)?,
		node_id: parse_column("node_id", &row.try_get::<String>("", "node_id")?)?,
		node_type: parse_column("node_type", &row.try_get::<String>("", "node_type")?)?,
		parent_id: row
			.try_get::<Option<String>>("", "parent_id")?
			.map(|id| parse_column("parent_id", &id))
			.transpose()?,
		attributes: serde_json::from_str(&row.try_get::<String>("", "attributes")?)?,
		created_by: parse_column("created_by", &row.try_get::<String>("", "created_by")?)?,
		revision: sequence_from_db(row.try_get("", "revision")?)?,
		deleted: row.try_get::<i64>("", "deleted")? != 0,
		updated_at: parse_timestamp("updated_at", &row.try_get::<String>("", "updated_at")?)?,
	})
}

fn interaction_from_row(row: &QueryResult) -> Result<Interaction, CoreError> {
	let kind = row.try_get::<String>("", "kind")?;
	if kind != SEEN {
		return Err(td_core_sync::Error::InvalidStoredValue {
			field: "kind",
			value: kind,
		}
		.into());
	}

	Ok(Interaction {
		workspace_id: parse_column("workspace_id", &row.try_get::<String>("", "workspace_id")?)?,
		node_id: parse_column("node_id", &row.try_get::<String>("", "node_id")?)?,
		account_id: parse_column("account_id", &row.try_get::<String>("", "account_id")?)?,
		kind: InteractionKind::Seen {
			sequence: sequence_from_db(row.try_get("", "sequence")?)?,
		},
		occurred_at: parse_timestamp("occurred_at", &row.try_get::<String>("", "occurred_at")?)?,
	})
}
