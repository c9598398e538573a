//! Authoritative change stream and node state, one SQLite database for every workspace.

use crate::Error;

use td_core_outbox::{NodeCleanup, OutboxStore, SendEmail};
use td_core_shared_types::{
	AccountId, Change, ChangeId, ErrorObject, NodeId, NodeMutation, NodeType, Sequence,
	WorkspaceId,
};
use td_core_sync::{
	db::{format_timestamp, parse_column, parse_timestamp, sequence_from_db, sequence_to_db},
	wire::MutationEnvelope,
};

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
	ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, QueryResult, Statement,
	TransactionTrait,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

const CHANGE_COLUMNS: &str =
	"id, workspace_id, node_id, node_type, created_by, mutation, sequence, created_at";

/// What became of a submitted mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
	/// Sequenced and stored. `tasks` outbox tasks were queued along with it.
	Applied { change: Change, tasks: usize },
	/// The change id was sequenced before, this is a resend.
	Duplicate(Change),
	Rejected(ErrorObject),
}

/// Latest server state of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNode {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub node_type: NodeType,
	pub parent_id: Option<NodeId>,
	pub attributes: serde_json::Value,
	pub created_by: AccountId,
	/// Sequence of the last change that touched the node.
	pub revision: Sequence,
	pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct ServerStore {
	db: DatabaseConnection,
	write_lock: Arc<Mutex<()>>,
}

impl ServerStore {
	/// Prepares the change tables, and the outbox tables that share their transactions.
	pub async fn open(db: DatabaseConnection) -> Result<Self, Error> {
		for statement in [
			"CREATE TABLE IF NOT EXISTS workspace_sequences (
				workspace_id TEXT PRIMARY KEY,
				last_sequence INTEGER NOT NULL
			)",
			"CREATE TABLE IF NOT EXISTS changes (
				workspace_id TEXT NOT NULL,
				sequence INTEGER NOT NULL,
				id TEXT NOT NULL UNIQUE,
				node_id TEXT NOT NULL,
				node_type TEXT NOT NULL,
				created_by TEXT NOT NULL,
				mutation TEXT NOT NULL,
				created_at TEXT NOT NULL,
				PRIMARY KEY (workspace_id, sequence)
			)",
			"CREATE TABLE IF NOT EXISTS nodes (
				workspace_id TEXT NOT NULL,
				node_id TEXT NOT NULL,
				node_type TEXT NOT NULL,
				parent_id TEXT,
				attributes TEXT NOT NULL,
				created_by TEXT NOT NULL,
				revision INTEGER NOT NULL,
				deleted INTEGER NOT NULL DEFAULT 0,
				PRIMARY KEY (workspace_id, node_id)
			)",
		] {
			db.execute_unprepared(statement).await?;
		}

		OutboxStore::open(db.clone()).await?;

		Ok(Self {
			db,
			write_lock: Arc::new(Mutex::new(())),
		})
	}

	#[must_use]
	pub const fn db(&self) -> &DatabaseConnection {
		&self.db
	}

	/// Validates `envelope` against the current node state and, if it holds, stores it as the
	/// workspace's next change. Writers are serialized so sequences are assigned without holes.
	#[instrument(skip_all, fields(change_id = %envelope.id, workspace_id = %envelope.workspace_id), err)]
	pub async fn apply_mutation(
		&self,
		account_id: AccountId,
		envelope: &MutationEnvelope,
	) -> Result<MutationOutcome, Error> {
		let _guard = self.write_lock.lock().await;
		let txn = self.db.begin().await?;

		if let Some(existing) = change_by_id(&txn, envelope.id).await? {
			txn.rollback().await?;

			return Ok(if existing.workspace_id == envelope.workspace_id {
				debug!(sequence = existing.sequence, "Resent change already sequenced");
				MutationOutcome::Duplicate(existing)
			} else {
				MutationOutcome::Rejected(ErrorObject::conflict(
					"change id already used in another workspace",
				))
			});
		}

		let node_type = match check_mutation(&txn, envelope).await? {
			Ok(node_type) => node_type,
			Err(error) => {
				txn.rollback().await?;
				return Ok(MutationOutcome::Rejected(error));
			}
		};

		let sequence = next_sequence(&txn, envelope.workspace_id).await?;

		let change = Change {
			id: envelope.id,
			workspace_id: envelope.workspace_id,
			node_id: envelope.node_id,
			node_type,
			created_by: account_id,
			mutation: envelope.mutation.clone(),
			sequence,
			created_at: Utc::now(),
		};

		insert_change(&txn, &change).await?;
		write_node(&txn, &change).await?;
		let tasks = enqueue_effects(&txn, &change).await?;

		txn.commit().await?;

		debug!(sequence, tasks, "Change sequenced");

		Ok(MutationOutcome::Applied { change, tasks })
	}

	/// Up to `limit` changes after `after_sequence`, and whether more follow.
	pub async fn changes_after(
		&self,
		workspace_id: WorkspaceId,
		after_sequence: Sequence,
		limit: u32,
	) -> Result<(Vec<Change>, bool), Error> {
		let mut changes = self
			.db
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!(
					"SELECT {CHANGE_COLUMNS} FROM changes
					WHERE workspace_id = ? AND sequence > ?
					ORDER BY sequence
					LIMIT ?"
				),
				vec![
					workspace_id.to_string().into(),
					sequence_to_db(after_sequence).into(),
					(i64::from(limit) + 1).into(),
				],
			))
			.await?
			.iter()
			.map(change_from_row)
			.collect::<Result<Vec<_>, _>>()?;

		let limit = usize::try_from(limit).unwrap_or(usize::MAX);
		let has_more = changes.len() > limit;
		changes.truncate(limit);

		Ok((changes, has_more))
	}

	pub async fn last_sequence(&self, workspace_id: WorkspaceId) -> Result<Sequence, Error> {
		let Some(row) = self
			.db
			.query_one(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT last_sequence FROM workspace_sequences WHERE workspace_id = ?",
				vec![workspace_id.to_string().into()],
			))
			.await?
		else {
			return Ok(0);
		};

		Ok(sequence_from_db(row.try_get("", "last_sequence")?)?)
	}

	pub async fn node(
		&self,
		workspace_id: WorkspaceId,
		node_id: NodeId,
	) -> Result<Option<ServerNode>, Error> {
		node_by_id(&self.db, workspace_id, node_id).await
	}

	/// Every node of the workspace, deleted ones included, in id order.
	pub async fn nodes(&self, workspace_id: WorkspaceId) -> Result<Vec<ServerNode>, Error> {
		self.db
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT * FROM nodes WHERE workspace_id = ? ORDER BY node_id",
				vec![workspace_id.to_string().into()],
			))
			.await?
			.iter()
			.map(node_from_row)
			.collect()
	}
}

/// Returns the node type the change applies to, or why it can't be applied.
async fn check_mutation(
	txn: &DatabaseTransaction,
	envelope: &MutationEnvelope,
) -> Result<Result<NodeType, ErrorObject>, Error> {
	if let Err(e) = envelope.mutation.validate(envelope.node_id) {
		return Ok(Err(ErrorObject::validation(e.to_string())));
	}

	let node = node_by_id(txn, envelope.workspace_id, envelope.node_id).await?;

	if let NodeMutation::Create {
		node_type,
		parent_id,
		..
	} = &envelope.mutation
	{
		if node.is_some() {
			return Ok(Err(ErrorObject::conflict(format!(
				"node {} already exists",
				envelope.node_id
			))));
		}

		if let Some(parent_id) = parent_id {
			let parent = node_by_id(txn, envelope.workspace_id, *parent_id).await?;
			if !parent.is_some_and(|parent| !parent.deleted) {
				return Ok(Err(ErrorObject::not_found(format!(
					"parent node {parent_id} not found"
				))));
			}
		}

		return Ok(Ok(*node_type));
	}

	let Some(node) = node else {
		return Ok(Err(ErrorObject::not_found(format!(
			"node {} not found",
			envelope.node_id
		))));
	};

	if node.deleted {
		return Ok(Err(ErrorObject::conflict(format!(
			"node {} was deleted",
			envelope.node_id
		))));
	}

	if let Some(base_revision) = envelope.base_revision {
		if base_revision != node.revision {
			return Ok(Err(ErrorObject::conflict(format!(
				"node revision is {}, change was based on {base_revision}",
				node.revision
			))));
		}
	}

	Ok(Ok(node.node_type))
}

async fn next_sequence(
	txn: &DatabaseTransaction,
	workspace_id: WorkspaceId,
) -> Result<Sequence, Error> {
	let row = txn
		.query_one(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"INSERT INTO workspace_sequences (workspace_id, last_sequence) VALUES (?, 1)
			ON CONFLICT (workspace_id) DO UPDATE SET last_sequence = last_sequence + 1
			RETURNING last_sequence",
			vec![workspace_id.to_string().into()],
		))
		.await?
		.ok_or_else(|| sea_orm::DbErr::RecordNotInserted)?;

	Ok(sequence_from_db(row.try_get("", "last_sequence")?)?)
}

async fn insert_change(txn: &DatabaseTransaction, change: &Change) -> Result<(), Error> {
	txn.execute(Statement::from_sql_and_values(
		DbBackend::Sqlite,
		"INSERT INTO changes
			(workspace_id, sequence, id, node_id, node_type, created_by, mutation, created_at)
		VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
		vec![
			change.workspace_id.to_string().into(),
			sequence_to_db(change.sequence).into(),
			change.id.to_string().into(),
			change.node_id.to_string().into(),
			change.node_type.to_string().into(),
			change.created_by.to_string().into(),
			serde_json::to_string(&change.mutation)?.into(),
			format_timestamp(change.created_at).into(),
		],
	))
	.await?;

	Ok(())
}

async fn write_node(txn: &DatabaseTransaction, change: &Change) -> Result<(), Error> {
	let statement = match &change.mutation {
		NodeMutation::Create {
			node_type,
			parent_id,
			attributes,
			..
		} => Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"INSERT INTO nodes
				(workspace_id, node_id, node_type, parent_id, attributes, created_by, revision)
			VALUES (?, ?, ?, ?, ?, ?, ?)",
			vec![
				change.workspace_id.to_string().into(),
				change.node_id.to_string().into(),
				node_type.to_string().into(),
				parent_id.map(|id| id.to_string()).into(),
				serde_json::to_string(attributes)?.into(),
				change.created_by.to_string().into(),
				sequence_to_db(change.sequence).into(),
			],
		),

		NodeMutation::Update { attributes, .. } => Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"UPDATE nodes SET attributes = ?, revision = ? WHERE workspace_id = ? AND node_id = ?",
			vec![
				serde_json::to_string(attributes)?.into(),
				sequence_to_db(change.sequence).into(),
				change.workspace_id.to_string().into(),
				change.node_id.to_string().into(),
			],
		),

		NodeMutation::Delete => Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"UPDATE nodes SET deleted = 1, revision = ? WHERE workspace_id = ? AND node_id = ?",
			vec![
				sequence_to_db(change.sequence).into(),
				change.workspace_id.to_string().into(),
				change.node_id.to_string().into(),
			],
		),
	};

	txn.execute(statement).await?;

	Ok(())
}

/// Queues the side effects of `change`: a mention email per mentioned account other than the
/// author, and a cleanup when a node goes away.
async fn enqueue_effects(txn: &DatabaseTransaction, change: &Change) -> Result<usize, Error> {
	let mut tasks = Vec::new();

	for recipient in change.mutation.mentions() {
		if *recipient == change.created_by {
			continue;
		}

		tasks.push(
			SendEmail {
				workspace_id: change.workspace_id,
				recipient: *recipient,
				mentioned_by: change.created_by,
				node_id: change.node_id,
				change_id: change.id,
			}
			.into_task()?,
		);
	}

	if matches!(change.mutation, NodeMutation::Delete) {
		tasks.push(
			NodeCleanup {
				workspace_id: change.workspace_id,
				node_id: change.node_id,
				change_id: change.id,
			}
			.into_task()?,
		);
	}

	let mut queued = 0;
	for task in tasks {
		if OutboxStore::enqueue_on(txn, task).await? {
			queued += 1;
		}
	}

	Ok(queued)
}

async fn change_by_id(
	txn: &DatabaseTransaction,
	change_id: ChangeId,
) -> Result<Option<Change>, Error> {
	txn.query_one(Statement::from_sql_and_values(
		DbBackend::Sqlite,
		format!("SELECT {CHANGE_COLUMNS} FROM changes WHERE id = ?"),
		vec![change_id.to_string().into()],
	))
	.await?
	.as_ref()
	.map(change_from_row)
	.transpose()
}

async fn node_by_id<C: ConnectionTrait>(
	conn: &C,
	workspace_id: WorkspaceId,
	node_id: NodeId,
) -> Result<Option<ServerNode>, Error> {
	conn.query_one(Statement::from_sql_and_values(
		DbBackend::Sqlite,
		"SELECT * FROM nodes WHERE workspace_id = ? AND node_id = ?",
		vec![workspace_id.to_string().into(), node_id.to_string().into()],
	))
	.await?
	.as_ref()
	.map(node_from_row)
	.transpose()
}

fn change_from_row(row: &QueryResult) -> Result<Change, Error> {
	let created_at: String = row.try_get("", "created_at")?;

	Ok(Change {
		id: parse_column("id", &row.try_get::<String>("", "id")?)?,
		workspace_id: parse_column("workspace_id", &row.try_get::<String>("", "workspace_id")?)?,
		node_id: parse_column("node_id", &row.try_get::<String>("", "node_id")?)?,
		node_type: parse_column("node_type", &row.try_get::<String>("", "node_type")?)?,
		created_by: parse_column("created_by", &row.try_get::<String>("", "created_by")?)?,
		mutation: serde_json::from_str(&row.try_get::<String>("", "mutation")?)?,
		sequence: sequence_from_db(row.try_get("", "sequence")?)?,
		created_at: parse_timestamp("created_at", &created_at)?,
	})
}

fn node_from_row(row: &QueryResult) -> Result<ServerNode, Error> {
	Ok(ServerNode {
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
	})
}
