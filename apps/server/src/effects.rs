//! Handlers for the side effects the sync server queues in its outbox.

use td_core_outbox::{NodeCleanup, OutboxHandler, OutboxTask, SendEmail, TaskError};

use std::{
	io::{self, ErrorKind, Write},
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use tempfile::Builder;
use tokio::{fs, task::spawn_blocking};
use tracing::{debug, info};

/// Drops mention emails into a spool directory, one file per dedupe key, for the mailer to pick
/// up.
///
/// Mail is written to a hidden `.partial` file and renamed into place, so the mailer only ever
/// sees complete `.json` files. A run that dies mid-write leaves a `.partial` behind and the
/// retry writes a fresh one.
pub struct MailSpool {
	dir: PathBuf,
}

impl MailSpool {
	pub const fn new(dir: PathBuf) -> Self {
		Self { dir }
	}
}

#[async_trait]
impl OutboxHandler for MailSpool {
	async fn handle(&self, task: &OutboxTask) -> Result<(), TaskError> {
		let email: SendEmail = task.payload()?;

		fs::create_dir_all(&self.dir)
			.await
			.map_err(|e| TaskError::Retryable(e.to_string()))?;

		let path = self.dir.join(format!("{}.json", task.dedupe_key.replace(':', "_")));
		let contents = serde_json::to_vec_pretty(&email)?;

		let dir = self.dir.clone();
		let written = spawn_blocking({
			let path = path.clone();
			move || write_new(&dir, &path, &contents)
		})
		.await
		.map_err(|e| TaskError::Retryable(e.to_string()))?
		.map_err(|e| TaskError::Retryable(e.to_string()))?;

		if !written {
			debug!(path = %path.display(), "Mention email already spooled");
			return Ok(());
		}

		info!(
			recipient = %email.recipient,
			node_id = %email.node_id,
			"Mention email spooled"
		);

		Ok(())
	}
}

/// Writes `contents` to `path` unless it already exists. Returns `false` if it did.
fn write_new(dir: &Path, path: &Path, contents: &[u8]) -> io::Result<bool> {
	let mut file = Builder::new()
		.prefix(".")
		.suffix(".partial")
		.tempfile_in(dir)?;
	file.write_all(contents)?;
	file.as_file().sync_all()?;

	match file.persist_noclobber(path) {
		Ok(_) => Ok(true),
		Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
		Err(e) => Err(e.error),
	}
}

/// Clears the content of deleted nodes. The tombstone row stays so the node keeps its revision.
pub struct NodeContentCleaner {
	db: DatabaseConnection,
}

impl NodeContentCleaner {
	pub const fn new(db: DatabaseConnection) -> Self {
		Self { db }
	}
}

#[async_trait]
impl OutboxHandler for NodeContentCleaner {
	async fn handle(&self, task: &OutboxTask) -> Result<(), TaskError> {
		let cleanup: NodeCleanup = task.payload()?;

		let cleared = self
			.db
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE nodes SET attributes = '{}'
				WHERE workspace_id = ? AND node_id = ? AND deleted = 1",
				vec![
					cleanup.workspace_id.to_string().into(),
					cleanup.node_id.to_string().into(),
				],
			))
			.await
			.map_err(|e| TaskError::Retryable(e.to_string()))?
			.rows_affected();

		debug!(
			workspace_id = %cleanup.workspace_id,
			node_id = %cleanup.node_id,
			cleared,
			"Deleted node content cleared"
		);

		Ok(())
	}
}
