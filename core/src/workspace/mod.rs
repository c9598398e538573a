use crate::{context::LocalNotification, jobs::RADAR_VERIFY, CoreError};

use td_core_radar::{RadarAggregator, RadarState};
use td_core_shared_types::{
	AccountId, Change, ErrorObject, Interaction, InteractionKind, NodeId, NodeMutation, Sequence,
	WorkspaceId,
};
use td_core_sync::{db::open_database, ChangeSink, LocalChangeLog};
use td_job_scheduler::JobScheduler;

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, trace, warn};

mod mirror;

pub use mirror::{LocalNode, NodeMirror};

const DATABASE_FILE_NAME: &str = "workspace.db";

/// Outcome of comparing the incremental radar with a full replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadarCheck {
	Consistent,
	/// The incremental state was wrong and got replaced.
	Drifted,
	/// A server change was mirrored but not committed yet, the history would be incomplete.
	Deferred,
}

/// One open workspace: its change log, node mirror and radar wiring.
pub struct Workspace {
	id: WorkspaceId,
	account_id: AccountId,
	log: LocalChangeLog,
	mirror: NodeMirror,
	// Serializes server changes, interactions and radar rebuilds
	write_lock: Mutex<()>,
	radar: Arc<RadarAggregator>,
	notifications: broadcast::Sender<LocalNotification>,
	jobs: Arc<JobScheduler>,
}

impl Workspace {
	#[instrument(skip(dir, radar, notifications, jobs), err)]
	pub async fn open(
		dir: PathBuf,
		workspace_id: WorkspaceId,
		account_id: AccountId,
		radar: Arc<RadarAggregator>,
		notifications: broadcast::Sender<LocalNotification>,
		jobs: Arc<JobScheduler>,
	) -> Result<Self, CoreError> {
		tokio::fs::create_dir_all(&dir).await?;

		let db = open_database(dir.join(DATABASE_FILE_NAME)).await?;
		let log = LocalChangeLog::open(db.clone(), workspace_id).await?;
		let mirror = NodeMirror::open(db, workspace_id).await?;

		let workspace = Self {
			id: workspace_id,
			account_id,
			log,
			mirror,
			write_lock: Mutex::new(()),
			radar,
			notifications,
			jobs,
		};

		workspace.radar.track(workspace_id, account_id).await;
		workspace.rebuild_radar().await?;

		info!(
			pending_count = workspace.log.pending_count().await?,
			watermark = workspace.log.watermark().await?,
			"Workspace opened"
		);

		Ok(workspace)
	}

	#[must_use]
	pub const fn id(&self) -> WorkspaceId {
		self.id
	}

	#[must_use]
	pub const fn log(&self) -> &LocalChangeLog {
		&self.log
	}

	#[must_use]
	pub const fn mirror(&self) -> &NodeMirror {
		&self.mirror
	}

	pub async fn node(&self, node_id: NodeId) -> Result<Option<LocalNode>, CoreError> {
		self.mirror.node(node_id).await
	}

	pub async fn radar(&self) -> RadarState {
		self.radar
			.state(self.id, self.account_id)
			.await
			.unwrap_or_default()
	}

	/// Records that the user has seen `node_id` up to `sequence`, or up to its current revision
	/// when `sequence` is `None`.
	pub async fn mark_seen(
		&self,
		node_id: NodeId,
		sequence: Option<Sequence>,
	) -> Result<RadarState, CoreError> {
		let _guard = self.write_lock.lock().await;

		let node = self
			.mirror
			.node(node_id)
			.await?
			.ok_or(CoreError::NodeNotFound(node_id))?;

		let interaction = Interaction {
			workspace_id: self.id,
			node_id,
			account_id: self.account_id,
			kind: InteractionKind::Seen {
				sequence: sequence.unwrap_or(node.revision),
			},
			occurred_at: Utc::now(),
		};

		self.mirror.record_interaction(&interaction).await?;
		self.radar.apply_interaction(&interaction).await;

		Ok(self.radar().await)
	}

	/// Replays the applied history into a fresh projection and swaps it in.
	pub async fn verify_radar(&self) -> Result<RadarCheck, CoreError> {
		let _guard = self.write_lock.lock().await;

		let watermark = self.log.watermark().await?;
		let mirrored = self.mirror.max_revision().await?;
		if mirrored > watermark {
			debug!(workspace_id = %self.id, watermark, mirrored, "Radar check deferred");
			return Ok(RadarCheck::Deferred);
		}

		if self.rebuild_radar().await? {
			Ok(RadarCheck::Drifted)
		} else {
			Ok(RadarCheck::Consistent)
		}
	}

	async fn rebuild_radar(&self) -> Result<bool, CoreError> {
		let changes = self.log.applied_changes().await?;
		let interactions = self.mirror.interactions(self.account_id).await?;

		Ok(self
			.radar
			.rebuild(self.id, self.account_id, &changes, &interactions)
			.await)
	}

	async fn apply_to_mirror(&self, change: &Change) -> Result<(), CoreError> {
		let _guard = self.write_lock.lock().await;

		let Some(node) = self.mirror.apply(change).await? else {
			trace!(
				workspace_id = %self.id,
				node_id = %change.node_id,
				sequence = change.sequence,
				"Server change already mirrored"
			);
			return Ok(());
		};

		self.radar.apply_change(change).await;

		trace!(
			workspace_id = %self.id,
			node_id = %change.node_id,
			sequence = change.sequence,
			mutation = change.mutation.name(),
			"Applied server change"
		);

		self.notify(match change.mutation {
			NodeMutation::Delete => LocalNotification::NodeDelete {
				workspace_id: self.id,
				node_id: node.node_id,
			},
			_ => LocalNotification::NodeSync {
				workspace_id: self.id,
				node_id: node.node_id,
				revision: node.revision,
			},
		});

		Ok(())
	}

	fn notify(&self, notification: LocalNotification) {
		// Nobody listening is fine
		let _ = self.notifications.send(notification);
	}
}

#[async_trait]
impl ChangeSink for Workspace {
	async fn apply(&self, change: &Change) -> Result<(), ErrorObject> {
		self.apply_to_mirror(change).await?;

		// Also after a skipped change: it may have been mirrored by a run that never committed
		// it, and the radar rebuilt at open doesn't know it yet
		if let Err(e) = self.jobs.trigger(RADAR_VERIFY, None) {
			warn!(?e, "Failed to schedule radar check;");
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use td_core_shared_types::{ChangeId, NodeType};
	use td_job_scheduler::{BoxError, JobEvent, JobHandler, JobPolicy, JobSchedulerBuilder};

	use std::time::Duration;

	use serde_json::{json, Value};
	use tempfile::TempDir;
	use tokio::time::timeout;

	struct NoopCheck;

	#[async_trait]
	impl JobHandler for NoopCheck {
		async fn handle(&self, _input: Option<Value>) -> Result<(), BoxError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn change_mirrored_before_a_crash_still_schedules_a_radar_check() {
		let dir = TempDir::new().unwrap();
		let jobs = Arc::new(
			JobSchedulerBuilder::new()
				.register(RADAR_VERIFY, JobPolicy::debounced(Duration::ZERO), NoopCheck)
				.unwrap()
				.build(),
		);
		let mut job_events = jobs.subscribe();

		let workspace_id = WorkspaceId::new();
		let account_id = AccountId::new();
		let radar = Arc::new(RadarAggregator::new());
		let (notifications, _) = broadcast::channel(16);

		let open = || {
			Workspace::open(
				dir.path().to_path_buf(),
				workspace_id,
				account_id,
				Arc::clone(&radar),
				notifications.clone(),
				Arc::clone(&jobs),
			)
		};

		let change = Change {
			id: ChangeId::new(),
			workspace_id,
			node_id: NodeId::new(),
			node_type: NodeType::Message,
			created_by: AccountId::new(),
			mutation: NodeMutation::Create {
				node_type: NodeType::Message,
				parent_id: None,
				attributes: json!({ "text": "hello" }),
				mentions: vec![],
			},
			sequence: 1,
			created_at: Utc::now(),
		};

		// The previous run mirrored the change and died before committing it
		open()
			.await
			.unwrap()
			.mirror()
			.apply(&change)
			.await
			.unwrap()
			.unwrap();

		let workspace = open().await.unwrap();
		assert_eq!(workspace.radar().await.unread_count, 0);

		workspace.apply(&change).await.unwrap();

		let started = timeout(Duration::from_secs(5), async {
			loop {
				if let JobEvent::Started { job_type, .. } = job_events.recv().await.unwrap() {
					return job_type;
				}
			}
		})
		.await
		.expect("radar check never ran");
		assert_eq!(&*started, RADAR_VERIFY);

		workspace.log().commit_applied(&change).await.unwrap();
		assert_eq!(workspace.verify_radar().await.unwrap(), RadarCheck::Drifted);
		assert_eq!(workspace.radar().await.unread_count, 1);
		assert_eq!(workspace.verify_radar().await.unwrap(), RadarCheck::Consistent);

		jobs.shutdown().await;
	}
}
