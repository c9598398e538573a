//! Background jobs of the client, run by the [`JobScheduler`].

use crate::{
	context::{WorkspaceMap, Workspaces},
	workspace::RadarCheck,
	CoreConfig, CoreError, Workspace,
};

use td_job_scheduler::{BoxError, JobHandler, JobScheduler, JobSchedulerBuilder};

use std::{
	sync::{Arc, Weak},
	time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Replays each workspace's full history and replaces the incremental radar if it drifted.
pub const RADAR_VERIFY: &str = "radar.verify";
/// Prunes acknowledged changes and superseded history from each change log.
pub const CHANGES_CLEANUP: &str = "changes.cleanup";

type WeakWorkspaces = Weak<WorkspaceMap>;

pub(crate) fn build_scheduler(
	config: &CoreConfig,
	workspaces: Workspaces,
) -> Result<JobScheduler, CoreError> {
	let workspaces = Arc::downgrade(&workspaces);

	Ok(JobSchedulerBuilder::new()
		.register(
			RADAR_VERIFY,
			config.jobs.radar_verify.into(),
			RadarVerifyJob {
				workspaces: workspaces.clone(),
			},
		)?
		.register(
			CHANGES_CLEANUP,
			config.jobs.changes_cleanup.into(),
			ChangesCleanupJob {
				workspaces,
				retention: config.retention.acknowledged(),
			},
		)?
		.build())
}

async fn open_workspaces(workspaces: &WeakWorkspaces) -> Vec<Arc<Workspace>> {
	match workspaces.upgrade() {
		Some(workspaces) => workspaces.read().await.values().cloned().collect(),
		None => Vec::new(),
	}
}

struct RadarVerifyJob {
	workspaces: WeakWorkspaces,
}

#[async_trait]
impl JobHandler for RadarVerifyJob {
	async fn handle(&self, _input: Option<Value>) -> Result<(), BoxError> {
		for workspace in open_workspaces(&self.workspaces).await {
			match workspace.verify_radar().await? {
				RadarCheck::Drifted => {
					warn!(workspace_id = %workspace.id(), "Radar drifted, replaced with full replay;");
				}
				RadarCheck::Consistent => {
					debug!(workspace_id = %workspace.id(), "Radar consistent");
				}
				// The change being committed triggers another check once applied
				RadarCheck::Deferred => {}
			}
		}

		Ok(())
	}
}

struct ChangesCleanupJob {
	workspaces: WeakWorkspaces,
	retention: Duration,
}

#[async_trait]
impl JobHandler for ChangesCleanupJob {
	async fn handle(&self, _input: Option<Value>) -> Result<(), BoxError> {
		let mut acknowledged = 0;
		let mut applied = 0;

		for workspace in open_workspaces(&self.workspaces).await {
			let stats = workspace.log().prune(self.retention).await?;
			acknowledged += stats.acknowledged;
			applied += stats.applied;
		}

		if acknowledged + applied > 0 {
			info!(acknowledged, applied, "Cleaned up change logs");
		}

		Ok(())
	}
}
