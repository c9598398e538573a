//! Every operation the core answers, keyed by their `type` discriminator.

use crate::CoreContext;

use td_core_shared_types::WorkspaceId;
use td_operations::{Registry, RegistryBuilder, RegistryError};

use serde::Deserialize;
use tracing::warn;

mod changes;
mod nodes;
mod notifications;
mod radar;
mod session;

pub use changes::{ChangesDismiss, ChangesFailed, ChangesPendingCount, ChangesRetry};
pub use nodes::{
	ChangeReceipt, NodeChildren, NodeCreate, NodeDelete, NodeGet, NodeGetOutput, NodeMarkSeen,
	NodeUpdate,
};
pub use notifications::{LocalNodeDelete, LocalNodeSync};
pub use radar::RadarGet;
pub use session::SessionStateGet;

pub fn build_registry() -> Result<Registry<CoreContext>, RegistryError> {
	Ok(RegistryBuilder::new()
		// Queries
		.query(RadarGet)?
		.query(NodeGet)?
		.query(NodeChildren)?
		.query(ChangesFailed)?
		.query(ChangesPendingCount)?
		.query(SessionStateGet)?
		// Mutations
		.mutation(NodeCreate)?
		.mutation(NodeUpdate)?
		.mutation(NodeDelete)?
		.mutation(NodeMarkSeen)?
		.mutation(ChangesRetry)?
		.mutation(ChangesDismiss)?
		// Messages
		.message(LocalNodeSync)?
		.message(LocalNodeDelete)?
		.build())
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInput {
	pub workspace_id: WorkspaceId,
}

/// Wakes the sync session for freshly appended or retried changes. The change is durable already,
/// so a session that's gone only delays delivery until the next start.
fn wake_session(ctx: &CoreContext, workspace_id: WorkspaceId) {
	if let Err(e) = ctx.session.notify_pending(workspace_id) {
		warn!(%workspace_id, ?e, "Sync session not notified of pending changes;");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use td_operations::Family;

	#[test]
	fn every_operation_is_registered_once() {
		let registry = build_registry().unwrap();

		assert_eq!(
			registry.types(Family::Query),
			[
				"changes.failed",
				"changes.pending_count",
				"node.children",
				"node.get",
				"radar.get",
				"session.state",
			]
		);
		assert_eq!(
			registry.types(Family::Mutation),
			[
				"changes.dismiss",
				"changes.retry",
				"node.create",
				"node.delete",
				"node.mark_seen",
				"node.update",
			]
		);
		assert_eq!(
			registry.types(Family::Message),
			["local_node_delete", "local_node_sync"]
		);
	}

	#[test]
	fn registering_an_operation_twice_fails() {
		let duplicated = RegistryBuilder::<CoreContext>::new()
			.query(RadarGet)
			.and_then(|builder| builder.query(RadarGet));

		assert!(matches!(
			duplicated,
			Err(RegistryError::DuplicateOperation {
				type_name: "radar.get",
				..
			})
		));
	}
}
