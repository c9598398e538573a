use crate::{CoreError, Workspace};

use td_core_radar::RadarAggregator;
use td_core_shared_types::{AccountId, ErrorObject, NodeId, Sequence, WorkspaceId};
use td_core_sync::SessionHandle;

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

pub(crate) type WorkspaceMap = RwLock<HashMap<WorkspaceId, Arc<Workspace>>>;
pub(crate) type Workspaces = Arc<WorkspaceMap>;

/// Intra-device notification of local state changes, published by applied server changes and by
/// the `local_node_*` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LocalNotification {
	/// The node was created or updated locally, `revision` is its new revision.
	NodeSync {
		workspace_id: WorkspaceId,
		node_id: NodeId,
		revision: Sequence,
	},
	NodeDelete {
		workspace_id: WorkspaceId,
		node_id: NodeId,
	},
}

/// What every operation handler gets to work with.
#[derive(Clone)]
pub struct CoreContext {
	pub account_id: AccountId,
	pub(crate) workspaces: Workspaces,
	pub radar: Arc<RadarAggregator>,
	pub session: SessionHandle,
	pub notifications: broadcast::Sender<LocalNotification>,
}

impl CoreContext {
	pub async fn workspace(&self, workspace_id: WorkspaceId) -> Option<Arc<Workspace>> {
		self.workspaces.read().await.get(&workspace_id).cloned()
	}

	/// Like [`Self::workspace`], failing with `not_found` for workspaces that aren't open.
	pub async fn require_workspace(
		&self,
		workspace_id: WorkspaceId,
	) -> Result<Arc<Workspace>, ErrorObject> {
		self.workspace(workspace_id)
			.await
			.ok_or_else(|| CoreError::UnknownWorkspace(workspace_id).into())
	}

	pub fn notify(&self, notification: LocalNotification) {
		// Nobody listening is fine
		let _ = self.notifications.send(notification);
	}
}
