use crate::{CoreContext, LocalNotification};

use td_core_shared_types::{ErrorObject, NodeId, Sequence, WorkspaceId};
use td_operations::Message;

use async_trait::async_trait;
use serde::Deserialize;

pub struct LocalNodeSync;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalNodeSyncInput {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub revision: Sequence,
}

#[async_trait]
impl Message<CoreContext> for LocalNodeSync {
	const TYPE: &'static str = "local_node_sync";
	type Input = LocalNodeSyncInput;

	async fn handle(
		&self,
		ctx: &CoreContext,
		input: LocalNodeSyncInput,
	) -> Result<(), ErrorObject> {
		ctx.require_workspace(input.workspace_id).await?;

		ctx.notify(LocalNotification::NodeSync {
			workspace_id: input.workspace_id,
			node_id: input.node_id,
			revision: input.revision,
		});

		Ok(())
	}
}

pub struct LocalNodeDelete;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalNodeDeleteInput {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
}

#[async_trait]
impl Message<CoreContext> for LocalNodeDelete {
	const TYPE: &'static str = "local_node_delete";
	type Input = LocalNodeDeleteInput;

	async fn handle(
		&self,
		ctx: &CoreContext,
		input: LocalNodeDeleteInput,
	) -> Result<(), ErrorObject> {
		ctx.require_workspace(input.workspace_id).await?;

		ctx.notify(LocalNotification::NodeDelete {
			workspace_id: input.workspace_id,
			node_id: input.node_id,
		});

		Ok(())
	}
}
