use super::wake_session;

use crate::{workspace::LocalNode, CoreContext};

use td_core_radar::RadarState;
use td_core_shared_types::{
	AccountId, ChangeId, ErrorObject, NodeId, NodeMutation, NodeType, Sequence, WorkspaceId,
};
use td_core_sync::NewChange;
use td_operations::{Mutation, Query};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// What a local write returns: the change is durable and waits for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReceipt {
	pub local_id: ChangeId,
	pub node_id: NodeId,
}

async fn append(
	ctx: &CoreContext,
	workspace_id: WorkspaceId,
	node_id: NodeId,
	mutation: NodeMutation,
	base_revision: Option<Sequence>,
) -> Result<ChangeReceipt, ErrorObject> {
	let workspace = ctx.require_workspace(workspace_id).await?;

	let change = workspace
		.log()
		.append(NewChange {
			node_id,
			created_by: ctx.account_id,
			mutation,
			base_revision,
		})
		.await?;

	debug!(%workspace_id, %node_id, local_id = %change.local_id, "Local change appended");

	wake_session(ctx, workspace_id);

	Ok(ChangeReceipt {
		local_id: change.local_id,
		node_id,
	})
}

fn validate(mutation: &NodeMutation, node_id: NodeId) -> Result<(), ErrorObject> {
	mutation
		.validate(node_id)
		.map_err(|e| ErrorObject::validation(e.to_string()))
}

pub struct NodeGet;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGetInput {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
}

/// `node` is `null` when the node is unknown or deleted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGetOutput {
	pub node: Option<LocalNode>,
}

#[async_trait]
impl Query<CoreContext> for NodeGet {
	const TYPE: &'static str = "node.get";
	type Input = NodeGetInput;
	type Output = NodeGetOutput;

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: NodeGetInput,
	) -> Result<NodeGetOutput, ErrorObject> {
		let node = ctx
			.require_workspace(input.workspace_id)
			.await?
			.node(input.node_id)
			.await?
			.filter(|node| !node.deleted);

		Ok(NodeGetOutput { node })
	}
}

pub struct NodeChildren;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChildrenInput {
	pub workspace_id: WorkspaceId,
	pub parent_id: NodeId,
}

#[async_trait]
impl Query<CoreContext> for NodeChildren {
	const TYPE: &'static str = "node.children";
	type Input = NodeChildrenInput;
	type Output = Vec<LocalNode>;

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: NodeChildrenInput,
	) -> Result<Vec<LocalNode>, ErrorObject> {
		Ok(ctx
			.require_workspace(input.workspace_id)
			.await?
			.mirror()
			.children(input.parent_id)
			.await?)
	}
}

pub struct NodeCreate;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCreateInput {
	pub workspace_id: WorkspaceId,
	/// Generated when absent.
	#[serde(default)]
	pub node_id: Option<NodeId>,
	pub node_type: NodeType,
	#[serde(default)]
	pub parent_id: Option<NodeId>,
	pub attributes: Value,
	#[serde(default)]
	pub mentions: Vec<AccountId>,
}

impl NodeCreateInput {
	fn mutation(&self) -> NodeMutation {
		NodeMutation::Create {
			node_type: self.node_type,
			parent_id: self.parent_id,
			attributes: self.attributes.clone(),
			mentions: self.mentions.clone(),
		}
	}
}

#[async_trait]
impl Mutation<CoreContext> for NodeCreate {
	const TYPE: &'static str = "node.create";
	type Input = NodeCreateInput;
	type Output = ChangeReceipt;

	fn validate(&self, input: &NodeCreateInput) -> Result<(), ErrorObject> {
		validate(&input.mutation(), input.node_id.unwrap_or_else(NodeId::new))
	}

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: NodeCreateInput,
	) -> Result<ChangeReceipt, ErrorObject> {
		let node_id = input.node_id.unwrap_or_else(NodeId::new);
		append(ctx, input.workspace_id, node_id, input.mutation(), None).await
	}
}

pub struct NodeUpdate;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdateInput {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub attributes: Value,
	#[serde(default)]
	pub mentions: Vec<AccountId>,
	/// Revision the edit was made against. The server rejects the change as a conflict if the
	/// node moved on since. Without it the edit applies over whatever the server has.
	#[serde(default)]
	pub base_revision: Option<Sequence>,
}

impl NodeUpdateInput {
	fn mutation(&self) -> NodeMutation {
		NodeMutation::Update {
			attributes: self.attributes.clone(),
			mentions: self.mentions.clone(),
		}
	}
}

#[async_trait]
impl Mutation<CoreContext> for NodeUpdate {
	const TYPE: &'static str = "node.update";
	type Input = NodeUpdateInput;
	type Output = ChangeReceipt;

	fn validate(&self, input: &NodeUpdateInput) -> Result<(), ErrorObject> {
		validate(&input.mutation(), input.node_id)
	}

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: NodeUpdateInput,
	) -> Result<ChangeReceipt, ErrorObject> {
		append(
			ctx,
			input.workspace_id,
			input.node_id,
			input.mutation(),
			input.base_revision,
		)
		.await
	}
}

pub struct NodeDelete;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeleteInput {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	#[serde(default)]
	pub base_revision: Option<Sequence>,
}

#[async_trait]
impl Mutation<CoreContext> for NodeDelete {
	const TYPE: &'static str = "node.delete";
	type Input = NodeDeleteInput;
	type Output = ChangeReceipt;

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: NodeDeleteInput,
	) -> Result<ChangeReceipt, ErrorObject> {
		append(
			ctx,
			input.workspace_id,
			input.node_id,
			NodeMutation::Delete,
			input.base_revision,
		)
		.await
	}
}

pub struct NodeMarkSeen;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMarkSeenInput {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	/// Defaults to the node's current revision.
	#[serde(default)]
	pub sequence: Option<Sequence>,
}

#[async_trait]
impl Mutation<CoreContext> for NodeMarkSeen {
	const TYPE: &'static str = "node.mark_seen";
	type Input = NodeMarkSeenInput;
	type Output = RadarState;

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: NodeMarkSeenInput,
	) -> Result<RadarState, ErrorObject> {
		Ok(ctx
			.require_workspace(input.workspace_id)
			.await?
			.mark_seen(input.node_id, input.sequence)
			.await?)
	}
}
