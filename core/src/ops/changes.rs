use super::{wake_session, WorkspaceInput};

use crate::CoreContext;

use td_core_shared_types::{ChangeId, ErrorObject, WorkspaceId};
use td_core_sync::PendingChange;
use td_operations::{Mutation, Query};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

/// Changes the server rejected or that ran out of retries. They stay listed until retried or
/// dismissed.
pub struct ChangesFailed;

#[async_trait]
impl Query<CoreContext> for ChangesFailed {
	const TYPE: &'static str = "changes.failed";
	type Input = WorkspaceInput;
	type Output = Vec<PendingChange>;

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: WorkspaceInput,
	) -> Result<Vec<PendingChange>, ErrorObject> {
		Ok(ctx.require_workspace(input.workspace_id).await?.log().failed().await?)
	}
}

pub struct ChangesPendingCount;

#[async_trait]
impl Query<CoreContext> for ChangesPendingCount {
	const TYPE: &'static str = "changes.pending_count";
	type Input = WorkspaceInput;
	type Output = u64;

	async fn execute(&self, ctx: &CoreContext, input: WorkspaceInput) -> Result<u64, ErrorObject> {
		Ok(ctx
			.require_workspace(input.workspace_id)
			.await?
			.log()
			.pending_count()
			.await?)
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedChangeInput {
	pub workspace_id: WorkspaceId,
	pub local_id: ChangeId,
}

/// Moves a failed change back to pending with a fresh retry budget.
pub struct ChangesRetry;

#[async_trait]
impl Mutation<CoreContext> for ChangesRetry {
	const TYPE: &'static str = "changes.retry";
	type Input = FailedChangeInput;
	type Output = PendingChange;

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: FailedChangeInput,
	) -> Result<PendingChange, ErrorObject> {
		let change = ctx
			.require_workspace(input.workspace_id)
			.await?
			.log()
			.retry_failed(input.local_id)
			.await?;

		info!(workspace_id = %input.workspace_id, local_id = %input.local_id, "Retrying failed change");

		wake_session(ctx, input.workspace_id);

		Ok(change)
	}
}

pub struct ChangesDismiss;

#[async_trait]
impl Mutation<CoreContext> for ChangesDismiss {
	const TYPE: &'static str = "changes.dismiss";
	type Input = FailedChangeInput;
	type Output = ();

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: FailedChangeInput,
	) -> Result<(), ErrorObject> {
		ctx.require_workspace(input.workspace_id)
			.await?
			.log()
			.dismiss_failed(input.local_id)
			.await?;

		Ok(())
	}
}
