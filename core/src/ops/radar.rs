use super::WorkspaceInput;

use crate::CoreContext;

use td_core_radar::RadarState;
use td_core_shared_types::ErrorObject;
use td_operations::Query;

use async_trait::async_trait;

pub struct RadarGet;

#[async_trait]
impl Query<CoreContext> for RadarGet {
	const TYPE: &'static str = "radar.get";
	type Input = WorkspaceInput;
	type Output = RadarState;

	async fn execute(
		&self,
		ctx: &CoreContext,
		input: WorkspaceInput,
	) -> Result<RadarState, ErrorObject> {
		Ok(ctx.require_workspace(input.workspace_id).await?.radar().await)
	}
}
