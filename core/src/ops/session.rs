use crate::CoreContext;

use td_core_shared_types::ErrorObject;
use td_core_sync::SessionState;
use td_operations::Query;

use async_trait::async_trait;
use serde::Deserialize;

pub struct SessionStateGet;

#[derive(Debug, Deserialize)]
pub struct SessionStateInput {}

#[async_trait]
impl Query<CoreContext> for SessionStateGet {
	const TYPE: &'static str = "session.state";
	type Input = SessionStateInput;
	type Output = SessionState;

	async fn execute(
		&self,
		ctx: &CoreContext,
		_: SessionStateInput,
	) -> Result<SessionState, ErrorObject> {
		Ok(ctx.session.state())
	}
}
