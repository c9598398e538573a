use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use td_core_shared_types::ErrorObject;

/// A read-only request with a single output.
#[async_trait]
pub trait Query<Ctx: Send + Sync + 'static>: Send + Sync + 'static {
	const TYPE: &'static str;

	type Input: DeserializeOwned + Send + 'static;
	type Output: Serialize + Send + 'static;

	async fn execute(&self, ctx: &Ctx, input: Self::Input) -> Result<Self::Output, ErrorObject>;
}

/// A state-changing request with a single output.
#[async_trait]
pub trait Mutation<Ctx: Send + Sync + 'static>: Send + Sync + 'static {
	const TYPE: &'static str;

	type Input: DeserializeOwned + Send + Sync + 'static;
	type Output: Serialize + Send + 'static;

	/// Runs before [`Mutation::execute`]. A rejected input never reaches the handler.
	fn validate(&self, _input: &Self::Input) -> Result<(), ErrorObject> {
		Ok(())
	}

	async fn execute(&self, ctx: &Ctx, input: Self::Input) -> Result<Self::Output, ErrorObject>;
}

/// A fire-and-forget notification. Handling it yields only an acknowledgment.
#[async_trait]
pub trait Message<Ctx: Send + Sync + 'static>: Send + Sync + 'static {
	const TYPE: &'static str;

	type Input: DeserializeOwned + Send + 'static;

	async fn handle(&self, ctx: &Ctx, input: Self::Input) -> Result<(), ErrorObject>;
}
