use crate::{task::OutboxTask, OutboxError, OutboxTaskKind};

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
	/// Worth trying again later, the task goes back to the queue with backoff.
	#[error("{0}")]
	Retryable(String),
	/// Trying again can't help, the task fails right away.
	#[error("{0}")]
	Permanent(String),
}

impl From<serde_json::Error> for TaskError {
	fn from(e: serde_json::Error) -> Self {
		Self::Permanent(format!("malformed payload: {e}"))
	}
}

/// Runs one kind of side effect. A task may be handed over more than once, so the effect must
/// be keyed on `task.dedupe_key`.
#[async_trait]
pub trait OutboxHandler: Send + Sync + 'static {
	async fn handle(&self, task: &OutboxTask) -> Result<(), TaskError>;
}

#[async_trait]
impl<T: OutboxHandler> OutboxHandler for Arc<T> {
	async fn handle(&self, task: &OutboxTask) -> Result<(), TaskError> {
		T::handle(self, task).await
	}
}

#[derive(Default)]
pub struct OutboxHandlersBuilder {
	handlers: HashMap<OutboxTaskKind, Arc<dyn OutboxHandler>>,
}

impl OutboxHandlersBuilder {
	pub fn register(
		mut self,
		kind: OutboxTaskKind,
		handler: impl OutboxHandler,
	) -> Result<Self, OutboxError> {
		if self.handlers.contains_key(&kind) {
			return Err(OutboxError::DuplicateHandler(kind));
		}

		let handler: Arc<dyn OutboxHandler> = Arc::new(handler);
		self.handlers.insert(kind, handler);

		Ok(self)
	}

	#[must_use]
	pub fn build(self) -> OutboxHandlers {
		OutboxHandlers {
			handlers: self.handlers,
		}
	}
}

/// Handlers per task kind, fixed once built.
pub struct OutboxHandlers {
	handlers: HashMap<OutboxTaskKind, Arc<dyn OutboxHandler>>,
}

impl OutboxHandlers {
	#[must_use]
	pub fn builder() -> OutboxHandlersBuilder {
		OutboxHandlersBuilder::default()
	}

	#[must_use]
	pub fn get(&self, kind: OutboxTaskKind) -> Option<&Arc<dyn OutboxHandler>> {
		self.handlers.get(&kind)
	}
}
