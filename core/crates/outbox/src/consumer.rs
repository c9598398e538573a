use crate::{
	config::OutboxConfig,
	handler::{OutboxHandlers, TaskError},
	store::{OutboxStore, LEASE_EXPIRED},
	task::{OutboxStatus, OutboxTask, OutboxTaskId, OutboxTaskKind},
	OutboxError,
};

use std::{future::IntoFuture, pin::pin, sync::Arc};

use serde::Serialize;
use tokio::{
	sync::{broadcast, Notify},
	time::{interval_at, sleep, timeout_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

const FAILURES_CAPACITY: usize = 64;

/// Published when a task is failed for good.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxFailure {
	pub task_id: OutboxTaskId,
	pub kind: OutboxTaskKind,
	pub dedupe_key: String,
	pub attempts: u32,
	pub error: String,
}

pub struct OutboxConsumer {
	store: OutboxStore,
	handlers: Arc<OutboxHandlers>,
	config: OutboxConfig,
	owner: String,
	notify: Arc<Notify>,
	failures: broadcast::Sender<OutboxFailure>,
}

impl OutboxConsumer {
	#[must_use]
	pub fn new(store: OutboxStore, handlers: Arc<OutboxHandlers>, config: OutboxConfig) -> Self {
		Self {
			store,
			handlers,
			config,
			owner: format!("consumer-{}", Uuid::new_v4()),
			notify: Arc::new(Notify::new()),
			failures: broadcast::channel(FAILURES_CAPACITY).0,
		}
	}

	#[must_use]
	pub fn owner(&self) -> &str {
		&self.owner
	}

	#[must_use]
	pub const fn store(&self) -> &OutboxStore {
		&self.store
	}

	/// Wakes the consumer before its next poll. Producers call it after committing new tasks.
	#[must_use]
	pub fn notifier(&self) -> Arc<Notify> {
		Arc::clone(&self.notify)
	}

	pub fn subscribe_failures(&self) -> broadcast::Receiver<OutboxFailure> {
		self.failures.subscribe()
	}

	/// Leases and runs a single task. Returns `false` when nothing was runnable.
	///
	/// The handler only gets as long as the lease: past that another consumer may reclaim the
	/// task, so the run is cut short and recorded as a retryable failure.
	pub async fn process_next(&self) -> Result<bool, OutboxError> {
		let leased_at = Instant::now();

		let Some(task) = self
			.store
			.lease_next(&self.owner, self.config.lease())
			.await?
		else {
			return Ok(false);
		};

		trace!(id = %task.id, kind = %task.kind, attempts = task.attempts, "Leased outbox task");

		if self.store.is_processed(&task.dedupe_key).await? {
			debug!(id = %task.id, dedupe_key = %task.dedupe_key, "Effect already recorded, skipping");
			self.store.complete(task.id, &self.owner).await?;
			return Ok(true);
		}

		// Reclaimed from holders that never reported back until nothing is left to spend
		if task.attempts >= self.config.max_attempts {
			let e = TaskError::Retryable(
				task.last_error
					.clone()
					.unwrap_or_else(|| LEASE_EXPIRED.to_string()),
			);
			if self.store.give_up(&task, &self.owner, &e).await? {
				self.report_failure(&task, task.attempts, &e);
			}
			return Ok(true);
		}

		let outcome = match self.handlers.get(task.kind) {
			Some(handler) => {
				match timeout_at(leased_at + self.config.lease(), handler.handle(&task)).await {
					Ok(outcome) => outcome,
					Err(_) => {
						warn!(id = %task.id, kind = %task.kind, "Outbox task outlived its lease;");
						Err(TaskError::Retryable(format!(
							"handler still running after its {:?} lease",
							self.config.lease()
						)))
					}
				}
			}
			None => Err(TaskError::Permanent(format!(
				"no handler registered for <{}> tasks",
				task.kind
			))),
		};

		match outcome {
			Ok(()) => {
				if self.store.complete(task.id, &self.owner).await? {
					debug!(id = %task.id, kind = %task.kind, "Outbox task done");
				}
			}

			Err(e) => match self.store.fail(&task, &self.owner, &e, &self.config).await? {
				Some(OutboxStatus::Failed) => {
					self.report_failure(&task, task.attempts.saturating_add(1), &e);
				}
				Some(_) => {
					warn!(id = %task.id, kind = %task.kind, %e, "Outbox task failed, will retry;");
				}
				None => {
					warn!(id = %task.id, "Lease lost before the failure was recorded;");
				}
			},
		}

		Ok(true)
	}

	fn report_failure(&self, task: &OutboxTask, attempts: u32, e: &TaskError) {
		error!(
			id = %task.id,
			kind = %task.kind,
			attempts,
			%e,
			"Outbox task failed for good;",
		);

		// Nobody listening is fine, the task stays queryable as failed
		let _ = self.failures.send(OutboxFailure {
			task_id: task.id,
			kind: task.kind,
			dedupe_key: task.dedupe_key.clone(),
			attempts,
			error: e.to_string(),
		});
	}

	/// Drains the queue whenever notified or every `poll_interval`, until `stop` resolves.
	pub async fn run(&self, stop: impl IntoFuture<Output = ()>) {
		let mut stop = pin!(stop.into_future());

		let mut prune = interval_at(
			Instant::now() + self.config.prune_interval(),
			self.config.prune_interval(),
		);
		prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			loop {
				match self.process_next().await {
					Ok(true) => {}
					Ok(false) => break,
					Err(e) => {
						error!(?e, "Failed to process outbox task;");
						break;
					}
				}
			}

			tokio::select! {
				() = &mut stop => {
					debug!(owner = %self.owner, "Outbox consumer stopped");
					return;
				}
				() = self.notify.notified() => {}
				() = sleep(self.config.poll_interval()) => {}
				_ = prune.tick() => {
					if let Err(e) = self.store.prune_done(self.config.retention()).await {
						error!(?e, "Failed to prune outbox;");
					}
				}
			}
		}
	}
}
