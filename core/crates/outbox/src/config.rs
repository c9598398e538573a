use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
	/// Upper bound between two looks at the queue when nobody signals new tasks.
	pub poll_interval_ms: u64,
	/// How long a leased task belongs to its consumer before others may reclaim it.
	pub lease_ms: u64,
	/// Executions allowed before a task is failed for good.
	pub max_attempts: u32,
	/// A failed task waits `backoff_base_ms * attempts`, capped at `backoff_max_ms`.
	pub backoff_base_ms: u64,
	pub backoff_max_ms: u64,
	pub retention_ms: u64,
	pub prune_interval_ms: u64,
}

impl Default for OutboxConfig {
	fn default() -> Self {
		Self {
			poll_interval_ms: 1_000,
			lease_ms: 60_000,
			max_attempts: 5,
			backoff_base_ms: 1_000,
			backoff_max_ms: 60_000,
			retention_ms: 7 * 24 * 60 * 60 * 1_000,
			prune_interval_ms: 60 * 60 * 1_000,
		}
	}
}

impl OutboxConfig {
	#[must_use]
	pub const fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	#[must_use]
	pub const fn lease(&self) -> Duration {
		Duration::from_millis(self.lease_ms)
	}

	#[must_use]
	pub const fn retention(&self) -> Duration {
		Duration::from_millis(self.retention_ms)
	}

	#[must_use]
	pub const fn prune_interval(&self) -> Duration {
		Duration::from_millis(self.prune_interval_ms)
	}

	/// Delay before a task that failed `attempts` times may run again.
	#[must_use]
	pub fn backoff(&self, attempts: u32) -> Duration {
		Duration::from_millis(
			self.backoff_base_ms
				.saturating_mul(u64::from(attempts))
				.min(self.backoff_max_ms),
		)
	}
}
