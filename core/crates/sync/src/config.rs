use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};

/// Bounds the sync session works within. Every duration is in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// How long a sent change may wait for its `server_change_result` before it's resent.
	pub ack_timeout_ms: u64,
	/// Resends allowed after the first send. Once spent the change is marked failed.
	pub max_retries: u32,
	/// Changes per workspace that may await a result at the same time.
	pub max_in_flight: usize,
	pub auth_timeout_ms: u64,
	pub reconnect: BackoffConfig,
	/// How long a gap in the change stream may stay open before replay is requested again.
	pub gap_timeout_ms: u64,
	/// Replay requests for one gap before staged changes are dropped and a full replay is asked.
	pub max_replay_requests: u32,
	pub replay_batch_size: u32,
	/// Period of the catch-up request that detects changes lost at the tail of the stream.
	pub catch_up_interval_ms: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			ack_timeout_ms: 10_000,
			max_retries: 5,
			max_in_flight: 64,
			auth_timeout_ms: 10_000,
			reconnect: BackoffConfig::default(),
			gap_timeout_ms: 5_000,
			max_replay_requests: 3,
			replay_batch_size: 500,
			catch_up_interval_ms: 30_000,
		}
	}
}

impl SyncConfig {
	#[must_use]
	pub const fn ack_timeout(&self) -> Duration {
		Duration::from_millis(self.ack_timeout_ms)
	}

	#[must_use]
	pub const fn auth_timeout(&self) -> Duration {
		Duration::from_millis(self.auth_timeout_ms)
	}

	#[must_use]
	pub const fn gap_timeout(&self) -> Duration {
		Duration::from_millis(self.gap_timeout_ms)
	}

	#[must_use]
	pub const fn catch_up_interval(&self) -> Duration {
		Duration::from_millis(self.catch_up_interval_ms)
	}
}

/// Reconnect backoff. `jitter` is the randomization factor applied to every delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
	pub initial_ms: u64,
	pub max_ms: u64,
	pub multiplier: f64,
	pub jitter: f64,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			initial_ms: 500,
			max_ms: 30_000,
			multiplier: 2.0,
			jitter: 0.5,
		}
	}
}

impl BackoffConfig {
	#[must_use]
	pub const fn max(&self) -> Duration {
		Duration::from_millis(self.max_ms)
	}

	/// Never gives up, the session keeps reconnecting until stopped.
	#[must_use]
	pub fn build(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(self.initial_ms))
			.with_max_interval(Duration::from_millis(self.max_ms))
			.with_multiplier(self.multiplier)
			.with_randomization_factor(self.jitter.clamp(0.0, 1.0))
			.with_max_elapsed_time(None)
			.build()
	}
}
