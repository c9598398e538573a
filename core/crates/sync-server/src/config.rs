use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSyncConfig {
	/// A connection must present its credentials within this many milliseconds.
	pub auth_timeout_ms: u64,
	/// Most changes sent in one batch, whatever the client asks for.
	pub max_batch_size: u32,
	/// Messages queued per session before live changes to it are dropped. A session that misses
	/// changes finds out through its sequence gap and asks for a replay.
	pub session_buffer: usize,
}

impl Default for ServerSyncConfig {
	fn default() -> Self {
		Self {
			auth_timeout_ms: 10_000,
			max_batch_size: 1_000,
			session_buffer: 256,
		}
	}
}

impl ServerSyncConfig {
	#[must_use]
	pub const fn auth_timeout(&self) -> Duration {
		Duration::from_millis(self.auth_timeout_ms)
	}
}
