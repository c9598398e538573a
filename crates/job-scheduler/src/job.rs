use std::{error::Error, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Timing policy of a job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPolicy {
	/// Quiet time required after the last trigger before the job runs.
	pub debounce: Duration,
	/// Longest time between two executions, triggered or not. `None` means trigger-only.
	pub interval: Option<Duration>,
}

impl JobPolicy {
	#[must_use]
	pub const fn debounced(debounce: Duration) -> Self {
		Self {
			debounce,
			interval: None,
		}
	}

	#[must_use]
	pub const fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = Some(interval);
		self
	}
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
	/// Runs one execution. `input` is the one carried by the latest trigger, if any.
	async fn handle(&self, input: Option<Value>) -> Result<(), BoxError>;
}

#[async_trait]
impl<T: JobHandler> JobHandler for Arc<T> {
	async fn handle(&self, input: Option<Value>) -> Result<(), BoxError> {
		T::handle(self, input).await
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
	Idle,
	Debouncing,
	Ready,
	Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
	Started {
		job_type: Arc<str>,
		run: u64,
	},
	Succeeded {
		job_type: Arc<str>,
		run: u64,
		duration: Duration,
	},
	Failed {
		job_type: Arc<str>,
		run: u64,
		error: String,
	},
}
