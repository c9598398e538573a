use crate::{BoxError, JobEvent, JobHandler, JobPolicy, JobState, SchedulerError};

use std::{collections::HashMap, future, panic::AssertUnwindSafe, sync::Arc};

use async_channel as chan;
use futures::FutureExt;
use serde_json::Value;
use tokio::{
	select, spawn,
	sync::{broadcast, watch, Mutex},
	task::JoinHandle,
	time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn, Instrument};

const EVENTS_CAPACITY: usize = 256;

/// Registers every job type before the scheduler starts.
#[derive(Default)]
pub struct JobSchedulerBuilder {
	jobs: Vec<(Arc<str>, JobPolicy, Arc<dyn JobHandler>)>,
}

impl JobSchedulerBuilder {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(
		mut self,
		job_type: impl Into<Arc<str>>,
		policy: JobPolicy,
		handler: impl JobHandler,
	) -> Result<Self, SchedulerError> {
		let job_type = job_type.into();

		if self.jobs.iter().any(|(existing, ..)| *existing == job_type) {
			return Err(SchedulerError::DuplicateJob(job_type.to_string()));
		}

		if policy.interval.is_some_and(|interval| interval.is_zero()) {
			return Err(SchedulerError::ZeroInterval(job_type.to_string()));
		}

		let handler: Arc<dyn JobHandler> = Arc::new(handler);
		self.jobs.push((job_type, policy, handler));

		Ok(self)
	}

	/// Spawns one task per job type. Must be called from within a tokio runtime.
	#[must_use]
	pub fn build(self) -> JobScheduler {
		let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);
		let cancel = CancellationToken::new();

		let mut slots = HashMap::with_capacity(self.jobs.len());
		let mut handles = Vec::with_capacity(self.jobs.len());

		for (job_type, policy, handler) in self.jobs {
			let (trigger_tx, trigger_rx) = chan::unbounded();
			let (state_tx, state_rx) = watch::channel(JobState::Idle);

			handles.push(spawn(
				Slot {
					job_type: Arc::clone(&job_type),
					policy,
					handler,
					trigger_rx,
					state_tx,
					events_tx: events_tx.clone(),
					cancel: cancel.child_token(),
				}
				.run()
				.in_current_span(),
			));

			slots.insert(
				job_type,
				SlotHandle {
					trigger_tx,
					state_rx,
				},
			);
		}

		debug!(jobs_count = slots.len(), "Job scheduler started");

		JobScheduler {
			slots,
			events_tx,
			cancel,
			handles: Mutex::new(handles),
		}
	}
}

struct SlotHandle {
	trigger_tx: chan::Sender<Option<Value>>,
	state_rx: watch::Receiver<JobState>,
}

pub struct JobScheduler {
	slots: HashMap<Arc<str>, SlotHandle>,
	events_tx: broadcast::Sender<JobEvent>,
	cancel: CancellationToken,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
	/// Signals that `job_type` should run. Never waits for the execution.
	pub fn trigger(&self, job_type: &str, input: Option<Value>) -> Result<(), SchedulerError> {
		let slot = self
			.slots
			.get(job_type)
			.ok_or_else(|| SchedulerError::UnknownJob(job_type.to_string()))?;

		slot.trigger_tx
			.try_send(input)
			.map_err(|_| SchedulerError::ShutDown)
	}

	pub fn state(&self, job_type: &str) -> Result<JobState, SchedulerError> {
		self.slots
			.get(job_type)
			.map(|slot| *slot.state_rx.borrow())
			.ok_or_else(|| SchedulerError::UnknownJob(job_type.to_string()))
	}

	pub fn watch_state(&self, job_type: &str) -> Result<watch::Receiver<JobState>, SchedulerError> {
		self.slots
			.get(job_type)
			.map(|slot| slot.state_rx.clone())
			.ok_or_else(|| SchedulerError::UnknownJob(job_type.to_string()))
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
		self.events_tx.subscribe()
	}

	#[must_use]
	pub fn job_types(&self) -> Vec<&str> {
		let mut job_types = self.slots.keys().map(|job_type| &**job_type).collect::<Vec<_>>();
		job_types.sort_unstable();
		job_types
	}

	/// Stops every slot, dropping any pending run. An execution in progress is abandoned.
	pub async fn shutdown(&self) {
		self.cancel.cancel();

		for handle in self.handles.lock().await.drain(..) {
			if let Err(e) = handle.await {
				error!(?e, "Job slot task failed while shutting down");
			}
		}

		debug!("Job scheduler shut down");
	}
}

struct PendingRun {
	deadline: Instant,
	input: Option<Value>,
}

struct Slot {
	job_type: Arc<str>,
	policy: JobPolicy,
	handler: Arc<dyn JobHandler>,
	trigger_rx: chan::Receiver<Option<Value>>,
	state_tx: watch::Sender<JobState>,
	events_tx: broadcast::Sender<JobEvent>,
	cancel: CancellationToken,
}

impl Slot {
	#[instrument(skip_all, fields(job_type = %self.job_type))]
	async fn run(self) {
		let mut pending: Option<PendingRun> = None;
		let mut forced_at = self.next_forced_at();
		let mut runs = 0;

		loop {
			self.set_state(if pending.is_some() {
				JobState::Debouncing
			} else {
				JobState::Idle
			});

			let debounce_at = pending.as_ref().map(|pending| pending.deadline);

			select! {
				biased;

				() = self.cancel.cancelled() => break,

				trigger = self.trigger_rx.recv() => {
					let Ok(input) = trigger else {
						break;
					};

					trace!("Triggered, debounce restarted");
					pending = Some(self.restart_debounce(pending.take(), input));
					continue;
				}

				() = sleep_until_some(debounce_at) => trace!("Debounce elapsed"),

				() = sleep_until_some(forced_at) => trace!("Interval elapsed"),
			}

			self.set_state(JobState::Ready);

			runs += 1;
			let input = pending.take().and_then(|pending| pending.input);

			self.set_state(JobState::Running);
			select! {
				biased;

				() = self.cancel.cancelled() => {
					warn!(run = runs, "Job execution abandoned on shutdown");
					break;
				}

				() = self.execute(runs, input) => {}
			}

			forced_at = self.next_forced_at();

			// Everything that arrived while running becomes a single re-run
			let mut rerun = None;
			while let Ok(input) = self.trigger_rx.try_recv() {
				rerun = Some(self.restart_debounce(rerun.take(), input));
			}

			if rerun.is_some() {
				trace!("Triggers arrived while running, re-run pending");
			}

			pending = rerun;
		}

		self.set_state(JobState::Idle);
	}

	async fn execute(&self, run: u64, input: Option<Value>) {
		let start = Instant::now();

		self.emit(JobEvent::Started {
			job_type: Arc::clone(&self.job_type),
			run,
		});

		let res = AssertUnwindSafe(self.handler.handle(input))
			.catch_unwind()
			.await
			.unwrap_or_else(|_| Err(BoxError::from("job handler panicked")));

		match res {
			Ok(()) => {
				let duration = start.elapsed();
				debug!(run, ?duration, "Job finished");
				self.emit(JobEvent::Succeeded {
					job_type: Arc::clone(&self.job_type),
					run,
					duration,
				});
			}
			Err(e) => {
				error!(run, %e, "Job failed, will retry on next trigger or interval");
				self.emit(JobEvent::Failed {
					job_type: Arc::clone(&self.job_type),
					run,
					error: e.to_string(),
				});
			}
		}
	}

	fn restart_debounce(&self, previous: Option<PendingRun>, input: Option<Value>) -> PendingRun {
		PendingRun {
			deadline: Instant::now() + self.policy.debounce,
			input: input.or_else(|| previous.and_then(|previous| previous.input)),
		}
	}

	fn next_forced_at(&self) -> Option<Instant> {
		self.policy.interval.map(|interval| Instant::now() + interval)
	}

	fn set_state(&self, state: JobState) {
		self.state_tx.send_replace(state);
	}

	fn emit(&self, event: JobEvent) {
		// No subscribers is the common case
		let _ = self.events_tx.send(event);
	}
}

async fn sleep_until_some(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => sleep_until(deadline).await,
		None => future::pending().await,
	}
}
