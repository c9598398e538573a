use td_job_scheduler::{
	BoxError, JobEvent, JobHandler, JobPolicy, JobSchedulerBuilder, JobState, SchedulerError,
};

use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{sync::Mutex, time::sleep};
use tracing_test::traced_test;

#[derive(Default)]
struct Recorder {
	runs: AtomicUsize,
	inputs: Mutex<Vec<Option<Value>>>,
	work: Duration,
	fail_first: usize,
}

impl Recorder {
	fn runs(&self) -> usize {
		self.runs.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl JobHandler for Recorder {
	async fn handle(&self, input: Option<Value>) -> Result<(), BoxError> {
		let run = self.runs.fetch_add(1, Ordering::SeqCst);
		self.inputs.lock().await.push(input);

		if !self.work.is_zero() {
			sleep(self.work).await;
		}

		if run < self.fail_first {
			return Err("transient failure".into());
		}

		Ok(())
	}
}

const DEBOUNCE: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn triggers_within_debounce_window_run_once() {
	let recorder = Arc::new(Recorder::default());
	let scheduler = JobSchedulerBuilder::new()
		.register("radar.verify", JobPolicy::debounced(DEBOUNCE), Arc::clone(&recorder))
		.unwrap()
		.build();

	for i in 0..10 {
		scheduler.trigger("radar.verify", Some(json!(i))).unwrap();
		sleep(Duration::from_millis(20)).await;
	}

	assert_eq!(scheduler.state("radar.verify").unwrap(), JobState::Debouncing);
	assert_eq!(recorder.runs(), 0);

	sleep(DEBOUNCE * 5).await;

	assert_eq!(recorder.runs(), 1);
	assert_eq!(*recorder.inputs.lock().await, vec![Some(json!(9))]);
	assert_eq!(scheduler.state("radar.verify").unwrap(), JobState::Idle);

	scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn interval_forces_progress_under_continuous_triggers() {
	let interval = Duration::from_millis(300);
	let recorder = Arc::new(Recorder::default());
	let scheduler = JobSchedulerBuilder::new()
		.register(
			"changes.cleanup",
			JobPolicy::debounced(DEBOUNCE).with_interval(interval),
			Arc::clone(&recorder),
		)
		.unwrap()
		.build();

	// A trigger every 50ms never lets the 100ms debounce elapse
	for _ in 0..24 {
		scheduler.trigger("changes.cleanup", None).unwrap();
		sleep(Duration::from_millis(50)).await;
	}

	// 1200ms of continuous triggering with a 300ms interval
	assert!(recorder.runs() >= 3, "only {} runs", recorder.runs());

	scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn interval_runs_without_triggers() {
	let recorder = Arc::new(Recorder::default());
	let scheduler = JobSchedulerBuilder::new()
		.register(
			"changes.cleanup",
			JobPolicy::debounced(DEBOUNCE).with_interval(Duration::from_secs(1)),
			Arc::clone(&recorder),
		)
		.unwrap()
		.build();

	sleep(Duration::from_millis(3500)).await;
	assert_eq!(recorder.runs(), 3);

	scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn triggers_while_running_coalesce_into_one_rerun() {
	let recorder = Arc::new(Recorder {
		work: Duration::from_millis(500),
		..Default::default()
	});
	let scheduler = JobSchedulerBuilder::new()
		.register("radar.verify", JobPolicy::debounced(DEBOUNCE), Arc::clone(&recorder))
		.unwrap()
		.build();

	scheduler.trigger("radar.verify", Some(json!("first"))).unwrap();
	sleep(DEBOUNCE + Duration::from_millis(50)).await;
	assert_eq!(scheduler.state("radar.verify").unwrap(), JobState::Running);

	for i in 0..5 {
		scheduler.trigger("radar.verify", Some(json!(i))).unwrap();
	}

	sleep(Duration::from_secs(5)).await;

	assert_eq!(recorder.runs(), 2);
	assert_eq!(
		*recorder.inputs.lock().await,
		vec![Some(json!("first")), Some(json!(4))]
	);

	scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn failures_are_not_fatal() {
	let recorder = Arc::new(Recorder {
		fail_first: 1,
		..Default::default()
	});
	let scheduler = JobSchedulerBuilder::new()
		.register("radar.verify", JobPolicy::debounced(DEBOUNCE), Arc::clone(&recorder))
		.unwrap()
		.build();
	let mut events = scheduler.subscribe();

	scheduler.trigger("radar.verify", None).unwrap();
	sleep(DEBOUNCE * 2).await;

	assert!(matches!(events.recv().await, Ok(JobEvent::Started { run: 1, .. })));
	assert!(matches!(
		events.recv().await,
		Ok(JobEvent::Failed { run: 1, error, .. }) if error == "transient failure"
	));
	assert_eq!(scheduler.state("radar.verify").unwrap(), JobState::Idle);
	assert!(logs_contain("Job failed"));

	scheduler.trigger("radar.verify", None).unwrap();
	sleep(DEBOUNCE * 2).await;

	assert!(matches!(events.recv().await, Ok(JobEvent::Started { run: 2, .. })));
	assert!(matches!(events.recv().await, Ok(JobEvent::Succeeded { run: 2, .. })));
	assert_eq!(recorder.runs(), 2);

	scheduler.shutdown().await;
}

struct Panicker;

#[async_trait]
impl JobHandler for Panicker {
	async fn handle(&self, _: Option<Value>) -> Result<(), BoxError> {
		panic!("handler exploded");
	}
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn panicking_handler_keeps_scheduler_alive() {
	let scheduler = JobSchedulerBuilder::new()
		.register("explodes", JobPolicy::debounced(DEBOUNCE), Panicker)
		.unwrap()
		.build();
	let mut events = scheduler.subscribe();

	for _ in 0..2 {
		scheduler.trigger("explodes", None).unwrap();
		sleep(DEBOUNCE * 2).await;
	}

	let mut failures = 0;
	while let Ok(event) = events.try_recv() {
		if matches!(event, JobEvent::Failed { .. }) {
			failures += 1;
		}
	}
	assert_eq!(failures, 2);

	scheduler.shutdown().await;
}

#[tokio::test]
async fn registration_and_lookup_errors() {
	let recorder = Arc::new(Recorder::default());

	let Err(err) = JobSchedulerBuilder::new()
		.register("radar.verify", JobPolicy::debounced(DEBOUNCE), Arc::clone(&recorder))
		.and_then(|b| b.register("radar.verify", JobPolicy::debounced(DEBOUNCE), recorder))
	else {
		panic!("duplicate job type must be rejected");
	};
	assert_eq!(err, SchedulerError::DuplicateJob("radar.verify".to_string()));

	let scheduler = JobSchedulerBuilder::new().build();
	assert_eq!(
		scheduler.trigger("nope", None),
		Err(SchedulerError::UnknownJob("nope".to_string()))
	);
	assert!(scheduler.job_types().is_empty());
}
