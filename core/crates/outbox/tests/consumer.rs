use td_core_outbox::{
	store::LEASE_EXPIRED, NewOutboxTask, NodeCleanup, OutboxConfig, OutboxConsumer, OutboxHandler, OutboxHandlers,
	OutboxStatus, OutboxStore, OutboxTask, OutboxTaskKind, SendEmail, TaskError,
};
use td_core_shared_types::{AccountId, ChangeId, NodeId, WorkspaceId};
use td_core_sync::db::open_database;

use std::{
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::{
	sync::{mpsc, oneshot},
	time::{sleep, timeout},
};
use tracing::Instrument;
use tracing_test::traced_test;

async fn open_store() -> (TempDir, OutboxStore) {
	let dir = TempDir::new().unwrap();
	let db = open_database(dir.path().join("outbox.db")).await.unwrap();
	let store = OutboxStore::open(db).await.unwrap();

	(dir, store)
}

fn email_task() -> NewOutboxTask {
	SendEmail {
		workspace_id: WorkspaceId::new(),
		recipient: AccountId::new(),
		mentioned_by: AccountId::new(),
		node_id: NodeId::new(),
		change_id: ChangeId::new(),
	}
	.into_task()
	.unwrap()
}

/// Records the dedupe key of every delivery it performs.
#[derive(Default)]
struct RecordingHandler {
	delivered: Mutex<Vec<String>>,
	failures_left: AtomicU32,
	permanent: bool,
	done_tx: Option<mpsc::UnboundedSender<String>>,
}

impl RecordingHandler {
	fn failing(times: u32) -> Self {
		Self {
			failures_left: AtomicU32::new(times),
			..Default::default()
		}
	}

	fn delivered(&self) -> Vec<String> {
		self.delivered.lock().unwrap().clone()
	}
}

#[async_trait]
impl OutboxHandler for RecordingHandler {
	async fn handle(&self, task: &OutboxTask) -> Result<(), TaskError> {
		if self.permanent {
			return Err(TaskError::Permanent("recipient rejected".into()));
		}

		if self
			.failures_left
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok()
		{
			return Err(TaskError::Retryable("mail relay unavailable".into()));
		}

		let _payload = task.payload::<SendEmail>()?;
		self.delivered.lock().unwrap().push(task.dedupe_key.clone());
		if let Some(done_tx) = &self.done_tx {
			done_tx.send(task.dedupe_key.clone()).unwrap();
		}

		Ok(())
	}
}

fn consumer_with(
	store: &OutboxStore,
	handler: Arc<RecordingHandler>,
	config: OutboxConfig,
) -> OutboxConsumer {
	let handlers = OutboxHandlers::builder()
		.register(OutboxTaskKind::SendEmail, handler)
		.unwrap()
		.build();

	OutboxConsumer::new(store.clone(), Arc::new(handlers), config)
}

fn fast_config() -> OutboxConfig {
	OutboxConfig {
		poll_interval_ms: 20,
		lease_ms: 60_000,
		max_attempts: 3,
		backoff_base_ms: 0,
		backoff_max_ms: 0,
		..Default::default()
	}
}

#[tokio::test]
async fn lease_is_exclusive() {
	let (_dir, store) = open_store().await;
	assert!(store.enqueue(email_task()).await.unwrap());

	let leased = store
		.lease_next("a", Duration::from_secs(60))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(leased.status, OutboxStatus::InFlight);
	assert_eq!(leased.lease_owner.as_deref(), Some("a"));

	assert!(store
		.lease_next("b", Duration::from_secs(60))
		.await
		.unwrap()
		.is_none());
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_stale_owner_cannot_complete() {
	let (_dir, store) = open_store().await;
	store.enqueue(email_task()).await.unwrap();

	let first = store
		.lease_next("a", Duration::from_millis(50))
		.await
		.unwrap()
		.unwrap();

	sleep(Duration::from_millis(120)).await;

	let second = store
		.lease_next("b", Duration::from_secs(60))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(first.id, second.id);
	// The run that never reported back still counts
	assert_eq!(second.attempts, 1);
	assert_eq!(second.last_error.as_deref(), Some(LEASE_EXPIRED));

	assert!(!store.complete(first.id, "a").await.unwrap());
	assert!(store.complete(second.id, "b").await.unwrap());
	assert!(store.is_processed(&second.dedupe_key).await.unwrap());
	assert_eq!(
		store.get(second.id).await.unwrap().unwrap().status,
		OutboxStatus::Done
	);
}

#[tokio::test]
#[traced_test]
async fn redelivered_task_runs_its_effect_once() {
	let (_dir, store) = open_store().await;
	let task = email_task();
	let key = task.dedupe_key.clone();
	store.enqueue(task.clone()).await.unwrap();

	// A consumer that leases the task and dies without finishing it
	store
		.lease_next("crashed", Duration::from_millis(50))
		.await
		.unwrap()
		.unwrap();
	sleep(Duration::from_millis(120)).await;

	let handler = Arc::new(RecordingHandler::default());
	let consumer = consumer_with(&store, Arc::clone(&handler), fast_config());

	assert!(consumer.process_next().await.unwrap());
	assert!(!consumer.process_next().await.unwrap());

	// The producer replays the same change and enqueues the task again
	assert!(!store.enqueue(task).await.unwrap());
	assert!(!consumer.process_next().await.unwrap());

	assert_eq!(handler.delivered(), vec![key]);
}

#[tokio::test]
#[traced_test]
async fn crashed_runs_use_up_the_attempt_budget() {
	let (_dir, store) = open_store().await;
	store.enqueue(email_task()).await.unwrap();

	// Every holder dies mid-run, e.g. the effect takes the process down with it
	for owner in ["crashed-1", "crashed-2", "crashed-3"] {
		store
			.lease_next(owner, Duration::from_millis(30))
			.await
			.unwrap()
			.unwrap();
		sleep(Duration::from_millis(80)).await;
	}

	let handler = Arc::new(RecordingHandler::default());
	let consumer = consumer_with(&store, Arc::clone(&handler), fast_config());
	let mut failures = consumer.subscribe_failures();

	assert!(consumer.process_next().await.unwrap());
	assert!(!consumer.process_next().await.unwrap());
	assert!(handler.delivered().is_empty());

	let failure = failures.try_recv().unwrap();
	assert_eq!(failure.attempts, 3);
	assert_eq!(failure.error, LEASE_EXPIRED);

	let failed = store.failed().await.unwrap();
	assert_eq!(failed.len(), 1);
	assert_eq!(failed[0].attempts, 3);
	assert!(failed[0].lease_owner.is_none());
	assert!(logs_contain("Outbox task failed for good"));
}

/// Sleeps through every run, tracking how many overlap.
#[derive(Default)]
struct SlowHandler {
	running: AtomicU32,
	max_running: AtomicU32,
}

struct Running<'a>(&'a AtomicU32);

impl Drop for Running<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl OutboxHandler for SlowHandler {
	async fn handle(&self, _task: &OutboxTask) -> Result<(), TaskError> {
		let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
		let _running = Running(&self.running);
		self.max_running.fetch_max(now_running, Ordering::SeqCst);

		sleep(Duration::from_millis(300)).await;

		Ok(())
	}
}

#[tokio::test]
#[traced_test]
async fn handler_is_cut_off_when_its_lease_runs_out() {
	let (_dir, store) = open_store().await;
	let task = email_task();
	let key = task.dedupe_key.clone();
	store.enqueue(task).await.unwrap();

	let handler = Arc::new(SlowHandler::default());
	let config = OutboxConfig {
		lease_ms: 50,
		max_attempts: 5,
		..fast_config()
	};
	let consumer = |config| {
		let handlers = OutboxHandlers::builder()
			.register(OutboxTaskKind::SendEmail, Arc::clone(&handler))
			.unwrap()
			.build();
		OutboxConsumer::new(store.clone(), Arc::new(handlers), config)
	};
	let a = consumer(config.clone());
	let b = consumer(config);

	let (ran_a, ran_b) = tokio::join!(a.process_next(), async {
		// Well past a's lease, while a's handler would still be sleeping
		sleep(Duration::from_millis(100)).await;
		b.process_next().await
	});
	assert!(ran_a.unwrap());
	assert!(ran_b.unwrap());

	assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
	assert_eq!(handler.running.load(Ordering::SeqCst), 0);

	let queued = store.get_by_key(&key).await.unwrap().unwrap();
	assert_eq!(queued.status, OutboxStatus::Queued);
	assert_eq!(queued.attempts, 2);
	assert!(queued.lease_owner.is_none());
	assert!(queued
		.last_error
		.as_deref()
		.is_some_and(|e| e.contains("lease")));
	assert!(logs_contain("Outbox task outlived its lease"));
}

#[tokio::test]
async fn duplicate_enqueue_is_ignored() {
	let (_dir, store) = open_store().await;
	let task = email_task();

	assert!(store.enqueue(task.clone()).await.unwrap());
	assert!(!store.enqueue(task.clone()).await.unwrap());

	let stored = store.get_by_key(&task.dedupe_key).await.unwrap().unwrap();
	assert_eq!(stored.kind, OutboxTaskKind::SendEmail);
	assert_eq!(stored.status, OutboxStatus::Queued);
}

#[tokio::test]
#[traced_test]
async fn task_fails_for_good_after_max_attempts() {
	let (_dir, store) = open_store().await;
	store.enqueue(email_task()).await.unwrap();

	let handler = Arc::new(RecordingHandler::failing(u32::MAX));
	let consumer = consumer_with(&store, Arc::clone(&handler), fast_config());
	let mut failures = consumer.subscribe_failures();

	for _ in 0..3 {
		assert!(consumer.process_next().await.unwrap());
	}
	assert!(!consumer.process_next().await.unwrap());

	let failure = failures.try_recv().unwrap();
	assert_eq!(failure.kind, OutboxTaskKind::SendEmail);
	assert_eq!(failure.attempts, 3);
	assert_eq!(failure.error, "mail relay unavailable");

	let failed = store.failed().await.unwrap();
	assert_eq!(failed.len(), 1);
	assert_eq!(failed[0].attempts, 3);
	assert_eq!(failed[0].last_error.as_deref(), Some("mail relay unavailable"));
	assert!(handler.delivered().is_empty());
	assert!(logs_contain("Outbox task failed for good"));

	// A manual retry starts over with a fresh budget
	assert!(store.requeue_failed(failed[0].id).await.unwrap());
	assert!(consumer.process_next().await.unwrap());
	assert_eq!(
		store.get(failed[0].id).await.unwrap().unwrap().status,
		OutboxStatus::Queued
	);
}

#[tokio::test]
async fn retryable_error_waits_for_backoff() {
	let (_dir, store) = open_store().await;
	let task = email_task();
	let key = task.dedupe_key.clone();
	store.enqueue(task).await.unwrap();

	let handler = Arc::new(RecordingHandler::failing(1));
	let consumer = consumer_with(
		&store,
		Arc::clone(&handler),
		OutboxConfig {
			backoff_base_ms: 60_000,
			backoff_max_ms: 60_000,
			..fast_config()
		},
	);

	assert!(consumer.process_next().await.unwrap());
	// Queued again, but not before its backoff elapses
	assert!(!consumer.process_next().await.unwrap());

	let queued = store.get_by_key(&key).await.unwrap().unwrap();
	assert_eq!(queued.status, OutboxStatus::Queued);
	assert_eq!(queued.attempts, 1);
	assert!(queued.lease_owner.is_none());
	assert!(queued.available_at > chrono::Utc::now() + chrono::TimeDelta::seconds(50));
	assert!(handler.delivered().is_empty());
}

#[tokio::test]
async fn permanent_error_fails_without_retry() {
	let (_dir, store) = open_store().await;
	store.enqueue(email_task()).await.unwrap();

	let handler = Arc::new(RecordingHandler {
		permanent: true,
		..Default::default()
	});
	let consumer = consumer_with(&store, handler, fast_config());

	assert!(consumer.process_next().await.unwrap());

	let failed = store.failed().await.unwrap();
	assert_eq!(failed.len(), 1);
	assert_eq!(failed[0].attempts, 1);
}

#[tokio::test]
async fn task_without_handler_fails() {
	let (_dir, store) = open_store().await;
	store
		.enqueue(
			NodeCleanup {
				workspace_id: WorkspaceId::new(),
				node_id: NodeId::new(),
				change_id: ChangeId::new(),
			}
			.into_task()
			.unwrap(),
		)
		.await
		.unwrap();

	let consumer = consumer_with(&store, Arc::new(RecordingHandler::default()), fast_config());
	assert!(consumer.process_next().await.unwrap());

	let failed = store.failed().await.unwrap();
	assert_eq!(failed[0].kind, OutboxTaskKind::NodeCleanup);
	assert!(failed[0]
		.last_error
		.as_deref()
		.is_some_and(|e| e.contains("no handler")));
}

#[test]
fn registering_a_kind_twice_is_rejected() {
	let result = OutboxHandlers::builder()
		.register(OutboxTaskKind::SendEmail, RecordingHandler::default())
		.unwrap()
		.register(OutboxTaskKind::SendEmail, RecordingHandler::default());

	assert!(result.is_err());
}

#[tokio::test]
async fn prune_removes_done_tasks() {
	let (_dir, store) = open_store().await;
	store.enqueue(email_task()).await.unwrap();
	store.enqueue(email_task()).await.unwrap();

	let task = store
		.lease_next("a", Duration::from_secs(60))
		.await
		.unwrap()
		.unwrap();
	store.complete(task.id, "a").await.unwrap();

	sleep(Duration::from_millis(5)).await;

	assert_eq!(store.prune_done(Duration::ZERO).await.unwrap(), 1);
	assert!(store.get(task.id).await.unwrap().is_none());
	assert!(!store.is_processed(&task.dedupe_key).await.unwrap());
	assert!(store
		.lease_next("a", Duration::from_secs(60))
		.await
		.unwrap()
		.is_some());
}

#[tokio::test]
async fn running_consumer_picks_up_notified_tasks() {
	let (_dir, store) = open_store().await;

	let (done_tx, mut done_rx) = mpsc::unbounded_channel();
	let handler = Arc::new(RecordingHandler {
		done_tx: Some(done_tx),
		..Default::default()
	});
	let consumer = Arc::new(consumer_with(
		&store,
		handler,
		OutboxConfig {
			poll_interval_ms: 60_000,
			..fast_config()
		},
	));

	let (stop_tx, stop_rx) = oneshot::channel::<()>();
	let runner = tokio::spawn({
		let consumer = Arc::clone(&consumer);
		async move {
			consumer
				.run(async move {
					let _ = stop_rx.await;
				})
				.await;
		}
		.in_current_span()
	});

	let task = email_task();
	store.enqueue(task.clone()).await.unwrap();
	consumer.notifier().notify_one();

	let delivered = timeout(Duration::from_secs(5), done_rx.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(delivered, task.dedupe_key);

	stop_tx.send(()).unwrap();
	runner.await.unwrap();
}
