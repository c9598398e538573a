//! Real sessions against a real server, over the in-memory and TCP transports.

use td_core_shared_types::{
	AccountId, Change, ChangeId, DeviceId, ErrorKind, ErrorObject, NodeId, NodeMutation,
	NodeType, Sequence, WorkspaceId,
};
use td_core_sync::{
	db::open_database, BackoffConfig, ChangeSink, ChangeStatus, LocalChangeLog, NewChange,
	SessionEvent, SessionHandle, SessionIdentity, SessionState, SyncConfig, SyncSession,
	TcpTransport, Transport,
};
use td_core_sync_server::{
	serve_tcp, MemoryTransport, ServerStore, ServerSyncConfig, StaticTokens, SyncServer,
};

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::{
	net::TcpListener,
	sync::{broadcast, oneshot, Mutex},
	task::JoinHandle,
	time::{sleep, timeout},
};
use tracing::Instrument;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(10);
const TOKEN: &str = "secret";

fn sync_config() -> SyncConfig {
	SyncConfig {
		ack_timeout_ms: 500,
		max_retries: 3,
		auth_timeout_ms: 2_000,
		reconnect: BackoffConfig {
			initial_ms: 10,
			max_ms: 100,
			multiplier: 2.0,
			jitter: 0.0,
		},
		catch_up_interval_ms: 60_000,
		..Default::default()
	}
}

async fn start_server(dir: &TempDir) -> SyncServer {
	let db = open_database(dir.path().join("server.db")).await.unwrap();
	let store = ServerStore::open(db).await.unwrap();

	SyncServer::new(store, StaticTokens::new([TOKEN]), ServerSyncConfig::default())
}

#[derive(Default)]
struct MirrorSink {
	applied: Mutex<Vec<Change>>,
}

impl MirrorSink {
	async fn times_applied(&self, change_id: ChangeId) -> usize {
		self.applied
			.lock()
			.await
			.iter()
			.filter(|change| change.id == change_id)
			.count()
	}
}

#[async_trait]
impl ChangeSink for MirrorSink {
	async fn apply(&self, change: &Change) -> Result<(), ErrorObject> {
		self.applied.lock().await.push(change.clone());
		Ok(())
	}
}

/// One device syncing one workspace.
struct Device {
	log: LocalChangeLog,
	sink: Arc<MirrorSink>,
	handle: SessionHandle,
	events: broadcast::Receiver<SessionEvent>,
	account_id: AccountId,
	stop: Option<oneshot::Sender<()>>,
	task: JoinHandle<()>,
}

impl Device {
	async fn start(
		dir: &TempDir,
		name: &str,
		workspace_id: WorkspaceId,
		account_id: AccountId,
		transport: impl Transport,
	) -> Self {
		let db = open_database(dir.path().join(format!("{name}.db")))
			.await
			.unwrap();
		let log = LocalChangeLog::open(db, workspace_id).await.unwrap();

		let (mut session, handle) = SyncSession::new(
			sync_config(),
			SessionIdentity {
				account_id,
				device_id: DeviceId::new(),
				token: TOKEN.to_string(),
			},
			transport,
		);

		let sink = Arc::new(MirrorSink::default());
		let events = handle.subscribe();
		handle
			.subscribe_workspace(log.clone(), Arc::clone(&sink) as Arc<dyn ChangeSink>)
			.unwrap();

		let (stop_tx, stop_rx) = oneshot::channel::<()>();
		let task = tokio::spawn(
			async move {
				session
					.run(async move {
						let _ = stop_rx.await;
					})
					.await;
			}
			.in_current_span(),
		);

		Self {
			log,
			sink,
			handle,
			events,
			account_id,
			stop: Some(stop_tx),
			task,
		}
	}

	async fn append(
		&self,
		node_id: NodeId,
		mutation: NodeMutation,
		base_revision: Option<Sequence>,
	) -> ChangeId {
		let change = self
			.log
			.append(NewChange {
				node_id,
				created_by: self.account_id,
				mutation,
				base_revision,
			})
			.await
			.unwrap();

		self.handle.notify_pending(self.log.workspace_id()).unwrap();

		change.local_id
	}

	async fn next_event(&mut self, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
		timeout(WAIT, async {
			loop {
				let event = self.events.recv().await.unwrap();
				if matches(&event) {
					return event;
				}
			}
		})
		.await
		.expect("event never arrived")
	}

	async fn acknowledged(&mut self, local_id: ChangeId) -> Sequence {
		match self
			.next_event(|event| {
				matches!(event, SessionEvent::ChangeAcknowledged { local_id: id, .. } if *id == local_id)
			})
			.await
		{
			SessionEvent::ChangeAcknowledged { sequence, .. } => sequence,
			_ => unreachable!(),
		}
	}

	async fn wait_applied_through(&mut self, sequence: Sequence) {
		timeout(WAIT, async {
			while self.log.watermark().await.unwrap() < sequence {
				sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("changes never applied");
	}

	async fn wait_state(&self, state: SessionState) {
		let mut watch = self.handle.watch_state();
		timeout(WAIT, watch.wait_for(|current| *current == state))
			.await
			.expect("state never reached")
			.unwrap();
	}

	async fn shutdown(mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		timeout(WAIT, self.task).await.unwrap().unwrap();
	}
}

fn channel(name: &str) -> NodeMutation {
	NodeMutation::Create {
		node_type: NodeType::Channel,
		parent_id: None,
		attributes: json!({ "name": name }),
		mentions: vec![],
	}
}

fn message(parent: NodeId, text: &str) -> NodeMutation {
	NodeMutation::Create {
		node_type: NodeType::Message,
		parent_id: Some(parent),
		attributes: json!({ "text": text }),
		mentions: vec![],
	}
}

fn edit(text: &str) -> NodeMutation {
	NodeMutation::Update {
		attributes: json!({ "text": text }),
		mentions: vec![],
	}
}

#[tokio::test]
#[traced_test]
async fn change_made_offline_is_resent_acknowledged_and_applied_once() {
	let dir = TempDir::new().unwrap();
	let server = start_server(&dir).await;
	let transport = Arc::new(MemoryTransport::new(server.clone()));
	transport.set_online(false).await;

	let workspace_id = WorkspaceId::new();
	let mut device = Device::start(
		&dir,
		"device",
		workspace_id,
		AccountId::new(),
		Arc::clone(&transport),
	)
	.await;

	let l1 = device.append(NodeId::new(), channel("general"), None).await;
	sleep(Duration::from_millis(50)).await;
	assert_eq!(
		device.log.get(l1).await.unwrap().unwrap().status,
		ChangeStatus::Pending
	);

	transport.set_online(true).await;

	let sequence = device.acknowledged(l1).await;
	assert_eq!(sequence, 1);

	let entry = device.log.get(l1).await.unwrap().unwrap();
	assert_eq!(entry.status, ChangeStatus::Acknowledged);
	assert_eq!(entry.sequence, Some(1));

	device.wait_applied_through(1).await;
	device.wait_state(SessionState::Idle).await;
	assert_eq!(device.sink.times_applied(l1).await, 1);

	device.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn offline_edits_reach_the_server_in_append_order() {
	let dir = TempDir::new().unwrap();
	let server = start_server(&dir).await;
	let transport = Arc::new(MemoryTransport::new(server.clone()));
	transport.set_online(false).await;

	let workspace_id = WorkspaceId::new();
	let mut device = Device::start(
		&dir,
		"device",
		workspace_id,
		AccountId::new(),
		Arc::clone(&transport),
	)
	.await;

	// Each edit depends on the one before it, any reordering would be rejected by the server
	let channel_id = NodeId::new();
	let message_id = NodeId::new();
	let appended = [
		device.append(channel_id, channel("general"), None).await,
		device.append(message_id, message(channel_id, "draft"), None).await,
		device.append(message_id, edit("second"), Some(2)).await,
		device.append(message_id, edit("final"), Some(3)).await,
	];

	transport.set_online(true).await;

	for (expected, local_id) in (1..).zip(appended) {
		assert_eq!(device.acknowledged(local_id).await, expected);
	}

	device.wait_applied_through(4).await;

	let node = server
		.store()
		.node(workspace_id, message_id)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(node.attributes, json!({ "text": "final" }));
	assert_eq!(node.revision, 4);
	assert!(device.log.failed().await.unwrap().is_empty());

	device.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn stale_edit_fails_as_conflict_without_retry() {
	let dir = TempDir::new().unwrap();
	let server = start_server(&dir).await;
	let transport = Arc::new(MemoryTransport::new(server));

	let mut device = Device::start(
		&dir,
		"device",
		WorkspaceId::new(),
		AccountId::new(),
		Arc::clone(&transport),
	)
	.await;

	let channel_id = NodeId::new();
	let created = device.append(channel_id, channel("general"), None).await;
	assert_eq!(device.acknowledged(created).await, 1);

	let first = device.append(channel_id, edit("mine"), Some(1)).await;
	let stale = device.append(channel_id, edit("also mine"), Some(1)).await;

	assert_eq!(device.acknowledged(first).await, 2);

	let SessionEvent::ChangeFailed { error, .. } = device
		.next_event(|event| {
			matches!(event, SessionEvent::ChangeFailed { local_id, .. } if *local_id == stale)
		})
		.await
	else {
		unreachable!()
	};
	assert_eq!(error.kind, ErrorKind::Conflict);

	let failed = device.log.failed().await.unwrap();
	assert_eq!(failed.len(), 1);
	assert_eq!(failed[0].local_id, stale);
	assert_eq!(failed[0].retry_count, 1);
	assert_eq!(
		failed[0].last_error.as_ref().map(|e| e.kind),
		Some(ErrorKind::Conflict)
	);

	device.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn changes_fan_out_to_other_devices_and_survive_reconnects() {
	let dir = TempDir::new().unwrap();
	let server = start_server(&dir).await;
	let workspace_id = WorkspaceId::new();

	let author_transport = Arc::new(MemoryTransport::new(server.clone()));
	let reader_transport = Arc::new(MemoryTransport::new(server.clone()));

	let mut author = Device::start(
		&dir,
		"author",
		workspace_id,
		AccountId::new(),
		Arc::clone(&author_transport),
	)
	.await;
	let mut reader = Device::start(
		&dir,
		"reader",
		workspace_id,
		AccountId::new(),
		Arc::clone(&reader_transport),
	)
	.await;

	author.wait_state(SessionState::Idle).await;
	reader.wait_state(SessionState::Idle).await;

	let channel_id = NodeId::new();
	let created = author.append(channel_id, channel("general"), None).await;
	author.acknowledged(created).await;
	reader.wait_applied_through(1).await;

	// The reader misses changes while offline and replays them from its watermark on return
	reader_transport.set_online(false).await;
	for text in ["one", "two", "three"] {
		let id = author.append(NodeId::new(), message(channel_id, text), None).await;
		author.acknowledged(id).await;
	}

	reader_transport.set_online(true).await;
	reader.wait_applied_through(4).await;

	let applied = reader
		.sink
		.applied
		.lock()
		.await
		.iter()
		.map(|change| change.sequence)
		.collect::<Vec<_>>();
	assert_eq!(applied, vec![1, 2, 3, 4]);
	assert_eq!(reader.sink.times_applied(created).await, 1);

	author.shutdown().await;
	reader.shutdown().await;

	// The server saw the reader acknowledge the replay before it left
	timeout(WAIT, async {
		while !logs_contain("acked=4") {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("acknowledged cursor never reported");
}

#[tokio::test]
#[traced_test]
async fn session_syncs_over_tcp() {
	let dir = TempDir::new().unwrap();
	let server = start_server(&dir).await;

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let (stop_tx, stop_rx) = oneshot::channel::<()>();
	let listening = tokio::spawn(
		serve_tcp(listener, server.clone(), async move {
			let _ = stop_rx.await;
		})
		.in_current_span(),
	);

	let workspace_id = WorkspaceId::new();
	let mut device = Device::start(
		&dir,
		"device",
		workspace_id,
		AccountId::new(),
		TcpTransport::from_url(&format!("tcp://{addr}")).unwrap(),
	)
	.await;

	let channel_id = NodeId::new();
	let created = device.append(channel_id, channel("general"), None).await;
	assert_eq!(device.acknowledged(created).await, 1);
	device.wait_applied_through(1).await;

	assert!(server
		.store()
		.node(workspace_id, channel_id)
		.await
		.unwrap()
		.is_some());

	device.shutdown().await;
	stop_tx.send(()).unwrap();
	timeout(WAIT, listening).await.unwrap().unwrap().unwrap();
}
