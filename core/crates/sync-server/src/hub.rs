use crate::{
	auth::Authenticator,
	config::ServerSyncConfig,
	store::{MutationOutcome, ServerStore},
};

use td_core_shared_types::{
	AccountId, Change, DeviceId, ErrorObject, Sequence, SessionId, WorkspaceId,
};
use td_core_sync::wire::{ClientMessage, MutationEnvelope, ServerMessage};

use std::{
	collections::{HashMap, HashSet},
	future::IntoFuture,
	pin::pin,
	sync::Arc,
};

use tokio::{
	sync::{mpsc, Notify, RwLock},
	time::timeout,
};
use tracing::{debug, error, info, instrument, trace, warn};

type Subscribers = HashMap<WorkspaceId, HashMap<SessionId, mpsc::Sender<ServerMessage>>>;

struct Inner {
	store: ServerStore,
	authenticator: Arc<dyn Authenticator>,
	config: ServerSyncConfig,
	subscribers: RwLock<Subscribers>,
	outbox_notify: Option<Arc<Notify>>,
}

/// Routes messages between authenticated sessions and the change store.
#[derive(Clone)]
pub struct SyncServer {
	inner: Arc<Inner>,
}

/// One authenticated connection.
struct Peer {
	session_id: SessionId,
	account_id: AccountId,
	device_id: DeviceId,
	tx: mpsc::Sender<ServerMessage>,
	subscriptions: HashSet<WorkspaceId>,
	acked: HashMap<WorkspaceId, Sequence>,
}

impl Peer {
	async fn send(&self, message: ServerMessage) -> bool {
		self.tx.send(message).await.is_ok()
	}
}

impl SyncServer {
	pub fn new(
		store: ServerStore,
		authenticator: impl Authenticator,
		config: ServerSyncConfig,
	) -> Self {
		Self::build(store, Arc::new(authenticator), config, None)
	}

	/// Like [`SyncServer::new`], waking `outbox_notify` whenever a change queues outbox tasks.
	pub fn with_outbox(
		store: ServerStore,
		authenticator: impl Authenticator,
		config: ServerSyncConfig,
		outbox_notify: Arc<Notify>,
	) -> Self {
		Self::build(store, Arc::new(authenticator), config, Some(outbox_notify))
	}

	fn build(
		store: ServerStore,
		authenticator: Arc<dyn Authenticator>,
		config: ServerSyncConfig,
		outbox_notify: Option<Arc<Notify>>,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				store,
				authenticator,
				config,
				subscribers: RwLock::default(),
				outbox_notify,
			}),
		}
	}

	#[must_use]
	pub fn store(&self) -> &ServerStore {
		&self.inner.store
	}

	#[must_use]
	pub fn config(&self) -> &ServerSyncConfig {
		&self.inner.config
	}

	pub async fn subscriber_count(&self, workspace_id: WorkspaceId) -> usize {
		self.inner
			.subscribers
			.read()
			.await
			.get(&workspace_id)
			.map_or(0, HashMap::len)
	}

	/// Talks to one client until it hangs up or `stop` resolves.
	///
	/// The first message must be `init`. Every later message is handled in arrival order, which
	/// keeps a session's mutations in the order the client sent them.
	pub async fn serve(
		&self,
		mut rx: mpsc::Receiver<ClientMessage>,
		tx: mpsc::Sender<ServerMessage>,
		stop: impl IntoFuture<Output = ()>,
	) {
		let mut stop = pin!(stop.into_future());

		let authenticated = tokio::select! {
			() = &mut stop => return,
			res = timeout(self.inner.config.auth_timeout(), self.authenticate(&mut rx, &tx)) => res,
		};

		let Ok(Some(mut peer)) = authenticated else {
			debug!("Connection closed before authenticating");
			return;
		};

		info!(
			session_id = %peer.session_id,
			account_id = %peer.account_id,
			device_id = %peer.device_id,
			"Sync session started",
		);

		loop {
			let message = tokio::select! {
				() = &mut stop => break,
				message = rx.recv() => message,
			};

			let Some(message) = message else {
				break;
			};

			if !self.handle_message(&mut peer, message).await {
				break;
			}
		}

		self.drop_peer(&peer).await;

		info!(session_id = %peer.session_id, "Sync session ended");
	}

	async fn authenticate(
		&self,
		rx: &mut mpsc::Receiver<ClientMessage>,
		tx: &mpsc::Sender<ServerMessage>,
	) -> Option<Peer> {
		let reject = |reason: String| async move {
			warn!(%reason, "Rejected sync session;");
			let _ = tx.send(ServerMessage::AuthFailed { reason }).await;
			None::<Peer>
		};

		let Some(ClientMessage::Init {
			account_id,
			device_id,
			token,
		}) = rx.recv().await
		else {
			return reject("expected init".to_string()).await;
		};

		if let Err(reason) = self
			.inner
			.authenticator
			.authenticate(account_id, device_id, &token)
			.await
		{
			return reject(reason).await;
		}

		let session_id = SessionId::new();
		tx.send(ServerMessage::Authenticated { session_id })
			.await
			.ok()?;

		Some(Peer {
			session_id,
			account_id,
			device_id,
			tx: tx.clone(),
			subscriptions: HashSet::new(),
			acked: HashMap::new(),
		})
	}

	/// Returns `false` once the peer can't be written to anymore.
	#[instrument(skip_all, fields(session_id = %peer.session_id))]
	async fn handle_message(&self, peer: &mut Peer, message: ClientMessage) -> bool {
		match message {
			ClientMessage::Init { .. } => {
				peer.send(ServerMessage::Error {
					error: ErrorObject::validation("session already authenticated"),
				})
				.await
			}

			ClientMessage::Subscribe {
				workspace_id,
				cursor,
			} => self.subscribe(peer, workspace_id, cursor).await,

			ClientMessage::Unsubscribe { workspace_id } => {
				peer.subscriptions.remove(&workspace_id);
				self.remove_subscriber(workspace_id, peer.session_id).await;
				debug!(%workspace_id, "Unsubscribed");
				true
			}

			ClientMessage::ServerMutation {
				account_id,
				mutation,
			} => self.mutate(peer, account_id, mutation).await,

			ClientMessage::ServerChangeAck {
				workspace_id,
				change_id,
				sequence,
			} => {
				let acked = peer.acked.entry(workspace_id).or_default();
				*acked = (*acked).max(sequence);
				trace!(%workspace_id, %change_id, sequence, "Client acknowledged changes");
				true
			}

			ClientMessage::ServerChangesRequest {
				workspace_id,
				after_sequence,
				limit,
			} => self.send_batch(peer, workspace_id, after_sequence, limit).await,
		}
	}

	/// Registers the peer before replaying, so no change committed in between is missed. One that
	/// arrives both ways is dropped by the client as already applied.
	async fn subscribe(&self, peer: &mut Peer, workspace_id: WorkspaceId, cursor: Sequence) -> bool {
		peer.subscriptions.insert(workspace_id);
		self.inner
			.subscribers
			.write()
			.await
			.entry(workspace_id)
			.or_default()
			.insert(peer.session_id, peer.tx.clone());

		debug!(%workspace_id, cursor, "Subscribed");

		self.send_batch(peer, workspace_id, cursor, self.inner.config.max_batch_size)
			.await
	}

	async fn send_batch(
		&self,
		peer: &Peer,
		workspace_id: WorkspaceId,
		after_sequence: Sequence,
		limit: u32,
	) -> bool {
		let limit = limit.clamp(1, self.inner.config.max_batch_size.max(1));

		match self
			.inner
			.store
			.changes_after(workspace_id, after_sequence, limit)
			.await
		{
			Ok((changes, has_more)) => {
				trace!(%workspace_id, after_sequence, count = changes.len(), has_more, "Sending batch");
				peer.send(ServerMessage::ServerChangeBatch {
					workspace_id,
					changes,
					has_more,
				})
				.await
			}
			Err(e) => {
				error!(?e, %workspace_id, "Failed to read changes for replay;");
				peer.send(ServerMessage::Error { error: e.into() }).await
			}
		}
	}

	async fn mutate(&self, peer: &Peer, account_id: AccountId, envelope: MutationEnvelope) -> bool {
		let change_id = envelope.id;
		let workspace_id = envelope.workspace_id;

		let outcome = if account_id == peer.account_id {
			self.inner.store.apply_mutation(account_id, &envelope).await
		} else {
			Ok(MutationOutcome::Rejected(ErrorObject::validation(
				"mutation account doesn't match the session",
			)))
		};

		let (result, applied) = match outcome {
			Ok(MutationOutcome::Applied { change, tasks }) => {
				if tasks > 0 {
					if let Some(notify) = &self.inner.outbox_notify {
						notify.notify_one();
					}
				}
				(Ok(change.sequence), Some(change))
			}
			Ok(MutationOutcome::Duplicate(change)) => (Ok(change.sequence), None),
			Ok(MutationOutcome::Rejected(error)) => {
				debug!(%change_id, %error, "Mutation rejected");
				(Err(error), None)
			}
			Err(e) => {
				error!(?e, %change_id, "Failed to apply mutation;");
				(Err(ErrorObject::from(e)), None)
			}
		};

		let delivered = peer
			.send(match result {
				Ok(sequence) => ServerMessage::ServerChangeResult {
					change_id,
					workspace_id,
					success: true,
					sequence: Some(sequence),
					error: None,
				},
				Err(error) => ServerMessage::ServerChangeResult {
					change_id,
					workspace_id,
					success: false,
					sequence: None,
					error: Some(error),
				},
			})
			.await;

		if let Some(change) = applied {
			self.broadcast(change).await;
		}

		delivered
	}

	/// Pushes a new change to every session subscribed to its workspace. A session whose buffer
	/// is full misses it and recovers through replay.
	async fn broadcast(&self, change: Change) {
		let workspace_id = change.workspace_id;
		let sequence = change.sequence;
		let mut closed = Vec::new();

		if let Some(sessions) = self.inner.subscribers.read().await.get(&workspace_id) {
			for (session_id, tx) in sessions {
				match tx.try_send(ServerMessage::ServerChange {
					change: change.clone(),
				}) {
					Ok(()) => {}
					Err(mpsc::error::TrySendError::Full(_)) => {
						warn!(%session_id, %workspace_id, sequence, "Session lagging, change dropped;");
					}
					Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*session_id),
				}
			}
		}

		for session_id in closed {
			self.remove_subscriber(workspace_id, session_id).await;
		}
	}

	async fn remove_subscriber(&self, workspace_id: WorkspaceId, session_id: SessionId) {
		let mut subscribers = self.inner.subscribers.write().await;
		if let Some(sessions) = subscribers.get_mut(&workspace_id) {
			sessions.remove(&session_id);
			if sessions.is_empty() {
				subscribers.remove(&workspace_id);
			}
		}
	}

	async fn drop_peer(&self, peer: &Peer) {
		for workspace_id in &peer.subscriptions {
			self.remove_subscriber(*workspace_id, peer.session_id).await;
		}

		for (workspace_id, acked) in &peer.acked {
			debug!(
				session_id = %peer.session_id,
				device_id = %peer.device_id,
				%workspace_id,
				acked,
				"Session left with changes acknowledged",
			);
		}
	}
}
