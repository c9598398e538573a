//! The sync session: one long-lived protocol peer per device.
//!
//! A session owns every workspace replica it was given and multiplexes them over a single
//! connection. It authenticates, resumes each workspace from its watermark, pushes pending local
//! changes and applies the server's change stream. When the connection drops it backs off and
//! reconnects until stopped.

use crate::{
	change_log::LocalChangeLog,
	config::SyncConfig,
	transport::{Connection, Transport, TransportError},
	wire::{ClientMessage, ServerMessage},
	Error,
};

use td_core_shared_types::{
	AccountId, Change, ChangeId, DeviceId, ErrorKind, ErrorObject, Sequence, SessionId,
	WorkspaceId,
};

use std::{
	collections::HashMap,
	fmt,
	future::{pending, IntoFuture},
	pin::pin,
	sync::Arc,
};

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use tokio::{
	select,
	sync::{broadcast, mpsc, watch},
	time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

mod replica;

use replica::Replica;

const EVENTS_CHANNEL_CAPACITY: usize = 1024;

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
	Connecting,
	Authenticated,
	Syncing,
	Idle,
	Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
	StateChanged {
		state: SessionState,
	},
	ChangeAcknowledged {
		workspace_id: WorkspaceId,
		local_id: ChangeId,
		sequence: Sequence,
	},
	ChangeFailed {
		workspace_id: WorkspaceId,
		local_id: ChangeId,
		error: ErrorObject,
	},
	ChangeApplied {
		workspace_id: WorkspaceId,
		sequence: Sequence,
	},
	GapDetected {
		workspace_id: WorkspaceId,
		watermark: Sequence,
		next_sequence: Sequence,
	},
}

/// Where the session applies server changes. Implementations must tolerate the same change
/// being applied twice, which happens when a crash lands between applying and recording it.
#[async_trait]
pub trait ChangeSink: Send + Sync + 'static {
	async fn apply(&self, change: &Change) -> Result<(), ErrorObject>;
}

#[derive(Clone)]
pub struct SessionIdentity {
	pub account_id: AccountId,
	pub device_id: DeviceId,
	pub token: String,
}

impl fmt::Debug for SessionIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionIdentity")
			.field("account_id", &self.account_id)
			.field("device_id", &self.device_id)
			.field("token", &"<redacted>")
			.finish()
	}
}

enum Command {
	Subscribe {
		log: LocalChangeLog,
		sink: Arc<dyn ChangeSink>,
	},
	Unsubscribe(WorkspaceId),
	PendingAdded(WorkspaceId),
}

/// Cheap handle to talk to a running [`SyncSession`].
#[derive(Clone)]
pub struct SessionHandle {
	commands: mpsc::UnboundedSender<Command>,
	state: watch::Receiver<SessionState>,
	events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
	/// Hands a workspace's change log to the session. Its pending changes are sent as soon as
	/// the session is connected.
	pub fn subscribe_workspace(
		&self,
		log: LocalChangeLog,
		sink: Arc<dyn ChangeSink>,
	) -> Result<(), Error> {
		self.commands
			.send(Command::Subscribe { log, sink })
			.map_err(|_| Error::SessionClosed)
	}

	pub fn unsubscribe_workspace(&self, workspace_id: WorkspaceId) -> Result<(), Error> {
		self.commands
			.send(Command::Unsubscribe(workspace_id))
			.map_err(|_| Error::SessionClosed)
	}

	/// Wakes the session after a local append or a retried failed change.
	pub fn notify_pending(&self, workspace_id: WorkspaceId) -> Result<(), Error> {
		self.commands
			.send(Command::PendingAdded(workspace_id))
			.map_err(|_| Error::SessionClosed)
	}

	#[must_use]
	pub fn state(&self) -> SessionState {
		*self.state.borrow()
	}

	#[must_use]
	pub fn watch_state(&self) -> watch::Receiver<SessionState> {
		self.state.clone()
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}
}

pub(crate) struct SessionContext {
	config: SyncConfig,
	account_id: AccountId,
	events: broadcast::Sender<SessionEvent>,
}

impl SessionContext {
	fn emit(&self, event: SessionEvent) {
		// Nobody listening is fine
		let _ = self.events.send(event);
	}
}

pub struct SyncSession<T> {
	ctx: SessionContext,
	identity: SessionIdentity,
	transport: T,
	replicas: HashMap<WorkspaceId, Replica>,
	commands: mpsc::UnboundedReceiver<Command>,
	state: watch::Sender<SessionState>,
	backoff: ExponentialBackoff,
}

impl<T: Transport> SyncSession<T> {
	pub fn new(config: SyncConfig, identity: SessionIdentity, transport: T) -> (Self, SessionHandle) {
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
		let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);

		let backoff = config.reconnect.build();

		(
			Self {
				ctx: SessionContext {
					config,
					account_id: identity.account_id,
					events: events_tx.clone(),
				},
				identity,
				transport,
				replicas: HashMap::new(),
				commands: commands_rx,
				state: state_tx,
				backoff,
			},
			SessionHandle {
				commands: commands_tx,
				state: state_rx,
				events: events_tx,
			},
		)
	}

	/// Connects and syncs until `stop` resolves, reconnecting with backoff whenever the
	/// connection fails.
	#[instrument(skip_all, fields(account_id = %self.identity.account_id, device_id = %self.identity.device_id))]
	pub async fn run(&mut self, stop: impl IntoFuture<Output = ()>) {
		let mut stop = pin!(stop.into_future());

		loop {
			self.set_state(SessionState::Connecting);

			let res = select! {
				() = &mut stop => break,
				res = self.connect_and_sync() => res,
			};

			for replica in self.replicas.values_mut() {
				replica.reset();
			}
			self.set_state(SessionState::Disconnected);

			let delay = self
				.backoff
				.next_backoff()
				.unwrap_or(self.ctx.config.reconnect.max());

			match res {
				Err(Error::Transport(e)) => {
					debug!(%e, ?delay, "Sync connection lost, reconnecting after backoff;");
				}
				Err(e) => error!(?e, ?delay, "Sync session failed, reconnecting after backoff;"),
				Ok(()) => {}
			}

			let mut backoff_sleep = pin!(sleep(delay));

			// Workspaces can still come and go while we're offline
			loop {
				select! {
					() = &mut stop => {
						info!("Sync session stopped");
						return;
					}
					() = &mut backoff_sleep => break,
					Some(command) = self.commands.recv() => self.handle_offline_command(command),
				}
			}
		}

		self.set_state(SessionState::Disconnected);
		info!("Sync session stopped");
	}

	async fn connect_and_sync(&mut self) -> Result<(), Error> {
		let auth_timeout = self.ctx.config.auth_timeout();

		let mut conn = timeout(auth_timeout, self.transport.connect())
			.await
			.map_err(|_| TransportError::Unreachable)??;

		conn.send(ClientMessage::Init {
			account_id: self.identity.account_id,
			device_id: self.identity.device_id,
			token: self.identity.token.clone(),
		})
		.await?;

		let session_id = timeout(auth_timeout, wait_authenticated(&mut conn))
			.await
			.map_err(|_| Error::Authentication("timed out".to_string()))??;

		self.backoff.reset();
		self.set_state(SessionState::Authenticated);
		info!(%session_id, workspaces = self.replicas.len(), "Sync session authenticated");

		for replica in self.replicas.values_mut() {
			replica.resume(&self.ctx, &conn).await?;
		}
		self.refresh_state();

		let catch_up_interval = self.ctx.config.catch_up_interval();
		let mut catch_up = interval_at(Instant::now() + catch_up_interval, catch_up_interval);
		catch_up.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			let deadline = self.replicas.values().filter_map(Replica::next_deadline).min();

			select! {
				Some(command) = self.commands.recv() => self.handle_command(command, &conn).await?,

				message = conn.rx.recv() => {
					let Some(message) = message else {
						return Err(TransportError::Closed.into());
					};

					self.handle_message(message, &conn).await?;
				}

				() = wait_until(deadline) => {
					let now = Instant::now();
					for replica in self.replicas.values_mut() {
						replica.handle_timeouts(&self.ctx, &conn, now).await?;
					}
				}

				_ = catch_up.tick() => {
					for replica in self.replicas.values() {
						replica.catch_up(&self.ctx, &conn).await?;
					}
				}
			}

			self.refresh_state();
		}
	}

	async fn handle_command(&mut self, command: Command, conn: &Connection) -> Result<(), Error> {
		match command {
			Command::Subscribe { log, sink } => {
				let workspace_id = log.workspace_id();
				let mut replica = Replica::new(log, sink);
				replica.resume(&self.ctx, conn).await?;

				if self.replicas.insert(workspace_id, replica).is_some() {
					warn!(%workspace_id, "Workspace subscribed twice, previous replica replaced;");
				}
			}

			Command::Unsubscribe(workspace_id) => {
				if self.replicas.remove(&workspace_id).is_some() {
					conn.send(ClientMessage::Unsubscribe { workspace_id }).await?;
					debug!(%workspace_id, "Unsubscribed from workspace");
				}
			}

			Command::PendingAdded(workspace_id) => {
				if let Some(replica) = self.replicas.get_mut(&workspace_id) {
					replica.flush(&self.ctx, conn).await?;
				}
			}
		}

		Ok(())
	}

	fn handle_offline_command(&mut self, command: Command) {
		match command {
			Command::Subscribe { log, sink } => {
				self.replicas
					.insert(log.workspace_id(), Replica::new(log, sink));
			}
			Command::Unsubscribe(workspace_id) => {
				self.replicas.remove(&workspace_id);
			}
			// Sent by the first flush after reconnecting
			Command::PendingAdded(_) => {}
		}
	}

	async fn handle_message(&mut self, message: ServerMessage, conn: &Connection) -> Result<(), Error> {
		match message {
			ServerMessage::ServerChangeResult {
				change_id,
				workspace_id,
				success,
				sequence,
				error,
			} => {
				let Some(replica) = self.replicas.get_mut(&workspace_id) else {
					debug!(%workspace_id, "Result for a workspace we're not syncing");
					return Ok(());
				};

				let outcome = match (success, sequence) {
					(true, Some(sequence)) => Ok(sequence),
					(true, None) => Err(ErrorObject::internal("success result without a sequence")),
					(false, _) => Err(error.unwrap_or_else(|| {
						ErrorObject::internal("failure result without an error")
					})),
				};

				replica.handle_result(&self.ctx, conn, change_id, outcome).await
			}

			ServerMessage::ServerChange { change } => {
				self.receive(change.workspace_id, vec![change], false, conn)
					.await
			}

			ServerMessage::ServerChangeBatch {
				workspace_id,
				changes,
				has_more,
			} => self.receive(workspace_id, changes, has_more, conn).await,

			ServerMessage::Error { error } => {
				if error.kind == ErrorKind::Validation {
					// The server couldn't make sense of something we sent, nothing to retry
					error!(%error, "Server rejected a message;");
				} else {
					warn!(%error, "Server reported an error;");
				}
				Ok(())
			}

			ServerMessage::Authenticated { .. } | ServerMessage::AuthFailed { .. } => {
				debug!("Ignoring late authentication message");
				Ok(())
			}
		}
	}

	async fn receive(
		&mut self,
		workspace_id: WorkspaceId,
		changes: Vec<Change>,
		has_more: bool,
		conn: &Connection,
	) -> Result<(), Error> {
		let Some(replica) = self.replicas.get_mut(&workspace_id) else {
			debug!(%workspace_id, "Changes for a workspace we're not syncing");
			return Ok(());
		};

		replica.receive(&self.ctx, conn, changes, has_more).await
	}

	/// `Syncing` while any change awaits its result or any gap is open, `Idle` otherwise.
	fn refresh_state(&self) {
		let state = if self.replicas.is_empty() {
			SessionState::Authenticated
		} else if self.replicas.values().any(Replica::is_busy) {
			SessionState::Syncing
		} else {
			SessionState::Idle
		};

		self.set_state(state);
	}

	fn set_state(&self, state: SessionState) {
		if self.state.send_if_modified(|current| {
			let changed = *current != state;
			*current = state;
			changed
		}) {
			debug!(%state, "Sync session state changed");
			self.ctx.emit(SessionEvent::StateChanged { state });
		}
	}
}

async fn wait_authenticated(conn: &mut Connection) -> Result<SessionId, Error> {
	loop {
		match conn.rx.recv().await {
			Some(ServerMessage::Authenticated { session_id }) => return Ok(session_id),
			Some(ServerMessage::AuthFailed { reason }) => return Err(Error::Authentication(reason)),
			Some(other) => debug!(?other, "Ignoring message received before authentication"),
			None => return Err(TransportError::Closed.into()),
		}
	}
}

async fn wait_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => sleep_until(deadline).await,
		None => pending().await,
	}
}
