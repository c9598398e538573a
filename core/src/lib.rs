#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Client core of tandem.
//!
//! [`Core`] opens every configured workspace, runs the [`SyncSession`] that keeps them in step
//! with the server, and exposes local reads and writes through a registry of typed operations.
//! Writes never wait on the network: they land in the workspace's change log and are delivered
//! whenever the session is connected.

use td_actors::Actors;
use td_core_radar::RadarAggregator;
use td_core_shared_types::{ErrorKind, ErrorObject, WorkspaceId};
use td_core_sync::{SessionHandle, SessionIdentity, SyncSession, TcpTransport, Transport};
use td_job_scheduler::{JobScheduler, SchedulerError};
use td_operations::{Registry, RegistryError};

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, instrument};

pub mod config;
pub mod context;
pub mod jobs;
pub mod logging;
pub mod ops;
pub mod workspace;

pub use config::CoreConfig;
pub use context::{CoreContext, LocalNotification};
pub use workspace::{LocalNode, Workspace};

const SYNC_SESSION_ACTOR: &str = "Sync Session";
const NOTIFICATIONS_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
	#[error("config error at <{}>: {message}", .path.display())]
	Config { path: PathBuf, message: String },
	#[error("failed to initialize logging: {0}")]
	Logging(String),
	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error(transparent)]
	Sync(#[from] td_core_sync::Error),
	#[error(transparent)]
	Registry(#[from] RegistryError),
	#[error(transparent)]
	Scheduler(#[from] SchedulerError),
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("workspace <{0}> isn't open")]
	UnknownWorkspace(WorkspaceId),
	#[error("node <{0}> not found")]
	NodeNotFound(td_core_shared_types::NodeId),
}

impl From<CoreError> for ErrorObject {
	fn from(e: CoreError) -> Self {
		match e {
			CoreError::Sync(e) => e.into(),
			CoreError::UnknownWorkspace(_) | CoreError::NodeNotFound(_) => {
				Self::not_found(e.to_string())
			}
			e => Self::new(ErrorKind::Internal, e.to_string()),
		}
	}
}

/// A running client: its open workspaces, the operations over them, background jobs and the
/// sync session actor.
pub struct Core {
	ctx: CoreContext,
	registry: Arc<Registry<CoreContext>>,
	jobs: Arc<JobScheduler>,
	actors: Actors,
	config: CoreConfig,
}

impl Core {
	/// Starts syncing with the server at `config.server_url` over TCP.
	pub async fn start(config: CoreConfig) -> Result<Self, CoreError> {
		let transport =
			TcpTransport::from_url(&config.server_url).map_err(td_core_sync::Error::from)?;
		Self::with_transport(config, transport).await
	}

	#[instrument(skip_all, fields(account_id = %config.account_id, device_id = %config.device_id), err)]
	pub async fn with_transport<T: Transport>(
		config: CoreConfig,
		transport: T,
	) -> Result<Self, CoreError> {
		tokio::fs::create_dir_all(&config.data_dir).await?;

		let workspaces = Arc::new(RwLock::new(HashMap::new()));
		let radar = Arc::new(RadarAggregator::new());
		let (notifications, _) = broadcast::channel(NOTIFICATIONS_CAPACITY);

		let jobs = Arc::new(jobs::build_scheduler(&config, Arc::clone(&workspaces))?);

		let (session, session_handle) = SyncSession::new(
			config.sync.clone(),
			SessionIdentity {
				account_id: config.account_id,
				device_id: config.device_id,
				token: config.token.clone(),
			},
			transport,
		);

		let ctx = CoreContext {
			account_id: config.account_id,
			workspaces,
			radar,
			session: session_handle,
			notifications,
		};

		let registry = Arc::new(ops::build_registry()?);

		let core = Self {
			ctx,
			registry,
			jobs,
			actors: Actors::default(),
			config,
		};

		for workspace_id in core.config.workspaces.clone() {
			core.open_workspace(workspace_id).await?;
		}

		let session = Arc::new(Mutex::new(session));
		core.actors
			.declare(
				SYNC_SESSION_ACTOR,
				move |stop| {
					let session = Arc::clone(&session);
					async move {
						session.lock().await.run(&stop).await;
					}
				},
				true,
			)
			.await;

		info!(
			workspaces_count = core.config.workspaces.len(),
			"Core started"
		);

		Ok(core)
	}

	/// Opens a workspace and hands its change log to the sync session. Opening an already open
	/// workspace is a no-op.
	pub async fn open_workspace(
		&self,
		workspace_id: WorkspaceId,
	) -> Result<Arc<Workspace>, CoreError> {
		if let Some(workspace) = self.ctx.workspace(workspace_id).await {
			return Ok(workspace);
		}

		let workspace = Arc::new(
			Workspace::open(
				self.config.workspace_dir(workspace_id),
				workspace_id,
				self.ctx.account_id,
				Arc::clone(&self.ctx.radar),
				self.ctx.notifications.clone(),
				Arc::clone(&self.jobs),
			)
			.await?,
		);

		self.ctx
			.workspaces
			.write()
			.await
			.insert(workspace_id, Arc::clone(&workspace));

		self.ctx.session.subscribe_workspace(
			workspace.log().clone(),
			Arc::clone(&workspace) as Arc<dyn td_core_sync::ChangeSink>,
		)?;

		Ok(workspace)
	}

	pub async fn close_workspace(&self, workspace_id: WorkspaceId) -> Result<(), CoreError> {
		if self.ctx.workspaces.write().await.remove(&workspace_id).is_none() {
			return Err(CoreError::UnknownWorkspace(workspace_id));
		}

		self.ctx.session.unsubscribe_workspace(workspace_id)?;
		self.ctx.radar.untrack_workspace(workspace_id).await;

		info!(%workspace_id, "Workspace closed");

		Ok(())
	}

	/// Runs a `{type, ...input}` query.
	pub async fn query_json(&self, request: Value) -> Result<Value, ErrorObject> {
		self.registry.query_json(&self.ctx, request).await
	}

	pub async fn mutate_json(&self, request: Value) -> Result<Value, ErrorObject> {
		self.registry.mutate_json(&self.ctx, request).await
	}

	pub async fn send_json(&self, request: Value) -> Result<(), ErrorObject> {
		self.registry.send_json(&self.ctx, request).await
	}

	#[must_use]
	pub const fn ctx(&self) -> &CoreContext {
		&self.ctx
	}

	#[must_use]
	pub fn registry(&self) -> &Registry<CoreContext> {
		&self.registry
	}

	#[must_use]
	pub fn jobs(&self) -> &JobScheduler {
		&self.jobs
	}

	#[must_use]
	pub const fn session(&self) -> &SessionHandle {
		&self.ctx.session
	}

	#[must_use]
	pub const fn config(&self) -> &CoreConfig {
		&self.config
	}

	pub fn subscribe_notifications(&self) -> broadcast::Receiver<LocalNotification> {
		self.ctx.notifications.subscribe()
	}

	/// Stops the sync session and every job. Pending changes stay in the change logs.
	pub async fn shutdown(&self) {
		self.actors.stop_all().await;
		self.jobs.shutdown().await;

		info!("Core shut down");
	}
}
