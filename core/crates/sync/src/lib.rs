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

//! Client side of the sync engine.
//!
//! A local mutation is appended to the workspace's [`LocalChangeLog`] before anything touches the
//! network. The [`SyncSession`] then ships pending changes to the server, tracks their results,
//! and applies the server's sequenced change stream back into local state through a
//! [`ChangeSink`], advancing the workspace watermark as it goes.

pub mod change_log;
pub mod config;
pub mod db;
pub mod session;
pub mod transport;
pub mod wire;

pub use change_log::{ChangeStatus, LocalChangeLog, NewChange, PendingChange, PruneStats};
pub use config::{BackoffConfig, SyncConfig};
pub use session::{
	ChangeSink, SessionEvent, SessionHandle, SessionIdentity, SessionState, SyncSession,
};
pub use transport::{Connection, TcpTransport, Transport, TransportError};

use td_core_shared_types::{
	change::MutationValidationError, ChangeId, ErrorKind, ErrorObject, WorkspaceId,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("invalid value stored in <{field}>: {value}")]
	InvalidStoredValue { field: &'static str, value: String },
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error(transparent)]
	Validation(#[from] MutationValidationError),
	#[error("change <{0}> not found in the local change log")]
	ChangeNotFound(ChangeId),
	#[error("workspace <{0}> is not synced by this session")]
	UnknownWorkspace(WorkspaceId),
	#[error("failed to apply change {sequence}: {message}")]
	Apply { sequence: u64, message: String },
	#[error("authentication failed: {0}")]
	Authentication(String),
	#[error("sync session is gone")]
	SessionClosed,
}

impl Error {
	#[must_use]
	pub const fn kind(&self) -> ErrorKind {
		match self {
			Self::Transport(_) | Self::Authentication(_) | Self::SessionClosed => {
				ErrorKind::Transport
			}
			Self::Validation(_) => ErrorKind::Validation,
			Self::ChangeNotFound(_) | Self::UnknownWorkspace(_) => ErrorKind::NotFound,
			Self::Database(_)
			| Self::Serialization(_)
			| Self::InvalidStoredValue { .. }
			| Self::Apply { .. } => ErrorKind::Internal,
		}
	}
}

impl From<Error> for ErrorObject {
	fn from(e: Error) -> Self {
		Self::new(e.kind(), e.to_string())
	}
}
