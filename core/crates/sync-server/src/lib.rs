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

//! Server half of the sync protocol.
//!
//! [`SyncServer`] authenticates sessions, assigns every accepted mutation the next sequence of its
//! workspace inside one transaction, fans the resulting change out to every subscribed session and
//! serves replay from a cursor. Side effects a change calls for are queued in the outbox within
//! that same transaction.

pub mod auth;
pub mod config;
pub mod hub;
pub mod memory;
pub mod store;
pub mod tcp;

pub use auth::{Authenticator, StaticTokens};
pub use config::ServerSyncConfig;
pub use hub::SyncServer;
pub use memory::MemoryTransport;
pub use store::{MutationOutcome, ServerNode, ServerStore};
pub use tcp::serve_tcp;

use td_core_outbox::OutboxError;
use td_core_shared_types::{ErrorKind, ErrorObject};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error(transparent)]
	Stored(#[from] td_core_sync::Error),
	#[error("outbox error: {0}")]
	Outbox(#[from] OutboxError),
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl From<Error> for ErrorObject {
	fn from(e: Error) -> Self {
		Self::new(ErrorKind::Internal, e.to_string())
	}
}
