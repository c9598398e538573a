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

//! Durable side-effect queue drained by an [`OutboxConsumer`].
//!
//! Producers enqueue tasks in the same transaction as the state change that calls for them.
//! Consumers lease one task at a time, run the handler registered for its kind and record the
//! outcome. Delivery is at least once: a consumer that dies mid-task loses its lease when it
//! expires and another consumer runs the task again, so handlers must be idempotent on the
//! task's `dedupe_key`.

pub mod config;
pub mod consumer;
pub mod handler;
pub mod store;
pub mod task;

pub use config::OutboxConfig;
pub use consumer::{OutboxConsumer, OutboxFailure};
pub use handler::{OutboxHandler, OutboxHandlers, OutboxHandlersBuilder, TaskError};
pub use store::OutboxStore;
pub use task::{
	NewOutboxTask, NodeCleanup, OutboxStatus, OutboxTask, OutboxTaskId, OutboxTaskKind, SendEmail,
};

use td_core_shared_types::{ErrorKind, ErrorObject};

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("invalid value stored in <{field}>: {value}")]
	InvalidStoredValue { field: &'static str, value: String },
	#[error("a handler for <{0}> tasks is already registered")]
	DuplicateHandler(OutboxTaskKind),
}

impl From<OutboxError> for ErrorObject {
	fn from(e: OutboxError) -> Self {
		Self::new(ErrorKind::Internal, e.to_string())
	}
}
