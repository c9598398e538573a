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

pub mod change;
pub mod error;
pub mod ids;
pub mod interaction;

pub use change::{Change, NodeMutation, NodeType};
pub use error::{ErrorKind, ErrorObject};
pub use ids::{AccountId, ChangeId, DeviceId, NodeId, SessionId, WorkspaceId};
pub use interaction::{Interaction, InteractionKind};

/// Per-workspace ordering key assigned by the server.
pub type Sequence = u64;
