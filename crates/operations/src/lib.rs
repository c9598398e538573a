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

//! Typed catalog of the operations a caller can invoke on the core.
//!
//! There are three families:
//! - **Queries** read state and return a single output.
//! - **Mutations** change state and return a single output. Their input is validated before
//!   the handler runs.
//! - **Messages** are fire-and-forget notifications, acknowledged but returning nothing.
//!
//! Every operation type carries a `TYPE` discriminator which must be unique across all three
//! families. Handlers are registered explicitly into a [`RegistryBuilder`] at startup; once
//! [`RegistryBuilder::build`] is called the resulting [`Registry`] can't be extended.
//!
//! ```ignore
//! let registry = RegistryBuilder::<Ctx>::new()
//! 	.query(GetRadar)?
//! 	.mutation(CreateNode)?
//! 	.message(LocalNodeSync)?
//! 	.build();
//!
//! // JSON boundary, `{type, ...fields}`
//! let output = registry.query_json(&ctx, json!({ "type": "radar.get", "workspaceId": id })).await?;
//!
//! // Typed, checked at compile time
//! let state = registry.query::<GetRadar>(&ctx, GetRadarInput { workspace_id: id }).await?;
//! ```

mod error;
mod handler;
mod registry;

pub use error::RegistryError;
pub use handler::{Message, Mutation, Query};
pub use registry::{Family, Registry, RegistryBuilder};

pub use td_core_shared_types::{ErrorKind, ErrorObject};
