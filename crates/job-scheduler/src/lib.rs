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

//! Debounced background jobs.
//!
//! Each job type gets its own slot, a small state machine running on its own task:
//!
//! ```text
//! Idle -> Debouncing -> Ready -> Running -> Idle
//! ```
//!
//! A trigger moves the slot to `Debouncing` and (re)starts the debounce timer. The handler runs
//! once the debounce timer elapses without new triggers, or once the interval timer elapses,
//! whichever comes first. Only one execution per job type runs at a time and triggers that
//! arrive while running collapse into a single re-run.

mod error;
mod job;
mod scheduler;

pub use error::SchedulerError;
pub use job::{BoxError, JobEvent, JobHandler, JobPolicy, JobState};
pub use scheduler::{JobScheduler, JobSchedulerBuilder};
