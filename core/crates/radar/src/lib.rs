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

//! Radar: per user unread and mention counters for a workspace.
//!
//! The counters are a projection of the applied change history and of the user's own
//! interactions. [`RadarProjection`] folds both in incrementally, [`compute_radar`] replays them
//! from scratch, and for any order of the same inputs both end up in the same [`RadarState`].

mod aggregator;
mod projection;

pub use aggregator::{RadarAggregator, RadarEvent, RadarSubscription};
pub use projection::{compute_radar, RadarProjection, RadarState};
