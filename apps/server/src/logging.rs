use crate::config::ServerConfig;

use anyhow::Context;
use tracing_appender::{
	non_blocking::WorkerGuard,
	rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Stdout plus, when enabled, a daily rolling `server.log` under `data_dir/logs`.
pub fn init(config: &ServerConfig) -> anyhow::Result<Option<WorkerGuard>> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.logging.directive))
		.context("invalid log directive")?;

	let (file, guard) = if config.logging.file {
		let (writer, guard) = tracing_appender::non_blocking(RollingFileAppender::new(
			Rotation::DAILY,
			config.data_dir.join("logs"),
			"server.log",
		));

		(
			Some(
				fmt::layer()
					.with_target(true)
					.with_ansi(false)
					.with_writer(writer),
			),
			Some(guard),
		)
	} else {
		(None, None)
	};

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_target(true).with_writer(std::io::stdout))
		.with(file)
		.try_init()
		.context("failed to install tracing subscriber")?;

	Ok(guard)
}
