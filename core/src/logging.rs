use crate::{config::LoggingConfig, CoreError};

use std::path::Path;

use tracing_appender::{
	non_blocking::WorkerGuard,
	rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_NAME: &str = "tandem.log";

/// Installs the global subscriber: stdout, plus a daily rolling file in `logs_dir` if enabled.
///
/// Keep the returned guard alive for as long as file logs should be flushed.
pub fn init_logging(
	config: &LoggingConfig,
	logs_dir: impl AsRef<Path>,
) -> Result<Option<WorkerGuard>, CoreError> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.directive))
		.map_err(|e| CoreError::Logging(e.to_string()))?;

	let stdout = fmt::layer()
		.with_target(true)
		.with_thread_ids(true)
		.with_writer(std::io::stdout);

	let (file, guard) = if config.file {
		let logs_dir = logs_dir.as_ref();
		std::fs::create_dir_all(logs_dir)?;

		let (writer, guard) = tracing_appender::non_blocking(RollingFileAppender::new(
			Rotation::DAILY,
			logs_dir,
			LOG_FILE_NAME,
		));

		(
			Some(
				fmt::layer()
					.with_target(true)
					.with_thread_ids(true)
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
		.with(stdout)
		.with(file)
		.try_init()
		.map_err(|e| CoreError::Logging(e.to_string()))?;

	Ok(guard)
}
