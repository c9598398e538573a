//! Client configuration, persisted as TOML next to the data it describes.

use crate::CoreError;

use td_core_shared_types::{AccountId, DeviceId, WorkspaceId};
use td_core_sync::SyncConfig;
use td_job_scheduler::JobPolicy;

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "tandem.toml";

/// Current schema version, bumped whenever a migration step is added to [`CoreConfig::migrate`].
pub const CONFIG_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
	pub version: u32,
	pub data_dir: PathBuf,
	pub account_id: AccountId,
	pub device_id: DeviceId,
	pub token: String,
	/// `tcp://host:port` of the sync server.
	pub server_url: String,
	/// Workspaces opened and synced on startup.
	#[serde(default)]
	pub workspaces: Vec<WorkspaceId>,
	#[serde(default)]
	pub sync: SyncConfig,
	#[serde(default)]
	pub jobs: JobsConfig,
	#[serde(default)]
	pub retention: RetentionConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
}

/// Debounce and interval of one job type, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicyConfig {
	pub debounce_ms: u64,
	pub interval_ms: Option<u64>,
}

impl From<JobPolicyConfig> for JobPolicy {
	fn from(config: JobPolicyConfig) -> Self {
		Self {
			debounce: Duration::from_millis(config.debounce_ms),
			interval: config.interval_ms.map(Duration::from_millis),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
	/// Recomputes radar from full history and compares it with the incremental state.
	pub radar_verify: JobPolicyConfig,
	/// Prunes acknowledged changes and superseded history.
	pub changes_cleanup: JobPolicyConfig,
}

impl Default for JobsConfig {
	fn default() -> Self {
		Self {
			radar_verify: JobPolicyConfig {
				debounce_ms: 2_000,
				interval_ms: Some(10 * 60 * 1_000),
			},
			changes_cleanup: JobPolicyConfig {
				debounce_ms: 0,
				interval_ms: Some(60 * 60 * 1_000),
			},
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
	/// How long acknowledged local changes are kept before pruning.
	pub acknowledged_ms: u64,
}

impl Default for RetentionConfig {
	fn default() -> Self {
		Self {
			acknowledged_ms: 7 * 24 * 60 * 60 * 1_000,
		}
	}
}

impl RetentionConfig {
	#[must_use]
	pub const fn acknowledged(&self) -> Duration {
		Duration::from_millis(self.acknowledged_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	/// Default `EnvFilter` directive, `RUST_LOG` takes precedence when set.
	pub directive: String,
	/// Also write a daily rolling log file under `data_dir/logs`.
	pub file: bool,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			directive: "info,td_core=debug,td_core_sync=debug".to_string(),
			file: true,
		}
	}
}

impl CoreConfig {
	/// Fresh identity for this device, syncing with `server_url`.
	#[must_use]
	pub fn new(data_dir: impl Into<PathBuf>, server_url: impl Into<String>) -> Self {
		Self {
			version: CONFIG_VERSION,
			data_dir: data_dir.into(),
			account_id: AccountId::new(),
			device_id: DeviceId::new(),
			token: String::new(),
			server_url: server_url.into(),
			workspaces: Vec::new(),
			sync: SyncConfig::default(),
			jobs: JobsConfig::default(),
			retention: RetentionConfig::default(),
			logging: LoggingConfig::default(),
		}
	}

	/// Loads `data_dir/tandem.toml`, migrating it if it's older than [`CONFIG_VERSION`]. A missing
	/// file is created from `default`.
	pub fn load_or_create(
		data_dir: impl AsRef<Path>,
		default: impl FnOnce() -> Self,
	) -> Result<Self, CoreError> {
		let path = data_dir.as_ref().join(CONFIG_FILE_NAME);

		if !path.exists() {
			warn!(path = %path.display(), "No config found, creating default");
			let config = default();
			config.save()?;
			return Ok(config);
		}

		info!(path = %path.display(), "Loading config");

		let raw = fs::read_to_string(&path).map_err(|e| CoreError::Config {
			path: path.clone(),
			message: e.to_string(),
		})?;
		let mut config: Self = toml::from_str(&raw).map_err(|e| CoreError::Config {
			path: path.clone(),
			message: e.to_string(),
		})?;

		if config.version > CONFIG_VERSION {
			return Err(CoreError::Config {
				path,
				message: format!(
					"config version {} is newer than supported version {CONFIG_VERSION}",
					config.version
				),
			});
		}

		if config.version < CONFIG_VERSION {
			info!(from = config.version, to = CONFIG_VERSION, "Migrating config");
			config.migrate();
			config.save()?;
		}

		Ok(config)
	}

	pub fn save(&self) -> Result<(), CoreError> {
		let path = self.path();
		let to_config_error = |message: String| CoreError::Config {
			path: path.clone(),
			message,
		};

		fs::create_dir_all(&self.data_dir).map_err(|e| to_config_error(e.to_string()))?;
		let raw = toml::to_string_pretty(self).map_err(|e| to_config_error(e.to_string()))?;
		fs::write(&path, raw).map_err(|e| to_config_error(e.to_string()))?;

		info!(path = %path.display(), "Saved config");

		Ok(())
	}

	#[must_use]
	pub fn path(&self) -> PathBuf {
		self.data_dir.join(CONFIG_FILE_NAME)
	}

	#[must_use]
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}

	#[must_use]
	pub fn workspace_dir(&self, workspace_id: WorkspaceId) -> PathBuf {
		self.data_dir.join("workspaces").join(workspace_id.to_string())
	}

	fn migrate(&mut self) {
		while self.version < CONFIG_VERSION {
			match self.version {
				// v1 wrote server urls without a scheme
				0 | 1 => {
					if !self.server_url.starts_with("tcp://") {
						self.server_url = format!("tcp://{}", self.server_url);
					}
				}
				_ => {}
			}

			self.version += 1;
		}
	}
}
