use td_core_outbox::OutboxConfig;
use td_core_sync_server::ServerSyncConfig;

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub listen: String,
	pub data_dir: PathBuf,
	/// Tokens accepted from connecting devices.
	pub tokens: Vec<String>,
	pub sync: ServerSyncConfig,
	pub outbox: OutboxConfig,
	pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	pub directive: String,
	pub file: bool,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: "127.0.0.1:7400".to_string(),
			data_dir: PathBuf::from("tandem_server_data"),
			tokens: Vec::new(),
			sync: ServerSyncConfig::default(),
			outbox: OutboxConfig::default(),
			logging: LoggingConfig::default(),
		}
	}
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			directive: "info,td_server=debug,td_core_sync_server=debug".to_string(),
			file: true,
		}
	}
}

impl ServerConfig {
	/// Reads the TOML file at `path`, or the defaults when there's no file.
	pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
		let Some(path) = path else {
			return Ok(Self::default());
		};

		let raw = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read config at <{}>", path.display()))?;

		toml::from_str(&raw).with_context(|| format!("invalid config at <{}>", path.display()))
	}

	pub fn database_path(&self) -> PathBuf {
		self.data_dir.join("server.db")
	}

	pub fn mail_dir(&self) -> PathBuf {
		self.data_dir.join("mail")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_file_keeps_defaults() {
		let dir = tempfile::TempDir::new().unwrap();
		let path = dir.path().join("server.toml");
		std::fs::write(
			&path,
			r#"
listen = "0.0.0.0:9000"
tokens = ["alpha", "beta"]

[outbox]
max_attempts = 2
"#,
		)
		.unwrap();

		let config = ServerConfig::load(Some(&path)).unwrap();
		assert_eq!(config.listen, "0.0.0.0:9000");
		assert_eq!(config.tokens, ["alpha", "beta"]);
		assert_eq!(config.outbox.max_attempts, 2);
		assert_eq!(config.outbox.lease_ms, OutboxConfig::default().lease_ms);
		assert_eq!(config.sync, ServerSyncConfig::default());
	}

	#[test]
	fn missing_path_means_defaults() {
		assert_eq!(ServerConfig::load(None).unwrap(), ServerConfig::default());
	}
}
