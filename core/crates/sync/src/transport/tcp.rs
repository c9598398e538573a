use super::{json_lines, Connection, Transport, TransportError};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Newline-delimited JSON over TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
	addr: String,
}

impl TcpTransport {
	/// Accepts `tcp://host:port` or a bare `host:port`.
	pub fn from_url(url: &str) -> Result<Self, TransportError> {
		let addr = url.strip_prefix("tcp://").unwrap_or(url);

		match addr.rsplit_once(':') {
			Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(Self {
				addr: addr.to_string(),
			}),
			_ => Err(TransportError::InvalidUrl(url.to_string())),
		}
	}

	#[must_use]
	pub fn addr(&self) -> &str {
		&self.addr
	}
}

#[async_trait]
impl Transport for TcpTransport {
	async fn connect(&self) -> Result<Connection, TransportError> {
		let stream = TcpStream::connect(&self.addr).await?;
		stream.set_nodelay(true)?;

		debug!(addr = %self.addr, "Connected to sync server");

		let (tx, rx) = json_lines(stream);

		Ok(Connection { tx, rx })
	}
}
