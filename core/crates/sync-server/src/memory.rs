use crate::hub::SyncServer;

use td_core_sync::transport::{Connection, Transport, TransportError};

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

/// In-process transport to a [`SyncServer`], with a switch to take the network away.
pub struct MemoryTransport {
	server: SyncServer,
	online: AtomicBool,
	connections: Mutex<Vec<CancellationToken>>,
}

impl MemoryTransport {
	#[must_use]
	pub fn new(server: SyncServer) -> Self {
		Self {
			server,
			online: AtomicBool::new(true),
			connections: Mutex::default(),
		}
	}

	#[must_use]
	pub fn is_online(&self) -> bool {
		self.online.load(Ordering::Acquire)
	}

	/// Going offline also drops every open connection. Connecting fails until back online.
	pub async fn set_online(&self, online: bool) {
		self.online.store(online, Ordering::Release);
		if !online {
			self.disconnect().await;
		}
	}

	/// Closes every open connection from the server side.
	pub async fn disconnect(&self) {
		let connections = std::mem::take(&mut *self.connections.lock().await);
		debug!(count = connections.len(), "Dropping in-memory connections");

		for token in connections {
			token.cancel();
		}
	}
}

#[async_trait]
impl Transport for MemoryTransport {
	async fn connect(&self) -> Result<Connection, TransportError> {
		if !self.is_online() {
			return Err(TransportError::Unreachable);
		}

		let capacity = self.server.config().session_buffer.max(1);
		let (client_tx, server_rx) = mpsc::channel(capacity);
		let (server_tx, client_rx) = mpsc::channel(capacity);

		let token = CancellationToken::new();
		let mut connections = self.connections.lock().await;
		connections.retain(|existing| !existing.is_cancelled());
		connections.push(token.clone());

		let server = self.server.clone();
		tokio::spawn(
			async move {
				server
					.serve(server_rx, server_tx, token.cancelled_owned())
					.await;
			}
			.in_current_span(),
		);

		Ok(Connection {
			tx: client_tx,
			rx: client_rx,
		})
	}
}
