//! Ordered, message-level connections between a sync session and the server.

use crate::wire::{ClientMessage, ServerMessage};

use std::{io, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

mod lines;
mod tcp;

pub use lines::{json_lines, LINE_MAX_LENGTH};
pub use tcp::TcpTransport;

/// Messages buffered per direction before senders wait.
pub const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
	#[error("connection closed")]
	Closed,
	#[error("failed to frame message: {0}")]
	Codec(String),
	#[error("invalid server url <{0}>")]
	InvalidUrl(String),
	#[error("server unreachable")]
	Unreachable,
}

/// One live connection. Messages are delivered in the order they were sent, and the connection is
/// gone once `rx` yields `None` or a send fails.
#[derive(Debug)]
pub struct Connection {
	pub tx: mpsc::Sender<ClientMessage>,
	pub rx: mpsc::Receiver<ServerMessage>,
}

impl Connection {
	pub async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
		self.tx.send(message).await.map_err(|_| TransportError::Closed)
	}
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
	async fn connect(&self) -> Result<Connection, TransportError>;
}

#[async_trait]
impl<T: Transport> Transport for Arc<T> {
	async fn connect(&self) -> Result<Connection, TransportError> {
		T::connect(self).await
	}
}
