use super::{TransportError, CHANNEL_CAPACITY};

use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
	io::{AsyncRead, AsyncWrite},
	spawn,
	sync::mpsc,
};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, trace, warn, Instrument};

/// Upper bound for a single encoded message.
pub const LINE_MAX_LENGTH: usize = 8 * 1024 * 1024;

impl From<LinesCodecError> for TransportError {
	fn from(e: LinesCodecError) -> Self {
		match e {
			LinesCodecError::Io(e) => Self::Io(e),
			LinesCodecError::MaxLineLengthExceeded => Self::Codec("message too long".to_string()),
		}
	}
}

/// Bridges a byte stream carrying newline-delimited JSON to a pair of typed channels.
///
/// A reader and a writer task are spawned. Either one stopping tears the other down: the returned
/// receiver yields `None` and sends on the returned sender fail. Lines that don't parse as `In`
/// are logged and skipped.
pub fn json_lines<S, In, Out>(stream: S) -> (mpsc::Sender<Out>, mpsc::Receiver<In>)
where
	S: AsyncRead + AsyncWrite + Send + 'static,
	In: DeserializeOwned + Send + 'static,
	Out: Serialize + Send + 'static,
{
	let (mut sink, mut lines) =
		Framed::new(stream, LinesCodec::new_with_max_length(LINE_MAX_LENGTH)).split();

	let (out_tx, mut out_rx) = mpsc::channel::<Out>(CHANNEL_CAPACITY);
	let (in_tx, in_rx) = mpsc::channel::<In>(CHANNEL_CAPACITY);

	let writer = spawn(async move {
		while let Some(message) = out_rx.recv().await {
			let line = match serde_json::to_string(&message) {
				Ok(line) => line,
				Err(e) => {
					warn!(?e, "Failed to encode outgoing message;");
					continue;
				}
			};

			if let Err(e) = sink.send(line).await {
				debug!(error = %TransportError::from(e), "Connection writer stopped;");
				break;
			}
		}

		// Flushes and closes the write half so the peer sees EOF
		if let Err(e) = sink.close().await {
			trace!(?e, "Failed to close connection writer;");
		}
	}
	.in_current_span());

	spawn(async move {
		while let Some(line) = lines.next().await {
			let line = match line {
				Ok(line) => line,
				Err(e) => {
					debug!(error = %TransportError::from(e), "Connection reader stopped;");
					break;
				}
			};

			if line.trim().is_empty() {
				continue;
			}

			match serde_json::from_str::<In>(&line) {
				Ok(message) => {
					if in_tx.send(message).await.is_err() {
						break;
					}
				}
				Err(e) => warn!(?e, "Skipping malformed message;"),
			}
		}

		writer.abort();
	}
	.in_current_span());

	(out_tx, in_rx)
}
