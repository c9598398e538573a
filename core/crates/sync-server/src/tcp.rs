use crate::{hub::SyncServer, Error};

use td_core_sync::{
	transport::json_lines,
	wire::{ClientMessage, ServerMessage},
};

use std::{future::IntoFuture, pin::pin};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Accepts newline-delimited JSON connections on `listener` until `stop` resolves. Open sessions
/// are closed on stop.
pub async fn serve_tcp(
	listener: TcpListener,
	server: SyncServer,
	stop: impl IntoFuture<Output = ()>,
) -> Result<(), Error> {
	let mut stop = pin!(stop.into_future());
	let shutdown = CancellationToken::new();

	info!(addr = %listener.local_addr()?, "Listening for sync sessions");

	loop {
		let accepted = tokio::select! {
			() = &mut stop => break,
			accepted = listener.accept() => accepted,
		};

		let (stream, peer_addr) = match accepted {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(?e, "Failed to accept connection;");
				continue;
			}
		};

		if let Err(e) = stream.set_nodelay(true) {
			debug!(?e, %peer_addr, "Failed to disable Nagle's algorithm;");
		}

		debug!(%peer_addr, "Accepted connection");

		let (tx, rx) = json_lines::<_, ClientMessage, ServerMessage>(stream);
		let server = server.clone();
		let stop = shutdown.child_token();

		tokio::spawn(
			async move {
				server.serve(rx, tx, stop.cancelled_owned()).await;
			}
			.in_current_span(),
		);
	}

	shutdown.cancel();
	info!("Stopped listening for sync sessions");

	Ok(())
}
