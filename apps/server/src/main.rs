use td_core_outbox::{OutboxConsumer, OutboxHandlers, OutboxStore, OutboxTaskKind};
use td_core_sync::db::open_database;
use td_core_sync_server::{serve_tcp, ServerStore, StaticTokens, SyncServer};

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::Parser;
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info, warn};

mod config;
mod effects;
mod logging;

use config::ServerConfig;
use effects::{MailSpool, NodeContentCleaner};

#[derive(Debug, Parser)]
#[command(name = "td-server", about = "Sequencing sync server for tandem workspaces")]
struct Args {
	/// TOML config file. Built-in defaults are used without one.
	#[arg(short, long, env = "TD_CONFIG")]
	config: Option<PathBuf>,
	#[arg(long, env = "TD_DATA_DIR")]
	data_dir: Option<PathBuf>,
	/// Address to listen on, e.g. `0.0.0.0:7400`.
	#[arg(long, env = "TD_LISTEN")]
	listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let mut config = ServerConfig::load(args.config.as_deref())?;
	if let Some(data_dir) = args.data_dir {
		config.data_dir = data_dir;
	}
	if let Some(listen) = args.listen {
		config.listen = listen;
	}

	std::fs::create_dir_all(&config.data_dir).with_context(|| {
		format!("failed to create data dir <{}>", config.data_dir.display())
	})?;

	let _guard = logging::init(&config)?;

	if config.tokens.is_empty() {
		bail!("no device tokens configured, every connection would be refused");
	}

	let db = open_database(config.database_path()).await?;
	let store = ServerStore::open(db.clone()).await?;
	let outbox = OutboxStore::open(db.clone()).await?;

	let handlers = OutboxHandlers::builder()
		.register(OutboxTaskKind::SendEmail, MailSpool::new(config.mail_dir()))?
		.register(OutboxTaskKind::NodeCleanup, NodeContentCleaner::new(db))?
		.build();

	let consumer = Arc::new(OutboxConsumer::new(
		outbox,
		Arc::new(handlers),
		config.outbox.clone(),
	));

	let server = SyncServer::with_outbox(
		store,
		StaticTokens::new(config.tokens.iter().cloned()),
		config.sync.clone(),
		consumer.notifier(),
	);

	let (stop_tx, stop_rx) = watch::channel(false);
	let stopped = |mut rx: watch::Receiver<bool>| async move {
		// A dropped sender means we're going down as well
		let _ = rx.wait_for(|stop| *stop).await;
	};

	let consumer_task = tokio::spawn({
		let consumer = Arc::clone(&consumer);
		let stop = stopped(stop_rx.clone());
		async move { consumer.run(stop).await }
	});

	let failures_task = tokio::spawn({
		let mut failures = consumer.subscribe_failures();
		async move {
			while let Ok(failure) = failures.recv().await {
				warn!(
					task_id = %failure.task_id,
					kind = %failure.kind,
					attempts = failure.attempts,
					error = %failure.error,
					"Side effect needs attention;"
				);
			}
		}
	});

	let listener = TcpListener::bind(&config.listen)
		.await
		.with_context(|| format!("failed to listen on <{}>", config.listen))?;

	info!(listen = %config.listen, data_dir = %config.data_dir.display(), "Sync server started");

	let serve = tokio::spawn(serve_tcp(listener, server, stopped(stop_rx)));

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!(?e, "Failed to listen for shutdown signal;");
	}

	info!("Shutting down");
	stop_tx.send_replace(true);

	serve.await??;
	consumer_task.await?;
	failures_task.abort();

	info!("Sync server stopped");

	Ok(())
}
