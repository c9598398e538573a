#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Named background loops that can be started, stopped and inspected.
//!
//! Every long-running loop in tandem (a sync session, an outbox consumer) is declared here
//! under a human readable name. The loop receives a [`Stopper`] and is expected to race its
//! work against it, returning promptly once a stop is requested.

use std::{
	collections::HashMap,
	future::{Future, IntoFuture},
	panic::AssertUnwindSafe,
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	task::{Context, Poll},
	time::Duration,
};

use async_channel as chan;
use futures::{future::BoxFuture, FutureExt};
use tokio::{
	spawn,
	sync::{broadcast, RwLock},
	task::JoinHandle,
	time::timeout,
};
use tracing::{error, info, instrument, warn, Instrument};

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

type ActorFn = Arc<dyn Fn(Stopper) -> BoxFuture<'static, ()> + Send + Sync>;

struct ActorHandler {
	actor_fn: ActorFn,
	maybe_handle: Option<JoinHandle<()>>,
	is_running: Arc<AtomicBool>,
	stop_tx: chan::Sender<()>,
	stop_rx: chan::Receiver<()>,
}

/// Holds every declared actor. Cloning is cheap and yields a handle to the same collection.
pub struct Actors {
	invalidate_tx: broadcast::Sender<()>,
	actors_map: Arc<RwLock<HashMap<&'static str, ActorHandler>>>,
}

impl Actors {
	/// Declares an actor under `name`. The closure is invoked on each start, so any state it
	/// needs across restarts must be captured behind an `Arc`.
	pub async fn declare<F, Fut>(&self, name: &'static str, actor_fn: F, autostart: bool)
	where
		F: Fn(Stopper) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let (stop_tx, stop_rx) = chan::bounded(1);

		let previous = self.actors_map.write().await.insert(
			name,
			ActorHandler {
				actor_fn: Arc::new(move |stop| actor_fn(stop).boxed()),
				maybe_handle: None,
				is_running: Arc::new(AtomicBool::new(false)),
				stop_tx,
				stop_rx,
			},
		);

		if previous.is_some() {
			warn!(%name, "Actor redeclared, previous declaration replaced");
		}

		if autostart {
			self.start(name).await;
		}
	}

	#[instrument(skip(self))]
	pub async fn start(&self, name: &'static str) {
		let mut actors_map = self.actors_map.write().await;
		let Some(actor) = actors_map.get_mut(name) else {
			warn!("Tried to start an undeclared actor");
			return;
		};

		if actor.is_running.load(Ordering::Acquire) {
			warn!("Actor already running!");
			return;
		}

		if let Some(handle) = actor.maybe_handle.take() {
			if handle.await.is_err() {
				error!("Previous run of actor unexpectedly panicked");
			}
		}

		// A stop signal left over from a run that finished on its own must not stop the new run
		while actor.stop_rx.try_recv().is_ok() {}

		let is_running = Arc::clone(&actor.is_running);
		is_running.store(true, Ordering::Release);
		self.invalidate();

		let invalidate_tx = self.invalidate_tx.clone();
		let run = (actor.actor_fn)(Stopper(actor.stop_rx.clone()));

		actor.maybe_handle = Some(spawn(async move {
			if AssertUnwindSafe(run).catch_unwind().await.is_err() {
				error!(%name, "Actor unexpectedly panicked");
			}

			is_running.store(false, Ordering::Release);
			// Nobody listening for invalidations is fine
			let _ = invalidate_tx.send(());
		}
		.in_current_span()));

		info!("Actor started");
	}

	#[instrument(skip(self))]
	pub async fn stop(&self, name: &'static str) {
		let mut actors_map = self.actors_map.write().await;
		let Some(actor) = actors_map.get_mut(name) else {
			warn!("Tried to stop an undeclared actor");
			return;
		};

		if !actor.is_running.load(Ordering::Acquire) {
			return;
		}

		if actor.stop_tx.send(()).await.is_err() {
			error!("Failed to send stop signal to actor, will abort it if it doesn't finish");
		}

		actor.join_or_abort(name).await;
		actor.is_running.store(false, Ordering::Release);
		info!("Actor stopped");
	}

	/// Stops every running actor. Used on shutdown.
	pub async fn stop_all(&self) {
		let names = self
			.actors_map
			.read()
			.await
			.keys()
			.copied()
			.collect::<Vec<_>>();

		for name in names {
			self.stop(name).await;
		}
	}

	pub async fn is_running(&self, name: &'static str) -> bool {
		self.actors_map
			.read()
			.await
			.get(name)
			.is_some_and(|actor| actor.is_running.load(Ordering::Acquire))
	}

	pub async fn get_state(&self) -> Vec<(String, bool)> {
		let mut state = self
			.actors_map
			.read()
			.await
			.iter()
			.map(|(name, actor)| ((*name).to_string(), actor.is_running.load(Ordering::Relaxed)))
			.collect::<Vec<_>>();

		state.sort();
		state
	}

	/// Fires every time an actor starts or finishes.
	#[must_use]
	pub fn invalidated(&self) -> broadcast::Receiver<()> {
		self.invalidate_tx.subscribe()
	}

	fn invalidate(&self) {
		let _ = self.invalidate_tx.send(());
	}
}

impl Default for Actors {
	fn default() -> Self {
		let (invalidate_tx, _) = broadcast::channel(16);

		Self {
			invalidate_tx,
			actors_map: Arc::default(),
		}
	}
}

impl Clone for Actors {
	fn clone(&self) -> Self {
		Self {
			invalidate_tx: self.invalidate_tx.clone(),
			actors_map: Arc::clone(&self.actors_map),
		}
	}
}

/// Handed to every actor run. Awaiting `&Stopper` resolves once a stop is requested, or once
/// the actor's declaration is dropped.
pub struct Stopper(chan::Receiver<()>);

impl Stopper {
	/// Non-blocking check for loops that poll between units of work.
	#[must_use]
	pub fn check_stop(&self) -> bool {
		self.0.try_recv().is_ok()
	}
}

pin_project_lite::pin_project! {
	pub struct StopRequested<'stopper> {
		#[pin]
		recv: chan::Recv<'stopper, ()>,
	}
}

impl Future for StopRequested<'_> {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
		let Poll::Ready(signal) = self.project().recv.poll(cx) else {
			return Poll::Pending;
		};

		if signal.is_err() {
			warn!("Actor declaration dropped, stopping its run");
		}

		Poll::Ready(())
	}
}

impl<'stopper> IntoFuture for &'stopper Stopper {
	type Output = ();
	type IntoFuture = StopRequested<'stopper>;

	fn into_future(self) -> Self::IntoFuture {
		StopRequested {
			recv: self.0.recv(),
		}
	}
}

impl ActorHandler {
	/// Waits for the current run to return after a stop signal, aborting it past the grace period.
	async fn join_or_abort(&mut self, name: &'static str) {
		let Some(handle) = self.maybe_handle.take() else {
			return;
		};

		let abort = handle.abort_handle();

		let Ok(joined) = timeout(STOP_GRACE_PERIOD, handle).await else {
			error!(%name, grace_period = ?STOP_GRACE_PERIOD, "Actor ignored its stop signal, aborting;");
			abort.abort();
			return;
		};

		if let Err(e) = joined {
			error!(%name, ?e, "Actor run failed while stopping;");
		}
	}
}
