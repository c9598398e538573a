use super::{ChangeSink, SessionContext, SessionEvent};

use crate::{
	change_log::{ChangeStatus, LocalChangeLog, PendingChange},
	transport::Connection,
	wire::ClientMessage,
	Error,
};

use td_core_shared_types::{Change, ChangeId, ErrorKind, ErrorObject, Sequence, WorkspaceId};

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy)]
struct InFlight {
	deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Gap {
	deadline: Instant,
	requests: u32,
}

/// Client side of one workspace subscription.
pub(super) struct Replica {
	log: LocalChangeLog,
	sink: Arc<dyn ChangeSink>,
	in_flight: HashMap<ChangeId, InFlight>,
	// Results still owed for sends that a rewind superseded, per change
	superseded: HashMap<ChangeId, u32>,
	gap: Option<Gap>,
}

impl Replica {
	pub(super) fn new(log: LocalChangeLog, sink: Arc<dyn ChangeSink>) -> Self {
		Self {
			log,
			sink,
			in_flight: HashMap::new(),
			superseded: HashMap::new(),
			gap: None,
		}
	}

	pub(super) const fn workspace_id(&self) -> WorkspaceId {
		self.log.workspace_id()
	}

	pub(super) fn is_busy(&self) -> bool {
		!self.in_flight.is_empty() || self.gap.is_some()
	}

	pub(super) fn next_deadline(&self) -> Option<Instant> {
		self.in_flight
			.values()
			.map(|in_flight| in_flight.deadline)
			.chain(self.gap.map(|gap| gap.deadline))
			.min()
	}

	/// Forgets everything tied to the previous connection. Unacknowledged changes stay pending in
	/// the log and are sent again by the next flush.
	pub(super) fn reset(&mut self) {
		self.in_flight.clear();
		self.superseded.clear();
		self.gap = None;
	}

	/// Subscribes on a fresh connection, resuming from the watermark.
	pub(super) async fn resume(
		&mut self,
		ctx: &SessionContext,
		conn: &Connection,
	) -> Result<(), Error> {
		self.reset();

		let cursor = self.log.watermark().await?;
		self.log.discard_incoming_through(cursor).await?;

		conn.send(ClientMessage::Subscribe {
			workspace_id: self.workspace_id(),
			cursor,
		})
		.await?;

		debug!(workspace_id = %self.workspace_id(), cursor, "Subscribed to workspace");

		self.flush(ctx, conn).await
	}

	/// Sends pending changes in append order until `max_in_flight` of them await a result.
	pub(super) async fn flush(&mut self, ctx: &SessionContext, conn: &Connection) -> Result<(), Error> {
		self.flush_resending(ctx, conn, &HashSet::new()).await
	}

	/// Like [`Replica::flush`], sending the changes in `resend` again without spending their
	/// retry budget.
	async fn flush_resending(
		&mut self,
		ctx: &SessionContext,
		conn: &Connection,
		resend: &HashSet<ChangeId>,
	) -> Result<(), Error> {
		loop {
			let capacity = ctx.config.max_in_flight.saturating_sub(self.in_flight.len());
			if capacity == 0 {
				return Ok(());
			}

			let candidates = self
				.log
				.pending_since(0, self.in_flight.len() + capacity)
				.await?
				.into_iter()
				.filter(|change| !self.in_flight.contains_key(&change.local_id))
				.take(capacity)
				.collect::<Vec<_>>();

			if candidates.is_empty() {
				return Ok(());
			}

			let mut exhausted_any = false;
			for change in candidates {
				let charged = !resend.contains(&change.local_id);
				exhausted_any |= !self.send(ctx, conn, change, charged).await?;
			}

			// Changes that ran out of retries freed their slot without being sent
			if !exhausted_any {
				return Ok(());
			}
		}
	}

	/// Sends one change, or fails it if its retry budget is spent. Returns whether it was sent.
	///
	/// An uncharged send doesn't count as an attempt.
	async fn send(
		&mut self,
		ctx: &SessionContext,
		conn: &Connection,
		change: PendingChange,
		charged: bool,
	) -> Result<bool, Error> {
		let local_id = change.local_id;

		if change.retry_count > ctx.config.max_retries {
			self.in_flight.remove(&local_id);
			self.fail(
				ctx,
				local_id,
				ErrorObject::new(
					ErrorKind::ExhaustedRetries,
					format!("no result after {} attempts", change.retry_count),
				),
			)
			.await?;

			return Ok(false);
		}

		let attempt = if charged {
			self.log.record_attempt(local_id).await?
		} else {
			change.retry_count
		};

		conn.send(ClientMessage::ServerMutation {
			account_id: ctx.account_id,
			mutation: change.envelope(),
		})
		.await?;

		self.in_flight.insert(
			local_id,
			InFlight {
				deadline: Instant::now() + ctx.config.ack_timeout(),
			},
		);

		if attempt > 1 {
			debug!(workspace_id = %self.workspace_id(), %local_id, attempt, "Resent local change");
		} else {
			trace!(workspace_id = %self.workspace_id(), %local_id, "Sent local change");
		}

		Ok(true)
	}

	async fn fail(
		&mut self,
		ctx: &SessionContext,
		local_id: ChangeId,
		error: ErrorObject,
	) -> Result<(), Error> {
		if self.log.mark_failed(local_id, &error).await? {
			ctx.emit(SessionEvent::ChangeFailed {
				workspace_id: self.workspace_id(),
				local_id,
				error,
			});
		}

		Ok(())
	}

	pub(super) async fn handle_result(
		&mut self,
		ctx: &SessionContext,
		conn: &Connection,
		local_id: ChangeId,
		outcome: Result<Sequence, ErrorObject>,
	) -> Result<(), Error> {
		if let Some(owed) = self.superseded.get_mut(&local_id) {
			*owed -= 1;
			if *owed == 0 {
				self.superseded.remove(&local_id);
			}
			trace!(%local_id, "Result for a superseded send");
			return Ok(());
		}

		// Every send gets its own result, a late one for a change we already settled is ignored
		if self.in_flight.remove(&local_id).is_none() {
			trace!(%local_id, "Result for a change that isn't in flight");
			return Ok(());
		}

		match outcome {
			Ok(sequence) => {
				if self.log.mark_acknowledged(local_id, sequence).await? {
					ctx.emit(SessionEvent::ChangeAcknowledged {
						workspace_id: self.workspace_id(),
						local_id,
						sequence,
					});
				}
			}

			Err(error) if error.kind.is_retryable() => {
				warn!(%local_id, %error, "Server couldn't process change, will retry;");
				return self.rewind(ctx, conn).await;
			}

			Err(error) => self.fail(ctx, local_id, error).await?,
		}

		self.flush(ctx, conn).await
	}

	/// Sends everything again from the oldest pending change after the server failed one of them.
	///
	/// Changes sent after the failed one reached the server ahead of its retry and may depend on
	/// it. Their results are dropped and they are resent behind it, so the server sees them in
	/// append order again. The ones it had already sequenced are recognized by id and
	/// acknowledged again.
	async fn rewind(&mut self, ctx: &SessionContext, conn: &Connection) -> Result<(), Error> {
		let resend = self
			.in_flight
			.drain()
			.map(|(local_id, _)| local_id)
			.collect::<HashSet<_>>();

		for local_id in &resend {
			*self.superseded.entry(*local_id).or_default() += 1;
		}

		debug!(
			workspace_id = %self.workspace_id(),
			superseded = resend.len(),
			"Rewinding to the oldest pending change"
		);

		self.flush_resending(ctx, conn, &resend).await
	}

	/// Resends changes whose result didn't arrive in time and re-requests replay for stale gaps.
	pub(super) async fn handle_timeouts(
		&mut self,
		ctx: &SessionContext,
		conn: &Connection,
		now: Instant,
	) -> Result<(), Error> {
		let expired = self
			.in_flight
			.iter()
			.filter(|(_, in_flight)| in_flight.deadline <= now)
			.map(|(local_id, _)| *local_id)
			.collect::<Vec<_>>();

		for local_id in expired {
			self.in_flight.remove(&local_id);

			match self.log.get(local_id).await? {
				Some(change) if change.status == ChangeStatus::Pending => {
					debug!(%local_id, "No result for change in time");
					self.send(ctx, conn, change, true).await?;
				}
				_ => {}
			}
		}

		if let Some(gap) = self.gap.filter(|gap| gap.deadline <= now) {
			let watermark = self.log.watermark().await?;

			if gap.requests < ctx.config.max_replay_requests {
				warn!(
					workspace_id = %self.workspace_id(),
					watermark,
					requests = gap.requests,
					"Gap in change stream still open, requesting replay again;",
				);

				self.gap = Some(Gap {
					deadline: now + ctx.config.gap_timeout(),
					requests: gap.requests + 1,
				});
			} else {
				let dropped = self.log.clear_incoming().await?;

				warn!(
					workspace_id = %self.workspace_id(),
					watermark,
					dropped,
					"Gap never closed, dropping staged changes and replaying from the watermark;",
				);

				self.gap = None;
			}

			self.request_changes(ctx, conn, watermark).await?;
		}

		self.flush(ctx, conn).await
	}

	pub(super) async fn request_changes(
		&self,
		ctx: &SessionContext,
		conn: &Connection,
		after_sequence: Sequence,
	) -> Result<(), Error> {
		conn.send(ClientMessage::ServerChangesRequest {
			workspace_id: self.workspace_id(),
			after_sequence,
			limit: ctx.config.replay_batch_size,
		})
		.await
		.map_err(Into::into)
	}

	/// Periodic request for anything after the watermark, catching changes lost at the tail of the
	/// stream that no later change would reveal as a gap.
	pub(super) async fn catch_up(&self, ctx: &SessionContext, conn: &Connection) -> Result<(), Error> {
		if self.gap.is_some() {
			return Ok(());
		}

		let watermark = self.log.watermark().await?;
		self.request_changes(ctx, conn, watermark).await
	}

	/// Applies server changes strictly in sequence order.
	///
	/// Changes at or below the watermark were applied already and are skipped. Changes beyond the
	/// next expected sequence are staged until the ones before them arrive.
	pub(super) async fn receive(
		&mut self,
		ctx: &SessionContext,
		conn: &Connection,
		mut changes: Vec<Change>,
		has_more: bool,
	) -> Result<(), Error> {
		changes.sort_by_key(|change| change.sequence);

		let workspace_id = self.workspace_id();
		let mut watermark = self.log.watermark().await?;
		let mut last_applied = None;

		for change in changes {
			if change.workspace_id != workspace_id {
				warn!(
					%workspace_id,
					change_workspace_id = %change.workspace_id,
					"Dropping change routed to the wrong workspace;",
				);
				continue;
			}

			if change.sequence <= watermark {
				trace!(sequence = change.sequence, watermark, "Skipping already applied change");
				continue;
			}

			if change.sequence > watermark + 1 {
				self.log.stage_incoming(std::slice::from_ref(&change)).await?;
				continue;
			}

			last_applied = Some(self.apply(ctx, &change).await?);
			watermark = change.sequence;

			while let Some(staged) = self.log.next_incoming(watermark).await? {
				last_applied = Some(self.apply(ctx, &staged).await?);
				watermark = staged.sequence;
			}
		}

		if let Some(change_id) = last_applied {
			conn.send(ClientMessage::ServerChangeAck {
				workspace_id,
				change_id,
				sequence: watermark,
			})
			.await?;
		}

		match self.log.lowest_incoming().await? {
			Some(next_sequence) => {
				if self.gap.is_none() {
					warn!(%workspace_id, watermark, next_sequence, "Gap detected in change stream;");

					self.gap = Some(Gap {
						deadline: Instant::now() + ctx.config.gap_timeout(),
						requests: 1,
					});

					ctx.emit(SessionEvent::GapDetected {
						workspace_id,
						watermark,
						next_sequence,
					});

					return self.request_changes(ctx, conn, watermark).await;
				}
			}
			None => {
				if self.gap.take().is_some() {
					info!(%workspace_id, watermark, "Gap in change stream closed");
				}
			}
		}

		if has_more && self.gap.is_none() {
			self.request_changes(ctx, conn, watermark).await?;
		}

		Ok(())
	}

	async fn apply(&self, ctx: &SessionContext, change: &Change) -> Result<ChangeId, Error> {
		self.sink
			.apply(change)
			.await
			.map_err(|e| Error::Apply {
				sequence: change.sequence,
				message: e.to_string(),
			})?;

		self.log.commit_applied(change).await?;

		ctx.emit(SessionEvent::ChangeApplied {
			workspace_id: change.workspace_id,
			sequence: change.sequence,
		});

		Ok(change.id)
	}
}
