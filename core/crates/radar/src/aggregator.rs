use crate::projection::{RadarProjection, RadarState};

use td_core_shared_types::{AccountId, Change, Interaction, WorkspaceId};

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

const EVENTS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RadarEvent {
	Updated {
		workspace_id: WorkspaceId,
		account_id: AccountId,
		state: RadarState,
	},
}

/// Owns the radar projections of every tracked (workspace, user) pair and publishes their
/// updates.
#[derive(Debug)]
pub struct RadarAggregator {
	projections: RwLock<HashMap<(WorkspaceId, AccountId), RadarProjection>>,
	events: broadcast::Sender<RadarEvent>,
}

impl Default for RadarAggregator {
	fn default() -> Self {
		Self::new()
	}
}

impl RadarAggregator {
	#[must_use]
	pub fn new() -> Self {
		let (events, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);

		Self {
			projections: RwLock::default(),
			events,
		}
	}

	/// Starts an empty projection for the pair, if it isn't tracked yet.
	pub async fn track(&self, workspace_id: WorkspaceId, account_id: AccountId) {
		self.projections
			.write()
			.await
			.entry((workspace_id, account_id))
			.or_insert_with(|| RadarProjection::new(workspace_id, account_id));
	}

	pub async fn untrack_workspace(&self, workspace_id: WorkspaceId) {
		self.projections
			.write()
			.await
			.retain(|(tracked, _), _| *tracked != workspace_id);
	}

	pub async fn state(&self, workspace_id: WorkspaceId, account_id: AccountId) -> Option<RadarState> {
		self.projections
			.read()
			.await
			.get(&(workspace_id, account_id))
			.map(RadarProjection::state)
	}

	pub async fn apply_change(&self, change: &Change) {
		let mut projections = self.projections.write().await;

		for projection in projections
			.values_mut()
			.filter(|projection| projection.workspace_id() == change.workspace_id)
		{
			if projection.apply_change(change) {
				self.publish(projection);
			}
		}
	}

	pub async fn apply_interaction(&self, interaction: &Interaction) {
		if let Some(projection) = self
			.projections
			.write()
			.await
			.get_mut(&(interaction.workspace_id, interaction.account_id))
		{
			if projection.apply_interaction(interaction) {
				self.publish(projection);
			}
		}
	}

	/// Replaces the pair's projection with a full replay of its history.
	///
	/// Returns whether the replayed state differs from the incremental one, which means the
	/// incremental projection missed or double counted something.
	pub async fn rebuild<'a>(
		&self,
		workspace_id: WorkspaceId,
		account_id: AccountId,
		changes: impl IntoIterator<Item = &'a Change>,
		interactions: impl IntoIterator<Item = &'a Interaction>,
	) -> bool {
		let mut rebuilt = RadarProjection::new(workspace_id, account_id);
		for change in changes {
			rebuilt.apply_change(change);
		}
		for interaction in interactions {
			rebuilt.apply_interaction(interaction);
		}

		let mut projections = self.projections.write().await;
		let previous = projections
			.insert((workspace_id, account_id), rebuilt)
			.map(|projection| projection.state());

		let Some(projection) = projections.get(&(workspace_id, account_id)) else {
			return false;
		};

		let differed = previous.is_some_and(|previous| previous != projection.state());
		if differed {
			warn!(
				%workspace_id,
				%account_id,
				?previous,
				rebuilt = ?projection.state(),
				"Incremental radar drifted from full replay, replaced it;",
			);
		}

		if previous != Some(projection.state()) {
			self.publish(projection);
		}

		debug!(%workspace_id, %account_id, differed, "Radar rebuilt");

		differed
	}

	/// Subscribes to radar updates. Dropping the subscription unsubscribes.
	#[must_use]
	pub fn subscribe(&self) -> RadarSubscription {
		RadarSubscription {
			rx: self.events.subscribe(),
			workspace_id: None,
		}
	}

	/// Like [`Self::subscribe`], only for one workspace.
	#[must_use]
	pub fn subscribe_workspace(&self, workspace_id: WorkspaceId) -> RadarSubscription {
		RadarSubscription {
			rx: self.events.subscribe(),
			workspace_id: Some(workspace_id),
		}
	}

	#[must_use]
	pub fn subscriber_count(&self) -> usize {
		self.events.receiver_count()
	}

	fn publish(&self, projection: &RadarProjection) {
		// Nobody listening is fine
		let _ = self.events.send(RadarEvent::Updated {
			workspace_id: projection.workspace_id(),
			account_id: projection.account_id(),
			state: projection.state(),
		});
	}
}

/// A live feed of [`RadarEvent`]s.
#[derive(Debug)]
pub struct RadarSubscription {
	rx: broadcast::Receiver<RadarEvent>,
	workspace_id: Option<WorkspaceId>,
}

impl RadarSubscription {
	/// Next update, or `None` once the aggregator is gone. A subscriber that fell behind skips
	/// to the most recent updates, every event carries the full state anyway.
	pub async fn recv(&mut self) -> Option<RadarEvent> {
		loop {
			match self.rx.recv().await {
				Ok(event) => {
					let RadarEvent::Updated { workspace_id, .. } = &event;
					if self.workspace_id.is_none_or(|wanted| wanted == *workspace_id) {
						return Some(event);
					}
				}
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					debug!(skipped, "Radar subscriber lagged behind");
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}
