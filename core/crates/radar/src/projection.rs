use td_core_shared_types::{
	AccountId, Change, Interaction, InteractionKind, NodeId, NodeMutation, NodeType, Sequence,
	WorkspaceId,
};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadarState {
	pub unread_count: u64,
	pub mention_count: u64,
	pub last_interaction_at: Option<DateTime<Utc>>,
}

/// What the projection knows about one node. Every field merges commutatively: the version with
/// the highest sequence wins, deletion is final and `seen` only grows.
#[derive(Debug, Default, Clone)]
struct NodeRecord {
	node_type: Option<NodeType>,
	author: Option<AccountId>,
	latest_sequence: Sequence,
	mentions: Vec<AccountId>,
	mentions_sequence: Sequence,
	deleted: bool,
	seen: Sequence,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Contribution {
	unread: bool,
	mention: bool,
}

impl NodeRecord {
	fn contribution(&self, account_id: AccountId) -> Contribution {
		let unread = self.node_type == Some(NodeType::Message)
			&& !self.deleted
			&& self.author.is_some_and(|author| author != account_id)
			&& self.seen < self.latest_sequence;

		Contribution {
			unread,
			mention: unread && self.mentions.contains(&account_id),
		}
	}
}

/// Incremental radar for one user in one workspace.
#[derive(Debug, Clone)]
pub struct RadarProjection {
	workspace_id: WorkspaceId,
	account_id: AccountId,
	nodes: HashMap<NodeId, NodeRecord>,
	state: RadarState,
}

impl RadarProjection {
	#[must_use]
	pub fn new(workspace_id: WorkspaceId, account_id: AccountId) -> Self {
		Self {
			workspace_id,
			account_id,
			nodes: HashMap::new(),
			state: RadarState::default(),
		}
	}

	#[must_use]
	pub const fn state(&self) -> RadarState {
		self.state
	}

	#[must_use]
	pub const fn workspace_id(&self) -> WorkspaceId {
		self.workspace_id
	}

	#[must_use]
	pub const fn account_id(&self) -> AccountId {
		self.account_id
	}

	/// Folds in an applied change. Returns whether the state changed.
	pub fn apply_change(&mut self, change: &Change) -> bool {
		if change.workspace_id != self.workspace_id {
			return false;
		}

		self.update_node(change.node_id, |record| {
			record.node_type.get_or_insert(change.node_type);
			record.latest_sequence = record.latest_sequence.max(change.sequence);

			match &change.mutation {
				NodeMutation::Create {
					node_type,
					mentions,
					..
				} => {
					record.node_type = Some(*node_type);
					record.author = Some(change.created_by);
					record.set_mentions(mentions, change.sequence);
				}
				NodeMutation::Update { mentions, .. } => {
					record.set_mentions(mentions, change.sequence);
				}
				NodeMutation::Delete => record.deleted = true,
			}
		})
	}

	/// Folds in one of the user's interactions. Other users' interactions are ignored.
	pub fn apply_interaction(&mut self, interaction: &Interaction) -> bool {
		if interaction.workspace_id != self.workspace_id || interaction.account_id != self.account_id
		{
			return false;
		}

		let before = self.state;

		self.state.last_interaction_at = self
			.state
			.last_interaction_at
			.max(Some(interaction.occurred_at));

		match interaction.kind {
			InteractionKind::Seen { sequence } => {
				self.update_node(interaction.node_id, |record| {
					record.seen = record.seen.max(sequence);
				});
			}
		}

		self.state != before
	}

	/// Recomputes only the touched node's share of the counters.
	fn update_node(&mut self, node_id: NodeId, update: impl FnOnce(&mut NodeRecord)) -> bool {
		let record = self.nodes.entry(node_id).or_default();

		let before = record.contribution(self.account_id);
		update(record);
		let after = record.contribution(self.account_id);

		if before == after {
			return false;
		}

		self.state.unread_count = adjust(self.state.unread_count, before.unread, after.unread);
		self.state.mention_count = adjust(self.state.mention_count, before.mention, after.mention);

		true
	}
}

impl NodeRecord {
	fn set_mentions(&mut self, mentions: &[AccountId], sequence: Sequence) {
		if sequence >= self.mentions_sequence {
			self.mentions = mentions.to_vec();
			self.mentions_sequence = sequence;
		}
	}
}

const fn adjust(count: u64, before: bool, after: bool) -> u64 {
	match (before, after) {
		(false, true) => count + 1,
		(true, false) => count.saturating_sub(1),
		_ => count,
	}
}

/// Full replay of `changes` and `interactions`, in any order.
pub fn compute_radar<'a>(
	workspace_id: WorkspaceId,
	account_id: AccountId,
	changes: impl IntoIterator<Item = &'a Change>,
	interactions: impl IntoIterator<Item = &'a Interaction>,
) -> RadarState {
	let mut projection = RadarProjection::new(workspace_id, account_id);

	for change in changes {
		projection.apply_change(change);
	}

	for interaction in interactions {
		projection.apply_interaction(interaction);
	}

	projection.state()
}

#[cfg(test)]
mod tests {
	use super::*;

	use td_core_shared_types::ChangeId;

	use serde_json::json;

	struct Fixture {
		workspace_id: WorkspaceId,
		me: AccountId,
		someone: AccountId,
	}

	impl Fixture {
		fn new() -> Self {
			Self {
				workspace_id: WorkspaceId::new(),
				me: AccountId::new(),
				someone: AccountId::new(),
			}
		}

		fn change(
			&self,
			node_id: NodeId,
			sequence: Sequence,
			created_by: AccountId,
			mutation: NodeMutation,
		) -> Change {
			Change {
				id: ChangeId::new(),
				workspace_id: self.workspace_id,
				node_id,
				node_type: NodeType::Message,
				created_by,
				mutation,
				sequence,
				created_at: Utc::now(),
			}
		}

		fn message(&self, node_id: NodeId, sequence: Sequence, mentions: Vec<AccountId>) -> Change {
			self.change(
				node_id,
				sequence,
				self.someone,
				NodeMutation::Create {
					node_type: NodeType::Message,
					parent_id: Some(NodeId::new()),
					attributes: json!({ "text": "hey" }),
					mentions,
				},
			)
		}

		fn seen(&self, node_id: NodeId, sequence: Sequence) -> Interaction {
			Interaction {
				workspace_id: self.workspace_id,
				node_id,
				account_id: self.me,
				kind: InteractionKind::Seen { sequence },
				occurred_at: Utc::now(),
			}
		}
	}

	#[test]
	fn counts_unread_messages_and_mentions_from_others() {
		let f = Fixture::new();
		let mut radar = RadarProjection::new(f.workspace_id, f.me);

		let plain = NodeId::new();
		let mentioning = NodeId::new();

		assert!(radar.apply_change(&f.message(plain, 1, vec![])));
		assert!(radar.apply_change(&f.message(mentioning, 2, vec![f.me])));

		// my own messages are never unread
		let mut mine = f.message(NodeId::new(), 3, vec![f.me]);
		mine.created_by = f.me;
		assert!(!radar.apply_change(&mine));

		assert_eq!(
			radar.state(),
			RadarState {
				unread_count: 2,
				mention_count: 1,
				last_interaction_at: None,
			}
		);

		let seen = f.seen(mentioning, 2);
		assert!(radar.apply_interaction(&seen));
		assert_eq!(radar.state().unread_count, 1);
		assert_eq!(radar.state().mention_count, 0);
		assert_eq!(radar.state().last_interaction_at, Some(seen.occurred_at));
	}

	#[test]
	fn edits_after_seen_make_a_message_unread_again() {
		let f = Fixture::new();
		let mut radar = RadarProjection::new(f.workspace_id, f.me);
		let node_id = NodeId::new();

		radar.apply_change(&f.message(node_id, 1, vec![]));
		radar.apply_interaction(&f.seen(node_id, 1));
		assert_eq!(radar.state().unread_count, 0);

		radar.apply_change(&f.change(
			node_id,
			4,
			f.someone,
			NodeMutation::Update {
				attributes: json!({ "text": "edited" }),
				mentions: vec![f.me],
			},
		));
		assert_eq!(radar.state().unread_count, 1);
		assert_eq!(radar.state().mention_count, 1);

		// deletes are final, whatever arrives after them
		radar.apply_change(&f.change(node_id, 5, f.someone, NodeMutation::Delete));
		radar.apply_change(&f.change(
			node_id,
			3,
			f.someone,
			NodeMutation::Update {
				attributes: json!({}),
				mentions: vec![f.me],
			},
		));
		assert_eq!(radar.state(), RadarState {
			last_interaction_at: radar.state().last_interaction_at,
			..Default::default()
		});
	}

	#[test]
	fn applying_twice_changes_nothing() {
		let f = Fixture::new();
		let mut radar = RadarProjection::new(f.workspace_id, f.me);
		let node_id = NodeId::new();

		let change = f.message(node_id, 1, vec![f.me]);
		assert!(radar.apply_change(&change));
		assert!(!radar.apply_change(&change));

		let seen = f.seen(node_id, 1);
		assert!(radar.apply_interaction(&seen));
		assert!(!radar.apply_interaction(&seen));

		assert_eq!(radar.state().unread_count, 0);
	}

	#[test]
	fn ignores_other_workspaces_and_other_users_interactions() {
		let f = Fixture::new();
		let mut radar = RadarProjection::new(f.workspace_id, f.me);
		let node_id = NodeId::new();

		let mut elsewhere = f.message(node_id, 1, vec![]);
		elsewhere.workspace_id = WorkspaceId::new();
		assert!(!radar.apply_change(&elsewhere));

		radar.apply_change(&f.message(node_id, 1, vec![]));

		let mut theirs = f.seen(node_id, 1);
		theirs.account_id = f.someone;
		assert!(!radar.apply_interaction(&theirs));
		assert_eq!(radar.state().unread_count, 1);
	}
}
