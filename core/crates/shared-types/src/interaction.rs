use crate::{AccountId, NodeId, Sequence, WorkspaceId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionKind {
	/// The user has seen the node up to and including `sequence`.
	Seen { sequence: Sequence },
}

/// A record of something the user did with a node. Only the user's own interactions are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub account_id: AccountId,
	pub kind: InteractionKind,
	pub occurred_at: DateTime<Utc>,
}
