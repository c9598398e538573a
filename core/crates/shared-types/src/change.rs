use crate::{AccountId, ChangeId, NodeId, Sequence, WorkspaceId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
	Space,
	Channel,
	Chat,
	Page,
	Message,
	Record,
	Folder,
}

impl NodeType {
	/// Node types that can only exist under a parent.
	#[must_use]
	pub const fn requires_parent(self) -> bool {
		matches!(self, Self::Message | Self::Record | Self::Page)
	}
}

/// The payload of a change: what happened to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum NodeMutation {
	Create {
		node_type: NodeType,
		parent_id: Option<NodeId>,
		attributes: Value,
		#[serde(default)]
		mentions: Vec<AccountId>,
	},
	Update {
		attributes: Value,
		#[serde(default)]
		mentions: Vec<AccountId>,
	},
	Delete,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MutationValidationError {
	#[error("attributes must be a JSON object")]
	AttributesNotObject,
	#[error("a {0} node must have a parent")]
	MissingParent(NodeType),
	#[error("node can't be its own parent")]
	SelfParent,
	#[error("duplicated mention of account {0}")]
	DuplicatedMention(AccountId),
}

impl NodeMutation {
	#[must_use]
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Create { .. } => "create",
			Self::Update { .. } => "update",
			Self::Delete => "delete",
		}
	}

	#[must_use]
	pub fn mentions(&self) -> &[AccountId] {
		match self {
			Self::Create { mentions, .. } | Self::Update { mentions, .. } => mentions,
			Self::Delete => &[],
		}
	}

	/// Structural checks that don't need any stored state.
	pub fn validate(&self, node_id: NodeId) -> Result<(), MutationValidationError> {
		let (attributes, mentions) = match self {
			Self::Create {
				node_type,
				parent_id,
				attributes,
				mentions,
			} => {
				if node_type.requires_parent() && parent_id.is_none() {
					return Err(MutationValidationError::MissingParent(*node_type));
				}
				if *parent_id == Some(node_id) {
					return Err(MutationValidationError::SelfParent);
				}
				(attributes, mentions)
			}
			Self::Update {
				attributes,
				mentions,
			} => (attributes, mentions),
			Self::Delete => return Ok(()),
		};

		if !attributes.is_object() {
			return Err(MutationValidationError::AttributesNotObject);
		}

		for (idx, mention) in mentions.iter().enumerate() {
			if mentions[..idx].contains(mention) {
				return Err(MutationValidationError::DuplicatedMention(*mention));
			}
		}

		Ok(())
	}
}

/// A server-sequenced unit of applied mutation to workspace state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
	pub id: ChangeId,
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub node_type: NodeType,
	pub created_by: AccountId,
	pub mutation: NodeMutation,
	#[serde(rename = "serverSequence")]
	pub sequence: Sequence,
	pub created_at: DateTime<Utc>,
}
