//! Messages exchanged between a sync session and the server, one JSON object per message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use td_core_shared_types::{
	AccountId, Change, ChangeId, DeviceId, ErrorObject, NodeId, NodeMutation, Sequence, SessionId,
	WorkspaceId,
};

/// A locally originated change, as shipped to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEnvelope {
	pub id: ChangeId,
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub mutation: NodeMutation,
	/// Node revision the edit was made against. A mismatch on the server is a conflict.
	pub base_revision: Option<Sequence>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
	Init {
		account_id: AccountId,
		device_id: DeviceId,
		token: String,
	},
	/// Start receiving a workspace's changes, replaying everything after `cursor` first.
	Subscribe {
		workspace_id: WorkspaceId,
		cursor: Sequence,
	},
	Unsubscribe {
		workspace_id: WorkspaceId,
	},
	ServerMutation {
		account_id: AccountId,
		mutation: MutationEnvelope,
	},
	/// Everything up to and including `sequence` is applied locally.
	ServerChangeAck {
		workspace_id: WorkspaceId,
		change_id: ChangeId,
		sequence: Sequence,
	},
	ServerChangesRequest {
		workspace_id: WorkspaceId,
		after_sequence: Sequence,
		limit: u32,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
	Authenticated {
		session_id: SessionId,
	},
	AuthFailed {
		reason: String,
	},
	ServerChange {
		change: Change,
	},
	ServerChangeBatch {
		workspace_id: WorkspaceId,
		changes: Vec<Change>,
		has_more: bool,
	},
	ServerChangeResult {
		change_id: ChangeId,
		workspace_id: WorkspaceId,
		success: bool,
		sequence: Option<Sequence>,
		error: Option<ErrorObject>,
	},
	Error {
		error: ErrorObject,
	},
}

/// Notifications propagated between components of the same device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LocalNotification {
	LocalNodeSync {
		workspace_id: WorkspaceId,
		node_id: NodeId,
		revision: Sequence,
	},
	LocalNodeDelete {
		workspace_id: WorkspaceId,
		node_id: NodeId,
	},
}

impl LocalNotification {
	#[must_use]
	pub const fn workspace_id(&self) -> WorkspaceId {
		match self {
			Self::LocalNodeSync { workspace_id, .. } | Self::LocalNodeDelete { workspace_id, .. } => {
				*workspace_id
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde_json::json;
	use td_core_shared_types::{ErrorKind, NodeType};

	#[test]
	fn client_messages_are_tagged_by_type() {
		let workspace_id = WorkspaceId::new();
		let change_id = ChangeId::new();

		assert_eq!(
			serde_json::to_value(ClientMessage::ServerChangeAck {
				workspace_id,
				change_id,
				sequence: 7,
			})
			.unwrap(),
			json!({
				"type": "server_change_ack",
				"workspaceId": workspace_id,
				"changeId": change_id,
				"sequence": 7,
			})
		);
	}

	#[test]
	fn server_change_batch_parses() {
		let workspace_id = WorkspaceId::new();
		let change = Change {
			id: ChangeId::new(),
			workspace_id,
			node_id: NodeId::new(),
			node_type: NodeType::Page,
			created_by: AccountId::new(),
			mutation: NodeMutation::Delete,
			sequence: 5,
			created_at: Utc::now(),
		};

		let raw = json!({
			"type": "server_change_batch",
			"workspaceId": workspace_id,
			"changes": [change],
			"hasMore": false,
		});

		assert_eq!(
			serde_json::from_value::<ServerMessage>(raw).unwrap(),
			ServerMessage::ServerChangeBatch {
				workspace_id,
				changes: vec![change],
				has_more: false,
			}
		);
	}

	#[test]
	fn failed_result_carries_typed_error() {
		let message = ServerMessage::ServerChangeResult {
			change_id: ChangeId::new(),
			workspace_id: WorkspaceId::new(),
			success: false,
			sequence: None,
			error: Some(ErrorObject::conflict("stale revision")),
		};

		let value = serde_json::to_value(&message).unwrap();
		assert_eq!(value["type"], "server_change_result");
		assert_eq!(value["error"]["type"], "conflict");

		let ServerMessage::ServerChangeResult { error, .. } =
			serde_json::from_value(value).unwrap()
		else {
			panic!("wrong variant");
		};
		assert_eq!(error.map(|e| e.kind), Some(ErrorKind::Conflict));
	}
}
