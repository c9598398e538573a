use td_core_shared_types::{AccountId, ChangeId, NodeId, WorkspaceId};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxTaskId(Uuid);

impl OutboxTaskId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for OutboxTaskId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for OutboxTaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl std::str::FromStr for OutboxTaskId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.parse().map(Self)
	}
}

/// The closed set of side effects the outbox knows how to run.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboxTaskKind {
	SendEmail,
	NodeCleanup,
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboxStatus {
	Queued,
	InFlight,
	Done,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxTask {
	pub id: OutboxTaskId,
	pub kind: OutboxTaskKind,
	pub payload: serde_json::Value,
	/// Identity of the side effect. At most one task exists per key.
	pub dedupe_key: String,
	pub attempts: u32,
	pub status: OutboxStatus,
	pub lease_owner: Option<String>,
	pub lease_expires_at: Option<DateTime<Utc>>,
	pub available_at: DateTime<Utc>,
	pub last_error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl OutboxTask {
	pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_value(self.payload.clone())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxTask {
	pub kind: OutboxTaskKind,
	pub payload: serde_json::Value,
	pub dedupe_key: String,
}

/// Notify an account that a change mentioned them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmail {
	pub workspace_id: WorkspaceId,
	pub recipient: AccountId,
	pub mentioned_by: AccountId,
	pub node_id: NodeId,
	pub change_id: ChangeId,
}

/// Release whatever a deleted node left behind outside the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCleanup {
	pub workspace_id: WorkspaceId,
	pub node_id: NodeId,
	pub change_id: ChangeId,
}

impl SendEmail {
	pub fn into_task(self) -> Result<NewOutboxTask, serde_json::Error> {
		Ok(NewOutboxTask {
			kind: OutboxTaskKind::SendEmail,
			dedupe_key: format!("mention:{}:{}", self.change_id, self.recipient),
			payload: serde_json::to_value(self)?,
		})
	}
}

impl NodeCleanup {
	pub fn into_task(self) -> Result<NewOutboxTask, serde_json::Error> {
		Ok(NewOutboxTask {
			kind: OutboxTaskKind::NodeCleanup,
			dedupe_key: format!("cleanup:{}:{}", self.workspace_id, self.node_id),
			payload: serde_json::to_value(self)?,
		})
	}
}
