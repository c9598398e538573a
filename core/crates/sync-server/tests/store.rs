use td_core_outbox::{OutboxStore, OutboxTaskKind};
use td_core_shared_types::{
	AccountId, ChangeId, ErrorKind, NodeId, NodeMutation, NodeType, Sequence, WorkspaceId,
};
use td_core_sync::{db::open_database, wire::MutationEnvelope};
use td_core_sync_server::{MutationOutcome, ServerStore};

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

async fn open_store() -> (TempDir, ServerStore) {
	let dir = TempDir::new().unwrap();
	let db = open_database(dir.path().join("server.db")).await.unwrap();

	(dir, ServerStore::open(db).await.unwrap())
}

fn envelope(
	workspace_id: WorkspaceId,
	node_id: NodeId,
	mutation: NodeMutation,
	base_revision: Option<Sequence>,
) -> MutationEnvelope {
	MutationEnvelope {
		id: ChangeId::new(),
		workspace_id,
		node_id,
		mutation,
		base_revision,
		created_at: Utc::now(),
	}
}

fn create(node_type: NodeType, parent_id: Option<NodeId>, mentions: Vec<AccountId>) -> NodeMutation {
	NodeMutation::Create {
		node_type,
		parent_id,
		attributes: json!({}),
		mentions,
	}
}

fn update(text: &str) -> NodeMutation {
	NodeMutation::Update {
		attributes: json!({ "text": text }),
		mentions: vec![],
	}
}

fn applied_sequence(outcome: MutationOutcome) -> Sequence {
	match outcome {
		MutationOutcome::Applied { change, .. } => change.sequence,
		other => panic!("expected the mutation to apply, got {other:?}"),
	}
}

fn rejection(outcome: MutationOutcome) -> ErrorKind {
	match outcome {
		MutationOutcome::Rejected(error) => error.kind,
		other => panic!("expected a rejection, got {other:?}"),
	}
}

#[tokio::test]
async fn sequences_are_contiguous_per_workspace_and_resends_are_deduplicated() {
	let (_dir, store) = open_store().await;
	let author = AccountId::new();
	let workspace = WorkspaceId::new();
	let other_workspace = WorkspaceId::new();

	let first = envelope(workspace, NodeId::new(), create(NodeType::Channel, None, vec![]), None);
	assert_eq!(applied_sequence(store.apply_mutation(author, &first).await.unwrap()), 1);

	let second = envelope(workspace, NodeId::new(), create(NodeType::Space, None, vec![]), None);
	assert_eq!(applied_sequence(store.apply_mutation(author, &second).await.unwrap()), 2);

	let elsewhere = envelope(
		other_workspace,
		NodeId::new(),
		create(NodeType::Space, None, vec![]),
		None,
	);
	assert_eq!(applied_sequence(store.apply_mutation(author, &elsewhere).await.unwrap()), 1);

	match store.apply_mutation(author, &first).await.unwrap() {
		MutationOutcome::Duplicate(change) => {
			assert_eq!(change.id, first.id);
			assert_eq!(change.sequence, 1);
		}
		other => panic!("resend should be recognized, got {other:?}"),
	}

	assert_eq!(store.last_sequence(workspace).await.unwrap(), 2);

	let (changes, has_more) = store.changes_after(workspace, 0, 10).await.unwrap();
	assert_eq!(
		changes.iter().map(|c| c.sequence).collect::<Vec<_>>(),
		vec![1, 2]
	);
	assert!(!has_more);
}

#[tokio::test]
async fn replay_pages_report_more() {
	let (_dir, store) = open_store().await;
	let author = AccountId::new();
	let workspace = WorkspaceId::new();

	for _ in 0..5 {
		let change = envelope(workspace, NodeId::new(), create(NodeType::Channel, None, vec![]), None);
		store.apply_mutation(author, &change).await.unwrap();
	}

	let (page, has_more) = store.changes_after(workspace, 1, 2).await.unwrap();
	assert_eq!(page.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![2, 3]);
	assert!(has_more);

	let (page, has_more) = store.changes_after(workspace, 3, 2).await.unwrap();
	assert_eq!(page.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![4, 5]);
	assert!(!has_more);
}

#[tokio::test]
async fn node_preconditions_are_enforced() {
	let (_dir, store) = open_store().await;
	let author = AccountId::new();
	let workspace = WorkspaceId::new();
	let channel = NodeId::new();

	// Updating something that was never created
	let orphan_update = envelope(workspace, NodeId::new(), update("hi"), None);
	assert_eq!(
		rejection(store.apply_mutation(author, &orphan_update).await.unwrap()),
		ErrorKind::NotFound
	);

	// A message under a parent that doesn't exist
	let orphan_message = envelope(
		workspace,
		NodeId::new(),
		create(NodeType::Message, Some(NodeId::new()), vec![]),
		None,
	);
	assert_eq!(
		rejection(store.apply_mutation(author, &orphan_message).await.unwrap()),
		ErrorKind::NotFound
	);

	let create_channel = envelope(workspace, channel, create(NodeType::Channel, None, vec![]), None);
	assert_eq!(applied_sequence(store.apply_mutation(author, &create_channel).await.unwrap()), 1);

	let recreate = envelope(workspace, channel, create(NodeType::Channel, None, vec![]), None);
	assert_eq!(
		rejection(store.apply_mutation(author, &recreate).await.unwrap()),
		ErrorKind::Conflict
	);

	let malformed = envelope(
		workspace,
		channel,
		NodeMutation::Update {
			attributes: json!("not an object"),
			mentions: vec![],
		},
		None,
	);
	assert_eq!(
		rejection(store.apply_mutation(author, &malformed).await.unwrap()),
		ErrorKind::Validation
	);

	// Two edits based on the same revision, the second one is stale
	let edit = envelope(workspace, channel, update("a"), Some(1));
	assert_eq!(applied_sequence(store.apply_mutation(author, &edit).await.unwrap()), 2);
	let stale = envelope(workspace, channel, update("b"), Some(1));
	assert_eq!(
		rejection(store.apply_mutation(author, &stale).await.unwrap()),
		ErrorKind::Conflict
	);

	let delete = envelope(workspace, channel, NodeMutation::Delete, None);
	assert_eq!(applied_sequence(store.apply_mutation(author, &delete).await.unwrap()), 3);
	let after_delete = envelope(workspace, channel, update("c"), None);
	assert_eq!(
		rejection(store.apply_mutation(author, &after_delete).await.unwrap()),
		ErrorKind::Conflict
	);

	let node = store.node(workspace, channel).await.unwrap().unwrap();
	assert_eq!(node.attributes, json!({ "text": "a" }));
	assert_eq!(node.revision, 3);
	assert!(node.deleted);

	// Rejections never consume a sequence
	assert_eq!(store.last_sequence(workspace).await.unwrap(), 3);
}

#[tokio::test]
async fn side_effects_are_queued_with_the_change() {
	let (_dir, store) = open_store().await;
	let outbox = OutboxStore::open(store.db().clone()).await.unwrap();

	let author = AccountId::new();
	let mentioned = AccountId::new();
	let workspace = WorkspaceId::new();
	let channel = NodeId::new();
	let message = NodeId::new();

	store
		.apply_mutation(
			author,
			&envelope(workspace, channel, create(NodeType::Channel, None, vec![]), None),
		)
		.await
		.unwrap();

	let mention = envelope(
		workspace,
		message,
		create(NodeType::Message, Some(channel), vec![mentioned, author]),
		None,
	);
	match store.apply_mutation(author, &mention).await.unwrap() {
		MutationOutcome::Applied { tasks, .. } => assert_eq!(tasks, 1),
		other => panic!("expected the mention to apply, got {other:?}"),
	}

	let email = outbox
		.get_by_key(&format!("mention:{}:{mentioned}", mention.id))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(email.kind, OutboxTaskKind::SendEmail);
	assert!(outbox
		.get_by_key(&format!("mention:{}:{author}", mention.id))
		.await
		.unwrap()
		.is_none());

	let delete = envelope(workspace, message, NodeMutation::Delete, None);
	store.apply_mutation(author, &delete).await.unwrap();

	let cleanup = outbox
		.get_by_key(&format!("cleanup:{workspace}:{message}"))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(cleanup.kind, OutboxTaskKind::NodeCleanup);
}
