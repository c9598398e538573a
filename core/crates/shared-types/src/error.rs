use serde::{Deserialize, Serialize};

/// Error taxonomy shared by the operation boundary, the wire protocol and the change log.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
	/// Network or channel failure. Retried with backoff.
	Transport,
	/// The server rejected a change, usually a stale precondition. Never retried automatically.
	Conflict,
	/// Malformed input. Fails before anything leaves the process.
	Validation,
	NotFound,
	/// Retry budget spent, the change needs an explicit user action.
	ExhaustedRetries,
	UnknownOperation,
	Internal,
}

impl ErrorKind {
	/// Whether a change rejected with this kind may be sent again without user action.
	#[must_use]
	pub const fn is_retryable(self) -> bool {
		matches!(self, Self::Transport | Self::Internal)
	}
}

/// The `{type, message}` error object handed to callers and carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorObject {
	#[serde(rename = "type")]
	pub kind: ErrorKind,
	pub message: String,
}

impl ErrorObject {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}

	pub fn validation(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Validation, message)
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotFound, message)
	}

	pub fn conflict(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Conflict, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Internal, message)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_object_uses_type_field() {
		let error = ErrorObject::conflict("node revision is 4, change was based on 3");

		assert_eq!(
			serde_json::to_value(&error).unwrap(),
			serde_json::json!({
				"type": "conflict",
				"message": "node revision is 4, change was based on 3",
			})
		);
		assert_eq!(error.kind.to_string(), "conflict");
	}

	#[test]
	fn only_transient_kinds_are_retryable() {
		assert!(ErrorKind::Transport.is_retryable());
		assert!(ErrorKind::Internal.is_retryable());
		assert!(!ErrorKind::Conflict.is_retryable());
		assert!(!ErrorKind::Validation.is_retryable());
		assert!(!ErrorKind::NotFound.is_retryable());
	}
}
