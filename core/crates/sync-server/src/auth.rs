use td_core_shared_types::{AccountId, DeviceId};

use std::collections::HashSet;

use async_trait::async_trait;

/// Decides whether a connecting session may talk to the server.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
	/// Returns the reason sent back in `auth_failed` on rejection.
	async fn authenticate(
		&self,
		account_id: AccountId,
		device_id: DeviceId,
		token: &str,
	) -> Result<(), String>;
}

/// Accepts any account presenting one of a fixed set of tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
	tokens: HashSet<String>,
}

impl StaticTokens {
	pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			tokens: tokens.into_iter().map(Into::into).collect(),
		}
	}
}

#[async_trait]
impl Authenticator for StaticTokens {
	async fn authenticate(
		&self,
		_account_id: AccountId,
		_device_id: DeviceId,
		token: &str,
	) -> Result<(), String> {
		if self.tokens.contains(token) {
			Ok(())
		} else {
			Err("invalid token".to_string())
		}
	}
}
