use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
	($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
		$(
			$(#[$meta])*
			#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
			#[serde(transparent)]
			pub struct $name(Uuid);

			impl $name {
				#[must_use]
				pub fn new() -> Self {
					Self(Uuid::now_v7())
				}

				#[must_use]
				pub const fn from_uuid(uuid: Uuid) -> Self {
					Self(uuid)
				}

				#[must_use]
				pub const fn as_uuid(&self) -> &Uuid {
					&self.0
				}
			}

			impl Default for $name {
				fn default() -> Self {
					Self::new()
				}
			}

			impl fmt::Display for $name {
				fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
					self.0.fmt(f)
				}
			}

			impl FromStr for $name {
				type Err = uuid::Error;

				fn from_str(s: &str) -> Result<Self, Self::Err> {
					Uuid::parse_str(s).map(Self)
				}
			}

			impl From<Uuid> for $name {
				fn from(uuid: Uuid) -> Self {
					Self(uuid)
				}
			}
		)+
	};
}

define_id!(
	/// A collaboration tenant.
	WorkspaceId,
	NodeId,
	AccountId,
	DeviceId,
	/// Identity of a change. A locally originated change keeps the id it was appended with, so
	/// the server can recognize a resend.
	ChangeId,
	SessionId,
);
