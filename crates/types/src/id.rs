//! Typed identifiers.
//!
//! Newtype wrappers over UUIDs so a source id cannot be passed where a
//! task id is expected. All serialize transparently as their UUID.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub Uuid);

		impl $name {
			/// Generate a fresh random identifier.
			pub fn generate() -> Self {
				Self(Uuid::new_v4())
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
				Ok(Self(Uuid::parse_str(s)?))
			}
		}

		impl From<Uuid> for $name {
			fn from(id: Uuid) -> Self {
				Self(id)
			}
		}
	};
}

uuid_id!(
	/// Identifier of a configured [`crate::Source`].
	SourceId
);
uuid_id!(
	/// Identifier of a stored [`crate::Installation`].
	InstallationId
);
uuid_id!(
	/// Identifier of an indexed [`crate::Document`].
	DocumentId
);
uuid_id!(
	/// Identifier of a queued [`crate::Task`].
	TaskId
);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_round_trip_through_strings() {
		let id = SourceId::generate();
		let parsed: SourceId = id.to_string().parse().unwrap();
		assert_eq!(id, parsed);
	}

	#[test]
	fn ids_serialize_transparently() {
		let id = TaskId::generate();
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, format!("\"{}\"", id.0));
	}
}
