//! Identity atoms.
//!
//! InstanceId: a running application install (one per machine/profile)
//! SdId: a storage directory replica tree
//! NoteId / FolderId: document identifiers
//! MoveId: a cross-directory move in flight

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

macro_rules! uuid_id {
    ($name:ident, $variant:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Fresh random id (v4).
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse_str(s: &str) -> Result<Self, CoreError> {
                parse_uuid_id(s, |raw, reason| InvalidId::$variant { raw, reason }).map(Self)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                $name::parse_str(&s)
            }
        }
    };
}

uuid_id!(InstanceId, Instance);
uuid_id!(SdId, Sd);
uuid_id!(NoteId, Note);
uuid_id!(FolderId, Folder);
uuid_id!(MoveId, Move);

fn parse_uuid_id<F>(raw: &str, invalid: F) -> Result<Uuid, CoreError>
where
    F: FnOnce(String, String) -> InvalidId,
{
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid(raw.to_string(), "empty".into()).into());
    }
    Uuid::parse_str(trimmed).map_err(|err| invalid(raw.to_string(), err.to_string()).into())
}
