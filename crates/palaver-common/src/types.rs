use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform user id of a turn's speaker. `-1` marks a system/narration turn.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(i64);

/// Platform message id of a turn. `-1` marks an ephemeral turn that has no
/// addressable platform message (e.g. transcribed speech).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

macro_rules! impl_id_type {
    ($t:ty) => {
        impl $t {
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> i64 {
                self.0
            }

            /// True for the reserved `-1` value.
            pub const fn is_sentinel(self) -> bool {
                self.0 == -1
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $t {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

impl_id_type!(AuthorId);
impl_id_type!(MessageId);

impl AuthorId {
    /// Speaker-less system/narration turns.
    pub const SYSTEM: AuthorId = AuthorId(-1);

    pub const fn is_system(self) -> bool {
        self.is_sentinel()
    }
}

impl MessageId {
    /// Turns that exist in history but not as a platform message.
    pub const EPHEMERAL: MessageId = MessageId(-1);

    pub const fn is_ephemeral(self) -> bool {
        self.is_sentinel()
    }
}
