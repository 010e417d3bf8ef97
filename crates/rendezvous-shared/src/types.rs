use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a persisted enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

// Every enum below is stored as lowercase text and serialized the same way
// on the wire, so one macro keeps both representations in lockstep.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// What the local user did to a discovery card.
    SwipeAction, "swipe action" {
        Like => "like",
        Dislike => "dislike",
    }
);

text_enum!(
    /// Match lifecycle. `Unmatched` is terminal.
    MatchStatus, "match status" {
        Active => "active",
        Unmatched => "unmatched",
    }
);

text_enum!(
    /// Delivery state of a chat message.
    MessageStatus, "message status" {
        Pending => "pending",
        Sent => "sent",
        Delivered => "delivered",
        Read => "read",
        Failed => "failed",
    }
);

text_enum!(
    /// Local change tracking for rows that are pushed back to the server.
    SyncStatus, "sync status" {
        Synced => "synced",
        Created => "created",
        Updated => "updated",
        Deleted => "deleted",
    }
);

impl MatchStatus {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: MatchStatus) -> bool {
        !matches!((self, next), (MatchStatus::Unmatched, MatchStatus::Active))
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Synced
    }
}

impl SyncStatus {
    /// Rows in any state other than `Synced` carry unpushed local changes.
    pub fn is_pending(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}
