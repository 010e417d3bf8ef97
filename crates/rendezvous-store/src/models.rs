//! Domain model structs mirrored in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize`: `Match`, `Chat` and
//! `Message` double as the row shapes of the sync changesets, the others are
//! handed to the UI layer as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rendezvous_shared::{MatchStatus, MessageStatus, SwipeAction, SyncStatus};

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Cached copy of a user's public profile.  One row per observed user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: String,
    pub user_id: String,
    /// Opaque JSON as returned by the backend.  Use [`Profile::data`] for typed access.
    pub raw_data: String,
    /// Never moves backwards; upserts keep the later of the two values.
    pub last_fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn data(&self) -> Result<ProfileData, serde_json::Error> {
        serde_json::from_str(&self.raw_data)
    }
}

/// Typed view over a profile blob.  Unknown keys survive in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProfileData {
    pub display_name: Option<String>,
    pub age: Option<u32>,
    pub bio: Option<String>,
    pub photos: Vec<String>,
    pub interests: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// A card in the discovery feed of a place.  Short-lived: removed on swipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryProfile {
    pub id: String,
    pub user_id: String,
    pub raw_data: String,
    pub place_id: String,
    pub last_fetched_at: DateTime<Utc>,
    pub is_dismissed: bool,
    pub created_at: DateTime<Utc>,
}

impl DiscoveryProfile {
    pub fn data(&self) -> Result<ProfileData, serde_json::Error> {
        serde_json::from_str(&self.raw_data)
    }
}

// ---------------------------------------------------------------------------
// Swipe queue
// ---------------------------------------------------------------------------

/// A swipe recorded locally and not yet confirmed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwipeQueueEntry {
    pub id: String,
    pub target_user_id: String,
    pub action: SwipeAction,
    pub place_id: String,
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Failed flush attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// A user known to have liked the local user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Liker {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Match
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    pub id: String,
    pub chat_id: Option<String>,
    pub user_a: String,
    pub user_b: String,
    pub status: MatchStatus,
    pub matched_at: DateTime<Utc>,
    pub unmatched_at: Option<DateTime<Utc>>,
    pub place_id: Option<String>,
    pub place_name: Option<String>,
    pub user_a_opened_at: Option<DateTime<Utc>>,
    pub user_b_opened_at: Option<DateTime<Utc>>,
    pub other_user_id: Option<String>,
    pub other_user_name: Option<String>,
    pub other_user_photo: Option<String>,
    pub match_origin: Option<String>,
    pub match_metadata: Option<serde_json::Value>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub sync_status: SyncStatus,
}

impl Match {
    /// The participant that is not `user_id`.
    pub fn other_participant(&self, user_id: &str) -> &str {
        if self.user_a == user_id {
            &self.user_b
        } else {
            &self.user_a
        }
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: String,
    pub match_id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_content: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub other_user_id: Option<String>,
    pub other_user_name: Option<String>,
    pub other_user_photo: Option<String>,
    pub place_id: Option<String>,
    pub place_name: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub sync_status: SyncStatus,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    /// Client-generated id, kept after the server assigns the real one.
    pub temp_id: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub sync_status: SyncStatus,
}
