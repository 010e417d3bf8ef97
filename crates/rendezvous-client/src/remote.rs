//! The backend seen from the client: request and response shapes plus the
//! [`Remote`] trait every transport implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rendezvous_shared::SwipeAction;
use rendezvous_store::{ChangeSet, Match};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub last_pulled_at: Option<i64>,
    /// Every chat id cached locally, so the server can report deletions.
    pub local_chat_ids: Vec<String>,
    pub local_match_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullResponse {
    #[serde(default)]
    pub changes: ChangeSet,
    /// Server time the changeset is complete up to, epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushRequest {
    pub changes: ChangeSet,
    pub last_pulled_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushResponse {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractRequest {
    pub target_user_id: String,
    pub action: SwipeAction,
    pub place_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InteractResponse {
    pub delivered: bool,
    pub is_match: bool,
    /// The match was created by this very interaction.
    pub instant_match: bool,
    #[serde(rename = "match")]
    pub matched: Option<Match>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageRequest {
    pub chat_id: String,
    pub content: String,
    pub temp_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageResponse {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One card of a place's discovery feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryCard {
    pub user_id: String,
    pub profile: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryResponse {
    pub profiles: Vec<DiscoveryCard>,
    /// Users known to have liked the local user.
    pub liker_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckpointResponse {
    pub last_pulled_at: Option<i64>,
}

/// Calls the client makes against the backend.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn pull(&self, req: &PullRequest) -> Result<PullResponse>;

    async fn push(&self, req: &PushRequest) -> Result<PushResponse>;

    /// Deliver one swipe.  Expected to be idempotent per target and action.
    async fn interact(&self, req: &InteractRequest) -> Result<InteractResponse>;

    async fn send_message(&self, req: &SendMessageRequest) -> Result<SendMessageResponse>;

    /// Raw profile JSON of `user_id`.
    async fn fetch_profile(&self, user_id: &str) -> Result<serde_json::Value>;

    async fn fetch_discovery(&self, place_id: &str) -> Result<DiscoveryResponse>;

    /// The server's record of where this user last pulled from, used when
    /// no local checkpoint exists.  `None` means a full pull.
    async fn server_checkpoint(&self) -> Result<Option<i64>>;
}
