//! In-process [`Remote`] and context builders for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use rendezvous_shared::{MatchStatus, MessageStatus, SyncStatus};
use rendezvous_store::{
    Chat, ChangeSet, KeyProvider, Match, MemoryCheckpointStore, MemorySecretStore, Message,
    StoreLocation, StoreProvider,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::remote::{
    DiscoveryResponse, InteractRequest, InteractResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, Remote, SendMessageRequest, SendMessageResponse,
};
use crate::state::AppContext;

pub const TEST_USER: &str = "me";

#[derive(Default)]
struct FakeState {
    offline: bool,

    pull: PullResponse,
    pull_delay: Option<Duration>,
    fail_pull: bool,
    pull_requests: Vec<PullRequest>,

    fail_push: bool,
    push_requests: Vec<PushRequest>,
    server_checkpoint: Option<i64>,

    interact_responses: HashMap<String, InteractResponse>,
    interact_failures: HashSet<String>,
    interact_requests: Vec<InteractRequest>,
    interact_delay: Option<Duration>,

    send_response: Option<String>,
    send_requests: Vec<SendMessageRequest>,

    profiles: HashMap<String, serde_json::Value>,
    profile_fetches: usize,
    discovery: HashMap<String, DiscoveryResponse>,
    discovery_fetches: usize,
}

/// Scriptable backend.  Unscripted calls succeed with empty bodies.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_online(state: &FakeState) -> Result<()> {
        if state.offline {
            Err(ClientError::api(503, "offline"))
        } else {
            Ok(())
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    // -- sync --

    pub fn set_pull(&self, changes: ChangeSet, timestamp: i64) {
        self.state().pull = PullResponse { changes, timestamp };
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        self.state().pull_delay = Some(delay);
    }

    pub fn fail_pull(&self, fail: bool) {
        self.state().fail_pull = fail;
    }

    pub fn fail_push(&self, fail: bool) {
        self.state().fail_push = fail;
    }

    pub fn set_server_checkpoint(&self, at: Option<i64>) {
        self.state().server_checkpoint = at;
    }

    pub fn pull_count(&self) -> usize {
        self.state().pull_requests.len()
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.state().pull_requests.clone()
    }

    pub fn push_count(&self) -> usize {
        self.state().push_requests.len()
    }

    // -- interactions --

    pub fn set_interact_response(&self, target: &str, resp: InteractResponse) {
        self.state()
            .interact_responses
            .insert(target.to_string(), resp);
    }

    pub fn fail_interact_for(&self, target: &str) {
        self.state().interact_failures.insert(target.to_string());
    }

    pub fn set_interact_delay(&self, delay: Duration) {
        self.state().interact_delay = Some(delay);
    }

    pub fn interact_requests(&self) -> Vec<InteractRequest> {
        self.state().interact_requests.clone()
    }

    // -- messages --

    /// Id the next successful send is assigned.
    pub fn set_send_response(&self, server_id: &str) {
        self.state().send_response = Some(server_id.to_string());
    }

    pub fn send_requests(&self) -> Vec<SendMessageRequest> {
        self.state().send_requests.clone()
    }

    // -- profiles and discovery --

    pub fn set_profile(&self, user_id: &str, profile: serde_json::Value) {
        self.state().profiles.insert(user_id.to_string(), profile);
    }

    pub fn profile_fetch_count(&self) -> usize {
        self.state().profile_fetches
    }

    pub fn set_discovery(&self, place_id: &str, resp: DiscoveryResponse) {
        self.state().discovery.insert(place_id.to_string(), resp);
    }

    pub fn discovery_fetch_count(&self) -> usize {
        self.state().discovery_fetches
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn pull(&self, req: &PullRequest) -> Result<PullResponse> {
        let delay = {
            let mut state = self.state();
            state.pull_requests.push(req.clone());
            Self::check_online(&state)?;
            if state.fail_pull {
                return Err(ClientError::api(500, "pull failed"));
            }
            state.pull_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state().pull.clone())
    }

    async fn push(&self, req: &PushRequest) -> Result<PushResponse> {
        let mut state = self.state();
        state.push_requests.push(req.clone());
        Self::check_online(&state)?;
        if state.fail_push {
            return Err(ClientError::api(503, "push failed"));
        }
        Ok(PushResponse {
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    async fn interact(&self, req: &InteractRequest) -> Result<InteractResponse> {
        let delay = {
            let mut state = self.state();
            state.interact_requests.push(req.clone());
            Self::check_online(&state)?;
            if state.interact_failures.contains(&req.target_user_id) {
                return Err(ClientError::api(502, "interaction failed"));
            }
            state.interact_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state()
            .interact_responses
            .get(&req.target_user_id)
            .cloned()
            .unwrap_or(InteractResponse {
                delivered: true,
                ..Default::default()
            }))
    }

    async fn send_message(&self, req: &SendMessageRequest) -> Result<SendMessageResponse> {
        let mut state = self.state();
        state.send_requests.push(req.clone());
        Self::check_online(&state)?;
        let id = state
            .send_response
            .take()
            .unwrap_or_else(|| format!("srv-{}", req.temp_id));
        Ok(SendMessageResponse {
            id,
            created_at: Utc::now(),
        })
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<serde_json::Value> {
        let mut state = self.state();
        state.profile_fetches += 1;
        Self::check_online(&state)?;
        state
            .profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| ClientError::api(404, "no such profile"))
    }

    async fn fetch_discovery(&self, place_id: &str) -> Result<DiscoveryResponse> {
        let mut state = self.state();
        state.discovery_fetches += 1;
        Self::check_online(&state)?;
        Ok(state.discovery.get(place_id).cloned().unwrap_or_default())
    }

    async fn server_checkpoint(&self) -> Result<Option<i64>> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state.server_checkpoint)
    }
}

/// Context over an in-memory store, signed in as [`TEST_USER`].
pub fn test_context(remote: Arc<FakeRemote>) -> Arc<AppContext> {
    let keys = KeyProvider::new(Arc::new(MemorySecretStore::new()));
    let provider = StoreProvider::new(
        StoreLocation::Memory,
        keys,
        Arc::new(MemoryCheckpointStore::new()),
    );
    Arc::new(AppContext::with_provider(
        ClientConfig::default(),
        provider,
        remote,
        TEST_USER,
    ))
}

pub fn sample_match(id: &str) -> Match {
    Match {
        id: id.into(),
        chat_id: None,
        user_a: TEST_USER.into(),
        user_b: "them".into(),
        status: MatchStatus::Active,
        matched_at: Utc::now(),
        unmatched_at: None,
        place_id: Some("place-1".into()),
        place_name: Some("Blue Bottle".into()),
        user_a_opened_at: None,
        user_b_opened_at: None,
        other_user_id: Some("them".into()),
        other_user_name: Some("Robin".into()),
        other_user_photo: None,
        match_origin: Some("mutual_like".into()),
        match_metadata: None,
        first_message_at: None,
        synced_at: None,
        sync_status: SyncStatus::Synced,
    }
}

pub fn sample_chat(id: &str) -> Chat {
    Chat {
        id: id.into(),
        match_id: format!("match-{id}"),
        created_at: Utc::now() - ChronoDuration::days(1),
        last_message_content: None,
        last_message_at: None,
        other_user_id: Some("them".into()),
        other_user_name: Some("Robin".into()),
        other_user_photo: None,
        place_id: None,
        place_name: None,
        unread_count: 0,
        synced_at: None,
        sync_status: SyncStatus::Synced,
    }
}

pub fn sample_message(id: &str, chat_id: &str, sender: &str) -> Message {
    Message {
        id: id.into(),
        chat_id: chat_id.into(),
        sender_id: sender.into(),
        content: format!("hello from {sender}"),
        created_at: Utc::now(),
        read_at: None,
        status: MessageStatus::Sent,
        temp_id: None,
        synced_at: None,
        sync_status: SyncStatus::Synced,
    }
}
