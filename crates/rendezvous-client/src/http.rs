//! [`Remote`] over HTTPS with JSON bodies and bearer authentication.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::remote::{
    CheckpointResponse, DiscoveryResponse, InteractRequest, InteractResponse, PullRequest,
    PullResponse, PushRequest, PushResponse, Remote, SendMessageRequest, SendMessageResponse,
};

const MAX_LOG_BODY_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    code: String,
    message: String,
}

pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let url = config
            .api_url
            .as_deref()
            .ok_or_else(|| ClientError::NotConfigured("RENDEZVOUS_API_URL is not set".into()))?;
        Self::new(url, config.api_token.clone(), config.http_timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let token = self
            .token
            .as_deref()
            .ok_or_else(|| ClientError::Auth("No access token configured".into()))?;
        let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ClientError::Auth("Invalid access token format".into()))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .headers(self.headers()?)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn post<B: serde::Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        tracing::debug!(status = status.as_u16(), body = %truncate(&body), "API response");

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(ClientError::api(
                    status.as_u16(),
                    format!("{}: {}", error.code, error.message),
                ));
            }
            return Err(ClientError::api(
                status.as_u16(),
                format!("Request failed: {}", truncate(&body)),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            tracing::error!(error = %e, body = %truncate(&body), "Failed to deserialize response");
            ClientError::api(status.as_u16(), format!("Failed to parse response: {e}"))
        })
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_LOG_BODY_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[async_trait]
impl Remote for HttpRemote {
    /// POST /api/v1/sync/pull
    async fn pull(&self, req: &PullRequest) -> Result<PullResponse> {
        self.post("/api/v1/sync/pull", req).await
    }

    /// POST /api/v1/sync/push
    async fn push(&self, req: &PushRequest) -> Result<PushResponse> {
        self.post("/api/v1/sync/push", req).await
    }

    /// POST /api/v1/interactions
    async fn interact(&self, req: &InteractRequest) -> Result<InteractResponse> {
        self.post("/api/v1/interactions", req).await
    }

    /// POST /api/v1/chats/{chat_id}/messages
    async fn send_message(&self, req: &SendMessageRequest) -> Result<SendMessageResponse> {
        let path = format!("/api/v1/chats/{}/messages", urlencoding::encode(&req.chat_id));
        self.post(&path, req).await
    }

    /// GET /api/v1/profiles/{user_id}
    async fn fetch_profile(&self, user_id: &str) -> Result<serde_json::Value> {
        self.get(&format!("/api/v1/profiles/{}", urlencoding::encode(user_id)))
            .await
    }

    /// GET /api/v1/places/{place_id}/discovery
    async fn fetch_discovery(&self, place_id: &str) -> Result<DiscoveryResponse> {
        self.get(&format!("/api/v1/places/{}/discovery", urlencoding::encode(place_id)))
            .await
    }

    /// GET /api/v1/sync/checkpoint
    async fn server_checkpoint(&self) -> Result<Option<i64>> {
        let resp: CheckpointResponse = self.get("/api/v1/sync/checkpoint").await?;
        Ok(resp.last_pulled_at)
    }
}
