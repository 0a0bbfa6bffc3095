//! Sync API Client - HTTP implementation of the Remote Gateway
//!
//! Sends queued mutations to the REST backend:
//! - Creates, updates and deletes per the table endpoint mapping
//! - Force overrides for CLIENT_WINS (`?force=true`)
//! - 409 bodies decoded into the server's current entity

use super::gateway::{
    request_path, GatewayError, GatewayResult, HttpMethod, RemoteGateway, WriteMode,
    FORCE_QUERY_PARAM,
};
use super::models::OfflineRecord;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

/// reqwest-backed gateway
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    /// Bearer token issued by the session layer
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpGateway {
    /// Create new API client
    pub fn new(base_url: &str, timeout: Duration) -> GatewayResult<Self> {
        // Trailing slash so relative joins keep the path prefix
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Set access token (after login)
    pub async fn set_token(&self, token: String) {
        *self.access_token.write().await = Some(token);
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        *self.access_token.write().await = None;
    }

    fn url_for(&self, record: &OfflineRecord, mode: WriteMode) -> GatewayResult<Url> {
        let mut url = self.base_url.join(&request_path(record)?)?;
        if mode == WriteMode::Force {
            url.query_pairs_mut().append_pair(FORCE_QUERY_PARAM, "true");
        }
        Ok(url)
    }

    async fn dispatch(
        &self,
        method: HttpMethod,
        record: &OfflineRecord,
        mode: WriteMode,
    ) -> GatewayResult<Value> {
        let url = self.url_for(record, mode)?;
        log::debug!("{} {} (record {})", method.as_str(), url, record.id);

        let request = match method {
            HttpMethod::Post => self.client.post(url).json(&record.data),
            HttpMethod::Put => self.client.put(url).json(&record.data),
            HttpMethod::Delete => self.client.delete(url),
        };

        let request = match self.access_token.read().await.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .header("X-Client-Record-Id", record.id.as_str())
            .send()
            .await?;

        handle_response(response).await
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn create(&self, record: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value> {
        self.dispatch(HttpMethod::Post, record, mode).await
    }

    async fn update(&self, record: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value> {
        self.dispatch(HttpMethod::Put, record, mode).await
    }

    async fn delete(&self, record: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value> {
        self.dispatch(HttpMethod::Delete, record, mode).await
    }
}

// ============================================================================
// Response Handling
// ============================================================================

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Handle a response; empty success bodies become `Value::Null`
async fn handle_response(response: reqwest::Response) -> GatewayResult<Value> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&body).map_err(|_| GatewayError::InvalidResponse);
    }

    if status == StatusCode::CONFLICT {
        return Err(GatewayError::Conflict {
            server_data: parse_conflict_body(&body),
        });
    }

    Err(GatewayError::Status {
        status: status.as_u16(),
        message: parse_error_message(status, &body),
    })
}

/// Server's current entity from a 409 body; `None` when it was deleted
fn parse_conflict_body(body: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(body).ok()?;

    let current = match value {
        Value::Object(mut map) => ["server_data", "serverData", "current"]
            .iter()
            .find_map(|key| map.remove(*key))
            .unwrap_or(Value::Object(map)),
        other => other,
    };

    (!current.is_null()).then_some(current)
}

fn parse_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string()
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
