use log::{info, warn};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::ApiConfig;
use crate::error::AppError;

const FETCH_USERS_TIMEOUT: Duration = Duration::from_secs(30);
const SWITCH_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLocation {
    pub id: String,
    pub name: String,
    pub number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUser {
    pub id: String,
    pub access_token: String,
    pub location: UserLocation,
    #[serde(default)]
    pub pin: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub users: Vec<ApiUser>,
}

/// Body posted to the queue endpoint for one switch activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchEvent {
    pub status: String,
    pub branch_id: String,
    pub is_multi_service: bool,
    pub location: UserLocation,
}

impl SwitchEvent {
    pub fn calling(branch_id: impl Into<String>, location: UserLocation) -> Self {
        Self {
            status: "calling".to_string(),
            branch_id: branch_id.into(),
            is_multi_service: false,
            location,
        }
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn fetch_users(&self) -> Result<ApiResponse, AppError>;
    /// Returns the response's `data` member when present, otherwise the whole body.
    async fn send_switch_event(
        &self,
        event: &SwitchEvent,
        access_token: &str,
    ) -> Result<Value, AppError>;
}

struct RawResponse {
    status: u16,
    body: String,
}

pub struct HttpRemoteApi {
    config: ApiConfig,
    agent: ureq::Agent,
}

impl HttpRemoteApi {
    pub fn new(config: ApiConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(FETCH_USERS_TIMEOUT)
            .build();
        Self { config, agent }
    }

    /// Runs the blocking request on tokio's blocking pool. Only transport
    /// failures are errors here; every HTTP status comes back as a response.
    async fn post_json(
        &self,
        url: String,
        body: Value,
        bearer: Option<String>,
        timeout: Duration,
    ) -> Result<RawResponse, AppError> {
        let agent = self.agent.clone();
        let user_agent = self.config.user_agent();

        tokio::task::spawn_blocking(move || {
            let mut request = agent
                .post(&url)
                .timeout(timeout)
                .set("Content-Type", "application/json")
                .set("User-Agent", &user_agent);
            if let Some(token) = bearer {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }

            let response = match request.send_json(body) {
                Ok(resp) => resp,
                Err(ureq::Error::Status(_, resp)) => resp,
                Err(ureq::Error::Transport(t)) => {
                    return Err(AppError::api_transport(format!("POST {url}: {t}")));
                }
            };
            let status = response.status();
            let body = response
                .into_string()
                .map_err(|e| AppError::api_transport(format!("read body of {url}: {e}")))?;
            Ok(RawResponse { status, body })
        })
        .await
        .map_err(|e| AppError::api_transport(format!("request task failed: {e}")))?
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn fetch_users(&self) -> Result<ApiResponse, AppError> {
        info!("Fetching users");
        let response = self
            .post_json(
                self.config.users_url(),
                json!({ "branchId": self.config.device_id }),
                None,
                FETCH_USERS_TIMEOUT,
            )
            .await?;

        if response.status != 201 {
            return Err(AppError::ApiRequestFailed {
                status: Some(response.status),
                message: format!("fetch users returned status {}", response.status),
            });
        }

        let users: ApiResponse =
            serde_json::from_str(&response.body).map_err(|e| AppError::ApiRequestFailed {
                status: None,
                message: format!("malformed users payload: {e}"),
            })?;
        info!("Fetched {} users from API", users.users.len());
        Ok(users)
    }

    async fn send_switch_event(
        &self,
        event: &SwitchEvent,
        access_token: &str,
    ) -> Result<Value, AppError> {
        let body = serde_json::to_value(event)
            .map_err(|e| AppError::api_transport(format!("encode switch event: {e}")))?;
        let response = self
            .post_json(
                self.config.event_url(),
                body,
                Some(access_token.to_string()),
                SWITCH_EVENT_TIMEOUT,
            )
            .await?;

        if !matches!(response.status, 200 | 201) {
            warn!("API responded with status {}", response.status);
            return Err(AppError::api_status(response.status, response.body));
        }

        let mut value = if response.body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&response.body).unwrap_or(Value::String(response.body))
        };
        Ok(match value.get_mut("data") {
            Some(data) => data.take(),
            None => value,
        })
    }
}
