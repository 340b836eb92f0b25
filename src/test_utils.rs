//! Fakes shared by the unit tests.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::api::{ApiResponse, ApiUser, RemoteApi, SwitchEvent, UserLocation};
use crate::error::AppError;

pub fn api_user(id: &str, token: &str, number: i64) -> ApiUser {
    ApiUser {
        id: id.to_string(),
        access_token: token.to_string(),
        location: UserLocation {
            id: format!("loc-{id}"),
            name: format!("Counter {number}"),
            number,
        },
        pin: None,
    }
}

#[derive(Debug, Clone)]
pub enum SendBehavior {
    Accept(Value),
    Reject(u16),
}

pub struct FakeApi {
    users: Mutex<Result<Vec<ApiUser>, (Option<u16>, String)>>,
    send: Mutex<SendBehavior>,
    send_delay: Mutex<Duration>,
    sent: Mutex<Vec<(SwitchEvent, String)>>,
}

impl FakeApi {
    pub fn with_users(users: Vec<ApiUser>) -> Self {
        Self {
            users: Mutex::new(Ok(users)),
            send: Mutex::new(SendBehavior::Accept(json!({ "queued": true }))),
            send_delay: Mutex::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_fetch(err: AppError) -> Self {
        let api = Self::with_users(Vec::new());
        let failure = match err {
            AppError::ApiRequestFailed { status, message } => (status, message),
            other => (None, other.to_string()),
        };
        *api.users.lock() = Err(failure);
        api
    }

    pub fn set_users(&self, users: Vec<ApiUser>) {
        *self.users.lock() = Ok(users);
    }

    pub fn set_send(&self, behavior: SendBehavior) {
        *self.send.lock() = behavior;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = delay;
    }

    pub fn sent(&self) -> Vec<(SwitchEvent, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn fetch_users(&self) -> Result<ApiResponse, AppError> {
        match &*self.users.lock() {
            Ok(users) => Ok(ApiResponse {
                users: users.clone(),
            }),
            Err((status, message)) => Err(AppError::ApiRequestFailed {
                status: *status,
                message: message.clone(),
            }),
        }
    }

    async fn send_switch_event(
        &self,
        event: &SwitchEvent,
        access_token: &str,
    ) -> Result<Value, AppError> {
        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.sent
            .lock()
            .push((event.clone(), access_token.to_string()));

        let behavior = self.send.lock().clone();
        match behavior {
            SendBehavior::Accept(value) => Ok(value),
            SendBehavior::Reject(status) => Err(AppError::api_status(status, "rejected")),
        }
    }
}
