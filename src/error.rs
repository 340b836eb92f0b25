use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Hardware initialization failed: {0}")]
    HardwareInit(String),
    #[error("Invalid switch index: {index} (expected 1..={max})")]
    InvalidSwitchIndex { index: usize, max: usize },
    #[error("Unauthorized: API rejected the access token")]
    Unauthorized,
    #[error("API request failed{}: {message}", status_suffix(.status))]
    ApiRequestFailed {
        status: Option<u16>,
        message: String,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("Store error: {0}")]
    Store(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

impl AppError {
    pub fn api_status(status: u16, message: impl Into<String>) -> Self {
        if status == 401 {
            AppError::Unauthorized
        } else {
            AppError::ApiRequestFailed {
                status: Some(status),
                message: message.into(),
            }
        }
    }

    pub fn api_transport(message: impl Into<String>) -> Self {
        AppError::ApiRequestFailed {
            status: None,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Store(e.to_string())
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidSwitchIndex { .. } | AppError::ApiRequestFailed { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::HardwareInit(_)
            | AppError::Config(_)
            | AppError::Gpio(_)
            | AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
