use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use folio_api_types::ErrorResponse;
use thiserror::Error;

use crate::{
    application::convert::{ConvertError, ConvertErrorKind},
    config::LoadError,
    infra::error::InfraError,
};

pub const MSG_INVALID_INPUT: &str = "invalid input";
pub const MSG_INVALID_RESOURCE_PATH: &str = "invalid resource path";
pub const MSG_TOO_MANY_RESOURCES: &str = "too many resources";
pub const MSG_CONVERSION_FAILED: &str = "error converting markdown";
pub const MSG_INTERNAL: &str = "internal server error";
pub const MSG_NOT_FOUND: &str = "page not found";
pub const MSG_PAYLOAD_TOO_LARGE: &str = "request body too large";

/// Diagnostic detail attached to an error response. Never sent to the
/// client; consumed by the response logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// JSON error response with a fixed public message and a private report.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn public_message(&self) -> &'static str {
        self.public_message
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.public_message.to_string(),
        };
        let mut response = (self.status, Json(body)).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<ConvertError> for HttpError {
    fn from(error: ConvertError) -> Self {
        const SOURCE: &str = "application::convert";
        let (status, public_message) = match error.kind() {
            ConvertErrorKind::Validation => (StatusCode::BAD_REQUEST, MSG_INVALID_INPUT),
            ConvertErrorKind::PathTraversal => {
                (StatusCode::BAD_REQUEST, MSG_INVALID_RESOURCE_PATH)
            }
            ConvertErrorKind::TooManyResources => {
                (StatusCode::BAD_REQUEST, MSG_TOO_MANY_RESOURCES)
            }
            ConvertErrorKind::Workspace | ConvertErrorKind::Execution => {
                (StatusCode::INTERNAL_SERVER_ERROR, MSG_CONVERSION_FAILED)
            }
        };

        let mut http = HttpError::from_error(SOURCE, status, public_message, &error);
        if let ConvertError::Execution { stderr, .. } = &error {
            let stderr = stderr.trim();
            if !stderr.is_empty() {
                http.report = http.report.with_message(format!("stderr: {stderr}"));
            }
        }
        http
    }
}

/// Top-level failure of the server binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
}
