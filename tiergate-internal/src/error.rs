use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use std::fmt::Display;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Store hiccups are worth another attempt; everything else fails immediately.
    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    ApiKeyMissing,
    Config {
        message: String,
    },
    InternalError {
        message: String,
    },
    InternalTokenInvalid,
    InvalidRequest {
        message: String,
    },
    KeyDirectoryUnavailable {
        message: String,
    },
    Observability {
        message: String,
    },
    PolicyCatalog {
        message: String,
    },
    PrincipalMissing {
        message: String,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Serialization {
        message: String,
    },
    StoreTimeout {
        operation: String,
        timeout_ms: u64,
    },
    StoreUnavailable {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::ApiKeyMissing => tracing::Level::DEBUG,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalTokenInvalid => tracing::Level::WARN,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::KeyDirectoryUnavailable { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::PolicyCatalog { .. } => tracing::Level::ERROR,
            ErrorDetails::PrincipalMissing { .. } => tracing::Level::WARN,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            // Individual attempts are noisy; the enforcers log at ERROR once retries are exhausted
            ErrorDetails::StoreTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::ApiKeyMissing => StatusCode::UNAUTHORIZED,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalTokenInvalid => StatusCode::UNAUTHORIZED,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::KeyDirectoryUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PolicyCatalog { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PrincipalMissing { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorDetails::StoreTimeout { .. } | ErrorDetails::StoreUnavailable { .. }
        )
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }

    fn to_response_json(&self) -> (StatusCode, Value) {
        (self.status_code(), json!({"error": self.to_string()}))
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::ApiKeyMissing => {
                write!(
                    f,
                    "API key missing: pass it as `Authorization: Bearer <key>` or `x-api-key`"
                )
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InternalTokenInvalid => {
                write!(f, "Missing or invalid `x-tiergate-internal-token` header")
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "Invalid request: {message}"),
            ErrorDetails::KeyDirectoryUnavailable { message } => {
                write!(f, "API key directory unavailable: {message}")
            }
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::PolicyCatalog { message } => {
                write!(f, "Invalid policy catalog: {message}")
            }
            ErrorDetails::PrincipalMissing { message } => {
                write!(f, "Principal missing: {message}")
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::StoreTimeout {
                operation,
                timeout_ms,
            } => {
                write!(
                    f,
                    "Usage store `{operation}` timed out after {timeout_ms}ms"
                )
            }
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Usage store unavailable: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        let (status_code, body) = self.0.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
