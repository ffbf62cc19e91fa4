//! Controller-specific error types.
//!
//! Every handler returns [`ControllerError`]; its `IntoResponse` impl picks the
//! HTTP status and renders `{"error": "..."}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use netpool::PoolError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

/// Errors that can occur in the Network Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Allocation or lifecycle failure
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Listener or server failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Pool(e) if e.is_exhausted() => StatusCode::CONFLICT,
            Self::Pool(PoolError::AddressNotAllocated(_) | PoolError::AddressAlreadyAllocated(_)) => {
                StatusCode::CONFLICT
            }
            Self::Pool(PoolError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Pool(PoolError::InvalidAddress(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(err = %self, "Request failed");
        } else {
            debug!(err = %self, status = status.as_u16(), "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
