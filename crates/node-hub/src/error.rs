use axum::http::StatusCode;
use sqlx::Error as SqlxError;
use tracing::error;

use crate::registry::DispatchError;
use crate::updates::{BatchRequestError, UpdateError};

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

const DB_UNAVAILABLE_MESSAGE: &str = "database temporarily unavailable";

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn conflict(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
    }

    pub fn internal(msg: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }
}

fn map_anyhow_error(err: &anyhow::Error) -> Option<AppError> {
    let sqlx_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())?;
    match sqlx_err {
        SqlxError::RowNotFound => Some(AppError::not_found("resource not found")),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE))
        }
        SqlxError::Database(db_err) => {
            let message = db_err.message().to_ascii_lowercase();
            if message.contains("database is locked") || message.contains("database is busy") {
                Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE))
            } else {
                None
            }
        }
        _ => None,
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(mapped) = map_anyhow_error(&err) {
            if mapped.status.is_server_error() {
                crate::telemetry::record_internal_error_metrics(&err);
                error!(?err, "internal error");
            }
            return mapped;
        }

        crate::telemetry::record_internal_error_metrics(&err);
        error!(?err, "internal error");
        AppError::internal("internal server error")
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotConnected => {
                AppError::conflict("node_not_connected", "node is not connected")
            }
            DispatchError::QueueFull => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "node_overloaded",
                "node outbound queue is full; retry later",
            ),
            DispatchError::Encode(err) => AppError::from(anyhow::Error::new(err)),
        }
    }
}

impl From<UpdateError> for AppError {
    fn from(err: UpdateError) -> Self {
        let message = err.to_string();
        match err {
            UpdateError::NodeNotFound(_) => AppError::not_found(message),
            UpdateError::NodeOffline => AppError::conflict("node_offline", message),
            UpdateError::UnknownPlatform => AppError::conflict("platform_unknown", message),
            UpdateError::AlreadyUpToDate { .. } => {
                AppError::conflict("already_up_to_date", message)
            }
            UpdateError::NoDownload { .. } => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_download_available",
                message,
            ),
            UpdateError::ReleaseUnavailable(_) => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "release_unavailable",
                message,
            ),
            UpdateError::Dispatch(err) => AppError::from(err),
            UpdateError::Repository(err) => AppError::from(err),
        }
    }
}

impl From<BatchRequestError> for AppError {
    fn from(err: BatchRequestError) -> Self {
        match err {
            BatchRequestError::Repository(err) => AppError::from(err),
            other => AppError::bad_request(other.to_string()),
        }
    }
}
