//! Structured error responses
//!
//! Every error body has the same shape:
//!
//! ```json
//! { "error": { "kind": "CAPABILITY_NOT_FOUND", "message": "..." } }
//! ```

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::loader::LoadError;
use crate::registry::{InvocationError, RegistryError};

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    kind: &'a str,
    message: String,
}

pub(crate) fn error_response(status: StatusCode, kind: &str, message: String) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail { kind, message },
        }),
    )
        .into_response()
}

/// Errors returned by the data plane
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("capability '{0}' not found")]
    CapabilityNotFound(String),

    #[error("capability '{0}' has no active plugin")]
    CapabilityInactive(String),

    #[error("invocation timed out after {}ms", .0.as_millis())]
    InvocationTimeout(Duration),

    #[error("{0}")]
    InvocationFailed(String),

    #[error("plugin was unloaded while the invocation was in flight")]
    AbortedDuringUnload,

    #[error("{0}")]
    InvalidRequest(String),
}

impl RoutingError {
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingError::CapabilityNotFound(_) => "CAPABILITY_NOT_FOUND",
            RoutingError::CapabilityInactive(_) => "CAPABILITY_INACTIVE",
            RoutingError::InvocationTimeout(_) => "INVOCATION_TIMEOUT",
            RoutingError::InvocationFailed(_) => "INVOCATION_FAILED",
            RoutingError::AbortedDuringUnload => "ABORTED_DURING_UNLOAD",
            RoutingError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RoutingError::CapabilityNotFound(_) => StatusCode::NOT_FOUND,
            RoutingError::CapabilityInactive(_) => StatusCode::CONFLICT,
            RoutingError::InvocationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RoutingError::InvocationFailed(_) => StatusCode::BAD_GATEWAY,
            RoutingError::AbortedDuringUnload => StatusCode::SERVICE_UNAVAILABLE,
            RoutingError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<RegistryError> for RoutingError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapabilityNotFound(capability) => {
                RoutingError::CapabilityNotFound(capability)
            }
            RegistryError::CapabilityInactive(capability) => {
                RoutingError::CapabilityInactive(capability)
            }
            other => RoutingError::InvocationFailed(other.to_string()),
        }
    }
}

impl From<InvocationError> for RoutingError {
    fn from(err: InvocationError) -> Self {
        match err {
            InvocationError::Timeout(after) => RoutingError::InvocationTimeout(after),
            InvocationError::Failed { message, .. } => RoutingError::InvocationFailed(message),
            InvocationError::AbortedDuringUnload => RoutingError::AbortedDuringUnload,
        }
    }
}

impl IntoResponse for RoutingError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.kind(), self.to_string())
    }
}

/// Errors returned by the control plane
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    BadRequest(String),
}

impl ControlError {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Registry(e) => e.kind(),
            ControlError::BadRequest(_) => "INVALID_REQUEST",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ControlError::Registry(e) => match e {
                RegistryError::NotFound(_) | RegistryError::CapabilityNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                RegistryError::AlreadyActive { .. }
                | RegistryError::InvalidTransition { .. }
                | RegistryError::CapabilityInactive(_) => StatusCode::CONFLICT,
                RegistryError::Load(load) => match load {
                    LoadError::CapabilityConflict(_) => StatusCode::CONFLICT,
                    LoadError::MalformedArchive { .. } | LoadError::MissingManifest(_) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    LoadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                },
            },
        }
    }
}

impl From<LoadError> for ControlError {
    fn from(err: LoadError) -> Self {
        ControlError::Registry(err.into())
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_statuses() {
        let cases = [
            (RoutingError::CapabilityNotFound("x".into()), 404),
            (RoutingError::CapabilityInactive("x".into()), 409),
            (RoutingError::InvocationTimeout(Duration::from_millis(5)), 504),
            (RoutingError::InvocationFailed("boom".into()), 502),
            (RoutingError::AbortedDuringUnload, 503),
        ];
        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{}", err.kind());
        }
    }

    #[test]
    fn test_aborted_invocation_keeps_its_kind() {
        let err: RoutingError = InvocationError::AbortedDuringUnload.into();
        assert_eq!(err.kind(), "ABORTED_DURING_UNLOAD");
    }

    #[test]
    fn test_load_errors_are_unprocessable() {
        let err: ControlError = LoadError::MissingManifest("a.zip".into()).into();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.kind(), "MISSING_MANIFEST");
    }
}
