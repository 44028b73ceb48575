//! Error taxonomy shared by every subsystem.
//!
//! Each variant maps to a stable wire code and an HTTP status; handlers return
//! `Result<T>` and the axum layer renders `{code, message}` bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Validation(String),

    #[error("ML runtime unavailable: {0}")]
    MlUnavailable(String),

    #[error("embedding failed: {0}")]
    EmbedFailed(String),

    #[error("rerank failed: {0}")]
    RerankFailed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("all retrievers failed: {0}")]
    RetrievalFailed(String),

    #[error("partial failure: {succeeded} succeeded, {failed} failed")]
    Partial { succeeded: usize, failed: usize, detail: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("model exporter not available")]
    ExporterMissing,

    #[error("event bus is closed")]
    BusClosed,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable wire code for the `{code, message}` error body.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Validation(_) => "validation",
            Error::MlUnavailable(_) => "ml_unavailable",
            Error::EmbedFailed(_) => "embed_failed",
            Error::RerankFailed(_) => "rerank_failed",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::RetrievalFailed(_) => "retrieval_failed",
            Error::Partial { .. } => "partial_failure",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Cancelled => "cancelled",
            Error::ExporterMissing => "exporter_missing",
            Error::BusClosed => "bus_closed",
            Error::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::MlUnavailable(_) | Error::BackendUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Error::Partial { .. } => StatusCode::MULTI_STATUS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        Error::Internal(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "code": self.kind(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Fan-out aggregation
// ---------------------------------------------------------------------------

/// Aggregate outcome of a fan-out operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Partial,
    Fail,
}

/// Fold per-task results into an aggregate outcome: all ok → `Ok`,
/// all failed → `Fail`, anything in between → `Partial`.
pub fn aggregate<T, E>(results: &[std::result::Result<T, E>]) -> Outcome {
    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed == 0 {
        Outcome::Ok
    } else if failed == results.len() {
        Outcome::Fail
    } else {
        Outcome::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::NotFound("store".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::AlreadyExists("s1".into()).status(), StatusCode::CONFLICT);
        assert_eq!(Error::MlUnavailable("stub".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(Error::DeadlineExceeded.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(Error::Internal("boom".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(Error::RetrievalFailed("all down".into()).kind(), "retrieval_failed");
        assert_eq!(
            Error::Partial { succeeded: 1, failed: 1, detail: String::new() }.kind(),
            "partial_failure"
        );
    }

    #[test]
    fn test_aggregate_outcomes() {
        let ok: Vec<Result<(), Error>> = vec![Ok(()), Ok(())];
        assert_eq!(aggregate(&ok), Outcome::Ok);

        let partial: Vec<Result<(), Error>> = vec![Ok(()), Err(Error::Internal("x".into()))];
        assert_eq!(aggregate(&partial), Outcome::Partial);

        let fail: Vec<Result<(), Error>> = vec![Err(Error::Internal("x".into()))];
        assert_eq!(aggregate(&fail), Outcome::Fail);
    }
}
