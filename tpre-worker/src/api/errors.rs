//! This module defines the [`Error`] the worker endpoints may produce and
//! its mapping onto HTTP statuses and structured error bodies.

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tpre_types::api::{ErrorBody, error_codes};
use tpre_types::wire::WireError;
use tpre_types::{Domain, Hrac};

use crate::services::kfrag_store::KfragStoreError;

/// All errors that may occur while serving a worker endpoint.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("wrong domain: expected {expected}, got {got}")]
    WrongDomain { expected: Domain, got: Domain },
    #[error("unsupported version {got}, accepted {expected}")]
    ProtocolMismatch {
        expected: semver::VersionReq,
        got: semver::Version,
    },
    #[error("retriever does not match policy {0}")]
    UnknownPolicy(Hrac),
    #[error("policy {0} expired")]
    PolicyExpired(Hrac),
    #[error("condition not met: {0}")]
    ConditionNotMet(String),
    #[error("no key fragment held for policy {0}")]
    KfragNotHeld(Hrac),
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),
    #[error("inflight capacity exhausted")]
    Overloaded,
    #[error("rate limit reached for policy {0}")]
    RateLimited(Hrac),
    #[error("conflicting enactment for policy {0}")]
    EnactmentConflict(Hrac),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<WireError> for Error {
    fn from(value: WireError) -> Self {
        match value {
            WireError::MissingSignature | WireError::InvalidSignature => {
                Self::InvalidSignature(value.to_string())
            }
            other => Self::BadRequest(other.to_string()),
        }
    }
}

impl From<KfragStoreError> for Error {
    fn from(value: KfragStoreError) -> Self {
        match value {
            KfragStoreError::NotHeld(hrac) => Self::KfragNotHeld(hrac),
            KfragStoreError::Conflict(hrac) => Self::EnactmentConflict(hrac),
        }
    }
}

impl Error {
    fn parts(&self) -> (StatusCode, &'static str, bool, Option<u64>) {
        match self {
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, error_codes::BAD_REQUEST, false, None),
            Error::InvalidSignature(_) => (
                StatusCode::UNAUTHORIZED,
                error_codes::INVALID_SIGNATURE,
                false,
                None,
            ),
            Error::WrongDomain { .. } => {
                (StatusCode::FORBIDDEN, error_codes::WRONG_DOMAIN, false, None)
            }
            Error::ProtocolMismatch { .. } => (
                StatusCode::BAD_REQUEST,
                error_codes::PROTOCOL_MISMATCH,
                false,
                None,
            ),
            Error::UnknownPolicy(_) => {
                (StatusCode::NOT_FOUND, error_codes::UNKNOWN_POLICY, false, None)
            }
            Error::PolicyExpired(_) => {
                (StatusCode::FORBIDDEN, error_codes::POLICY_EXPIRED, false, None)
            }
            Error::ConditionNotMet(_) => (
                StatusCode::FORBIDDEN,
                error_codes::CONDITION_NOT_MET,
                false,
                None,
            ),
            Error::KfragNotHeld(_) => {
                (StatusCode::NOT_FOUND, error_codes::KFRAG_NOT_HELD, false, None)
            }
            Error::TemporarilyUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                error_codes::TEMPORARILY_UNAVAILABLE,
                true,
                None,
            ),
            Error::Overloaded => (
                StatusCode::TOO_MANY_REQUESTS,
                error_codes::RETRY_LATER,
                true,
                Some(500),
            ),
            Error::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                error_codes::RATE_LIMITED,
                true,
                Some(1000),
            ),
            Error::EnactmentConflict(_) => (
                StatusCode::CONFLICT,
                error_codes::ENACTMENT_CONFLICT,
                false,
                None,
            ),
            Error::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::BAD_REQUEST,
                true,
                None,
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::debug!("{self:?}");
        let (status, code, retriable, retry_after_ms) = self.parts();
        let body = ErrorBody {
            code: code.to_owned(),
            message: self.to_string(),
            retriable,
            retry_after_ms,
        };
        (status, Json(body)).into_response()
    }
}
