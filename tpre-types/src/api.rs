//! API contracts between clients and workers.
//!
//! Besides the versioned DTOs in [`v1`], this module defines the
//! protocol-version header every caller must present, the opaque condition
//! type with its integrator-supplied evaluator trait, and the error-code
//! constants workers put into structured error bodies.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderName;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use umbral_pre::PublicKey;

use crate::{Hrac, Timestamp};

pub mod v1;
pub use v1::*;

/// Header clients send to workers to announce their software version.
///
/// Workers gate requests with a `semver::VersionReq`; a missing or
/// unparsable header is rejected before any payload is read.
pub static PROTOCOL_VERSION_HEADER: HeaderName = HeaderName::from_static("x-tpre-protocol-version");

/// String codes carried in structured error bodies.
pub mod error_codes {
    /// A signature (envelope or embedded) did not verify.
    pub const INVALID_SIGNATURE: &str = "invalid_signature";
    /// The caller and the worker are on different domains.
    pub const WRONG_DOMAIN: &str = "wrong_domain";
    /// The caller's software version is outside the accepted range.
    pub const PROTOCOL_MISMATCH: &str = "protocol_mismatch";
    /// The worker has never seen this policy.
    pub const UNKNOWN_POLICY: &str = "unknown_policy";
    /// The policy's validity window has passed.
    pub const POLICY_EXPIRED: &str = "policy_expired";
    /// A request condition evaluated to false.
    pub const CONDITION_NOT_MET: &str = "condition_not_met";
    /// The worker holds no kfrag for this policy.
    pub const KFRAG_NOT_HELD: &str = "kfrag_not_held";
    /// The worker cannot currently serve the request (oracle too stale).
    pub const TEMPORARILY_UNAVAILABLE: &str = "temporarily_unavailable";
    /// Capacity exhausted; retry with backoff.
    pub const RETRY_LATER: &str = "retry_later";
    /// Per-policy rate limit reached.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// Malformed frame or payload.
    pub const BAD_REQUEST: &str = "bad_request";
    /// A different kfrag is already enacted for this policy.
    pub const ENACTMENT_CONFLICT: &str = "enactment_conflict";
}

/// Structured error body returned by worker endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// One of the [`error_codes`] constants.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
    /// Whether retrying later is sensible.
    pub retriable: bool,
    /// Suggested backoff before a retry, when the worker can estimate one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// An opaque access condition attached to a capsule.
///
/// The predicate language is supplied by the integrator; the core only
/// transports the text verbatim (it is covered by the request signature) and
/// hands it to the [`ConditionEvaluator`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition(String);

impl Condition {
    /// Wraps the predicate text.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The predicate text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Request context handed to the evaluator along with each condition.
#[derive(Clone, Debug)]
pub struct ConditionContext {
    /// Policy the request belongs to.
    pub hrac: Hrac,
    /// The requesting retriever's signing identity.
    pub retriever_verifying_pk: PublicKey,
    /// The requesting retriever's decryption key.
    pub retriever_decryption_pk: PublicKey,
    /// When the worker started evaluating.
    pub requested_at: Timestamp,
}

/// Failures of condition evaluation.
#[derive(Debug, Error)]
pub enum ConditionError {
    /// The predicate evaluated to false.
    #[error("condition not met: {0}")]
    NotMet(String),
    /// The predicate could not be evaluated at all.
    #[error("condition evaluation failed: {0}")]
    Evaluation(String),
}

/// Integrator-supplied predicate evaluator.
///
/// Workers call this once per (capsule, condition) pair before any
/// re-encryption happens; a single failure rejects the whole request.
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluates `condition` for the given request context.
    async fn evaluate(
        &self,
        condition: &Condition,
        context: &ConditionContext,
    ) -> Result<(), ConditionError>;
}

/// Shared handle to a condition evaluator.
pub type ConditionEvaluatorService = Arc<dyn ConditionEvaluator>;
