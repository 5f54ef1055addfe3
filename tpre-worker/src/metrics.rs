//! Metrics definitions for the worker service.
//!
//! This module defines all metrics keys used by the service and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for counting served re-encryption requests.
pub const METRICS_ID_WORKER_REENCRYPT_SUCCESS: &str = "tpre.worker.reencrypt.success";
/// Metrics key for counting rejected re-encryption requests.
pub const METRICS_ID_WORKER_REENCRYPT_REJECTED: &str = "tpre.worker.reencrypt.rejected";
/// Metrics key for requests turned away at the inflight bound.
pub const METRICS_ID_WORKER_OVERLOADED: &str = "tpre.worker.reencrypt.overloaded";
/// Metrics key for the duration of one full re-encrypt pipeline run.
pub const METRICS_ID_WORKER_REENCRYPT_DURATION: &str = "tpre.worker.reencrypt.duration";
/// Metrics key for the number of enacted policies currently held.
pub const METRICS_ID_WORKER_POLICIES_HELD: &str = "tpre.worker.policies.held";
/// Metrics key for accepted enactments.
pub const METRICS_ID_WORKER_ENACTMENTS: &str = "tpre.worker.enactments";
/// Metrics key for requests served while the oracle view was degraded.
pub const METRICS_ID_WORKER_DEGRADED_SERVES: &str = "tpre.worker.degraded.serves";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_WORKER_REENCRYPT_SUCCESS,
        metrics::Unit::Count,
        "Number of served re-encryption requests"
    );

    metrics::describe_counter!(
        METRICS_ID_WORKER_REENCRYPT_REJECTED,
        metrics::Unit::Count,
        "Number of rejected re-encryption requests"
    );

    metrics::describe_counter!(
        METRICS_ID_WORKER_OVERLOADED,
        metrics::Unit::Count,
        "Number of requests turned away at the inflight bound"
    );

    metrics::describe_histogram!(
        METRICS_ID_WORKER_REENCRYPT_DURATION,
        metrics::Unit::Milliseconds,
        "Duration of one full re-encrypt pipeline run"
    );

    metrics::describe_gauge!(
        METRICS_ID_WORKER_POLICIES_HELD,
        metrics::Unit::Count,
        "Number of enacted policies currently held"
    );

    metrics::describe_counter!(
        METRICS_ID_WORKER_ENACTMENTS,
        metrics::Unit::Count,
        "Number of accepted enactments"
    );

    metrics::describe_counter!(
        METRICS_ID_WORKER_DEGRADED_SERVES,
        metrics::Unit::Count,
        "Number of requests served from a degraded oracle view"
    );
}
