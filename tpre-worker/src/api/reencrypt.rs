//! The re-encryption endpoint, the worker's hardest path.
//!
//! The pipeline, in order: version gate, inflight bound, frame decode,
//! request-signature verification, kfrag lookup, retriever/policy
//! consistency, expiry, per-capsule condition evaluation (all-or-nothing),
//! oracle snapshot gate, per-policy rate accounting, and finally the
//! re-encryption itself on the blocking pool so the cooperative scheduler
//! never stalls on curve arithmetic.
//!
//! The endpoint is stateless over its outputs: an identical replayed
//! request is served again and yields fragments that verify just the same,
//! while any tampering breaks the envelope signature.

use std::sync::Arc;
use std::time::Instant;

use axum::{Router, body::Bytes, response::Response, routing::post};
use axum_extra::TypedHeader;
use tpre_types::Timestamp;
use tpre_types::api::{ConditionContext, ReencryptionRequest, ReencryptionResponse};
use tpre_types::wire::{Envelope, MessageKind};
use tracing::instrument;

use crate::WorkerContext;
use crate::api::errors::Error;
use crate::api::{ProtocolVersion, check_version, envelope_response};
use crate::metrics::{
    METRICS_ID_WORKER_DEGRADED_SERVES, METRICS_ID_WORKER_OVERLOADED,
    METRICS_ID_WORKER_REENCRYPT_DURATION, METRICS_ID_WORKER_REENCRYPT_REJECTED,
    METRICS_ID_WORKER_REENCRYPT_SUCCESS,
};
use tpre_fleet::oracle_cache::OracleView;

/// Creates a `Router` with a single `/reencrypt` route.
pub(crate) fn routes(context: Arc<WorkerContext>) -> Router {
    Router::new().route(
        "/reencrypt",
        post(move |version_header, body| {
            let TypedHeader(ProtocolVersion(client_version)) = version_header;
            async move {
                let result = reencrypt(context, client_version, body).await;
                if result.is_err() {
                    ::metrics::counter!(METRICS_ID_WORKER_REENCRYPT_REJECTED).increment(1);
                }
                result
            }
        }),
    )
}

/// Handles one re-encryption request.
#[instrument(
    level = "debug",
    skip_all,
    fields(client = %client_version, request_id = tracing::field::Empty, hrac = tracing::field::Empty)
)]
async fn reencrypt(
    context: Arc<WorkerContext>,
    client_version: semver::Version,
    body: Bytes,
) -> Result<Response, Error> {
    check_version(&context.version_req, &client_version)?;

    // above the bound we answer retry-later before doing any work; the
    // accept buffer is the socket backlog, nothing queues here
    let _permit = context
        .inflight
        .clone()
        .try_acquire_owned()
        .map_err(|_| {
            ::metrics::counter!(METRICS_ID_WORKER_OVERLOADED).increment(1);
            Error::Overloaded
        })?;
    let start = Instant::now();

    let envelope = Envelope::decode(&body)?;
    let request: ReencryptionRequest = envelope.open(MessageKind::ReencryptionRequest)?;
    let span = tracing::Span::current();
    span.record("request_id", request.request_id.to_string());
    span.record("hrac", request.hrac.to_string());

    if request.capsules.is_empty() {
        return Err(Error::BadRequest("no capsules in request".to_owned()));
    }
    if !request.conditions_well_formed() {
        return Err(Error::BadRequest(format!(
            "{} conditions for {} capsules",
            request.conditions.len(),
            request.capsules.len()
        )));
    }

    // the signature covers retriever keys, capsules and conditions via the
    // envelope bytes
    envelope.verify(&request.retriever_verifying_pk)?;

    let entry = context.kfrag_store.get(request.hrac)?;
    if entry.policy.retriever_decryption_pk != request.retriever_decryption_pk {
        return Err(Error::UnknownPolicy(request.hrac));
    }
    let now = Timestamp::now();
    if entry.policy.is_expired(now) {
        return Err(Error::PolicyExpired(request.hrac));
    }

    tracing::debug!("evaluating request conditions..");
    let condition_context = ConditionContext {
        hrac: request.hrac,
        retriever_verifying_pk: request.retriever_verifying_pk.clone(),
        retriever_decryption_pk: request.retriever_decryption_pk.clone(),
        requested_at: now,
    };
    for (index, condition) in request.conditions.iter().enumerate() {
        if let Some(condition) = condition {
            context
                .evaluator
                .evaluate(condition, &condition_context)
                .await
                // any failure rejects the whole request, no partial cfrags
                .map_err(|err| Error::ConditionNotMet(format!("capsule {index}: {err}")))?;
        }
    }

    match context.oracle_cache.view() {
        OracleView::Fresh(_) => {
            if context.oracle_cache.is_degraded() {
                ::metrics::counter!(METRICS_ID_WORKER_DEGRADED_SERVES).increment(1);
                tracing::debug!("serving from degraded oracle view");
            }
        }
        OracleView::Stale(snapshot) => {
            return Err(Error::TemporarilyUnavailable(format!(
                "oracle snapshot from {} exceeds the staleness bound",
                snapshot.taken_at
            )));
        }
        OracleView::Missing => {
            return Err(Error::TemporarilyUnavailable(
                "no oracle snapshot available yet".to_owned(),
            ));
        }
    }

    if !context.usage.check_and_record(request.hrac, now) {
        return Err(Error::RateLimited(request.hrac));
    }

    tracing::debug!("re-encrypting {} capsules..", request.capsules.len());
    let kfrag_source = entry.kfrag();
    let capsules = request.capsules.clone();
    let cfrags = tokio::task::spawn_blocking(move || {
        capsules
            .iter()
            .map(|capsule| tpre_core::reencrypt(capsule, kfrag_source.clone()).unverify())
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|err| Error::Internal(format!("re-encryption worker died: {err}")))?;

    let response = ReencryptionResponse {
        request_id: request.request_id,
        hrac: request.hrac,
        node_id: context.metadata.node_id,
        cfrags,
    };
    let envelope = Envelope::seal_signed(
        MessageKind::ReencryptionResponse,
        &response,
        context.keys.signer(),
    );

    // structured audit record for this serve
    tracing::info!(
        request_id = %request.request_id,
        hrac = %request.hrac,
        capsules = request.capsules.len(),
        usage = context.usage.used(request.hrac),
        "served re-encryption request"
    );
    ::metrics::counter!(METRICS_ID_WORKER_REENCRYPT_SUCCESS).increment(1);
    ::metrics::histogram!(METRICS_ID_WORKER_REENCRYPT_DURATION)
        .record(start.elapsed().as_millis() as f64);
    Ok(envelope_response(&envelope))
}
