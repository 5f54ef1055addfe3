//! The policy-enactment endpoint.
//!
//! Delegators deliver one sealed kfrag per worker here. The worker checks
//! the delegator's envelope signature, re-derives the policy handle, opens
//! the sealed fragment with its own decryption key, verifies the fragment
//! against the delegation keys, stores it, persists the store, and answers
//! with a signed receipt. Re-delivery of the identical fragment is
//! idempotent so delegators can retry safely.

use std::sync::Arc;

use axum::{Router, body::Bytes, response::Response, routing::post};
use axum_extra::TypedHeader;
use tpre_types::api::{EnactmentReceipt, EnactmentRequest};
use tpre_types::wire::{Envelope, MessageKind};
use tpre_types::{Hrac, Timestamp};
use tracing::instrument;

use crate::WorkerContext;
use crate::api::errors::Error;
use crate::api::{ProtocolVersion, check_version, envelope_response};
use crate::metrics::METRICS_ID_WORKER_ENACTMENTS;
use crate::services::kfrag_store::{EnactOutcome, EnactedPolicy};

/// Creates a `Router` with a single `/enact` route.
pub(crate) fn routes(context: Arc<WorkerContext>) -> Router {
    Router::new().route(
        "/enact",
        post(move |version_header, body| {
            let TypedHeader(ProtocolVersion(client_version)) = version_header;
            enact(context, client_version, body)
        }),
    )
}

/// Handles one enactment request.
#[instrument(
    level = "debug",
    skip_all,
    fields(client = %client_version, request_id = tracing::field::Empty, hrac = tracing::field::Empty)
)]
async fn enact(
    context: Arc<WorkerContext>,
    client_version: semver::Version,
    body: Bytes,
) -> Result<Response, Error> {
    check_version(&context.version_req, &client_version)?;

    let envelope = Envelope::decode(&body)?;
    let request: EnactmentRequest = envelope.open(MessageKind::EnactmentRequest)?;
    let policy = &request.policy;
    let span = tracing::Span::current();
    span.record("request_id", request.request_id.to_string());
    span.record("hrac", policy.hrac.to_string());

    policy
        .validate()
        .map_err(|err| Error::BadRequest(err.to_string()))?;
    envelope.verify(&policy.delegator_verifying_pk)?;

    // the handle must actually bind this delegator, retriever and label
    let derived = Hrac::derive(
        &policy.delegator_verifying_pk,
        &policy.retriever_decryption_pk,
        policy.label.as_bytes(),
    );
    if derived != policy.hrac {
        return Err(Error::BadRequest(
            "policy handle does not match its fields".to_owned(),
        ));
    }
    let now = Timestamp::now();
    if policy.is_expired(now) {
        return Err(Error::PolicyExpired(policy.hrac));
    }

    tracing::debug!("opening sealed fragment..");
    let kfrag = request
        .encrypted_kfrag
        .open(context.keys.decryption_sk())
        .map_err(|err| Error::BadRequest(format!("sealed fragment does not open: {err}")))?;
    let verified = tpre_core::verify_kfrag(
        kfrag,
        &policy.delegator_verifying_pk,
        Some(&policy.encrypted_payload_pk),
        Some(&policy.retriever_decryption_pk),
    )
    .map_err(|err| Error::InvalidSignature(err.to_string()))?;

    let sealed_digest = request.encrypted_kfrag.digest();
    let outcome = context.kfrag_store.insert(EnactedPolicy::new(
        policy.clone(),
        verified,
        sealed_digest,
        now,
    ))?;
    if outcome == EnactOutcome::Inserted {
        ::metrics::counter!(METRICS_ID_WORKER_ENACTMENTS).increment(1);
        context
            .secret_store
            .save_kfrags(&context.kfrag_store.to_persistable())
            .await
            .map_err(|err| Error::Internal(format!("could not persist fragment store: {err}")))?;
    }

    tracing::info!(
        request_id = %request.request_id,
        hrac = %policy.hrac,
        outcome = ?outcome,
        "enacted policy fragment"
    );
    let receipt = EnactmentReceipt {
        request_id: request.request_id,
        hrac: policy.hrac,
        node_id: context.metadata.node_id,
        kfrag_digest: sealed_digest,
    };
    let envelope =
        Envelope::seal_signed(MessageKind::EnactmentReceipt, &receipt, context.keys.signer());
    Ok(envelope_response(&envelope))
}
