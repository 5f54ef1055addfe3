//! Info Endpoints
//!
//! - `/public_information` – the worker's static identity block as a wire
//!   envelope
//! - `/status` – liveness and version info as JSON
//!
//! The endpoints include a `Cache-Control: no-cache` header to prevent
//! caching of responses.

use std::sync::Arc;

use axum::{
    Json, Router,
    http::{HeaderValue, header},
    response::IntoResponse,
    routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tpre_types::api::{PublicInformation, StatusResponse};
use tpre_types::wire::{Envelope, MessageKind};

use crate::WorkerContext;
use crate::api::envelope_response;

/// Create a router containing the info endpoints.
///
/// All endpoints have `Cache-Control: no-cache` set.
pub(crate) fn routes(context: Arc<WorkerContext>) -> Router {
    let status_context = Arc::clone(&context);
    Router::new()
        .route(
            "/public_information",
            get(move || public_information(context)),
        )
        .route("/status", get(move || status(status_context)))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// Responds with the worker's self-signed identity record.
///
/// Returns `200 OK` with a [`PublicInformation`] envelope.
async fn public_information(context: Arc<WorkerContext>) -> impl IntoResponse {
    let envelope = Envelope::seal(
        MessageKind::PublicInformation,
        &PublicInformation {
            metadata: context.metadata.clone(),
        },
    );
    envelope_response(&envelope)
}

/// Responds with liveness and version info.
///
/// Returns `200 OK` with a [`StatusResponse`].
async fn status(context: Arc<WorkerContext>) -> impl IntoResponse {
    let snapshot = context.fleet.snapshot();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        node_id: context.metadata.node_id,
        domain: context.metadata.domain.clone(),
        fleet_checksum: snapshot.checksum(),
        known_nodes: snapshot.len(),
        verified_nodes: snapshot.verified_count(),
        uptime_secs: context.started_at.elapsed().as_secs(),
    })
}
