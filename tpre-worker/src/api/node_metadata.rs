//! The node-metadata exchange endpoint.
//!
//! Peers (and passive client learners) POST their announcement here and
//! receive this worker's identity plus a fleet-state announcement. Accepted
//! announcer identities are pushed into a shallow buffer the learning loop
//! drains at the start of its next round; the endpoint itself never writes
//! to the fleet state, keeping the loop the single writer.

use std::sync::Arc;

use axum::{Router, body::Bytes, response::Response, routing::post};
use axum_extra::TypedHeader;
use tpre_types::Timestamp;
use tpre_types::api::{FleetAnnouncementEntry, NodeMetadataRequest, NodeMetadataResponse};
use tpre_types::wire::{Envelope, MessageKind};
use tracing::instrument;

use crate::WorkerContext;
use crate::api::errors::Error;
use crate::api::{ProtocolVersion, check_version, envelope_response};

/// Creates a `Router` with a single `/node_metadata` route.
pub(crate) fn routes(context: Arc<WorkerContext>) -> Router {
    Router::new().route(
        "/node_metadata",
        post(move |version_header, body| {
            let TypedHeader(ProtocolVersion(client_version)) = version_header;
            node_metadata(context, client_version, body)
        }),
    )
}

/// Handles one metadata exchange.
#[instrument(level = "debug", skip_all, fields(client = %client_version))]
async fn node_metadata(
    context: Arc<WorkerContext>,
    client_version: semver::Version,
    body: Bytes,
) -> Result<Response, Error> {
    check_version(&context.version_req, &client_version)?;
    let envelope = Envelope::decode(&body)?;
    let request: NodeMetadataRequest = envelope.open(MessageKind::NodeMetadataRequest)?;
    let now = Timestamp::now();

    if let Some(announcer) = request.announcer {
        if announcer.domain != context.metadata.domain {
            return Err(Error::WrongDomain {
                expected: context.metadata.domain.clone(),
                got: announcer.domain,
            });
        }
        announcer
            .verify(now)
            .map_err(|err| Error::InvalidSignature(err.to_string()))?;
        // shallow accept buffer: when the loop is behind, drop rather than
        // queue unboundedly
        if let Err(err) = context.announcements.try_send(announcer) {
            tracing::debug!("dropping announcement, buffer full: {err}");
        }
    }

    let snapshot = context.fleet.snapshot();
    let fleet = if request.fleet_checksum == Some(snapshot.checksum()) {
        Vec::new()
    } else {
        snapshot
            .entries()
            .map(|entry| FleetAnnouncementEntry {
                metadata: entry.metadata.clone(),
                last_seen: entry.last_seen,
            })
            .collect()
    };

    let response = NodeMetadataResponse {
        responder: context.metadata.clone(),
        fleet,
        checksum: snapshot.checksum(),
        timestamp: now,
    };
    let envelope = Envelope::seal_signed(
        MessageKind::NodeMetadataResponse,
        &response,
        context.keys.signer(),
    );
    Ok(envelope_response(&envelope))
}
