//! The metadata-exchange transport.
//!
//! The learning loop talks to peers through [`MetadataExchange`] so that
//! tests can substitute an in-memory fabric; [`HttpMetadataExchange`] is the
//! production implementation speaking the canonical envelope over HTTP.

use async_trait::async_trait;
use thiserror::Error;
use tpre_types::api::{NodeMetadataRequest, NodeMetadataResponse, PROTOCOL_VERSION_HEADER};
use tpre_types::wire::{Envelope, MessageKind, WireError};

/// Failures of one metadata exchange. Exchange failures are routine during
/// churn; the learning loop logs them at debug level and moves on.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The connection could not be established or broke mid-exchange.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The peer answered with a non-success HTTP status.
    #[error("peer returned status {0}")]
    Status(u16),
    /// The peer's reply violated the wire protocol.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// One round-trip of the node-metadata exchange.
#[async_trait]
pub trait MetadataExchange: Send + Sync {
    /// Sends `request` to the peer at `peer_address` and returns its
    /// validated-at-the-wire-level reply. Identity-level validation
    /// (signatures, domain, version) is the caller's job.
    async fn exchange(
        &self,
        peer_address: &str,
        request: NodeMetadataRequest,
    ) -> Result<NodeMetadataResponse, ExchangeError>;
}

/// HTTP implementation of the metadata exchange.
pub struct HttpMetadataExchange {
    http: reqwest::Client,
    version: semver::Version,
}

impl HttpMetadataExchange {
    /// Creates the exchange client, announcing `version` to peers.
    pub fn new(version: semver::Version) -> Self {
        Self {
            http: reqwest::Client::new(),
            version,
        }
    }
}

#[async_trait]
impl MetadataExchange for HttpMetadataExchange {
    async fn exchange(
        &self,
        peer_address: &str,
        request: NodeMetadataRequest,
    ) -> Result<NodeMetadataResponse, ExchangeError> {
        let envelope = Envelope::seal(MessageKind::NodeMetadataRequest, &request);
        let url = format!(
            "{}/api/v1/node_metadata",
            peer_address.trim_end_matches('/')
        );
        let response = self
            .http
            .post(url)
            .header(&PROTOCOL_VERSION_HEADER, self.version.to_string())
            .header(http::header::CONTENT_TYPE, "application/cbor")
            .body(envelope.encode())
            .send()
            .await
            .map_err(|err| ExchangeError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ExchangeError::Status(response.status().as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ExchangeError::Transport(err.to_string()))?;
        let envelope = Envelope::decode(&bytes)?;
        let reply: NodeMetadataResponse = envelope.open(MessageKind::NodeMetadataResponse)?;
        // the responder signs its announcement with the key its identity
        // claims, so a hijacked address cannot speak for a node id
        envelope.verify(&reply.responder.verifying_pk)?;
        Ok(reply)
    }
}
