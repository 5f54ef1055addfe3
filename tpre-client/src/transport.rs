//! The worker API client.
//!
//! Thin reqwest wrapper speaking the canonical envelope. Per-call deadlines
//! are passed in by the caller, which is expected to derive them from its
//! own remaining budget minus a margin, so a downstream request never
//! outlives the upstream deadline.

use std::time::Duration;

use thiserror::Error;
use tpre_types::api::{
    EnactmentReceipt, EnactmentRequest, ErrorBody, PROTOCOL_VERSION_HEADER, PublicInformation,
    ReencryptionRequest, ReencryptionResponse, StatusResponse,
};
use tpre_types::crypto::NodeMetadata;
use tpre_types::wire::{Envelope, MessageKind, WireError};
use umbral_pre::Signer;

/// Failures of one worker API call.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The worker could not be reached or the transfer broke.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The worker answered with a typed rejection.
    #[error("worker rejected request ({code}): {message}")]
    Rejected {
        /// HTTP status the worker answered with.
        status: u16,
        /// The worker's error code.
        code: String,
        /// Human-readable detail.
        message: String,
        /// Whether the worker suggested retrying later.
        retriable: bool,
    },
    /// The worker's reply violated the wire protocol.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The worker's reply did not echo the request correctly.
    #[error("worker reply is inconsistent: {0}")]
    Inconsistent(String),
}

impl TransportError {
    /// Whether retrying this call later is sensible.
    pub fn retriable(&self) -> bool {
        match self {
            TransportError::Transport(_) => true,
            TransportError::Rejected { retriable, .. } => *retriable,
            TransportError::Wire(_) | TransportError::Inconsistent(_) => false,
        }
    }
}

/// Client for the worker REST API.
#[derive(Clone)]
pub struct WorkerApiClient {
    http: reqwest::Client,
    version: semver::Version,
}

impl Default for WorkerApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerApiClient {
    /// Creates a client announcing this crate's version to workers.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            version: semver::Version::parse(env!("CARGO_PKG_VERSION"))
                .expect("crate version is valid semver"),
        }
    }

    async fn post_envelope(
        &self,
        base_url: &str,
        path: &str,
        envelope: &Envelope,
        deadline: Duration,
    ) -> Result<Envelope, TransportError> {
        let url = format!("{}{path}", base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .timeout(deadline)
            .header(&PROTOCOL_VERSION_HEADER, self.version.to_string())
            .header(http::header::CONTENT_TYPE, "application/cbor")
            .body(envelope.encode())
            .send()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;
        if !status.is_success() {
            // workers answer failures with a structured JSON body
            return match serde_json::from_slice::<ErrorBody>(&bytes) {
                Ok(body) => Err(TransportError::Rejected {
                    status: status.as_u16(),
                    code: body.code,
                    message: body.message,
                    retriable: body.retriable,
                }),
                Err(_) => Err(TransportError::Rejected {
                    status: status.as_u16(),
                    code: "unknown".to_owned(),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                    retriable: status.is_server_error(),
                }),
            };
        }
        Ok(Envelope::decode(&bytes)?)
    }

    /// Asks `worker` to re-encrypt; the request envelope is signed with the
    /// retriever's `signer` and the reply is verified against the worker's
    /// signing key.
    pub async fn reencrypt(
        &self,
        worker: &NodeMetadata,
        request: &ReencryptionRequest,
        signer: &Signer,
        deadline: Duration,
    ) -> Result<ReencryptionResponse, TransportError> {
        let envelope = Envelope::seal_signed(MessageKind::ReencryptionRequest, request, signer);
        let reply = self
            .post_envelope(&worker.network_address, "/api/v1/reencrypt", &envelope, deadline)
            .await?;
        let response: ReencryptionResponse =
            reply.open_signed(MessageKind::ReencryptionResponse, &worker.verifying_pk)?;
        if response.request_id != request.request_id {
            return Err(TransportError::Inconsistent("request id echo mismatch".to_owned()));
        }
        if response.hrac != request.hrac {
            return Err(TransportError::Inconsistent("policy handle mismatch".to_owned()));
        }
        if response.cfrags.len() != request.capsules.len() {
            return Err(TransportError::Inconsistent(format!(
                "{} cfrags for {} capsules",
                response.cfrags.len(),
                request.capsules.len()
            )));
        }
        Ok(response)
    }

    /// Delivers one sealed kfrag to `worker`; the request envelope is
    /// signed with the delegator's `signer` and the receipt is verified
    /// against the worker's signing key.
    pub async fn enact(
        &self,
        worker: &NodeMetadata,
        request: &EnactmentRequest,
        signer: &Signer,
        deadline: Duration,
    ) -> Result<EnactmentReceipt, TransportError> {
        let envelope = Envelope::seal_signed(MessageKind::EnactmentRequest, request, signer);
        let reply = self
            .post_envelope(&worker.network_address, "/api/v1/enact", &envelope, deadline)
            .await?;
        let receipt: EnactmentReceipt =
            reply.open_signed(MessageKind::EnactmentReceipt, &worker.verifying_pk)?;
        if receipt.request_id != request.request_id {
            return Err(TransportError::Inconsistent("request id echo mismatch".to_owned()));
        }
        if receipt.hrac != request.policy.hrac {
            return Err(TransportError::Inconsistent("policy handle mismatch".to_owned()));
        }
        if receipt.node_id != worker.node_id {
            return Err(TransportError::Inconsistent("receipt from wrong node".to_owned()));
        }
        if receipt.kfrag_digest != request.encrypted_kfrag.digest() {
            return Err(TransportError::Inconsistent(
                "receipt acknowledges a different fragment".to_owned(),
            ));
        }
        Ok(receipt)
    }

    /// Fetches a worker's static identity block.
    pub async fn public_information(
        &self,
        address: &str,
        deadline: Duration,
    ) -> Result<PublicInformation, TransportError> {
        let url = format!("{}/public_information", address.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;
        let envelope = Envelope::decode(&bytes)?;
        Ok(envelope.open(MessageKind::PublicInformation)?)
    }

    /// Fetches a worker's liveness and version info.
    pub async fn status(
        &self,
        address: &str,
        deadline: Duration,
    ) -> Result<StatusResponse, TransportError> {
        let url = format!("{}/status", address.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;
        response
            .json()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))
    }
}
