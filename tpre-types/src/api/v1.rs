//! # v1 API types
//!
//! Data transfer objects for the version 1 worker API.
//!
//! These are the typed payloads inside the canonical wire envelope; the
//! request/response signature discipline lives at the envelope layer, so the
//! structs here carry no signature fields of their own (worker identities
//! and treasure maps embed their signatures because they propagate beyond a
//! single exchange).

use std::fmt;

use serde::{Deserialize, Serialize};
use umbral_pre::{Capsule, CapsuleFrag, PublicKey};
use uuid::Uuid;

use crate::api::Condition;
use crate::crypto::{EncryptedKeyFrag, NodeMetadata};
use crate::policy::Policy;
use crate::{Domain, FleetChecksum, Hrac, NodeId, Timestamp};

/// A retriever asking one worker to re-encrypt a batch of capsules.
///
/// The enclosing envelope is signed by `retriever_verifying_pk`; the
/// signature therefore covers the capsules and the conditions, so a replay
/// with tampered conditions fails verification while an identical replay is
/// simply served again.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReencryptionRequest {
    /// Unique ID of the request, echoed in the response for correlation.
    pub request_id: Uuid,
    /// Policy whose kfrag the worker should use.
    pub hrac: Hrac,
    /// Key the envelope signature verifies under.
    pub retriever_verifying_pk: PublicKey,
    /// The retriever's decryption key; must match the enacted policy.
    pub retriever_decryption_pk: PublicKey,
    /// Capsules to re-encrypt, in caller order.
    pub capsules: Vec<Capsule>,
    /// At most one condition per capsule; empty means unconditional.
    pub conditions: Vec<Option<Condition>>,
}

impl ReencryptionRequest {
    /// Checks that the condition list is either empty or pairs up with the
    /// capsules.
    pub fn conditions_well_formed(&self) -> bool {
        self.conditions.is_empty() || self.conditions.len() == self.capsules.len()
    }
}

impl fmt::Debug for ReencryptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReencryptionRequest")
            .field("request_id", &self.request_id)
            .field("hrac", &self.hrac)
            .field("capsules", &self.capsules.len())
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

/// The worker's answer to a [`ReencryptionRequest`].
///
/// One cfrag per input capsule, in request order. The enclosing envelope is
/// signed by the worker's signing key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReencryptionResponse {
    /// Echo of the request ID.
    pub request_id: Uuid,
    /// Echo of the policy handle.
    pub hrac: Hrac,
    /// The answering worker.
    pub node_id: NodeId,
    /// Capsule fragments in request order, unverified until the caller runs
    /// the proofs.
    pub cfrags: Vec<CapsuleFrag>,
}

/// A peer announcing itself at the start of a metadata exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeMetadataRequest {
    /// The caller's own identity, absent for passive learners that only
    /// listen (clients).
    pub announcer: Option<NodeMetadata>,
    /// The caller's current fleet checksum, so the responder can skip the
    /// full announcement when both sides agree.
    pub fleet_checksum: Option<FleetChecksum>,
}

/// One gossiped identity with the responder's liveness knowledge about it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FleetAnnouncementEntry {
    /// The identity record.
    pub metadata: NodeMetadata,
    /// When the responder last saw this identity alive.
    pub last_seen: Timestamp,
}

/// The reply to a metadata exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeMetadataResponse {
    /// The responding worker's identity.
    pub responder: NodeMetadata,
    /// Everything the responder currently knows; empty when the caller's
    /// checksum already matched.
    pub fleet: Vec<FleetAnnouncementEntry>,
    /// Checksum of the responder's fleet state.
    pub checksum: FleetChecksum,
    /// When the response was assembled.
    pub timestamp: Timestamp,
}

/// A worker's static identity block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicInformation {
    /// The worker's self-signed identity.
    pub metadata: NodeMetadata,
}

/// Liveness and version info served by the status endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Cargo package version of the worker.
    pub version: String,
    /// The worker's node id.
    pub node_id: NodeId,
    /// The worker's domain.
    pub domain: Domain,
    /// Checksum of the current fleet state.
    pub fleet_checksum: FleetChecksum,
    /// Total known identities, all shards.
    pub known_nodes: usize,
    /// Identities in the verified shard.
    pub verified_nodes: usize,
    /// Seconds since the worker started.
    pub uptime_secs: u64,
}

/// A delegator delivering one sealed kfrag to one worker.
///
/// The enclosing envelope is signed by the policy's delegator; the worker
/// checks that signature against `policy.delegator_verifying_pk` before
/// opening anything.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnactmentRequest {
    /// Unique ID of the request, echoed in the receipt.
    pub request_id: Uuid,
    /// The full policy record being enacted.
    pub policy: Policy,
    /// The kfrag assigned to this worker, sealed to its decryption key.
    pub encrypted_kfrag: EncryptedKeyFrag,
}

/// The worker-signed acknowledgement of an enacted kfrag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnactmentReceipt {
    /// Echo of the request ID.
    pub request_id: Uuid,
    /// Policy the kfrag belongs to.
    pub hrac: Hrac,
    /// The acknowledging worker.
    pub node_id: NodeId,
    /// Digest of the sealed fragment the worker stored.
    pub kfrag_digest: [u8; 32],
}
