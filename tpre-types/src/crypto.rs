//! Signed worker identities and sealed key fragments.
//!
//! A [`NodeMetadata`] is the self-contained identity record a worker gossips
//! about itself: every field is covered by a self-signature, and the node id
//! is re-derivable from the verifying key, so any peer can validate a record
//! without talking to its author. An [`EncryptedKeyFrag`] is a key fragment
//! sealed to one worker's decryption key for enactment delivery.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tpre_core::CryptoError;
use umbral_pre::{Capsule, KeyFrag, PublicKey, SecretKey, Signature, Signer, VerifiedKeyFrag};

use crate::{Domain, NodeId, Timestamp, blake2b_truncated, key_bytes};

/// Failures when validating a [`NodeMetadata`] record.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The node id is not derived from the verifying key.
    #[error("node id does not match the verifying key")]
    NodeIdMismatch,
    /// The self-signature does not verify.
    #[error("identity self-signature verification failed")]
    BadSignature,
    /// `expires_at` is not after `valid_from`.
    #[error("identity validity window is inverted")]
    InvalidWindow,
    /// The record expired.
    #[error("identity expired at {0}")]
    Expired(Timestamp),
    /// The record is not valid yet.
    #[error("identity not valid before {0}")]
    NotYetValid(Timestamp),
}

/// The unsigned fields of a worker identity.
///
/// Call [`NodeMetadataPayload::sign`] to derive the node id from the signer
/// and produce the finished record.
#[derive(Clone, Debug)]
pub struct NodeMetadataPayload {
    /// Public key delegators seal kfrags to.
    pub decryption_pk: PublicKey,
    /// Base URL under which the worker's API is reachable.
    pub network_address: String,
    /// On-chain operator account backing this worker.
    pub operator_address: Address,
    /// Network the worker participates in.
    pub domain: Domain,
    /// Semantic version of the worker software.
    pub protocol_version: String,
    /// TLS certificate presented by the host, if pinned.
    pub host_certificate: Option<Vec<u8>>,
    /// Start of the record's validity window.
    pub valid_from: Timestamp,
    /// End of the record's validity window.
    pub expires_at: Timestamp,
}

impl NodeMetadataPayload {
    /// Signs the payload, deriving node id and verifying key from `signer`.
    pub fn sign(self, signer: &Signer) -> NodeMetadata {
        let verifying_pk = signer.verifying_key();
        let node_id = NodeId::from_verifying_pk(&verifying_pk);
        let digest = metadata_digest(&node_id, &verifying_pk, &self);
        let signature = signer.sign(&digest);
        NodeMetadata {
            node_id,
            verifying_pk,
            decryption_pk: self.decryption_pk,
            network_address: self.network_address,
            operator_address: self.operator_address,
            domain: self.domain,
            protocol_version: self.protocol_version,
            host_certificate: self.host_certificate,
            valid_from: self.valid_from,
            expires_at: self.expires_at,
            signature,
        }
    }
}

fn metadata_digest(
    node_id: &NodeId,
    verifying_pk: &PublicKey,
    payload: &NodeMetadataPayload,
) -> [u8; 32] {
    blake2b_truncated::<32>(&[
        node_id.as_bytes(),
        &key_bytes(verifying_pk),
        &key_bytes(&payload.decryption_pk),
        payload.network_address.as_bytes(),
        payload.operator_address.as_slice(),
        payload.domain.as_str().as_bytes(),
        payload.protocol_version.as_bytes(),
        payload.host_certificate.as_deref().unwrap_or(&[]),
        &payload.valid_from.as_secs().to_be_bytes(),
        &payload.expires_at.as_secs().to_be_bytes(),
    ])
}

/// A worker's self-signed identity record.
///
/// The self-signature covers every other field; a record validates on its
/// own, and tampering with any field (including the advertised network
/// address) invalidates it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Stable identifier, derived from `verifying_pk`.
    pub node_id: NodeId,
    /// Public half of the worker's signing key.
    pub verifying_pk: PublicKey,
    /// Public key delegators seal kfrags to.
    pub decryption_pk: PublicKey,
    /// Base URL under which the worker's API is reachable.
    pub network_address: String,
    /// On-chain operator account backing this worker.
    pub operator_address: Address,
    /// Network the worker participates in.
    pub domain: Domain,
    /// Semantic version of the worker software.
    pub protocol_version: String,
    /// TLS certificate presented by the host, if pinned.
    pub host_certificate: Option<Vec<u8>>,
    /// Start of the record's validity window.
    pub valid_from: Timestamp,
    /// End of the record's validity window.
    pub expires_at: Timestamp,
    /// Self-signature over all fields above.
    pub signature: Signature,
}

impl NodeMetadata {
    /// Validates the record: derivation of the node id, the validity window
    /// against `now`, and the self-signature.
    pub fn verify(&self, now: Timestamp) -> Result<(), IdentityError> {
        self.verify_signature()?;
        if self.expires_at <= self.valid_from {
            return Err(IdentityError::InvalidWindow);
        }
        if now < self.valid_from {
            return Err(IdentityError::NotYetValid(self.valid_from));
        }
        if now >= self.expires_at {
            return Err(IdentityError::Expired(self.expires_at));
        }
        Ok(())
    }

    /// Validates only the structural parts (node id and signature), ignoring
    /// the validity window. Used when reasoning about quarantined records.
    pub fn verify_signature(&self) -> Result<(), IdentityError> {
        if self.node_id != NodeId::from_verifying_pk(&self.verifying_pk) {
            return Err(IdentityError::NodeIdMismatch);
        }
        let payload = NodeMetadataPayload {
            decryption_pk: self.decryption_pk.clone(),
            network_address: self.network_address.clone(),
            operator_address: self.operator_address,
            domain: self.domain.clone(),
            protocol_version: self.protocol_version.clone(),
            host_certificate: self.host_certificate.clone(),
            valid_from: self.valid_from,
            expires_at: self.expires_at,
        };
        let digest = metadata_digest(&self.node_id, &self.verifying_pk, &payload);
        if self.signature.verify(&self.verifying_pk, &digest) {
            Ok(())
        } else {
            Err(IdentityError::BadSignature)
        }
    }
}

/// A key fragment sealed to one worker's decryption key.
///
/// Kfrags never travel or rest in plaintext; this is the only form in which
/// they leave the delegator's process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedKeyFrag {
    /// Encapsulation of the sealing key.
    pub capsule: Capsule,
    /// The sealed kfrag bytes.
    pub ciphertext: Vec<u8>,
}

impl EncryptedKeyFrag {
    /// Seals `kfrag` to `recipient_pk`.
    pub fn seal(recipient_pk: &PublicKey, kfrag: &VerifiedKeyFrag) -> Result<Self, CryptoError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&kfrag.clone().unverify(), &mut bytes)
            .expect("key fragments always serialize");
        let (capsule, ciphertext) = tpre_core::encrypt(recipient_pk, &bytes)?;
        Ok(Self {
            capsule,
            ciphertext,
        })
    }

    /// Opens the sealed kfrag with the recipient's decryption key.
    ///
    /// The returned fragment is unverified; the caller must run it through
    /// kfrag verification against the delegation keys before use.
    pub fn open(&self, recipient_sk: &SecretKey) -> Result<KeyFrag, CryptoError> {
        let bytes = tpre_core::decrypt_original(recipient_sk, &self.capsule, &self.ciphertext)?;
        ciborium::from_reader(bytes.as_slice())
            .map_err(|err| CryptoError::BadCiphertext(err.to_string()))
    }

    /// Digest identifying this sealed fragment; referenced by enactment
    /// receipts and used for idempotent re-enactment checks.
    pub fn digest(&self) -> [u8; 32] {
        let mut capsule_bytes = Vec::new();
        ciborium::into_writer(&self.capsule, &mut capsule_bytes)
            .expect("capsules always serialize");
        blake2b_truncated::<32>(&[&capsule_bytes, &self.ciphertext])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tpre_core::keys::{DelegatorKeys, RetrieverKeys, WorkerKeys};

    fn sample_metadata(worker: &WorkerKeys, now: Timestamp) -> NodeMetadata {
        NodeMetadataPayload {
            decryption_pk: worker.decryption_pk().clone(),
            network_address: "http://127.0.0.1:9151".to_owned(),
            operator_address: Address::repeat_byte(0x42),
            domain: Domain::new("lynx"),
            protocol_version: "0.3.0".to_owned(),
            host_certificate: None,
            valid_from: now,
            expires_at: now.saturating_add(Duration::from_secs(3600)),
        }
        .sign(worker.signer())
    }

    #[test]
    fn self_signed_metadata_verifies() {
        let worker = WorkerKeys::from_seed(b"metadata worker");
        let now = Timestamp::from_secs(1_700_000_000);
        let metadata = sample_metadata(&worker, now);
        metadata.verify(now.saturating_add(Duration::from_secs(10))).expect("valid record");
    }

    #[test]
    fn tampered_address_fails_verification() {
        let worker = WorkerKeys::from_seed(b"metadata tamper");
        let now = Timestamp::from_secs(1_700_000_000);
        let mut metadata = sample_metadata(&worker, now);
        metadata.network_address = "http://evil.example:9151".to_owned();
        assert!(matches!(
            metadata.verify(now),
            Err(IdentityError::BadSignature)
        ));
    }

    #[test]
    fn expired_window_is_rejected() {
        let worker = WorkerKeys::from_seed(b"metadata expiry");
        let now = Timestamp::from_secs(1_700_000_000);
        let metadata = sample_metadata(&worker, now);
        let later = now.saturating_add(Duration::from_secs(7200));
        assert!(matches!(metadata.verify(later), Err(IdentityError::Expired(_))));
    }

    #[test]
    fn sealed_kfrag_round_trips_to_recipient_only() {
        let delegator = DelegatorKeys::from_seed(b"seal delegator");
        let retriever = RetrieverKeys::from_seed(b"seal retriever");
        let worker = WorkerKeys::from_seed(b"seal worker");
        let kfrags = tpre_core::generate_kfrags(
            delegator.delegating_sk(),
            retriever.decryption_pk(),
            delegator.signer(),
            1,
            1,
            true,
            true,
        )
        .expect("valid threshold");

        let sealed = EncryptedKeyFrag::seal(worker.decryption_pk(), &kfrags[0]).expect("seals");
        let opened = sealed.open(worker.decryption_sk()).expect("recipient opens");
        tpre_core::verify_kfrag(
            opened,
            delegator.verifying_pk(),
            Some(delegator.delegating_pk()),
            Some(retriever.decryption_pk()),
        )
        .expect("opened kfrag verifies");

        let stranger = WorkerKeys::from_seed(b"some stranger");
        assert!(sealed.open(stranger.decryption_sk()).is_err());
    }
}
