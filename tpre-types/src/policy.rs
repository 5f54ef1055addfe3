//! Policy records and treasure maps.
//!
//! A [`Policy`] is the public access-grant record binding delegator,
//! retriever, label, threshold and validity window. The [`TreasureMap`] is
//! the delegator-signed directory assigning one sealed kfrag to each of the
//! policy's workers; its destination block is itself sealed to the
//! retriever, so only the delegatee learns which workers serve the policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tpre_core::CryptoError;
use umbral_pre::{Capsule, PublicKey, SecretKey, Signature, Signer};

use crate::crypto::EncryptedKeyFrag;
use crate::{Hrac, NodeId, Timestamp, blake2b_truncated, key_bytes};

/// Failures when validating policies and treasure maps.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Threshold parameters violate `1 <= m <= n`.
    #[error("invalid threshold {threshold}-of-{shares}")]
    InvalidThreshold {
        /// Threshold `m`.
        threshold: u16,
        /// Share count `n`.
        shares: u16,
    },
    /// `expires_at` is not after `issued_at`.
    #[error("policy expires before it is issued")]
    InvalidWindow,
    /// The map signature does not verify under the publisher key.
    #[error("treasure map signature verification failed")]
    BadMapSignature,
    /// The destination block does not reference exactly `shares` workers.
    #[error("treasure map references {got} workers, expected {expected}")]
    WrongDestinationCount {
        /// Destinations found.
        got: usize,
        /// Destinations required.
        expected: usize,
    },
    /// Sealing or opening the destination block failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The public access-grant record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Stable policy handle.
    pub hrac: Hrac,
    /// The delegator's stable signing identity.
    pub delegator_verifying_pk: PublicKey,
    /// The delegatee's decryption key.
    pub retriever_decryption_pk: PublicKey,
    /// Human-chosen label the payload keypair is derived from.
    pub label: String,
    /// Fragments required to decrypt.
    pub threshold: u16,
    /// Fragments issued.
    pub shares: u16,
    /// Public key encryptors use for payloads under this policy.
    pub encrypted_payload_pk: PublicKey,
    /// Grant time.
    pub issued_at: Timestamp,
    /// End of the grant's validity window.
    pub expires_at: Timestamp,
}

impl Policy {
    /// Checks the structural invariants: `1 <= m <= n` and a forward
    /// validity window.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.threshold == 0 || self.threshold > self.shares {
            return Err(PolicyError::InvalidThreshold {
                threshold: self.threshold,
                shares: self.shares,
            });
        }
        if self.expires_at <= self.issued_at {
            return Err(PolicyError::InvalidWindow);
        }
        Ok(())
    }

    /// Whether the grant's validity window has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// The delegator-signed directory of sealed kfrags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreasureMap {
    /// Policy handle this map belongs to.
    pub hrac: Hrac,
    /// The delegator identity that authored and signed the map.
    pub publisher_verifying_pk: PublicKey,
    /// Public key encryptors use for payloads under this policy.
    pub payload_pk: PublicKey,
    /// Fragments required to decrypt; embedded and immutable.
    pub threshold: u16,
    /// Number of destinations sealed into the map.
    pub shares: u16,
    /// Encapsulation of the destination-block sealing key.
    pub destinations_capsule: Capsule,
    /// Destination block sealed to the retriever.
    pub destinations_ciphertext: Vec<u8>,
    /// Publisher signature over all fields above.
    pub signature: Signature,
}

impl TreasureMap {
    /// Seals `destinations` to `retriever_pk` and signs the map.
    ///
    /// Fails unless the destinations reference exactly as many distinct
    /// workers as announced by `shares` and the threshold is sane.
    pub fn build(
        signer: &Signer,
        retriever_pk: &PublicKey,
        payload_pk: &PublicKey,
        hrac: Hrac,
        threshold: u16,
        shares: u16,
        destinations: &BTreeMap<NodeId, EncryptedKeyFrag>,
    ) -> Result<Self, PolicyError> {
        if threshold == 0 || threshold > shares {
            return Err(PolicyError::InvalidThreshold { threshold, shares });
        }
        if destinations.len() != usize::from(shares) {
            return Err(PolicyError::WrongDestinationCount {
                got: destinations.len(),
                expected: usize::from(shares),
            });
        }
        let mut plaintext = Vec::new();
        ciborium::into_writer(destinations, &mut plaintext)
            .expect("destination maps always serialize");
        let (destinations_capsule, destinations_ciphertext) =
            tpre_core::encrypt(retriever_pk, &plaintext)?;

        let publisher_verifying_pk = signer.verifying_key();
        let digest = map_digest(
            &hrac,
            &publisher_verifying_pk,
            payload_pk,
            threshold,
            shares,
            &destinations_capsule,
            &destinations_ciphertext,
        );
        let signature = signer.sign(&digest);
        Ok(Self {
            hrac,
            publisher_verifying_pk,
            payload_pk: payload_pk.clone(),
            threshold,
            shares,
            destinations_capsule,
            destinations_ciphertext,
            signature,
        })
    }

    /// Verifies the publisher signature and the threshold invariant.
    pub fn verify(&self) -> Result<(), PolicyError> {
        if self.threshold == 0 || self.threshold > self.shares {
            return Err(PolicyError::InvalidThreshold {
                threshold: self.threshold,
                shares: self.shares,
            });
        }
        let digest = map_digest(
            &self.hrac,
            &self.publisher_verifying_pk,
            &self.payload_pk,
            self.threshold,
            self.shares,
            &self.destinations_capsule,
            &self.destinations_ciphertext,
        );
        if self.signature.verify(&self.publisher_verifying_pk, &digest) {
            Ok(())
        } else {
            Err(PolicyError::BadMapSignature)
        }
    }

    /// Opens the destination block with the retriever's decryption key.
    pub fn open_destinations(
        &self,
        retriever_sk: &SecretKey,
    ) -> Result<BTreeMap<NodeId, EncryptedKeyFrag>, PolicyError> {
        let plaintext = tpre_core::decrypt_original(
            retriever_sk,
            &self.destinations_capsule,
            &self.destinations_ciphertext,
        )?;
        let destinations: BTreeMap<NodeId, EncryptedKeyFrag> =
            ciborium::from_reader(plaintext.as_slice())
                .map_err(|err| PolicyError::Crypto(CryptoError::BadCiphertext(err.to_string())))?;
        if destinations.len() != usize::from(self.shares) {
            return Err(PolicyError::WrongDestinationCount {
                got: destinations.len(),
                expected: usize::from(self.shares),
            });
        }
        Ok(destinations)
    }
}

fn map_digest(
    hrac: &Hrac,
    publisher_verifying_pk: &PublicKey,
    payload_pk: &PublicKey,
    threshold: u16,
    shares: u16,
    capsule: &Capsule,
    ciphertext: &[u8],
) -> [u8; 32] {
    let mut capsule_bytes = Vec::new();
    ciborium::into_writer(capsule, &mut capsule_bytes).expect("capsules always serialize");
    blake2b_truncated::<32>(&[
        hrac.as_bytes(),
        &key_bytes(publisher_verifying_pk),
        &key_bytes(payload_pk),
        &threshold.to_be_bytes(),
        &shares.to_be_bytes(),
        &capsule_bytes,
        ciphertext,
    ])
}
