//! This module provides [`KfragStore`], which holds the key fragment
//! enacted for each policy this worker serves.
//!
//! Access is synchronized via a `RwLock` and wrapped in an `Arc` for
//! thread-safe shared ownership. Enactment is the single writer; the
//! re-encrypt path only reads, and since an entry is immutable from
//! insertion until its policy expires, readers never contend with writers
//! over entry contents.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tpre_types::policy::Policy;
use tpre_types::{Hrac, Timestamp};
use umbral_pre::{KeyFrag, VerifiedKeyFrag};

use crate::metrics::METRICS_ID_WORKER_POLICIES_HELD;

type Result<T> = std::result::Result<T, KfragStoreError>;

/// Errors returned by the [`KfragStore`].
///
/// This error type is mostly used in API contexts, meaning it should be
/// digested by the `crate::api::errors` module.
#[derive(Debug, thiserror::Error)]
pub enum KfragStoreError {
    /// No key fragment is enacted for the policy.
    #[error("no key fragment held for policy {0}")]
    NotHeld(Hrac),
    /// A different key fragment is already enacted for the policy.
    #[error("conflicting enactment for policy {0}")]
    Conflict(Hrac),
}

/// Outcome of an insert; re-delivery of the identical fragment is accepted
/// so enactment retries stay idempotent.
#[derive(Debug, PartialEq, Eq)]
pub enum EnactOutcome {
    /// The fragment was stored.
    Inserted,
    /// The identical fragment was already stored.
    AlreadyEnacted,
}

/// One enacted policy: the public record plus this worker's fragment.
pub struct EnactedPolicy {
    /// The policy record delivered at enactment.
    pub policy: Policy,
    /// Digest of the sealed fragment as delivered, for idempotence checks
    /// and receipts.
    pub sealed_digest: [u8; 32],
    /// When the fragment arrived.
    pub enacted_at: Timestamp,
    kfrag: VerifiedKeyFrag,
}

impl EnactedPolicy {
    /// Creates an entry from its parts.
    pub fn new(
        policy: Policy,
        kfrag: VerifiedKeyFrag,
        sealed_digest: [u8; 32],
        enacted_at: Timestamp,
    ) -> Self {
        Self {
            policy,
            sealed_digest,
            enacted_at,
            kfrag,
        }
    }

    /// A copy of the fragment for one re-encryption.
    pub fn kfrag(&self) -> VerifiedKeyFrag {
        self.kfrag.clone()
    }
}

/// The persisted form of an enacted policy.
///
/// Carries the unverified fragment; [`KfragStore::from_persistable`] runs
/// verification again on load, so a corrupted store cannot smuggle in a
/// fragment that never verified.
#[derive(Serialize, Deserialize)]
pub struct StoredKfrag {
    /// The policy record.
    pub policy: Policy,
    /// The fragment in its serializable, unverified form.
    pub kfrag: KeyFrag,
    /// Digest of the sealed fragment as delivered.
    pub sealed_digest: [u8; 32],
    /// When the fragment arrived.
    pub enacted_at: Timestamp,
}

/// Storage for enacted policies, keyed by policy handle.
#[derive(Default, Clone)]
pub struct KfragStore(Arc<RwLock<HashMap<Hrac, Arc<EnactedPolicy>>>>);

impl KfragStore {
    /// Creates a store holding `initial`.
    pub fn new(initial: HashMap<Hrac, EnactedPolicy>) -> Self {
        ::metrics::gauge!(METRICS_ID_WORKER_POLICIES_HELD).set(initial.len() as f64);
        Self(Arc::new(RwLock::new(
            initial
                .into_iter()
                .map(|(hrac, entry)| (hrac, Arc::new(entry)))
                .collect(),
        )))
    }

    /// Rebuilds a store from its persisted form, re-verifying every
    /// fragment. Entries that no longer verify are dropped with a warning.
    pub fn from_persistable(stored: HashMap<Hrac, StoredKfrag>) -> Self {
        let mut initial = HashMap::with_capacity(stored.len());
        for (hrac, entry) in stored {
            let verified = tpre_core::verify_kfrag(
                entry.kfrag,
                &entry.policy.delegator_verifying_pk,
                Some(&entry.policy.encrypted_payload_pk),
                Some(&entry.policy.retriever_decryption_pk),
            );
            match verified {
                Ok(kfrag) => {
                    initial.insert(
                        hrac,
                        EnactedPolicy::new(entry.policy, kfrag, entry.sealed_digest, entry.enacted_at),
                    );
                }
                Err(err) => {
                    tracing::warn!("dropping persisted fragment for {hrac}: {err}");
                }
            }
        }
        Self::new(initial)
    }

    /// The persisted form of the current contents.
    pub fn to_persistable(&self) -> HashMap<Hrac, StoredKfrag> {
        self.0
            .read()
            .iter()
            .map(|(hrac, entry)| {
                (
                    *hrac,
                    StoredKfrag {
                        policy: entry.policy.clone(),
                        kfrag: entry.kfrag.clone().unverify(),
                        sealed_digest: entry.sealed_digest,
                        enacted_at: entry.enacted_at,
                    },
                )
            })
            .collect()
    }

    /// The entry for `hrac`.
    ///
    /// # Errors
    ///
    /// Returns [`KfragStoreError::NotHeld`] if no fragment is enacted.
    pub fn get(&self, hrac: Hrac) -> Result<Arc<EnactedPolicy>> {
        self.0
            .read()
            .get(&hrac)
            .cloned()
            .ok_or(KfragStoreError::NotHeld(hrac))
    }

    /// Stores an enacted policy.
    ///
    /// Re-delivery of the identical sealed fragment is idempotent; a
    /// different fragment for a held policy is a conflict.
    pub fn insert(&self, entry: EnactedPolicy) -> Result<EnactOutcome> {
        let hrac = entry.policy.hrac;
        let mut inner = self.0.write();
        if let Some(existing) = inner.get(&hrac) {
            if existing.sealed_digest == entry.sealed_digest {
                return Ok(EnactOutcome::AlreadyEnacted);
            }
            return Err(KfragStoreError::Conflict(hrac));
        }
        inner.insert(hrac, Arc::new(entry));
        ::metrics::gauge!(METRICS_ID_WORKER_POLICIES_HELD).increment(1);
        Ok(EnactOutcome::Inserted)
    }

    /// Deletes entries whose policy expired before `now`; returns how many
    /// were removed.
    pub fn sweep_expired(&self, now: Timestamp) -> usize {
        let mut inner = self.0.write();
        let before = inner.len();
        inner.retain(|_, entry| !entry.policy.is_expired(now));
        let removed = before - inner.len();
        if removed > 0 {
            ::metrics::gauge!(METRICS_ID_WORKER_POLICIES_HELD).set(inner.len() as f64);
            tracing::info!("swept {removed} expired policies");
        }
        removed
    }

    /// The number of enacted policies.
    ///
    /// _Note_ that this acquires a lock internally and returns the length at
    /// that point in time.
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Returns `true` iff no policy is enacted.
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}
