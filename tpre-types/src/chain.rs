//! Read-only view of the on-chain authorization state.
//!
//! The staking and authorization contracts themselves are out of scope; the
//! runtime only depends on this trait. Implementations wrap an RPC endpoint
//! (or a test fixture) and surface unreachability as the soft
//! [`OracleError::Unavailable`] so callers can fall back to their last good
//! snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use umbral_pre::PublicKey;

use crate::{Domain, Epoch, Timestamp};

/// Failures of the authorization oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The underlying chain endpoint is unreachable or lagging beyond the
    /// configured staleness bound. Soft failure: callers proceed with their
    /// last good snapshot and annotate results as possibly stale.
    #[error("authorization oracle unavailable: {0}")]
    Unavailable(String),
}

/// On-chain registration facts for one worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerAuthorization {
    /// The operator account that staked for this worker.
    pub operator_address: Address,
    /// The signing key the operator bonded on-chain.
    pub verifying_pk: PublicKey,
    /// Stake backing the worker, in the smallest token unit.
    pub stake: u128,
    /// When the current bond was established.
    pub bonded_since: Timestamp,
}

/// A snapshot-consistent view of the registry at one epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleSnapshot {
    /// Epoch the snapshot was taken at; callers compare epochs to detect
    /// staleness.
    pub epoch: Epoch,
    /// Wall-clock time the snapshot was fetched.
    pub taken_at: Timestamp,
    /// All currently authorized workers, keyed by operator address.
    pub authorized: HashMap<Address, WorkerAuthorization>,
}

impl OracleSnapshot {
    /// Whether `operator` was authorized in this snapshot.
    pub fn is_authorized(&self, operator: &Address) -> bool {
        self.authorized.contains_key(operator)
    }

    /// Registration facts for `operator`, if authorized in this snapshot.
    pub fn lookup(&self, operator: &Address) -> Option<&WorkerAuthorization> {
        self.authorized.get(operator)
    }
}

/// Read-only interface to the staking/authorization contracts.
#[async_trait]
pub trait AuthorizationOracle: Send + Sync {
    /// Whether `operator` is authorized (staked, bonded, not slashed) at the
    /// given time.
    async fn is_authorized(&self, operator: Address, at: Timestamp) -> Result<bool, OracleError>;

    /// Registration facts for `operator`, `None` if unknown.
    async fn lookup_worker(
        &self,
        operator: Address,
    ) -> Result<Option<WorkerAuthorization>, OracleError>;

    /// All operator addresses currently authorized for `domain`.
    ///
    /// Finite and restartable: each call yields the full sequence from the
    /// start, so callers can resume a scan by calling again.
    async fn list_authorized(&self, domain: &Domain) -> Result<Vec<Address>, OracleError>;

    /// The current registry epoch.
    async fn current_epoch(&self) -> Result<Epoch, OracleError>;

    /// Assembles a snapshot-consistent view for `domain`.
    async fn snapshot(&self, domain: &Domain) -> Result<OracleSnapshot, OracleError> {
        let epoch = self.current_epoch().await?;
        let mut authorized = HashMap::new();
        for operator in self.list_authorized(domain).await? {
            if let Some(authorization) = self.lookup_worker(operator).await? {
                authorized.insert(operator, authorization);
            }
        }
        Ok(OracleSnapshot {
            epoch,
            taken_at: Timestamp::now(),
            authorized,
        })
    }
}

/// Shared handle to an oracle implementation.
pub type OracleService = Arc<dyn AuthorizationOracle>;
