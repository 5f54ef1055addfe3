//! File-backed stand-ins for the two integrator-supplied seams: a registry
//! oracle reading a JSON allowlist, and a condition evaluator that accepts
//! everything.

use std::collections::HashMap;
use std::path::Path;

use alloy_primitives::Address;
use async_trait::async_trait;
use eyre::Context as _;
use tpre_types::api::{Condition, ConditionContext, ConditionError, ConditionEvaluator};
use tpre_types::chain::{AuthorizationOracle, OracleError, WorkerAuthorization};
use tpre_types::{Domain, Epoch, Timestamp};

/// Oracle serving a fixed registry loaded from disk.
pub struct StaticRegistryOracle {
    authorized: HashMap<Address, WorkerAuthorization>,
}

impl StaticRegistryOracle {
    /// Loads the registry from a JSON array of authorizations.
    pub async fn load(path: &Path) -> eyre::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .context(format!("while reading {}", path.display()))?;
        let entries: Vec<WorkerAuthorization> =
            serde_json::from_slice(&bytes).context("while decoding registry entries")?;
        tracing::info!("registry file lists {} workers", entries.len());
        Ok(Self {
            authorized: entries
                .into_iter()
                .map(|entry| (entry.operator_address, entry))
                .collect(),
        })
    }
}

#[async_trait]
impl AuthorizationOracle for StaticRegistryOracle {
    async fn is_authorized(&self, operator: Address, _at: Timestamp) -> Result<bool, OracleError> {
        Ok(self.authorized.contains_key(&operator))
    }

    async fn lookup_worker(
        &self,
        operator: Address,
    ) -> Result<Option<WorkerAuthorization>, OracleError> {
        Ok(self.authorized.get(&operator).cloned())
    }

    async fn list_authorized(&self, _domain: &Domain) -> Result<Vec<Address>, OracleError> {
        Ok(self.authorized.keys().copied().collect())
    }

    async fn current_epoch(&self) -> Result<Epoch, OracleError> {
        // a file has no epochs; every snapshot reads the same registry
        Ok(Epoch::new(0))
    }
}

/// Evaluator that accepts every condition. Deployments replace this with
/// their predicate engine.
pub struct AllowAllEvaluator;

#[async_trait]
impl ConditionEvaluator for AllowAllEvaluator {
    async fn evaluate(
        &self,
        condition: &Condition,
        _context: &ConditionContext,
    ) -> Result<(), ConditionError> {
        tracing::debug!("accepting condition {:?}", condition.as_str());
        Ok(())
    }
}
