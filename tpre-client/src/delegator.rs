//! The delegator role: granting access.

use std::collections::BTreeMap;
use std::time::Duration;

use backon::{BackoffBuilder as _, ExponentialBuilder, Retryable as _};
use tpre_core::CryptoError;
use tpre_core::keys::DelegatorKeys;
use tpre_fleet::state::{FleetStateStore, WorkerEntry};
use tpre_types::api::{EnactmentReceipt, EnactmentRequest};
use tpre_types::crypto::{EncryptedKeyFrag, NodeMetadata};
use tpre_types::policy::{Policy, PolicyError, TreasureMap};
use tpre_types::{Domain, Hrac, NodeId, Timestamp, blake2b_truncated};
use tpre_fleet::state::Shard;
use tracing::instrument;
use umbral_pre::{PublicKey, VerifiedKeyFrag};
use uuid::Uuid;

use crate::transport::WorkerApiClient;
use crate::{WorkerOutcome, WorkerOutcomeKind};

/// Knobs for the enactment leg of a grant.
#[derive(Clone, Debug)]
pub struct GrantConfig {
    /// Deadline for one enactment attempt.
    pub enact_timeout: Duration,
    /// Total retry budget per worker for transport failures.
    pub enact_retry_budget: Duration,
    /// Whether workers in the unverified shard may be selected. Grants that
    /// use them are annotated as possibly stale.
    pub accept_unverified: bool,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            enact_timeout: Duration::from_secs(5),
            enact_retry_budget: Duration::from_secs(15),
            accept_unverified: true,
        }
    }
}

/// Errors of [`Delegator::grant`].
#[derive(Debug, thiserror::Error)]
pub enum GrantError {
    /// The requested policy parameters are invalid.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Key fragment generation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The fleet does not know enough eligible workers.
    #[error("only {available} eligible workers known, need at least {needed}")]
    NotEnoughWorkers {
        /// Eligible workers in the current fleet view.
        available: usize,
        /// The policy threshold.
        needed: usize,
    },
    /// Fewer than threshold-many enactments succeeded.
    #[error("only {enacted} of {threshold} required enactments succeeded")]
    ThresholdNotEnacted {
        /// Successful enactments.
        enacted: usize,
        /// The policy threshold.
        threshold: usize,
        /// Per-worker failure report.
        failures: Vec<WorkerOutcome>,
    },
}

/// The result of a successful grant.
#[derive(Debug)]
pub struct GrantOutcome {
    /// The public policy record. `shares` reflects the fragments actually
    /// enacted, which can be fewer than requested when replacements ran
    /// out.
    pub policy: Policy,
    /// The signed directory of sealed fragments.
    pub treasure_map: TreasureMap,
    /// Worker-signed delivery receipts.
    pub receipts: Vec<EnactmentReceipt>,
    /// Workers that were tried and failed.
    pub failures: Vec<WorkerOutcome>,
    /// Set when the oracle view behind worker selection was stale, or when
    /// unverified workers were selected.
    pub possibly_stale: bool,
}

/// The party granting access.
pub struct Delegator {
    keys: DelegatorKeys,
    domain: Domain,
    client: WorkerApiClient,
    config: GrantConfig,
}

impl Delegator {
    /// Creates the role from its key bundle.
    pub fn new(keys: DelegatorKeys, domain: Domain, config: GrantConfig) -> Self {
        Self {
            keys,
            domain,
            client: WorkerApiClient::new(),
            config,
        }
    }

    /// The delegator's stable signing identity.
    pub fn verifying_pk(&self) -> &PublicKey {
        self.keys.verifying_pk()
    }

    /// Grants `retriever_pk` access to payloads encrypted under the policy
    /// derived from `label`.
    ///
    /// Selects `shares` workers deterministically (the policy handle seeds
    /// the sampling, so a grant is reproducible against the same fleet
    /// view), seals one fragment per worker, and delivers them. Failed
    /// deliveries are replaced from the remaining eligible pool; the grant
    /// fails only when fewer than `threshold` deliveries succeed.
    #[instrument(level = "debug", skip_all, fields(label = %label, hrac = tracing::field::Empty))]
    pub async fn grant(
        &self,
        fleet: &FleetStateStore,
        retriever_pk: &PublicKey,
        label: &str,
        threshold: u16,
        shares: u16,
        expires_at: Timestamp,
    ) -> Result<GrantOutcome, GrantError> {
        let now = Timestamp::now();
        let hrac = Hrac::derive(self.keys.verifying_pk(), retriever_pk, label.as_bytes());
        tracing::Span::current().record("hrac", hrac.to_string());

        let (payload_sk, payload_pk) = self.keys.derive_payload_keys(label.as_bytes());
        let policy = Policy {
            hrac,
            delegator_verifying_pk: self.keys.verifying_pk().clone(),
            retriever_decryption_pk: retriever_pk.clone(),
            label: label.to_owned(),
            threshold,
            shares,
            encrypted_payload_pk: payload_pk.clone(),
            issued_at: now,
            expires_at,
        };
        policy.validate()?;

        tracing::debug!("generating {shares} key fragments..");
        let mut kfrag_pool = {
            let signer = self.keys.signer().clone();
            let payload_sk = payload_sk.clone();
            let retriever_pk = retriever_pk.clone();
            tokio::task::spawn_blocking(move || {
                tpre_core::generate_kfrags(
                    &payload_sk,
                    &retriever_pk,
                    &signer,
                    usize::from(threshold),
                    usize::from(shares),
                    true,
                    true,
                )
            })
            .await
            .expect("kfrag generation does not panic")?
        };

        // deterministic candidate order seeded by the policy handle
        let snapshot = fleet.snapshot();
        let domain = self.domain.clone();
        let accept_unverified = self.config.accept_unverified;
        let predicate = move |entry: &WorkerEntry| {
            entry.metadata.domain == domain
                && match entry.shard {
                    Shard::Verified => true,
                    Shard::Unverified => accept_unverified,
                    Shard::Cold => false,
                }
        };
        let seed = blake2b_truncated::<32>(&[hrac.as_bytes()]);
        let candidates = snapshot.sample(usize::MAX, predicate, seed);
        if candidates.len() < usize::from(threshold) {
            return Err(GrantError::NotEnoughWorkers {
                available: candidates.len(),
                needed: usize::from(threshold),
            });
        }
        let mut possibly_stale = false;

        let mut destinations: BTreeMap<NodeId, EncryptedKeyFrag> = BTreeMap::new();
        let mut receipts = Vec::new();
        let mut failures: Vec<WorkerOutcome> = Vec::new();
        let mut candidates = candidates.into_iter();

        // waves: try as many workers as fragments remain unplaced, refill
        // from the candidate pool until it runs dry
        while destinations.len() < usize::from(shares) {
            let missing = usize::from(shares) - destinations.len();
            let wave: Vec<NodeMetadata> = candidates.by_ref().take(missing).collect();
            if wave.is_empty() {
                break;
            }
            let mut attempts = Vec::with_capacity(wave.len());
            for worker in wave {
                let kfrag = kfrag_pool.pop().expect("one fragment per unplaced share");
                if snapshot
                    .by_node_id(&worker.node_id)
                    .is_some_and(|entry| entry.possibly_stale)
                {
                    possibly_stale = true;
                }
                attempts.push(self.enact_one(&policy, worker, kfrag));
            }
            for outcome in futures::future::join_all(attempts).await {
                match outcome {
                    Ok((worker, sealed, receipt)) => {
                        destinations.insert(worker.node_id, sealed);
                        receipts.push(receipt);
                    }
                    Err((failure, kfrag)) => {
                        tracing::debug!("enactment at {} failed: {}", failure.node_id, failure.kind);
                        failures.push(failure);
                        // the undelivered fragment goes back into the pool
                        // for the next replacement wave
                        kfrag_pool.push(kfrag);
                    }
                }
            }
        }

        let enacted = destinations.len();
        if enacted < usize::from(threshold) {
            return Err(GrantError::ThresholdNotEnacted {
                enacted,
                threshold: usize::from(threshold),
                failures,
            });
        }

        let effective_shares = enacted as u16;
        let treasure_map = TreasureMap::build(
            self.keys.signer(),
            retriever_pk,
            &payload_pk,
            hrac,
            threshold,
            effective_shares,
            &destinations,
        )?;
        let policy = Policy {
            shares: effective_shares,
            ..policy
        };

        tracing::info!(
            hrac = %hrac,
            enacted,
            failed = failures.len(),
            possibly_stale,
            "granted policy"
        );
        Ok(GrantOutcome {
            policy,
            treasure_map,
            receipts,
            failures,
            possibly_stale,
        })
    }

    /// Seals `kfrag` to one worker and delivers it, retrying transport
    /// failures within the configured budget. On failure the fragment is
    /// handed back for reassignment.
    async fn enact_one(
        &self,
        policy: &Policy,
        worker: NodeMetadata,
        kfrag: VerifiedKeyFrag,
    ) -> Result<(NodeMetadata, EncryptedKeyFrag, EnactmentReceipt), (WorkerOutcome, VerifiedKeyFrag)>
    {
        let sealed = match EncryptedKeyFrag::seal(&worker.decryption_pk, &kfrag) {
            Ok(sealed) => sealed,
            Err(err) => {
                return Err((
                    WorkerOutcome {
                        node_id: worker.node_id,
                        kind: WorkerOutcomeKind::Unreachable(format!("could not seal: {err}")),
                    },
                    kfrag,
                ));
            }
        };
        let request = EnactmentRequest {
            request_id: Uuid::new_v4(),
            policy: policy.clone(),
            encrypted_kfrag: sealed.clone(),
        };

        let backoff = ExponentialBuilder::new()
            .with_jitter()
            .with_total_delay(Some(self.config.enact_retry_budget))
            .without_max_times()
            .build();
        let result = (|| {
            self.client
                .enact(&worker, &request, self.keys.signer(), self.config.enact_timeout)
        })
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|err| err.retriable())
        .notify(|err, duration| {
            tracing::debug!("enactment attempt failed ({err}), retrying after {duration:?}")
        })
        .await;

        match result {
            Ok(receipt) => Ok((worker, sealed, receipt)),
            Err(err) => {
                let kind = match &err {
                    crate::TransportError::Rejected { code, retriable, .. } => {
                        WorkerOutcomeKind::Rejected {
                            code: code.clone(),
                            retriable: *retriable,
                        }
                    }
                    other => WorkerOutcomeKind::Unreachable(other.to_string()),
                };
                Err((
                    WorkerOutcome {
                        node_id: worker.node_id,
                        kind,
                    },
                    kfrag,
                ))
            }
        }
    }
}
