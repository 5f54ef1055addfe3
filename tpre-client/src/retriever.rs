//! The retriever role: redeeming a grant.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tpre_core::CryptoError;
use tpre_core::keys::RetrieverKeys;
use tpre_fleet::state::FleetStateStore;
use tpre_types::api::{Condition, ReencryptionRequest};
use tpre_types::crypto::NodeMetadata;
use tpre_types::policy::{Policy, PolicyError, TreasureMap};
use tpre_types::NodeId;
use tracing::instrument;
use umbral_pre::{Capsule, VerifiedCapsuleFrag};
use uuid::Uuid;

use crate::transport::{TransportError, WorkerApiClient};
use crate::{RetrievalReport, WorkerOutcome, WorkerOutcomeKind};

/// Knobs for the retrieval fan-out.
#[derive(Clone, Debug)]
pub struct RetrieveConfig {
    /// Total budget for one `retrieve` call.
    pub retrieve_deadline: Duration,
    /// Margin subtracted from the remaining budget for each downstream
    /// request, so a worker call never outlives the caller's deadline.
    pub request_margin: Duration,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            retrieve_deadline: Duration::from_secs(30),
            request_margin: Duration::from_secs(2),
        }
    }
}

/// Errors of [`Retriever::retrieve`].
#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    /// Mismatched inputs (lengths, policy/map inconsistencies).
    #[error("bad retrieval input: {0}")]
    BadInput(String),
    /// The treasure map failed validation or did not open.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Decryption failed even though the threshold was met.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Fewer than threshold-many workers produced verified fragments
    /// within the deadline.
    #[error("threshold not met: {verified} of {needed} verified responses")]
    ThresholdNotMet {
        /// Workers with verified fragments.
        verified: usize,
        /// The policy threshold.
        needed: usize,
        /// Per-worker outcome report.
        report: RetrievalReport,
    },
}

/// The result of a successful retrieval.
#[derive(Debug)]
pub struct RetrieveOutcome {
    /// One plaintext per input ciphertext, in input order.
    pub plaintexts: Vec<Vec<u8>>,
    /// Per-worker outcomes, including cancelled and suspicious workers.
    pub report: RetrievalReport,
}

struct WorkerResult {
    node_id: NodeId,
    // cfrags per capsule, in request order, verified
    outcome: Result<Vec<VerifiedCapsuleFrag>, WorkerOutcomeKind>,
}

/// The party redeeming a grant.
pub struct Retriever {
    keys: RetrieverKeys,
    client: Arc<WorkerApiClient>,
    config: RetrieveConfig,
}

impl Retriever {
    /// Creates the role from its key bundle.
    pub fn new(keys: RetrieverKeys, config: RetrieveConfig) -> Self {
        Self {
            keys,
            client: Arc::new(WorkerApiClient::new()),
            config,
        }
    }

    /// The retriever's decryption key, as it appears in policies targeted
    /// at this party.
    pub fn decryption_pk(&self) -> &umbral_pre::PublicKey {
        self.keys.decryption_pk()
    }

    /// Recovers the plaintexts behind `ciphertexts`.
    ///
    /// Opens the treasure map, resolves its workers through the fleet
    /// (quarantined identities are rejected), asks all of them in parallel,
    /// verifies every returned fragment, and stops as soon as
    /// threshold-many workers produced verified fragments; the remaining
    /// requests are cancelled. Fails with a per-worker report when the
    /// threshold is not reached within the deadline.
    #[instrument(level = "debug", skip_all, fields(hrac = %policy.hrac, capsules = capsules.len()))]
    pub async fn retrieve(
        &self,
        fleet: &FleetStateStore,
        policy: &Policy,
        treasure_map: &TreasureMap,
        capsules: &[Capsule],
        ciphertexts: &[Vec<u8>],
        conditions: &[Option<Condition>],
    ) -> Result<RetrieveOutcome, RetrieveError> {
        if capsules.is_empty() {
            return Err(RetrieveError::BadInput("no capsules".to_owned()));
        }
        if capsules.len() != ciphertexts.len() {
            return Err(RetrieveError::BadInput(format!(
                "{} capsules for {} ciphertexts",
                capsules.len(),
                ciphertexts.len()
            )));
        }
        if !conditions.is_empty() && conditions.len() != capsules.len() {
            return Err(RetrieveError::BadInput(format!(
                "{} conditions for {} capsules",
                conditions.len(),
                capsules.len()
            )));
        }
        treasure_map.verify()?;
        if treasure_map.hrac != policy.hrac {
            return Err(RetrieveError::BadInput(
                "treasure map belongs to a different policy".to_owned(),
            ));
        }
        if treasure_map.publisher_verifying_pk != policy.delegator_verifying_pk {
            return Err(RetrieveError::BadInput(
                "treasure map signed by a different delegator".to_owned(),
            ));
        }
        let threshold = usize::from(policy.threshold);

        let destinations = treasure_map.open_destinations(self.keys.decryption_sk())?;
        let request = ReencryptionRequest {
            request_id: Uuid::new_v4(),
            hrac: policy.hrac,
            retriever_verifying_pk: self.keys.verifying_pk().clone(),
            retriever_decryption_pk: self.keys.decryption_pk().clone(),
            capsules: capsules.to_vec(),
            conditions: conditions.to_vec(),
        };
        tracing::debug!(
            "asking {} workers for {threshold} verified responses",
            destinations.len()
        );

        let deadline = self.config.retrieve_deadline;
        let request_deadline = deadline.saturating_sub(self.config.request_margin);
        let snapshot = fleet.snapshot();
        let mut report = RetrievalReport::default();
        let mut pending: std::collections::BTreeSet<NodeId> = std::collections::BTreeSet::new();
        let mut tasks: JoinSet<WorkerResult> = JoinSet::new();
        for node_id in destinations.keys().copied() {
            if snapshot.is_quarantined(&node_id) {
                report.outcomes.push(WorkerOutcome {
                    node_id,
                    kind: WorkerOutcomeKind::Quarantined,
                });
                continue;
            }
            let Some(entry) = snapshot.by_node_id(&node_id) else {
                report.outcomes.push(WorkerOutcome {
                    node_id,
                    kind: WorkerOutcomeKind::NotKnown,
                });
                continue;
            };
            pending.insert(node_id);
            tasks.spawn(worker_task(
                Arc::clone(&self.client),
                entry.metadata.clone(),
                request.clone(),
                self.keys.signer().clone(),
                policy.clone(),
                capsules.to_vec(),
                request_deadline,
            ));
        }

        // first threshold-many verified responses win; cfrags arrive in
        // arbitrary order and are treated as a set keyed by worker
        let mut verified: BTreeMap<NodeId, Vec<VerifiedCapsuleFrag>> = BTreeMap::new();
        let gather = async {
            while let Some(joined) = tasks.join_next().await {
                let result = joined.expect("Can join");
                pending.remove(&result.node_id);
                match result.outcome {
                    Ok(cfrags) => {
                        report.outcomes.push(WorkerOutcome {
                            node_id: result.node_id,
                            kind: WorkerOutcomeKind::Served,
                        });
                        verified.insert(result.node_id, cfrags);
                        if verified.len() == threshold {
                            break;
                        }
                    }
                    Err(kind) => {
                        report.outcomes.push(WorkerOutcome {
                            node_id: result.node_id,
                            kind,
                        });
                    }
                }
            }
        };
        let timed_out = tokio::time::timeout(deadline, gather).await.is_err();

        // cancel whatever is still in flight, either because the threshold
        // is met or because the deadline has passed
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        for node_id in pending {
            tracing::debug!("cancelled outstanding request to {node_id}");
            report.outcomes.push(WorkerOutcome {
                node_id,
                kind: WorkerOutcomeKind::Cancelled,
            });
        }

        if verified.len() < threshold {
            tracing::debug!(
                timed_out,
                verified = verified.len(),
                "threshold not met:\n{report}"
            );
            return Err(RetrieveError::ThresholdNotMet {
                verified: verified.len(),
                needed: threshold,
                report,
            });
        }

        // combine: per capsule, one cfrag from each winning worker
        let winners: Vec<Vec<VerifiedCapsuleFrag>> = verified.into_values().collect();
        let decryption_sk = self.keys.decryption_sk().clone();
        let payload_pk = policy.encrypted_payload_pk.clone();
        let capsules = capsules.to_vec();
        let ciphertexts = ciphertexts.to_vec();
        let plaintexts = tokio::task::spawn_blocking(move || {
            capsules
                .iter()
                .zip(&ciphertexts)
                .enumerate()
                .map(|(index, (capsule, ciphertext))| {
                    let cfrags: Vec<VerifiedCapsuleFrag> = winners
                        .iter()
                        .map(|per_worker| per_worker[index].clone())
                        .collect();
                    tpre_core::decrypt_reencrypted(
                        &decryption_sk,
                        &payload_pk,
                        capsule,
                        threshold,
                        cfrags,
                        ciphertext,
                    )
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .expect("decryption does not panic")?;

        tracing::info!(served = report.served().len(), "retrieved {} payloads", plaintexts.len());
        Ok(RetrieveOutcome { plaintexts, report })
    }
}

/// One worker leg: request, echo checks, proof verification.
async fn worker_task(
    client: Arc<WorkerApiClient>,
    worker: NodeMetadata,
    request: ReencryptionRequest,
    signer: umbral_pre::Signer,
    policy: Policy,
    capsules: Vec<Capsule>,
    deadline: Duration,
) -> WorkerResult {
    let node_id = worker.node_id;
    let response = match client.reencrypt(&worker, &request, &signer, deadline).await {
        Ok(response) => response,
        Err(TransportError::Rejected {
            code, retriable, ..
        }) => {
            return WorkerResult {
                node_id,
                outcome: Err(WorkerOutcomeKind::Rejected { code, retriable }),
            };
        }
        Err(err) => {
            return WorkerResult {
                node_id,
                outcome: Err(WorkerOutcomeKind::Unreachable(err.to_string())),
            };
        }
    };

    // proofs are verified locally before a response counts; the cost is
    // moved off the cooperative scheduler
    let verified = tokio::task::spawn_blocking(move || {
        response
            .cfrags
            .into_iter()
            .zip(&capsules)
            .map(|(cfrag, capsule)| {
                tpre_core::verify_cfrag(
                    cfrag,
                    capsule,
                    &policy.delegator_verifying_pk,
                    &policy.encrypted_payload_pk,
                    &policy.retriever_decryption_pk,
                )
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .expect("verification does not panic");

    match verified {
        Ok(cfrags) => WorkerResult {
            node_id,
            outcome: Ok(cfrags),
        },
        Err(err) => WorkerResult {
            node_id,
            outcome: Err(WorkerOutcomeKind::InvalidCfrags(err.to_string())),
        },
    }
}
