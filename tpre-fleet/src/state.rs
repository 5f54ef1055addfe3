//! Fleet-state snapshots and the store that publishes them.
//!
//! A [`FleetSnapshot`] is immutable once built. The learning loop computes
//! the next snapshot with [`FleetSnapshot::merge`] (a pure function, so the
//! merge semantics are unit-testable without any I/O) and installs it into
//! the [`FleetStateStore`]; readers clone an `Arc` and never observe a
//! half-applied round.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use parking_lot::RwLock;
use rand::Rng;
use rand::SeedableRng as _;
use rand::seq::SliceRandom as _;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tpre_types::chain::OracleSnapshot;
use tpre_types::crypto::NodeMetadata;
use tpre_types::{FleetChecksum, NodeId, Timestamp, blake2b_truncated};

use crate::metrics::{
    METRICS_ID_FLEET_KNOWN_NODES, METRICS_ID_FLEET_QUARANTINED, METRICS_ID_FLEET_VERIFIED_NODES,
};

/// Number of previous checksums retained as the fleet-state witness.
pub const CHECKSUM_WITNESS_LEN: usize = 10;

/// Liveness tier of a known identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shard {
    /// Seen recently and attested by the oracle.
    Verified,
    /// Seen recently, but the oracle could not confirm authorization
    /// (stale or unavailable at verification time).
    Unverified,
    /// Not seen for longer than the staleness window; probed sparingly.
    Cold,
}

/// One known worker identity with its liveness bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerEntry {
    /// The self-signed identity record.
    pub metadata: NodeMetadata,
    /// Last time this identity was observed alive. Never decreases.
    pub last_seen: Timestamp,
    /// Last time we attempted to contact this identity.
    pub last_probed: Timestamp,
    /// Current liveness tier.
    pub shard: Shard,
    /// Set when the oracle was stale at verification time.
    pub possibly_stale: bool,
}

impl WorkerEntry {
    /// Whether this entry may be offered to routing and sampling.
    pub fn is_routable(&self) -> bool {
        matches!(self.shard, Shard::Verified | Shard::Unverified)
    }
}

/// An identity held back during a key-rotation conflict.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// The conflicting identity.
    pub metadata: NodeMetadata,
    /// When the conflict was detected.
    pub since: Timestamp,
}

/// Knobs governing shard transitions, eviction and quarantine.
#[derive(Clone, Debug)]
pub struct LivenessPolicy {
    /// Entries unseen for this long move to the cold shard.
    pub stale_after: Duration,
    /// Cold entries are probed at most once per this interval.
    pub cold_retry_interval: Duration,
    /// Entries unseen for this long are deleted unless the oracle
    /// re-attests them.
    pub evict_after: Duration,
    /// How long a key-rotation conflict is held before the oracle's verdict
    /// is applied.
    pub quarantine_window: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(6 * 3600),
            cold_retry_interval: Duration::from_secs(3600),
            evict_after: Duration::from_secs(7 * 24 * 3600),
            quarantine_window: Duration::from_secs(24 * 3600),
        }
    }
}

/// Counters describing what one merge changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Identities added.
    pub added: usize,
    /// Identities whose `last_seen` advanced.
    pub refreshed: usize,
    /// Identities moved into quarantine this round.
    pub quarantined: usize,
    /// Identities deleted by the eviction sweep.
    pub evicted: usize,
    /// Observations dropped because the oracle knows the operator is not
    /// authorized.
    pub rejected: usize,
}

/// An immutable view of the known fleet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FleetSnapshot {
    entries: BTreeMap<NodeId, WorkerEntry>,
    quarantine: BTreeMap<NodeId, QuarantineRecord>,
    checksum: FleetChecksum,
}

impl Default for FleetSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl FleetSnapshot {
    /// An empty snapshot.
    pub fn empty() -> Self {
        Self::from_parts(BTreeMap::new(), BTreeMap::new())
    }

    /// Rebuilds a snapshot from persisted parts.
    pub fn from_parts(
        entries: BTreeMap<NodeId, WorkerEntry>,
        quarantine: BTreeMap<NodeId, QuarantineRecord>,
    ) -> Self {
        let mut snapshot = Self {
            entries,
            quarantine,
            checksum: FleetChecksum::from_bytes([0u8; 32]),
        };
        snapshot.checksum = snapshot.compute_checksum();
        snapshot
    }

    /// The derived checksum over the sorted `(node_id, last_seen)` list.
    pub fn checksum(&self) -> FleetChecksum {
        self.checksum
    }

    /// Lookup by node identifier.
    pub fn by_node_id(&self, id: &NodeId) -> Option<&WorkerEntry> {
        self.entries.get(id)
    }

    /// Whether the identity is currently held in quarantine.
    pub fn is_quarantined(&self, id: &NodeId) -> bool {
        self.quarantine.contains_key(id)
    }

    /// All entries, ordered by node id.
    pub fn entries(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.entries.values()
    }

    /// The quarantine records, ordered by node id.
    pub fn quarantine(&self) -> impl Iterator<Item = &QuarantineRecord> {
        self.quarantine.values()
    }

    /// Total number of known identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no identities are known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of identities in the verified shard.
    pub fn verified_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.shard == Shard::Verified)
            .count()
    }

    /// Deterministic sample of up to `n` identities passing `predicate`.
    ///
    /// Candidates are taken in node-id order and shuffled with a ChaCha
    /// stream seeded by `seed`, so the same snapshot, predicate and seed
    /// always select the same workers — grants are reproducible and
    /// diagnosable.
    pub fn sample<P>(&self, n: usize, predicate: P, seed: [u8; 32]) -> Vec<NodeMetadata>
    where
        P: Fn(&WorkerEntry) -> bool,
    {
        let mut candidates: Vec<&WorkerEntry> =
            self.entries.values().filter(|entry| predicate(entry)).collect();
        let mut rng = ChaCha20Rng::from_seed(seed);
        candidates.shuffle(&mut rng);
        candidates
            .into_iter()
            .take(n)
            .map(|entry| entry.metadata.clone())
            .collect()
    }

    /// Picks up to `k` random peers for one learning round.
    ///
    /// Excludes `self_id` and quarantined identities. Cold entries are only
    /// eligible once their retry interval has elapsed since the last probe.
    pub fn gossip_targets<R: Rng>(
        &self,
        k: usize,
        self_id: Option<&NodeId>,
        policy: &LivenessPolicy,
        now: Timestamp,
        rng: &mut R,
    ) -> Vec<NodeMetadata> {
        let eligible: Vec<&WorkerEntry> = self
            .entries
            .values()
            .filter(|entry| Some(&entry.metadata.node_id) != self_id)
            .filter(|entry| match entry.shard {
                Shard::Verified | Shard::Unverified => true,
                Shard::Cold => {
                    now.seconds_since(entry.last_probed) >= policy.cold_retry_interval.as_secs()
                }
            })
            .collect();
        eligible
            .choose_multiple(rng, k)
            .map(|entry| entry.metadata.clone())
            .collect()
    }

    fn compute_checksum(&self) -> FleetChecksum {
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(self.entries.len());
        for (node_id, entry) in &self.entries {
            let mut part = Vec::with_capacity(28);
            part.extend_from_slice(node_id.as_bytes());
            part.extend_from_slice(&entry.last_seen.as_secs().to_be_bytes());
            parts.push(part);
        }
        let part_refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        FleetChecksum::from_bytes(blake2b_truncated::<32>(&part_refs))
    }

    /// Computes the successor snapshot for one learning round.
    ///
    /// `observed` carries validated identities (signature, domain and
    /// version checks already done by the caller) with the time each was
    /// seen; `probed` marks the identities contacted this round; `oracle`
    /// is the last good registry view, `None` when no snapshot exists yet;
    /// `oracle_fresh` tells whether that view is within the staleness bound.
    ///
    /// The merge is total: it applies observations, resolves rotation
    /// conflicts, sweeps shards and quarantine, evicts, and recomputes the
    /// checksum. Timestamps never decrease.
    pub fn merge(
        &self,
        observed: Vec<(NodeMetadata, Timestamp)>,
        probed: &[NodeId],
        oracle: Option<&OracleSnapshot>,
        oracle_fresh: bool,
        policy: &LivenessPolicy,
        now: Timestamp,
        self_id: Option<&NodeId>,
    ) -> (FleetSnapshot, MergeSummary) {
        let mut entries = self.entries.clone();
        let mut quarantine = self.quarantine.clone();
        let mut summary = MergeSummary::default();

        let mut operators: HashMap<Address, NodeId> = entries
            .values()
            .map(|entry| (entry.metadata.operator_address, entry.metadata.node_id))
            .collect();

        for (metadata, seen_at) in observed {
            let node_id = metadata.node_id;
            let operator_address = metadata.operator_address;
            if Some(&node_id) == self_id {
                continue;
            }

            // a known operator presenting a new signing key is a conflict:
            // hold both identities until the oracle's verdict
            if let Some(existing_id) = operators.get(&metadata.operator_address).copied()
                && existing_id != node_id
            {
                tracing::warn!(
                    operator = %metadata.operator_address,
                    old = %existing_id,
                    new = %node_id,
                    "signing key rotation detected, quarantining both identities"
                );
                if let Some(existing) = entries.remove(&existing_id) {
                    quarantine.insert(
                        existing_id,
                        QuarantineRecord {
                            metadata: existing.metadata,
                            since: now,
                        },
                    );
                    summary.quarantined += 1;
                }
                quarantine.insert(
                    node_id,
                    QuarantineRecord {
                        metadata: metadata.clone(),
                        since: now,
                    },
                );
                summary.quarantined += 1;
                operators.remove(&metadata.operator_address);
                continue;
            }

            if quarantine.contains_key(&node_id) {
                // quarantined identities re-enter through the sweep below,
                // not through gossip
                continue;
            }

            let attested = oracle.map(|snapshot| {
                snapshot
                    .lookup(&operator_address)
                    .is_some_and(|authorization| {
                        authorization.verifying_pk == metadata.verifying_pk
                    })
            });

            let mut reject_existing = false;
            match entries.get_mut(&node_id) {
                Some(entry) => {
                    if seen_at > entry.last_seen {
                        entry.last_seen = seen_at;
                        summary.refreshed += 1;
                    }
                    if metadata.valid_from >= entry.metadata.valid_from {
                        entry.metadata = metadata.clone();
                    }
                    if oracle_fresh {
                        match attested {
                            Some(true) => {
                                entry.shard = Shard::Verified;
                                entry.possibly_stale = false;
                            }
                            Some(false) | None => reject_existing = true,
                        }
                    } else if entry.shard == Shard::Cold {
                        entry.shard = Shard::Unverified;
                        entry.possibly_stale = true;
                    }
                }
                None => {
                    let (shard, possibly_stale) = match (oracle_fresh, attested) {
                        (true, Some(true)) => (Shard::Verified, false),
                        (true, Some(false)) | (true, None) => {
                            // fresh oracle that does not attest the operator:
                            // the identity is not accepted
                            summary.rejected += 1;
                            continue;
                        }
                        (false, _) => (Shard::Unverified, true),
                    };
                    operators.insert(operator_address, node_id);
                    entries.insert(
                        node_id,
                        WorkerEntry {
                            metadata,
                            last_seen: seen_at,
                            last_probed: Timestamp::from_secs(0),
                            shard,
                            possibly_stale,
                        },
                    );
                    summary.added += 1;
                }
            }
            if reject_existing {
                entries.remove(&node_id);
                operators.remove(&operator_address);
                summary.rejected += 1;
            }
        }

        for node_id in probed {
            if let Some(entry) = entries.get_mut(node_id) {
                entry.last_probed = now;
            }
        }

        // shard and eviction sweep
        let stale_cutoff = policy.stale_after.as_secs();
        let evict_cutoff = policy.evict_after.as_secs();
        let mut evict: Vec<NodeId> = Vec::new();
        for (node_id, entry) in entries.iter_mut() {
            let unseen_for = now.seconds_since(entry.last_seen);
            if unseen_for >= evict_cutoff {
                let reattested = oracle
                    .filter(|_| oracle_fresh)
                    .is_some_and(|snapshot| snapshot.is_authorized(&entry.metadata.operator_address));
                if reattested {
                    entry.shard = Shard::Cold;
                } else {
                    evict.push(*node_id);
                }
            } else if unseen_for >= stale_cutoff {
                if entry.shard != Shard::Cold {
                    entry.shard = Shard::Cold;
                }
            }
        }
        for node_id in evict {
            if let Some(entry) = entries.remove(&node_id) {
                operators.remove(&entry.metadata.operator_address);
                summary.evicted += 1;
            }
        }

        // quarantine sweep: after the window the oracle is authoritative,
        // and without a fresh oracle the conflict stays unresolved
        if oracle_fresh && let Some(snapshot) = oracle {
            let window = policy.quarantine_window.as_secs();
            let expired: Vec<NodeId> = quarantine
                .iter()
                .filter(|(_, record)| now.seconds_since(record.since) >= window)
                .map(|(node_id, _)| *node_id)
                .collect();
            for node_id in expired {
                let Some(record) = quarantine.remove(&node_id) else {
                    continue;
                };
                let attested = snapshot
                    .lookup(&record.metadata.operator_address)
                    .is_some_and(|authorization| {
                        authorization.verifying_pk == record.metadata.verifying_pk
                    });
                if attested {
                    operators.insert(record.metadata.operator_address, node_id);
                    entries.insert(
                        node_id,
                        WorkerEntry {
                            metadata: record.metadata,
                            last_seen: now,
                            last_probed: Timestamp::from_secs(0),
                            shard: Shard::Verified,
                            possibly_stale: false,
                        },
                    );
                } else {
                    tracing::info!(node = %node_id, "dropping quarantined identity, oracle did not attest");
                }
            }
        }

        let mut next = FleetSnapshot {
            entries,
            quarantine,
            checksum: FleetChecksum::from_bytes([0u8; 32]),
        };
        next.checksum = next.compute_checksum();
        (next, summary)
    }
}

struct StoreInner {
    current: Arc<FleetSnapshot>,
    previous: Arc<FleetSnapshot>,
    witness: VecDeque<FleetChecksum>,
}

/// Shared fleet-state store: one writer (the learning loop), many readers.
///
/// Readers take a snapshot pointer; the writer publishes by swapping the
/// pointer under a short write lock, so a reader holds a consistent view for
/// as long as it keeps the `Arc` alive. The current and previous snapshots
/// are both retained to reason about churn between rounds.
#[derive(Clone)]
pub struct FleetStateStore(Arc<RwLock<StoreInner>>);

impl Default for FleetStateStore {
    fn default() -> Self {
        Self::new(FleetSnapshot::empty())
    }
}

impl FleetStateStore {
    /// Creates a store with `initial` as both current and previous state.
    pub fn new(initial: FleetSnapshot) -> Self {
        let initial = Arc::new(initial);
        ::metrics::gauge!(METRICS_ID_FLEET_KNOWN_NODES).set(initial.len() as f64);
        Self(Arc::new(RwLock::new(StoreInner {
            previous: Arc::clone(&initial),
            current: initial,
            witness: VecDeque::with_capacity(CHECKSUM_WITNESS_LEN),
        })))
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        Arc::clone(&self.0.read().current)
    }

    /// The snapshot that was current before the last install.
    pub fn previous(&self) -> Arc<FleetSnapshot> {
        Arc::clone(&self.0.read().previous)
    }

    /// The recent-checksum witness, newest first.
    pub fn witness(&self) -> Vec<FleetChecksum> {
        self.0.read().witness.iter().copied().collect()
    }

    /// Publishes `next` as the current snapshot.
    ///
    /// The displaced snapshot becomes `previous` and its checksum is pushed
    /// onto the witness ring buffer.
    pub fn install(&self, next: FleetSnapshot) {
        ::metrics::gauge!(METRICS_ID_FLEET_KNOWN_NODES).set(next.len() as f64);
        ::metrics::gauge!(METRICS_ID_FLEET_VERIFIED_NODES).set(next.verified_count() as f64);
        ::metrics::gauge!(METRICS_ID_FLEET_QUARANTINED).set(next.quarantine.len() as f64);
        let mut inner = self.0.write();
        let displaced = std::mem::replace(&mut inner.current, Arc::new(next));
        if inner.witness.len() == CHECKSUM_WITNESS_LEN {
            inner.witness.pop_back();
        }
        inner.witness.push_front(displaced.checksum());
        inner.previous = displaced;
    }
}
