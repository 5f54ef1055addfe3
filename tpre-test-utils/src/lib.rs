//! Shared fixtures for the end-to-end test suites.
//!
//! Workers under test are real axum servers bound to ephemeral ports; the
//! oracle is an in-memory registry whose availability the tests flip at
//! will; role keys derive from fixed seeds so node identities are stable
//! across runs. The [`RogueWorker`] is a dishonest node used to exercise
//! the retriever's proof verification: it signs its responses correctly but
//! re-encrypts with fragments from a delegation it invented.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::Address;
use async_trait::async_trait;
use axum::{Router, body::Bytes, response::IntoResponse, routing::post};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tpre_core::keys::{DelegatorKeys, RetrieverKeys, WorkerKeys};
use tpre_fleet::state::{FleetSnapshot, FleetStateStore, LivenessPolicy};
use tpre_types::api::{
    Condition, ConditionContext, ConditionError, ConditionEvaluator, ConditionEvaluatorService,
    EnactmentReceipt, EnactmentRequest, ReencryptionRequest, ReencryptionResponse,
};
use tpre_types::chain::{
    AuthorizationOracle, OracleError, OracleService, OracleSnapshot, WorkerAuthorization,
};
use tpre_types::crypto::{NodeMetadata, NodeMetadataPayload};
use tpre_types::wire::{Envelope, MessageKind};
use tpre_types::{Domain, Epoch, Timestamp};
use tpre_worker::config::{Environment, WorkerConfig};
use tpre_worker::services::keystore::{SecretStore, SecretStoreService};
use tpre_worker::services::kfrag_store::StoredKfrag;
use tpre_types::Hrac;
use tpre_worker::{StartedServices, WorkerServiceBuilder};
use zeroize::Zeroizing;

/// Domain every fixture lives in.
pub const TEST_DOMAIN: &str = "lynx";

/// Upper bound for polling loops in tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Version requirement matching the workspace crates.
pub fn test_version_req() -> semver::VersionReq {
    "^0.3".parse().expect("valid requirement")
}

/// The fixture domain.
pub fn test_domain() -> Domain {
    Domain::new(TEST_DOMAIN)
}

/// Deterministic delegator keys for `tag`.
pub fn delegator_keys(tag: &[u8]) -> DelegatorKeys {
    DelegatorKeys::from_seed(&[b"delegator:", tag].concat())
}

/// Deterministic retriever keys for `tag`.
pub fn retriever_keys(tag: &[u8]) -> RetrieverKeys {
    RetrieverKeys::from_seed(&[b"retriever:", tag].concat())
}

/// In-memory authorization oracle with switchable availability.
pub struct TestOracle {
    available: AtomicBool,
    epoch: AtomicU64,
    authorized: Mutex<HashMap<Address, WorkerAuthorization>>,
}

impl Default for TestOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl TestOracle {
    /// Creates an available oracle with an empty registry.
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            epoch: AtomicU64::new(1),
            authorized: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `metadata`'s operator with its current signing key.
    pub fn authorize(&self, metadata: &NodeMetadata) {
        self.authorized.lock().insert(
            metadata.operator_address,
            WorkerAuthorization {
                operator_address: metadata.operator_address,
                verifying_pk: metadata.verifying_pk.clone(),
                stake: 40_000,
                bonded_since: Timestamp::from_secs(1_600_000_000),
            },
        );
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes an operator from the registry.
    pub fn deauthorize(&self, operator: &Address) {
        self.authorized.lock().remove(operator);
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    /// Switches the oracle between reachable and unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), OracleError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(OracleError::Unavailable("test oracle offline".to_owned()))
        }
    }
}

#[async_trait]
impl AuthorizationOracle for TestOracle {
    async fn is_authorized(&self, operator: Address, _at: Timestamp) -> Result<bool, OracleError> {
        self.check_available()?;
        Ok(self.authorized.lock().contains_key(&operator))
    }

    async fn lookup_worker(
        &self,
        operator: Address,
    ) -> Result<Option<WorkerAuthorization>, OracleError> {
        self.check_available()?;
        Ok(self.authorized.lock().get(&operator).cloned())
    }

    async fn list_authorized(&self, _domain: &Domain) -> Result<Vec<Address>, OracleError> {
        self.check_available()?;
        Ok(self.authorized.lock().keys().copied().collect())
    }

    async fn current_epoch(&self) -> Result<Epoch, OracleError> {
        self.check_available()?;
        Ok(Epoch::new(self.epoch.load(Ordering::Relaxed)))
    }
}

/// Condition evaluator for tests: the literal `"deny"` is not met, the
/// literal `"error"` fails evaluation, everything else passes.
pub struct TextConditionEvaluator;

#[async_trait]
impl ConditionEvaluator for TextConditionEvaluator {
    async fn evaluate(
        &self,
        condition: &Condition,
        _context: &ConditionContext,
    ) -> Result<(), ConditionError> {
        match condition.as_str() {
            "deny" => Err(ConditionError::NotMet("denied by fixture".to_owned())),
            "error" => Err(ConditionError::Evaluation("fixture blew up".to_owned())),
            _ => Ok(()),
        }
    }
}

/// In-memory secret store with a deterministic worker seed.
pub struct MemorySecretStore {
    seed: Vec<u8>,
    kfrags: Mutex<HashMap<Hrac, StoredKfrag>>,
}

impl MemorySecretStore {
    /// Creates a store whose worker seed derives from `tag`.
    pub fn new(tag: &[u8]) -> Self {
        let mut seed = vec![0u8; 64];
        let len = tag.len().min(64);
        seed[..len].copy_from_slice(&tag[..len]);
        Self {
            seed,
            kfrags: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn load_or_create_worker_seed(&self) -> eyre::Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(self.seed.clone()))
    }

    async fn load_kfrags(&self) -> eyre::Result<HashMap<Hrac, StoredKfrag>> {
        // StoredKfrag is not Clone (it carries key material); serialize
        // through CBOR to hand out an owned copy
        let mut bytes = Vec::new();
        ciborium_into(&*self.kfrags.lock(), &mut bytes);
        Ok(ciborium_from(&bytes))
    }

    async fn save_kfrags(&self, kfrags: &HashMap<Hrac, StoredKfrag>) -> eyre::Result<()> {
        let mut bytes = Vec::new();
        ciborium_into(kfrags, &mut bytes);
        *self.kfrags.lock() = ciborium_from(&bytes);
        Ok(())
    }
}

fn ciborium_into<T: serde::Serialize>(value: &T, bytes: &mut Vec<u8>) {
    ciborium::into_writer(value, bytes).expect("fixture values serialize")
}

fn ciborium_from<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> T {
    ciborium::from_reader(bytes).expect("fixture values deserialize")
}

/// Options for [`TestWorker::start_with`].
pub struct TestWorkerOptions {
    /// Distinguishes key seeds and operator addresses between workers.
    pub index: u8,
    /// The oracle backing the worker.
    pub oracle: OracleService,
    /// The condition evaluator the worker consults.
    pub evaluator: ConditionEvaluatorService,
    /// Addresses the learning loop contacts while its view is empty.
    pub seed_peers: Vec<String>,
    /// Pause between learning rounds.
    pub learning_interval: Duration,
    /// Inflight bound for the re-encrypt endpoint.
    pub max_inflight: usize,
    /// Per-policy request budget per minute.
    pub policy_rate_limit: u64,
    /// Oldest oracle snapshot the worker serves from.
    pub max_snapshot_age: Duration,
}

impl TestWorkerOptions {
    /// Sensible defaults: quiet learning loop, generous limits.
    pub fn new(index: u8, oracle: OracleService, evaluator: ConditionEvaluatorService) -> Self {
        Self {
            index,
            oracle,
            evaluator,
            seed_peers: Vec::new(),
            learning_interval: Duration::from_secs(3600),
            max_inflight: 64,
            policy_rate_limit: 10_000,
            max_snapshot_age: Duration::from_secs(3600),
        }
    }
}

/// A real worker node listening on an ephemeral port.
pub struct TestWorker {
    /// The worker's signed identity.
    pub metadata: NodeMetadata,
    /// Base URL of the worker's API.
    pub base_url: String,
    /// Cancelling this stops the server and all background tasks.
    pub cancellation_token: CancellationToken,
}

impl TestWorker {
    /// Starts a worker with default options.
    pub async fn start(
        index: u8,
        oracle: OracleService,
        evaluator: ConditionEvaluatorService,
    ) -> eyre::Result<Self> {
        Self::start_with(TestWorkerOptions::new(index, oracle, evaluator)).await
    }

    /// Starts a worker with the given options.
    pub async fn start_with(options: TestWorkerOptions) -> eyre::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let scratch = std::env::temp_dir().join(format!(
            "tpre-test-worker-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&scratch).await?;

        let config = WorkerConfig {
            environment: Environment::Dev,
            public_address: base_url.clone(),
            domain: test_domain(),
            operator_address: Address::repeat_byte(0x50 + options.index),
            version_req: test_version_req(),
            identity_lifetime: Duration::from_secs(48 * 3600),
            learning_interval: options.learning_interval,
            learning_jitter: Duration::from_millis(50),
            peer_sample: 3,
            exchange_timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(6 * 3600),
            cold_retry_interval: Duration::from_secs(3600),
            evict_after: Duration::from_secs(7 * 24 * 3600),
            quarantine_window: Duration::from_secs(24 * 3600),
            seed_peers: options.seed_peers,
            oracle_refresh_interval: Duration::from_millis(200),
            max_snapshot_age: options.max_snapshot_age,
            max_inflight: options.max_inflight,
            policy_rate_limit: options.policy_rate_limit,
            rate_window: Duration::from_secs(60),
            known_nodes_path: scratch.join("known-nodes.cbor"),
            keystore_dir: scratch.join("keystore"),
            keystore_passphrase: "test-passphrase".to_owned().into(),
        };

        let cancellation_token = CancellationToken::new();
        let secret_store: SecretStoreService =
            Arc::new(MemorySecretStore::new(&[b'w', options.index]));
        let builder = WorkerServiceBuilder::init(
            config,
            secret_store,
            options.oracle,
            options.evaluator,
            StartedServices::new(),
            cancellation_token.clone(),
        )
        .await?;
        let metadata = builder.node_metadata().clone();
        let (router, _learning) = builder.build();

        tokio::spawn({
            let token = cancellation_token.clone();
            async move {
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await;
                if let Err(err) = result {
                    tracing::error!("test worker server failed: {err}");
                }
            }
        });

        Ok(Self {
            metadata,
            base_url,
            cancellation_token,
        })
    }

    /// Stops the worker's server and background tasks.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

/// A fleet view in which `metadatas` have already been learned.
///
/// With `oracle_fresh` the entries land in the verified shard (the oracle
/// must attest them); without it they land unverified and carry the
/// possibly-stale annotation, as after learning through a stale oracle.
pub async fn learned_fleet(
    metadatas: Vec<NodeMetadata>,
    oracle: &dyn AuthorizationOracle,
    oracle_fresh: bool,
) -> FleetStateStore {
    let now = Timestamp::now();
    let snapshot: Option<OracleSnapshot> = if oracle_fresh {
        Some(
            oracle
                .snapshot(&test_domain())
                .await
                .expect("fixture oracle reachable"),
        )
    } else {
        None
    };
    let observed = metadatas.into_iter().map(|m| (m, now)).collect();
    let (next, _) = FleetSnapshot::empty().merge(
        observed,
        &[],
        snapshot.as_ref(),
        oracle_fresh,
        &LivenessPolicy::default(),
        now,
        None,
    );
    FleetStateStore::new(next)
}

struct RogueState {
    keys: WorkerKeys,
    node_id: tpre_types::NodeId,
}

/// A dishonest worker: it participates in enactment and answers
/// re-encryption requests with properly signed envelopes, but the capsule
/// fragments inside come from a delegation it made up, so their proofs fail
/// verification at the retriever.
pub struct RogueWorker {
    /// The rogue's (validly signed) identity.
    pub metadata: NodeMetadata,
    /// Base URL of the rogue's API.
    pub base_url: String,
    cancellation_token: CancellationToken,
}

impl RogueWorker {
    /// Starts a rogue worker on an ephemeral port.
    pub async fn start(index: u8) -> eyre::Result<Self> {
        let keys = WorkerKeys::from_seed(&[b"rogue:", &[index][..]].concat());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);

        let now = Timestamp::now();
        let metadata = NodeMetadataPayload {
            decryption_pk: keys.decryption_pk().clone(),
            network_address: base_url.clone(),
            operator_address: Address::repeat_byte(0xa0 + index),
            domain: test_domain(),
            protocol_version: env!("CARGO_PKG_VERSION").to_owned(),
            host_certificate: None,
            valid_from: now,
            expires_at: now.saturating_add(Duration::from_secs(48 * 3600)),
        }
        .sign(keys.signer());
        let state = Arc::new(RogueState {
            node_id: metadata.node_id,
            keys,
        });

        let enact_state = Arc::clone(&state);
        let reencrypt_state = Arc::clone(&state);
        let router = Router::new()
            .route(
                "/api/v1/enact",
                post(move |body| rogue_enact(enact_state, body)),
            )
            .route(
                "/api/v1/reencrypt",
                post(move |body| rogue_reencrypt(reencrypt_state, body)),
            );

        let cancellation_token = CancellationToken::new();
        tokio::spawn({
            let token = cancellation_token.clone();
            async move {
                let _ = axum::serve(listener, router)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await;
            }
        });

        Ok(Self {
            metadata,
            base_url,
            cancellation_token,
        })
    }

    /// Stops the rogue's server.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

fn cbor_response(envelope: &Envelope) -> axum::response::Response {
    (
        [(http::header::CONTENT_TYPE, "application/cbor")],
        envelope.encode(),
    )
        .into_response()
}

async fn rogue_enact(state: Arc<RogueState>, body: Bytes) -> axum::response::Response {
    let envelope = Envelope::decode(&body).expect("test request is well-formed");
    let request: EnactmentRequest = envelope
        .open(MessageKind::EnactmentRequest)
        .expect("test request opens");
    // the rogue acknowledges without even opening the fragment
    let receipt = EnactmentReceipt {
        request_id: request.request_id,
        hrac: request.policy.hrac,
        node_id: state.node_id,
        kfrag_digest: request.encrypted_kfrag.digest(),
    };
    let envelope =
        Envelope::seal_signed(MessageKind::EnactmentReceipt, &receipt, state.keys.signer());
    cbor_response(&envelope)
}

async fn rogue_reencrypt(state: Arc<RogueState>, body: Bytes) -> axum::response::Response {
    let envelope = Envelope::decode(&body).expect("test request is well-formed");
    let request: ReencryptionRequest = envelope
        .open(MessageKind::ReencryptionRequest)
        .expect("test request opens");

    // fragments from a delegation the rogue invented: structurally fine,
    // cryptographically unrelated to the policy
    let fake_delegator = DelegatorKeys::from_seed(b"rogue fake delegation");
    let kfrags = tpre_core::generate_kfrags(
        fake_delegator.delegating_sk(),
        &request.retriever_decryption_pk,
        fake_delegator.signer(),
        1,
        1,
        true,
        true,
    )
    .expect("valid threshold");
    let cfrags = request
        .capsules
        .iter()
        .map(|capsule| tpre_core::reencrypt(capsule, kfrags[0].clone()).unverify())
        .collect();

    let response = ReencryptionResponse {
        request_id: request.request_id,
        hrac: request.hrac,
        node_id: state.node_id,
        cfrags,
    };
    let envelope = Envelope::seal_signed(
        MessageKind::ReencryptionResponse,
        &response,
        state.keys.signer(),
    );
    cbor_response(&envelope)
}
