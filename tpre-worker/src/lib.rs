#![deny(missing_docs)]
//! This crate provides the core functionality of a tpre worker node.
//!
//! A worker holds key fragments delivered by delegators and produces
//! verifiable capsule fragments for authorized retrievers. The main entry
//! point is the [`WorkerServiceBuilder`]: it loads the worker's sealed key
//! material, takes an initial authorization-oracle snapshot, restores the
//! known-nodes store, spawns the learning loop and the oracle refresh task,
//! and returns an `axum::Router` to be served by the hosting application
//! together with a `JoinHandle` for the learning loop.
//!
//! If internal services of the worker encounter an unrecoverable error, the
//! provided `CancellationToken` is cancelled, allowing the hosting
//! application to handle the shutdown process gracefully. The token can
//! also be cancelled externally to stop the worker's background tasks; the
//! host should await the returned `JoinHandle` afterwards so all tasks are
//! properly terminated before the process exits.
//!
//! Two integration points are deliberately pluggable:
//!
//! * the [`SecretStore`] persisting key material (a file-based
//!   implementation is bundled, hosted secret managers plug in through the
//!   trait), and
//! * the [`tpre_types::api::ConditionEvaluator`] deciding per-capsule
//!   access conditions, which is entirely integrator-defined.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use eyre::Context as _;
use parking_lot::Mutex;
use semver::VersionReq;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tpre_core::keys::WorkerKeys;
use tpre_fleet::learning::{LearnerConfig, LearningTaskArgs, learning_task};
use tpre_fleet::oracle_cache::{OracleCache, OracleRefreshTaskArgs, oracle_refresh_task};
use tpre_fleet::persistence::load_known_nodes;
use tpre_fleet::state::{FleetStateStore, LivenessPolicy};
use tpre_fleet::transport::HttpMetadataExchange;
use tpre_types::Timestamp;
use tpre_types::api::ConditionEvaluatorService;
use tpre_types::chain::OracleService;
use tpre_types::crypto::{NodeMetadata, NodeMetadataPayload};

use crate::config::WorkerConfig;
use crate::services::keystore::SecretStoreService;
use crate::services::kfrag_store::KfragStore;
use crate::services::rate::PolicyUsage;

pub(crate) mod api;
pub mod config;
pub mod metrics;
pub mod services;

pub use services::keystore::{FileKeystore, SecretStore};

/// How often the worker checks for expired policies to delete.
const POLICY_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Tracks the readiness of the worker's background services.
///
/// Each service registers a flag with [`StartedServices::new_service`] and
/// flips it once it is operational; the health endpoint reports ready when
/// every flag is set.
#[derive(Clone, Default)]
pub struct StartedServices(Arc<Mutex<Vec<Arc<AtomicBool>>>>);

impl StartedServices {
    /// Creates an empty readiness registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new service and returns its readiness flag.
    pub fn new_service(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.0.lock().push(Arc::clone(&flag));
        flag
    }

    /// Whether every registered service reported ready.
    pub fn all_started(&self) -> bool {
        self.0.lock().iter().all(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Resolves on ctrl-c; the default shutdown signal for worker binaries.
pub async fn default_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for shutdown signal: {err}");
    }
}

/// Everything the endpoint handlers need, threaded through explicitly so
/// tests can instantiate as many independent workers as they like.
pub(crate) struct WorkerContext {
    pub(crate) keys: WorkerKeys,
    pub(crate) metadata: NodeMetadata,
    pub(crate) version_req: VersionReq,
    pub(crate) kfrag_store: KfragStore,
    pub(crate) fleet: FleetStateStore,
    pub(crate) oracle_cache: OracleCache,
    pub(crate) evaluator: ConditionEvaluatorService,
    pub(crate) announcements: mpsc::Sender<NodeMetadata>,
    pub(crate) usage: PolicyUsage,
    pub(crate) inflight: Arc<Semaphore>,
    pub(crate) secret_store: SecretStoreService,
    pub(crate) started_at: Instant,
}

/// [`WorkerServiceBuilder`] to initialize a worker node.
pub struct WorkerServiceBuilder {
    root: Router,
    api: Router,
    learning: tokio::task::JoinHandle<Result<(), eyre::Error>>,
    context: Arc<WorkerContext>,
}

impl WorkerServiceBuilder {
    /// Initializes the worker service.
    ///
    /// This function sets up the components required for the node to
    /// operate. It performs the following steps:
    ///
    /// 1. Loads (or creates) the worker key seed from the secret store and
    ///    derives the signing and decryption keys.
    /// 2. Signs the worker's identity record.
    /// 3. Takes an initial authorization-oracle snapshot; unavailability
    ///    starts the node in degraded mode instead of failing.
    /// 4. Restores the known-nodes store and the enacted-policy store.
    /// 5. Spawns the learning loop, the oracle refresh task and the policy
    ///    expiry sweep, all wired to the cancellation token.
    /// 6. Sets up the axum-based REST API routes.
    pub async fn init(
        config: WorkerConfig,
        secret_store: SecretStoreService,
        oracle: OracleService,
        evaluator: ConditionEvaluatorService,
        started_services: StartedServices,
        cancellation_token: CancellationToken,
    ) -> eyre::Result<Self> {
        tracing::info!("loading worker key material..");
        let seed = secret_store
            .load_or_create_worker_seed()
            .await
            .context("while loading worker seed")?;
        let keys = WorkerKeys::from_seed(&seed);
        drop(seed);

        let now = Timestamp::now();
        let metadata = NodeMetadataPayload {
            decryption_pk: keys.decryption_pk().clone(),
            network_address: config.public_address.clone(),
            operator_address: config.operator_address,
            domain: config.domain.clone(),
            protocol_version: env!("CARGO_PKG_VERSION").to_owned(),
            host_certificate: None,
            valid_from: now,
            expires_at: now.saturating_add(config.identity_lifetime),
        }
        .sign(keys.signer());
        tracing::info!("we are node {}", metadata.node_id);

        let oracle_cache = OracleCache::new(oracle, config.domain.clone(), config.max_snapshot_age);
        tracing::info!("fetching initial oracle snapshot..");
        if let Err(err) = oracle_cache.refresh().await {
            tracing::warn!("initial oracle snapshot unavailable, starting degraded: {err}");
        }

        tracing::info!("loading known-nodes store..");
        let fleet = match load_known_nodes(&config.known_nodes_path).await {
            Ok(Some(snapshot)) => {
                tracing::info!("restored {} known identities", snapshot.len());
                FleetStateStore::new(snapshot)
            }
            Ok(None) => FleetStateStore::default(),
            Err(err) => {
                tracing::warn!("could not restore known-nodes store, starting empty: {err:?}");
                FleetStateStore::default()
            }
        };

        tracing::info!("loading enacted policies..");
        let kfrag_store = KfragStore::from_persistable(
            secret_store
                .load_kfrags()
                .await
                .context("while loading enacted policies")?,
        );
        tracing::info!("holding fragments for {} policies", kfrag_store.len());

        let own_version = semver::Version::parse(env!("CARGO_PKG_VERSION"))
            .context("while parsing own version")?;
        let (announcements_tx, announcements_rx) = mpsc::channel(32);

        tracing::info!("spawning learning loop..");
        let learning = tokio::spawn(learning_task(LearningTaskArgs {
            store: fleet.clone(),
            oracle_cache: oracle_cache.clone(),
            exchange: Arc::new(HttpMetadataExchange::new(own_version)),
            own_metadata: Some(metadata.clone()),
            domain: config.domain.clone(),
            config: LearnerConfig {
                interval: config.learning_interval,
                jitter: config.learning_jitter,
                peer_sample: config.peer_sample,
                exchange_timeout: config.exchange_timeout,
                accepted_versions: config.version_req.clone(),
                seed_peers: config.seed_peers.clone(),
                liveness: LivenessPolicy {
                    stale_after: config.stale_after,
                    cold_retry_interval: config.cold_retry_interval,
                    evict_after: config.evict_after,
                    quarantine_window: config.quarantine_window,
                },
            },
            incoming: announcements_rx,
            persist_path: Some(config.known_nodes_path.clone()),
            started: started_services.new_service(),
            cancellation_token: cancellation_token.clone(),
        }));

        tracing::info!("spawning oracle refresh task..");
        tokio::spawn(oracle_refresh_task(OracleRefreshTaskArgs {
            cache: oracle_cache.clone(),
            interval: config.oracle_refresh_interval,
            started: started_services.new_service(),
            cancellation_token: cancellation_token.clone(),
        }));

        tokio::task::spawn({
            let kfrag_store = kfrag_store.clone();
            let secret_store = Arc::clone(&secret_store);
            let cancellation_token = cancellation_token.clone();
            let mut interval = tokio::time::interval(POLICY_SWEEP_INTERVAL);
            async move {
                // first tick triggers instantly
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = cancellation_token.cancelled() => break,
                    }
                    if kfrag_store.sweep_expired(Timestamp::now()) > 0 {
                        if let Err(err) =
                            secret_store.save_kfrags(&kfrag_store.to_persistable()).await
                        {
                            tracing::warn!("could not persist swept kfrag store: {err:?}");
                        }
                    }
                }
            }
        });

        let context = Arc::new(WorkerContext {
            keys,
            metadata,
            version_req: config.version_req.clone(),
            kfrag_store,
            fleet,
            oracle_cache,
            evaluator,
            announcements: announcements_tx,
            usage: PolicyUsage::new(config.policy_rate_limit, config.rate_window),
            inflight: Arc::new(Semaphore::new(config.max_inflight)),
            secret_store,
            started_at: Instant::now(),
        });

        tracing::info!("init worker service..");
        let root = Router::new()
            .merge(api::health::routes(started_services.clone()))
            .merge(api::info::routes(Arc::clone(&context)));
        let api = Router::new()
            .merge(api::node_metadata::routes(Arc::clone(&context)))
            .merge(api::reencrypt::routes(Arc::clone(&context)))
            .merge(api::enact::routes(Arc::clone(&context)));

        Ok(Self {
            root,
            api,
            learning,
            context,
        })
    }

    /// The signed identity this worker announces.
    pub fn node_metadata(&self) -> &NodeMetadata {
        &self.context.metadata
    }

    /// Build the `axum` [`Router`] for the worker.
    ///
    /// # Returns
    ///
    /// Returns a tuple containing:
    /// - An Axum `Router` instance with the configured REST API routes.
    /// - A `JoinHandle` for the learning-loop task.
    pub fn build(self) -> (axum::Router, tokio::task::JoinHandle<eyre::Result<()>>) {
        (
            self.root
                .nest("/api/v1", self.api)
                .layer(TraceLayer::new_for_http()),
            self.learning,
        )
    }
}
