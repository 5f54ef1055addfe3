//! Configuration types and CLI/environment parsing for a worker node.
//!
//! Concrete deployments may have a more detailed config and can use the
//! exposed [`WorkerConfig`] and flatten it with `#[clap(flatten)]`.
//!
//! Additionally this module defines the [`Environment`] to assert dev-only
//! code.

use std::path::PathBuf;
use std::time::Duration;

use alloy_primitives::Address;
use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use semver::VersionReq;
use tpre_types::Domain;

/// The environment the service is running in.
///
/// Main usage for the `Environment` is to call
/// [`Environment::assert_is_dev`]. Services that are intended for `dev` only
/// (like the in-memory secret store) shall assert that they are called from
/// the `dev` environment.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Environment {
    /// Production environment.
    Prod,
    /// Development environment.
    Dev,
}

impl Environment {
    /// Asserts that `Environment` is `dev`. Panics if not the case.
    pub fn assert_is_dev(&self) {
        assert!(matches!(self, Environment::Dev), "Is not dev environment")
    }
}

/// The configuration for the worker core.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug, Clone)]
pub struct WorkerConfig {
    /// The environment of the worker (either `prod` or `dev`).
    #[clap(long, env = "TPRE_WORKER_ENVIRONMENT", default_value = "prod")]
    pub environment: Environment,

    /// The external base URL under which peers and clients reach this
    /// worker. Advertised in the signed node metadata.
    #[clap(long, env = "TPRE_WORKER_PUBLIC_ADDRESS")]
    pub public_address: String,

    /// The domain this worker participates in.
    #[clap(long, env = "TPRE_WORKER_DOMAIN", default_value = "mainnet")]
    pub domain: Domain,

    /// The operator account backing this worker on-chain.
    #[clap(long, env = "TPRE_WORKER_OPERATOR_ADDRESS")]
    pub operator_address: Address,

    /// Accepted SemVer versions of clients and peers.
    #[clap(long, env = "TPRE_WORKER_ACCEPTED_VERSIONS", value_parser = VersionReq::parse)]
    pub version_req: VersionReq,

    /// Lifetime of the signed identity record this worker gossips.
    #[clap(
        long,
        env = "TPRE_WORKER_IDENTITY_LIFETIME",
        default_value = "2d",
        value_parser = humantime::parse_duration
    )]
    pub identity_lifetime: Duration,

    /// Base pause between learning rounds.
    #[clap(
        long,
        env = "TPRE_WORKER_LEARNING_INTERVAL",
        default_value = "90s",
        value_parser = humantime::parse_duration
    )]
    pub learning_interval: Duration,

    /// Uniform random addition to the learning pause.
    #[clap(
        long,
        env = "TPRE_WORKER_LEARNING_JITTER",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub learning_jitter: Duration,

    /// Peers contacted per learning round.
    #[clap(long, env = "TPRE_WORKER_PEER_SAMPLE", default_value = "3")]
    pub peer_sample: usize,

    /// Timeout for one node-metadata exchange.
    #[clap(
        long,
        env = "TPRE_WORKER_EXCHANGE_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub exchange_timeout: Duration,

    /// Identities unseen for this long move to the cold shard.
    #[clap(
        long,
        env = "TPRE_WORKER_STALE_AFTER",
        default_value = "6h",
        value_parser = humantime::parse_duration
    )]
    pub stale_after: Duration,

    /// Cold identities are probed at most once per this interval.
    #[clap(
        long,
        env = "TPRE_WORKER_COLD_RETRY_INTERVAL",
        default_value = "1h",
        value_parser = humantime::parse_duration
    )]
    pub cold_retry_interval: Duration,

    /// Identities unseen for this long are deleted unless the oracle
    /// re-attests them.
    #[clap(
        long,
        env = "TPRE_WORKER_EVICT_AFTER",
        default_value = "7d",
        value_parser = humantime::parse_duration
    )]
    pub evict_after: Duration,

    /// How long a key-rotation conflict is quarantined before the oracle's
    /// verdict is applied.
    #[clap(
        long,
        env = "TPRE_WORKER_QUARANTINE_WINDOW",
        default_value = "24h",
        value_parser = humantime::parse_duration
    )]
    pub quarantine_window: Duration,

    /// Addresses contacted while the fleet view is empty.
    #[clap(long, env = "TPRE_WORKER_SEED_PEERS", value_delimiter = ',')]
    pub seed_peers: Vec<String>,

    /// Pause between authorization-oracle refreshes.
    #[clap(
        long,
        env = "TPRE_WORKER_ORACLE_REFRESH_INTERVAL",
        default_value = "5min",
        value_parser = humantime::parse_duration
    )]
    pub oracle_refresh_interval: Duration,

    /// Oldest oracle snapshot the worker will serve re-encryptions from.
    /// Beyond this age requests are rejected instead of served degraded.
    #[clap(
        long,
        env = "TPRE_WORKER_MAX_SNAPSHOT_AGE",
        default_value = "60min",
        value_parser = humantime::parse_duration
    )]
    pub max_snapshot_age: Duration,

    /// Re-encryption requests processed in parallel; requests above the
    /// bound get a typed retry-later answer.
    #[clap(long, env = "TPRE_WORKER_MAX_INFLIGHT", default_value = "64")]
    pub max_inflight: usize,

    /// Best-effort per-policy request budget per rate window.
    #[clap(long, env = "TPRE_WORKER_POLICY_RATE_LIMIT", default_value = "600")]
    pub policy_rate_limit: u64,

    /// Length of the per-policy rate window.
    #[clap(
        long,
        env = "TPRE_WORKER_RATE_WINDOW",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub rate_window: Duration,

    /// Where the serialized known-nodes store lives.
    #[clap(
        long,
        env = "TPRE_WORKER_KNOWN_NODES_PATH",
        default_value = "known-nodes.cbor"
    )]
    pub known_nodes_path: PathBuf,

    /// Directory holding the sealed key material.
    #[clap(long, env = "TPRE_WORKER_KEYSTORE_DIR", default_value = "keystore")]
    pub keystore_dir: PathBuf,

    /// Passphrase gating the sealed key material.
    #[clap(long, env = "TPRE_WORKER_KEYSTORE_PASSPHRASE")]
    pub keystore_passphrase: SecretString,
}
