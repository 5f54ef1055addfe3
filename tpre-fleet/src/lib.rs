#![deny(missing_docs, clippy::unwrap_used)]
//! Peer discovery and fleet membership.
//!
//! This crate maintains the verified set of live worker identities every
//! node and client routes requests through. The moving parts:
//!
//! * [`state`] — immutable fleet snapshots with checksums, liveness shards,
//!   quarantine and deterministic sampling. Readers grab a snapshot; the
//!   learning loop is the single writer and installs whole snapshots, so a
//!   round's effect is observed atomically.
//! * [`learning`] — the epidemic learning loop: each round picks a few
//!   random peers, runs concurrent metadata exchanges, validates what comes
//!   back, and installs the merged snapshot at round end. Cancellable at
//!   every suspension point without partial mutation.
//! * [`oracle_cache`] — the last-good authorization-oracle snapshot with the
//!   degraded-mode policy built on top of it.
//! * [`transport`] — the metadata-exchange interface plus its HTTP
//!   implementation.
//! * [`persistence`] — the on-disk known-nodes store.

pub mod learning;
pub mod metrics;
pub mod oracle_cache;
pub mod persistence;
pub mod state;
pub mod transport;

pub use learning::{LearnerConfig, LearningTaskArgs, learning_task};
pub use oracle_cache::{OracleCache, OracleRefreshTaskArgs, OracleView, oracle_refresh_task};
pub use state::{FleetStateStore, LivenessPolicy, Shard, WorkerEntry};
pub use transport::{ExchangeError, HttpMetadataExchange, MetadataExchange};
