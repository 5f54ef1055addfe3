//! Last-good-snapshot cache over the authorization oracle.
//!
//! Every consumer of registry facts goes through this cache instead of the
//! oracle directly: when the chain endpoint is unreachable the cache keeps
//! serving the last good snapshot, and callers learn through [`OracleView`]
//! whether they are working with fresh or possibly stale data.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tpre_types::chain::{OracleError, OracleService, OracleSnapshot};
use tpre_types::{Domain, Timestamp};

/// The cache's answer to "what does the registry look like right now".
#[derive(Clone, Debug)]
pub enum OracleView {
    /// A snapshot within the staleness bound.
    Fresh(OracleSnapshot),
    /// A snapshot older than the staleness bound; results derived from it
    /// must be annotated as possibly stale.
    Stale(OracleSnapshot),
    /// No snapshot was ever fetched.
    Missing,
}

impl OracleView {
    /// The underlying snapshot, if any.
    pub fn snapshot(&self) -> Option<&OracleSnapshot> {
        match self {
            OracleView::Fresh(snapshot) | OracleView::Stale(snapshot) => Some(snapshot),
            OracleView::Missing => None,
        }
    }

    /// Whether the snapshot is within the staleness bound.
    pub fn is_fresh(&self) -> bool {
        matches!(self, OracleView::Fresh(_))
    }

    /// Whether results derived from this view must carry the stale
    /// annotation.
    pub fn possibly_stale(&self) -> bool {
        !self.is_fresh()
    }
}

struct OracleCacheInner {
    oracle: OracleService,
    domain: Domain,
    max_snapshot_age: Duration,
    last_good: RwLock<Option<OracleSnapshot>>,
    degraded: AtomicBool,
}

/// Shared cache handle.
#[derive(Clone)]
pub struct OracleCache(Arc<OracleCacheInner>);

impl OracleCache {
    /// Creates a cache over `oracle` for `domain`. Snapshots older than
    /// `max_snapshot_age` degrade to [`OracleView::Stale`].
    pub fn new(oracle: OracleService, domain: Domain, max_snapshot_age: Duration) -> Self {
        Self(Arc::new(OracleCacheInner {
            oracle,
            domain,
            max_snapshot_age,
            last_good: RwLock::new(None),
            degraded: AtomicBool::new(false),
        }))
    }

    /// The domain this cache serves.
    pub fn domain(&self) -> &Domain {
        &self.0.domain
    }

    /// Fetches a fresh snapshot and replaces the cached one.
    ///
    /// On [`OracleError::Unavailable`] the cached snapshot is left in place;
    /// the error is returned so callers can count the failure.
    pub async fn refresh(&self) -> Result<(), OracleError> {
        match self.0.oracle.snapshot(&self.0.domain).await {
            Ok(snapshot) => {
                tracing::debug!(
                    epoch = %snapshot.epoch,
                    authorized = snapshot.authorized.len(),
                    "oracle snapshot refreshed"
                );
                *self.0.last_good.write() = Some(snapshot);
                self.0.degraded.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.0.degraded.store(true, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Whether the most recent refresh attempt failed. The cached snapshot
    /// stays in service while this is set; consumers only use the flag to
    /// annotate and count degraded operation.
    pub fn is_degraded(&self) -> bool {
        self.0.degraded.load(Ordering::Relaxed)
    }

    /// The current view, classified against the staleness bound.
    pub fn view(&self) -> OracleView {
        match self.0.last_good.read().clone() {
            None => OracleView::Missing,
            Some(snapshot) => {
                let age = Timestamp::now().seconds_since(snapshot.taken_at);
                if age <= self.0.max_snapshot_age.as_secs() {
                    OracleView::Fresh(snapshot)
                } else {
                    OracleView::Stale(snapshot)
                }
            }
        }
    }
}

/// Arguments for [`oracle_refresh_task`].
pub struct OracleRefreshTaskArgs {
    /// The cache to keep refreshed.
    pub cache: OracleCache,
    /// Pause between refresh attempts.
    pub interval: Duration,
    /// Readiness flag, set after the first refresh attempt completes.
    pub started: Arc<AtomicBool>,
    /// Shutdown signal.
    pub cancellation_token: CancellationToken,
}

/// Background task keeping an [`OracleCache`] fresh.
///
/// Oracle unavailability is a soft failure: the task logs, keeps the last
/// good snapshot, and retries on the next tick. It never brings the service
/// down.
pub async fn oracle_refresh_task(args: OracleRefreshTaskArgs) -> eyre::Result<()> {
    let OracleRefreshTaskArgs {
        cache,
        interval,
        started,
        cancellation_token,
    } = args;

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancellation_token.cancelled() => break,
        }
        if let Err(err) = cache.refresh().await {
            tracing::warn!("oracle refresh failed, keeping last good snapshot: {err}");
        }
        // ready once the first attempt is through, successful or not:
        // degraded mode is an operating state, not a startup failure
        started.store(true, Ordering::Relaxed);
    }
    tracing::info!("oracle refresh task stopped");
    Ok(())
}
