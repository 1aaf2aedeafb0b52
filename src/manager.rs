use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::errors::{CrlError, CrlResult};
use crate::extractor;
use crate::fetcher::{CrlFetcher, HttpCrlFetcher};
use crate::store::{CrlCertStore, CrlStore};
use crate::types::{CrlData, DistributionPointSet, StoredCrl};
use crate::verifier::CrlVerifier;

/// Notified when an update cycle produced a net change (a CRL was added,
/// replaced or removed). Fired at most once per cycle, synchronously from
/// the scheduler task, so implementations must not block for long.
pub trait CrlStoreListener: Send + Sync {
    fn on_cache_changed(&self);
}

impl<F> CrlStoreListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_cache_changed(&self) {
        self()
    }
}

/// Configuration for a [`CrlManager`] instance.
#[derive(Debug, Clone)]
pub struct CrlManagerConfig {
    /// Path of the persisted CRL store file.
    pub store_path: PathBuf,
    /// Debounce delay between a store mutation and the durable save.
    pub store_save_delay: Duration,
    /// Period of the regular refresh cycle.
    pub check_interval: Duration,
    /// Age after which a stored, still valid CRL is downloaded again.
    pub force_update_interval: Duration,
    /// Hard deadline for a single download attempt.
    pub fetch_timeout: Duration,
    /// Delay before the first cycle after a state mutation, coalescing
    /// bursts of add/remove calls.
    pub refresh_delay: Duration,
    /// Upper bound on concurrent downloads.
    pub max_concurrent_downloads: usize,
}

impl CrlManagerConfig {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            store_save_delay: Duration::from_secs(5),
            check_interval: Duration::from_secs(5 * 60),
            force_update_interval: Duration::from_secs(24 * 60 * 60),
            fetch_timeout: Duration::from_secs(60),
            refresh_delay: Duration::from_secs(5),
            max_concurrent_downloads: 4,
        }
    }
}

/// Tracks interest in one distribution point set.
struct DistributionPointState {
    distribution_points: DistributionPointSet,
    ref_count: u32,
    last_download: Option<Instant>,
}

impl DistributionPointState {
    fn new(distribution_points: DistributionPointSet) -> Self {
        Self {
            distribution_points,
            ref_count: 1,
            last_download: None,
        }
    }
}

struct Inner {
    store: CrlStore,
    states: Mutex<Vec<DistributionPointState>>,
    listener: StdMutex<Option<Arc<dyn CrlStoreListener>>>,
    verifier: Arc<dyn CrlVerifier>,
    fetcher: Arc<dyn CrlFetcher>,
    downloads: Arc<Semaphore>,
    fetch_timeout: Duration,
    force_update_interval: Duration,
    check_interval: Duration,
    refresh_delay: Duration,
    refresh_requested: Notify,
    shutdown: watch::Sender<bool>,
}

/// Tracks which CRL distribution points are currently of interest,
/// periodically fetches and verifies their CRLs, keeps the verified set in
/// a durable [`CrlStore`] and evicts CRLs no longer referenced.
///
/// Interest is reference counted per unique distribution point set: the
/// same set referenced from several certificates is tracked once and kept
/// until the last reference is removed. All failure handling is
/// best-effort; fetch and verification errors are logged and retried on a
/// later cycle, never surfaced to callers.
pub struct CrlManager {
    inner: Arc<Inner>,
    scheduler: StdMutex<Option<JoinHandle<()>>>,
}

impl CrlManager {
    /// Create a manager using the bundled HTTP fetcher.
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub async fn new(config: CrlManagerConfig, verifier: Arc<dyn CrlVerifier>) -> CrlResult<Self> {
        let fetcher = Arc::new(HttpCrlFetcher::new(config.fetch_timeout)?);
        Ok(Self::with_fetcher(config, verifier, fetcher).await)
    }

    /// Create a manager with an injected transport.
    ///
    /// Loads previously persisted CRLs and immediately schedules the first
    /// refresh cycle.
    pub async fn with_fetcher(
        config: CrlManagerConfig,
        verifier: Arc<dyn CrlVerifier>,
        fetcher: Arc<dyn CrlFetcher>,
    ) -> Self {
        let store = CrlStore::new(config.store_path.clone(), config.store_save_delay).await;
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            store,
            states: Mutex::new(Vec::new()),
            listener: StdMutex::new(None),
            verifier,
            fetcher,
            downloads: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            fetch_timeout: config.fetch_timeout,
            force_update_interval: config.force_update_interval,
            check_interval: config.check_interval,
            refresh_delay: config.refresh_delay,
            refresh_requested: Notify::new(),
            shutdown,
        });

        let scheduler = tokio::spawn(Arc::clone(&inner).run_scheduler());

        Self {
            inner,
            scheduler: StdMutex::new(Some(scheduler)),
        }
    }

    /// Start tracking a distribution point set.
    ///
    /// If an identical set is already tracked its reference count is
    /// incremented and no refresh is triggered; returns whether the set is
    /// newly tracked.
    pub async fn add_distribution_points(&self, points: DistributionPointSet) -> bool {
        let added = {
            let mut states = self.inner.states.lock().await;
            match states
                .iter_mut()
                .find(|state| state.distribution_points == points)
            {
                Some(state) => {
                    state.ref_count += 1;
                    debug!(
                        "distribution points {points} now referenced {} times",
                        state.ref_count
                    );
                    false
                }
                None => {
                    debug!("tracking new distribution points {points}");
                    states.push(DistributionPointState::new(points));
                    true
                }
            }
        };

        if added {
            self.inner.request_update();
        }
        added
    }

    /// Drop one reference to a distribution point set.
    ///
    /// Returns true iff this was the last reference; the set then stops
    /// being tracked and its CRL is pruned on the next cycle.
    pub async fn remove_distribution_points(&self, points: &DistributionPointSet) -> bool {
        let removed = {
            let mut states = self.inner.states.lock().await;
            let Some(index) = states
                .iter()
                .position(|state| &state.distribution_points == points)
            else {
                debug!("distribution points {points} are not tracked");
                return false;
            };

            states[index].ref_count -= 1;
            if states[index].ref_count == 0 {
                debug!("dropping distribution points {points}");
                states.remove(index);
                true
            } else {
                false
            }
        };

        if removed {
            self.inner.request_update();
        }
        removed
    }

    /// Track the distribution points advertised by a trusted certificate.
    ///
    /// Extraction failure or a certificate without usable distribution
    /// points is logged and reported as false, without mutating state.
    pub async fn add_trusted_certificate(&self, cert: &X509Certificate<'_>) -> bool {
        match extractor::extract_crl_distribution_points(cert) {
            Ok(points) => self.add_distribution_points(points).await,
            Err(e) => {
                warn!(
                    "failed to extract CRL distribution points from {}: {e}",
                    cert.subject()
                );
                false
            }
        }
    }

    /// Drop the reference contributed by a trusted certificate.
    pub async fn remove_trusted_certificate(&self, cert: &X509Certificate<'_>) -> bool {
        match extractor::extract_crl_distribution_points(cert) {
            Ok(points) => self.remove_distribution_points(&points).await,
            Err(e) => {
                warn!(
                    "failed to extract CRL distribution points from {}: {e}",
                    cert.subject()
                );
                false
            }
        }
    }

    /// Snapshot of all currently cached CRLs.
    pub fn get_crls(&self) -> Vec<CrlData> {
        self.inner
            .store
            .get_all()
            .into_iter()
            .map(|record| record.crl().clone())
            .collect()
    }

    /// Read-only view of the cached CRLs for path validation consumers.
    pub fn cert_store(&self) -> CrlCertStore {
        self.inner.store.cert_store()
    }

    /// Replace the change notification target.
    pub fn set_listener(&self, listener: Option<Arc<dyn CrlStoreListener>>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = listener;
    }

    /// Run a single update cycle immediately.
    ///
    /// Cycles are serialized: if the scheduler is mid-cycle this waits for
    /// it to finish first.
    pub async fn refresh_now(&self) {
        self.inner.update().await;
    }

    /// Shut down the refresh scheduler and the download pool. Does not
    /// wait for in-flight downloads.
    pub fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.downloads.close();
        if let Some(task) = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.inner.store.close();
    }
}

impl Drop for CrlManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    /// Restart the refresh cadence: the next cycle runs `refresh_delay`
    /// from now, then regularly every `check_interval`.
    fn request_update(&self) {
        self.refresh_requested.notify_one();
    }

    async fn run_scheduler(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut deadline = Instant::now() + self.refresh_delay;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    self.update().await;
                    deadline = Instant::now() + self.check_interval;
                }
                _ = self.refresh_requested.notified() => {
                    deadline = Instant::now() + self.refresh_delay;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("CRL refresh scheduler stopped");
    }

    /// One update cycle: decide per tracked set whether a download is due,
    /// fetch and validate sequentially in tracking order, then prune
    /// orphaned store entries. Holds the tracked state lock for the whole
    /// cycle so state mutations cannot interleave.
    async fn update(&self) {
        let mut states = self.states.lock().await;

        if *self.shutdown.borrow() {
            return;
        }

        let now = Instant::now();
        let mut shutdown = self.shutdown.subscribe();
        let mut changed = false;

        for state in states.iter_mut() {
            let existing = self.store.get(&state.distribution_points);
            if !self.needs_refresh(state, existing.as_ref(), now) {
                continue;
            }

            let fetched = tokio::select! {
                result = self.download(&state.distribution_points) => result,
                _ = shutdown.changed() => {
                    warn!("shutdown requested, aborting CRL refresh cycle");
                    return;
                }
            };

            match fetched {
                Ok(bytes) => match CrlData::from_bytes(&bytes) {
                    Ok(crl) => {
                        changed |= self.validate_and_store(state, existing, crl, now);
                    }
                    Err(e) => warn!(
                        "failed to parse CRL downloaded for {}: {e}",
                        state.distribution_points
                    ),
                },
                Err(e) => warn!(
                    "failed to download CRL for {}: {e}",
                    state.distribution_points
                ),
            }
        }

        // Eviction only happens after every fetch attempt of the cycle has
        // resolved.
        let referenced: HashSet<DistributionPointSet> = states
            .iter()
            .map(|state| state.distribution_points.clone())
            .collect();
        let pruned = self
            .store
            .remove_where(|record| !referenced.contains(record.distribution_points()));
        if pruned {
            debug!("pruned CRLs of unreferenced distribution points");
        }
        changed |= pruned;

        drop(states);

        if changed {
            self.notify_listener();
        }
    }

    fn needs_refresh(
        &self,
        state: &DistributionPointState,
        existing: Option<&StoredCrl>,
        now: Instant,
    ) -> bool {
        let Some(existing) = existing else {
            return true;
        };
        if existing.crl().is_expired() {
            debug!("CRL for {} is expired", state.distribution_points);
            return true;
        }
        let Some(last_download) = state.last_download else {
            return true;
        };
        now.duration_since(last_download) > self.force_update_interval
    }

    /// Submit a download on the bounded pool and await it with the
    /// configured hard timeout.
    async fn download(&self, points: &DistributionPointSet) -> CrlResult<Vec<u8>> {
        let permit = Arc::clone(&self.downloads)
            .acquire_owned()
            .await
            .map_err(|_| CrlError::Custom("download pool is shut down".to_string()))?;

        let fetcher = Arc::clone(&self.fetcher);
        let points = points.clone();
        let mut task = tokio::spawn(async move {
            let _permit = permit;
            fetcher.fetch(&points).await
        });

        match timeout(self.fetch_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CrlError::Custom(format!("download task failed: {e}"))),
            Err(_) => {
                task.abort();
                Err(CrlError::Timeout)
            }
        }
    }

    /// Decide what to do with a freshly downloaded CRL. Returns whether
    /// the store changed.
    fn validate_and_store(
        &self,
        state: &mut DistributionPointState,
        existing: Option<StoredCrl>,
        new_crl: CrlData,
        now: Instant,
    ) -> bool {
        if let Some(existing) = &existing {
            if existing.crl() == &new_crl {
                debug!("CRL for {} is up to date", state.distribution_points);
                state.last_download = Some(now);
                return false;
            }

            // A distribution point must keep serving CRLs from the issuer
            // it served at first download.
            if existing.crl().issuer() != new_crl.issuer() {
                warn!(
                    "issuer of CRL downloaded from {} changed from {} to {}, discarding it",
                    state.distribution_points,
                    existing.crl().issuer(),
                    new_crl.issuer()
                );
                return false;
            }
        }

        if !self.verifier.verify(&new_crl) {
            warn!(
                "verification of CRL downloaded from {} failed, keeping previous data",
                state.distribution_points
            );
            return false;
        }

        info!(
            "storing CRL from {} issued by {}",
            state.distribution_points,
            new_crl.issuer()
        );
        self.store
            .store(StoredCrl::new(state.distribution_points.clone(), new_crl));
        state.last_download = Some(now);
        true
    }

    fn notify_listener(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener.on_cache_changed();
        }
    }
}
