use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crl_manager::{
    CrlData, CrlFetcher, CrlManagerConfig, CrlResult, CrlStoreListener, CrlVerifier,
    DistributionPointSet,
};

/// Manager configuration with a fast store debounce and the background
/// scheduler pushed out of the way, so tests drive cycles explicitly.
pub fn test_config(dir: &tempfile::TempDir) -> CrlManagerConfig {
    let mut config = CrlManagerConfig::new(dir.path().join("crl-store.json"));
    config.store_save_delay = Duration::from_millis(10);
    config.check_interval = Duration::from_secs(3600);
    config.refresh_delay = Duration::from_secs(3600);
    config
}

pub fn points(uri: &str) -> DistributionPointSet {
    DistributionPointSet::parse([uri]).unwrap()
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within timeout");
}

/// Fetcher that serves a scripted sequence of responses (the last one
/// repeats) and counts invocations.
pub struct ScriptedFetcher {
    responses: Mutex<Vec<Vec<u8>>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new<I: IntoIterator<Item = Vec<u8>>>(responses: I) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrlFetcher for ScriptedFetcher {
    async fn fetch(&self, _points: &DistributionPointSet) -> CrlResult<Vec<u8>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        let index = call.min(responses.len() - 1);
        Ok(responses[index].clone())
    }
}

/// Fetcher that never completes, for exercising the download timeout.
pub struct StalledFetcher;

#[async_trait]
impl CrlFetcher for StalledFetcher {
    async fn fetch(&self, _points: &DistributionPointSet) -> CrlResult<Vec<u8>> {
        std::future::pending().await
    }
}

pub struct CountingListener {
    notifications: AtomicUsize,
}

impl CountingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notifications: AtomicUsize::new(0),
        })
    }

    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }
}

impl CrlStoreListener for CountingListener {
    fn on_cache_changed(&self) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
    }
}

/// Verifier that accepts the first `accept` CRLs and rejects the rest,
/// counting invocations.
pub struct CountingVerifier {
    accept: usize,
    calls: AtomicUsize,
}

impl CountingVerifier {
    pub fn accepting(accept: usize) -> Arc<Self> {
        Arc::new(Self {
            accept,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CrlVerifier for CountingVerifier {
    fn verify(&self, _crl: &CrlData) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) < self.accept
    }
}
