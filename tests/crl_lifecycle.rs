mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crl_manager::testutil::SyntheticCrl;
use crl_manager::{
    CrlData, CrlFetcher, CrlManager, CrlResult, CrlStoreListener, DistributionPointSet, StoredCrl,
};
use x509_parser::prelude::*;

use common::{
    CountingListener, CountingVerifier, ScriptedFetcher, StalledFetcher, points, test_config,
    wait_for,
};

fn accept_all() -> Arc<dyn crl_manager::CrlVerifier> {
    Arc::new(|_: &CrlData| true)
}

#[tokio::test]
async fn downloaded_crls_are_stored_and_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let crl_der = SyntheticCrl::new("Test CA").build();
    let fetcher = ScriptedFetcher::new([crl_der.clone()]);
    let listener = CountingListener::new();

    let manager = CrlManager::with_fetcher(
        test_config(&dir),
        accept_all(),
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;
    manager.set_listener(Some(Arc::clone(&listener) as Arc<dyn CrlStoreListener>));

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;
    manager.refresh_now().await;

    let crls = manager.get_crls();
    assert_eq!(crls.len(), 1);
    assert_eq!(crls[0].der_bytes(), crl_der.as_slice());
    assert_eq!(listener.notifications(), 1);

    // A second cycle sees a fresh CRL and leaves everything untouched.
    manager.refresh_now().await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(listener.notifications(), 1);
}

#[tokio::test]
async fn removing_the_last_reference_evicts_and_persists_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crl-store.json");
    let fetcher = ScriptedFetcher::new([SyntheticCrl::new("Test CA").build()]);
    let listener = CountingListener::new();

    let manager = CrlManager::with_fetcher(
        test_config(&dir),
        accept_all(),
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;
    manager.set_listener(Some(Arc::clone(&listener) as Arc<dyn CrlStoreListener>));

    let set = points("http://crl.example/ca.crl");
    manager.add_distribution_points(set.clone()).await;
    manager.refresh_now().await;
    assert_eq!(manager.get_crls().len(), 1);

    assert!(manager.remove_distribution_points(&set).await);
    manager.refresh_now().await;

    assert!(manager.get_crls().is_empty());
    assert_eq!(listener.notifications(), 2);

    // After the debounce delay the on-disk file holds an empty array.
    wait_for(|| {
        std::fs::read(&path)
            .ok()
            .and_then(|json| serde_json::from_slice::<Vec<StoredCrl>>(&json).ok())
            .is_some_and(|records| records.is_empty())
    })
    .await;
}

#[tokio::test]
async fn crls_from_a_different_issuer_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let original = SyntheticCrl::new("Test CA").build();
    let impostor = SyntheticCrl::new("Other CA").build();
    let fetcher = ScriptedFetcher::new([original.clone(), impostor]);
    let listener = CountingListener::new();

    let mut config = test_config(&dir);
    config.force_update_interval = Duration::ZERO;
    let manager = CrlManager::with_fetcher(
        config,
        accept_all(),
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;
    manager.set_listener(Some(Arc::clone(&listener) as Arc<dyn CrlStoreListener>));

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;
    manager.refresh_now().await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.refresh_now().await;

    assert_eq!(fetcher.calls(), 2);

    // The impostor CRL was dropped, the original is still cached and the
    // listener saw only the first change.
    let crls = manager.get_crls();
    assert_eq!(crls.len(), 1);
    assert_eq!(crls[0].der_bytes(), original.as_slice());
    assert_eq!(listener.notifications(), 1);
}

#[tokio::test]
async fn identical_refetches_skip_reverification() {
    let dir = tempfile::tempdir().unwrap();
    let crl_der = SyntheticCrl::new("Test CA").build();
    let fetcher = ScriptedFetcher::new([crl_der.clone(), crl_der]);
    let verifier = CountingVerifier::accepting(usize::MAX);

    let mut config = test_config(&dir);
    config.force_update_interval = Duration::ZERO;
    let manager = CrlManager::with_fetcher(
        config,
        Arc::clone(&verifier) as Arc<dyn crl_manager::CrlVerifier>,
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;
    manager.refresh_now().await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.refresh_now().await;

    // Both cycles downloaded, but byte-identical data is trusted without
    // running the verifier again.
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(verifier.calls(), 1);
    assert_eq!(manager.get_crls().len(), 1);
}

#[tokio::test]
async fn rejected_crls_leave_previous_data_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let original = SyntheticCrl::new("Test CA").build();
    let replacement = SyntheticCrl::new("Test CA").signature_seed(9).build();
    let fetcher = ScriptedFetcher::new([original.clone(), replacement]);
    // First CRL passes verification, everything after is rejected.
    let verifier = CountingVerifier::accepting(1);
    let listener = CountingListener::new();

    let mut config = test_config(&dir);
    config.force_update_interval = Duration::ZERO;
    let manager = CrlManager::with_fetcher(
        config,
        Arc::clone(&verifier) as Arc<dyn crl_manager::CrlVerifier>,
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;
    manager.set_listener(Some(Arc::clone(&listener) as Arc<dyn CrlStoreListener>));

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;
    manager.refresh_now().await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.refresh_now().await;

    let crls = manager.get_crls();
    assert_eq!(crls.len(), 1);
    assert_eq!(crls[0].der_bytes(), original.as_slice());
    assert_eq!(listener.notifications(), 1);
}

#[tokio::test]
async fn nothing_is_stored_when_verification_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new([SyntheticCrl::new("Test CA").build()]);
    let listener = CountingListener::new();

    let manager = CrlManager::with_fetcher(
        test_config(&dir),
        Arc::new(|_: &CrlData| false),
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;
    manager.set_listener(Some(Arc::clone(&listener) as Arc<dyn CrlStoreListener>));

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;
    manager.refresh_now().await;

    assert!(manager.get_crls().is_empty());
    assert_eq!(listener.notifications(), 0);
}

#[tokio::test]
async fn persisted_crls_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crl-store.json");
    let crl_der = SyntheticCrl::new("Test CA").build();

    {
        let fetcher = ScriptedFetcher::new([crl_der.clone()]);
        let manager = CrlManager::with_fetcher(
            test_config(&dir),
            accept_all(),
            Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
        )
        .await;

        manager
            .add_distribution_points(points("http://crl.example/ca.crl"))
            .await;
        manager.refresh_now().await;

        wait_for(|| {
            std::fs::read(&path)
                .ok()
                .and_then(|json| serde_json::from_slice::<Vec<StoredCrl>>(&json).ok())
                .is_some_and(|records| records.len() == 1)
        })
        .await;
    }

    // A new manager over the same store file serves the cached CRL before
    // any download happened.
    let fetcher = ScriptedFetcher::new([SyntheticCrl::new("Other CA").build()]);
    let manager = CrlManager::with_fetcher(
        test_config(&dir),
        accept_all(),
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;

    let crls = manager.get_crls();
    assert_eq!(crls.len(), 1);
    assert_eq!(crls[0].der_bytes(), crl_der.as_slice());
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn fetch_timeouts_leave_the_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.fetch_timeout = Duration::from_millis(50);

    let manager =
        CrlManager::with_fetcher(config, accept_all(), Arc::new(StalledFetcher)).await;

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;
    manager.refresh_now().await;

    assert!(manager.get_crls().is_empty());
}

#[tokio::test]
async fn trusted_certificates_reference_their_distribution_points() {
    use crl_manager::testutil::SyntheticCert;

    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new([SyntheticCrl::new("Test CA").build()]);
    let manager = CrlManager::with_fetcher(
        test_config(&dir),
        accept_all(),
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;

    let with_dp = SyntheticCert::new("Leaf")
        .issued_by("Test CA")
        .crl_uri("http://crl.example/ca.crl")
        .build();
    let (_, cert) = X509Certificate::from_der(&with_dp).unwrap();

    assert!(manager.add_trusted_certificate(&cert).await);
    // A second certificate advertising the same set only bumps the count.
    assert!(!manager.add_trusted_certificate(&cert).await);
    assert!(!manager.remove_trusted_certificate(&cert).await);
    assert!(manager.remove_trusted_certificate(&cert).await);

    // Certificates without the extension are rejected without mutating
    // state.
    let without_dp = SyntheticCert::new("Leaf").issued_by("Test CA").build();
    let (_, plain) = X509Certificate::from_der(&without_dp).unwrap();
    assert!(!manager.add_trusted_certificate(&plain).await);
    assert!(!manager.remove_trusted_certificate(&plain).await);
}

#[tokio::test]
async fn cert_store_view_answers_revocation_queries() {
    use crl_manager::testutil::SyntheticCert;

    let dir = tempfile::tempdir().unwrap();
    // Serial 1 is what SyntheticCert issues; list it as revoked.
    let crl_der = SyntheticCrl::new("Test CA").revoke_serial(&[0x01]).build();
    let fetcher = ScriptedFetcher::new([crl_der]);
    let manager = CrlManager::with_fetcher(
        test_config(&dir),
        accept_all(),
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;
    manager.refresh_now().await;

    let view = manager.cert_store();
    assert_eq!(view.crls().len(), 1);

    let revoked_der = SyntheticCert::new("Leaf").issued_by("Test CA").build();
    let (_, revoked) = X509Certificate::from_der(&revoked_der).unwrap();
    assert!(view.is_revoked(&revoked));

    let unrelated_der = SyntheticCert::new("Leaf").issued_by("Other CA").build();
    let (_, unrelated) = X509Certificate::from_der(&unrelated_der).unwrap();
    assert!(!view.is_revoked(&unrelated));
}

#[tokio::test]
async fn the_background_scheduler_picks_up_new_references() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new([SyntheticCrl::new("Test CA").build()]);

    let mut config = test_config(&dir);
    config.refresh_delay = Duration::from_millis(50);
    config.check_interval = Duration::from_millis(100);
    let manager = CrlManager::with_fetcher(
        config,
        accept_all(),
        Arc::clone(&fetcher) as Arc<dyn CrlFetcher>,
    )
    .await;

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;

    // No refresh_now: the out-of-band request plus the scheduler do the
    // work.
    wait_for(|| manager.get_crls().len() == 1).await;

    manager.close();
}

mockall::mock! {
    pub Fetcher {}

    #[async_trait]
    impl CrlFetcher for Fetcher {
        async fn fetch(&self, points: &DistributionPointSet) -> CrlResult<Vec<u8>>;
    }
}

#[tokio::test]
async fn the_fetcher_seam_is_mockable() {
    let dir = tempfile::tempdir().unwrap();
    let crl_der = SyntheticCrl::new("Test CA").build();

    let mut mock = MockFetcher::new();
    let body = crl_der.clone();
    mock.expect_fetch()
        .times(1)
        .returning(move |_| Ok(body.clone()));

    let manager =
        CrlManager::with_fetcher(test_config(&dir), accept_all(), Arc::new(mock)).await;

    manager
        .add_distribution_points(points("http://crl.example/ca.crl"))
        .await;
    manager.refresh_now().await;

    let crls = manager.get_crls();
    assert_eq!(crls.len(), 1);
    assert_eq!(crls[0].der_bytes(), crl_der.as_slice());
}
