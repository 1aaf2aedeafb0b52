use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::errors::CrlResult;
use crate::types::{CrlData, DistributionPointSet, StoredCrl};

type CrlMap = HashMap<DistributionPointSet, StoredCrl>;

/// Durable cache of verified CRLs, keyed by distribution point set.
///
/// The in-memory map is the source of truth; it is mirrored to a single
/// JSON file with debounced saves, so the file may lag behind the map by up
/// to the configured delay. Saves write a sibling temporary file and rename
/// it over the target, so readers only ever observe a complete document.
pub struct CrlStore {
    path: Arc<PathBuf>,
    entries: Arc<RwLock<CrlMap>>,
    save_delay: Duration,
    save_task: Mutex<Option<JoinHandle<()>>>,
}

impl CrlStore {
    /// Open the store, loading previously persisted records if present.
    ///
    /// A missing file starts an empty store; an unreadable or unparsable
    /// file is logged and also starts empty. Parent directories are created
    /// as needed; failure to create them is logged, not fatal (the next
    /// successful save will surface the problem again).
    pub async fn new(path: impl Into<PathBuf>, save_delay: Duration) -> Self {
        let path = path.into();
        let mut entries = CrlMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<StoredCrl>>(&bytes) {
                Ok(records) => {
                    for record in records {
                        entries.insert(record.distribution_points().clone(), record);
                    }
                    info!(
                        "loaded {} CRL records from {}",
                        entries.len(),
                        path.display()
                    );
                }
                Err(e) => {
                    warn!(
                        "failed to parse CRL store file {}, starting empty: {e}",
                        path.display()
                    );
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent()
                    && let Err(e) = tokio::fs::create_dir_all(parent).await
                {
                    warn!(
                        "failed to create CRL store directory {}: {e}",
                        parent.display()
                    );
                }
            }
            Err(e) => {
                warn!(
                    "failed to read CRL store file {}, starting empty: {e}",
                    path.display()
                );
            }
        }

        Self {
            path: Arc::new(path),
            entries: Arc::new(RwLock::new(entries)),
            save_delay,
            save_task: Mutex::new(None),
        }
    }

    /// Insert or replace the record for its distribution point set and
    /// schedule a debounced save.
    pub fn store(&self, record: StoredCrl) {
        {
            let mut map = lock_write(&self.entries);
            map.insert(record.distribution_points().clone(), record);
        }
        self.schedule_save();
    }

    /// Remove all records matching the predicate. Returns whether anything
    /// was removed; schedules a save if so.
    pub fn remove_where(&self, predicate: impl Fn(&StoredCrl) -> bool) -> bool {
        let removed = {
            let mut map = lock_write(&self.entries);
            let before = map.len();
            map.retain(|_, record| !predicate(record));
            map.len() != before
        };
        if removed {
            self.schedule_save();
        }
        removed
    }

    pub fn get(&self, key: &DistributionPointSet) -> Option<StoredCrl> {
        lock_read(&self.entries).get(key).cloned()
    }

    pub fn get_all(&self) -> Vec<StoredCrl> {
        let mut records: Vec<StoredCrl> = lock_read(&self.entries).values().cloned().collect();
        records.sort_by(|a, b| a.distribution_points().cmp(b.distribution_points()));
        records
    }

    pub fn len(&self) -> usize {
        lock_read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_read(&self.entries).is_empty()
    }

    /// A read-only view over the stored CRLs for path-building consumers.
    ///
    /// The view is live: it reflects mutations made through this store
    /// after it was obtained.
    pub fn cert_store(&self) -> CrlCertStore {
        CrlCertStore {
            entries: Arc::clone(&self.entries),
        }
    }

    /// Shut down the debounce scheduler. Pending unsaved state may be
    /// lost; it is reconstructed by the normal refresh cycle.
    pub fn close(&self) {
        let mut slot = self.save_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    /// Restart the debounce timer: cancel any scheduled save and schedule
    /// a fresh one `save_delay` from now.
    fn schedule_save(&self) {
        let entries = Arc::clone(&self.entries);
        let path = Arc::clone(&self.path);
        let delay = self.save_delay;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let snapshot = {
                let map = entries.read().unwrap_or_else(|e| e.into_inner());
                let mut records: Vec<StoredCrl> = map.values().cloned().collect();
                records.sort_by(|a, b| a.distribution_points().cmp(b.distribution_points()));
                records
            };

            match persist(&path, &snapshot).await {
                Ok(()) => debug!(
                    "persisted {} CRL records to {}",
                    snapshot.len(),
                    path.display()
                ),
                Err(e) => warn!("failed to persist CRL store to {}: {e}", path.display()),
            }
        });

        let mut slot = self.save_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }
}

impl Drop for CrlStore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serialize the records and atomically replace the store file.
async fn persist(path: &Path, records: &[StoredCrl]) -> CrlResult<()> {
    let json = serde_json::to_vec_pretty(records)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn lock_read(entries: &RwLock<CrlMap>) -> std::sync::RwLockReadGuard<'_, CrlMap> {
    entries.read().unwrap_or_else(|e| e.into_inner())
}

fn lock_write(entries: &RwLock<CrlMap>) -> std::sync::RwLockWriteGuard<'_, CrlMap> {
    entries.write().unwrap_or_else(|e| e.into_inner())
}

/// Read-only projection of a [`CrlStore`] usable during certificate path
/// validation.
#[derive(Clone)]
pub struct CrlCertStore {
    entries: Arc<RwLock<CrlMap>>,
}

impl CrlCertStore {
    /// Snapshot of all currently cached CRLs.
    pub fn crls(&self) -> Vec<CrlData> {
        lock_read(&self.entries)
            .values()
            .map(|record| record.crl().clone())
            .collect()
    }

    /// Snapshot of the CRLs issued by the given distinguished name.
    pub fn crls_for_issuer(&self, issuer: &str) -> Vec<CrlData> {
        lock_read(&self.entries)
            .values()
            .filter(|record| record.crl().issuer() == issuer)
            .map(|record| record.crl().clone())
            .collect()
    }

    /// Whether any cached CRL from the certificate's issuer lists the
    /// certificate as revoked.
    pub fn is_revoked(&self, cert: &X509Certificate<'_>) -> bool {
        let issuer = cert.issuer().to_string();
        let serial = cert.tbs_certificate.serial.to_bytes_be();

        let revoked = self
            .crls_for_issuer(&issuer)
            .iter()
            .any(|crl| crl.is_revoked(&serial));
        if revoked {
            debug!(
                "certificate with serial {} is revoked by a CRL from {issuer}",
                hex::encode(&serial)
            );
        }
        revoked
    }

    pub fn len(&self) -> usize {
        lock_read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_read(&self.entries).is_empty()
    }
}
