use std::{collections::HashMap, path::PathBuf, time::Duration};

use config::{Config as ConfigLib, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::warn;

use crate::manager::CrlManagerConfig;
use crate::types::DistributionPointSet;

/// Time unit qualifier for interval properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn to_duration(self, value: u64) -> Duration {
        let seconds = match self {
            TimeUnit::Seconds => value,
            TimeUnit::Minutes => value * 60,
            TimeUnit::Hours => value * 60 * 60,
            TimeUnit::Days => value * 24 * 60 * 60,
        };
        Duration::from_secs(seconds)
    }
}

/// Raw CRL management properties as supplied by configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CrlConfig {
    /// Whether CRL management is enabled at all.
    pub enabled: bool,
    /// Age after which a stored CRL is downloaded again.
    pub update_interval: u64,
    pub update_interval_unit: TimeUnit,
    /// Period of the regular refresh cycle.
    pub check_interval: u64,
    pub check_interval_unit: TimeUnit,
    /// Static CRL URLs to track in addition to certificate-derived ones.
    pub urls: Vec<String>,
    /// Path of the persisted store file. When absent, callers derive one
    /// next to their own data (e.g. `<keystore path>.crl`).
    pub store_path: Option<PathBuf>,
    /// Whether downloaded CRLs are cryptographically verified.
    pub verify: bool,
    pub fetch_timeout_secs: u64,
    pub store_save_delay_ms: u64,
    pub max_concurrent_downloads: usize,
}

impl CrlConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        overrides: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("enabled", false)?
            .set_default("update_interval", 1)?
            .set_default("update_interval_unit", "days")?
            .set_default("check_interval", 5)?
            .set_default("check_interval_unit", "minutes")?
            .set_default("urls", Vec::<String>::new())?
            .set_default("verify", true)?
            .set_default("fetch_timeout_secs", 60)?
            .set_default("store_save_delay_ms", 5000)?
            .set_default("max_concurrent_downloads", 4)?
            .add_source(File::with_name("config/crl").required(false));

        // If overrides are provided, we use them instead of the process
        // environment. This avoids environment pollution across tests.
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Should be in the format CRL_CHECK_INTERVAL or CRL_STORE_PATH
            builder = builder.add_source(Environment::with_prefix("CRL").prefix_separator("_"));
        }

        builder.build()?.try_deserialize()
    }

    /// Lower the raw properties into the typed manager configuration.
    ///
    /// `fallback_store_path` is used when no store path is configured.
    pub fn manager_config(&self, fallback_store_path: impl Into<PathBuf>) -> CrlManagerConfig {
        let mut config = CrlManagerConfig::new(
            self.store_path
                .clone()
                .unwrap_or_else(|| fallback_store_path.into()),
        );
        config.store_save_delay = Duration::from_millis(self.store_save_delay_ms);
        config.check_interval = self.check_interval_unit.to_duration(self.check_interval);
        config.force_update_interval = self.update_interval_unit.to_duration(self.update_interval);
        config.fetch_timeout = Duration::from_secs(self.fetch_timeout_secs);
        config.max_concurrent_downloads = self.max_concurrent_downloads;
        config
    }

    /// The statically configured CRL URLs, one singleton distribution
    /// point set each. Unparsable URLs are logged and skipped.
    pub fn seed_distribution_points(&self) -> Vec<DistributionPointSet> {
        self.urls
            .iter()
            .filter_map(|url| match DistributionPointSet::parse([url]) {
                Ok(points) => Some(points),
                Err(e) => {
                    warn!("skipping configured CRL URL {url}: {e}");
                    None
                }
            })
            .collect()
    }
}
