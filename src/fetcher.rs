use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::errors::{CrlError, CrlResult};
use crate::types::DistributionPointSet;

/// Default maximum accepted CRL size (10 MB).
const DEFAULT_MAX_CRL_SIZE: usize = 10 * 1024 * 1024;

/// Transport used by the manager to obtain raw CRL bytes for a
/// distribution point set.
///
/// Implementations try the URIs of the set until one of them yields a
/// document; parsing and verification happen in the manager.
#[async_trait]
pub trait CrlFetcher: Send + Sync {
    async fn fetch(&self, points: &DistributionPointSet) -> CrlResult<Vec<u8>>;
}

/// HTTP(S) fetcher backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpCrlFetcher {
    client: Client,
    max_size: usize,
}

impl HttpCrlFetcher {
    /// Returns an error if the HTTP client cannot be initialized
    pub fn new(request_timeout: Duration) -> CrlResult<Self> {
        Self::with_max_size(request_timeout, DEFAULT_MAX_CRL_SIZE)
    }

    /// Returns an error if the HTTP client cannot be initialized
    pub fn with_max_size(request_timeout: Duration, max_size: usize) -> CrlResult<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, max_size })
    }

    async fn download_one(&self, uri: &Url) -> CrlResult<Vec<u8>> {
        match uri.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(CrlError::Custom(format!(
                    "unsupported distribution point scheme '{scheme}' (must be http or https)"
                )));
            }
        }

        let response = self.client.get(uri.clone()).send().await?;

        if !response.status().is_success() {
            return Err(CrlError::Custom(format!(
                "HTTP error {}: failed to fetch CRL from {uri}",
                response.status()
            )));
        }

        if let Some(content_length) = response.content_length()
            && content_length as usize > self.max_size
        {
            return Err(CrlError::Custom(format!(
                "CRL from {uri} exceeds size limit ({content_length} > {} bytes)",
                self.max_size
            )));
        }

        let bytes = response.bytes().await?;

        if bytes.len() > self.max_size {
            return Err(CrlError::Custom(format!(
                "CRL from {uri} exceeds size limit ({} > {} bytes)",
                bytes.len(),
                self.max_size
            )));
        }

        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl CrlFetcher for HttpCrlFetcher {
    /// Try each URI of the set in order, returning the first successful
    /// download.
    async fn fetch(&self, points: &DistributionPointSet) -> CrlResult<Vec<u8>> {
        let mut last_error = None;

        for uri in points.iter() {
            debug!("fetching CRL from {uri}");
            match self.download_one(uri).await {
                Ok(bytes) => {
                    debug!("fetched {} bytes from {uri}", bytes.len());
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!("failed to fetch CRL from {uri}: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(CrlError::EmptyDistributionPoints))
    }
}
