use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::errors::{CrlError, CrlResult};
use crate::types::CrlData;

/// Validates a freshly fetched CRL before it is admitted to the store.
///
/// Expected to be a pure predicate; it may perform cryptographic signature
/// checking against a trust anchor set maintained outside this crate.
pub trait CrlVerifier: Send + Sync {
    fn verify(&self, crl: &CrlData) -> bool;
}

impl<F> CrlVerifier for F
where
    F: Fn(&CrlData) -> bool + Send + Sync,
{
    fn verify(&self, crl: &CrlData) -> bool {
        self(crl)
    }
}

/// Verifier that accepts a CRL iff its signature checks out against the
/// public key of any of a fixed set of trust anchor certificates.
pub struct TrustAnchorVerifier {
    anchors: Vec<Vec<u8>>,
}

impl TrustAnchorVerifier {
    /// Build a verifier from DER encoded trust anchor certificates.
    ///
    /// Returns an error if any of the certificates cannot be parsed.
    pub fn new<I>(der_certs: I) -> CrlResult<Self>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let anchors: Vec<Vec<u8>> = der_certs.into_iter().collect();
        for der in &anchors {
            X509Certificate::from_der(der).map_err(|e| CrlError::Parse(e.into()))?;
        }
        Ok(Self { anchors })
    }

    fn verify_against(&self, anchor_der: &[u8], crl: &CertificateRevocationList<'_>) -> bool {
        let Ok((_, anchor)) = X509Certificate::from_der(anchor_der) else {
            return false;
        };

        match x509_parser::verify::verify_signature(
            &anchor.tbs_certificate.subject_pki,
            &crl.signature_algorithm,
            &crl.signature_value,
            crl.tbs_cert_list.as_ref(),
        ) {
            Ok(()) => {
                debug!(
                    "CRL from {} verified against anchor {}",
                    crl.tbs_cert_list.issuer,
                    anchor.subject()
                );
                true
            }
            Err(_) => false,
        }
    }
}

impl CrlVerifier for TrustAnchorVerifier {
    fn verify(&self, crl: &CrlData) -> bool {
        let parsed = match crl.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("failed to parse CRL for verification: {e}");
                return false;
            }
        };

        self.anchors
            .iter()
            .any(|anchor| self.verify_against(anchor, &parsed))
    }
}
