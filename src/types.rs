use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use ::time::OffsetDateTime;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;
use x509_parser::prelude::*;

use crate::errors::{CrlError, CrlResult};

/// A deduplicated, order-independent set of distribution point URIs.
///
/// Two sets compare equal iff they contain the same URIs, regardless of the
/// order they were supplied in. Used as the cache key throughout the crate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DistributionPointSet(BTreeSet<Url>);

impl DistributionPointSet {
    /// Build a set from the given URIs. Empty sets are rejected.
    pub fn new<I: IntoIterator<Item = Url>>(uris: I) -> CrlResult<Self> {
        let set: BTreeSet<Url> = uris.into_iter().collect();
        if set.is_empty() {
            return Err(CrlError::EmptyDistributionPoints);
        }
        Ok(Self(set))
    }

    /// Build a set by parsing string URIs.
    pub fn parse<I, S>(uris: I) -> CrlResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = uris
            .into_iter()
            .map(|s| Url::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parsed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.0.contains(uri)
    }
}

impl fmt::Display for DistributionPointSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for uri in &self.0 {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{uri}")?;
            first = false;
        }
        Ok(())
    }
}

/// A parsed Certificate Revocation List.
///
/// Holds the DER encoding together with metadata extracted once at parse
/// time, so later checks do not have to re-parse the document.
#[derive(Debug, Clone)]
pub struct CrlData {
    der: Arc<Vec<u8>>,
    issuer: String,
    this_update: OffsetDateTime,
    next_update: Option<OffsetDateTime>,
}

impl CrlData {
    /// Parse a CRL from PEM or DER bytes.
    pub fn from_bytes(bytes: &[u8]) -> CrlResult<Self> {
        let der = if let Ok(parsed_pem) = ::pem::parse(bytes) {
            parsed_pem.contents().to_vec()
        } else {
            bytes.to_vec()
        };
        Self::from_der(der)
    }

    /// Parse a CRL from DER bytes.
    pub fn from_der(der: Vec<u8>) -> CrlResult<Self> {
        let (_, crl) =
            CertificateRevocationList::from_der(&der).map_err(|e| CrlError::Parse(e.into()))?;

        let issuer = crl.tbs_cert_list.issuer.to_string();
        let this_update = crl.tbs_cert_list.this_update.to_datetime();
        let next_update = crl.tbs_cert_list.next_update.map(|t| t.to_datetime());

        Ok(Self {
            der: Arc::new(der),
            issuer,
            this_update,
            next_update,
        })
    }

    /// The DER encoding of this CRL.
    pub fn der_bytes(&self) -> &[u8] {
        &self.der
    }

    /// The distinguished name of the CRL issuer.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn this_update(&self) -> OffsetDateTime {
        self.this_update
    }

    pub fn next_update(&self) -> Option<OffsetDateTime> {
        self.next_update
    }

    /// Whether this CRL is past its nextUpdate time.
    ///
    /// CRLs without a nextUpdate field are never considered expired by this
    /// check alone.
    pub fn is_expired(&self) -> bool {
        match self.next_update {
            Some(next_update) => next_update < OffsetDateTime::now_utc(),
            None => false,
        }
    }

    /// Re-parse the underlying DER document.
    pub fn parse(&self) -> CrlResult<CertificateRevocationList<'_>> {
        let (_, crl) =
            CertificateRevocationList::from_der(&self.der).map_err(|e| CrlError::Parse(e.into()))?;
        Ok(crl)
    }

    /// Check whether the given certificate serial number (big-endian bytes)
    /// is listed as revoked by this CRL.
    pub fn is_revoked(&self, serial_number: &[u8]) -> bool {
        let Ok(crl) = self.parse() else {
            tracing::warn!("failed to re-parse stored CRL from {}", self.issuer);
            return false;
        };

        crl.tbs_cert_list
            .revoked_certificates
            .iter()
            .any(|revoked| revoked.user_certificate.to_bytes_be() == serial_number)
    }
}

impl PartialEq for CrlData {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for CrlData {}

/// An immutable pairing of a distribution point set and the CRL obtained
/// from it. This is the unit stored and persisted by [`CrlStore`].
///
/// [`CrlStore`]: crate::store::CrlStore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCrl {
    distribution_points: DistributionPointSet,
    crl: CrlData,
}

impl StoredCrl {
    pub fn new(distribution_points: DistributionPointSet, crl: CrlData) -> Self {
        Self {
            distribution_points,
            crl,
        }
    }

    pub fn distribution_points(&self) -> &DistributionPointSet {
        &self.distribution_points
    }

    pub fn crl(&self) -> &CrlData {
        &self.crl
    }
}

/// On-disk record format: the URI set as strings plus the base64 DER body.
#[derive(Serialize, Deserialize)]
struct CrlRecord {
    dps: Vec<String>,
    body: String,
}

impl From<&StoredCrl> for CrlRecord {
    fn from(stored: &StoredCrl) -> Self {
        Self {
            dps: stored
                .distribution_points
                .iter()
                .map(|uri| uri.to_string())
                .collect(),
            body: BASE64.encode(stored.crl.der_bytes()),
        }
    }
}

impl TryFrom<CrlRecord> for StoredCrl {
    type Error = CrlError;

    fn try_from(record: CrlRecord) -> CrlResult<Self> {
        let distribution_points = DistributionPointSet::parse(&record.dps)?;
        let der = BASE64.decode(record.body.as_bytes())?;
        Ok(Self {
            distribution_points,
            crl: CrlData::from_der(der)?,
        })
    }
}

impl Serialize for StoredCrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        CrlRecord::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StoredCrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = CrlRecord::deserialize(deserializer)?;
        StoredCrl::try_from(record).map_err(D::Error::custom)
    }
}
