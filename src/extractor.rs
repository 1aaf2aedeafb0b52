use tracing::{debug, warn};
use url::Url;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::oid_registry;
use x509_parser::prelude::*;

use crate::errors::{CrlError, CrlResult};
use crate::types::DistributionPointSet;

/// Extract CRL distribution point URIs from a certificate.
///
/// Reads the CRLDistributionPoints extension (OID 2.5.29.31) and collects
/// every URI general name found in full-name distribution points. URIs that
/// fail to parse are skipped with a warning. Certificates without the
/// extension, or whose extension yields no usable URI, produce an error.
pub fn extract_crl_distribution_points(
    cert: &X509Certificate<'_>,
) -> CrlResult<DistributionPointSet> {
    let mut uris = Vec::new();

    if let Ok(Some(ext)) =
        cert.get_extension_unique(&oid_registry::OID_X509_EXT_CRL_DISTRIBUTION_POINTS)
        && let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension()
    {
        for point in points.points.iter() {
            let Some(DistributionPointName::FullName(general_names)) = &point.distribution_point
            else {
                continue;
            };

            for general_name in general_names {
                if let GeneralName::URI(uri) = general_name {
                    match Url::parse(uri) {
                        Ok(parsed) => uris.push(parsed),
                        Err(e) => {
                            warn!("skipping malformed distribution point URI {uri}: {e}");
                        }
                    }
                }
            }
        }
    }

    if uris.is_empty() {
        debug!(
            "no CRL distribution points found in certificate {}",
            cert.subject()
        );
        return Err(CrlError::EmptyDistributionPoints);
    }

    DistributionPointSet::new(uris)
}
