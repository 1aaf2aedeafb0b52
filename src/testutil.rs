//! Hand-built DER fixtures for exercising CRL handling in tests.
//!
//! The builders produce syntactically valid X.509 structures with dummy
//! signatures. They are sufficient for parsing, expiry and issuer checks;
//! signature verification against them is expected to fail.

/// nextUpdate value in the past (2020-01-01T00:00:00Z).
pub const EXPIRED: &str = "200101000000Z";
/// nextUpdate value far in the future (2049-01-01T00:00:00Z).
pub const NOT_EXPIRED: &str = "490101000000Z";

const DEFAULT_THIS_UPDATE: &str = "240101000000Z";

// OID arcs, pre-encoded.
const OID_SHA256_WITH_RSA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b];
const OID_RSA_ENCRYPTION: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];
const OID_AT_COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];
const OID_CRL_DISTRIBUTION_POINTS: &[u8] = &[0x55, 0x1d, 0x1f];

fn encode_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let mut bytes = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        bytes.push((remaining & 0xff) as u8);
        remaining >>= 8;
    }
    bytes.reverse();
    let mut out = vec![0x80 | bytes.len() as u8];
    out.extend(bytes);
    out
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(encode_len(content.len()));
    out.extend_from_slice(content);
    out
}

fn der_integer(value: &[u8]) -> Vec<u8> {
    let mut content = value.to_vec();
    if content.is_empty() {
        content.push(0);
    }
    if content[0] & 0x80 != 0 {
        content.insert(0, 0);
    }
    tlv(0x02, &content)
}

fn utc_time(value: &str) -> Vec<u8> {
    tlv(0x17, value.as_bytes())
}

fn bit_string(content: &[u8]) -> Vec<u8> {
    let mut padded = vec![0x00];
    padded.extend_from_slice(content);
    tlv(0x03, &padded)
}

/// AlgorithmIdentifier for sha256WithRSAEncryption with NULL parameters.
fn signature_algorithm() -> Vec<u8> {
    let mut content = tlv(0x06, OID_SHA256_WITH_RSA);
    content.extend(tlv(0x05, &[]));
    tlv(0x30, &content)
}

/// A Name consisting of a single CN relative distinguished name.
fn common_name(cn: &str) -> Vec<u8> {
    let mut atv = tlv(0x06, OID_AT_COMMON_NAME);
    atv.extend(tlv(0x0c, cn.as_bytes()));
    let rdn = tlv(0x31, &tlv(0x30, &atv));
    tlv(0x30, &rdn)
}

/// Builder for a synthetic CRL.
pub struct SyntheticCrl {
    issuer_cn: String,
    this_update: String,
    next_update: Option<String>,
    revoked_serials: Vec<Vec<u8>>,
    signature_seed: u8,
}

impl SyntheticCrl {
    pub fn new(issuer_cn: &str) -> Self {
        Self {
            issuer_cn: issuer_cn.to_string(),
            this_update: DEFAULT_THIS_UPDATE.to_string(),
            next_update: Some(NOT_EXPIRED.to_string()),
            revoked_serials: Vec::new(),
            signature_seed: 0,
        }
    }

    /// Set the nextUpdate time (UTCTime text, e.g. [`EXPIRED`]).
    pub fn validity(mut self, next_update: &str) -> Self {
        self.next_update = Some(next_update.to_string());
        self
    }

    /// Omit the optional nextUpdate field entirely.
    pub fn without_next_update(mut self) -> Self {
        self.next_update = None;
        self
    }

    /// Add a revoked certificate entry (big-endian serial bytes).
    pub fn revoke_serial(mut self, serial: &[u8]) -> Self {
        self.revoked_serials.push(serial.to_vec());
        self
    }

    /// Vary the dummy signature so two otherwise identical CRLs differ
    /// byte-for-byte.
    pub fn signature_seed(mut self, seed: u8) -> Self {
        self.signature_seed = seed;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut tbs = der_integer(&[0x01]); // v2
        tbs.extend(signature_algorithm());
        tbs.extend(common_name(&self.issuer_cn));
        tbs.extend(utc_time(&self.this_update));
        if let Some(next_update) = &self.next_update {
            tbs.extend(utc_time(next_update));
        }
        if !self.revoked_serials.is_empty() {
            let mut entries = Vec::new();
            for serial in &self.revoked_serials {
                let mut entry = der_integer(serial);
                entry.extend(utc_time("240601000000Z"));
                entries.extend(tlv(0x30, &entry));
            }
            tbs.extend(tlv(0x30, &entries));
        }

        let mut crl = tlv(0x30, &tbs);
        crl.extend(signature_algorithm());
        crl.extend(bit_string(&[self.signature_seed.wrapping_add(0x11); 32]));
        tlv(0x30, &crl)
    }
}

/// Builder for a synthetic X.509 certificate, optionally carrying a
/// CRLDistributionPoints extension.
pub struct SyntheticCert {
    subject_cn: String,
    issuer_cn: String,
    crl_uris: Vec<String>,
}

impl SyntheticCert {
    pub fn new(subject_cn: &str) -> Self {
        Self {
            subject_cn: subject_cn.to_string(),
            issuer_cn: subject_cn.to_string(),
            crl_uris: Vec::new(),
        }
    }

    pub fn issued_by(mut self, issuer_cn: &str) -> Self {
        self.issuer_cn = issuer_cn.to_string();
        self
    }

    /// Add a CRL distribution point URI to the certificate.
    pub fn crl_uri(mut self, uri: &str) -> Self {
        self.crl_uris.push(uri.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // version [0] EXPLICIT INTEGER 2 (v3)
        let mut tbs = tlv(0xa0, &der_integer(&[0x02]));
        tbs.extend(der_integer(&[0x01]));
        tbs.extend(signature_algorithm());
        tbs.extend(common_name(&self.issuer_cn));

        let mut validity = utc_time(DEFAULT_THIS_UPDATE);
        validity.extend(utc_time(NOT_EXPIRED));
        tbs.extend(tlv(0x30, &validity));

        tbs.extend(common_name(&self.subject_cn));
        tbs.extend(Self::subject_public_key_info());

        if !self.crl_uris.is_empty() {
            tbs.extend(tlv(0xa3, &tlv(0x30, &self.crl_dp_extension())));
        }

        let mut cert = tlv(0x30, &tbs);
        cert.extend(signature_algorithm());
        cert.extend(bit_string(&[0x42; 32]));
        tlv(0x30, &cert)
    }

    fn subject_public_key_info() -> Vec<u8> {
        let mut alg = tlv(0x06, OID_RSA_ENCRYPTION);
        alg.extend(tlv(0x05, &[]));
        let mut content = tlv(0x30, &alg);
        content.extend(bit_string(&[0xab; 16]));
        tlv(0x30, &content)
    }

    fn crl_dp_extension(&self) -> Vec<u8> {
        // GeneralNames: [6] IA5String per URI, IMPLICIT under fullName [0],
        // wrapped in the EXPLICIT distributionPoint [0] of each point.
        let mut general_names = Vec::new();
        for uri in &self.crl_uris {
            general_names.extend(tlv(0x86, uri.as_bytes()));
        }
        let full_name = tlv(0xa0, &general_names);
        let point = tlv(0x30, &tlv(0xa0, &full_name));
        let value = tlv(0x30, &point);

        let mut ext = tlv(0x06, OID_CRL_DISTRIBUTION_POINTS);
        ext.extend(tlv(0x04, &value));
        tlv(0x30, &ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn synthetic_crl_parses() {
        let der = SyntheticCrl::new("Test CA")
            .revoke_serial(&[0x05, 0x39])
            .build();

        let (rest, crl) = CertificateRevocationList::from_der(&der).unwrap();
        assert!(rest.is_empty());
        assert_eq!(crl.tbs_cert_list.issuer.to_string(), "CN=Test CA");
        assert!(crl.tbs_cert_list.next_update.is_some());
        assert_eq!(crl.tbs_cert_list.revoked_certificates.len(), 1);
    }

    #[test]
    fn synthetic_cert_parses() {
        let der = SyntheticCert::new("Test CA")
            .crl_uri("http://crl.example/ca.crl")
            .build();

        let (rest, cert) = X509Certificate::from_der(&der).unwrap();
        assert!(rest.is_empty());
        assert_eq!(cert.subject().to_string(), "CN=Test CA");
    }
}
