use thiserror::Error;
use x509_parser::prelude::X509Error;

/// CRL-related errors
#[derive(Error, Debug)]
pub enum CrlError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CRL parsing failed: {0}")]
    Parse(#[from] X509Error),

    #[error("invalid distribution point URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store record serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store record body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("timeout while fetching CRL")]
    Timeout,

    #[error("distribution point set must not be empty")]
    EmptyDistributionPoints,

    #[error("CRL signature verification failed")]
    SignatureVerification,

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Convenient Result type alias
pub type CrlResult<T> = Result<T, CrlError>;
