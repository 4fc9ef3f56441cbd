//! Configuration validation helpers.
//!
//! Everything here fails fast: a router that boots with a half-understood
//! config would silently misroute traffic, so unknown cipher names, bad
//! CIDRs and undersized keys abort startup with a precise error.
use std::path::Path;

use ipnet::IpNet;
use rustls::SupportedCipherSuite;

/// Validation error types.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid cipher string configuration: {name}, please choose from {supported:?}")]
    UnknownCipher {
        name: String,
        supported: Vec<&'static str>,
    },

    #[error("must specify list of cipher suites when ssl is enabled")]
    EmptyCipherList,

    #[error("invalid preferred_network '{cidr}': {reason}")]
    InvalidPreferredNetwork { cidr: String, reason: String },

    #[error("{field} must be a 16-byte AES-128 key, got {len} bytes")]
    InvalidKeyLength { field: &'static str, len: usize },

    #[error("{field}: file does not exist: {path}")]
    MissingFile { field: &'static str, path: String },
}

/// IANA cipher suite names recognised for the TLS listener, paired with the
/// rustls suites implementing them. CBC-mode suites are not offered by
/// rustls and therefore not accepted here.
fn cipher_table() -> Vec<(&'static str, SupportedCipherSuite)> {
    use rustls::crypto::aws_lc_rs::cipher_suite as suites;
    vec![
        (
            "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            suites::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ),
        (
            "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            suites::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            suites::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ),
        (
            "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            suites::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
            suites::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
        ("TLS_AES_128_GCM_SHA256", suites::TLS13_AES_128_GCM_SHA256),
        ("TLS_AES_256_GCM_SHA384", suites::TLS13_AES_256_GCM_SHA384),
        (
            "TLS_CHACHA20_POLY1305_SHA256",
            suites::TLS13_CHACHA20_POLY1305_SHA256,
        ),
    ]
}

/// Translate a colon-separated list of IANA cipher names into rustls suites.
/// Unknown names are a fatal configuration error.
pub fn parse_cipher_suites(spec: &str) -> Result<Vec<SupportedCipherSuite>, ValidationError> {
    if spec.trim().is_empty() {
        return Err(ValidationError::EmptyCipherList);
    }

    let table = cipher_table();
    let mut suites = Vec::new();
    for name in spec.split(':') {
        match table.iter().find(|(n, _)| *n == name) {
            Some((_, suite)) => suites.push(*suite),
            None => {
                return Err(ValidationError::UnknownCipher {
                    name: name.to_string(),
                    supported: table.iter().map(|(n, _)| *n).collect(),
                });
            }
        }
    }
    Ok(suites)
}

pub fn parse_preferred_network(cidr: &str) -> Result<IpNet, ValidationError> {
    cidr.parse::<IpNet>()
        .map_err(|e| ValidationError::InvalidPreferredNetwork {
            cidr: cidr.to_string(),
            reason: e.to_string(),
        })
}

/// Route-service secrets key AES-128-GCM and must be exactly 16 bytes.
pub fn check_aead_key(field: &'static str, secret: &str) -> Result<Vec<u8>, ValidationError> {
    let bytes = secret.as_bytes();
    if bytes.len() != 16 {
        return Err(ValidationError::InvalidKeyLength {
            field,
            len: bytes.len(),
        });
    }
    Ok(bytes.to_vec())
}

pub fn require_path(field: &'static str, path: &str) -> Result<String, ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if !Path::new(path).exists() {
        return Err(ValidationError::MissingFile {
            field,
            path: path.to_string(),
        });
    }
    Ok(path.to_string())
}
