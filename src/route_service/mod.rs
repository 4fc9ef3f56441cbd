//! Route-service redirection: signed metadata for requests detoured through
//! an external route service before reaching their backend.
//!
//! The signature is a JSON blob `{requested_time, forwarded_url}` sealed
//! with AES-128-GCM under the configured symmetric key and base64url-encoded
//! into `X-CF-Proxy-Signature`; the random nonce travels base64url-encoded
//! inside the JSON `X-CF-Proxy-Metadata` blob. Validation accepts the
//! current key or, during rotation, the previous decrypt-only key.
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes128Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the encrypted signature.
pub const ROUTE_SERVICE_SIGNATURE: &str = "X-CF-Proxy-Signature";
/// Header carrying the encryption metadata (nonce).
pub const ROUTE_SERVICE_METADATA: &str = "X-CF-Proxy-Metadata";
/// Header carrying the original URL the route service must forward back to.
pub const ROUTE_SERVICE_FORWARDED_URL: &str = "X-CF-Forwarded-Url";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteServiceError {
    #[error("route service request expired")]
    Expired,
    #[error("route service forwarded URL mismatch")]
    ForwardedUrlMismatch,
    #[error("route service signature authentication failed")]
    SignatureInvalid,
}

/// The signed payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signature {
    pub requested_time: DateTime<Utc>,
    #[serde(default)]
    pub forwarded_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    nonce: String,
}

/// AES-128-GCM sealer/unsealer for signature blobs.
pub struct Crypto {
    cipher: Aes128Gcm,
}

impl Crypto {
    /// The key must be exactly 16 bytes; config validation enforces this
    /// before a `Crypto` is ever built.
    pub fn new(key: &[u8]) -> Result<Self, RouteServiceError> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| RouteServiceError::SignatureInvalid)?;
        Ok(Self { cipher })
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), RouteServiceError> {
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| RouteServiceError::SignatureInvalid)?;
        Ok((ciphertext, nonce.to_vec()))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, RouteServiceError> {
        if nonce.len() != 12 {
            return Err(RouteServiceError::SignatureInvalid);
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RouteServiceError::SignatureInvalid)
    }
}

/// Seal a signature into its header pair `(signature, metadata)`.
pub fn build_signature_and_metadata(
    crypto: &Crypto,
    signature: &Signature,
) -> Result<(String, String), RouteServiceError> {
    let plaintext =
        serde_json::to_vec(signature).map_err(|_| RouteServiceError::SignatureInvalid)?;
    let (ciphertext, nonce) = crypto.encrypt(&plaintext)?;

    let metadata = Metadata {
        nonce: STANDARD.encode(nonce),
    };
    let metadata_json =
        serde_json::to_vec(&metadata).map_err(|_| RouteServiceError::SignatureInvalid)?;

    Ok((URL_SAFE.encode(ciphertext), URL_SAFE.encode(metadata_json)))
}

/// Unseal a signature from its header pair.
pub fn signature_from_headers(
    signature_header: &str,
    metadata_header: &str,
    crypto: &Crypto,
) -> Result<Signature, RouteServiceError> {
    let metadata_json = URL_SAFE
        .decode(metadata_header)
        .map_err(|_| RouteServiceError::SignatureInvalid)?;
    let metadata: Metadata =
        serde_json::from_slice(&metadata_json).map_err(|_| RouteServiceError::SignatureInvalid)?;
    let nonce = STANDARD
        .decode(&metadata.nonce)
        .map_err(|_| RouteServiceError::SignatureInvalid)?;

    let ciphertext = URL_SAFE
        .decode(signature_header)
        .map_err(|_| RouteServiceError::SignatureInvalid)?;
    let plaintext = crypto.decrypt(&ciphertext, &nonce)?;

    serde_json::from_slice(&plaintext).map_err(|_| RouteServiceError::SignatureInvalid)
}

/// Runtime configuration for route-service signing and validation.
pub struct RouteServiceConfig {
    crypto: Crypto,
    crypto_prev: Option<Crypto>,
    timeout: ChronoDuration,
    recommend_https: bool,
}

impl RouteServiceConfig {
    pub fn new(
        crypto: Crypto,
        crypto_prev: Option<Crypto>,
        timeout: std::time::Duration,
        recommend_https: bool,
    ) -> Self {
        Self {
            crypto,
            crypto_prev,
            timeout: ChronoDuration::from_std(timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            recommend_https,
        }
    }

    pub fn recommend_https(&self) -> bool {
        self.recommend_https
    }

    /// Build the header values for an outbound route-service detour.
    pub fn generate_headers(
        &self,
        forwarded_url: &str,
    ) -> Result<(String, String), RouteServiceError> {
        let signature = Signature {
            requested_time: Utc::now(),
            forwarded_url: forwarded_url.to_string(),
        };
        build_signature_and_metadata(&self.crypto, &signature)
    }

    /// Validate an inbound signed request coming back from a route service.
    /// `expected_forwarded_url` is re-derived from the request itself.
    pub fn validate_signature(
        &self,
        signature_header: &str,
        metadata_header: &str,
        expected_forwarded_url: &str,
    ) -> Result<(), RouteServiceError> {
        let signature =
            match signature_from_headers(signature_header, metadata_header, &self.crypto) {
                Ok(signature) => signature,
                Err(_) => match &self.crypto_prev {
                    Some(prev) => signature_from_headers(signature_header, metadata_header, prev)?,
                    None => return Err(RouteServiceError::SignatureInvalid),
                },
            };

        if Utc::now() - signature.requested_time > self.timeout {
            return Err(RouteServiceError::Expired);
        }

        if signature.forwarded_url != expected_forwarded_url {
            return Err(RouteServiceError::ForwardedUrlMismatch);
        }

        Ok(())
    }
}
