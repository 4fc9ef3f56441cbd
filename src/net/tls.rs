//! TLS listener construction.
use std::sync::Arc;

use eyre::{Result, WrapErr};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::models::TlsSettings;

/// Build the TLS acceptor for the SSL listener, restricted to the
/// configured cipher suites.
pub fn build_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    let certs = load_certs(&settings.cert_path)?;
    let key = load_key(&settings.key_path)?;

    let provider = rustls::crypto::CryptoProvider {
        cipher_suites: settings.cipher_suites.clone(),
        ..rustls::crypto::aws_lc_rs::default_provider()
    };

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .wrap_err("cipher suite list supports no protocol version")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .wrap_err("invalid certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).wrap_err_with(|| format!("failed to read certificate {path}"))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .wrap_err_with(|| format!("malformed certificate in {path}"))?;
    if certs.is_empty() {
        eyre::bail!("no certificates found in {path}");
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).wrap_err_with(|| format!("failed to read key {path}"))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .wrap_err_with(|| format!("malformed private key in {path}"))?
        .ok_or_else(|| eyre::eyre!("no private key found in {path}"))
}
