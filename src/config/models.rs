//! Configuration data structures for Trellis.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! They are intentionally serde‑friendly and carry defaults so that minimal
//! configs remain concise. `RouterConfig` is the raw deserialized form;
//! [`RouterConfig::process`] turns it into the validated [`RouterSettings`]
//! struct the rest of the system consumes.
use std::{net::IpAddr, time::Duration};

use ipnet::IpNet;
use rustls::SupportedCipherSuite;
use serde::{Deserialize, Serialize};

use crate::config::validation::{self, ValidationError};

/// Admin status endpoint configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub port: u16,
    pub user: String,
    pub pass: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            port: 8082,
            user: String::new(),
            pass: String::new(),
        }
    }
}

/// Access log sink configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Path of the access log file. Empty disables the file sink.
    pub file: String,
    /// Also emit each record on the structured log stream.
    pub enable_streaming: bool,
}

/// Log output format.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Routing-API event source (snapshot + SSE stream).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RoutingApiConfig {
    pub uri: String,
    pub port: u16,
}

impl RoutingApiConfig {
    pub fn enabled(&self) -> bool {
        !self.uri.is_empty() && self.port != 0
    }
}

/// Raw router configuration as it appears on disk.
///
/// Interval and timeout fields are plain seconds; `process` converts them to
/// `Duration`s and resolves derived values.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConfig {
    pub status: StatusConfig,
    pub logging: LoggingConfig,
    pub access_log: AccessLogConfig,

    pub port: u16,
    pub enable_ssl: bool,
    pub ssl_port: u16,
    pub ssl_cert_path: String,
    pub ssl_key_path: String,
    /// Colon-separated list of IANA cipher suite names. Required when
    /// `enable_ssl` is set; unknown names are a fatal configuration error.
    pub cipher_suites: String,

    pub trace_key: String,
    /// Accept a PROXY-protocol v1 preamble on inbound connections.
    pub enable_proxy: bool,

    pub prune_stale_droplets_interval: u64,
    pub droplet_stale_threshold: u64,
    pub endpoint_timeout: u64,
    pub route_services_timeout: u64,
    pub drain_wait: u64,
    pub drain_timeout: u64,

    pub secure_cookies: bool,
    pub route_services_secret: String,
    pub route_services_secret_decrypt_only: String,
    pub route_services_recommend_https: bool,

    pub extra_headers_to_log: Vec<String>,
    /// CIDR of the preferred backend network, e.g. `10.0.0.0/24`. Empty
    /// disables preferred-subnet selection.
    pub preferred_network: String,

    pub routing_api: RoutingApiConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            status: StatusConfig::default(),
            logging: LoggingConfig::default(),
            access_log: AccessLogConfig::default(),

            port: 8081,
            enable_ssl: false,
            ssl_port: 443,
            ssl_cert_path: String::new(),
            ssl_key_path: String::new(),
            cipher_suites: String::new(),

            trace_key: String::new(),
            enable_proxy: false,

            prune_stale_droplets_interval: 30,
            droplet_stale_threshold: 120,
            endpoint_timeout: 60,
            route_services_timeout: 60,
            drain_wait: 0,
            drain_timeout: 0,

            secure_cookies: false,
            route_services_secret: String::new(),
            route_services_secret_decrypt_only: String::new(),
            route_services_recommend_https: false,

            extra_headers_to_log: Vec::new(),
            preferred_network: String::new(),

            routing_api: RoutingApiConfig::default(),
        }
    }
}

/// Route-service signing keys, present when route services are enabled.
#[derive(Debug, Clone)]
pub struct RouteServiceKeys {
    /// Current encryption / decryption key.
    pub secret: Vec<u8>,
    /// Previous key, decrypt-only, used during key rotation.
    pub secret_decrypt_only: Option<Vec<u8>>,
}

/// TLS listener settings resolved from the raw config.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: String,
    pub key_path: String,
    pub cipher_suites: Vec<SupportedCipherSuite>,
}

/// Fully processed configuration consumed by the rest of the system.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub status: StatusConfig,
    pub logging: LoggingConfig,
    pub access_log: AccessLogConfig,

    pub port: u16,
    pub ssl_port: u16,
    pub tls: Option<TlsSettings>,

    pub trace_key: Option<String>,
    pub enable_proxy: bool,

    pub prune_stale_droplets_interval: Duration,
    pub droplet_stale_threshold: Duration,
    pub endpoint_timeout: Duration,
    pub route_service_timeout: Duration,
    pub drain_wait: Duration,
    pub drain_timeout: Duration,

    pub secure_cookies: bool,
    pub route_services: Option<RouteServiceKeys>,
    pub route_services_recommend_https: bool,

    pub extra_headers_to_log: Vec<String>,
    pub preferred_network: Option<IpNet>,

    pub routing_api: RoutingApiConfig,

    /// Address this router reports in trace headers.
    pub ip: IpAddr,
}

impl RouterConfig {
    /// Resolve the raw config into [`RouterSettings`].
    ///
    /// Fatal problems (unknown cipher names, malformed CIDR, bad key sizes)
    /// surface as [`ValidationError`]s here rather than at request time.
    pub fn process(self) -> Result<RouterSettings, ValidationError> {
        let tls = if self.enable_ssl {
            Some(TlsSettings {
                cipher_suites: validation::parse_cipher_suites(&self.cipher_suites)?,
                cert_path: validation::require_path("ssl_cert_path", &self.ssl_cert_path)?,
                key_path: validation::require_path("ssl_key_path", &self.ssl_key_path)?,
            })
        } else {
            None
        };

        let preferred_network = if self.preferred_network.is_empty() {
            None
        } else {
            Some(validation::parse_preferred_network(&self.preferred_network)?)
        };

        let route_services = if self.route_services_secret.is_empty() {
            None
        } else {
            Some(RouteServiceKeys {
                secret: validation::check_aead_key(
                    "route_services_secret",
                    &self.route_services_secret,
                )?,
                secret_decrypt_only: if self.route_services_secret_decrypt_only.is_empty() {
                    None
                } else {
                    Some(validation::check_aead_key(
                        "route_services_secret_decrypt_only",
                        &self.route_services_secret_decrypt_only,
                    )?)
                },
            })
        };

        let endpoint_timeout = Duration::from_secs(self.endpoint_timeout);
        let drain_timeout = if self.drain_timeout > 0 {
            Duration::from_secs(self.drain_timeout)
        } else {
            endpoint_timeout
        };

        // Trace headers report the router's address; on hosts with no
        // routable interface (CI sandboxes) fall back to loopback.
        let ip = local_ip_address::local_ip()
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

        Ok(RouterSettings {
            status: self.status,
            logging: self.logging,
            access_log: self.access_log,

            port: self.port,
            ssl_port: self.ssl_port,
            tls,

            trace_key: if self.trace_key.is_empty() {
                None
            } else {
                Some(self.trace_key)
            },
            enable_proxy: self.enable_proxy,

            prune_stale_droplets_interval: Duration::from_secs(self.prune_stale_droplets_interval),
            droplet_stale_threshold: Duration::from_secs(self.droplet_stale_threshold),
            endpoint_timeout,
            route_service_timeout: Duration::from_secs(self.route_services_timeout),
            drain_wait: Duration::from_secs(self.drain_wait),
            drain_timeout,

            secure_cookies: self.secure_cookies,
            route_services,
            route_services_recommend_https: self.route_services_recommend_https,

            extra_headers_to_log: self.extra_headers_to_log,
            preferred_network,

            routing_api: self.routing_api,

            ip,
        })
    }
}

impl RouterSettings {
    /// Retry window used by new pools, derived from the stale threshold.
    pub fn retry_after_failure(&self) -> Duration {
        self.droplet_stale_threshold / 4
    }
}
