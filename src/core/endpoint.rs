//! Backend endpoint records and control-plane modification tags.
use std::{collections::HashMap, net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

/// Monotonic `(guid, index)` tag attached by the control plane to make
/// register/unregister idempotent and reorderable.
///
/// Ordering is only defined within one guid: there the index decides.
/// Indices are never compared across guids; a message carrying a different
/// guid is treated as the newer arrival. An empty guid is always superseded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationTag {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub index: u64,
}

impl ModificationTag {
    pub fn new(guid: &str, index: u64) -> Self {
        Self {
            guid: guid.to_string(),
            index,
        }
    }

    /// True when `other` strictly supersedes `self`.
    pub fn succeeded_by(&self, other: &ModificationTag) -> bool {
        if self.guid.is_empty() || other.guid.is_empty() {
            return true;
        }
        if self.guid != other.guid {
            return true;
        }
        other.index > self.index
    }

    /// True when `other` is the same tag or strictly supersedes `self`.
    pub fn same_or_newer(&self, other: &ModificationTag) -> bool {
        self == other || self.succeeded_by(other)
    }

    pub fn increment(&mut self) {
        self.index += 1;
    }
}

/// One backend instance: an address plus application metadata.
///
/// Immutable by convention once registered; updates arrive as whole new
/// records guarded by the modification tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub application_id: String,
    pub private_instance_id: String,
    pub private_instance_index: String,
    pub tags: HashMap<String, String>,
    /// Per-endpoint staleness override. `None` means the registry default.
    pub stale_threshold: Option<Duration>,
    pub route_service_url: Option<String>,
    pub modification_tag: ModificationTag,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Canonical `host:port` form, the pool's primary index key.
    pub fn canonical_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    pub fn component(&self) -> Option<&str> {
        self.tags.get("component").map(String::as_str)
    }

    /// Snapshot used by the admin endpoint's JSON marshalling.
    pub fn to_json(&self) -> serde_json::Value {
        let ttl = self
            .stale_threshold
            .map(|t| t.as_secs() as i64)
            .unwrap_or(-1);
        match &self.route_service_url {
            Some(url) => serde_json::json!({
                "address": self.canonical_addr(),
                "ttl": ttl,
                "route_service_url": url,
            }),
            None => serde_json::json!({
                "address": self.canonical_addr(),
                "ttl": ttl,
            }),
        }
    }
}
