//! Pub/sub ingestion: translates `router.register` / `router.unregister`
//! messages into registry mutations.
//!
//! The bus client itself is an external collaborator; this adapter consumes
//! a stream of `(subject, payload)` pairs, so any client that can feed a
//! channel can drive the registry.
use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::core::{Endpoint, RouteRegistry};

pub const REGISTER_SUBJECT: &str = "router.register";
pub const UNREGISTER_SUBJECT: &str = "router.unregister";

/// JSON payload of a register/unregister message.
#[derive(Debug, Deserialize)]
pub struct RegistryMessage {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub private_instance_id: String,
    #[serde(default)]
    pub private_instance_index: Option<String>,
    #[serde(default)]
    pub route_service_url: Option<String>,
    #[serde(default)]
    pub stale_threshold_in_seconds: Option<u64>,
}

impl RegistryMessage {
    fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            application_id: self.app.clone(),
            private_instance_id: self.private_instance_id.clone(),
            private_instance_index: self.private_instance_index.clone().unwrap_or_default(),
            tags: self.tags.clone(),
            stale_threshold: self.stale_threshold_in_seconds.map(Duration::from_secs),
            route_service_url: self.route_service_url.clone(),
            // Bus messages carry no modification tag; the default (empty)
            // tag is always superseded, so arrival order wins.
            modification_tag: Default::default(),
        }
    }
}

/// One message as delivered by the bus client.
#[derive(Debug)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Applies bus messages to the registry.
pub struct MessageBusAdapter {
    registry: Arc<RouteRegistry>,
}

impl MessageBusAdapter {
    pub fn new(registry: Arc<RouteRegistry>) -> Self {
        Self { registry }
    }

    /// Apply a single message. Unknown subjects and malformed payloads are
    /// logged and dropped; the bus is not a trusted input.
    pub fn apply(&self, subject: &str, payload: &[u8]) {
        let message: RegistryMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(subject, error = %e, "dropping malformed registry message");
                return;
            }
        };

        let endpoint = message.endpoint();
        match subject {
            REGISTER_SUBJECT => {
                for uri in &message.uris {
                    self.registry.register(uri, endpoint.clone());
                }
            }
            UNREGISTER_SUBJECT => {
                for uri in &message.uris {
                    self.registry.unregister(uri, &endpoint);
                }
            }
            other => {
                tracing::warn!(subject = other, "ignoring message on unknown subject");
            }
        }
    }

    /// Drain a message channel until the sender goes away.
    pub async fn run(self, mut rx: mpsc::Receiver<BusMessage>) {
        while let Some(message) = rx.recv().await {
            self.apply(&message.subject, &message.payload);
        }
        tracing::info!("message bus stream ended");
    }
}
