//! Routing-API ingestion: a full snapshot at startup, then a server-sent
//! event stream of UPSERT / DELETE route events carrying explicit
//! modification tags.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use futures_util::StreamExt;
use serde::Deserialize;

use crate::{
    config::models::RoutingApiConfig,
    core::{Endpoint, ModificationTag, RouteRegistry},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// One route as described by the routing API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRoute {
    pub route: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub log_guid: Option<String>,
    #[serde(default)]
    pub route_service_url: Option<String>,
    #[serde(default)]
    pub modification_tag: ModificationTag,
}

impl ApiRoute {
    fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.ip.clone(),
            port: self.port,
            application_id: self.log_guid.clone().unwrap_or_default(),
            stale_threshold: self.ttl.map(Duration::from_secs),
            route_service_url: self.route_service_url.clone(),
            modification_tag: self.modification_tag.clone(),
            ..Endpoint::default()
        }
    }
}

/// One parsed server-sent event.
#[derive(Debug, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental parser for an SSE byte stream: feed chunks, take events.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        // Events are separated by a blank line.
        while let Some(end) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..end + 2).collect();
            let mut event = String::new();
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = value.trim().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(value.trim());
                }
            }
            if !event.is_empty() || !data.is_empty() {
                events.push(SseEvent { event, data });
            }
        }
        events
    }
}

/// Follows the routing API and mirrors it into the registry.
pub struct RoutingApiAdapter {
    registry: Arc<RouteRegistry>,
    client: reqwest::Client,
    base: String,
}

impl RoutingApiAdapter {
    pub fn new(registry: Arc<RouteRegistry>, config: &RoutingApiConfig) -> Self {
        Self {
            registry,
            client: reqwest::Client::new(),
            base: format!("{}:{}", config.uri.trim_end_matches('/'), config.port),
        }
    }

    /// Replay the snapshot, then follow the event stream, reconnecting (and
    /// re-snapshotting) whenever it drops.
    pub async fn run(self) {
        loop {
            if let Err(e) = self.snapshot().await {
                tracing::warn!(error = %e, "routing api snapshot failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
            if let Err(e) = self.follow_events().await {
                tracing::warn!(error = %e, "routing api event stream dropped");
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn snapshot(&self) -> Result<()> {
        let url = format!("{}/routing/v1/routes", self.base);
        let routes: Vec<ApiRoute> = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("snapshot request failed")?
            .error_for_status()
            .wrap_err("snapshot request rejected")?
            .json()
            .await
            .wrap_err("snapshot payload malformed")?;

        tracing::info!(routes = routes.len(), "replaying routing api snapshot");
        for route in &routes {
            self.registry.register(&route.route, route.endpoint());
        }
        Ok(())
    }

    async fn follow_events(&self) -> Result<()> {
        let url = format!("{}/routing/v1/events", self.base);
        let response = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .wrap_err("event stream request failed")?
            .error_for_status()
            .wrap_err("event stream request rejected")?;

        let mut parser = SseParser::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.wrap_err("event stream read failed")?;
            for event in parser.feed(&chunk) {
                self.apply_event(&event);
            }
        }
        Ok(())
    }

    pub fn apply_event(&self, event: &SseEvent) {
        let route: ApiRoute = match serde_json::from_str(&event.data) {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(error = %e, event = %event.event, "dropping malformed route event");
                return;
            }
        };

        match event.event.as_str() {
            "UPSERT" => self.registry.register(&route.route, route.endpoint()),
            "DELETE" => self.registry.unregister(&route.route, &route.endpoint()),
            other => tracing::warn!(event = other, "ignoring unknown route event"),
        }
    }
}
