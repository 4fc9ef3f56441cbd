//! The route registry: the single shared structure between the control
//! plane and the data plane.
//!
//! Lookups take the read lock and release it before the pool is handed to
//! the caller (iteration is governed by the pool's own lock, so a request in
//! flight never blocks registration). `register`, `unregister` and the
//! pruner serialize on the write lock; their effective order is governed by
//! modification-tag comparison, not arrival order.
use std::{
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;

use crate::{
    config::RouterSettings,
    core::{endpoint::Endpoint, pool::Pool, route_key::RouteKey, trie::Trie},
    metrics,
};

struct RegistryInner {
    by_uri: Trie,
    time_of_last_update: Option<Instant>,
}

pub struct RouteRegistry {
    inner: RwLock<RegistryInner>,
    prune_interval: Duration,
    stale_threshold: Duration,
    retry_after_failure: Duration,
    preferred_network: Option<ipnet::IpNet>,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl RouteRegistry {
    pub fn new(settings: &RouterSettings) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_uri: Trie::new(),
                time_of_last_update: None,
            }),
            prune_interval: settings.prune_stale_droplets_interval,
            stale_threshold: settings.droplet_stale_threshold,
            retry_after_failure: settings.retry_after_failure(),
            preferred_network: settings.preferred_network,
            pruner: Mutex::new(None),
        }
    }

    pub fn register(&self, uri: &str, endpoint: Endpoint) {
        let key = RouteKey::from_uri(uri);
        let mut inner = self.inner.write().expect("registry lock poisoned");

        let pool = match inner.by_uri.find(&key) {
            Some(pool) => pool,
            None => {
                let pool = Arc::new(Pool::new(
                    self.retry_after_failure,
                    &key.context_path(),
                    self.preferred_network,
                ));
                inner.by_uri.insert(&key, pool.clone());
                pool
            }
        };

        pool.put(endpoint);
        inner.time_of_last_update = Some(Instant::now());
    }

    pub fn unregister(&self, uri: &str, endpoint: &Endpoint) {
        let key = RouteKey::from_uri(uri);
        let mut inner = self.inner.write().expect("registry lock poisoned");

        if let Some(pool) = inner.by_uri.find(&key) {
            pool.remove(endpoint);
            if pool.is_empty() {
                inner.by_uri.delete(&key);
            }
        }
    }

    /// Resolve a host + path to its pool, trying ever-more-general wildcard
    /// hosts until the chain is exhausted.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<Pool>> {
        let inner = self.inner.read().expect("registry lock poisoned");

        let mut key = RouteKey::from_parts(host, path);
        loop {
            if let Some(pool) = inner.by_uri.match_uri(&key) {
                return Some(pool);
            }
            key = key.next_wildcard()?;
        }
    }

    /// Start the background pruning task. Idempotent; a no-op when the
    /// configured interval is zero.
    pub fn start_pruning_cycle(self: Arc<Self>) {
        if self.prune_interval.is_zero() {
            return;
        }

        let mut pruner = self.pruner.lock().expect("pruner handle lock poisoned");
        if pruner.is_some() {
            return;
        }

        let registry = self.clone();
        *pruner = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.prune_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.prune_stale_droplets();
            }
        }));
    }

    pub fn stop_pruning_cycle(&self) {
        if let Some(handle) = self.pruner.lock().expect("pruner handle lock poisoned").take() {
            handle.abort();
        }
    }

    fn prune_stale_droplets(&self) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let pruned = inner.by_uri.prune(self.stale_threshold);
        let remaining = inner.by_uri.pool_count();
        drop(inner);

        if !pruned.is_empty() {
            for endpoint in &pruned {
                tracing::info!(
                    address = %endpoint.canonical_addr(),
                    app_id = %endpoint.application_id,
                    "pruned stale endpoint"
                );
            }
        }
        metrics::record_prune(pruned.len(), remaining);
        tracing::debug!(pruned = pruned.len(), routes = remaining, "pruning pass complete");
    }

    pub fn num_uris(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_uri
            .pool_count()
    }

    pub fn num_endpoints(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_uri
            .endpoint_count()
    }

    pub fn time_of_last_update(&self) -> Option<Instant> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .time_of_last_update
    }

    /// Snapshot of the registry as `{uri: [endpoint...]}`, served by the
    /// admin endpoint.
    pub fn to_json(&self) -> serde_json::Value {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_uri
            .to_json()
    }
}

impl Drop for RouteRegistry {
    fn drop(&mut self) {
        self.stop_pruning_cycle();
    }
}
