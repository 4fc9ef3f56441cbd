//! Endpoint pools: the set of backends serving one route key.
//!
//! A pool owns its endpoints behind a single mutex and hands out iterators
//! implementing failure-aware round-robin with optional preferred-subnet
//! preemption and sticky-session pinning. All operations are O(1) or
//! O(|endpoints|) with very small endpoint counts, so the lock is never held
//! long.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use ipnet::IpNet;
use rand::Rng;

use crate::core::endpoint::Endpoint;

struct Slot {
    endpoint: Arc<Endpoint>,
    updated: Instant,
    failed_at: Option<Instant>,
    /// Position of this slot inside `PoolInner::preferred`, when its IP lies
    /// in the preferred network.
    preferred_pos: Option<usize>,
}

#[derive(Default)]
struct PoolInner {
    slots: Vec<Slot>,
    /// Slot indices whose endpoint IP lies inside the preferred network.
    preferred: Vec<usize>,
    /// Canonical address and private instance id, both mapping to the slot.
    by_key: HashMap<String, usize>,
    /// Round-robin cursors. `None` means "randomise on first use".
    next_idx: Option<usize>,
    next_preferred_idx: Option<usize>,
}

/// The set of endpoints serving a single route key.
pub struct Pool {
    inner: Mutex<PoolInner>,
    retry_after_failure: Duration,
    context_path: String,
    preferred_network: Option<IpNet>,
}

impl Pool {
    pub fn new(
        retry_after_failure: Duration,
        context_path: &str,
        preferred_network: Option<IpNet>,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            retry_after_failure,
            context_path: context_path.to_string(),
            preferred_network,
        }
    }

    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// Add or update an endpoint. Returns false when an update carries a
    /// modification tag that does not supersede (or equal) the stored one.
    /// An accepted put always refreshes the slot's `updated` stamp, keeping
    /// repeatedly-registered endpoints out of the pruner's reach.
    pub fn put(&self, endpoint: Endpoint) -> bool {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let addr = endpoint.canonical_addr();

        if let Some(&i) = inner.by_key.get(&addr) {
            let stored = inner.slots[i].endpoint.clone();
            if !stored
                .modification_tag
                .same_or_newer(&endpoint.modification_tag)
            {
                return false;
            }

            if stored.private_instance_id != endpoint.private_instance_id {
                if !stored.private_instance_id.is_empty() {
                    inner.by_key.remove(&stored.private_instance_id);
                }
                if !endpoint.private_instance_id.is_empty() {
                    inner.by_key.insert(endpoint.private_instance_id.clone(), i);
                }
            }

            let slot = &mut inner.slots[i];
            slot.endpoint = Arc::new(endpoint);
            slot.updated = Instant::now();
        } else {
            let i = inner.slots.len();
            let preferred_pos = match &self.preferred_network {
                Some(net) if endpoint.ip().is_some_and(|ip| net.contains(&ip)) => {
                    inner.preferred.push(i);
                    Some(inner.preferred.len() - 1)
                }
                _ => None,
            };

            inner.by_key.insert(addr, i);
            if !endpoint.private_instance_id.is_empty() {
                inner.by_key.insert(endpoint.private_instance_id.clone(), i);
            }

            inner.slots.push(Slot {
                endpoint: Arc::new(endpoint),
                updated: Instant::now(),
                failed_at: None,
                preferred_pos,
            });
        }

        true
    }

    /// Remove an endpoint. Returns false when it is unknown or the incoming
    /// modification tag is older than the stored one.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let addr = endpoint.canonical_addr();

        let Some(&i) = inner.by_key.get(&addr) else {
            return false;
        };

        let stored_addr = inner.slots[i].endpoint.canonical_addr();
        // Index disagreement is a structural bug, not a recoverable state.
        assert_eq!(
            stored_addr, addr,
            "pool index corrupt: key {addr} resolves to slot holding {stored_addr}"
        );

        if !inner.slots[i]
            .endpoint
            .modification_tag
            .same_or_newer(&endpoint.modification_tag)
        {
            return false;
        }

        Self::remove_slot(&mut inner, i);
        true
    }

    /// Order-destroying swap-and-shrink removal, fixing up the indices of the
    /// slot that moved and the preferred list entry that moved.
    fn remove_slot(inner: &mut PoolInner, i: usize) {
        let removed = inner.slots.swap_remove(i);

        if i < inner.slots.len() {
            let moved_addr = inner.slots[i].endpoint.canonical_addr();
            inner.by_key.insert(moved_addr, i);
            let moved_iid = inner.slots[i].endpoint.private_instance_id.clone();
            if !moved_iid.is_empty() {
                inner.by_key.insert(moved_iid, i);
            }
            if let Some(p) = inner.slots[i].preferred_pos {
                inner.preferred[p] = i;
            }
        }

        if let Some(p) = removed.preferred_pos {
            inner.preferred.swap_remove(p);
            if p < inner.preferred.len() {
                let s = inner.preferred[p];
                inner.slots[s].preferred_pos = Some(p);
            }
        }

        inner.by_key.remove(&removed.endpoint.canonical_addr());
        if !removed.endpoint.private_instance_id.is_empty() {
            inner.by_key.remove(&removed.endpoint.private_instance_id);
        }
    }

    /// Remove every endpoint whose last refresh is older than its effective
    /// threshold: the endpoint's own positive override when tighter than the
    /// default, else the default. Returns the pruned endpoints.
    pub fn prune_endpoints(&self, default_threshold: Duration) -> Vec<Arc<Endpoint>> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let now = Instant::now();

        let mut pruned = Vec::new();
        let mut i = 0;
        while i < inner.slots.len() {
            let slot = &inner.slots[i];
            let effective = match slot.endpoint.stale_threshold {
                Some(t) if t > Duration::ZERO && t < default_threshold => t,
                _ => default_threshold,
            };

            let stale = now
                .checked_sub(effective)
                .is_some_and(|cutoff| slot.updated < cutoff);

            if stale {
                pruned.push(slot.endpoint.clone());
                Self::remove_slot(&mut inner, i);
            } else {
                i += 1;
            }
        }

        pruned
    }

    /// All endpoints in a pool are expected to share a route service URL;
    /// slot 0 is the canonical copy.
    pub fn route_service_url(&self) -> Option<String> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner
            .slots
            .first()
            .and_then(|slot| slot.endpoint.route_service_url.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("pool lock poisoned").slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").slots.len()
    }

    /// Stamp every slot's `updated` time. Used by registry-level touches and
    /// by tests steering the pruner.
    pub fn mark_updated(&self, t: Instant) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        for slot in &mut inner.slots {
            slot.updated = t;
        }
    }

    pub fn each(&self, mut f: impl FnMut(&Arc<Endpoint>)) {
        let inner = self.inner.lock().expect("pool lock poisoned");
        for slot in &inner.slots {
            f(&slot.endpoint);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock().expect("pool lock poisoned");
        serde_json::Value::Array(
            inner
                .slots
                .iter()
                .map(|slot| slot.endpoint.to_json())
                .collect(),
        )
    }

    /// Iterator over the pool's endpoints. A non-empty `initial` naming a
    /// present endpoint (by address or private instance id) pins the first
    /// `next()` for session affinity; pass `""` for plain balancing.
    pub fn endpoints(&self, initial: &str) -> EndpointIterator<'_> {
        EndpointIterator {
            pool: self,
            initial: if initial.is_empty() {
                None
            } else {
                Some(initial.to_string())
            },
            last: None,
        }
    }

    fn find_by_id(&self, id: &str) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner
            .by_key
            .get(id)
            .map(|&i| inner.slots[i].endpoint.clone())
    }

    /// Round-robin step. While the preferred sub-sequence is non-empty only
    /// preferred endpoints are returned, even when all of them are inside
    /// their failure window (they get mass-forgiven instead): topology wins
    /// over liveness.
    fn next(&self) -> Option<Arc<Endpoint>> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let inner = &mut *inner;

        let use_preferred = !inner.preferred.is_empty();
        let len = if use_preferred {
            inner.preferred.len()
        } else {
            inner.slots.len()
        };
        if len == 0 {
            return None;
        }

        let cursor = if use_preferred {
            inner.next_preferred_idx
        } else {
            inner.next_idx
        };
        let mut idx = match cursor {
            None => rand::rng().random_range(0..len),
            Some(i) if i >= len => 0,
            Some(i) => i,
        };

        let start_idx = idx;
        let now = Instant::now();
        loop {
            let slot_index = if use_preferred {
                inner.preferred[idx]
            } else {
                idx
            };

            idx += 1;
            if idx == len {
                idx = 0;
            }

            let slot = &mut inner.slots[slot_index];
            if let Some(failed_at) = slot.failed_at {
                if now.duration_since(failed_at) > self.retry_after_failure {
                    slot.failed_at = None;
                }
            }

            if slot.failed_at.is_none() {
                let endpoint = slot.endpoint.clone();
                if use_preferred {
                    inner.next_preferred_idx = Some(idx);
                } else {
                    inner.next_idx = Some(idx);
                }
                return Some(endpoint);
            }

            if idx == start_idx {
                // Every candidate is inside its failure window: forgive all
                // of them so a totally-dead pool still yields an address.
                for slot in &mut inner.slots {
                    slot.failed_at = None;
                }
            }
        }
    }

    fn endpoint_failed(&self, endpoint: &Endpoint) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let addr = endpoint.canonical_addr();
        if let Some(&i) = inner.by_key.get(&addr) {
            inner.slots[i].failed_at = Some(Instant::now());
        }
    }
}

/// Failure-aware round-robin iterator handed to the proxy engine.
pub struct EndpointIterator<'a> {
    pool: &'a Pool,
    initial: Option<String>,
    last: Option<Arc<Endpoint>>,
}

impl EndpointIterator<'_> {
    pub fn next(&mut self) -> Option<Arc<Endpoint>> {
        let mut endpoint = None;
        if let Some(initial) = self.initial.take() {
            endpoint = self.pool.find_by_id(&initial);
        }
        if endpoint.is_none() {
            endpoint = self.pool.next();
        }

        self.last = endpoint.clone();
        endpoint
    }

    /// Stamp the last-returned endpoint as failed, removing it from rotation
    /// for the pool's retry window.
    pub fn endpoint_failed(&self) {
        if let Some(endpoint) = &self.last {
            self.pool.endpoint_failed(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::endpoint::ModificationTag;

    fn new_pool() -> Arc<Pool> {
        Arc::new(Pool::new(Duration::from_secs(120), "", None))
    }

    fn preferred_pool(cidr: &str) -> Arc<Pool> {
        Arc::new(Pool::new(
            Duration::from_secs(120),
            "",
            Some(cidr.parse().unwrap()),
        ))
    }

    #[test]
    fn put_adds_endpoints() {
        let pool = new_pool();
        assert!(pool.put(Endpoint::new("1.2.3.4", 5678)));
        assert!(!pool.is_empty());
    }

    #[test]
    fn put_accepts_equivalent_duplicates() {
        let pool = new_pool();
        assert!(pool.put(Endpoint::new("1.2.3.4", 5678)));
        assert!(pool.put(Endpoint::new("1.2.3.4", 5678)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn put_updates_with_newer_modification_tag() {
        let pool = new_pool();
        pool.put(Endpoint::new("1.2.3.4", 5678));

        let mut update = Endpoint::new("1.2.3.4", 5678);
        update.modification_tag = ModificationTag::new("abc", 0);
        assert!(pool.put(update));

        let mut iter = pool.endpoints("");
        assert_eq!(
            iter.next().unwrap().modification_tag,
            ModificationTag::new("abc", 0)
        );
    }

    #[test]
    fn put_rejects_older_modification_tag() {
        let pool = new_pool();
        let mut endpoint = Endpoint::new("1.2.3.4", 5678);
        endpoint.modification_tag = ModificationTag::new("abc", 1);
        pool.put(endpoint);

        let mut stale = Endpoint::new("1.2.3.4", 5678);
        stale.modification_tag = ModificationTag::new("abc", 0);
        assert!(!pool.put(stale));

        let mut iter = pool.endpoints("");
        assert_eq!(
            iter.next().unwrap().modification_tag,
            ModificationTag::new("abc", 1)
        );
    }

    #[test]
    fn put_reindexes_a_changed_instance_id() {
        let pool = new_pool();
        let mut endpoint = Endpoint::new("1.2.3.4", 5678);
        endpoint.private_instance_id = "old-id".to_string();
        pool.put(endpoint);

        let mut update = Endpoint::new("1.2.3.4", 5678);
        update.private_instance_id = "new-id".to_string();
        assert!(pool.put(update));

        let mut iter = pool.endpoints("old-id");
        // The stale id no longer pins; round-robin still finds the endpoint.
        assert_eq!(iter.next().unwrap().canonical_addr(), "1.2.3.4:5678");

        let mut iter = pool.endpoints("new-id");
        assert_eq!(iter.next().unwrap().private_instance_id, "new-id");
    }

    #[test]
    fn remove_with_matching_tag_empties_the_pool() {
        let pool = new_pool();
        let mut endpoint = Endpoint::new("1.2.3.4", 5678);
        endpoint.modification_tag = ModificationTag::new("abc", 0);
        pool.put(endpoint.clone());

        assert!(pool.remove(&endpoint));
        assert!(pool.is_empty());
    }

    #[test]
    fn remove_of_unknown_endpoint_is_a_noop() {
        let pool = new_pool();
        assert!(!pool.remove(&Endpoint::new("1.2.3.4", 5678)));
    }

    #[test]
    fn remove_rejects_older_modification_tag() {
        let pool = new_pool();
        let mut endpoint = Endpoint::new("1.2.3.4", 5678);
        endpoint.modification_tag = ModificationTag::new("abc", 1);
        pool.put(endpoint);

        let mut stale = Endpoint::new("1.2.3.4", 5678);
        stale.modification_tag = ModificationTag::new("abc", 0);
        assert!(!pool.remove(&stale));
        assert!(!pool.is_empty());
    }

    #[test]
    fn route_service_url_comes_from_the_first_slot() {
        let pool = new_pool();
        assert_eq!(pool.route_service_url(), None);

        pool.put(Endpoint::new("1.2.3.4", 5678));
        assert_eq!(pool.route_service_url(), None);

        let pool = new_pool();
        let mut endpoint = Endpoint::new("1.2.3.4", 5678);
        endpoint.route_service_url = Some("https://my-rs.com".to_string());
        pool.put(endpoint);
        assert_eq!(
            pool.route_service_url(),
            Some("https://my-rs.com".to_string())
        );
    }

    #[test]
    fn prune_respects_custom_threshold_tighter_than_default() {
        let pool = new_pool();
        let default = Duration::from_secs(60);

        let mut endpoint = Endpoint::new("1.2.3.4", 5678);
        endpoint.stale_threshold = Some(Duration::from_secs(20));
        pool.put(endpoint);
        pool.mark_updated(Instant::now() - Duration::from_secs(25));

        let pruned = pool.prune_endpoints(default);
        assert!(pool.is_empty());
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].canonical_addr(), "1.2.3.4:5678");
    }

    #[test]
    fn prune_ignores_custom_threshold_looser_than_default() {
        let pool = new_pool();
        let default = Duration::from_secs(60);

        let mut endpoint = Endpoint::new("1.2.3.4", 5678);
        endpoint.stale_threshold = Some(Duration::from_secs(80));
        pool.put(endpoint);
        pool.mark_updated(Instant::now() - Duration::from_secs(70));

        // 70s old: fresh by the 80s override, stale by the 60s default; the
        // default wins because the override is looser.
        let pruned = pool.prune_endpoints(default);
        assert!(pool.is_empty());
        assert_eq!(pruned.len(), 1);
    }

    #[test]
    fn prune_keeps_fresh_endpoints() {
        let pool = new_pool();
        pool.put(Endpoint::new("1.2.3.4", 5678));
        pool.mark_updated(Instant::now());

        let pruned = pool.prune_endpoints(Duration::from_secs(60));
        assert!(!pool.is_empty());
        assert!(pruned.is_empty());
    }

    #[test]
    fn prune_takes_only_the_stale_of_mixed_endpoints() {
        let pool = new_pool();
        pool.put(Endpoint::new("1.2.3.4", 5678));
        let mut tight = Endpoint::new("1.2.3.4", 1234);
        tight.stale_threshold = Some(Duration::from_secs(30));
        pool.put(tight);

        pool.mark_updated(Instant::now() - Duration::from_secs(31));

        let pruned = pool.prune_endpoints(Duration::from_secs(60));
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].canonical_addr(), "1.2.3.4:1234");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn mark_updated_resets_the_staleness_clock() {
        let pool = new_pool();
        pool.put(Endpoint::new("1.2.3.4", 5678));

        pool.mark_updated(Instant::now());
        assert!(pool.prune_endpoints(Duration::from_secs(1)).is_empty());
        assert!(!pool.is_empty());

        let pruned = pool.prune_endpoints(Duration::ZERO);
        assert_eq!(pruned.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn iterator_cycles_through_all_healthy_endpoints() {
        let pool = new_pool();
        pool.put(Endpoint::new("10.0.0.1", 80));
        pool.put(Endpoint::new("10.0.0.2", 80));
        pool.put(Endpoint::new("10.0.0.3", 80));

        let mut iter = pool.endpoints("");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(iter.next().unwrap().canonical_addr());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn iterator_skips_failed_endpoints_within_the_retry_window() {
        let pool = new_pool();
        pool.put(Endpoint::new("10.0.0.1", 80));
        pool.put(Endpoint::new("10.0.0.2", 80));

        let mut iter = pool.endpoints("");
        let first = iter.next().unwrap();
        iter.endpoint_failed();

        for _ in 0..4 {
            let next = iter.next().unwrap();
            assert_ne!(next.canonical_addr(), first.canonical_addr());
        }
    }

    #[test]
    fn iterator_mass_forgives_when_everything_is_failed() {
        let pool = new_pool();
        pool.put(Endpoint::new("10.0.0.1", 80));
        pool.put(Endpoint::new("10.0.0.2", 80));

        let mut iter = pool.endpoints("");
        for _ in 0..2 {
            iter.next().unwrap();
            iter.endpoint_failed();
        }

        // Both are inside the failure window; the pool forgives them rather
        // than returning nothing.
        assert!(iter.next().is_some());
    }

    #[test]
    fn iterator_on_an_empty_pool_returns_none() {
        let pool = new_pool();
        let mut iter = pool.endpoints("");
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn initial_id_pins_the_first_pick() {
        let pool = new_pool();
        let mut a = Endpoint::new("10.0.0.1", 80);
        a.private_instance_id = "instance-a".to_string();
        let mut b = Endpoint::new("10.0.0.2", 80);
        b.private_instance_id = "instance-b".to_string();
        pool.put(a);
        pool.put(b);

        for _ in 0..5 {
            let mut iter = pool.endpoints("instance-b");
            assert_eq!(iter.next().unwrap().canonical_addr(), "10.0.0.2:80");
        }

        // Address form pins too.
        let mut iter = pool.endpoints("10.0.0.1:80");
        assert_eq!(iter.next().unwrap().canonical_addr(), "10.0.0.1:80");
    }

    #[test]
    fn unknown_initial_falls_back_to_round_robin() {
        let pool = new_pool();
        pool.put(Endpoint::new("10.0.0.1", 80));

        let mut iter = pool.endpoints("no-such-instance");
        assert_eq!(iter.next().unwrap().canonical_addr(), "10.0.0.1:80");
    }

    #[test]
    fn preferred_endpoints_preempt_the_rest() {
        let pool = preferred_pool("10.1.1.0/24");
        let e1 = Endpoint::new("10.1.1.1", 5678);
        let e2 = Endpoint::new("10.1.1.2", 5678);
        let e3 = Endpoint::new("10.1.1.3", 5678);
        pool.put(e1);
        pool.put(e2);
        pool.put(e3.clone());
        pool.put(Endpoint::new("10.1.2.5", 5678));
        pool.put(Endpoint::new("10.1.2.5", 1234));
        pool.put(Endpoint::new("10.1.2.6", 1234));
        pool.remove(&e3);

        let preferred = ["10.1.1.1:5678", "10.1.1.2:5678"];
        let mut iter = pool.endpoints("");
        for _ in 0..6 {
            let addr = iter.next().unwrap().canonical_addr();
            assert!(preferred.contains(&addr.as_str()), "got {addr}");
        }
    }

    #[test]
    fn falls_back_to_everything_when_no_preferred_present() {
        let pool = preferred_pool("10.1.2.0/24");
        let e3 = Endpoint::new("10.1.2.3", 5678);
        pool.put(Endpoint::new("10.1.1.1", 5678));
        pool.put(Endpoint::new("10.1.1.2", 5678));
        pool.put(e3.clone());
        pool.remove(&e3);

        let expected = ["10.1.1.1:5678", "10.1.1.2:5678"];
        let mut iter = pool.endpoints("");
        for _ in 0..4 {
            let addr = iter.next().unwrap().canonical_addr();
            assert!(expected.contains(&addr.as_str()), "got {addr}");
        }
    }

    #[test]
    fn non_preferred_take_over_once_all_preferred_are_removed() {
        let pool = preferred_pool("10.1.1.0/24");
        let e1 = Endpoint::new("10.1.1.1", 5678);
        let e2 = Endpoint::new("10.1.1.2", 5678);
        pool.put(e1.clone());
        pool.put(e2.clone());
        pool.put(Endpoint::new("10.1.2.5", 5678));

        let preferred = ["10.1.1.1:5678", "10.1.1.2:5678"];
        let mut iter = pool.endpoints("");
        for _ in 0..4 {
            let addr = iter.next().unwrap().canonical_addr();
            assert!(preferred.contains(&addr.as_str()), "got {addr}");
        }

        pool.remove(&e1);
        pool.remove(&e2);

        let mut iter = pool.endpoints("");
        for _ in 0..4 {
            assert_eq!(iter.next().unwrap().canonical_addr(), "10.1.2.5:5678");
        }
    }

    #[test]
    fn survives_removal_of_every_preferred_endpoint() {
        let pool = preferred_pool("10.1.1.0/24");
        let e1 = Endpoint::new("10.1.1.1", 5678);
        let e2 = Endpoint::new("10.1.1.2", 5678);
        let e3 = Endpoint::new("10.1.1.3", 5678);
        pool.put(e1.clone());
        pool.put(e2.clone());
        pool.put(e3.clone());
        pool.remove(&e1);
        pool.remove(&e2);
        pool.remove(&e3);

        let mut iter = pool.endpoints("");
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn preferred_reappear_after_non_preferred_interlude() {
        let pool = preferred_pool("10.1.1.0/24");
        pool.put(Endpoint::new("10.1.2.5", 80));

        let mut iter = pool.endpoints("");
        assert_eq!(iter.next().unwrap().canonical_addr(), "10.1.2.5:80");

        pool.put(Endpoint::new("10.1.1.9", 80));
        let mut iter = pool.endpoints("");
        assert_eq!(iter.next().unwrap().canonical_addr(), "10.1.1.9:80");
    }

    #[test]
    fn each_visits_every_endpoint() {
        let pool = new_pool();
        pool.put(Endpoint::new("1.2.3.4", 5678));
        pool.put(Endpoint::new("5.6.7.8", 1234));

        let mut seen = std::collections::HashMap::new();
        pool.each(|endpoint| {
            seen.insert(endpoint.canonical_addr(), endpoint.clone());
        });
        assert_eq!(seen.len(), 2);
        assert!(seen.contains_key("1.2.3.4:5678"));
        assert!(seen.contains_key("5.6.7.8:1234"));
    }

    #[test]
    fn address_index_agrees_after_churn() {
        let pool = preferred_pool("10.1.1.0/24");
        let endpoints: Vec<Endpoint> = (1..=6)
            .map(|i| Endpoint::new(&format!("10.1.{}.{i}", i % 2 + 1), 80))
            .collect();
        for e in &endpoints {
            pool.put(e.clone());
        }
        pool.remove(&endpoints[0]);
        pool.remove(&endpoints[3]);
        pool.remove(&endpoints[5]);

        // Every remaining endpoint must still be reachable through its
        // address key.
        pool.each(|endpoint| {
            let mut iter = pool.endpoints(&endpoint.canonical_addr());
            assert_eq!(
                iter.next().unwrap().canonical_addr(),
                endpoint.canonical_addr()
            );
        });
    }

    #[test]
    fn marshals_json() {
        let pool = new_pool();
        let mut e = Endpoint::new("1.2.3.4", 5678);
        e.route_service_url = Some("https://my-rs.com".to_string());
        pool.put(e);
        pool.put(Endpoint::new("5.6.7.8", 5678));

        assert_eq!(
            serde_json::to_string(&pool.to_json()).unwrap(),
            r#"[{"address":"1.2.3.4:5678","route_service_url":"https://my-rs.com","ttl":-1},{"address":"5.6.7.8:5678","ttl":-1}]"#
        );
    }
}
