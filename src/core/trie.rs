//! Prefix tree over route-key segments.
//!
//! The first segment of every key is the host; the rest are path segments.
//! Leaves (and interior nodes) may hold a pool. Lookup is longest-prefix:
//! the deepest pool-bearing node along the walk wins, which is what lets a
//! route registered for `host/app` serve `host/app/deeper/path`.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use crate::core::{endpoint::Endpoint, pool::Pool, route_key::RouteKey};

#[derive(Default)]
pub struct Trie {
    pool: Option<Arc<Pool>>,
    children: HashMap<String, Trie>,
}

impl Trie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact lookup: the pool stored at precisely this key, if any.
    pub fn find(&self, key: &RouteKey) -> Option<Arc<Pool>> {
        let mut node = self;
        for segment in key.segments() {
            node = node.children.get(segment)?;
        }
        node.pool.clone()
    }

    /// Longest-prefix lookup: the deepest pool-bearing node visited while
    /// walking the key's segments.
    pub fn match_uri(&self, key: &RouteKey) -> Option<Arc<Pool>> {
        let mut node = self;
        let mut deepest = node.pool.clone();
        for segment in key.segments() {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if node.pool.is_some() {
                        deepest = node.pool.clone();
                    }
                }
                None => break,
            }
        }
        deepest
    }

    pub fn insert(&mut self, key: &RouteKey, pool: Arc<Pool>) {
        let mut node = self;
        for segment in key.segments() {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.pool = Some(pool);
    }

    /// Remove the pool at `key` and snip any branch left empty. Returns
    /// whether a pool was removed.
    pub fn delete(&mut self, key: &RouteKey) -> bool {
        let segments: Vec<&str> = key.segments().collect();
        Self::delete_segments(self, &segments).0
    }

    // Returns (removed, child_now_empty).
    fn delete_segments(node: &mut Trie, segments: &[&str]) -> (bool, bool) {
        match segments.split_first() {
            None => {
                let removed = node.pool.take().is_some();
                (removed, node.children.is_empty())
            }
            Some((head, rest)) => {
                let Some(child) = node.children.get_mut(*head) else {
                    return (false, false);
                };
                let (removed, empty) = Self::delete_segments(child, rest);
                if empty && child.pool.is_none() {
                    node.children.remove(*head);
                }
                (removed, node.pool.is_none() && node.children.is_empty())
            }
        }
    }

    /// Prune every pool in the tree, dropping emptied pools and snipping
    /// branches with nothing left under them. Returns the pruned endpoints.
    pub fn prune(&mut self, default_threshold: Duration) -> Vec<Arc<Endpoint>> {
        let mut pruned = Vec::new();
        Self::prune_node(self, default_threshold, &mut pruned);
        pruned
    }

    fn prune_node(node: &mut Trie, threshold: Duration, pruned: &mut Vec<Arc<Endpoint>>) {
        if let Some(pool) = node.pool.clone() {
            pruned.extend(pool.prune_endpoints(threshold));
            if pool.is_empty() {
                node.pool = None;
            }
        }
        node.children.retain(|_, child| {
            Self::prune_node(child, threshold, pruned);
            child.pool.is_some() || !child.children.is_empty()
        });
    }

    pub fn each_pool(&self, f: &mut impl FnMut(&Arc<Pool>)) {
        if let Some(pool) = &self.pool {
            f(pool);
        }
        for child in self.children.values() {
            child.each_pool(f);
        }
    }

    /// Number of registered route keys (pool-bearing nodes).
    pub fn pool_count(&self) -> usize {
        let mut count = 0;
        self.each_pool(&mut |_| count += 1);
        count
    }

    /// Number of distinct endpoints across all pools.
    pub fn endpoint_count(&self) -> usize {
        let mut addresses = HashSet::new();
        self.each_pool(&mut |pool| {
            pool.each(|endpoint| {
                addresses.insert(endpoint.canonical_addr());
            });
        });
        addresses.len()
    }

    /// Snapshot of the whole tree as `{uri: [endpoint...]}`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        let mut prefix = Vec::new();
        self.collect_json(&mut prefix, &mut map);
        serde_json::Value::Object(map)
    }

    fn collect_json(
        &self,
        prefix: &mut Vec<String>,
        out: &mut serde_json::Map<String, serde_json::Value>,
    ) {
        if let Some(pool) = &self.pool {
            out.insert(prefix.join("/"), pool.to_json());
        }
        for (segment, child) in &self.children {
            prefix.push(segment.clone());
            child.collect_json(prefix, out);
            prefix.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<Pool> {
        let p = Arc::new(Pool::new(Duration::from_secs(120), "", None));
        p.put(Endpoint::new("192.168.1.1", 1234));
        p
    }

    fn key(uri: &str) -> RouteKey {
        RouteKey::from_uri(uri)
    }

    #[test]
    fn find_is_exact() {
        let mut trie = Trie::new();
        trie.insert(&key("foo/bar"), pool());

        assert!(trie.find(&key("foo/bar")).is_some());
        assert!(trie.find(&key("foo")).is_none());
        assert!(trie.find(&key("foo/bar/baz")).is_none());
    }

    #[test]
    fn match_uri_returns_the_deepest_pool() {
        let mut trie = Trie::new();
        let shallow = pool();
        let deep = pool();
        trie.insert(&key("host"), shallow.clone());
        trie.insert(&key("host/app/v2"), deep.clone());

        assert!(Arc::ptr_eq(
            &trie.match_uri(&key("host/app/v2/users")).unwrap(),
            &deep
        ));
        assert!(Arc::ptr_eq(
            &trie.match_uri(&key("host/app")).unwrap(),
            &shallow
        ));
        assert!(Arc::ptr_eq(
            &trie.match_uri(&key("host/other")).unwrap(),
            &shallow
        ));
        assert!(trie.match_uri(&key("elsewhere")).is_none());
    }

    #[test]
    fn delete_snips_empty_branches() {
        let mut trie = Trie::new();
        trie.insert(&key("host/a/b"), pool());
        trie.insert(&key("host/a"), pool());

        assert!(trie.delete(&key("host/a/b")));
        assert!(trie.find(&key("host/a")).is_some());

        assert!(trie.delete(&key("host/a")));
        assert_eq!(trie.pool_count(), 0);
        assert!(trie.children.is_empty());
    }

    #[test]
    fn delete_of_absent_key_reports_false() {
        let mut trie = Trie::new();
        trie.insert(&key("host"), pool());
        assert!(!trie.delete(&key("other")));
        assert!(trie.find(&key("host")).is_some());
    }

    #[test]
    fn endpoint_count_deduplicates_across_pools() {
        let mut trie = Trie::new();
        let shared = pool();
        trie.insert(&key("foo"), shared.clone());
        trie.insert(&key("bar"), shared);

        assert_eq!(trie.pool_count(), 2);
        assert_eq!(trie.endpoint_count(), 1);
    }

    #[test]
    fn prune_drops_emptied_pools_and_branches() {
        let mut trie = Trie::new();
        let p = pool();
        p.mark_updated(std::time::Instant::now() - Duration::from_secs(10));
        trie.insert(&key("host/app"), p);

        let pruned = trie.prune(Duration::from_secs(1));
        assert_eq!(pruned.len(), 1);
        assert_eq!(trie.pool_count(), 0);
        assert!(trie.children.is_empty());
    }

    #[test]
    fn marshals_uri_to_endpoint_map() {
        let mut trie = Trie::new();
        trie.insert(&key("foo"), pool());

        let json = trie.to_json();
        assert_eq!(
            serde_json::to_string(&json).unwrap(),
            r#"{"foo":[{"address":"192.168.1.1:1234","ttl":-1}]}"#
        );
    }
}
