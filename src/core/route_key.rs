//! Route keys: the registry's canonical lookup form of a host + path.
//!
//! A key is a lowercased host plus the exact path segments below it. The
//! host is matched case-insensitively (normalised here, once); path segments
//! are matched byte-exact, so percent-encoding survives untouched.
//! `next_wildcard` yields the longest-specific-first wildcard fallback
//! chain: `a.b.c → *.b.c → *.c`.

/// Canonical lookup key for a registered route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    host: String,
    path: Vec<String>,
}

impl RouteKey {
    /// Build a key from a registration URI of the form `host/some/path`.
    /// The query is stripped, a trailing slash is ignored, and the host is
    /// lowercased.
    pub fn from_uri(uri: &str) -> Self {
        let uri = uri.split('?').next().unwrap_or("");
        let uri = uri.trim_end_matches('/');

        let (host, path) = match uri.split_once('/') {
            Some((host, rest)) => (host, rest),
            None => (uri, ""),
        };

        Self::from_parts(host, path)
    }

    /// Build a key from an already separated host and request path.
    pub fn from_parts(host: &str, path: &str) -> Self {
        // A client may send `Host: example.com:8080`; the port never
        // participates in routing.
        let host = host.split(':').next().unwrap_or("").to_ascii_lowercase();

        let path = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Self { host, path }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Trie walk order: the host label first, then each path segment.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.host.as_str()).chain(self.path.iter().map(String::as_str))
    }

    /// The URI suffix below the host, always starting with `/`.
    pub fn context_path(&self) -> String {
        if self.path.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.path.join("/"))
        }
    }

    /// The next-most-general key: the leftmost host label becomes `*`, or if
    /// it already is `*`, one label is dropped from the left. `None` once no
    /// further wildcard exists, which ends the lookup chain.
    pub fn next_wildcard(&self) -> Option<RouteKey> {
        let mut labels: Vec<&str> = self.host.split('.').collect();

        if labels.first() == Some(&"*") {
            labels.remove(0);
        }
        if labels.len() < 2 {
            return None;
        }
        labels[0] = "*";

        Some(RouteKey {
            host: labels.join("."),
            path: self.path.clone(),
        })
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.host)?;
        for segment in &self.path {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_host_but_not_path() {
        let key = RouteKey::from_uri("FOO.Example.COM/Some/Path");
        assert_eq!(key.host(), "foo.example.com");
        assert_eq!(
            key.segments().collect::<Vec<_>>(),
            vec!["foo.example.com", "Some", "Path"]
        );
    }

    #[test]
    fn strips_query_and_trailing_slash() {
        let key = RouteKey::from_uri("test/my_path/?q=1");
        assert_eq!(
            key.segments().collect::<Vec<_>>(),
            vec!["test", "my_path"]
        );
        assert_eq!(key, RouteKey::from_uri("test/my_path"));
    }

    #[test]
    fn strips_host_port() {
        let key = RouteKey::from_parts("test:8080", "/");
        assert_eq!(key.host(), "test");
    }

    #[test]
    fn preserves_percent_encoding() {
        let key = RouteKey::from_uri("test/my%20path/your_path");
        assert_eq!(
            key.segments().collect::<Vec<_>>(),
            vec!["test", "my%20path", "your_path"]
        );
    }

    #[test]
    fn context_path_is_the_part_below_the_host() {
        assert_eq!(RouteKey::from_uri("test").context_path(), "/");
        assert_eq!(
            RouteKey::from_uri("test/one/two").context_path(),
            "/one/two"
        );
    }

    #[test]
    fn wildcard_chain_generalises_left_to_right() {
        let key = RouteKey::from_uri("a.b.c");
        let w1 = key.next_wildcard().unwrap();
        assert_eq!(w1.host(), "*.b.c");
        let w2 = w1.next_wildcard().unwrap();
        assert_eq!(w2.host(), "*.c");
        assert!(w2.next_wildcard().is_none());
    }

    #[test]
    fn wildcard_chain_keeps_the_path() {
        let key = RouteKey::from_uri("a.b.c/some/path");
        let w1 = key.next_wildcard().unwrap();
        assert_eq!(w1.to_string(), "*.b.c/some/path");
    }

    #[test]
    fn single_label_host_has_no_wildcard() {
        assert!(RouteKey::from_uri("test").next_wildcard().is_none());
    }
}
