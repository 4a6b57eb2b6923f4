//! Round-robin allocator over a configured list of outbound SOCKS5 proxies.
//!
//! Accepts a comma-separated list of `socks5://…` URLs (the shape the rest of
//! the codebase already uses for the single-proxy case, in
//! `GlobalConfig::proxy`). Entries that don't parse as `socks5://` URLs are
//! still forwarded as-is — `wreq::Proxy::all` accepts http(s) and socks
//! schemes alike, and rejecting them here would just duplicate validation the
//! HTTP client already does at connect time.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe round-robin cursor over a fixed list of proxy URLs.
///
/// An empty pool means "no proxy" — `next_transport` always returns `None`,
/// matching the direct-connection fallback the dispatcher already used
/// before a pool existed.
#[derive(Debug)]
pub struct ProxyPool {
    entries: Vec<String>,
    cursor: AtomicUsize,
}

impl ProxyPool {
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            entries,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Parse a comma-separated `socks5://…` list from configuration.
    /// Blank entries are dropped; whitespace around each entry is trimmed.
    pub fn from_config(raw: Option<&str>) -> Self {
        let entries = raw
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the next proxy URL in rotation, or `None` when the pool is
    /// empty. Safe to call concurrently from many requests; each call
    /// advances the shared cursor exactly once.
    pub fn next_transport(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.entries.len();
        Some(self.entries[idx].clone())
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_returns_none() {
        let pool = ProxyPool::from_config(None);
        assert!(pool.is_empty());
        assert_eq!(pool.next_transport(), None);
    }

    #[test]
    fn rotates_round_robin() {
        let pool = ProxyPool::from_config(Some(
            "socks5://a:1080, socks5://b:1080,socks5://c:1080",
        ));
        assert_eq!(pool.len(), 3);
        let picks: Vec<_> = (0..5).map(|_| pool.next_transport().unwrap()).collect();
        assert_eq!(
            picks,
            vec![
                "socks5://a:1080".to_string(),
                "socks5://b:1080".to_string(),
                "socks5://c:1080".to_string(),
                "socks5://a:1080".to_string(),
                "socks5://b:1080".to_string(),
            ]
        );
    }

    #[test]
    fn blank_entries_are_dropped() {
        let pool = ProxyPool::from_config(Some("socks5://a:1080,, ,socks5://b:1080"));
        assert_eq!(pool.len(), 2);
    }
}
