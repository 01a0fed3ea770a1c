//! Stale-while-revalidate cache for bucket prefix listings.
//!
//! Navigation reads hit this cache first; misses and stale entries trigger a
//! background fetch whose result lands via [`ListingCache::safe_revalidate`].
//! Optimistic edits (an upload or delete completing while the fetch is in
//! flight) must survive that landing, which is what the per-entry mutation
//! counter is for.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bucketeer_client::ObjectEntry;
use tracing::debug;

/// Default cache capacity, in distinct prefixes.
pub const DEFAULT_MAX_ENTRIES: usize = 30;

/// Default age after which a cached listing counts as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// A cached listing for one normalized prefix.
#[derive(Debug, Clone)]
pub struct CachedListing {
    pub prefix: String,
    pub entries: Vec<ObjectEntry>,
    pub fetched_at: Instant,
    /// True while the entries diverge from last-known server truth.
    pub dirty: bool,
    /// Lifetime count of optimistic mutations applied to this prefix.
    pub mutation_counter: u64,
}

/// LRU cache of prefix listings with mutation tracking.
///
/// All access goes through one mutex; operations are bounded by the size of
/// a single listing, and the entry count is capped, so the coarse lock is
/// never contended for long.
pub struct ListingCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    max_entries: usize,
    stale_after: Duration,
    entries: HashMap<String, CachedListing>,
    /// Access order, least recently used first.
    order: Vec<String>,
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_STALE_AFTER)
    }
}

impl ListingCache {
    pub fn new(max_entries: usize, stale_after: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                max_entries: max_entries.max(1),
                stale_after,
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Returns a snapshot of the cached listing, promoting it to
    /// most-recently-used. Pure read, no network.
    pub fn get(&self, prefix: &str) -> Option<CachedListing> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(prefix) {
            return None;
        }
        inner.touch(prefix);
        inner.entries.get(prefix).cloned()
    }

    /// Stores a ground-truth listing, replacing any cached entries for the
    /// prefix and clearing the dirty flag.
    ///
    /// The mutation counter is left alone: it is a lifetime counter that
    /// in-flight revalidations compare against.
    pub fn put(&self, prefix: &str, entries: Vec<ObjectEntry>) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let entry = match inner.entries.remove(prefix) {
            Some(mut existing) => {
                existing.entries = entries;
                existing.fetched_at = now;
                existing.dirty = false;
                existing
            }
            None => CachedListing {
                prefix: prefix.to_string(),
                entries,
                fetched_at: now,
                dirty: false,
                mutation_counter: 0,
            },
        };
        inner.entries.insert(prefix.to_string(), entry);
        inner.touch(prefix);
        inner.evict_if_needed();
    }

    /// Removes one entry. Returns true if it existed.
    pub fn invalidate(&self, prefix: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.order.retain(|p| p != prefix);
        inner.entries.remove(prefix).is_some()
    }

    /// Clears the entire cache.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
    }

    /// True if the entry is missing or older than the staleness threshold.
    pub fn is_stale(&self, prefix: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.entries.get(prefix) {
            None => true,
            Some(entry) => entry.fetched_at.elapsed() > inner.stale_after,
        }
    }

    /// Applies an in-place edit to a live cached listing, marking it dirty
    /// and bumping its mutation counter.
    ///
    /// Returns false when the prefix isn't cached; callers must not assume
    /// the mutation landed.
    pub fn apply_mutation(
        &self,
        prefix: &str,
        mutate: impl FnOnce(&mut Vec<ObjectEntry>),
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(prefix) {
            Some(entry) => {
                mutate(&mut entry.entries);
                entry.dirty = true;
                entry.mutation_counter += 1;
                true
            }
            None => false,
        }
    }

    /// Current mutation counter for a prefix; 0 when absent.
    pub fn get_mutation_counter(&self, prefix: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(prefix)
            .map(|entry| entry.mutation_counter)
            .unwrap_or(0)
    }

    /// Lands a background revalidation result without clobbering optimistic
    /// mutations that happened while the fetch was in flight.
    ///
    /// `counter_at_fetch_start` is the value of
    /// [`get_mutation_counter`](Self::get_mutation_counter) read when the
    /// fetch was started. Three cases:
    ///
    /// 1. The prefix is no longer cached: the server result is stored fresh.
    /// 2. The counter is unchanged: plain replace, dirty cleared.
    /// 3. Mutations landed during the fetch: server entries are the base
    ///    truth, and cached entries whose keys the server doesn't know yet
    ///    are appended as optimistic additions. The entry stays dirty while
    ///    any survive. An entry deleted server-side but still cached
    ///    resolves in the server's favor, which can transiently drop a
    ///    racing local field edit — a known limitation of the counter
    ///    heuristic.
    pub fn safe_revalidate(
        &self,
        prefix: &str,
        server_entries: Vec<ObjectEntry>,
        counter_at_fetch_start: u64,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let entry = match inner.entries.remove(prefix) {
            None => CachedListing {
                prefix: prefix.to_string(),
                entries: server_entries,
                fetched_at: now,
                dirty: false,
                mutation_counter: 0,
            },
            Some(mut entry) if entry.mutation_counter == counter_at_fetch_start => {
                entry.entries = server_entries;
                entry.fetched_at = now;
                entry.dirty = false;
                entry
            }
            Some(mut entry) => {
                let server_keys: HashSet<&str> =
                    server_entries.iter().map(|e| e.key.as_str()).collect();
                let optimistic: Vec<ObjectEntry> = entry
                    .entries
                    .iter()
                    .filter(|e| !server_keys.contains(e.key.as_str()))
                    .cloned()
                    .collect();
                debug!(
                    prefix = %prefix,
                    server = server_entries.len(),
                    optimistic = optimistic.len(),
                    "merged revalidation"
                );
                entry.dirty = !optimistic.is_empty();
                let mut merged = server_entries;
                merged.extend(optimistic);
                entry.entries = merged;
                entry.fetched_at = now;
                // The counter keeps counting across fetches.
                entry
            }
        };

        inner.entries.insert(prefix.to_string(), entry);
        inner.touch(prefix);
        inner.evict_if_needed();
        true
    }

    /// Number of cached prefixes.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn touch(&mut self, prefix: &str) {
        if let Some(position) = self.order.iter().position(|p| p == prefix) {
            self.order.remove(position);
        }
        self.order.push(prefix.to_string());
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.max_entries && !self.order.is_empty() {
            let evicted = self.order.remove(0);
            self.entries.remove(&evicted);
            debug!(prefix = %evicted, "evicted cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> ObjectEntry {
        ObjectEntry {
            name: name.to_string(),
            key: name.to_string(),
            is_prefix: false,
            size: Some(0),
            last_modified: None,
            storage_class: None,
            etag: None,
        }
    }

    fn keys(listing: &CachedListing) -> Vec<String> {
        listing.entries.iter().map(|e| e.key.clone()).collect()
    }

    #[test]
    fn round_trip() {
        let cache = ListingCache::default();
        cache.put("docs/", vec![item("a.txt"), item("b.txt")]);

        let listing = cache.get("docs/").unwrap();
        assert_eq!(listing.prefix, "docs/");
        assert_eq!(listing.entries.len(), 2);
        assert!(!listing.dirty);
        assert_eq!(listing.mutation_counter, 0);
    }

    #[test]
    fn miss_returns_none() {
        let cache = ListingCache::default();
        assert!(cache.get("nonexistent/").is_none());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ListingCache::new(3, DEFAULT_STALE_AFTER);
        cache.put("a/", vec![item("1")]);
        cache.put("b/", vec![item("2")]);
        cache.put("c/", vec![item("3")]);
        cache.put("d/", vec![item("4")]);

        assert!(cache.get("a/").is_none());
        assert!(cache.get("d/").is_some());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn get_promotes_to_most_recently_used() {
        let cache = ListingCache::new(3, DEFAULT_STALE_AFTER);
        cache.put("a/", vec![item("1")]);
        cache.put("b/", vec![item("2")]);
        cache.put("c/", vec![item("3")]);

        cache.get("a/");
        cache.put("d/", vec![item("4")]);

        assert!(cache.get("a/").is_some());
        assert!(cache.get("b/").is_none());
    }

    #[test]
    fn never_exceeds_capacity() {
        let cache = ListingCache::new(5, DEFAULT_STALE_AFTER);
        for i in 0..50 {
            cache.put(&format!("p{i}/"), vec![item("x")]);
            assert!(cache.len() <= 5);
        }
    }

    #[test]
    fn invalidate_single() {
        let cache = ListingCache::default();
        cache.put("a/", vec![item("1")]);
        assert!(cache.invalidate("a/"));
        assert!(cache.get("a/").is_none());
    }

    #[test]
    fn invalidate_missing_returns_false() {
        let cache = ListingCache::default();
        assert!(!cache.invalidate("nonexistent/"));
    }

    #[test]
    fn invalidate_all_clears() {
        let cache = ListingCache::default();
        cache.put("a/", vec![item("1")]);
        cache.put("b/", vec![item("2")]);
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert!(cache.get("a/").is_none());
    }

    #[test]
    fn fresh_entry_not_stale() {
        let cache = ListingCache::new(30, Duration::from_secs(10));
        cache.put("a/", vec![item("1")]);
        assert!(!cache.is_stale("a/"));
    }

    #[test]
    fn missing_entry_is_stale() {
        let cache = ListingCache::default();
        assert!(cache.is_stale("nonexistent/"));
    }

    #[test]
    fn old_entry_is_stale() {
        let cache = ListingCache::new(30, Duration::from_millis(10));
        cache.put("a/", vec![item("1")]);
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.is_stale("a/"));
    }

    #[test]
    fn apply_mutation_marks_dirty_and_counts() {
        let cache = ListingCache::default();
        cache.put("a/", vec![item("1"), item("2")]);

        let applied = cache.apply_mutation("a/", |entries| entries.push(item("3")));
        assert!(applied);

        let listing = cache.get("a/").unwrap();
        assert_eq!(listing.entries.len(), 3);
        assert!(listing.dirty);
        assert_eq!(listing.mutation_counter, 1);
    }

    #[test]
    fn apply_mutation_on_miss_is_noop() {
        let cache = ListingCache::default();
        assert!(!cache.apply_mutation("nope/", |entries| entries.push(item("x"))));
        assert_eq!(cache.get_mutation_counter("nope/"), 0);
    }

    #[test]
    fn mutation_counter_accumulates() {
        let cache = ListingCache::default();
        cache.put("a/", vec![item("1")]);
        cache.apply_mutation("a/", |e| e.push(item("2")));
        cache.apply_mutation("a/", |e| e.retain(|x| x.key != "1"));
        assert_eq!(cache.get_mutation_counter("a/"), 2);
    }

    #[test]
    fn revalidate_without_mutations_replaces() {
        let cache = ListingCache::default();
        cache.put("docs/", vec![item("a"), item("b")]);
        let counter = cache.get_mutation_counter("docs/");

        cache.safe_revalidate("docs/", vec![item("a"), item("c")], counter);

        let listing = cache.get("docs/").unwrap();
        assert_eq!(keys(&listing), vec!["a", "c"]);
        assert!(!listing.dirty);
    }

    #[test]
    fn revalidate_preserves_optimistic_additions() {
        let cache = ListingCache::default();
        cache.put("docs/", vec![item("a"), item("b")]);
        let counter_at_fetch_start = cache.get_mutation_counter("docs/");

        // An upload finishes while the refresh is in flight.
        cache.apply_mutation("docs/", |entries| entries.push(item("c")));

        cache.safe_revalidate("docs/", vec![item("a"), item("b")], counter_at_fetch_start);

        let listing = cache.get("docs/").unwrap();
        assert_eq!(keys(&listing), vec!["a", "b", "c"]);
        assert!(listing.dirty);
        assert_eq!(listing.mutation_counter, 1);
    }

    #[test]
    fn revalidate_trusts_server_for_known_keys() {
        let cache = ListingCache::default();
        cache.put("docs/", vec![item("a"), item("b")]);
        let counter = cache.get_mutation_counter("docs/");

        // An optimistic delete of "b" during the fetch window.
        cache.apply_mutation("docs/", |entries| entries.retain(|e| e.key != "b"));

        // The fetch started before the delete, so the server still lists it;
        // server entries are the base truth and "b" comes back until the
        // next ground-truth fetch.
        cache.safe_revalidate("docs/", vec![item("a"), item("b")], counter);

        let listing = cache.get("docs/").unwrap();
        assert_eq!(keys(&listing), vec!["a", "b"]);
        assert!(!listing.dirty);
    }

    #[test]
    fn revalidate_after_clear_stores_fresh() {
        let cache = ListingCache::default();
        cache.put("docs/", vec![item("a")]);
        cache.invalidate_all();

        assert!(cache.safe_revalidate("docs/", vec![item("b")], 0));
        let listing = cache.get("docs/").unwrap();
        assert_eq!(keys(&listing), vec!["b"]);
        assert!(!listing.dirty);
        assert_eq!(listing.mutation_counter, 0);
    }

    #[test]
    fn put_after_mutations_keeps_counter() {
        let cache = ListingCache::default();
        cache.put("docs/", vec![item("a")]);
        cache.apply_mutation("docs/", |e| e.push(item("b")));
        assert_eq!(cache.get_mutation_counter("docs/"), 1);

        // A ground-truth fetch resets contents and dirty, not the counter.
        cache.put("docs/", vec![item("a"), item("b")]);
        let listing = cache.get("docs/").unwrap();
        assert!(!listing.dirty);
        assert_eq!(listing.mutation_counter, 1);
    }

    #[test]
    fn concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(ListingCache::new(8, DEFAULT_STALE_AFTER));
        let mut handles = vec![];

        for i in 0..8 {
            let c = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let prefix = format!("p{i}/");
                for _ in 0..200 {
                    c.put(&prefix, vec![item("x")]);
                    c.apply_mutation(&prefix, |e| e.push(item("y")));
                    let _ = c.get(&prefix);
                    let _ = c.is_stale(&prefix);
                    c.safe_revalidate(&prefix, vec![item("x")], 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.len() <= 8);
    }
}
