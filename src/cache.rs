use std::collections::HashMap;

/// A worker-owned map whose entries expire when the cache generation moves
/// past the one they were inserted in. Stale entries are dropped lazily on
/// lookup.
#[derive(Debug)]
pub struct GenerationCache<V> {
    generation: u64,
    entries: HashMap<String, (u64, V)>,
}

impl<V> Default for GenerationCache<V> {
    fn default() -> Self {
        Self {
            generation: 0,
            entries: HashMap::new(),
        }
    }
}

impl<V> GenerationCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Move to `generation`. Returns true when it differs from the current one.
    pub fn set_generation(&mut self, generation: u64) -> bool {
        if generation == self.generation {
            return false;
        }
        self.generation = generation;
        true
    }

    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.evict_if_stale(key);
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.evict_if_stale(key);
        self.entries.get_mut(key).map(|(_, v)| v)
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        self.entries
            .insert(key.into(), (self.generation, value))
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Drop every entry regardless of generation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, including stale ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Eagerly drop all stale entries and return how many were removed.
    pub fn purge_stale(&mut self) -> usize {
        let before = self.entries.len();
        let generation = self.generation;
        self.entries.retain(|_, (g, _)| *g == generation);
        before - self.entries.len()
    }

    fn evict_if_stale(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|(g, _)| *g != self.generation)
        {
            self.entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_on_generation_change() {
        let mut cache = GenerationCache::new();
        cache.insert("logjam-a-b-2024-01-01", 1);
        assert!(cache.contains("logjam-a-b-2024-01-01"));

        assert!(!cache.set_generation(0));
        assert!(cache.contains("logjam-a-b-2024-01-01"));

        assert!(cache.set_generation(1));
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains("logjam-a-b-2024-01-01"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn purge_drops_only_stale_entries() {
        let mut cache = GenerationCache::new();
        cache.insert("old", ());
        cache.set_generation(7);
        cache.insert("new", ());
        assert_eq!(cache.purge_stale(), 1);
        assert!(cache.contains("new"));
        assert!(!cache.contains("old"));
    }

    #[test]
    fn reinsert_after_expiry() {
        let mut cache = GenerationCache::new();
        cache.insert("db", "handles-v1");
        cache.set_generation(2);
        assert!(cache.get("db").is_none());
        cache.insert("db", "handles-v2");
        assert_eq!(cache.get("db"), Some(&"handles-v2"));
        if let Some(v) = cache.get_mut("db") {
            *v = "handles-v3";
        }
        assert_eq!(cache.remove("db"), Some("handles-v3"));
    }
}
