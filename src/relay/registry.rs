//! Per-protocol broker registry
//!
//! A `Broadcaster` maps stream keys to live brokers for one protocol. The
//! HTTP layer resolves a request-path key to a broker through it, so lookup
//! is the hot path and stays O(1) behind a single short-held mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{RelayError, Result};

/// Concurrency-safe stream-key → broker map for one protocol.
///
/// Three instances exist per process (pulled FLV, pushed FLV, HLS), built
/// at startup and injected into handlers — no hidden singletons.
#[derive(Debug)]
pub struct Broadcaster<B> {
    brokers: Mutex<HashMap<String, Arc<B>>>,
}

impl<B> Broadcaster<B> {
    pub fn new() -> Self {
        Self {
            brokers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a broker under a key.
    ///
    /// Not idempotent: re-adding a key overwrites, and the displaced broker
    /// is returned so the caller can shut it down — dropping it without
    /// closing leaks its ingest task.
    pub fn add(&self, key: impl Into<String>, broker: Arc<B>) -> Option<Arc<B>> {
        self.brokers.lock().unwrap().insert(key.into(), broker)
    }

    /// Remove and return the broker for a key.
    pub fn remove(&self, key: &str) -> Option<Arc<B>> {
        self.brokers.lock().unwrap().remove(key)
    }

    /// Look up the broker for a key.
    pub fn find(&self, key: &str) -> Result<Arc<B>> {
        self.brokers
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("stream '{key}'")))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.brokers.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.brokers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.lock().unwrap().is_empty()
    }

    /// Ordered copy of the current entries, for stats reporting.
    pub fn snapshot(&self) -> Vec<(String, Arc<B>)> {
        let mut entries: Vec<_> = self
            .brokers
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl<B> Default for Broadcaster<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeBroker(u32);

    #[test]
    fn test_add_find_remove() {
        let registry: Broadcaster<FakeBroker> = Broadcaster::new();
        assert!(registry.is_empty());

        registry.add("room1", Arc::new(FakeBroker(1)));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("room1"));

        let broker = registry.find("room1").unwrap();
        assert_eq!(*broker, FakeBroker(1));

        let removed = registry.remove("room1").unwrap();
        assert_eq!(*removed, FakeBroker(1));
        assert!(registry.find("room1").is_err());
    }

    #[test]
    fn test_find_missing_is_not_found() {
        let registry: Broadcaster<FakeBroker> = Broadcaster::new();
        assert!(matches!(
            registry.find("nope"),
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_overwrites_and_returns_displaced() {
        let registry: Broadcaster<FakeBroker> = Broadcaster::new();

        assert!(registry.add("room1", Arc::new(FakeBroker(1))).is_none());
        let displaced = registry.add("room1", Arc::new(FakeBroker(2))).unwrap();
        assert_eq!(*displaced, FakeBroker(1));

        assert_eq!(*registry.find("room1").unwrap(), FakeBroker(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry: Broadcaster<FakeBroker> = Broadcaster::new();
        registry.add("b", Arc::new(FakeBroker(2)));
        registry.add("a", Arc::new(FakeBroker(1)));

        let keys: Vec<_> = registry.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
