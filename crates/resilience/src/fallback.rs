//! Fallback value sources served while a circuit is open.

use std::collections::HashMap;
use std::hash::Hash;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Pluggable cache consulted when a dependency's circuit is open.
#[async_trait]
pub trait FallbackCache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync,
{
    /// Value to serve for `key`, if any.
    async fn lookup(&self, key: &K) -> Option<V>;

    /// Remembers a live result for later fallback use.
    async fn remember(&self, key: &K, value: &V);
}

/// Entries a [`LastKnownGood`] cache keeps unless told otherwise.
pub const DEFAULT_FALLBACK_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Remembered<V> {
    value: V,
    generation: u64,
}

#[derive(Debug)]
struct Entries<K, V> {
    map: HashMap<K, Remembered<V>>,
    generation: u64,
}

/// Remembers the most recent live result per key, up to a fixed number of
/// keys. When full, the key remembered longest ago is evicted.
#[derive(Debug)]
pub struct LastKnownGood<K, V> {
    entries: RwLock<Entries<K, V>>,
    capacity: usize,
}

impl<K, V> Default for LastKnownGood<K, V> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FALLBACK_CAPACITY)
    }
}

impl<K, V> LastKnownGood<K, V> {
    /// Creates an empty cache holding [`DEFAULT_FALLBACK_CAPACITY`] keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache holding at most `capacity` keys (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                generation: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys currently remembered.
    pub async fn len(&self) -> usize {
        self.entries.read().await.map.len()
    }
}

#[async_trait]
impl<K, V> FallbackCache<K, V> for LastKnownGood<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn lookup(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .await
            .map
            .get(key)
            .map(|entry| entry.value.clone())
    }

    async fn remember(&self, key: &K, value: &V) {
        let mut entries = self.entries.write().await;
        entries.generation += 1;
        let generation = entries.generation;

        if entries.map.len() >= self.capacity && !entries.map.contains_key(key) {
            let oldest = entries
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.generation)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.map.remove(&oldest);
            }
        }
        entries.map.insert(
            key.clone(),
            Remembered {
                value: value.clone(),
                generation,
            },
        );
    }
}

/// Serves the same neutral value for every key.
#[derive(Debug, Clone)]
pub struct NeutralDefault<V>(pub V);

#[async_trait]
impl<K, V> FallbackCache<K, V> for NeutralDefault<V>
where
    K: Send + Sync,
    V: Clone + Send + Sync,
{
    async fn lookup(&self, _key: &K) -> Option<V> {
        Some(self.0.clone())
    }

    async fn remember(&self, _key: &K, _value: &V) {}
}
