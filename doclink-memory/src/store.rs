//! In-memory persistence store.
//!
//! Keeps every namespace as an ordered map of BSON values behind an async-aware read-write
//! lock.

use async_trait::async_trait;
use bson::Bson;
use mea::rwlock::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use doclink_core::{
    error::AccessResult,
    persist::{PersistenceStore, PersistenceStoreBuilder},
};

type NamespaceMap = BTreeMap<String, Bson>;
type StoreMap = HashMap<String, NamespaceMap>;

/// Thread-safe in-memory persistence store.
///
/// # Thread Safety
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing it to be
/// safely shared across async tasks. Multiple clones of the same instance share the same
/// underlying data, so handing a clone to a second client simulates a process restart over
/// the same durable storage.
///
/// # Example
///
/// ```ignore
/// use doclink_memory::InMemoryStore;
/// use doclink::persist::PersistenceStore;
/// use bson::Bson;
///
/// let store = InMemoryStore::new();
/// store.put("acct/links", "dbs/D1", Bson::String("dbs/AAAA".into())).await?;
/// assert_eq!(store.scan("acct/links", "dbs/").await?.len(), 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// namespace -> (key -> value)
    store: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
        }
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder
    }

    /// Number of keys held in `namespace`.
    pub async fn len(&self, namespace: &str) -> usize {
        self.store
            .read()
            .await
            .get(namespace)
            .map_or(0, BTreeMap::len)
    }

    /// Names of every namespace that holds at least one key.
    pub async fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .read()
            .await
            .iter()
            .filter(|(_, map)| !map.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> AccessResult<Option<Bson>> {
        Ok(self
            .store
            .read()
            .await
            .get(namespace)
            .and_then(|map| map.get(key))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: Bson) -> AccessResult<()> {
        self.store
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> AccessResult<()> {
        if let Some(map) = self.store.write().await.get_mut(namespace) {
            map.remove(key);
        }

        Ok(())
    }

    async fn scan(&self, namespace: &str, prefix: &str) -> AccessResult<Vec<(String, Bson)>> {
        let store = self.store.read().await;
        let Some(map) = store.get(namespace) else {
            return Ok(Vec::new());
        };

        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
#[derive(Default)]
pub struct InMemoryStoreBuilder;

#[async_trait]
impl PersistenceStoreBuilder for InMemoryStoreBuilder {
    type Store = InMemoryStore;

    /// Builds and returns a new [`InMemoryStore`] instance.
    ///
    /// This always succeeds and returns a freshly initialized store.
    async fn build(self) -> AccessResult<Self::Store> {
        Ok(InMemoryStore::new())
    }
}
