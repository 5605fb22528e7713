//! Persisted cache of the last known server representation of each resource.
//!
//! The cache serves reads while the service is unreachable. Its policy is deliberately plain:
//!
//! - every successful read, create or replace overwrites the entry (last server write wins),
//! - a 304 leaves the body untouched and only refreshes `inserted_at`,
//! - entries are removed only by [`ResourceCache::invalidate`] on delete or on a 404,
//! - there is no TTL and no size bound; staleness is reported to callers through
//!   `from_cache`, never hidden.
//!
//! Entries are keyed by the resource's canonical key (see
//! [`LinkRegistry::canonical_key`](crate::link::LinkRegistry::canonical_key)), so a resource
//! fetched once by stable address and once by hierarchical path collapses into a single entry
//! as soon as the link between the two is known.

use bson::{de::deserialize_from_bson, ser::serialize_to_bson};
use chrono::{DateTime, Utc};
use mea::mutex::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::{
    address::{ResourceAddress, ResourceKind},
    error::AccessResult,
    link::{CanonicalKey, LinkRegistry},
    persist::{Namespace, SharedStore},
};

/// The cached representation of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub address: String,
    pub kind: ResourceKind,
    pub body: Value,
    pub etag: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

/// On-disk form of a [`CacheEntry`]. The body is kept as JSON text so it round-trips exactly.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    address: String,
    kind: ResourceKind,
    body: String,
    etag: Option<String>,
    inserted_at: DateTime<Utc>,
}

impl StoredEntry {
    fn from_entry(entry: &CacheEntry) -> AccessResult<Self> {
        Ok(Self {
            address: entry.address.clone(),
            kind: entry.kind,
            body: serde_json::to_string(&entry.body)?,
            etag: entry.etag.clone(),
            inserted_at: entry.inserted_at,
        })
    }

    fn into_entry(self) -> AccessResult<CacheEntry> {
        Ok(CacheEntry {
            address: self.address,
            kind: self.kind,
            body: serde_json::from_str(&self.body)?,
            etag: self.etag,
            inserted_at: self.inserted_at,
        })
    }
}

#[derive(Debug)]
pub struct ResourceCache {
    store: SharedStore,
    namespace: Namespace,
    registry: Arc<LinkRegistry>,
    writer: Mutex<()>,
}

impl ResourceCache {
    pub fn new(store: SharedStore, account_host: &str, registry: Arc<LinkRegistry>) -> Self {
        Self {
            store,
            namespace: Namespace::new(account_host, "cache"),
            registry,
            writer: Mutex::new(()),
        }
    }

    /// Stores `body` as the current representation of `address`, replacing any previous entry
    /// for the same resource under either addressing scheme.
    pub async fn put(
        &self,
        address: &ResourceAddress,
        kind: ResourceKind,
        body: &Value,
        etag: Option<&str>,
    ) -> AccessResult<()> {
        let key = self.registry.canonical_key(address).await;
        let entry = CacheEntry {
            address: match &key {
                CanonicalKey::Path(path) | CanonicalKey::Stable(path) => path.clone(),
            },
            kind,
            body: body.clone(),
            etag: etag.map(str::to_string),
            inserted_at: Utc::now(),
        };

        let _guard = self.writer.lock().await;

        self.write_entry(&key, &entry).await?;
        if let Some(alias) = self.alias_key(&key).await {
            self.store.delete(self.namespace.as_str(), &alias.storage_key()).await?;
        }

        Ok(())
    }

    /// Returns the cached entry for `address` if one of kind `kind` exists.
    pub async fn get(
        &self,
        address: &ResourceAddress,
        kind: ResourceKind,
    ) -> AccessResult<Option<CacheEntry>> {
        let key = self.registry.canonical_key(address).await;

        let entry = match self.read_entry(&key).await? {
            Some(entry) => Some(entry),
            None => match self.alias_key(&key).await {
                Some(alias) => self.read_entry(&alias).await?,
                None => None,
            },
        };

        Ok(entry.filter(|e| e.kind == kind))
    }

    /// Returns the cached direct children of kind `kind` under `container` (the account root
    /// when `None`), ordered by path.
    pub async fn get_all(
        &self,
        container: Option<&ResourceAddress>,
        kind: ResourceKind,
    ) -> AccessResult<Vec<CacheEntry>> {
        let prefix = match container {
            Some(container) => match self.registry.canonical_key(container).await {
                CanonicalKey::Path(path) => format!("{path}/{}/", kind.segment()),
                CanonicalKey::Stable(_) => return Ok(Vec::new()),
            },
            None => format!("{}/", kind.segment()),
        };

        let mut entries = Vec::new();
        for (_, value) in self
            .store
            .scan(self.namespace.as_str(), &CanonicalKey::Path(prefix.clone()).storage_key())
            .await?
        {
            let entry = deserialize_from_bson::<StoredEntry>(value)?.into_entry()?;
            let direct_child = entry
                .address
                .strip_prefix(&prefix)
                .is_some_and(|rest| !rest.contains('/'));

            if direct_child && entry.kind == kind {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Removes the entry for `address`, its alias under the other addressing scheme, and every
    /// entry nested below it.
    pub async fn invalidate(&self, address: &ResourceAddress) -> AccessResult<()> {
        let key = self.registry.canonical_key(address).await;
        let _guard = self.writer.lock().await;

        self.store.delete(self.namespace.as_str(), &key.storage_key()).await?;
        if let Some(alias) = self.alias_key(&key).await {
            self.store.delete(self.namespace.as_str(), &alias.storage_key()).await?;
        }

        if let CanonicalKey::Path(path) = &key {
            let nested = CanonicalKey::Path(format!("{path}/")).storage_key();
            for (nested_key, _) in self.store.scan(self.namespace.as_str(), &nested).await? {
                self.store.delete(self.namespace.as_str(), &nested_key).await?;
            }
        }

        Ok(())
    }

    /// Refreshes the entry's timestamp after the server confirmed it is current.
    pub async fn touch(&self, address: &ResourceAddress) -> AccessResult<()> {
        let key = self.registry.canonical_key(address).await;
        let _guard = self.writer.lock().await;

        let found = match self.read_entry(&key).await? {
            Some(entry) => Some((key, entry)),
            None => match self.alias_key(&key).await {
                Some(alias) => self.read_entry(&alias).await?.map(|entry| (alias, entry)),
                None => None,
            },
        };

        if let Some((key, mut entry)) = found {
            entry.inserted_at = Utc::now();
            self.write_entry(&key, &entry).await?;
        }

        Ok(())
    }

    /// The same resource's key under the other addressing scheme, if the registry knows it.
    async fn alias_key(&self, key: &CanonicalKey) -> Option<CanonicalKey> {
        match key {
            CanonicalKey::Path(path) => self
                .registry
                .resolve_path(path)
                .await
                .map(CanonicalKey::Stable),
            CanonicalKey::Stable(_) => None,
        }
    }

    async fn read_entry(&self, key: &CanonicalKey) -> AccessResult<Option<CacheEntry>> {
        match self.store.get(self.namespace.as_str(), &key.storage_key()).await? {
            Some(value) => Ok(Some(deserialize_from_bson::<StoredEntry>(value)?.into_entry()?)),
            None => Ok(None),
        }
    }

    async fn write_entry(&self, key: &CanonicalKey, entry: &CacheEntry) -> AccessResult<()> {
        self.store
            .put(
                self.namespace.as_str(),
                &key.storage_key(),
                serialize_to_bson(&StoredEntry::from_entry(entry)?)?,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::testing;
    use serde_json::json;

    const HOST: &str = "https://acct.example.com";

    async fn cache() -> (Arc<LinkRegistry>, ResourceCache) {
        let store = testing::shared();
        let registry = Arc::new(LinkRegistry::open(store.clone(), HOST).await.unwrap());
        let cache = ResourceCache::new(store, HOST, registry.clone());

        (registry, cache)
    }

    fn path(path: &str) -> ResourceAddress {
        ResourceAddress::parse_path(path).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_, cache) = cache().await;
        let doc = path("dbs/D1/colls/C1/docs/a");

        cache
            .put(&doc, ResourceKind::Document, &json!({ "id": "a", "n": 1 }), Some("\"e1\""))
            .await
            .unwrap();

        let entry = cache.get(&doc, ResourceKind::Document).await.unwrap().unwrap();
        assert_eq!(entry.body, json!({ "id": "a", "n": 1 }));
        assert_eq!(entry.etag.as_deref(), Some("\"e1\""));
        assert_eq!(cache.get(&doc, ResourceKind::Collection).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stable_and_path_entries_collapse() {
        let (registry, cache) = cache().await;
        let stable = ResourceAddress::stable("dbs/r1/colls/r2/", ResourceKind::Collection);
        let hierarchical = path("dbs/D1/colls/C1");

        cache
            .put(&stable, ResourceKind::Collection, &json!({ "id": "C1", "v": 1 }), None)
            .await
            .unwrap();
        registry
            .record("dbs/D1/colls/C1", "dbs/r1/colls/r2", ResourceKind::Collection)
            .await
            .unwrap();

        let entry = cache.get(&hierarchical, ResourceKind::Collection).await.unwrap().unwrap();
        assert_eq!(entry.body["v"], 1);

        cache
            .put(&hierarchical, ResourceKind::Collection, &json!({ "id": "C1", "v": 2 }), None)
            .await
            .unwrap();

        let via_stable = cache.get(&stable, ResourceKind::Collection).await.unwrap().unwrap();
        assert_eq!(via_stable.body["v"], 2);
    }

    #[tokio::test]
    async fn test_get_all_returns_direct_children_only() {
        let (_, cache) = cache().await;
        let coll = path("dbs/D1/colls/C1");

        for id in ["b", "a"] {
            cache
                .put(&coll.child(ResourceKind::Document, id), ResourceKind::Document, &json!({ "id": id }), None)
                .await
                .unwrap();
        }
        cache
            .put(
                &path("dbs/D1/colls/C1/docs/a/attachments/x"),
                ResourceKind::Attachment,
                &json!({ "id": "x" }),
                None,
            )
            .await
            .unwrap();

        let ids: Vec<String> = cache
            .get_all(Some(&coll), ResourceKind::Document)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.body["id"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_invalidate_removes_subtree() {
        let (_, cache) = cache().await;
        let coll = path("dbs/D1/colls/C1");
        let doc = coll.child(ResourceKind::Document, "a");
        let sibling = path("dbs/D1/colls/C10");

        cache.put(&coll, ResourceKind::Collection, &json!({ "id": "C1" }), None).await.unwrap();
        cache.put(&doc, ResourceKind::Document, &json!({ "id": "a" }), None).await.unwrap();
        cache.put(&sibling, ResourceKind::Collection, &json!({ "id": "C10" }), None).await.unwrap();

        cache.invalidate(&coll).await.unwrap();

        assert_eq!(cache.get(&coll, ResourceKind::Collection).await.unwrap(), None);
        assert_eq!(cache.get(&doc, ResourceKind::Document).await.unwrap(), None);
        assert!(cache.get(&sibling, ResourceKind::Collection).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_touch_keeps_the_body() {
        let (_, cache) = cache().await;
        let db = ResourceAddress::database("D1");

        cache.put(&db, ResourceKind::Database, &json!({ "id": "D1" }), Some("\"e\"")).await.unwrap();
        let before = cache.get(&db, ResourceKind::Database).await.unwrap().unwrap();

        cache.touch(&db).await.unwrap();
        let after = cache.get(&db, ResourceKind::Database).await.unwrap().unwrap();

        assert_eq!(after.body, before.body);
        assert_eq!(after.etag, before.etag);
        assert!(after.inserted_at >= before.inserted_at);
    }

    #[tokio::test]
    async fn test_touch_refreshes_an_entry_filed_under_the_stable_address() {
        let (registry, cache) = cache().await;
        let stable = ResourceAddress::stable("dbs/r1/", ResourceKind::Database);

        cache.put(&stable, ResourceKind::Database, &json!({ "id": "D1" }), None).await.unwrap();
        registry.record("dbs/D1", "dbs/r1", ResourceKind::Database).await.unwrap();
        let before = cache.get(&stable, ResourceKind::Database).await.unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.touch(&ResourceAddress::database("D1")).await.unwrap();

        let after = cache.get(&stable, ResourceKind::Database).await.unwrap().unwrap();
        assert!(after.inserted_at > before.inserted_at);
        assert_eq!(after.body, before.body);
    }
}
