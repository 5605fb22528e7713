//! Bidirectional mapping between hierarchical paths and stable addresses.
//!
//! The server reveals a resource's stable address (`_self`) the first time the client sees the
//! resource in a response. The [`LinkRegistry`] records that mapping so either addressing
//! scheme can be resolved to the other without a round trip, and persists it so the mapping
//! survives a restart.

use bson::{de::deserialize_from_bson, ser::serialize_to_bson};
use mea::rwlock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::{
    address::{ResourceAddress, ResourceKind},
    error::AccessResult,
    persist::{Namespace, SharedStore},
};

/// One recorded `{hierarchical path, stable address}` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub hierarchical_path: String,
    pub stable_address: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Default)]
struct LinkIndex {
    by_path: HashMap<String, LinkRecord>,
    by_stable: HashMap<String, String>,
}

impl LinkIndex {
    fn insert(&mut self, record: LinkRecord) {
        self.by_stable
            .insert(record.stable_address.clone(), record.hierarchical_path.clone());
        self.by_path.insert(record.hierarchical_path.clone(), record);
    }
}

/// Persistent registry of link records, keyed by hierarchical path.
///
/// Mutations are serialized by the registry's write lock; lookups share a read lock and never
/// leave the process.
#[derive(Debug)]
pub struct LinkRegistry {
    store: SharedStore,
    namespace: Namespace,
    index: RwLock<LinkIndex>,
}

/// Normalizes a stable address the way the registry keys it.
fn stable_key(link: &str) -> String {
    link.trim_matches('/').to_string()
}

impl LinkRegistry {
    /// Opens the registry for `account_host`, loading every persisted record.
    pub async fn open(store: SharedStore, account_host: &str) -> AccessResult<Self> {
        let namespace = Namespace::new(account_host, "links");
        let mut index = LinkIndex::default();

        for (_, value) in store.scan(namespace.as_str(), "").await? {
            index.insert(deserialize_from_bson::<LinkRecord>(value)?);
        }

        debug!(namespace = namespace.as_str(), records = index.by_path.len(), "link registry loaded");

        Ok(Self {
            store,
            namespace,
            index: RwLock::new(index),
        })
    }

    /// Stable address recorded for a hierarchical path.
    pub async fn resolve_path(&self, path: &str) -> Option<String> {
        self.index
            .read()
            .await
            .by_path
            .get(path.trim_matches('/'))
            .map(|r| r.stable_address.clone())
    }

    /// Hierarchical path recorded for a stable address.
    pub async fn resolve_stable(&self, stable: &str) -> Option<String> {
        self.index
            .read()
            .await
            .by_stable
            .get(&stable_key(stable))
            .cloned()
    }

    /// Returns the record for a hierarchical path.
    pub async fn get(&self, path: &str) -> Option<LinkRecord> {
        self.index
            .read()
            .await
            .by_path
            .get(path.trim_matches('/'))
            .cloned()
    }

    /// Number of recorded mappings.
    pub async fn len(&self) -> usize {
        self.index.read().await.by_path.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Records that `path` is reachable at `stable`.
    ///
    /// Recording a known pair again is a no-op. Recording a new stable address for a known path
    /// replaces the previous mapping, and a stable address recorded for a new path is dropped
    /// from the path it was mapped to before.
    pub async fn record(&self, path: &str, stable: &str, kind: ResourceKind) -> AccessResult<()> {
        let record = LinkRecord {
            hierarchical_path: path.trim_matches('/').to_string(),
            stable_address: stable_key(stable),
            kind,
        };

        let mut index = self.index.write().await;

        let previous = match index.by_path.get(&record.hierarchical_path) {
            Some(existing) if *existing == record => return Ok(()),
            Some(existing) => Some(existing.stable_address.clone()),
            None => None,
        };

        self.store
            .put(
                self.namespace.as_str(),
                &record.hierarchical_path,
                serialize_to_bson(&record)?,
            )
            .await?;

        if let Some(previous) = previous {
            index.by_stable.remove(&previous);
        }

        let stale_path = index
            .by_stable
            .get(&record.stable_address)
            .filter(|p| **p != record.hierarchical_path)
            .cloned();
        if let Some(stale_path) = stale_path {
            self.store.delete(self.namespace.as_str(), &stale_path).await?;
            index.by_path.remove(&stale_path);
            debug!(path = %stale_path, stable = %record.stable_address, "link reassigned");
        }

        debug!(path = %record.hierarchical_path, stable = %record.stable_address, "link recorded");
        index.insert(record);

        Ok(())
    }

    /// Forgets `path` and every record nested under it.
    pub async fn forget(&self, path: &str) -> AccessResult<()> {
        let path = path.trim_matches('/');
        let nested = format!("{path}/");
        let mut index = self.index.write().await;

        let doomed: Vec<String> = index
            .by_path
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&nested))
            .cloned()
            .collect();

        for key in doomed {
            self.store.delete(self.namespace.as_str(), &key).await?;
            if let Some(record) = index.by_path.remove(&key) {
                index.by_stable.remove(&record.stable_address);
            }
        }

        Ok(())
    }

    /// Rewrites `address` into its hierarchical form when the mapping is known.
    pub async fn to_hierarchical(&self, address: &ResourceAddress) -> ResourceAddress {
        match address {
            ResourceAddress::Stable { link, .. } => match self.resolve_stable(link).await {
                Some(path) => ResourceAddress::parse_path(&path).unwrap_or_else(|_| address.clone()),
                None => address.clone(),
            },
            ResourceAddress::Path { .. } => address.clone(),
        }
    }

    /// The key a resource is filed under locally: its hierarchical path when known, otherwise
    /// its stable address.
    pub async fn canonical_key(&self, address: &ResourceAddress) -> CanonicalKey {
        match address {
            ResourceAddress::Path { .. } => CanonicalKey::Path(address.canonical_path()),
            ResourceAddress::Stable { link, .. } => match self.resolve_stable(link).await {
                Some(path) => CanonicalKey::Path(path),
                None => CanonicalKey::Stable(stable_key(link)),
            },
        }
    }
}

/// A resource's local identity after resolution through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalKey {
    Path(String),
    Stable(String),
}

impl CanonicalKey {
    /// Key used in persistence namespaces. The scheme prefix keeps a stable address from ever
    /// colliding with a hierarchical path.
    pub fn storage_key(&self) -> String {
        match self {
            CanonicalKey::Path(path) => format!("path:{path}"),
            CanonicalKey::Stable(link) => format!("self:{link}"),
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            CanonicalKey::Path(path) => Some(path),
            CanonicalKey::Stable(_) => None,
        }
    }
}
