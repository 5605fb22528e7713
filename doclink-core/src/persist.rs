//! Persistence abstraction for the access layer's durable state.
//!
//! The Link Registry, the Resource Cache and the Write Replay Queue keep their state in a
//! [`PersistenceStore`] so that it survives process restarts. The store is a namespaced
//! key/value map of BSON values; every namespace is scoped to the configured account host by
//! [`Namespace`].
//!
//! # Examples
//!
//! ```ignore
//! use doclink::persist::{Namespace, PersistenceStore};
//! use bson::Bson;
//!
//! let links = Namespace::new("myaccount.documents.azure.com", "links");
//! store.put(links.as_str(), "dbs/D1", Bson::String("dbs/AAAA/".into())).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::Bson;
use std::{fmt::Debug, sync::Arc};

use crate::error::AccessResult;

/// Abstract interface for durable key/value storage.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and support concurrent access from multiple async
/// tasks. The services built on top serialize their own mutations, so a store only has to make
/// individual calls atomic.
///
/// # Error Handling
///
/// Failures should be reported as [`AccessError::Persistence`](crate::error::AccessError::Persistence).
#[async_trait]
pub trait PersistenceStore: Send + Sync + Debug {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, namespace: &str, key: &str) -> AccessResult<Option<Bson>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, namespace: &str, key: &str, value: Bson) -> AccessResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> AccessResult<()>;

    /// Returns every `(key, value)` pair whose key starts with `prefix`, ordered by key.
    async fn scan(&self, namespace: &str, prefix: &str) -> AccessResult<Vec<(String, Bson)>>;
}

#[async_trait]
impl<S> PersistenceStore for Arc<S>
where
    S: PersistenceStore + ?Sized,
{
    async fn get(&self, namespace: &str, key: &str) -> AccessResult<Option<Bson>> {
        (**self).get(namespace, key).await
    }

    async fn put(&self, namespace: &str, key: &str, value: Bson) -> AccessResult<()> {
        (**self).put(namespace, key, value).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> AccessResult<()> {
        (**self).delete(namespace, key).await
    }

    async fn scan(&self, namespace: &str, prefix: &str) -> AccessResult<Vec<(String, Bson)>> {
        (**self).scan(namespace, prefix).await
    }
}

/// Shared handle to a store, as held by the access layer's services.
pub type SharedStore = Arc<dyn PersistenceStore>;

/// Factory trait for creating persistence stores.
#[async_trait]
pub trait PersistenceStoreBuilder {
    type Store: PersistenceStore;

    async fn build(self) -> AccessResult<Self::Store>;
}

/// A namespace scoped to one account host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(account_host: &str, name: &str) -> Self {
        let host = account_host
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');

        Self(format!("{host}/{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_is_scoped_to_host() {
        assert_eq!(
            Namespace::new("https://acct.documents.example.com/", "links").as_str(),
            "acct.documents.example.com/links"
        );
        assert_ne!(
            Namespace::new("https://a.example.com", "cache"),
            Namespace::new("https://b.example.com", "cache")
        );
    }
}
