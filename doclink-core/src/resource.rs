//! Core traits and types for resource representation.
//!
//! Every typed resource implements [`Resource`], which ties a serde type to the
//! [`ResourceKind`] it is stored as. The kind doubles as the hint that allows a read to fall
//! back to the cache when the service is unreachable.

use serde::{Deserialize, Serialize};
use serde_json::{Value, from_value};

use crate::{address::ResourceKind, error::AccessResult};

/// Core trait that all typed resources must implement.
///
/// # Example
///
/// ```ignore
/// use doclink::Resource;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize, Resource)]
/// #[resource(kind = "collection")]
/// pub struct Collection {
///     pub id: String,
/// }
/// ```
pub trait Resource: Serialize + for<'de> Deserialize<'de> + Send + Sync + Clone + 'static {
    /// The kind of resource this type is stored as.
    fn kind() -> ResourceKind;
}

impl Resource for Value {
    fn kind() -> ResourceKind {
        ResourceKind::Document
    }
}

/// System properties the server attaches to every resource it returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "_rid", default)]
    pub rid: Option<String>,
    #[serde(rename = "_self", default)]
    pub self_link: Option<String>,
    #[serde(rename = "_etag", default)]
    pub etag: Option<String>,
    #[serde(rename = "_ts", default)]
    pub ts: Option<i64>,
}

impl ResourceMeta {
    /// Extracts the system properties from a raw resource body. Missing or mistyped fields are
    /// left unset.
    pub fn from_body(body: &Value) -> Self {
        let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);

        Self {
            id: text("id"),
            rid: text("_rid"),
            self_link: text("_self"),
            etag: text("_etag"),
            ts: body.get("_ts").and_then(Value::as_i64),
        }
    }
}

/// A resource returned by the access layer, with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceResponse<T> {
    pub resource: T,
    /// Served from the local cache because the service was unreachable.
    pub from_cache: bool,
    /// The server confirmed the cached representation is current (HTTP 304).
    pub not_modified: bool,
    pub etag: Option<String>,
    pub stable_address: Option<String>,
}

impl<T> ResourceResponse<T> {
    pub fn new(resource: T) -> Self {
        Self {
            resource,
            from_cache: false,
            not_modified: false,
            etag: None,
            stable_address: None,
        }
    }

    pub fn with_from_cache(mut self, from_cache: bool) -> Self {
        self.from_cache = from_cache;
        self
    }

    pub fn with_not_modified(mut self, not_modified: bool) -> Self {
        self.not_modified = not_modified;
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_stable_address(mut self, stable_address: Option<String>) -> Self {
        self.stable_address = stable_address;
        self
    }

    /// Maps the resource while keeping the response metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResourceResponse<U> {
        ResourceResponse {
            resource: f(self.resource),
            from_cache: self.from_cache,
            not_modified: self.not_modified,
            etag: self.etag,
            stable_address: self.stable_address,
        }
    }
}

impl ResourceResponse<Value> {
    /// Deserializes the raw body into `T`.
    pub fn into_typed<T>(self) -> AccessResult<ResourceResponse<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let resource = from_value(self.resource)?;

        Ok(ResourceResponse {
            resource,
            from_cache: self.from_cache,
            not_modified: self.not_modified,
            etag: self.etag,
            stable_address: self.stable_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meta_from_body() {
        let meta = ResourceMeta::from_body(&json!({
            "id": "D1",
            "_rid": "AAAA",
            "_self": "dbs/AAAA/",
            "_etag": "\"0001\"",
            "_ts": 1700000000,
        }));

        assert_eq!(meta.id.as_deref(), Some("D1"));
        assert_eq!(meta.self_link.as_deref(), Some("dbs/AAAA/"));
        assert_eq!(meta.etag.as_deref(), Some("\"0001\""));
        assert_eq!(meta.ts, Some(1700000000));
        assert_eq!(ResourceMeta::from_body(&json!(null)), ResourceMeta::default());
    }

    #[test]
    fn test_into_typed_keeps_flags() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Db {
            id: String,
        }

        let typed = ResourceResponse::new(json!({ "id": "D1" }))
            .with_from_cache(true)
            .into_typed::<Db>()
            .unwrap();

        assert_eq!(typed.resource, Db { id: "D1".into() });
        assert!(typed.from_cache);
    }
}
