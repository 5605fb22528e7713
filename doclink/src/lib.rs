//! Main doclink crate providing an offline-resilient client for hierarchical document
//! databases.
//!
//! This crate is the primary entry point for users of doclink. It re-exports the core types
//! from the sub-crates and provides access to the available transports and in-memory
//! collaborators.
//!
//! # Features
//!
//! - **Typed resources** - Define resources with Serde and `#[derive(Resource)]`
//! - **Offline reads** - The last representation of every resource is cached and served while
//!   the service is unreachable
//! - **Queued writes** - Writes that cannot reach the service are persisted and replayed in
//!   order once connectivity returns
//! - **Stable links** - Human-readable paths are mapped to the server's stable links and back
//!
//! # Quick Start
//!
//! ```ignore
//! use doclink::{prelude::*, memory::*};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Resource)]
//! #[resource(kind = "collection")]
//! pub struct Collection {
//!     pub id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> AccessResult<()> {
//!     let monitor = ManualConnectivity::new(true);
//!     let client = Client::builder("https://account.documents.example.com")
//!         .credential(Credential::owner("c2VjcmV0"))
//!         .transport(Arc::new(InMemoryService::new()))
//!         .store(Arc::new(InMemoryStore::new()))
//!         .connectivity(Arc::new(monitor.clone()))
//!         .build()
//!         .await?;
//!
//!     let db = ResourceAddress::database("D1");
//!
//!     // Completes immediately while online, queues while offline
//!     let outcome = client.create(Some(&db), &Collection { id: "C1".into() }).await?;
//!     let created = outcome.resolve().await?;
//!
//!     // Served from the cache if the service is unreachable
//!     let read = client.read::<Collection>(&db.child(ResourceKind::Collection, "C1")).await?;
//!     println!("{:?} from_cache={}", read.resource, read.from_cache);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Transports
//!
//! - [`memory`] - An in-process service emulator for development and testing
//! - [`http`] - HTTPS transport over `reqwest` (requires the `http` feature)

#[allow(unused_extern_crates)]
extern crate self as doclink;

pub mod prelude;

pub use doclink_core::{
    address, cache, client, config, connectivity, dispatcher, error, link, page, persist, query,
    queue, resource, token, transport,
};
pub use doclink_macros::Resource;

// Re-export the value types used by the raw API and persisted records
pub use bson;
pub use serde_json;

/// In-memory collaborators: persistence, service emulation, connectivity and permissions.
pub mod memory {
    pub use doclink_memory::{
        InMemoryService, InMemoryStore, InMemoryStoreBuilder, ManualConnectivity,
        StaticPermissions,
    };
}

/// HTTPS transport.
///
/// This module is only available when the `http` feature is enabled.
#[cfg(feature = "http")]
pub mod http {
    pub use doclink_http::{ReqwestTransport, ReqwestTransportBuilder};
}
