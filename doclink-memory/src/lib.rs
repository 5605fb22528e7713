//! In-memory collaborators for doclink.
//!
//! This crate provides in-process implementations of every boundary the access layer talks
//! to, for tests and offline development:
//!
//! - [`InMemoryStore`] - a [`PersistenceStore`](doclink_core::persist::PersistenceStore) whose
//!   clones share state, so a second client over a clone behaves like a restarted process
//! - [`InMemoryService`] - a [`Transport`](doclink_core::transport::Transport) that emulates
//!   the document service, with a reachability switch and failure injection
//! - [`ManualConnectivity`] - a connectivity monitor driven by hand
//! - [`StaticPermissions`] - a permission resolver over a fixed token table
//!
//! # Quick Start
//!
//! ```ignore
//! use doclink::{prelude::*, memory::*};
//! use std::sync::Arc;
//!
//! let service = InMemoryService::new();
//! let monitor = ManualConnectivity::new(true);
//! let client = Client::builder("https://acct.example.com")
//!     .credential(Credential::owner(key))
//!     .transport(Arc::new(service.clone()))
//!     .store(Arc::new(InMemoryStore::new()))
//!     .connectivity(Arc::new(monitor.clone()))
//!     .build()
//!     .await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as doclink_memory;

pub mod connectivity;
pub mod evaluator;
pub mod permission;
pub mod service;
pub mod store;

pub use connectivity::ManualConnectivity;
pub use permission::StaticPermissions;
pub use service::InMemoryService;
pub use store::{InMemoryStore, InMemoryStoreBuilder};
