//! An offline-resilient access layer for a hierarchical document database.
//!
//! This crate is the core of the doclink project and provides:
//!
//! - **Addressing** ([`address`]) - Hierarchical paths, stable addresses and feed targets
//! - **Link registry** ([`link`]) - Persistent mapping between the two addressing schemes
//! - **Resource cache** ([`cache`]) - Last known representation of each resource, for offline reads
//! - **Token authority** ([`token`]) - Owner-key signing and delegated permission tokens
//! - **Write replay queue** ([`queue`]) - Durable FIFO of writes awaiting connectivity
//! - **Request dispatcher** ([`dispatcher`]) - Request composition and response classification
//! - **Client** ([`client`]) - Typed API over all of the above
//! - **Boundaries** ([`transport`], [`connectivity`], [`persist`]) - Traits the host application implements
//! - **Error handling** ([`error`]) - The [`AccessError`](error::AccessError) taxonomy
//!
//! # Example
//!
//! ```ignore
//! use doclink::{Resource, prelude::*};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Resource)]
//! #[resource(kind = "collection")]
//! pub struct Collection {
//!     pub id: String,
//! }
//!
//! let db = ResourceAddress::database("D1");
//! let page = client.list::<Collection>(Some(&db)).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as doclink_core;

pub mod address;
pub mod cache;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod page;
pub mod persist;
pub mod query;
pub mod queue;
pub mod resource;
pub mod token;
pub mod transport;
