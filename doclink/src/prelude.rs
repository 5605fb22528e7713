//! Convenient re-exports of commonly used types from doclink.
//!
//! ```ignore
//! use doclink::prelude::*;
//! ```

pub use doclink_core::{
    address::{ResourceAddress, ResourceKind, Target},
    client::{Client, ClientBuilder},
    config::ClientConfig,
    connectivity::{AlwaysConnected, ConnectivityMonitor},
    dispatcher::{RequestOptions, WriteOutcome},
    error::{AccessError, AccessResult},
    page::FeedPage,
    persist::{PersistenceStore, PersistenceStoreBuilder},
    query::QuerySpec,
    queue::{DrainReport, PendingWrite},
    resource::{Resource, ResourceMeta, ResourceResponse},
    token::{Credential, PermissionMode, PermissionResolver},
    transport::Transport,
};
pub use doclink_macros::Resource;
