//! Typed client over the request dispatcher.
//!
//! A [`Client`] owns one set of per-account services (link registry, resource cache, write
//! replay queue and dispatcher) and exposes them through a typed API over [`Resource`].
//! Clients are cheap to clone; clones share the same services.
//!
//! # Example
//!
//! ```ignore
//! use doclink::prelude::*;
//!
//! let client = Client::builder("https://account.documents.example.com")
//!     .credential(Credential::owner(key))
//!     .transport(transport)
//!     .store(store)
//!     .connectivity(monitor)
//!     .build()
//!     .await?;
//!
//! let db = ResourceAddress::database("D1");
//! let outcome = client.create(Some(&db), &Collection { id: "C1".into() }).await?;
//! let created = outcome.resolve().await?;
//! ```

use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::info;

use crate::{
    address::{ResourceAddress, ResourceKind, Target},
    cache::ResourceCache,
    config::ClientConfig,
    connectivity::{AlwaysConnected, SharedMonitor},
    dispatcher::{
        DispatcherSettings, HEADER_IS_UPSERT, RequestDispatcher, RequestOptions, WriteOutcome,
    },
    error::{AccessError, AccessResult},
    link::LinkRegistry,
    page::FeedPage,
    persist::SharedStore,
    query::QuerySpec,
    queue::{DrainReport, QueuedWrite, WriteReplayQueue},
    resource::{Resource, ResourceResponse},
    token::{Credential, TokenAuthority},
    transport::SharedTransport,
};

/// Client for one database account.
#[derive(Clone)]
pub struct Client {
    dispatcher: Arc<RequestDispatcher>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Starts building a client for the account at `account_endpoint`.
    pub fn builder(account_endpoint: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(ClientConfig::new(account_endpoint))
    }

    /// The dispatcher behind this client, for raw access with explicit kinds.
    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        self.dispatcher.registry()
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        self.dispatcher.cache()
    }

    /// Reads the resource at `address` as `T`.
    ///
    /// When the service is unreachable the last cached representation is returned with
    /// `from_cache` set.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::NotFound`] if the resource does not exist, or if the service is
    /// unreachable and nothing is cached for it.
    pub async fn read<T: Resource>(&self, address: &ResourceAddress) -> AccessResult<ResourceResponse<T>> {
        self.read_with(address, &RequestOptions::default()).await
    }

    pub async fn read_with<T: Resource>(
        &self,
        address: &ResourceAddress,
        options: &RequestOptions,
    ) -> AccessResult<ResourceResponse<T>> {
        self.dispatcher
            .read(address, Some(T::kind()), options)
            .await?
            .into_typed()
    }

    /// Reads the resource at `address` without deserializing it.
    ///
    /// Without a kind `hint` there is no cache fallback: a transport failure is returned as
    /// [`AccessError::TransportUnavailable`].
    pub async fn read_raw(
        &self,
        address: &ResourceAddress,
        hint: Option<ResourceKind>,
    ) -> AccessResult<ResourceResponse<Value>> {
        self.dispatcher
            .read(address, hint, &RequestOptions::default())
            .await
    }

    /// Creates `resource` under `parent` (the account root when `None`).
    ///
    /// # Returns
    ///
    /// [`WriteOutcome::Completed`] if the service answered, or [`WriteOutcome::Queued`] if the
    /// write is waiting for connectivity.
    ///
    /// # Errors
    ///
    /// Identifier, credential and server errors are returned directly and never queued.
    pub async fn create<T: Resource>(
        &self,
        parent: Option<&ResourceAddress>,
        resource: &T,
    ) -> AccessResult<WriteOutcome<T>> {
        self.create_with(parent, resource, &RequestOptions::default()).await
    }

    pub async fn create_with<T: Resource>(
        &self,
        parent: Option<&ResourceAddress>,
        resource: &T,
        options: &RequestOptions,
    ) -> AccessResult<WriteOutcome<T>> {
        let feed = Target::feed(parent.cloned(), T::kind());
        let body = serde_json::to_value(resource)?;

        self.dispatcher.create(&feed, &body, options).await?.typed()
    }

    /// Creates `resource`, or replaces the existing resource with the same id.
    pub async fn upsert<T: Resource>(
        &self,
        parent: Option<&ResourceAddress>,
        resource: &T,
    ) -> AccessResult<WriteOutcome<T>> {
        let options = RequestOptions::default().with_header(HEADER_IS_UPSERT, "true");

        self.create_with(parent, resource, &options).await
    }

    /// Replaces the resource at `address` with `resource`.
    pub async fn replace<T: Resource>(
        &self,
        address: &ResourceAddress,
        resource: &T,
    ) -> AccessResult<WriteOutcome<T>> {
        self.replace_with(address, resource, &RequestOptions::default()).await
    }

    pub async fn replace_with<T: Resource>(
        &self,
        address: &ResourceAddress,
        resource: &T,
        options: &RequestOptions,
    ) -> AccessResult<WriteOutcome<T>> {
        let body = serde_json::to_value(resource)?;

        self.dispatcher.replace(address, &body, options).await?.typed()
    }

    /// Deletes the resource at `address`, dropping it and everything below it from the cache.
    pub async fn delete(&self, address: &ResourceAddress) -> AccessResult<WriteOutcome> {
        self.delete_with(address, &RequestOptions::default()).await
    }

    pub async fn delete_with(
        &self,
        address: &ResourceAddress,
        options: &RequestOptions,
    ) -> AccessResult<WriteOutcome> {
        self.dispatcher.delete(address, options).await
    }

    /// Lists the first page of `T` resources under `parent`.
    ///
    /// While the service is unreachable the cached children are returned as a single page with
    /// `from_cache` set.
    pub async fn list<T: Resource>(&self, parent: Option<&ResourceAddress>) -> AccessResult<FeedPage<T>> {
        self.list_with(parent, &RequestOptions::default()).await
    }

    pub async fn list_with<T: Resource>(
        &self,
        parent: Option<&ResourceAddress>,
        options: &RequestOptions,
    ) -> AccessResult<FeedPage<T>> {
        let feed = Target::feed(parent.cloned(), T::kind());

        self.dispatcher
            .list(&feed, Some(T::kind()), options)
            .await?
            .into_typed()
    }

    /// Lists a feed without deserializing its items. Without a kind `hint` there is no cache
    /// fallback.
    pub async fn list_raw(
        &self,
        feed: &Target,
        hint: Option<ResourceKind>,
        options: &RequestOptions,
    ) -> AccessResult<FeedPage<Value>> {
        self.dispatcher.list(feed, hint, options).await
    }

    /// Runs `query` over the `T` resources under `parent`.
    pub async fn query<T: Resource>(
        &self,
        parent: Option<&ResourceAddress>,
        query: &QuerySpec,
    ) -> AccessResult<FeedPage<T>> {
        self.query_with(parent, query, &RequestOptions::default()).await
    }

    pub async fn query_with<T: Resource>(
        &self,
        parent: Option<&ResourceAddress>,
        query: &QuerySpec,
        options: &RequestOptions,
    ) -> AccessResult<FeedPage<T>> {
        let feed = Target::feed(parent.cloned(), T::kind());

        self.dispatcher.query(&feed, query, options).await?.into_typed()
    }

    /// Fetches the next page of the last listing or query.
    ///
    /// # Errors
    ///
    /// - [`AccessError::NextCalledTooEarly`] if no listing preceded it, or the last one failed.
    /// - [`AccessError::NoMoreResults`] if the last page had no continuation.
    pub async fn next<T: Resource>(&self) -> AccessResult<FeedPage<T>> {
        self.dispatcher.next().await?.into_typed()
    }

    /// Executes the stored procedure at `procedure` with positional `params`.
    pub async fn execute(&self, procedure: &ResourceAddress, params: &[Value]) -> AccessResult<Value> {
        self.dispatcher
            .execute(procedure, params, &RequestOptions::default())
            .await
    }

    /// Replays queued writes now rather than waiting for a connectivity transition.
    pub async fn drain(&self) -> AccessResult<DrainReport> {
        self.dispatcher.drain().await
    }

    /// Writes still waiting for connectivity, in submission order.
    pub async fn pending_writes(&self) -> Vec<QueuedWrite> {
        self.dispatcher.queue().pending().await
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    credential: Option<Credential>,
    transport: Option<SharedTransport>,
    store: Option<SharedStore>,
    connectivity: Option<SharedMonitor>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            credential: None,
            transport: None,
            store: None,
            connectivity: None,
        }
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`AlwaysConnected`], in which case queued writes only replay on
    /// [`Client::drain`].
    pub fn connectivity(mut self, connectivity: SharedMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.config.api_version = api_version.into();
        self
    }

    pub fn default_page_size(mut self, size: u32) -> Self {
        self.config.default_page_size = Some(size);
        self
    }

    /// Opens the account's persisted state and wires the services together.
    ///
    /// Writes left in the queue by a previous process are replayed in the background if the
    /// monitor reports the service reachable.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::NotConfigured`] if a credential, transport or store is missing,
    /// or if the settings are invalid.
    pub async fn build(self) -> AccessResult<Client> {
        let endpoint = self.config.validate()?;
        let credential = self
            .credential
            .ok_or_else(|| AccessError::NotConfigured("no credential configured".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| AccessError::NotConfigured("no transport configured".into()))?;
        let store = self
            .store
            .ok_or_else(|| AccessError::NotConfigured("no persistence store configured".into()))?;
        let connectivity: SharedMonitor = self
            .connectivity
            .unwrap_or_else(|| Arc::new(AlwaysConnected));

        let authority = TokenAuthority::new(credential)?;
        let registry = Arc::new(LinkRegistry::open(store.clone(), &endpoint).await?);
        let cache = Arc::new(ResourceCache::new(store.clone(), &endpoint, registry.clone()));
        let queue = Arc::new(WriteReplayQueue::open(store, &endpoint).await?);

        let dispatcher = Arc::new(RequestDispatcher::new(
            DispatcherSettings {
                account_endpoint: endpoint,
                api_version: self.config.api_version,
                default_page_size: self.config.default_page_size,
            },
            authority,
            transport,
            connectivity.clone(),
            registry,
            cache,
            queue.clone(),
        ));

        let weak: Weak<RequestDispatcher> = Arc::downgrade(&dispatcher);
        connectivity.subscribe(Arc::new(move |connected| {
            if !connected {
                return;
            }
            if let Some(dispatcher) = weak.upgrade() {
                info!("connectivity restored, draining queued writes");
                dispatcher.schedule_drain();
            }
        }));

        if !queue.is_empty().await && connectivity.is_connected() {
            dispatcher.schedule_drain();
        }

        Ok(Client { dispatcher })
    }
}
