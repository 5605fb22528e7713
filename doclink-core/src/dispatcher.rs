//! Request composition and response classification.
//!
//! The [`RequestDispatcher`] drives every operation through the same states:
//!
//! ```text
//! Building → TokenPending → { TokenFailed | Sending }
//!          → { TransportFailed | ResponseReceived }
//!          → { Success | NotModified | AppError }
//! ```
//!
//! and decides what each outcome does to the other services:
//!
//! | outcome                        | read                          | write                     |
//! |--------------------------------|-------------------------------|---------------------------|
//! | 2xx                            | cache put, link recorded      | same; delete invalidates  |
//! | 304                            | cached body, cache touched    | n/a                       |
//! | 404                            | cache invalidated, `NotFound` | `ServerApplication`       |
//! | other status                   | `ServerApplication`           | `ServerApplication`       |
//! | transport failure              | cache fallback (kind hint)    | queued for replay         |
//! | invalid address, token failure | returned, nothing sent        | returned, never queued    |

use async_trait::async_trait;
use chrono::Utc;
use mea::mutex::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    address::{ResourceAddress, ResourceKind, Target},
    cache::ResourceCache,
    connectivity::SharedMonitor,
    error::{AccessError, AccessResult},
    link::LinkRegistry,
    page::{FeedPage, validate_page_size},
    query::QuerySpec,
    queue::{DrainReport, PendingWrite, QueuedWrite, WriteKind, WriteReplayQueue, WriteReplayer},
    resource::{ResourceMeta, ResourceResponse},
    token::{TokenAuthority, http_date},
    transport::{HttpRequest, HttpResponse, Method, SharedTransport},
};

pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_VERSION: &str = "x-ms-version";
pub const HEADER_DATE: &str = "x-ms-date";
pub const HEADER_CONTINUATION: &str = "x-ms-continuation";
pub const HEADER_MAX_ITEM_COUNT: &str = "x-ms-max-item-count";
pub const HEADER_IS_QUERY: &str = "x-ms-documentdb-isquery";
pub const HEADER_IS_UPSERT: &str = "x-ms-documentdb-is-upsert";
pub const HEADER_IF_NONE_MATCH: &str = "If-None-Match";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_ETAG: &str = "etag";

/// API version sent with every request unless configured otherwise.
pub const DEFAULT_API_VERSION: &str = "2018-12-31";

/// Where an operation is in its lifecycle. Reported through `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Building,
    TokenPending,
    TokenFailed,
    Sending,
    TransportFailed,
    ResponseReceived,
    Success,
    NotModified,
    AppError,
}

/// Per-request knobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Page size for listings and queries (1..=1000).
    pub max_item_count: Option<u32>,
    /// Extra headers appended to the request, e.g. a partition key.
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn with_max_item_count(mut self, count: u32) -> Self {
        self.max_item_count = Some(count);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Result of submitting a write: delivered now, or queued until connectivity returns.
#[derive(Debug)]
pub enum WriteOutcome<T = Value> {
    Completed(ResourceResponse<T>),
    Queued(PendingWrite<T>),
}

impl<T> WriteOutcome<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued(_))
    }
}

impl WriteOutcome<Value> {
    /// Deserializes the delivered resource, or retypes the pending handle, as `T`.
    pub fn typed<T: DeserializeOwned>(self) -> AccessResult<WriteOutcome<T>> {
        Ok(match self {
            WriteOutcome::Completed(response) => WriteOutcome::Completed(response.into_typed()?),
            WriteOutcome::Queued(pending) => WriteOutcome::Queued(pending.typed()),
        })
    }
}

impl<T: DeserializeOwned> WriteOutcome<T> {
    /// Waits for the write's final result, which is immediate unless it was queued.
    pub async fn resolve(self) -> AccessResult<ResourceResponse<T>> {
        match self {
            WriteOutcome::Completed(response) => Ok(response),
            WriteOutcome::Queued(pending) => pending.await,
        }
    }
}

/// A listing request, retained so that `next` can resume it.
#[derive(Debug, Clone)]
struct FeedRequest {
    target: Target,
    hint: Option<ResourceKind>,
    query: Option<QuerySpec>,
    options: RequestOptions,
}

#[derive(Debug, Clone)]
struct FeedCursor {
    request: FeedRequest,
    continuation: Option<String>,
}

/// Settings the dispatcher needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub account_endpoint: String,
    pub api_version: String,
    pub default_page_size: Option<u32>,
}

pub struct RequestDispatcher {
    settings: DispatcherSettings,
    authority: TokenAuthority,
    transport: SharedTransport,
    connectivity: SharedMonitor,
    registry: Arc<LinkRegistry>,
    cache: Arc<ResourceCache>,
    queue: Arc<WriteReplayQueue>,
    last_feed: Mutex<Option<FeedCursor>>,
}

fn trace_state(op: &str, path: &str, state: OperationState) {
    debug!(op, path, state = ?state, "operation state");
}

fn parse_body(response: &HttpResponse) -> AccessResult<Value> {
    if response.body.is_empty() {
        return Ok(Value::Null);
    }

    Ok(serde_json::from_slice(&response.body)?)
}

fn app_error(response: &HttpResponse) -> AccessError {
    let payload = if response.body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&response.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&response.body).into_owned()))
    };

    AccessError::ServerApplication {
        status_code: response.status,
        payload,
    }
}

impl RequestDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: DispatcherSettings,
        authority: TokenAuthority,
        transport: SharedTransport,
        connectivity: SharedMonitor,
        registry: Arc<LinkRegistry>,
        cache: Arc<ResourceCache>,
        queue: Arc<WriteReplayQueue>,
    ) -> Self {
        Self {
            settings,
            authority,
            transport,
            connectivity,
            registry,
            cache,
            queue,
            last_feed: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<WriteReplayQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &SharedMonitor {
        &self.connectivity
    }

    /// Mints a token and sends one request. Transport failures come back as
    /// [`AccessError::TransportUnavailable`]; nothing else does.
    async fn send(
        &self,
        op: &'static str,
        method: Method,
        target: &Target,
        body: Option<Vec<u8>>,
        mut headers: Vec<(String, String)>,
    ) -> AccessResult<HttpResponse> {
        let path = target.canonical_path();

        trace_state(op, &path, OperationState::TokenPending);
        let date = Utc::now();
        let lease = match self.authority.token(target, method, date).await {
            Ok(lease) => lease,
            Err(err) => {
                trace_state(op, &path, OperationState::TokenFailed);
                return Err(err);
            }
        };

        headers.push((HEADER_AUTHORIZATION.into(), lease.token));
        headers.push((HEADER_VERSION.into(), self.settings.api_version.clone()));
        headers.push((HEADER_DATE.into(), http_date(date)));
        if body.is_some() && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(HEADER_CONTENT_TYPE)) {
            headers.push((HEADER_CONTENT_TYPE.into(), "application/json".into()));
        }

        if !self.connectivity.is_connected() {
            trace_state(op, &path, OperationState::TransportFailed);
            return Err(AccessError::TransportUnavailable("network is offline".into()));
        }

        trace_state(op, &path, OperationState::Sending);
        let request = HttpRequest {
            method,
            url: format!("{}/{}", self.settings.account_endpoint, path),
            headers,
            body,
        };

        match self.transport.send(request).await {
            Ok(response) => {
                debug!(op, path = %path, status = response.status, "response received");
                Ok(response)
            }
            Err(err) => {
                warn!(op, path = %path, error = %err, "transport failure");
                trace_state(op, &path, OperationState::TransportFailed);
                Err(err.into())
            }
        }
    }

    /// Records what a successful response revealed about a resource: the link between its
    /// two addresses, and its body in the cache.
    async fn absorb(
        &self,
        address: &ResourceAddress,
        kind: ResourceKind,
        body: &Value,
        etag: Option<&str>,
    ) -> AccessResult<ResourceMeta> {
        let meta = ResourceMeta::from_body(body);
        let address = match (self.registry.to_hierarchical(address).await, &meta.self_link) {
            // A child of an unmapped stable parent is filed under the link the server gave it.
            (ResourceAddress::Stable { .. }, Some(self_link)) => {
                self.registry
                    .to_hierarchical(&ResourceAddress::stable(self_link.clone(), kind))
                    .await
            }
            (address, _) => address,
        };

        if let (ResourceAddress::Path { .. }, Some(self_link)) = (&address, &meta.self_link) {
            self.registry
                .record(&address.canonical_path(), self_link, kind)
                .await?;
        }

        let etag = etag.or(meta.etag.as_deref());
        self.cache.put(&address, kind, body, etag).await?;

        Ok(meta)
    }

    /// Feed targets whose parent is known under both schemes are addressed hierarchically.
    async fn normalize(&self, target: &Target) -> Target {
        match target {
            Target::Feed { parent: Some(parent), kind } => Target::Feed {
                parent: Some(self.registry.to_hierarchical(parent).await),
                kind: *kind,
            },
            other => other.clone(),
        }
    }

    /// Reads one resource.
    ///
    /// With a kind `hint`, a transport failure is answered from the cache (flagged
    /// `from_cache`), or with `NotFound` if nothing is cached. Without a hint the transport
    /// error is returned as is.
    pub async fn read(
        &self,
        address: &ResourceAddress,
        hint: Option<ResourceKind>,
        options: &RequestOptions,
    ) -> AccessResult<ResourceResponse<Value>> {
        let target = Target::resource(address.clone());
        let path = target.canonical_path();

        trace_state("read", &path, OperationState::Building);
        target.validate()?;
        let kind = hint.unwrap_or_else(|| address.kind());

        let cached = match hint {
            Some(kind) => self.cache.get(address, kind).await?,
            None => None,
        };

        let mut headers = options.headers.clone();
        if let Some(etag) = cached.as_ref().and_then(|e| e.etag.clone()) {
            headers.push((HEADER_IF_NONE_MATCH.into(), etag));
        }

        let response = match self.send("read", Method::Get, &target, None, headers).await {
            Ok(response) => response,
            Err(err) if err.is_transport() => {
                return match (hint, cached) {
                    (Some(_), Some(entry)) => {
                        debug!(path = %path, "serving cached resource while offline");
                        Ok(ResourceResponse::new(entry.body)
                            .with_from_cache(true)
                            .with_etag(entry.etag))
                    }
                    (Some(_), None) => Err(AccessError::NotFound(path)),
                    (None, _) => Err(err),
                };
            }
            Err(err) => return Err(err),
        };

        trace_state("read", &path, OperationState::ResponseReceived);

        match response.status {
            304 => {
                trace_state("read", &path, OperationState::NotModified);
                let entry = cached.ok_or_else(|| {
                    AccessError::Unknown(format!("{path} not modified but nothing is cached"))
                })?;
                self.cache.touch(address).await?;

                Ok(ResourceResponse::new(entry.body)
                    .with_not_modified(true)
                    .with_etag(entry.etag)
                    .with_stable_address(self.registry.resolve_path(&path).await))
            }
            404 => {
                trace_state("read", &path, OperationState::AppError);
                self.cache.invalidate(address).await?;
                Err(AccessError::NotFound(path))
            }
            _ if response.is_success() => {
                trace_state("read", &path, OperationState::Success);
                let body = parse_body(&response)?;
                let meta = self
                    .absorb(address, kind, &body, response.header(HEADER_ETAG))
                    .await?;

                Ok(ResourceResponse::new(body)
                    .with_etag(meta.etag)
                    .with_stable_address(meta.self_link))
            }
            _ => {
                trace_state("read", &path, OperationState::AppError);
                Err(app_error(&response))
            }
        }
    }

    /// Lists the first page of a feed.
    pub async fn list(
        &self,
        feed: &Target,
        hint: Option<ResourceKind>,
        options: &RequestOptions,
    ) -> AccessResult<FeedPage<Value>> {
        self.run_feed(
            FeedRequest {
                target: feed.clone(),
                hint,
                query: None,
                options: options.clone(),
            },
            None,
        )
        .await
    }

    /// Runs a query against a feed and returns its first page. Queries are evaluated by the
    /// service only, so a transport failure is never answered from the cache.
    pub async fn query(
        &self,
        feed: &Target,
        query: &QuerySpec,
        options: &RequestOptions,
    ) -> AccessResult<FeedPage<Value>> {
        self.run_feed(
            FeedRequest {
                target: feed.clone(),
                hint: None,
                query: Some(query.clone()),
                options: options.clone(),
            },
            None,
        )
        .await
    }

    /// Fetches the page after the last one returned by `list`, `query` or `next`.
    pub async fn next(&self) -> AccessResult<FeedPage<Value>> {
        let cursor = self
            .last_feed
            .lock()
            .await
            .clone()
            .ok_or(AccessError::NextCalledTooEarly)?;
        let continuation = cursor.continuation.ok_or(AccessError::NoMoreResults)?;

        self.run_feed(cursor.request, Some(continuation)).await
    }

    async fn run_feed(
        &self,
        request: FeedRequest,
        continuation: Option<String>,
    ) -> AccessResult<FeedPage<Value>> {
        let result = self.fetch_feed(&request, continuation).await;

        *self.last_feed.lock().await = match &result {
            Ok(page) => Some(FeedCursor {
                request,
                continuation: page.continuation.clone(),
            }),
            Err(_) => None,
        };

        result
    }

    async fn fetch_feed(
        &self,
        request: &FeedRequest,
        continuation: Option<String>,
    ) -> AccessResult<FeedPage<Value>> {
        let op = if request.query.is_some() { "query" } else { "list" };
        let target = self.normalize(&request.target).await;
        let path = target.canonical_path();

        trace_state(op, &path, OperationState::Building);
        let (parent, kind) = match &target {
            Target::Feed { parent, kind } => (parent.clone(), *kind),
            Target::Resource { .. } => {
                return Err(AccessError::InvalidArgument(format!("{path} is not a feed")));
            }
        };
        target.validate()?;

        let mut headers = request.options.headers.clone();
        if let Some(size) = request
            .options
            .max_item_count
            .or(self.settings.default_page_size)
        {
            headers.push((HEADER_MAX_ITEM_COUNT.into(), validate_page_size(size)?.to_string()));
        }
        if let Some(continuation) = continuation {
            headers.push((HEADER_CONTINUATION.into(), continuation));
        }

        let (method, body) = match &request.query {
            Some(query) => {
                headers.push((HEADER_IS_QUERY.into(), "True".into()));
                headers.push((HEADER_CONTENT_TYPE.into(), "application/query+json".into()));
                (Method::Post, Some(serde_json::to_vec(query)?))
            }
            None => (Method::Get, None),
        };

        let response = match self.send(op, method, &target, body, headers).await {
            Ok(response) => response,
            Err(err) if err.is_transport() && request.query.is_none() => {
                return match request.hint {
                    Some(kind) => {
                        debug!(path = %path, "serving cached feed while offline");
                        let items = self
                            .cache
                            .get_all(parent.as_ref(), kind)
                            .await?
                            .into_iter()
                            .map(|entry| entry.body)
                            .collect();

                        Ok(FeedPage::builder(items).with_from_cache(true).build())
                    }
                    None => Err(err),
                };
            }
            Err(err) => return Err(err),
        };

        trace_state(op, &path, OperationState::ResponseReceived);

        if response.status == 404 {
            trace_state(op, &path, OperationState::AppError);
            if let Some(parent) = &parent {
                self.cache.invalidate(parent).await?;
            }
            return Err(AccessError::NotFound(path));
        }
        if !response.is_success() {
            trace_state(op, &path, OperationState::AppError);
            return Err(app_error(&response));
        }

        trace_state(op, &path, OperationState::Success);
        let body = parse_body(&response)?;
        let items = match body.get(kind.feed_key()) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) | None => Vec::new(),
        };

        for item in &items {
            if let Some(id) = item.get("id").and_then(Value::as_str) {
                self.absorb(&target.child_address(id), kind, item, None).await?;
            }
        }

        Ok(FeedPage::builder(items)
            .with_continuation(response.header(HEADER_CONTINUATION).map(str::to_string))
            .build())
    }

    /// Creates a resource in `feed`.
    pub async fn create(
        &self,
        feed: &Target,
        body: &Value,
        options: &RequestOptions,
    ) -> AccessResult<WriteOutcome> {
        let feed = self.normalize(feed).await;
        let landing = match body.get("id").and_then(Value::as_str) {
            Some(id) => Target::resource(feed.child_address(id)),
            None => feed.clone(),
        };

        self.submit(WriteKind::Create, feed, &landing, Some(body), options)
            .await
    }

    /// Replaces the resource at `address` with `body`.
    pub async fn replace(
        &self,
        address: &ResourceAddress,
        body: &Value,
        options: &RequestOptions,
    ) -> AccessResult<WriteOutcome> {
        let target = Target::resource(address.clone());

        self.submit(WriteKind::Replace, target.clone(), &target, Some(body), options)
            .await
    }

    /// Deletes the resource at `address`.
    pub async fn delete(
        &self,
        address: &ResourceAddress,
        options: &RequestOptions,
    ) -> AccessResult<WriteOutcome> {
        let target = Target::resource(address.clone());

        self.submit(WriteKind::Delete, target.clone(), &target, None, options)
            .await
    }

    /// Sends a write, queueing it if the service cannot be reached or if earlier writes to the
    /// same resource are still queued.
    async fn submit(
        &self,
        kind: WriteKind,
        target: Target,
        landing: &Target,
        body: Option<&Value>,
        options: &RequestOptions,
    ) -> AccessResult<WriteOutcome> {
        let path = target.canonical_path();

        trace_state("write", &path, OperationState::Building);
        target.validate()?;
        landing.validate()?;

        let ordering_key = match landing {
            Target::Resource { address } => self.registry.canonical_key(address).await.storage_key(),
            Target::Feed { .. } => format!("feed:{}", landing.canonical_path()),
        };
        let write = QueuedWrite::new(kind, target, ordering_key, body, options.headers.clone())?;

        if self.queue.has_pending(&write.ordering_key).await {
            debug!(path = %path, "earlier writes still queued, queueing behind them");
            return Ok(WriteOutcome::Queued(self.queue.enqueue(write).await?));
        }

        match self.perform(&write).await {
            Ok(response) => Ok(WriteOutcome::Completed(response)),
            Err(err) if err.is_transport() => {
                Ok(WriteOutcome::Queued(self.queue.enqueue(write).await?))
            }
            Err(err) => Err(err),
        }
    }

    /// Sends one write and classifies its response. Shared by fresh submissions and replays.
    async fn perform(&self, write: &QueuedWrite) -> AccessResult<ResourceResponse<Value>> {
        let (op, method) = match write.kind {
            WriteKind::Create => ("create", Method::Post),
            WriteKind::Replace => ("replace", Method::Put),
            WriteKind::Delete => ("delete", Method::Delete),
        };
        let target = self.normalize(&write.target).await;
        let path = target.canonical_path();
        let body = write.body.clone().map(String::into_bytes);

        let response = self
            .send(op, method, &target, body, write.headers.clone())
            .await?;

        trace_state(op, &path, OperationState::ResponseReceived);

        if !response.is_success() {
            trace_state(op, &path, OperationState::AppError);
            return Err(app_error(&response));
        }

        trace_state(op, &path, OperationState::Success);

        if write.kind == WriteKind::Delete {
            if let Target::Resource { address } = &target {
                let hierarchical = self.registry.to_hierarchical(address).await;
                self.cache.invalidate(&hierarchical).await?;
                if let ResourceAddress::Path { .. } = hierarchical {
                    self.registry.forget(&hierarchical.canonical_path()).await?;
                }
            }

            return Ok(ResourceResponse::new(Value::Null));
        }

        let body = parse_body(&response)?;
        let meta = ResourceMeta::from_body(&body);
        let address = match (&target, &meta.id) {
            (Target::Resource { address }, _) => Some(address.clone()),
            (Target::Feed { .. }, Some(id)) => Some(target.child_address(id)),
            (Target::Feed { .. }, None) => None,
        };

        if let Some(address) = address {
            self.absorb(&address, target.kind(), &body, response.header(HEADER_ETAG))
                .await?;
        }

        Ok(ResourceResponse::new(body)
            .with_etag(meta.etag)
            .with_stable_address(meta.self_link))
    }

    /// Executes a stored procedure with `params` and returns its result. Executions are neither
    /// cached nor queued.
    pub async fn execute(
        &self,
        procedure: &ResourceAddress,
        params: &[Value],
        options: &RequestOptions,
    ) -> AccessResult<Value> {
        let target = Target::resource(procedure.clone());
        let path = target.canonical_path();

        trace_state("execute", &path, OperationState::Building);
        target.validate()?;
        if procedure.kind() != ResourceKind::StoredProcedure {
            return Err(AccessError::InvalidArgument(format!(
                "{path} is not a stored procedure"
            )));
        }

        let response = self
            .send(
                "execute",
                Method::Post,
                &target,
                Some(serde_json::to_vec(params)?),
                options.headers.clone(),
            )
            .await?;

        if !response.is_success() {
            trace_state("execute", &path, OperationState::AppError);
            return Err(app_error(&response));
        }

        trace_state("execute", &path, OperationState::Success);
        parse_body(&response)
    }

    /// Replays queued writes now.
    pub async fn drain(&self) -> AccessResult<DrainReport> {
        self.queue.drain(self).await
    }

    /// Starts a drain on the ambient tokio runtime without waiting for it.
    pub fn schedule_drain(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let dispatcher = Arc::clone(self);
                handle.spawn(async move {
                    match dispatcher.drain().await {
                        Ok(report) => debug!(?report, "drain finished"),
                        Err(err) => warn!(error = %err, "drain failed"),
                    }
                });
            }
            Err(_) => warn!("no tokio runtime available, queued writes wait for an explicit drain"),
        }
    }
}

#[async_trait]
impl WriteReplayer for RequestDispatcher {
    async fn replay(&self, write: &QueuedWrite) -> AccessResult<ResourceResponse<Value>> {
        self.perform(write).await
    }

    fn is_connected(&self) -> bool {
        self.connectivity.is_connected()
    }
}
