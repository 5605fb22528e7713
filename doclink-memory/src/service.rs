//! In-process emulator of the document service.
//!
//! [`InMemoryService`] implements [`Transport`] by answering requests from an in-memory
//! resource tree instead of the network. It assigns system properties (`_rid`, `_self`,
//! `_etag`, `_ts`) the way the real service does, resolves stable addresses, pages feeds with
//! continuation tokens, and evaluates simple queries. A reachability switch and failure
//! injection let tests exercise the offline paths of the access layer.

use async_trait::async_trait;
use chrono::Utc;
use mea::mutex::Mutex;
use serde_json::{Map, Value, json};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tracing::debug;

use doclink_core::{
    address::ResourceKind,
    dispatcher::{
        HEADER_AUTHORIZATION, HEADER_CONTINUATION, HEADER_ETAG, HEADER_IF_NONE_MATCH,
        HEADER_IS_QUERY, HEADER_IS_UPSERT, HEADER_MAX_ITEM_COUNT,
    },
    query::QuerySpec,
    transport::{HttpRequest, HttpResponse, Method, Transport, TransportError},
};

use crate::evaluator::Filter;

/// Page size used when a feed request does not set one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

type Procedure = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredResource {
    kind: ResourceKind,
    body: Value,
    sequence: u64,
}

#[derive(Default)]
struct ServiceState {
    /// hierarchical path -> resource
    resources: BTreeMap<String, StoredResource>,
    /// `_self` without slashes -> hierarchical path
    by_self: HashMap<String, String>,
    procedures: HashMap<String, Procedure>,
    requests: Vec<HttpRequest>,
    counter: u64,
}

/// In-memory document service.
///
/// Clones share the same resource tree, switches and request log.
///
/// # Example
///
/// ```ignore
/// use doclink_memory::InMemoryService;
///
/// let service = InMemoryService::new();
/// let client = Client::builder("https://acct.example.com")
///     .transport(Arc::new(service.clone()))
///     // ...
///     .build()
///     .await?;
///
/// service.set_reachable(false);
/// ```
#[derive(Clone)]
pub struct InMemoryService {
    state: Arc<Mutex<ServiceState>>,
    reachable: Arc<AtomicBool>,
    passes: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    page_size: usize,
}

impl fmt::Debug for InMemoryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryService")
            .field("reachable", &self.is_reachable())
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryService {
    fn default() -> Self {
        Self::new()
    }
}

fn error_response(status: u16, code: &str, message: impl Into<String>) -> HttpResponse {
    let body = json!({ "code": code, "message": message.into() });

    HttpResponse::new(status)
        .with_header("content-type", "application/json")
        .with_body(body.to_string().into_bytes())
}

fn json_response(status: u16, body: &Value) -> HttpResponse {
    HttpResponse::new(status)
        .with_header("content-type", "application/json")
        .with_body(body.to_string().into_bytes())
}

/// Path of `url` below the account endpoint, without leading or trailing slashes.
fn request_path(url: &str) -> &str {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    match rest.find('/') {
        Some(index) => rest[index..].trim_matches('/'),
        None => "",
    }
}

fn join(parent: &str, kind: ResourceKind, id: &str) -> String {
    if parent.is_empty() {
        format!("{}/{id}", kind.segment())
    } else {
        format!("{parent}/{}/{id}", kind.segment())
    }
}

impl InMemoryService {
    /// Creates an empty, reachable service.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState::default())),
            reachable: Arc::new(AtomicBool::new(true)),
            passes: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(AtomicUsize::new(0)),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets the page size used when a feed request does not specify one.
    pub fn with_default_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Makes every subsequent request fail (or succeed again) at the transport level.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Makes the next `count` requests time out, even while reachable.
    pub fn fail_next(&self, count: usize) {
        self.fail_after(0, count);
    }

    /// Lets `passes` requests through, then makes the `count` after them time out.
    pub fn fail_after(&self, passes: usize, count: usize) {
        self.passes.store(passes, Ordering::SeqCst);
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every request that reached the service, in arrival order.
    pub async fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().await.requests.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.state.lock().await.requests.len()
    }

    /// The stored body at hierarchical `path`.
    pub async fn resource(&self, path: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .resources
            .get(path.trim_matches('/'))
            .map(|r| r.body.clone())
    }

    /// Number of stored resources, at every level.
    pub async fn len(&self) -> usize {
        self.state.lock().await.resources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deletes `path` and its subtree behind the client's back, as another client would.
    pub async fn remove(&self, path: &str) -> bool {
        self.state.lock().await.remove_subtree(path.trim_matches('/'))
    }

    /// Registers the behavior of the stored procedure at hierarchical `path`.
    pub async fn register_procedure<F>(&self, path: &str, procedure: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .await
            .procedures
            .insert(path.trim_matches('/').to_string(), Arc::new(procedure));
    }

    fn take_failure(&self) -> bool {
        if self.failures.load(Ordering::SeqCst) == 0 {
            return false;
        }
        if self
            .passes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }

        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for InMemoryService {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if !self.is_reachable() {
            return Err(TransportError::Unreachable("in-memory service is offline".into()));
        }
        if self.take_failure() {
            return Err(TransportError::Timeout("injected failure".into()));
        }

        let mut state = self.state.lock().await;
        state.requests.push(request.clone());

        let response = state.handle(&request, self.page_size);
        debug!(method = %request.method, url = %request.url, status = response.status, "in-memory service");

        Ok(response)
    }
}

impl ServiceState {
    fn handle(&mut self, request: &HttpRequest, default_page_size: usize) -> HttpResponse {
        if request
            .header(HEADER_AUTHORIZATION)
            .is_none_or(|token| token.trim().is_empty())
        {
            return error_response(401, "Unauthorized", "missing authorization token");
        }

        let path = request_path(&request.url);
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return error_response(400, "BadRequest", "no resource in request path");
        }

        if parts.len() % 2 == 1 {
            let Some(kind) = parts.last().and_then(|s| ResourceKind::from_segment(s)) else {
                return error_response(400, "BadRequest", format!("unknown feed in {path}"));
            };
            let parent = if parts.len() == 1 {
                None
            } else {
                match self.resolve(&parts[..parts.len() - 1]) {
                    Ok(Some(parent)) => Some(parent),
                    Ok(None) => return error_response(404, "NotFound", format!("{path} not found")),
                    Err(response) => return response,
                }
            };

            let parent_kind = parent
                .as_ref()
                .and_then(|p| self.resources.get(p))
                .map(|r| r.kind);
            if kind.parent() != parent_kind {
                return error_response(400, "BadRequest", format!("{kind} cannot live there"));
            }

            return match request.method {
                Method::Get => self.list(parent.as_deref(), kind, request, None, default_page_size),
                Method::Post if request.header(HEADER_IS_QUERY).is_some() => {
                    self.query(parent.as_deref(), kind, request, default_page_size)
                }
                Method::Post => self.create(parent.as_deref(), kind, request),
                _ => error_response(405, "MethodNotAllowed", format!("{} on a feed", request.method)),
            };
        }

        let resolved = match self.resolve(&parts) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return error_response(404, "NotFound", format!("{path} not found")),
            Err(response) => return response,
        };

        match request.method {
            Method::Get => self.read(&resolved, request),
            Method::Put => self.replace(&resolved, request),
            Method::Delete => {
                self.remove_subtree(&resolved);
                HttpResponse::new(204)
            }
            Method::Post => self.execute(&resolved, request),
        }
    }

    /// Resolves alternating `segment/id` parts, each id either caller-chosen or a `_rid`, to
    /// the hierarchical path of an existing resource.
    fn resolve(&self, parts: &[&str]) -> Result<Option<String>, HttpResponse> {
        let mut path = String::new();
        let mut self_link = String::new();

        for pair in parts.chunks(2) {
            let [segment, id] = pair else {
                return Err(error_response(400, "BadRequest", "incomplete resource path"));
            };
            let Some(kind) = ResourceKind::from_segment(segment) else {
                return Err(error_response(400, "BadRequest", format!("unknown segment {segment}")));
            };

            let by_id = join(&path, kind, id);
            let by_rid = join(&self_link, kind, id);

            path = if self.resources.contains_key(&by_id) {
                by_id
            } else {
                match self.by_self.get(&by_rid) {
                    Some(resolved) => resolved.clone(),
                    None => return Ok(None),
                }
            };

            self_link = self
                .resources
                .get(&path)
                .and_then(|r| r.body.get("_self"))
                .and_then(Value::as_str)
                .map(|s| s.trim_matches('/').to_string())
                .unwrap_or_default();
        }

        Ok(Some(path))
    }

    fn read(&self, path: &str, request: &HttpRequest) -> HttpResponse {
        let Some(resource) = self.resources.get(path) else {
            return error_response(404, "NotFound", format!("{path} not found"));
        };
        let etag = resource.body.get("_etag").and_then(Value::as_str).unwrap_or_default();

        if request.header(HEADER_IF_NONE_MATCH) == Some(etag) {
            return HttpResponse::new(304).with_header(HEADER_ETAG, etag);
        }

        json_response(200, &resource.body).with_header(HEADER_ETAG, etag)
    }

    fn children(&self, parent: Option<&str>, kind: ResourceKind) -> Vec<&StoredResource> {
        let prefix = match parent {
            Some(parent) => format!("{parent}/{}/", kind.segment()),
            None => format!("{}/", kind.segment()),
        };

        let mut children: Vec<&StoredResource> = self
            .resources
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path[prefix.len()..].contains('/'))
            .map(|(_, resource)| resource)
            .collect();
        children.sort_by_key(|r| r.sequence);
        children
    }

    fn list(
        &self,
        parent: Option<&str>,
        kind: ResourceKind,
        request: &HttpRequest,
        filter: Option<&Filter>,
        default_page_size: usize,
    ) -> HttpResponse {
        let items: Vec<&Value> = self
            .children(parent, kind)
            .into_iter()
            .map(|r| &r.body)
            .filter(|body| filter.is_none_or(|f| f.matches(body)))
            .collect();

        let page_size = match request.header(HEADER_MAX_ITEM_COUNT).map(str::parse::<i64>) {
            None => default_page_size,
            Some(Ok(size)) if size > 0 => size as usize,
            Some(Ok(_)) => default_page_size,
            Some(Err(_)) => return error_response(400, "BadRequest", "invalid max item count"),
        };
        let offset = match request.header(HEADER_CONTINUATION).map(str::parse::<usize>) {
            None => 0,
            Some(Ok(offset)) if offset <= items.len() => offset,
            Some(_) => return error_response(400, "BadRequest", "invalid continuation"),
        };

        let end = (offset + page_size).min(items.len());
        let page: Vec<Value> = items[offset..end].iter().map(|v| (*v).clone()).collect();

        let parent_rid = parent
            .and_then(|p| self.resources.get(p))
            .and_then(|r| r.body.get("_rid"))
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));

        let mut body = Map::new();
        body.insert("_rid".into(), parent_rid);
        body.insert("_count".into(), json!(page.len()));
        body.insert(kind.feed_key().into(), Value::Array(page));

        let response = json_response(200, &Value::Object(body));
        if end < items.len() {
            response.with_header(HEADER_CONTINUATION, end.to_string())
        } else {
            response
        }
    }

    fn query(
        &self,
        parent: Option<&str>,
        kind: ResourceKind,
        request: &HttpRequest,
        default_page_size: usize,
    ) -> HttpResponse {
        let spec: QuerySpec = match request.body.as_deref().map(serde_json::from_slice) {
            Some(Ok(spec)) => spec,
            _ => return error_response(400, "BadRequest", "query body is not a query spec"),
        };

        match Filter::parse(&spec) {
            Ok(filter) => self.list(parent, kind, request, Some(&filter), default_page_size),
            Err(message) => error_response(400, "BadRequest", message),
        }
    }

    fn parse_body(request: &HttpRequest) -> Result<Map<String, Value>, HttpResponse> {
        match request.body.as_deref().map(serde_json::from_slice::<Value>) {
            Some(Ok(Value::Object(body))) => Ok(body),
            _ => Err(error_response(400, "BadRequest", "body must be a JSON object")),
        }
    }

    fn next_etag(&mut self) -> String {
        self.counter += 1;
        format!("\"{:08x}\"", self.counter)
    }

    fn create(&mut self, parent: Option<&str>, kind: ResourceKind, request: &HttpRequest) -> HttpResponse {
        let mut body = match Self::parse_body(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let Some(id) = body.get("id").and_then(Value::as_str).map(str::to_string) else {
            return error_response(400, "BadRequest", "resource has no id");
        };
        if id.is_empty() || id.contains(['/', '\\', '?', '#']) || id.ends_with(' ') {
            return error_response(400, "BadRequest", format!("invalid id {id:?}"));
        }

        let path = join(parent.unwrap_or_default(), kind, &id);
        let upsert = request
            .header(HEADER_IS_UPSERT)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        if let Some(existing) = self.resources.get(&path) {
            if !upsert {
                return error_response(409, "Conflict", format!("{path} already exists"));
            }

            let existing = existing.clone();
            return self.store_replacement(&path, existing, body, 200);
        }

        self.counter += 1;
        let rid = format!("r{:06}", self.counter);
        let parent_self = parent
            .and_then(|p| self.resources.get(p))
            .and_then(|r| r.body.get("_self"))
            .and_then(Value::as_str)
            .map(|s| s.trim_matches('/').to_string())
            .unwrap_or_default();
        let self_link = join(&parent_self, kind, &rid);
        let etag = self.next_etag();

        body.insert("_rid".into(), Value::String(rid));
        body.insert("_self".into(), Value::String(format!("{self_link}/")));
        body.insert("_etag".into(), Value::String(etag.clone()));
        body.insert("_ts".into(), json!(Utc::now().timestamp()));

        let body = Value::Object(body);
        self.by_self.insert(self_link, path.clone());
        self.resources.insert(
            path,
            StoredResource {
                kind,
                body: body.clone(),
                sequence: self.counter,
            },
        );

        json_response(201, &body).with_header(HEADER_ETAG, etag)
    }

    fn replace(&mut self, path: &str, request: &HttpRequest) -> HttpResponse {
        let body = match Self::parse_body(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let Some(existing) = self.resources.get(path).cloned() else {
            return error_response(404, "NotFound", format!("{path} not found"));
        };

        if body.get("id") != existing.body.get("id") {
            return error_response(400, "BadRequest", "id does not match the replaced resource");
        }

        self.store_replacement(path, existing, body, 200)
    }

    fn store_replacement(
        &mut self,
        path: &str,
        existing: StoredResource,
        mut body: Map<String, Value>,
        status: u16,
    ) -> HttpResponse {
        for key in ["_rid", "_self"] {
            if let Some(value) = existing.body.get(key) {
                body.insert(key.into(), value.clone());
            }
        }
        let etag = self.next_etag();
        body.insert("_etag".into(), Value::String(etag.clone()));
        body.insert("_ts".into(), json!(Utc::now().timestamp()));

        let body = Value::Object(body);
        self.resources.insert(
            path.to_string(),
            StoredResource {
                body: body.clone(),
                ..existing
            },
        );

        json_response(status, &body).with_header(HEADER_ETAG, etag)
    }

    fn execute(&self, path: &str, request: &HttpRequest) -> HttpResponse {
        if self.resources.get(path).map(|r| r.kind) != Some(ResourceKind::StoredProcedure) {
            return error_response(405, "MethodNotAllowed", format!("POST on {path}"));
        }
        let Some(procedure) = self.procedures.get(path) else {
            return error_response(400, "BadRequest", format!("{path} has no registered behavior"));
        };

        let params = match request.body.as_deref().map(serde_json::from_slice::<Value>) {
            None => Vec::new(),
            Some(Ok(Value::Array(params))) => params,
            Some(_) => return error_response(400, "BadRequest", "parameters must be an array"),
        };

        match (**procedure)(&params) {
            Ok(result) => json_response(200, &result),
            Err(message) => error_response(400, "BadRequest", message),
        }
    }

    fn remove_subtree(&mut self, path: &str) -> bool {
        let nested = format!("{path}/");
        let doomed: Vec<String> = self
            .resources
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&nested))
            .cloned()
            .collect();

        for key in &doomed {
            self.resources.remove(key);
            self.procedures.remove(key);
        }
        self.by_self.retain(|_, target| !doomed.contains(target));

        !doomed.is_empty()
    }
}
