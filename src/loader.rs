//! Load chains
//!
//! Every position of a route's chain (root layout down to the leaf) may have a
//! server load, answered through one batched `__data.json` request, and a
//! universal load that runs here. A position is re-run only when something it
//! read changed; otherwise its previous result is reused as is.
//!
//! All positions start together. A position calling `parent()` waits for the
//! positions above it, and a position that fails hands the page to the nearest
//! error page above it.

use crate::codec::{self, PageData, Value, ValueGraph};
use crate::config::RouterConfig;
use crate::error::{
    error_payload, retired_load_field, ErrorContext, ErrorHook, ErrorPayload, LoadError,
    NavigationError,
};
use crate::fetcher::{Fetcher, Request, Response};
use crate::params::{QueryParams, RouteParams};
use crate::route::{CompiledRoute, NodeRegistry, PageNode, RouteTarget, ROOT_ERROR, ROOT_LAYOUT};
use crate::state::{Field, NavigationState, PageSnapshot, RenderProps};
use crate::{debug_log, error_log, trace_log};
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use url::Url;

/// Result of one chain position
type PositionResult = Result<Arc<BranchNode>, LoadError>;

/// A position's load, awaitable by the positions below it
type SharedLoad = Shared<BoxFuture<'static, PositionResult>>;

// ============================================================================
// Universal load functions
// ============================================================================

/// A load function that runs in the client
///
/// Returning `Ok(None)` means "no data of my own": the position then exposes
/// its server data, if any.
#[async_trait]
pub trait UniversalLoad: Send + Sync {
    async fn load(&self, event: LoadEvent) -> Result<Option<PageData>, LoadError>;
}

/// Closure-backed load function, see [`load_fn`]
pub struct LoadFn<F> {
    load: F,
}

/// Wrap an async closure as a load function
///
/// ```
/// use page_navigator::{load_fn, ValueGraph};
/// use serde_json::json;
///
/// let load = load_fn(|event| async move {
///     let version = event.param("version").unwrap_or_default();
///     Ok(Some(ValueGraph::from_json(json!({ "version": version }))))
/// });
/// # let _ = load;
/// ```
pub fn load_fn<F, Fut>(load: F) -> LoadFn<F>
where
    F: Fn(LoadEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<PageData>, LoadError>> + Send + 'static,
{
    LoadFn { load }
}

#[async_trait]
impl<F, Fut> UniversalLoad for LoadFn<F>
where
    F: Fn(LoadEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<PageData>, LoadError>> + Send + 'static,
{
    async fn load(&self, event: LoadEvent) -> Result<Option<PageData>, LoadError> {
        (self.load)(event).await
    }
}

// ============================================================================
// Dependency tracking
// ============================================================================

/// What a load function read while running
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyUses {
    /// Route params it read
    pub params: BTreeSet<String>,
    /// It read the URL outside of its search part
    pub url: bool,
    /// It read the search string or search params
    pub search_params: bool,
    /// It awaited `parent()`
    pub parent: bool,
    /// It read the route id
    pub route: bool,
    /// Absolute URLs it fetched or declared with `depends`
    pub dependencies: BTreeSet<String>,
}

/// What differs between the committed navigation and the one being loaded
#[derive(Debug, Clone, Copy, Default)]
struct Changes {
    path: bool,
    search: bool,
    route: bool,
}

impl Changes {
    fn between(current: &NavigationState, route: &CompiledRoute, url: &Url) -> Self {
        let Some(previous) = &current.url else {
            return Self::default();
        };
        Self {
            path: previous.path() != url.path(),
            search: previous.query() != url.query(),
            route: current.route.as_ref().is_some_and(|r| r.id != route.id),
        }
    }
}

/// Forced re-runs requested through `invalidate` / `invalidate_all`
#[derive(Clone, Default)]
pub struct Invalidation {
    pub all: bool,
    pub predicates: Vec<InvalidationPredicate>,
}

/// Matches dependency URLs that must be reloaded
pub type InvalidationPredicate = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

impl Invalidation {
    fn matches(&self, dependency: &str) -> bool {
        Url::parse(dependency).is_ok_and(|url| self.predicates.iter().any(|predicate| predicate(&url)))
    }
}

impl fmt::Debug for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invalidation")
            .field("all", &self.all)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// The URL as load functions see it
///
/// Reads are recorded so the position re-runs when what it read changes. The
/// fragment never reaches the server and is not readable here.
#[derive(Clone)]
pub struct TrackedUrl {
    url: Url,
    uses: Arc<Mutex<DependencyUses>>,
}

impl TrackedUrl {
    fn read_url(&self) {
        self.uses.lock().url = true;
    }

    fn read_search(&self) {
        self.uses.lock().search_params = true;
    }

    /// Full URL; depends on both path and search
    pub fn href(&self) -> String {
        self.read_url();
        self.read_search();
        self.url.to_string()
    }

    pub fn origin(&self) -> String {
        self.read_url();
        self.url.origin().ascii_serialization()
    }

    pub fn host(&self) -> String {
        self.read_url();
        self.url.host_str().unwrap_or_default().to_string()
    }

    pub fn pathname(&self) -> String {
        self.read_url();
        self.url.path().to_string()
    }

    /// `?query`, or empty
    pub fn search(&self) -> String {
        self.read_search();
        crate::route::search(&self.url)
    }

    pub fn search_params(&self) -> QueryParams {
        self.read_search();
        QueryParams::from_url(&self.url)
    }

    /// Always an error: the fragment is not part of what a load depends on
    pub fn hash(&self) -> Result<String, NavigationError> {
        Err(NavigationError::NavigationShape {
            message: "url.hash is inaccessible from load. Consider accessing hash from the page store within the script tag of your component.".to_string(),
        })
    }

    /// The underlying URL; counts as reading all of it
    pub fn to_url(&self) -> Url {
        self.read_url();
        self.read_search();
        self.url.clone()
    }
}

impl fmt::Debug for TrackedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrackedUrl").field(&self.url.as_str()).finish()
    }
}

// ============================================================================
// Load events
// ============================================================================

/// Input of a universal load function
#[derive(Clone)]
pub struct LoadEvent {
    params: RouteParams,
    url: TrackedUrl,
    route_id: Option<String>,
    data: Option<PageData>,
    uses: Arc<Mutex<DependencyUses>>,
    fetcher: Arc<Fetcher>,
    parents: Arc<Vec<SharedLoad>>,
}

impl LoadEvent {
    fn new(
        params: RouteParams,
        mut url: Url,
        route_id: Option<String>,
        data: Option<PageData>,
        fetcher: Arc<Fetcher>,
        parents: Vec<SharedLoad>,
    ) -> Self {
        url.set_fragment(None);
        let uses = Arc::new(Mutex::new(DependencyUses::default()));
        Self {
            params,
            url: TrackedUrl {
                url,
                uses: Arc::clone(&uses),
            },
            route_id,
            data,
            uses,
            fetcher,
            parents: Arc::new(parents),
        }
    }

    /// A route param; the position re-runs when its value changes
    pub fn param(&self, name: &str) -> Option<String> {
        self.uses.lock().params.insert(name.to_string());
        self.params.get(name).map(str::to_string)
    }

    /// All route params; counts as reading each of them
    pub fn params(&self) -> RouteParams {
        let mut uses = self.uses.lock();
        for (name, _) in self.params.iter() {
            uses.params.insert(name.clone());
        }
        self.params.clone()
    }

    pub fn url(&self) -> &TrackedUrl {
        &self.url
    }

    pub fn route_id(&self) -> Option<&str> {
        self.uses.lock().route = true;
        self.route_id.as_deref()
    }

    /// Data returned by this position's server load
    pub fn data(&self) -> Option<&PageData> {
        self.data.as_ref()
    }

    /// Declare that the result depends on `url` (resolved against the page URL)
    pub fn depends(&self, url: &str) -> Result<(), NavigationError> {
        let resolved = self.resolve(url)?;
        self.uses.lock().dependencies.insert(resolved.to_string());
        Ok(())
    }

    /// GET `url` (resolved against the page URL); the URL becomes a dependency
    pub async fn fetch(&self, url: &str) -> Result<Response, NavigationError> {
        let request = Request::get(self.resolve(url)?);
        self.fetch_with(request).await
    }

    /// Send a request; its URL becomes a dependency
    pub async fn fetch_with(&self, request: Request) -> Result<Response, NavigationError> {
        self.uses
            .lock()
            .dependencies
            .insert(request.url.to_string());
        self.fetcher.fetch(request).await
    }

    /// Data of every position above this one, merged root first
    pub async fn parent(&self) -> Result<PageData, LoadError> {
        self.uses.lock().parent = true;

        let parents: Vec<SharedLoad> = self.parents.iter().cloned().collect();
        let mut layers = Vec::with_capacity(parents.len());
        for parent in parents {
            layers.push(parent.await?);
        }
        Ok(ValueGraph::merge(layers.iter().map(|node| &node.data)))
    }

    /// Read a field by name
    ///
    /// `props`, `session` and `stuff` no longer exist and are reported as
    /// `NavigationShape` errors.
    pub fn field(&self, name: &str) -> Result<Field<'_>, NavigationError> {
        match name {
            "params" => {
                let mut uses = self.uses.lock();
                for (param, _) in self.params.iter() {
                    uses.params.insert(param.clone());
                }
                Ok(Field::Params(&self.params))
            }
            "url" => {
                self.url.read_url();
                self.url.read_search();
                Ok(Field::Url(&self.url.url))
            }
            "route_id" | "routeId" => {
                self.uses.lock().route = true;
                Ok(Field::RouteId(self.route_id.as_deref()))
            }
            "data" => Ok(Field::Data(self.data.as_ref())),
            other => Err(retired_load_field(other)),
        }
    }

    fn resolve(&self, url: &str) -> Result<Url, NavigationError> {
        self.url.url.join(url).map_err(|e| NavigationError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    fn uses(&self) -> DependencyUses {
        self.uses.lock().clone()
    }
}

impl fmt::Debug for LoadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadEvent")
            .field("params", &self.params)
            .field("url", &self.url)
            .field("route_id", &self.route_id)
            .finish()
    }
}

// ============================================================================
// Server data
// ============================================================================

/// Data a server load produced, with what it read
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDataNode {
    pub data: Option<PageData>,
    pub uses: DependencyUses,
}

/// One position of a `__data.json` response
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNode {
    Data(ServerDataNode),
    /// Not re-run, keep the previous server data
    Skip,
    Error {
        status: Option<u16>,
        error: ErrorPayload,
    },
}

/// A decoded `__data.json` response
#[derive(Debug, Clone, PartialEq)]
pub enum ServerDataResponse {
    /// One entry per chain position, `None` where there is no server load
    Data(Vec<Option<ServerNode>>),
    Redirect { location: String },
}

impl ServerDataResponse {
    /// Interpret a decoded response graph
    pub fn from_graph(graph: &ValueGraph) -> Result<Self, NavigationError> {
        let kind = graph.get("type").and_then(Value::as_str);
        match kind {
            Some("redirect") => {
                let location = graph
                    .get("location")
                    .and_then(Value::as_str)
                    .ok_or_else(|| NavigationError::serialization("redirect without location"))?;
                Ok(Self::Redirect {
                    location: location.to_string(),
                })
            }
            Some("data") => {
                let nodes = graph
                    .get("nodes")
                    .and_then(|nodes| graph.items(nodes))
                    .ok_or_else(|| NavigationError::serialization("data response without nodes"))?;
                nodes
                    .iter()
                    .map(|node| match node {
                        None | Some(Value::Null | Value::Undefined) => Ok(None),
                        Some(node) => server_node(graph, node).map(Some),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::Data)
            }
            other => Err(NavigationError::serialization(format!(
                "unexpected server response type {:?}",
                other
            ))),
        }
    }
}

fn server_node(graph: &ValueGraph, node: &Value) -> Result<ServerNode, NavigationError> {
    match graph.field(node, "type").and_then(Value::as_str) {
        Some("skip") => Ok(ServerNode::Skip),
        Some("data") => {
            let data = graph
                .field(node, "data")
                .filter(|data| !matches!(data, Value::Null | Value::Undefined))
                .map(|data| graph.extract(data));
            let uses = graph
                .field(node, "uses")
                .map(|uses| server_uses(graph, uses))
                .unwrap_or_default();
            Ok(ServerNode::Data(ServerDataNode { data, uses }))
        }
        Some("error") => {
            let status = graph
                .field(node, "status")
                .and_then(Value::as_f64)
                .map(|status| status as u16);
            let error = match graph.field(node, "error") {
                Some(error) => {
                    let json = graph.extract(error).to_json()?;
                    serde_json::from_value(json)
                        .unwrap_or_else(|_| ErrorPayload::new("Internal Error"))
                }
                None => ErrorPayload::new("Internal Error"),
            };
            Ok(ServerNode::Error { status, error })
        }
        other => Err(NavigationError::serialization(format!(
            "unexpected server node type {:?}",
            other
        ))),
    }
}

fn server_uses(graph: &ValueGraph, uses: &Value) -> DependencyUses {
    let strings = |key: &str| -> BTreeSet<String> {
        graph
            .field(uses, key)
            .and_then(|list| graph.items(list))
            .map(|items| {
                items
                    .iter()
                    .flatten()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    let flag = |key: &str| -> bool {
        match graph.field(uses, key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => *n != 0.0,
            _ => false,
        }
    };

    DependencyUses {
        params: strings("params"),
        url: flag("url"),
        search_params: flag("search_params") || flag("url"),
        parent: flag("parent"),
        route: flag("route"),
        dependencies: strings("dependencies"),
    }
}

/// Fetch server data for the positions flagged in `invalid`
///
/// Sends a single request to `<pathname><data_suffix>` whose
/// `x-sveltekit-invalidated` header lists `"1"` for every position the server
/// must run and `""` for the ones it may skip.
pub async fn load_server_data(
    fetcher: &Fetcher,
    url: &Url,
    invalid: &[bool],
    data_suffix: &str,
) -> Result<ServerDataResponse, NavigationError> {
    let mut data_url = url.clone();
    let path = url.path().strip_suffix('/').unwrap_or(url.path());
    data_url.set_path(&format!("{}{}", path, data_suffix));
    data_url.set_fragment(None);

    let flags = invalid
        .iter()
        .map(|&flag| if flag { "1" } else { "" })
        .collect::<Vec<_>>()
        .join(",");

    trace_log!("Requesting server data {} [{}]", data_url, flags);
    let response = fetcher
        .fetch_uncached(Request::get(data_url).header("x-sveltekit-invalidated", flags))
        .await?;

    if !response.ok() {
        let body = response
            .json::<ErrorPayload>()
            .unwrap_or_else(|_| ErrorPayload::new(response.body()));
        return Err(NavigationError::Http {
            status: response.status(),
            body,
        });
    }

    let graph = codec::decode(response.body())?;
    ServerDataResponse::from_graph(&graph)
}

// ============================================================================
// Branches
// ============================================================================

/// Data a universal load returned, with what it read
#[derive(Debug, Clone, PartialEq)]
pub struct UniversalData {
    pub data: Option<PageData>,
    pub uses: DependencyUses,
}

/// The loaded state of one chain position
#[derive(Debug, Clone)]
pub struct BranchNode {
    /// Index in the node table
    pub index: usize,
    pub node: Arc<PageNode>,
    pub server: Option<ServerDataNode>,
    pub universal: Option<UniversalData>,
    /// Universal data if any, else server data, else an empty object
    pub data: PageData,
}

impl BranchNode {
    fn error_page(index: usize, node: Arc<PageNode>) -> Self {
        Self {
            index,
            node,
            server: None,
            universal: None,
            data: ValueGraph::object(),
        }
    }
}

/// How the form prop changes with a commit
#[derive(Debug, Clone, PartialEq)]
pub enum FormUpdate {
    /// Leave the current form value (invalidation)
    Keep,
    /// Reset it (ordinary navigation)
    Clear,
    /// Show an action result
    Set(PageData),
}

/// A branch ready to be turned into state and props
#[derive(Debug, Clone)]
pub struct BranchResult {
    pub url: Url,
    pub params: RouteParams,
    pub branch: Vec<Option<Arc<BranchNode>>>,
    pub status: u16,
    pub error: Option<ErrorPayload>,
    pub route: Option<Arc<CompiledRoute>>,
    pub form: FormUpdate,
}

/// A navigation ready to commit
#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub state: NavigationState,
    pub props: RenderProps,
    pub status: u16,
}

/// How a load chain ended
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(Box<LoadedPage>),
    /// Navigate to `location` (relative to the URL being loaded) instead
    Redirect { location: String },
    /// Nothing in the app can render this; load it as a new document
    Reload { url: Url },
}

/// Build state and render props from a branch
///
/// Only levels whose data is new get a data prop, and a page snapshot is only
/// produced when something a view could observe changed.
pub fn assemble(
    current: &NavigationState,
    page: Option<&PageSnapshot>,
    result: BranchResult,
) -> LoadedPage {
    let BranchResult {
        url,
        params,
        branch,
        status,
        error,
        route,
        form,
    } = result;

    let filtered: Vec<&Arc<BranchNode>> = branch.iter().flatten().collect();
    let mut props = RenderProps {
        components: filtered.iter().map(|node| Arc::clone(&node.node)).collect(),
        ..RenderProps::default()
    };

    let mut merged = ValueGraph::object();
    let mut data_changed = page.is_none();
    for node in &filtered {
        merged = ValueGraph::merge([&merged, &node.data]);
        let reused = current
            .branch
            .iter()
            .flatten()
            .any(|previous| Arc::ptr_eq(previous, node));
        if data_changed || !reused {
            props.data.push(Some(merged.clone()));
            data_changed = data_changed || !node.data.is_empty();
        } else {
            props.data.push(None);
        }
    }
    if let (false, Some(page)) = (data_changed, page) {
        data_changed = page.data.len() != merged.len();
    }

    let form_value = match &form {
        FormUpdate::Set(value) => Some(value.clone()),
        FormUpdate::Keep => page.and_then(|page| page.form.clone()),
        FormUpdate::Clear => None,
    };
    props.form = match form {
        FormUpdate::Set(value) => Some(value),
        _ => None,
    };

    let page_changed = current.url.as_ref() != Some(&url)
        || current.error != error
        || props.form.is_some()
        || data_changed;
    if page_changed {
        props.page = Some(PageSnapshot {
            url: url.clone(),
            params: params.clone(),
            route_id: route.as_ref().map(|route| route.id.clone()),
            status,
            error: error.clone(),
            data: match page {
                Some(page) if !data_changed => page.data.clone(),
                _ => merged,
            },
            form: form_value,
        });
    }

    LoadedPage {
        state: NavigationState {
            url: Some(url),
            params,
            branch,
            error,
            route,
        },
        props,
        status,
    }
}

/// Find the closest error page above position `failed`
///
/// Returns how much of `branch` to keep and the error page's branch node.
pub fn nearest_error_page(
    nodes: &NodeRegistry,
    failed: usize,
    branch: &[Option<Arc<BranchNode>>],
    errors: &[Option<usize>],
) -> Option<(usize, Arc<BranchNode>)> {
    let mut position = failed;
    while position > 0 {
        position -= 1;
        let Some(Some(error)) = errors.get(position) else {
            continue;
        };

        let mut keep = position;
        while keep > 0 && branch.get(keep).map_or(true, Option::is_none) {
            keep -= 1;
        }

        match nodes.resolve(*error) {
            Ok(node) => return Some((keep + 1, Arc::new(BranchNode::error_page(*error, node)))),
            Err(_) => continue,
        }
    }
    None
}

// ============================================================================
// Running a chain
// ============================================================================

/// Everything a load chain needs, detached from the controller
#[derive(Clone)]
pub struct LoadContext {
    pub nodes: Arc<NodeRegistry>,
    pub fetcher: Arc<Fetcher>,
    pub config: Arc<RouterConfig>,
    /// State of the last committed navigation
    pub current: Arc<NavigationState>,
    pub page: Option<Arc<PageSnapshot>>,
    pub invalidation: Invalidation,
    pub error_hook: Option<ErrorHook>,
    /// Whether the root layout has a server load
    pub root_server_load: bool,
    /// Keep the form value instead of clearing it
    pub invalidating: bool,
}

impl LoadContext {
    fn has_changed(
        &self,
        parent_changed: bool,
        changes: Changes,
        uses: Option<&DependencyUses>,
        params: &RouteParams,
    ) -> bool {
        if self.invalidation.all {
            return true;
        }
        let Some(uses) = uses else {
            return false;
        };

        (uses.parent && parent_changed)
            || (uses.route && changes.route)
            || (uses.url && changes.path)
            || (uses.search_params && changes.search)
            || uses
                .params
                .iter()
                .any(|name| params.get(name) != self.current.params.get(name))
            || uses
                .dependencies
                .iter()
                .any(|dependency| self.invalidation.matches(dependency))
    }

    /// Payload shown for an error, logging what is not an explicit HTTP error
    pub fn report(
        &self,
        error: &NavigationError,
        url: &Url,
        params: &RouteParams,
        route_id: Option<&str>,
    ) -> ErrorPayload {
        if !matches!(
            error,
            NavigationError::Http { .. } | NavigationError::NotFound { .. }
        ) {
            error_log!("Error loading {}: {}", url, error);
        }
        let context = ErrorContext {
            url: url.clone(),
            params: params.clone(),
            route_id: route_id.map(str::to_string),
        };
        error_payload(error, &context, self.error_hook.as_ref())
    }

    fn assemble(&self, result: BranchResult) -> LoadedPage {
        assemble(&self.current, self.page.as_deref(), result)
    }
}

/// Run the load chain of a resolved route
pub async fn run_chain(ctx: LoadContext, target: RouteTarget) -> LoadOutcome {
    let RouteTarget {
        route, params, url, ..
    } = target;

    let current = Arc::clone(&ctx.current);
    let loaders = route.chain();
    let changes = Changes::between(&current, &route, &url);

    // Which positions need fresh server data
    let mut invalid: Vec<bool> = Vec::with_capacity(loaders.len());
    for (position, loader) in loaders.iter().enumerate() {
        let previous = current.branch.get(position).and_then(Option::as_ref);
        let flag = loader.is_some_and(|loader| {
            loader.has_server_load
                && (previous.map_or(true, |previous| previous.index != loader.index)
                    || ctx.has_changed(
                        invalid.iter().any(|&flag| flag),
                        changes,
                        previous.and_then(|previous| previous.server.as_ref().map(|s| &s.uses)),
                        &params,
                    ))
        });
        invalid.push(flag);
    }

    let mut server_nodes: Vec<Option<ServerNode>> = Vec::new();
    let mut server_failure: Option<NavigationError> = None;
    if invalid.iter().any(|&flag| flag) {
        match load_server_data(&ctx.fetcher, &url, &invalid, &ctx.config.data_suffix).await {
            Ok(ServerDataResponse::Redirect { location }) => {
                return LoadOutcome::Redirect { location };
            }
            Ok(ServerDataResponse::Data(nodes)) => server_nodes = nodes,
            Err(error) => server_failure = Some(error),
        }
    }

    let mut parent_changed = false;
    let mut loads: Vec<Option<SharedLoad>> = Vec::with_capacity(loaders.len());
    for (position, loader) in loaders.iter().enumerate() {
        let Some(loader) = *loader else {
            loads.push(None);
            continue;
        };
        let previous = current.branch.get(position).cloned().flatten();
        let server_node = server_nodes.get(position).cloned().flatten();
        let failure = server_failure.as_ref().filter(|_| invalid[position]);

        if failure.is_none() && matches!(server_node, None | Some(ServerNode::Skip)) {
            if let Some(previous) = previous.as_ref().filter(|previous| {
                previous.index == loader.index
                    && !ctx.has_changed(
                        parent_changed,
                        changes,
                        previous.universal.as_ref().map(|u| &u.uses),
                        &params,
                    )
            }) {
                trace_log!("Reusing position {} of {}", position, route.id);
                loads.push(Some(future::ready(Ok(Arc::clone(previous))).boxed().shared()));
                continue;
            }
        }
        parent_changed = true;

        let load: BoxFuture<'static, PositionResult> = if let Some(error) = failure {
            future::ready(Err(LoadError::Error(error.clone()))).boxed()
        } else if let Some(ServerNode::Error { status, error }) = server_node {
            future::ready(Err(LoadError::Error(NavigationError::Http {
                status: status.unwrap_or(500),
                body: error,
            })))
            .boxed()
        } else {
            let server = match server_node {
                Some(ServerNode::Data(node)) => Some(node),
                Some(ServerNode::Skip) => previous.as_ref().and_then(|p| p.server.clone()),
                _ if loader.has_server_load => previous.as_ref().and_then(|p| p.server.clone()),
                _ => None,
            };
            match ctx.nodes.resolve(loader.index) {
                Ok(node) => {
                    let event = LoadEvent::new(
                        params.clone(),
                        url.clone(),
                        Some(route.id.clone()),
                        server.as_ref().and_then(|s| s.data.clone()),
                        Arc::clone(&ctx.fetcher),
                        loads.iter().flatten().cloned().collect(),
                    );
                    load_node(loader.index, node, event, server).boxed()
                }
                Err(error) => future::ready(Err(LoadError::Error(error))).boxed(),
            }
        };
        loads.push(Some(load.shared()));
    }

    // Every position runs to completion, even past a failure above it
    let results = future::join_all(loads.into_iter().map(|load| async move {
        match load {
            Some(load) => Some(load.await),
            None => None,
        }
    }))
    .await;

    let mut branch: Vec<Option<Arc<BranchNode>>> = Vec::with_capacity(results.len());
    for (position, result) in results.into_iter().enumerate() {
        match result {
            None => branch.push(None),
            Some(Ok(node)) => branch.push(Some(node)),
            Some(Err(LoadError::Redirect { location, .. })) => {
                debug_log!("Position {} of {} redirected to {}", position, route.id, location);
                return LoadOutcome::Redirect { location };
            }
            Some(Err(LoadError::Error(error))) => {
                let status = error.status();
                let payload = ctx.report(&error, &url, &params, Some(&route.id));

                let Some((keep, error_node)) =
                    nearest_error_page(&ctx.nodes, position, &branch, &route.errors)
                else {
                    return LoadOutcome::Reload { url };
                };
                branch.truncate(keep);
                branch.push(Some(error_node));

                return LoadOutcome::Loaded(Box::new(ctx.assemble(BranchResult {
                    url,
                    params,
                    branch,
                    status,
                    error: Some(payload),
                    route: Some(route),
                    form: FormUpdate::Clear,
                })));
            }
        }
    }

    let form = if ctx.invalidating {
        FormUpdate::Keep
    } else {
        FormUpdate::Clear
    };
    LoadOutcome::Loaded(Box::new(ctx.assemble(BranchResult {
        url,
        params,
        branch,
        status: 200,
        error: None,
        route: Some(route),
        form,
    })))
}

async fn load_node(
    index: usize,
    node: Arc<PageNode>,
    event: LoadEvent,
    server: Option<ServerDataNode>,
) -> PositionResult {
    let universal = match node.load() {
        Some(load) => {
            let data = load.load(event.clone()).await?;
            Some(UniversalData {
                data,
                uses: event.uses(),
            })
        }
        None => None,
    };

    let data = universal
        .as_ref()
        .and_then(|universal| universal.data.clone())
        .or_else(|| server.as_ref().and_then(|server| server.data.clone()))
        .unwrap_or_else(ValueGraph::object);

    Ok(Arc::new(BranchNode {
        index,
        node,
        server,
        universal,
        data,
    }))
}

/// Load the root layout plus the root error page
///
/// Used when nothing matched, when a redirect loops, and when hydration fails.
/// If the root layout's server data cannot be loaded the page is reloaded.
pub async fn load_root_error_page(
    ctx: LoadContext,
    url: Url,
    route_id: Option<String>,
    status: u16,
    error: ErrorPayload,
) -> LoadOutcome {
    let mut server = None;
    if ctx.root_server_load {
        match load_server_data(&ctx.fetcher, &url, &[true], &ctx.config.data_suffix).await {
            Ok(ServerDataResponse::Data(nodes)) => match nodes.into_iter().next().flatten() {
                Some(ServerNode::Data(node)) => server = Some(node),
                None => {}
                Some(_) => return LoadOutcome::Reload { url },
            },
            _ => return LoadOutcome::Reload { url },
        }
    }

    let (layout, error_page) = match (ctx.nodes.resolve(ROOT_LAYOUT), ctx.nodes.resolve(ROOT_ERROR))
    {
        (Ok(layout), Ok(error_page)) => (layout, error_page),
        _ => return LoadOutcome::Reload { url },
    };

    let event = LoadEvent::new(
        RouteParams::new(),
        url.clone(),
        route_id,
        server.as_ref().and_then(|s| s.data.clone()),
        Arc::clone(&ctx.fetcher),
        Vec::new(),
    );
    let root = match load_node(ROOT_LAYOUT, layout, event, server).await {
        Ok(root) => root,
        Err(_) => return LoadOutcome::Reload { url },
    };

    LoadOutcome::Loaded(Box::new(ctx.assemble(BranchResult {
        url,
        params: RouteParams::new(),
        branch: vec![
            Some(root),
            Some(Arc::new(BranchNode::error_page(ROOT_ERROR, error_page))),
        ],
        status,
        error: Some(error),
        route: None,
        form: FormUpdate::Clear,
    })))
}

/// Load a server-rendered page from the data embedded in the document
///
/// `node_ids` are the node table indices the server rendered, root first, and
/// `server_nodes` their server data at the same positions.
pub async fn load_hydration(
    ctx: &LoadContext,
    url: Url,
    node_ids: &[usize],
    server_nodes: Vec<Option<ServerNode>>,
    params: RouteParams,
    route_id: Option<String>,
) -> Result<Vec<Option<Arc<BranchNode>>>, LoadError> {
    let mut loads: Vec<SharedLoad> = Vec::with_capacity(node_ids.len());
    for (position, &index) in node_ids.iter().enumerate() {
        let server = match server_nodes.get(position).cloned().flatten() {
            Some(ServerNode::Data(node)) => Some(node),
            _ => None,
        };
        let load: BoxFuture<'static, PositionResult> = match ctx.nodes.resolve(index) {
            Ok(node) => {
                let event = LoadEvent::new(
                    params.clone(),
                    url.clone(),
                    route_id.clone(),
                    server.as_ref().and_then(|s| s.data.clone()),
                    Arc::clone(&ctx.fetcher),
                    loads.clone(),
                );
                load_node(index, node, event, server).boxed()
            }
            Err(error) => future::ready(Err(LoadError::Error(error))).boxed(),
        };
        loads.push(load.shared());
    }

    let results = future::join_all(loads).await;
    results
        .into_iter()
        .map(|result| result.map(Some))
        .collect()
}
