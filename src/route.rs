//! Route manifest, node registry and route resolution
//!
//! The build step hands the router a manifest: a table of page nodes (layouts,
//! leaves and error pages) addressed by small integers, plus an ordered list of
//! routes that reference those nodes. Node 0 is always the root layout and node
//! 1 the root error page.

use crate::config::{RouterConfig, TrailingSlash};
use crate::error::NavigationError;
use crate::loader::UniversalLoad;
use crate::matcher::{ParamMatchers, RoutePattern};
use crate::params::{decode_params, decode_pathname, RouteParams};
use crate::{debug_log, trace_log};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Index of the root layout in the node table
pub const ROOT_LAYOUT: usize = 0;

/// Index of the root error page in the node table
pub const ROOT_ERROR: usize = 1;

// ============================================================================
// Page nodes
// ============================================================================

/// What a node renders as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Layout,
    Leaf,
    Error,
}

/// A view component plus its optional universal load function
#[derive(Clone)]
pub struct PageNode {
    kind: NodeKind,
    component: String,
    load: Option<Arc<dyn UniversalLoad>>,
}

impl PageNode {
    /// A layout wrapping everything below it
    pub fn layout(component: impl Into<String>) -> Self {
        Self::new(NodeKind::Layout, component)
    }

    /// A page at the end of a route
    pub fn leaf(component: impl Into<String>) -> Self {
        Self::new(NodeKind::Leaf, component)
    }

    /// An error page
    pub fn error(component: impl Into<String>) -> Self {
        Self::new(NodeKind::Error, component)
    }

    fn new(kind: NodeKind, component: impl Into<String>) -> Self {
        Self {
            kind,
            component: component.into(),
            load: None,
        }
    }

    /// Attach a universal load function
    pub fn with_load(mut self, load: impl UniversalLoad + 'static) -> Self {
        self.load = Some(Arc::new(load));
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Name of the component the renderer should mount
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn load(&self) -> Option<&Arc<dyn UniversalLoad>> {
        self.load.as_ref()
    }
}

impl fmt::Debug for PageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageNode")
            .field("kind", &self.kind)
            .field("component", &self.component)
            .field("has_load", &self.load.is_some())
            .finish()
    }
}

/// Lazily builds a node the first time a route needs it
pub type NodeFactory = Arc<dyn Fn() -> PageNode + Send + Sync>;

/// Node table with memoized factories
///
/// Resolving the same index twice yields the same `Arc`, which is what the
/// loader compares to decide whether a position kept its load function.
pub struct NodeRegistry {
    factories: Vec<NodeFactory>,
    resolved: Mutex<Vec<Option<Arc<PageNode>>>>,
}

impl NodeRegistry {
    pub fn new(factories: Vec<NodeFactory>) -> Self {
        let resolved = vec![None; factories.len()];
        Self {
            factories,
            resolved: Mutex::new(resolved),
        }
    }

    /// Build (or fetch the memoized) node at `index`
    pub fn resolve(&self, index: usize) -> Result<Arc<PageNode>, NavigationError> {
        let factory = self
            .factories
            .get(index)
            .ok_or_else(|| NavigationError::load(format!("Unknown page node {}", index)))?;

        if let Some(node) = self.resolved.lock().get(index).cloned().flatten() {
            return Ok(node);
        }

        trace_log!("Resolving page node {}", index);
        let node = Arc::new(factory());
        let mut resolved = self.resolved.lock();
        Ok(resolved[index].get_or_insert(node).clone())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.factories.len())
            .finish()
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// Reference from a route to a node that may have a server load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub index: usize,
    pub has_server_load: bool,
}

/// One route as the build step describes it
///
/// Layout and error lists exclude the root layout and root error page, which
/// every route gets implicitly. `None` entries inherit from the ancestor.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pattern: String,
    leaf: usize,
    leaf_server_load: bool,
    layouts: Vec<Option<usize>>,
    errors: Vec<Option<usize>>,
}

impl RouteEntry {
    /// Route `pattern` rendering node `leaf`
    pub fn new(pattern: impl Into<String>, leaf: usize) -> Self {
        Self {
            pattern: pattern.into(),
            leaf,
            leaf_server_load: false,
            layouts: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// The leaf has a server load
    pub fn server_load(mut self) -> Self {
        self.leaf_server_load = true;
        self
    }

    /// Nested layouts below the root, outermost first
    pub fn layouts(mut self, layouts: impl IntoIterator<Item = Option<usize>>) -> Self {
        self.layouts = layouts.into_iter().collect();
        self
    }

    /// Error pages below the root, outermost first
    pub fn errors(mut self, errors: impl IntoIterator<Item = Option<usize>>) -> Self {
        self.errors = errors.into_iter().collect();
        self
    }
}

/// Everything the router is built from
///
/// ```
/// use page_navigator::{PageNode, RouteEntry, RouteManifest};
///
/// let manifest = RouteManifest::new()
///     .node(|| PageNode::layout("root"))
///     .node(|| PageNode::error("error"))
///     .node(|| PageNode::leaf("docs"))
///     .route(RouteEntry::new("[version]/[...documentId].html", 2).server_load());
///
/// assert_eq!(manifest.node_count(), 3);
/// ```
#[derive(Default)]
pub struct RouteManifest {
    nodes: Vec<NodeFactory>,
    server_layouts: HashSet<usize>,
    routes: Vec<RouteEntry>,
    matchers: ParamMatchers,
}

impl RouteManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node factory; its index is the number of nodes added before it
    pub fn node<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> PageNode + Send + Sync + 'static,
    {
        self.nodes.push(Arc::new(factory));
        self
    }

    /// Mark a layout node as having a server load
    pub fn server_layout(mut self, index: usize) -> Self {
        self.server_layouts.insert(index);
        self
    }

    /// Append a route; earlier routes win
    pub fn route(mut self, entry: RouteEntry) -> Self {
        self.routes.push(entry);
        self
    }

    /// Register a param matcher
    pub fn matcher<F>(mut self, name: impl Into<String>, matcher: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.matchers.register(name, matcher);
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

// ============================================================================
// Compiled routes
// ============================================================================

/// A route ready for matching
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    /// The pattern string, unique per route
    pub id: String,
    pub pattern: RoutePattern,
    /// Layout chain from the root, padded to `errors.len()`
    pub layouts: Vec<Option<NodeRef>>,
    /// Error chain from the root, padded to `layouts.len()`
    pub errors: Vec<Option<usize>>,
    pub leaf: NodeRef,
}

impl CompiledRoute {
    fn compile(entry: &RouteEntry, server_layouts: &HashSet<usize>) -> Result<Self, NavigationError> {
        let mut layouts: Vec<Option<NodeRef>> = std::iter::once(Some(ROOT_LAYOUT))
            .chain(entry.layouts.iter().copied())
            .map(|index| {
                index.map(|index| NodeRef {
                    index,
                    has_server_load: server_layouts.contains(&index),
                })
            })
            .collect();
        let mut errors: Vec<Option<usize>> = std::iter::once(Some(ROOT_ERROR))
            .chain(entry.errors.iter().copied())
            .collect();

        layouts.resize(layouts.len().max(errors.len()), None);
        errors.resize(layouts.len(), None);

        Ok(Self {
            id: entry.pattern.clone(),
            pattern: RoutePattern::compile(&entry.pattern)?,
            layouts,
            errors,
            leaf: NodeRef {
                index: entry.leaf,
                has_server_load: entry.leaf_server_load,
            },
        })
    }

    /// Layouts followed by the leaf, the positions of a load chain
    pub fn chain(&self) -> Vec<Option<NodeRef>> {
        self.layouts
            .iter()
            .copied()
            .chain(std::iter::once(Some(self.leaf)))
            .collect()
    }
}

/// A URL resolved to a route
#[derive(Debug, Clone)]
pub struct RouteTarget {
    /// Normalized pathname plus search, used to recognize preloads
    pub id: String,
    pub route: Arc<CompiledRoute>,
    pub params: RouteParams,
    /// The URL with the trailing slash policy applied
    pub url: Url,
}

/// All routes of the app, in registration order
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
    nodes: Arc<NodeRegistry>,
    matchers: ParamMatchers,
    root_server_load: bool,
    base: String,
    trailing_slash: TrailingSlash,
}

impl RouteTable {
    /// Compile every route of a manifest
    pub fn new(manifest: RouteManifest, config: &RouterConfig) -> Result<Self, NavigationError> {
        let routes = manifest
            .routes
            .iter()
            .map(|entry| CompiledRoute::compile(entry, &manifest.server_layouts).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        debug_log!(
            "Compiled {} routes over {} page nodes",
            routes.len(),
            manifest.nodes.len()
        );

        Ok(Self {
            routes,
            nodes: Arc::new(NodeRegistry::new(manifest.nodes)),
            matchers: manifest.matchers,
            root_server_load: manifest.server_layouts.contains(&ROOT_LAYOUT),
            base: config.base.trim_end_matches('/').to_string(),
            trailing_slash: config.trailing_slash,
        })
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    /// Whether the root layout has a server load
    pub fn root_server_load(&self) -> bool {
        self.root_server_load
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    /// Look a route up by id
    pub fn get(&self, id: &str) -> Option<&Arc<CompiledRoute>> {
        self.routes.iter().find(|route| route.id == id)
    }

    /// Whether `url` lives outside the app mounted at `app` (another origin, or
    /// outside the base path)
    pub fn is_external(&self, url: &Url, app: &Url) -> bool {
        url.origin() != app.origin() || !url.path().starts_with(&self.base)
    }

    /// The base-relative, decoded path the patterns are matched against
    fn app_path(&self, url: &Url) -> String {
        let relative = url.path().strip_prefix(&self.base).unwrap_or(url.path());
        if relative.is_empty() {
            "/".to_string()
        } else {
            decode_pathname(relative)
        }
    }

    /// Resolve a URL of this app to the first matching route
    ///
    /// `Ok(None)` means no route matched.
    pub fn resolve(&self, url: &Url) -> Result<Option<RouteTarget>, NavigationError> {
        let path = self.app_path(url);

        for route in &self.routes {
            let Some(params) = route.pattern.matches(&path, &self.matchers)? else {
                continue;
            };

            let mut normalized = url.clone();
            normalized.set_path(&self.trailing_slash.normalize(url.path()));
            let id = format!("{}{}", normalized.path(), search(&normalized));

            trace_log!("Resolved {} to route {:?}", url, route.id);
            return Ok(Some(RouteTarget {
                id,
                route: Arc::clone(route),
                params: decode_params(params),
                url: normalized,
            }));
        }

        trace_log!("No route matches {}", url);
        Ok(None)
    }

    /// Resolve the node factories of every route matching one of `paths`, or of
    /// all routes when `paths` is empty
    pub fn preload_code(&self, paths: &[&str]) -> Result<usize, NavigationError> {
        let mut resolved = 0;
        for route in &self.routes {
            let wanted = paths.is_empty()
                || paths.iter().try_fold(false, |found, path| {
                    if found {
                        return Ok(true);
                    }
                    Ok::<_, NavigationError>(
                        route.pattern.matches(path, &self.matchers)?.is_some(),
                    )
                })?;
            if !wanted {
                continue;
            }

            for node in route.chain().into_iter().flatten() {
                self.nodes.resolve(node.index)?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.iter().map(|r| &r.id).collect::<Vec<_>>())
            .field("base", &self.base)
            .finish()
    }
}

/// `url.search`: `?query` or empty
pub(crate) fn search(url: &Url) -> String {
    url.query().map(|q| format!("?{}", q)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table(manifest: RouteManifest) -> RouteTable {
        RouteTable::new(manifest, &RouterConfig::default()).unwrap()
    }

    fn base_manifest() -> RouteManifest {
        RouteManifest::new()
            .node(|| PageNode::layout("root"))
            .node(|| PageNode::error("root_error"))
    }

    fn url(path: &str) -> Url {
        Url::parse("https://example.com").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_chains_are_padded() {
        let routes = table(
            base_manifest()
                .node(|| PageNode::layout("docs"))
                .node(|| PageNode::leaf("page"))
                .server_layout(0)
                .route(RouteEntry::new("docs/[slug]", 3).layouts([Some(2)])),
        );
        let route = &routes.routes()[0];

        assert_eq!(route.layouts.len(), 2);
        assert_eq!(route.errors, vec![Some(ROOT_ERROR), None]);
        assert!(route.layouts[0].unwrap().has_server_load);
        assert!(!route.layouts[1].unwrap().has_server_load);
        assert_eq!(route.chain().len(), 3);
    }

    #[test]
    fn test_error_chain_longer_than_layouts() {
        let routes = table(
            base_manifest()
                .node(|| PageNode::error("inner_error"))
                .node(|| PageNode::leaf("page"))
                .route(RouteEntry::new("a", 3).errors([Some(2)])),
        );
        let route = &routes.routes()[0];
        assert_eq!(route.layouts, vec![
            Some(NodeRef { index: 0, has_server_load: false }),
            None
        ]);
        assert_eq!(route.errors, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_first_registered_route_wins() {
        let routes = table(
            base_manifest()
                .node(|| PageNode::leaf("about"))
                .node(|| PageNode::leaf("slug"))
                .route(RouteEntry::new("about", 2))
                .route(RouteEntry::new("[slug]", 3)),
        );

        let target = routes.resolve(&url("/about")).unwrap().unwrap();
        assert_eq!(target.route.id, "about");

        let target = routes.resolve(&url("/contact")).unwrap().unwrap();
        assert_eq!(target.route.id, "[slug]");
        assert_eq!(target.params.get("slug"), Some("contact"));
    }

    #[test]
    fn test_resolve_decodes_params_and_normalizes() {
        let routes = table(
            base_manifest()
                .node(|| PageNode::leaf("page"))
                .route(RouteEntry::new("files/[name]", 2)),
        );

        let target = routes
            .resolve(&url("/files/a%2Fb%20c/?x=1"))
            .unwrap()
            .unwrap();
        assert_eq!(target.params.get("name"), Some("a/b c"));
        assert_eq!(target.url.path(), "/files/a%2Fb%20c");
        assert_eq!(target.id, "/files/a%2Fb%20c?x=1");
    }

    #[test]
    fn test_resolve_respects_base() {
        let config = RouterConfig::default().with_base("/app");
        let routes = RouteTable::new(
            base_manifest()
                .node(|| PageNode::leaf("home"))
                .route(RouteEntry::new("", 2)),
            &config,
        )
        .unwrap();

        let app = url("/app");
        assert!(!routes.is_external(&url("/app/"), &app));
        assert!(routes.is_external(&url("/elsewhere"), &app));
        assert!(routes.is_external(
            &Url::parse("https://other.com/app").unwrap(),
            &app
        ));
        assert!(routes.resolve(&url("/app")).unwrap().is_some());
    }

    #[test]
    fn test_missing_matcher_fails_at_match_time() {
        let routes = table(
            base_manifest()
                .node(|| PageNode::leaf("page"))
                .route(RouteEntry::new("[id=integer]", 2)),
        );

        let error = routes.resolve(&url("/42")).unwrap_err();
        assert_eq!(
            error,
            NavigationError::MissingMatcher {
                name: "integer".to_string()
            }
        );
    }

    #[test]
    fn test_registered_matcher_filters() {
        let routes = table(
            base_manifest()
                .node(|| PageNode::leaf("page"))
                .route(RouteEntry::new("[id=integer]", 2))
                .matcher("integer", |value| value.parse::<u64>().is_ok()),
        );

        assert!(routes.resolve(&url("/42")).unwrap().is_some());
        assert!(routes.resolve(&url("/abc")).unwrap().is_none());
    }

    #[test]
    fn test_nodes_are_memoized() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let routes = table(
            base_manifest()
                .node(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    PageNode::leaf("page")
                })
                .route(RouteEntry::new("", 2)),
        );

        let first = routes.nodes().resolve(2).unwrap();
        let second = routes.nodes().resolve(2).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(routes.nodes().resolve(9).is_err());
    }

    #[test]
    fn test_preload_code_only_touches_matching_routes() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let routes = table(
            base_manifest()
                .node(|| PageNode::leaf("a"))
                .node(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    PageNode::leaf("b")
                })
                .route(RouteEntry::new("a", 2))
                .route(RouteEntry::new("b", 3)),
        );

        routes.preload_code(&["/a"]).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 0);

        routes.preload_code(&[]).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }
}
