//! Integration tests for page_navigator
//!
//! These drive the controller end to end against in-memory hosts: matching,
//! load chains, server data, redirects, error pages, history, scroll and
//! hydration.

use async_trait::async_trait;
use page_navigator::*;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

// ============================================================================
// Test host
// ============================================================================

#[derive(Default)]
struct ScriptedTransport {
    responses: Mutex<HashMap<String, Response>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
    fn respond(&self, url: &str, response: Response) {
        self.responses.lock().insert(url.to_string(), response);
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: Request) -> Result<Response, NavigationError> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .get(request.url.as_str())
            .cloned()
            .ok_or_else(|| NavigationError::Network {
                url: request.url.to_string(),
                message: "connection refused".to_string(),
            })
    }
}

#[derive(Default)]
struct Views {
    mounts: Mutex<Vec<bool>>,
    updates: AtomicUsize,
    announcements: Mutex<Vec<String>>,
}

impl Renderer for Views {
    fn mount(&self, _props: &RenderProps, hydrate: bool, _scroll: &ScrollControl) {
        self.mounts.lock().push(hydrate);
    }

    fn update(&self, _props: &RenderProps, _scroll: &ScrollControl) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn announce(&self, message: &str) {
        self.announcements.lock().push(message.to_string());
    }
}

struct Embedded(HashMap<String, EmbeddedResponse>);

impl EmbeddedPayloads for Embedded {
    fn find(&self, url: &str, _body_hash: Option<&str>) -> Option<EmbeddedResponse> {
        self.0.get(url).cloned()
    }
}

struct Harness {
    router: NavigationController,
    window: Arc<MemoryWindow>,
    storage: Arc<MemoryStorage>,
    transport: Arc<ScriptedTransport>,
    views: Arc<Views>,
}

fn harness(manifest: RouteManifest) -> Harness {
    harness_at(manifest, "https://example.com/", None)
}

fn harness_at(
    manifest: RouteManifest,
    location: &str,
    embedded: Option<Arc<dyn EmbeddedPayloads>>,
) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let window = Arc::new(MemoryWindow::new(Url::parse(location).unwrap()));
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(ScriptedTransport::default());
    let views = Arc::new(Views::default());
    let host = RouterHost {
        window: window.clone(),
        storage: storage.clone(),
        transport: transport.clone(),
        renderer: views.clone(),
        clock: Arc::new(ManualClock::new(1_000)),
        embedded,
    };

    Harness {
        router: NavigationController::new(manifest, RouterConfig::default(), host).unwrap(),
        window,
        storage,
        transport,
        views,
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn runs(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Manifest with a root layout, root error page and a `docs/[slug]` leaf
/// counting its runs
fn docs_manifest(leaf_runs: Arc<AtomicUsize>) -> RouteManifest {
    RouteManifest::new()
        .node(|| PageNode::layout("root"))
        .node(|| PageNode::error("error"))
        .node(|| PageNode::leaf("home"))
        .node(move || {
            let runs = Arc::clone(&leaf_runs);
            PageNode::leaf("doc").with_load(load_fn(move |event| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let slug = event.param("slug").unwrap_or_default();
                    Ok(Some(ValueGraph::from_json(json!({ "slug": slug }))))
                }
            }))
        })
        .route(RouteEntry::new("", 2))
        .route(RouteEntry::new("docs/[slug]", 3))
}

fn page_str(router: &NavigationController, key: &str) -> Option<String> {
    router
        .page()?
        .data
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ============================================================================
// Supersession
// ============================================================================

#[tokio::test]
async fn test_later_intent_wins() {
    let mut h = harness(docs_manifest(counter()));
    let url = |path: &str| Url::parse("https://example.com").unwrap().join(path).unwrap();

    let a = h.router.begin(NavigationIntent::goto(url("/docs/a"))).unwrap();
    let b = h.router.begin(NavigationIntent::goto(url("/docs/b"))).unwrap();
    assert!(h.router.phase().is_busy());

    let outcome = b.outcome().await;
    assert!(h.router.finish(b, outcome).is_committed());

    let outcome = a.outcome().await;
    assert!(matches!(
        h.router.finish(a, outcome),
        NavigationResult::Superseded
    ));

    assert_eq!(page_str(&h.router, "slug").as_deref(), Some("b"));
    assert_eq!(h.window.location().path(), "/docs/b");
    assert_eq!(h.window.history_len(), 2);
    assert_eq!(h.router.phase(), NavigationPhase::Idle);
    assert_eq!(h.router.outcome(), Some(Settled::Ok));
}

#[tokio::test]
async fn test_superseded_result_arriving_first_is_dropped() {
    let mut h = harness(docs_manifest(counter()));
    let url = |path: &str| Url::parse("https://example.com").unwrap().join(path).unwrap();

    let a = h.router.begin(NavigationIntent::goto(url("/docs/a"))).unwrap();
    let b = h.router.begin(NavigationIntent::goto(url("/docs/b"))).unwrap();

    let outcome = a.outcome().await;
    assert!(matches!(
        h.router.finish(a, outcome),
        NavigationResult::Superseded
    ));
    assert!(h.router.page().is_none());

    let outcome = b.outcome().await;
    assert!(h.router.finish(b, outcome).is_committed());
    assert_eq!(page_str(&h.router, "slug").as_deref(), Some("b"));
}

// ============================================================================
// Invalidation and dependencies
// ============================================================================

#[tokio::test]
async fn test_invalidate_all_is_idempotent() {
    let leaf_runs = counter();
    let mut h = harness(docs_manifest(Arc::clone(&leaf_runs)));
    h.router.goto("/docs/a", GotoOptions::default()).await.unwrap();
    let history = h.window.history_len();

    assert!(h.router.invalidate_all().await.is_committed());
    let once = h.router.page().unwrap();
    assert!(h.router.invalidate_all().await.is_committed());
    let twice = h.router.page().unwrap();

    assert_eq!(runs(&leaf_runs), 3);
    assert_eq!(once.data, twice.data);
    assert_eq!(once.url, twice.url);
    assert_eq!(h.window.history_len(), history);
}

#[tokio::test]
async fn test_invalidate_reruns_fetch_dependents() {
    let leaf_runs = counter();
    let runs_in_load = Arc::clone(&leaf_runs);
    let manifest = RouteManifest::new()
        .node(|| PageNode::layout("root"))
        .node(|| PageNode::error("error"))
        .node(move || {
            let runs = Arc::clone(&runs_in_load);
            PageNode::leaf("feed").with_load(load_fn(move |event| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    event.depends("/api/feed")?;
                    Ok(None)
                }
            }))
        })
        .route(RouteEntry::new("feed", 2));
    let mut h = harness(manifest);
    h.router.goto("/feed", GotoOptions::default()).await.unwrap();

    h.router.invalidate("/api/other").await.unwrap();
    assert_eq!(runs(&leaf_runs), 1);

    h.router.invalidate("/api/feed").await.unwrap();
    assert_eq!(runs(&leaf_runs), 2);
}

/// `[version]` layout plus one leaf that awaits `parent()` and one that does not
fn versioned_manifest(
    layout_runs: Arc<AtomicUsize>,
    with_parent: Arc<AtomicUsize>,
    without_parent: Arc<AtomicUsize>,
) -> RouteManifest {
    RouteManifest::new()
        .node(|| PageNode::layout("root"))
        .node(|| PageNode::error("error"))
        .node(move || {
            let runs = Arc::clone(&layout_runs);
            PageNode::layout("version").with_load(load_fn(move |event| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let version = event.param("version").unwrap_or_default();
                    Ok(Some(ValueGraph::from_json(json!({ "version": version }))))
                }
            }))
        })
        .node(move || {
            let runs = Arc::clone(&with_parent);
            PageNode::leaf("guide").with_load(load_fn(move |event| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let parent = event.parent().await?;
                    let version = parent.get("version").and_then(Value::as_str).unwrap_or_default().to_string();
                    Ok(Some(ValueGraph::from_json(json!({ "title": format!("Guide {}", version) }))))
                }
            }))
        })
        .node(move || {
            let runs = Arc::clone(&without_parent);
            PageNode::leaf("changelog").with_load(load_fn(move |_| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(ValueGraph::from_json(json!({ "title": "Changelog" }))))
                }
            }))
        })
        .route(RouteEntry::new("[version]/guide", 3).layouts([Some(2)]))
        .route(RouteEntry::new("[version]/changelog", 4).layouts([Some(2)]))
}

#[tokio::test]
async fn test_parent_dependency_reruns_with_ancestor() {
    let (layout, guide, changelog) = (counter(), counter(), counter());
    let mut h = harness(versioned_manifest(
        Arc::clone(&layout),
        Arc::clone(&guide),
        Arc::clone(&changelog),
    ));

    h.router.goto("/v1/guide", GotoOptions::default()).await.unwrap();
    h.router.goto("/v2/guide", GotoOptions::default()).await.unwrap();
    assert_eq!(runs(&layout), 2);
    assert_eq!(runs(&guide), 2);
    assert_eq!(page_str(&h.router, "title").as_deref(), Some("Guide v2"));

    h.router.goto("/v2/changelog", GotoOptions::default()).await.unwrap();
    h.router.goto("/v3/changelog", GotoOptions::default()).await.unwrap();
    assert_eq!(runs(&layout), 3);
    assert_eq!(runs(&changelog), 1);
    assert_eq!(page_str(&h.router, "version").as_deref(), Some("v3"));
}

#[tokio::test]
async fn test_search_only_change_skips_path_readers() {
    let (path_reader, search_reader) = (counter(), counter());
    let (layout_runs, leaf_runs) = (Arc::clone(&path_reader), Arc::clone(&search_reader));
    let manifest = RouteManifest::new()
        .node(move || {
            let runs = Arc::clone(&layout_runs);
            PageNode::layout("root").with_load(load_fn(move |event| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let path = event.url().pathname();
                    Ok(Some(ValueGraph::from_json(json!({ "path": path }))))
                }
            }))
        })
        .node(|| PageNode::error("error"))
        .node(move || {
            let runs = Arc::clone(&leaf_runs);
            PageNode::leaf("search").with_load(load_fn(move |event| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let query = event.url().search_params().get("q").unwrap_or_default().to_string();
                    Ok(Some(ValueGraph::from_json(json!({ "query": query }))))
                }
            }))
        })
        .route(RouteEntry::new("search", 2));
    let mut h = harness(manifest);

    h.router.goto("/search?q=rust", GotoOptions::default()).await.unwrap();
    h.router.goto("/search?q=wasm", GotoOptions::default()).await.unwrap();

    assert_eq!(runs(&path_reader), 1);
    assert_eq!(runs(&search_reader), 2);
    assert_eq!(page_str(&h.router, "query").as_deref(), Some("wasm"));
    assert_eq!(page_str(&h.router, "path").as_deref(), Some("/search"));
}

// ============================================================================
// Server data
// ============================================================================

fn server_manifest() -> RouteManifest {
    RouteManifest::new()
        .node(|| PageNode::layout("root"))
        .node(|| PageNode::error("error"))
        .node(|| PageNode::leaf("profile"))
        .route(RouteEntry::new("profile", 2).server_load())
}

fn wire(value: serde_json::Value) -> String {
    encode(&ValueGraph::from_json(value))
}

#[tokio::test]
async fn test_server_data_is_fetched_in_one_request() {
    let mut h = harness(server_manifest());
    h.transport.respond(
        "https://example.com/profile/__data.json",
        Response::new(
            200,
            wire(json!({
                "type": "data",
                "nodes": [null, {"type": "data", "data": {"name": "ann"}, "uses": {}}]
            })),
        ),
    );

    let result = h.router.goto("/profile", GotoOptions::default()).await.unwrap();
    assert!(result.is_committed());
    assert_eq!(page_str(&h.router, "name").as_deref(), Some("ann"));

    let requests = h.transport.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0]
        .headers
        .contains(&("x-sveltekit-invalidated".to_string(), ",1".to_string())));
}

#[tokio::test]
async fn test_server_error_node_renders_error_page() {
    let mut h = harness(server_manifest());
    h.transport.respond(
        "https://example.com/profile/__data.json",
        Response::new(
            200,
            wire(json!({
                "type": "data",
                "nodes": [null, {"type": "error", "status": 403, "error": {"message": "nope"}}]
            })),
        ),
    );

    let result = h.router.goto("/profile", GotoOptions::default()).await.unwrap();
    assert!(matches!(result, NavigationResult::Committed { status: 403 }));
    assert_eq!(h.router.page().unwrap().error.as_ref().unwrap().message, "nope");
}

#[tokio::test]
async fn test_network_failure_keeps_resolved_positions() {
    let mut h = harness(server_manifest());

    let result = h.router.goto("/profile", GotoOptions::default()).await.unwrap();
    assert!(matches!(result, NavigationResult::Committed { status: 500 }));

    let state = h.router.state();
    let components: Vec<_> = state
        .branch
        .iter()
        .flatten()
        .map(|node| node.node.component().to_string())
        .collect();
    assert_eq!(components, vec!["root", "error"]);
    assert_eq!(state.error.as_ref().unwrap().message, "Internal Error");
}

#[tokio::test]
async fn test_server_redirect_is_followed() {
    let mut h = harness(
        server_manifest()
            .node(|| PageNode::leaf("login"))
            .route(RouteEntry::new("login", 3)),
    );
    h.transport.respond(
        "https://example.com/profile/__data.json",
        Response::new(200, wire(json!({"type": "redirect", "location": "/login"}))),
    );

    let result = h.router.goto("/profile", GotoOptions::default()).await.unwrap();
    assert!(result.is_committed());
    assert_eq!(h.window.location().path(), "/login");
    assert_eq!(h.router.state().route_id(), Some("login"));
}

// ============================================================================
// Redirects and errors
// ============================================================================

#[tokio::test]
async fn test_redirect_loop_is_detected_on_revisit() {
    let (a_runs, b_runs) = (counter(), counter());
    let (a, b) = (Arc::clone(&a_runs), Arc::clone(&b_runs));
    let manifest = RouteManifest::new()
        .node(|| PageNode::layout("root"))
        .node(|| PageNode::error("error"))
        .node(move || {
            let runs = Arc::clone(&a);
            PageNode::leaf("a").with_load(load_fn(move |_| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err(LoadError::redirect("/b"))
                }
            }))
        })
        .node(move || {
            let runs = Arc::clone(&b);
            PageNode::leaf("b").with_load(load_fn(move |_| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err(LoadError::redirect("/a"))
                }
            }))
        })
        .route(RouteEntry::new("a", 2))
        .route(RouteEntry::new("b", 3));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::clone(&seen);
    let mut h = harness(manifest);
    h.router = h.router.with_error_hook(move |error, context| {
        errors.lock().push((error.clone(), context.route_id.clone()));
        Some(ErrorPayload::new(error.to_string()))
    });

    let result = h.router.goto("/a", GotoOptions::default()).await.unwrap();

    assert!(matches!(result, NavigationResult::Committed { status: 500 }));
    assert_eq!(runs(&a_runs), 1);
    assert_eq!(runs(&b_runs), 1);
    let seen = seen.lock();
    assert!(matches!(seen[0].0, NavigationError::RedirectLoop { .. }));
    assert_eq!(seen[0].1.as_deref(), Some("a"));
    let page = h.router.page().unwrap();
    assert!(page
        .error
        .as_ref()
        .unwrap()
        .message
        .starts_with("Redirect loop"));
}

#[tokio::test]
async fn test_unmatched_path_is_not_found() {
    let mut h = harness(docs_manifest(counter()));
    let result = h.router.goto("/missing/page", GotoOptions::default()).await.unwrap();

    assert!(matches!(result, NavigationResult::Committed { status: 404 }));
    let page = h.router.page().unwrap();
    assert_eq!(page.status, 404);
    assert_eq!(page.error.as_ref().unwrap().message, "Not Found");
    assert_eq!(page.route_id, None);
}

#[tokio::test]
async fn test_failure_without_boundary_reloads() {
    let manifest = RouteManifest::new()
        .node(|| {
            PageNode::layout("root").with_load(load_fn(|_| async {
                Err(LoadError::Error(NavigationError::load("layout exploded")))
            }))
        })
        .node(|| PageNode::error("error"))
        .node(|| PageNode::leaf("page"))
        .route(RouteEntry::new("page", 2));
    let mut h = harness(manifest);

    let result = h.router.goto("/page", GotoOptions::default()).await.unwrap();

    assert!(matches!(result, NavigationResult::Reloaded(_)));
    assert_eq!(h.window.reloads()[0].path(), "/page");
    assert_eq!(h.router.phase(), NavigationPhase::Idle);
    assert_eq!(h.router.outcome(), Some(Settled::Error));
    assert!(h.views.mounts.lock().is_empty());
}

// ============================================================================
// History and scroll
// ============================================================================

#[tokio::test]
async fn test_scroll_is_restored_on_back() {
    let mut h = harness(docs_manifest(counter()));
    h.router.start(None).await;
    assert_eq!(h.router.history_index(), 1_000);

    h.router.goto("/docs/a", GotoOptions::default()).await.unwrap();
    assert_eq!(h.router.history_index(), 1_001);
    h.window.set_scroll(ScrollPosition::new(0.0, 300.0));

    h.router.goto("/docs/b", GotoOptions::default()).await.unwrap();
    assert_eq!(h.router.history_index(), 1_002);
    assert_eq!(h.window.scroll_position(), ScrollPosition::top());

    h.window.go(-1);
    let state = h.window.history_state();
    let result = h.router.popstate(state.as_ref()).await.unwrap();

    assert!(result.is_committed());
    assert_eq!(h.router.history_index(), 1_001);
    assert_eq!(h.window.scroll_position(), ScrollPosition::new(0.0, 300.0));
    assert_eq!(page_str(&h.router, "slug").as_deref(), Some("a"));
}

#[tokio::test]
async fn test_fragment_and_noscroll() {
    let mut h = harness(docs_manifest(counter()));
    h.window.add_fragment("install");

    h.router.goto("/docs/setup#install", GotoOptions::default()).await.unwrap();
    assert_eq!(h.window.scroll_position().y, 500.0);
    assert_eq!(h.window.location().fragment(), Some("install"));

    h.window.set_scroll(ScrollPosition::new(0.0, 42.0));
    let options = GotoOptions {
        noscroll: true,
        keepfocus: true,
        ..GotoOptions::default()
    };
    h.router.goto("/docs/other", options).await.unwrap();
    assert_eq!(h.window.scroll_position().y, 42.0);
    assert_eq!(h.window.focus_resets(), 1);
}

#[tokio::test]
async fn test_replace_keeps_history_index() {
    let mut h = harness(docs_manifest(counter()));
    h.router.goto("/docs/a", GotoOptions::default()).await.unwrap();
    let options = GotoOptions {
        replace_state: true,
        ..GotoOptions::default()
    };
    h.router.goto("/docs/b", options).await.unwrap();

    assert_eq!(h.router.history_index(), 1_001);
    assert_eq!(h.window.history_len(), 2);
    assert_eq!(
        h.window.history_state(),
        Some(json!({ "sveltekit:index": 1_001 }))
    );
}

#[tokio::test]
async fn test_scroll_memory_survives_reload() {
    let mut h = harness(docs_manifest(counter()));
    h.router.goto("/docs/a", GotoOptions::default()).await.unwrap();
    h.window.set_scroll(ScrollPosition::new(5.0, 640.0));
    h.router.on_visibility_hidden();
    assert!(h.storage.get("sveltekit:scroll").is_some());

    // Same tab, same history entry, new document
    h.window.set_scroll(ScrollPosition::top());
    let host = RouterHost {
        window: h.window.clone(),
        storage: h.storage.clone(),
        transport: h.transport.clone(),
        renderer: h.views.clone(),
        clock: Arc::new(ManualClock::new(9_999)),
        embedded: None,
    };
    let reloaded =
        NavigationController::new(docs_manifest(counter()), RouterConfig::default(), host).unwrap();

    assert_eq!(reloaded.history_index(), 1_001);
    assert_eq!(h.window.scroll_position(), ScrollPosition::new(5.0, 640.0));
    assert!(h.window.manual_scroll_restoration());
}

// ============================================================================
// Observers
// ============================================================================

#[tokio::test]
async fn test_before_navigate_can_cancel_links() {
    let mut h = harness(docs_manifest(counter()));
    h.router.goto("/docs/a", GotoOptions::default()).await.unwrap();

    let handle = h.router.before_navigate(|navigation| {
        let secret = navigation
            .to
            .as_ref()
            .is_some_and(|to| to.url.path() == "/docs/secret");
        if secret && navigation.kind == NavigationType::Link {
            navigation.cancel();
        }
    });

    let result = h.router.click_link(&LinkClick::new("/docs/secret")).await;
    assert!(matches!(result, ClickResult::Navigated(NavigationResult::Blocked)));
    assert_eq!(h.window.location().path(), "/docs/a");
    assert_eq!(h.window.history_len(), 2);

    handle.unsubscribe();
    let result = h.router.click_link(&LinkClick::new("/docs/secret")).await;
    assert!(matches!(
        result,
        ClickResult::Navigated(NavigationResult::Committed { status: 200 })
    ));
}

#[tokio::test]
async fn test_after_navigate_sees_both_ends() {
    let mut h = harness(docs_manifest(counter()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    h.router.after_navigate(move |navigation| {
        log.lock().push((
            navigation.kind,
            navigation.from.as_ref().map(|from| from.url.path().to_string()),
            navigation.to.as_ref().and_then(|to| to.route_id.clone()),
        ));
    });

    h.router.goto("/", GotoOptions::default()).await.unwrap();
    h.router.click_link(&LinkClick::new("/docs/a")).await;
    h.router.invalidate_all().await;

    assert_eq!(
        *seen.lock(),
        vec![
            (NavigationType::Goto, None, Some(String::new())),
            (
                NavigationType::Link,
                Some("/".to_string()),
                Some("docs/[slug]".to_string())
            ),
        ]
    );
    assert_eq!(*h.views.announcements.lock(), vec!["Navigated"]);
}

#[tokio::test]
async fn test_unload_can_be_blocked() {
    let h = harness(docs_manifest(counter()));
    assert!(h.router.before_unload());
    assert!(!h.window.manual_scroll_restoration());

    h.router.before_navigate(|navigation| {
        if navigation.kind == NavigationType::Unload && navigation.to.is_none() {
            navigation.cancel();
        }
    });
    assert!(!h.router.before_unload());
}

// ============================================================================
// Preloading and hydration
// ============================================================================

#[tokio::test]
async fn test_preloaded_data_is_reused() {
    let leaf_runs = counter();
    let mut h = harness(docs_manifest(Arc::clone(&leaf_runs)));

    let preload = h.router.preload_data("/docs/fast").unwrap();
    assert!(matches!(preload.await, LoadOutcome::Loaded(_)));
    assert_eq!(runs(&leaf_runs), 1);

    h.router.goto("/docs/fast", GotoOptions::default()).await.unwrap();
    assert_eq!(runs(&leaf_runs), 1);
    assert_eq!(page_str(&h.router, "slug").as_deref(), Some("fast"));
}

#[tokio::test]
async fn test_hydration_replays_embedded_fetches() {
    let manifest = RouteManifest::new()
        .node(|| PageNode::layout("root"))
        .node(|| PageNode::error("error"))
        .node(|| {
            PageNode::leaf("shop").with_load(load_fn(|event| async move {
                let response = event.fetch("/api/items").await?;
                Ok(Some(ValueGraph::from_json(json!({ "items": response.body() }))))
            }))
        })
        .route(RouteEntry::new("shop", 2));

    let embedded = EmbeddedResponse {
        text: wire(json!({"body": "[1,2,3]", "status": 200, "headers": {}})),
        ttl_seconds: Some(60),
    };
    let payloads = Embedded(HashMap::from([(
        "https://example.com/api/items".to_string(),
        embedded,
    )]));
    let mut h = harness_at(manifest, "https://example.com/shop", Some(Arc::new(payloads)));

    let result = h
        .router
        .start(Some(Hydration {
            status: 200,
            error: None,
            node_ids: vec![0, 2],
            params: RouteParams::new(),
            route_id: Some("shop".to_string()),
            server_nodes: vec![None, None],
            form: None,
        }))
        .await;

    assert!(result.is_committed());
    assert_eq!(*h.views.mounts.lock(), vec![true]);
    assert_eq!(page_str(&h.router, "items").as_deref(), Some("[1,2,3]"));
    assert!(h.transport.requests().is_empty());
    assert!(!h.router.fetcher().is_hydrating());

    // Within the time-to-live the replayed response is served from cache
    h.router.invalidate_all().await;
    assert!(h.transport.requests().is_empty());
    assert_eq!(h.router.state().route_id(), Some("shop"));
    assert_eq!(h.views.updates.load(Ordering::SeqCst), 1);
}
