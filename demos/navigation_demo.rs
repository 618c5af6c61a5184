//! Navigation Demo
//!
//! Drives a docs site through an in-memory window: versioned routes with a
//! rest parameter, a server-data layout, a redirect, a 404 and back navigation.
//!
//! Run with `RUST_LOG=debug cargo run --example navigation_demo` to see the
//! router's own logging.

use async_trait::async_trait;
use page_navigator::*;
use serde_json::json;
use std::sync::Arc;
use url::Url;

/// Serves `__data.json` for the versions layout, refuses everything else
struct DocsServer;

#[async_trait]
impl Transport for DocsServer {
    async fn fetch(&self, request: Request) -> Result<Response, NavigationError> {
        let mut segments = request.url.path().trim_start_matches('/').split('/');
        let version = segments.next().unwrap_or_default();
        let body = encode(&ValueGraph::from_json(json!({
            "type": "data",
            "nodes": [
                null,
                {"type": "data", "data": {"release": format!("{} (stable)", version)}, "uses": {"params": ["version"]}},
            ]
        })));
        println!("  [server] {} {}", request.method, request.url);
        Ok(Response::new(200, body))
    }
}

/// Prints what a view engine would draw
struct ConsoleRenderer;

impl Renderer for ConsoleRenderer {
    fn mount(&self, props: &RenderProps, hydrate: bool, _scroll: &ScrollControl) {
        println!("  [view] mount (hydrate: {})", hydrate);
        describe(props);
    }

    fn update(&self, props: &RenderProps, _scroll: &ScrollControl) {
        println!("  [view] update");
        describe(props);
    }

    fn announce(&self, message: &str) {
        println!("  [live region] {}", message);
    }
}

fn describe(props: &RenderProps) {
    let components: Vec<_> = props.components.iter().map(|node| node.component()).collect();
    println!("         components: {}", components.join(" > "));
    if let Some(page) = &props.page {
        println!("         url: {} (status {})", page.url, page.status);
        if let Ok(json) = page.data.to_json() {
            println!("         data: {}", json);
        }
        if let Some(error) = &page.error {
            println!("         error: {}", error.message);
        }
    }
}

fn manifest() -> RouteManifest {
    RouteManifest::new()
        .node(|| PageNode::layout("RootLayout"))
        .node(|| PageNode::error("ErrorPage"))
        .node(|| PageNode::leaf("HomePage"))
        .node(|| PageNode::layout("VersionLayout"))
        .node(|| {
            PageNode::leaf("DocumentPage").with_load(load_fn(|event: LoadEvent| async move {
                let document = event.param("documentId").unwrap_or_default();
                let parent = event.parent().await?;
                let release = parent
                    .get("release")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                Ok(Some(ValueGraph::from_json(json!({
                    "title": document.trim_end_matches(".html").replace('/', " / "),
                    "release": release,
                }))))
            }))
        })
        .node(|| {
            PageNode::leaf("LatestRedirect")
                .with_load(load_fn(|_| async { Err(LoadError::redirect("/v2/getting-started.html")) }))
        })
        .matcher("version", |segment| {
            segment.strip_prefix('v').is_some_and(|n| n.parse::<u32>().is_ok())
        })
        .route(RouteEntry::new("", 2))
        .route(RouteEntry::new("latest", 5))
        .route(
            RouteEntry::new("[version=version]/[...documentId].html", 4).layouts([Some(3)]),
        )
        .server_layout(3)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), NavigationError> {
    env_logger::init();

    let window = Arc::new(MemoryWindow::new(
        Url::parse("https://docs.example.com/").map_err(|e| NavigationError::load(e.to_string()))?,
    ));
    window.set_title("Docs");
    let host = RouterHost {
        window: window.clone(),
        storage: Arc::new(MemoryStorage::new()),
        transport: Arc::new(DocsServer),
        renderer: Arc::new(ConsoleRenderer),
        clock: Arc::new(SystemClock),
        embedded: None,
    };

    let mut router = NavigationController::new(manifest(), RouterConfig::default(), host)?;
    router.after_navigate(|navigation| {
        let from = navigation.from.as_ref().map(|from| from.url.path().to_string());
        let to = navigation.to.as_ref().map(|to| to.url.path().to_string());
        println!("  [after_navigate] {} {:?} -> {:?}", navigation.kind, from, to);
    });

    println!("start");
    router.start(None).await;

    println!("\ngoto /v1/guide/intro.html");
    router.goto("/v1/guide/intro.html", GotoOptions::default()).await?;

    println!("\ngoto /v2/guide/intro.html (layout and page re-run)");
    router.goto("/v2/guide/intro.html", GotoOptions::default()).await?;

    println!("\nclick /latest (redirects)");
    router.click_link(&LinkClick::new("/latest")).await;

    println!("\ngoto /nightly/guide.html (version matcher rejects it)");
    router.goto("/nightly/guide.html", GotoOptions::default()).await?;

    println!("\nback");
    window.go(-1);
    let state = window.history_state();
    router.popstate(state.as_ref()).await;

    println!("\nsettled at {} ({:?})", window.location(), router.phase());
    Ok(())
}
