//! Navigation controller
//!
//! Owns everything mutable about navigation: the committed state, the history
//! index, scroll memory, pending invalidations and the preload slot. Intents
//! come in through the host-facing methods (`goto`, `click_link`, `popstate`,
//! ...), are matched and loaded, and the latest accepted one is committed.
//!
//! # Supersession
//!
//! Every accepted intent gets a fresh token. Load chains are `'static` futures
//! built from a snapshot of the controller, so several can be in flight at
//! once. When one settles, [`NavigationController::finish`] compares its token
//! with the latest: a stale result is dropped without touching state, history
//! or the renderer. Abandoned chains still run to completion, and fetches they
//! made may still land in the fetch cache.
//!
//! ```ignore
//! let a = router.begin(NavigationIntent::goto(url_a)).unwrap();
//! let b = router.begin(NavigationIntent::goto(url_b)).unwrap();
//!
//! let outcome = b.outcome().await;
//! router.finish(b, outcome); // committed
//! let outcome = a.outcome().await;
//! router.finish(a, outcome); // NavigationResult::Superseded
//! ```

use crate::codec::PageData;
use crate::config::RouterConfig;
use crate::error::{
    error_payload, ErrorContext, ErrorHook, ErrorPayload, LoadError, NavigationError,
};
use crate::fetcher::{EmbeddedPayloads, Fetcher, Transport};
use crate::history::ScrollMemory;
use crate::lifecycle::{Navigation, NavigationTarget, NavigationType, ObserverHandle, Observers};
use crate::loader::{
    assemble, load_hydration, load_root_error_page, nearest_error_page, run_chain, BranchResult,
    FormUpdate, Invalidation, InvalidationPredicate, LoadContext, LoadOutcome, LoadedPage,
    ServerNode,
};
use crate::params::RouteParams;
use crate::platform::{BrowserWindow, Clock, ScrollPosition, SessionStorage};
use crate::renderer::{Renderer, RendererAdapter, ScrollControl};
use crate::route::{RouteManifest, RouteTable, RouteTarget};
use crate::state::{NavigationPhase, NavigationState, PageSnapshot, RenderProps, Settled};
use crate::{debug_log, info_log, warn_log};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// A load chain (or its fallback) any number of callers can await
pub type LoadFuture = Shared<BoxFuture<'static, LoadOutcome>>;

// ============================================================================
// Intents
// ============================================================================

/// What an accepted navigation does to the history stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    Push,
    Replace,
    /// The browser already moved (popstate) or nothing should change
    None,
}

/// Where to scroll once the navigation committed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollTarget {
    /// The element named by the URL fragment, else the top of the page
    Default,
    /// A remembered or kept position
    To(ScrollPosition),
    /// Leave scroll and focus alone
    Untouched,
}

/// A requested transition
#[derive(Debug, Clone)]
pub struct NavigationIntent {
    pub url: Url,
    pub kind: NavigationType,
    pub history: HistoryAction,
    pub scroll: ScrollTarget,
    pub keepfocus: bool,
    pub delta: Option<i64>,
    history_index: Option<u64>,
    redirect_chain: Vec<String>,
    invalidating: bool,
}

impl NavigationIntent {
    fn new(url: Url, kind: NavigationType) -> Self {
        Self {
            url,
            kind,
            history: HistoryAction::Push,
            scroll: ScrollTarget::Default,
            keepfocus: false,
            delta: None,
            history_index: None,
            redirect_chain: Vec::new(),
            invalidating: false,
        }
    }

    /// A programmatic navigation
    pub fn goto(url: Url) -> Self {
        Self::new(url, NavigationType::Goto)
    }

    /// A followed link
    pub fn link(url: Url) -> Self {
        Self::new(url, NavigationType::Link)
    }

    /// Back/forward to the entry carrying `index`
    fn popstate(url: Url, index: u64, delta: i64, scroll: Option<ScrollPosition>) -> Self {
        Self {
            history: HistoryAction::None,
            scroll: scroll.map_or(ScrollTarget::Default, ScrollTarget::To),
            delta: Some(delta),
            history_index: Some(index),
            ..Self::new(url, NavigationType::Popstate)
        }
    }

    /// Re-run the current location in place
    fn refresh(url: Url) -> Self {
        Self {
            history: HistoryAction::None,
            scroll: ScrollTarget::Untouched,
            invalidating: true,
            ..Self::new(url, NavigationType::Goto)
        }
    }

    pub fn replace_state(mut self) -> Self {
        self.history = HistoryAction::Replace;
        self
    }

    pub fn scroll_to(mut self, position: ScrollPosition) -> Self {
        self.scroll = ScrollTarget::To(position);
        self
    }

    pub fn keepfocus(mut self) -> Self {
        self.keepfocus = true;
        self
    }

    /// Pathnames visited by the redirects that led here
    pub fn redirect_chain(&self) -> &[String] {
        &self.redirect_chain
    }
}

/// Options for [`NavigationController::goto`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GotoOptions {
    pub replace_state: bool,
    /// Keep the current scroll position
    pub noscroll: bool,
    pub keepfocus: bool,
    /// Re-run every load function of the target
    pub invalidate_all: bool,
}

/// An accepted intent whose load chain is running
pub struct PendingNavigation {
    token: u64,
    intent: NavigationIntent,
    outcome: LoadFuture,
}

impl PendingNavigation {
    /// The load chain's outcome; may be awaited any number of times
    pub fn outcome(&self) -> LoadFuture {
        self.outcome.clone()
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn intent(&self) -> &NavigationIntent {
        &self.intent
    }
}

impl fmt::Debug for PendingNavigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingNavigation")
            .field("token", &self.token)
            .field("url", &self.intent.url.as_str())
            .finish()
    }
}

/// How a navigation ended
#[derive(Debug)]
pub enum NavigationResult {
    /// The result was committed with this status
    Committed { status: u16 },
    /// A newer intent was accepted before this one settled
    Superseded,
    /// A before-navigate observer cancelled it
    Blocked,
    /// The document is being reloaded at this URL
    Reloaded(Url),
    /// A redirect was accepted; await this one next
    Continued(PendingNavigation),
}

impl NavigationResult {
    pub fn is_committed(&self) -> bool {
        matches!(self, NavigationResult::Committed { .. })
    }
}

// ============================================================================
// Host events
// ============================================================================

/// A click on an anchor element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkClick {
    pub href: String,
    /// Mouse button, 0 for the primary one
    pub button: u16,
    /// Any of ctrl/meta/shift/alt held
    pub modifier: bool,
    pub default_prevented: bool,
    /// `target` attribute
    pub target: Option<String>,
    /// `rel="external"`
    pub external: bool,
    pub download: bool,
    /// `data-sveltekit-reload`
    pub reload: bool,
    /// `data-sveltekit-noscroll`
    pub noscroll: bool,
}

impl LinkClick {
    /// A plain primary-button click on `href`
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            ..Self::default()
        }
    }

    fn should_intercept(&self) -> bool {
        self.button == 0
            && !self.modifier
            && !self.default_prevented
            && self.target.as_deref().map_or(true, |t| t.is_empty() || t == "_self")
            && !self.external
            && !self.download
            && !self.reload
    }
}

/// What the router did with a link click
#[derive(Debug)]
pub enum ClickResult {
    /// Not handled, the browser follows the link
    Ignored,
    /// Same page, different fragment; the browser scrolls and the router
    /// replaces history on the following `hashchange`
    Hash,
    Navigated(NavigationResult),
}

/// Result of a form action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult {
    Success { status: u16, data: Option<PageData> },
    Failure { status: u16, data: Option<PageData> },
    Redirect { location: String },
    Error { error: ErrorPayload },
}

/// Server-rendered page the client attaches to
#[derive(Debug, Clone)]
pub struct Hydration {
    pub status: u16,
    pub error: Option<ErrorPayload>,
    /// Node table indices rendered by the server, root first
    pub node_ids: Vec<usize>,
    pub params: RouteParams,
    pub route_id: Option<String>,
    /// Server data of each rendered node
    pub server_nodes: Vec<Option<ServerNode>>,
    pub form: Option<PageData>,
}

/// Everything the controller needs from its host
#[derive(Clone)]
pub struct RouterHost {
    pub window: Arc<dyn BrowserWindow>,
    pub storage: Arc<dyn SessionStorage>,
    pub transport: Arc<dyn Transport>,
    pub renderer: Arc<dyn Renderer>,
    pub clock: Arc<dyn Clock>,
    pub embedded: Option<Arc<dyn EmbeddedPayloads>>,
}

struct Preload {
    id: String,
    outcome: LoadFuture,
}

// ============================================================================
// Controller
// ============================================================================

/// The navigation state machine
pub struct NavigationController {
    config: Arc<RouterConfig>,
    routes: RouteTable,
    fetcher: Arc<Fetcher>,
    window: Arc<dyn BrowserWindow>,
    renderer: RendererAdapter,
    scroll_memory: ScrollMemory,
    state: Arc<NavigationState>,
    page: Option<Arc<PageSnapshot>>,
    phase: NavigationPhase,
    outcome: Option<Settled>,
    token: u64,
    history_index: u64,
    invalidation: Invalidation,
    preload: Option<Preload>,
    hash_navigating: bool,
    error_hook: Option<ErrorHook>,
    before_navigate: Observers,
    after_navigate: Observers,
}

impl NavigationController {
    /// Build the controller and restore history bookkeeping
    ///
    /// Reads the history index from the current entry, stamping a new one
    /// when the entry has none, and restores a remembered scroll position.
    pub fn new(
        manifest: RouteManifest,
        config: RouterConfig,
        host: RouterHost,
    ) -> Result<Self, NavigationError> {
        let routes = RouteTable::new(manifest, &config)?;

        let mut fetcher = Fetcher::new(
            host.transport,
            Arc::clone(&host.clock),
            config.fetch_cache_capacity,
        );
        if let Some(embedded) = host.embedded {
            fetcher = fetcher.with_embedded(embedded);
        }

        let scroll_memory = ScrollMemory::load(host.storage, config.scroll_storage_key.clone());
        let window = host.window;

        let history_index = match read_history_index(window.as_ref(), &config.history_index_key) {
            Some(index) => index,
            None => {
                let index = host.clock.now_ms();
                window.replace_state(
                    &window.location(),
                    history_state(&config.history_index_key, index),
                );
                index
            }
        };

        if let Some(position) = scroll_memory.get(history_index) {
            window.set_manual_scroll_restoration(true);
            window.scroll_to(position);
        }

        Ok(Self {
            config: Arc::new(config),
            routes,
            fetcher: Arc::new(fetcher),
            window,
            renderer: RendererAdapter::new(host.renderer),
            scroll_memory,
            state: Arc::new(NavigationState::default()),
            page: None,
            phase: NavigationPhase::Idle,
            outcome: None,
            token: 0,
            history_index,
            invalidation: Invalidation::default(),
            preload: None,
            hash_navigating: false,
            error_hook: None,
            before_navigate: Observers::new(),
            after_navigate: Observers::new(),
        })
    }

    /// Install the `handle_error` hook
    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&NavigationError, &ErrorContext) -> Option<ErrorPayload> + Send + Sync + 'static,
    {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    pub fn before_navigate<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&Navigation) + Send + Sync + 'static,
    {
        self.before_navigate.subscribe(observer)
    }

    pub fn after_navigate<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&Navigation) + Send + Sync + 'static,
    {
        self.after_navigate.subscribe(observer)
    }

    pub fn phase(&self) -> NavigationPhase {
        self.phase
    }

    /// How the last finished navigation ended, `None` before the first one
    pub fn outcome(&self) -> Option<Settled> {
        self.outcome
    }

    fn settle(&mut self, outcome: Settled) {
        self.phase = NavigationPhase::Idle;
        self.outcome = Some(outcome);
    }

    /// The committed state; never mutated once handed out
    pub fn state(&self) -> Arc<NavigationState> {
        Arc::clone(&self.state)
    }

    pub fn page(&self) -> Option<Arc<PageSnapshot>> {
        self.page.clone()
    }

    pub fn history_index(&self) -> u64 {
        self.history_index
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Handle view code can use to opt out of scroll handling
    pub fn scroll_control(&self) -> ScrollControl {
        self.renderer.scroll_control().clone()
    }

    /// Skip scroll handling for the commit in progress
    pub fn disable_scroll_handling(&self) -> bool {
        self.renderer.scroll_control().disable_scroll_handling()
    }

    // ------------------------------------------------------------------------
    // Core cycle
    // ------------------------------------------------------------------------

    /// Accept an intent and start its load chain
    ///
    /// Runs before-navigate observers first; returns `None` if one cancelled.
    pub fn begin(&mut self, intent: NavigationIntent) -> Option<PendingNavigation> {
        let previous_phase = self.phase;
        self.phase = NavigationPhase::Matching;

        let external = self.routes.is_external(&intent.url, &self.window.location());
        let resolved = if external {
            Ok(None)
        } else {
            self.routes.resolve(&intent.url)
        };

        if !intent.invalidating {
            let navigation = Navigation::new(
                self.current_target(),
                Some(target_of(&intent.url, resolved.as_ref().ok().and_then(Option::as_ref))),
                intent.kind,
                intent.delta,
            );
            self.before_navigate.notify(&navigation);

            if navigation.is_cancelled() {
                debug_log!("Navigation to {} cancelled", intent.url);
                if let (NavigationType::Popstate, Some(delta)) = (intent.kind, intent.delta) {
                    self.window.go(-delta);
                }
                self.phase = previous_phase;
                return None;
            }

            self.scroll_memory
                .save(self.history_index, self.window.scroll_position());
            if let Some(index) = intent.history_index {
                self.history_index = index;
            }
        }

        self.token += 1;
        Some(self.start_load(self.token, intent, external, resolved))
    }

    fn start_load(
        &mut self,
        token: u64,
        intent: NavigationIntent,
        external: bool,
        resolved: Result<Option<RouteTarget>, NavigationError>,
    ) -> PendingNavigation {
        debug_log!("Navigation {} accepted: {}", token, intent.url);
        self.phase = NavigationPhase::Loading;

        let outcome = if external {
            let url = intent.url.clone();
            futures::future::ready(LoadOutcome::Reload { url }).boxed().shared()
        } else {
            let preloaded = match (&resolved, &self.preload) {
                (Ok(Some(target)), Some(preload))
                    if !intent.invalidating && preload.id == target.id =>
                {
                    debug_log!("Using preloaded data for {}", target.id);
                    Some(preload.outcome.clone())
                }
                _ => None,
            };
            preloaded.unwrap_or_else(|| {
                let ctx = self.load_context(intent.invalidating);
                self.load_future(ctx, intent.url.clone(), resolved, &intent.redirect_chain)
            })
        };

        PendingNavigation {
            token,
            intent,
            outcome,
        }
    }

    /// Apply a settled load chain
    ///
    /// Dropped without side effects when a newer intent was accepted since.
    pub fn finish(&mut self, pending: PendingNavigation, outcome: LoadOutcome) -> NavigationResult {
        if pending.token != self.token {
            debug_log!(
                "Dropping superseded navigation {} to {}",
                pending.token,
                pending.intent.url
            );
            return NavigationResult::Superseded;
        }

        match outcome {
            LoadOutcome::Loaded(page) => {
                let status = page.status;
                self.commit(*page, &pending.intent);
                NavigationResult::Committed { status }
            }
            LoadOutcome::Redirect { location } => {
                let PendingNavigation { token, intent, .. } = pending;
                let url = match intent.url.join(&location) {
                    Ok(url) => url,
                    Err(error) => {
                        warn_log!("Unusable redirect location {:?}: {}", location, error);
                        return self.reload(intent.url);
                    }
                };
                debug_log!("Following redirect from {} to {}", intent.url, url);

                let mut redirect_chain = intent.redirect_chain;
                redirect_chain.push(intent.url.path().to_string());
                let next = NavigationIntent {
                    history: match intent.history {
                        HistoryAction::Replace => HistoryAction::Replace,
                        _ => HistoryAction::Push,
                    },
                    redirect_chain,
                    ..NavigationIntent::goto(url)
                };

                let external = self.routes.is_external(&next.url, &self.window.location());
                let resolved = if external {
                    Ok(None)
                } else {
                    self.routes.resolve(&next.url)
                };
                NavigationResult::Continued(self.start_load(token, next, external, resolved))
            }
            LoadOutcome::Reload { url } => self.reload(url),
        }
    }

    /// Begin an intent and drive it, redirects included, until it ends
    pub async fn navigate(&mut self, intent: NavigationIntent) -> NavigationResult {
        match self.begin(intent) {
            Some(pending) => self.drive(pending).await,
            None => NavigationResult::Blocked,
        }
    }

    async fn drive(&mut self, mut pending: PendingNavigation) -> NavigationResult {
        loop {
            let outcome = pending.outcome().await;
            match self.finish(pending, outcome) {
                NavigationResult::Continued(next) => pending = next,
                result => return result,
            }
        }
    }

    fn reload(&mut self, url: Url) -> NavigationResult {
        warn_log!("Falling back to a full reload of {}", url);
        self.settle(Settled::Error);
        self.window.reload(&url);
        NavigationResult::Reloaded(url)
    }

    fn commit(&mut self, loaded: LoadedPage, intent: &NavigationIntent) {
        self.phase = NavigationPhase::Committing;
        self.invalidation = Invalidation::default();
        let scroll = self.renderer.scroll_control().clone();
        scroll.set_updating(true);

        let from = self.current_target();
        let LoadedPage { state, props, .. } = loaded;
        let mut url = state.url.clone().unwrap_or_else(|| intent.url.clone());
        url.set_fragment(intent.url.fragment());

        match intent.history {
            HistoryAction::Push => {
                self.scroll_memory.prune_after(self.history_index);
                self.history_index += 1;
                self.window
                    .push_state(&url, history_state(&self.config.history_index_key, self.history_index));
            }
            HistoryAction::Replace => {
                self.window
                    .replace_state(&url, history_state(&self.config.history_index_key, self.history_index));
            }
            HistoryAction::None => {}
        }

        self.preload = None;
        let failed = state.error.is_some();
        self.state = Arc::new(state);
        if let Some(page) = &props.page {
            self.page = Some(Arc::new(page.clone()));
        }
        self.renderer.render(&props);

        if intent.scroll != ScrollTarget::Untouched {
            if !intent.keepfocus {
                self.window.reset_focus();
            }
            if scroll.autoscroll() {
                match intent.scroll {
                    ScrollTarget::To(position) => self.window.scroll_to(position),
                    _ => {
                        let on_fragment = url
                            .fragment()
                            .is_some_and(|id| self.window.scroll_to_fragment(id));
                        if !on_fragment {
                            self.window.scroll_to(ScrollPosition::top());
                        }
                    }
                }
            }
        }
        scroll.reset();

        if !intent.invalidating {
            self.renderer.announce_navigation(&self.window.document_title());
            let navigation =
                Navigation::new(from, self.current_target(), intent.kind, intent.delta);
            self.after_navigate.notify(&navigation);
        }

        scroll.set_updating(false);
        self.settle(if failed { Settled::Error } else { Settled::Ok });
        info_log!("Navigated to {}", url);
    }

    fn load_context(&self, invalidating: bool) -> LoadContext {
        LoadContext {
            nodes: Arc::clone(self.routes.nodes()),
            fetcher: Arc::clone(&self.fetcher),
            config: Arc::clone(&self.config),
            current: Arc::clone(&self.state),
            page: self.page.clone(),
            invalidation: self.invalidation.clone(),
            error_hook: self.error_hook.clone(),
            root_server_load: self.routes.root_server_load(),
            invalidating,
        }
    }

    /// The load chain for a URL, or the root error page standing in for it
    fn load_future(
        &self,
        ctx: LoadContext,
        url: Url,
        resolved: Result<Option<RouteTarget>, NavigationError>,
        redirect_chain: &[String],
    ) -> LoadFuture {
        let params = RouteParams::new();
        let looped = redirect_chain.len() > self.config.max_redirects
            || redirect_chain.iter().any(|path| path == url.path());

        if looped {
            let route_id = resolved
                .ok()
                .flatten()
                .map(|target| target.route.id.clone());
            let error = NavigationError::RedirectLoop {
                location: url.to_string(),
            };
            let payload = ctx.report(&error, &url, &params, route_id.as_deref());
            return load_root_error_page(ctx, url, route_id, 500, payload)
                .boxed()
                .shared();
        }

        match resolved {
            Ok(Some(target)) => run_chain(ctx, target).boxed().shared(),
            Ok(None) => {
                let error = NavigationError::NotFound {
                    path: url.path().to_string(),
                };
                let payload = ctx.report(&error, &url, &params, None);
                load_root_error_page(ctx, url, None, 404, payload)
                    .boxed()
                    .shared()
            }
            Err(error) => {
                let payload = ctx.report(&error, &url, &params, None);
                load_root_error_page(ctx, url, None, error.status(), payload)
                    .boxed()
                    .shared()
            }
        }
    }

    fn current_target(&self) -> Option<NavigationTarget> {
        self.state.url.as_ref().map(|url| NavigationTarget {
            params: self.state.params.clone(),
            route_id: self.state.route_id().map(str::to_string),
            url: url.clone(),
        })
    }

    fn resolve_href(&self, href: &str) -> Result<Url, NavigationError> {
        self.window
            .location()
            .join(href)
            .map_err(|error| NavigationError::NavigationShape {
                message: format!("Invalid URL {:?}: {}", href, error),
            })
    }

    // ------------------------------------------------------------------------
    // Host-facing operations
    // ------------------------------------------------------------------------

    /// Navigate to `href`, resolved against the current location
    ///
    /// URLs outside the app are loaded as a new document.
    pub async fn goto(
        &mut self,
        href: &str,
        options: GotoOptions,
    ) -> Result<NavigationResult, NavigationError> {
        let url = self.resolve_href(href)?;
        if self.routes.is_external(&url, &self.window.location()) {
            return Ok(self.reload(url));
        }

        let mut intent = NavigationIntent::goto(url);
        if options.replace_state {
            intent = intent.replace_state();
        }
        if options.noscroll {
            intent = intent.scroll_to(self.window.scroll_position());
        }
        if options.keepfocus {
            intent = intent.keepfocus();
        }

        let forced = self.invalidation.all;
        self.invalidation.all |= options.invalidate_all;
        let Some(pending) = self.begin(intent) else {
            self.invalidation.all = forced;
            return Ok(NavigationResult::Blocked);
        };
        Ok(self.drive(pending).await)
    }

    /// Handle a click on an anchor
    pub async fn click_link(&mut self, click: &LinkClick) -> ClickResult {
        if !click.should_intercept() {
            return ClickResult::Ignored;
        }
        let Ok(url) = self.resolve_href(&click.href) else {
            return ClickResult::Ignored;
        };
        let location = self.window.location();
        if self.routes.is_external(&url, &location) {
            return ClickResult::Ignored;
        }

        if url.fragment().is_some() && without_fragment(&url) == without_fragment(&location) {
            self.hash_navigating = true;
            self.scroll_memory
                .save(self.history_index, self.window.scroll_position());
            self.update_page_url(url);
            return ClickResult::Hash;
        }

        let mut intent = NavigationIntent::link(url.clone());
        if url == location {
            intent = intent.replace_state();
        }
        if click.noscroll {
            intent = intent.scroll_to(self.window.scroll_position());
        }
        ClickResult::Navigated(self.navigate(intent).await)
    }

    fn update_page_url(&mut self, url: Url) {
        let mut state = (*self.state).clone();
        state.url = Some(url.clone());
        self.state = Arc::new(state);

        if let Some(page) = &self.page {
            let mut page = (**page).clone();
            page.url = url;
            let props = RenderProps {
                components: self.state.branch.iter().flatten().map(|n| Arc::clone(&n.node)).collect(),
                data: vec![None; self.state.branch.iter().flatten().count()],
                form: None,
                page: Some(page.clone()),
            };
            self.page = Some(Arc::new(page));
            self.renderer.render(&props);
        }
    }

    /// The browser finished a fragment change
    pub fn on_hash_change(&mut self) {
        if !self.hash_navigating {
            return;
        }
        self.hash_navigating = false;
        self.history_index += 1;
        self.window.replace_state(
            &self.window.location(),
            history_state(&self.config.history_index_key, self.history_index),
        );
    }

    /// Back/forward with the new entry's history state
    ///
    /// Entries without a history index were not created by the router and
    /// are left to the browser.
    pub async fn popstate(
        &mut self,
        state: Option<&serde_json::Value>,
    ) -> Option<NavigationResult> {
        let index = state?
            .get(&self.config.history_index_key)?
            .as_u64()?;
        if index == self.history_index {
            return None;
        }

        let delta = index as i64 - self.history_index as i64;
        let intent = NavigationIntent::popstate(
            self.window.location(),
            index,
            delta,
            self.scroll_memory.get(index),
        );
        Some(self.navigate(intent).await)
    }

    /// Re-run loads that depend on `href`
    pub async fn invalidate(&mut self, href: &str) -> Result<NavigationResult, NavigationError> {
        let target = self.resolve_href(href)?;
        let predicate: InvalidationPredicate = Arc::new(move |url: &Url| *url == target);
        Ok(self.invalidate_with(predicate).await)
    }

    /// Re-run loads with a dependency matching `predicate`
    pub async fn invalidate_with(&mut self, predicate: InvalidationPredicate) -> NavigationResult {
        self.invalidation.predicates.push(predicate);
        self.refresh().await
    }

    /// Re-run every load of the current page
    pub async fn invalidate_all(&mut self) -> NavigationResult {
        self.invalidation.all = true;
        self.refresh().await
    }

    async fn refresh(&mut self) -> NavigationResult {
        self.preload = None;
        let intent = NavigationIntent::refresh(self.window.location());
        self.navigate(intent).await
    }

    /// Start loading `href` ahead of a navigation to it
    ///
    /// A navigation to the same route id reuses the result.
    pub fn preload_data(&mut self, href: &str) -> Result<LoadFuture, NavigationError> {
        let url = self.resolve_href(href)?;
        if self.routes.is_external(&url, &self.window.location()) {
            return Err(NavigationError::load(
                "Attempted to preload a URL that does not belong to this app",
            ));
        }

        let target = self
            .routes
            .resolve(&url)?
            .ok_or_else(|| NavigationError::NotFound {
                path: url.path().to_string(),
            })?;
        let id = target.id.clone();
        let outcome = self.load_future(self.load_context(false), url, Ok(Some(target)), &[]);
        self.preload = Some(Preload {
            id,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Resolve the page nodes of routes matching `paths` (all when empty)
    pub fn preload_code(&self, paths: &[&str]) -> Result<usize, NavigationError> {
        self.routes.preload_code(paths)
    }

    /// Apply the result of a form submission
    pub async fn apply_action(&mut self, result: ActionResult) -> NavigationResult {
        match result {
            ActionResult::Redirect { location } => match self.goto(&location, GotoOptions::default()).await {
                Ok(result) => result,
                Err(error) => {
                    warn_log!("Unusable action redirect {:?}: {}", location, error);
                    NavigationResult::Blocked
                }
            },
            ActionResult::Error { error } => {
                let current = Arc::clone(&self.state);
                let Some(route) = current.route.as_ref() else {
                    return NavigationResult::Blocked;
                };
                let Some((keep, error_page)) = nearest_error_page(
                    self.routes.nodes(),
                    current.branch.len(),
                    &current.branch,
                    &route.errors,
                ) else {
                    return NavigationResult::Blocked;
                };

                let page = self.page.clone();
                let Some(loaded) = self.renderer.swap_error_boundary(
                    &current,
                    page.as_deref(),
                    keep,
                    error_page,
                    500,
                    error,
                ) else {
                    return NavigationResult::Blocked;
                };
                self.accept_rendered(loaded);
                self.window.reset_focus();
                NavigationResult::Committed { status: 500 }
            }
            ActionResult::Success { status, data } => self.apply_form(status, data, true),
            ActionResult::Failure { status, data } => self.apply_form(status, data, false),
        }
    }

    /// Show an action's result without loading anything
    fn apply_form(&mut self, status: u16, data: Option<PageData>, success: bool) -> NavigationResult {
        let page = self.page.as_deref().map(|page| PageSnapshot {
            form: data.clone(),
            status,
            ..page.clone()
        });
        let props = RenderProps {
            form: data,
            page: page.clone(),
            ..RenderProps::default()
        };
        if let Some(page) = page {
            self.page = Some(Arc::new(page));
        }
        self.renderer.update(&props);
        if success {
            self.window.reset_focus();
        }
        NavigationResult::Committed { status }
    }

    fn accept_rendered(&mut self, loaded: LoadedPage) {
        let failed = loaded.state.error.is_some();
        self.state = Arc::new(loaded.state);
        if let Some(page) = loaded.props.page {
            self.page = Some(Arc::new(page));
        }
        self.settle(if failed { Settled::Error } else { Settled::Ok });
    }

    /// Attach to the page
    ///
    /// With hydration data the server-rendered nodes are loaded (replaying
    /// embedded fetches) and mounted in hydrate mode. Without it the current
    /// location is loaded with a history replace.
    pub async fn start(&mut self, hydration: Option<Hydration>) -> NavigationResult {
        self.window.set_manual_scroll_restoration(true);

        let Some(hydration) = hydration else {
            let intent = NavigationIntent::goto(self.window.location()).replace_state();
            return self.navigate(intent).await;
        };

        let url = self.window.location();
        let ctx = self.load_context(false);
        let route = hydration
            .route_id
            .as_deref()
            .and_then(|id| self.routes.get(id))
            .cloned();

        self.fetcher.set_hydrating(true);
        let branch = load_hydration(
            &ctx,
            url.clone(),
            &hydration.node_ids,
            hydration.server_nodes,
            hydration.params.clone(),
            hydration.route_id.clone(),
        )
        .await;

        let loaded = match branch {
            Ok(branch) => assemble(
                &ctx.current,
                None,
                BranchResult {
                    url: url.clone(),
                    params: hydration.params,
                    branch,
                    status: hydration.status,
                    error: hydration.error,
                    route,
                    form: hydration.form.map_or(FormUpdate::Clear, FormUpdate::Set),
                },
            ),
            Err(LoadError::Redirect { location, .. }) => {
                self.fetcher.set_hydrating(false);
                let target = url.join(&location).unwrap_or(url);
                return self.reload(target);
            }
            Err(LoadError::Error(error)) => {
                let status = error.status();
                let context = ErrorContext {
                    url: url.clone(),
                    params: hydration.params.clone(),
                    route_id: hydration.route_id.clone(),
                };
                let payload = error_payload(&error, &context, self.error_hook.as_ref());
                match load_root_error_page(ctx, url.clone(), hydration.route_id, status, payload).await
                {
                    LoadOutcome::Loaded(page) => *page,
                    _ => {
                        self.fetcher.set_hydrating(false);
                        return self.reload(url);
                    }
                }
            }
        };

        let status = loaded.status;
        let LoadedPage { state, props, .. } = loaded;
        let failed = state.error.is_some();
        self.state = Arc::new(state);
        self.page = props.page.clone().map(Arc::new);
        self.renderer.mount(&props, true);
        self.renderer.announce_navigation(&self.window.document_title());

        let navigation = Navigation::new(None, self.current_target(), NavigationType::Load, None);
        self.after_navigate.notify(&navigation);
        self.fetcher.set_hydrating(false);
        self.settle(if failed { Settled::Error } else { Settled::Ok });

        NavigationResult::Committed { status }
    }

    /// The document is about to unload; `false` if an observer objected
    pub fn before_unload(&self) -> bool {
        let navigation = Navigation::new(self.current_target(), None, NavigationType::Unload, None);
        self.before_navigate.notify(&navigation);
        if navigation.is_cancelled() {
            return false;
        }
        self.window.set_manual_scroll_restoration(false);
        true
    }

    /// The document was hidden; persist scroll memory
    pub fn on_visibility_hidden(&mut self) {
        self.scroll_memory
            .save(self.history_index, self.window.scroll_position());
        self.scroll_memory.flush();
    }
}

impl fmt::Debug for NavigationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NavigationController")
            .field("phase", &self.phase)
            .field("outcome", &self.outcome)
            .field("token", &self.token)
            .field("history_index", &self.history_index)
            .field("url", &self.state.url.as_ref().map(Url::as_str))
            .finish()
    }
}

fn target_of(url: &Url, target: Option<&RouteTarget>) -> NavigationTarget {
    NavigationTarget {
        params: target.map(|t| t.params.clone()).unwrap_or_default(),
        route_id: target.map(|t| t.route.id.clone()),
        url: url.clone(),
    }
}

fn history_state(key: &str, index: u64) -> serde_json::Value {
    serde_json::json!({ key: index })
}

fn read_history_index(window: &dyn BrowserWindow, key: &str) -> Option<u64> {
    window.history_state()?.get(key)?.as_u64()
}

fn without_fragment(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}
