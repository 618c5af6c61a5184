//! Renderer boundary
//!
//! The view engine is opaque: it is handed render props and does the rest.
//! [`RendererAdapter`] wraps it with the parts of rendering the router owns,
//! namely announcing the new title and falling back to an error boundary.

use crate::error::ErrorPayload;
use crate::loader::{assemble, BranchNode, BranchResult, FormUpdate, LoadedPage};
use crate::state::{NavigationState, PageSnapshot, RenderProps};
use crate::trace_log;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lets view code opt out of the router's scroll handling for one commit
///
/// Calls only count while a commit is in progress or before the first mount.
#[derive(Debug, Clone, Default)]
pub struct ScrollControl {
    inner: Arc<ScrollFlags>,
}

#[derive(Debug, Default)]
struct ScrollFlags {
    autoscroll: AtomicBool,
    updating: AtomicBool,
    mounted: AtomicBool,
}

impl ScrollControl {
    pub(crate) fn new() -> Self {
        let control = Self::default();
        control.inner.autoscroll.store(true, Ordering::SeqCst);
        control
    }

    /// Skip scrolling for the commit in progress
    ///
    /// Returns whether the call had an effect.
    pub fn disable_scroll_handling(&self) -> bool {
        let flags = &self.inner;
        if flags.updating.load(Ordering::SeqCst) || !flags.mounted.load(Ordering::SeqCst) {
            flags.autoscroll.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub(crate) fn autoscroll(&self) -> bool {
        self.inner.autoscroll.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.inner.autoscroll.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_updating(&self, updating: bool) {
        self.inner.updating.store(updating, Ordering::SeqCst);
    }

    pub(crate) fn set_mounted(&self) {
        self.inner.mounted.store(true, Ordering::SeqCst);
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::SeqCst)
    }
}

/// The external view engine
pub trait Renderer: Send + Sync {
    /// Build the view tree; `hydrate` attaches to server-rendered markup
    fn mount(&self, props: &RenderProps, hydrate: bool, scroll: &ScrollControl);

    /// Apply new props to the mounted tree
    fn update(&self, props: &RenderProps, scroll: &ScrollControl);

    /// Write `message` to the live region
    fn announce(&self, message: &str) {
        let _ = message;
    }
}

/// The router's side of rendering
pub struct RendererAdapter {
    renderer: Arc<dyn Renderer>,
    scroll: ScrollControl,
    rendered: bool,
}

impl RendererAdapter {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            scroll: ScrollControl::new(),
            rendered: false,
        }
    }

    pub fn scroll_control(&self) -> &ScrollControl {
        &self.scroll
    }

    pub fn is_mounted(&self) -> bool {
        self.scroll.is_mounted()
    }

    pub fn mount(&mut self, props: &RenderProps, hydrate: bool) {
        trace_log!("Mounting {} components (hydrate: {})", props.components.len(), hydrate);
        self.renderer.mount(props, hydrate, &self.scroll);
        self.scroll.set_mounted();
    }

    pub fn update(&mut self, props: &RenderProps) {
        self.renderer.update(props, &self.scroll);
    }

    /// Mount on the first call, update afterwards
    pub fn render(&mut self, props: &RenderProps) {
        if self.is_mounted() {
            self.update(props);
        } else {
            self.mount(props, false);
        }
    }

    /// Re-render the committed branch with an error page at position `keep`
    ///
    /// Positions from `keep` down are replaced by `error_page`.
    pub fn swap_error_boundary(
        &mut self,
        current: &NavigationState,
        page: Option<&PageSnapshot>,
        keep: usize,
        error_page: Arc<BranchNode>,
        status: u16,
        error: ErrorPayload,
    ) -> Option<LoadedPage> {
        let url = current.url.clone()?;
        let mut branch: Vec<_> = current.branch.iter().take(keep).cloned().collect();
        branch.push(Some(error_page));

        let loaded = assemble(
            current,
            page,
            BranchResult {
                url,
                params: current.params.clone(),
                branch,
                status,
                error: Some(error),
                route: current.route.clone(),
                form: FormUpdate::Clear,
            },
        );
        self.render(&loaded.props);
        Some(loaded)
    }

    /// Announce the document title after a client-side navigation
    ///
    /// The first render is the server's (or the initial) page and is never
    /// announced.
    pub fn announce_navigation(&mut self, title: &str) {
        if !self.rendered {
            self.rendered = true;
            return;
        }
        let message = if title.is_empty() {
            "Navigated".to_string()
        } else {
            format!("Navigated to {}", title)
        };
        self.renderer.announce(&message);
    }
}

impl std::fmt::Debug for RendererAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererAdapter")
            .field("mounted", &self.is_mounted())
            .field("rendered", &self.rendered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ValueGraph;
    use crate::route::PageNode;
    use parking_lot::Mutex;
    use url::Url;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        disable_on_update: bool,
    }

    impl Renderer for Recorder {
        fn mount(&self, props: &RenderProps, hydrate: bool, _scroll: &ScrollControl) {
            self.calls
                .lock()
                .push(format!("mount {} {}", props.components.len(), hydrate));
        }

        fn update(&self, props: &RenderProps, scroll: &ScrollControl) {
            if self.disable_on_update {
                scroll.disable_scroll_handling();
            }
            self.calls.lock().push(format!("update {}", props.components.len()));
        }

        fn announce(&self, message: &str) {
            self.calls.lock().push(message.to_string());
        }
    }

    #[test]
    fn test_announce_skips_first_render() {
        let recorder = Arc::new(Recorder::default());
        let mut adapter = RendererAdapter::new(recorder.clone());

        adapter.announce_navigation("Home");
        adapter.announce_navigation("Docs");
        adapter.announce_navigation("");

        assert_eq!(*recorder.calls.lock(), vec!["Navigated to Docs", "Navigated"]);
    }

    #[test]
    fn test_render_mounts_then_updates() {
        let recorder = Arc::new(Recorder::default());
        let mut adapter = RendererAdapter::new(recorder.clone());
        let props = RenderProps::default();

        adapter.render(&props);
        adapter.render(&props);

        assert_eq!(*recorder.calls.lock(), vec!["mount 0 false", "update 0"]);
    }

    #[test]
    fn test_scroll_handling_only_disabled_while_updating() {
        let recorder = Arc::new(Recorder {
            disable_on_update: true,
            ..Recorder::default()
        });
        let mut adapter = RendererAdapter::new(recorder);
        adapter.mount(&RenderProps::default(), false);

        let control = adapter.scroll_control().clone();
        assert!(!control.disable_scroll_handling());
        assert!(control.autoscroll());

        control.set_updating(true);
        adapter.update(&RenderProps::default());
        control.set_updating(false);
        assert!(!control.autoscroll());

        control.reset();
        assert!(control.autoscroll());
    }

    #[test]
    fn test_swap_error_boundary_keeps_ancestors() {
        let recorder = Arc::new(Recorder::default());
        let mut adapter = RendererAdapter::new(recorder.clone());

        let node = |index, component: &str| {
            Arc::new(BranchNode {
                index,
                node: Arc::new(PageNode::layout(component)),
                server: None,
                universal: None,
                data: ValueGraph::object(),
            })
        };
        let current = NavigationState {
            url: Some(Url::parse("https://example.com/a").unwrap()),
            branch: vec![Some(node(0, "root")), Some(node(2, "leaf"))],
            ..NavigationState::default()
        };

        let loaded = adapter
            .swap_error_boundary(
                &current,
                None,
                1,
                node(1, "error"),
                500,
                ErrorPayload::new("boom"),
            )
            .unwrap();

        assert_eq!(loaded.status, 500);
        assert_eq!(loaded.state.branch.len(), 2);
        assert_eq!(loaded.state.branch[1].as_ref().unwrap().index, 1);
        assert_eq!(loaded.state.error.unwrap().message, "boom");
        assert_eq!(*recorder.calls.lock(), vec!["mount 2 false"]);
    }
}
