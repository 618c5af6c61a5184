//! # Page Navigator
//!
//! Client-side navigation and data loading for single-page applications:
//!
//! - **Route Matching** - `[param]`, `[param=matcher]`, `[...rest]` and `(group)` patterns
//! - **Load Chains** - Layout and page load functions that only re-run when what they read changed
//! - **Server Data** - One batched `__data.json` request per navigation, in a cycle-safe wire format
//! - **Hydration** - Replays fetches embedded in the server-rendered document
//! - **Error Boundaries** - Failures render the nearest error page, or fall back to a full reload
//! - **Scroll & History** - Per-entry scroll memory persisted in session storage
//! - **Supersession** - Only the latest accepted navigation is ever committed
//!
//! # Quick Start
//!
//! ```ignore
//! use page_navigator::*;
//! use std::sync::Arc;
//!
//! let manifest = RouteManifest::new()
//!     .node(|| PageNode::layout("root"))
//!     .node(|| PageNode::error("error"))
//!     .node(|| {
//!         PageNode::leaf("doc").with_load(load_fn(|event| async move {
//!             let page = event.param("documentId").unwrap_or_default();
//!             Ok(Some(ValueGraph::from_json(serde_json::json!({ "page": page }))))
//!         }))
//!     })
//!     .route(RouteEntry::new("[version]/[...documentId].html", 2));
//!
//! let mut router = NavigationController::new(manifest, RouterConfig::default(), host)?;
//! router.start(None).await;
//! router.goto("/v2/guide/intro.html", GotoOptions::default()).await?;
//! ```
//!
//! The host supplies a [`RouterHost`]: the window (history, scroll, focus),
//! session storage, the network transport, the view renderer and a clock.
//! [`MemoryWindow`] and [`MemoryStorage`] implement the browser side in memory.
//!
//! # Feature Flags
//!
//! - `log` (default) - Uses the standard `log` crate for logging
//! - `tracing` - Uses the `tracing` crate for structured logging (mutually exclusive with `log`)

#![cfg_attr(docsrs, feature(doc_cfg))]
// Lints are configured in Cargo.toml [lints] section

// Logging abstraction
pub mod logging;

// Configuration and errors
pub mod config;
pub mod error;

// Routing
pub mod matcher;
pub mod params;
pub mod route;

// Data
pub mod cache;
pub mod codec;
pub mod fetcher;
pub mod loader;

// Host boundary
pub mod platform;
pub mod renderer;

// Navigation
pub mod controller;
pub mod history;
pub mod lifecycle;
pub mod state;

pub use cache::{CacheStats, FetchCache};
pub use codec::{decode, encode, Node, PageData, Value, ValueGraph};
pub use config::{RouterConfig, TrailingSlash};
pub use controller::{
    ActionResult, ClickResult, GotoOptions, HistoryAction, Hydration, LinkClick, LoadFuture,
    NavigationController, NavigationIntent, NavigationResult, PendingNavigation, RouterHost,
    ScrollTarget,
};
pub use error::{
    error_payload, ErrorContext, ErrorHook, ErrorPayload, LoadError, NavigationError,
};
pub use fetcher::{
    hash, EmbeddedPayloads, EmbeddedResponse, Fetcher, Method, Request, Response, Transport,
};
pub use history::ScrollMemory;
pub use lifecycle::{Navigation, NavigationTarget, NavigationType, ObserverHandle};
pub use loader::{
    load_fn, BranchNode, DependencyUses, InvalidationPredicate, LoadEvent, LoadOutcome,
    ServerDataNode, ServerDataResponse, ServerNode, TrackedUrl, UniversalLoad,
};
pub use matcher::{ParamMatchers, RoutePattern};
pub use params::{QueryParams, RouteParams};
pub use platform::{
    BrowserWindow, Clock, ManualClock, MemoryStorage, MemoryWindow, ScrollPosition,
    SessionStorage, SystemClock,
};
pub use renderer::{Renderer, RendererAdapter, ScrollControl};
pub use route::{CompiledRoute, NodeKind, PageNode, RouteEntry, RouteManifest, RouteTable};
pub use state::{
    Field, NavigationPhase, NavigationState, PageSnapshot, RenderProps, Settled,
};
