//! Host platform boundary
//!
//! The controller never touches a browser directly. Everything it needs from the
//! host (history, scrolling, focus, session storage, time) goes through the
//! traits below. `MemoryWindow`, `MemoryStorage` and `ManualClock` implement
//! them in memory for hosts without a DOM and for tests.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// A scroll offset in CSS pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub x: f64,
    pub y: f64,
}

impl ScrollPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Top left corner of the page
    pub fn top() -> Self {
        Self::default()
    }
}

/// The window and document the router drives
pub trait BrowserWindow: Send + Sync {
    /// Current `location.href`
    fn location(&self) -> Url;

    /// `history.pushState(state, "", url)`
    fn push_state(&self, url: &Url, state: serde_json::Value);

    /// `history.replaceState(state, "", url)`
    fn replace_state(&self, url: &Url, state: serde_json::Value);

    /// `history.state`
    fn history_state(&self) -> Option<serde_json::Value>;

    /// `history.go(delta)`
    fn go(&self, delta: i64);

    /// Full document navigation to `url`
    fn reload(&self, url: &Url);

    fn scroll_position(&self) -> ScrollPosition;

    fn scroll_to(&self, position: ScrollPosition);

    /// Scroll the element with this id into view, `false` if there is none
    fn scroll_to_fragment(&self, id: &str) -> bool;

    /// Move focus back to the document body and clear the selection
    fn reset_focus(&self);

    fn document_title(&self) -> String;

    /// `history.scrollRestoration = manual ? "manual" : "auto"`
    fn set_manual_scroll_restoration(&self, manual: bool);
}

/// Session scoped key/value storage
pub trait SessionStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
}

/// Wall clock in milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Clock backed by `SystemTime`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// In-memory session storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.values.lock().insert(key.to_string(), value);
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    url: Url,
    state: serde_json::Value,
}

#[derive(Debug)]
struct WindowState {
    entries: Vec<HistoryEntry>,
    cursor: usize,
    scroll: ScrollPosition,
    title: String,
    fragments: HashSet<String>,
    reloads: Vec<Url>,
    go_calls: Vec<i64>,
    focus_resets: usize,
    manual_scroll_restoration: bool,
}

/// A window with an in-memory history stack
///
/// `go` moves the history cursor but does not dispatch `popstate`; the host (or
/// test) forwards that to the controller itself.
#[derive(Debug)]
pub struct MemoryWindow {
    state: Mutex<WindowState>,
}

impl MemoryWindow {
    /// Window whose only history entry is `url` with no state
    pub fn new(url: Url) -> Self {
        Self {
            state: Mutex::new(WindowState {
                entries: vec![HistoryEntry {
                    url,
                    state: serde_json::Value::Null,
                }],
                cursor: 0,
                scroll: ScrollPosition::top(),
                title: String::new(),
                fragments: HashSet::new(),
                reloads: Vec::new(),
                go_calls: Vec::new(),
                focus_resets: 0,
                manual_scroll_restoration: false,
            }),
        }
    }

    /// Set `document.title`
    pub fn set_title(&self, title: impl Into<String>) {
        self.state.lock().title = title.into();
    }

    /// Register an element id `scroll_to_fragment` can find
    pub fn add_fragment(&self, id: impl Into<String>) {
        self.state.lock().fragments.insert(id.into());
    }

    /// Simulate the user scrolling
    pub fn set_scroll(&self, position: ScrollPosition) {
        self.state.lock().scroll = position;
    }

    /// Number of history entries
    pub fn history_len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// URLs handed to `reload`, oldest first
    pub fn reloads(&self) -> Vec<Url> {
        self.state.lock().reloads.clone()
    }

    /// Deltas handed to `go`, oldest first
    pub fn go_calls(&self) -> Vec<i64> {
        self.state.lock().go_calls.clone()
    }

    pub fn focus_resets(&self) -> usize {
        self.state.lock().focus_resets
    }

    pub fn manual_scroll_restoration(&self) -> bool {
        self.state.lock().manual_scroll_restoration
    }
}

impl BrowserWindow for MemoryWindow {
    fn location(&self) -> Url {
        let state = self.state.lock();
        state.entries[state.cursor].url.clone()
    }

    fn push_state(&self, url: &Url, history_state: serde_json::Value) {
        let mut state = self.state.lock();
        let cursor = state.cursor;
        state.entries.truncate(cursor + 1);
        state.entries.push(HistoryEntry {
            url: url.clone(),
            state: history_state,
        });
        state.cursor += 1;
    }

    fn replace_state(&self, url: &Url, history_state: serde_json::Value) {
        let mut state = self.state.lock();
        let cursor = state.cursor;
        state.entries[cursor] = HistoryEntry {
            url: url.clone(),
            state: history_state,
        };
    }

    fn history_state(&self) -> Option<serde_json::Value> {
        let state = self.state.lock();
        let entry = &state.entries[state.cursor];
        (!entry.state.is_null()).then(|| entry.state.clone())
    }

    fn go(&self, delta: i64) {
        let mut state = self.state.lock();
        state.go_calls.push(delta);
        let target = state.cursor as i64 + delta;
        if target >= 0 && (target as usize) < state.entries.len() {
            state.cursor = target as usize;
        }
    }

    fn reload(&self, url: &Url) {
        self.state.lock().reloads.push(url.clone());
    }

    fn scroll_position(&self) -> ScrollPosition {
        self.state.lock().scroll
    }

    fn scroll_to(&self, position: ScrollPosition) {
        self.state.lock().scroll = position;
    }

    fn scroll_to_fragment(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        if state.fragments.contains(id) {
            // Fragments sit at a fixed offset so a scroll into view is observable
            state.scroll = ScrollPosition::new(0.0, 500.0);
            true
        } else {
            false
        }
    }

    fn reset_focus(&self) {
        self.state.lock().focus_resets += 1;
    }

    fn document_title(&self) -> String {
        self.state.lock().title.clone()
    }

    fn set_manual_scroll_restoration(&self, manual: bool) {
        self.state.lock().manual_scroll_restoration = manual;
    }
}
