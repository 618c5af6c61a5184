//! Navigation observers
//!
//! `before_navigate` observers see every navigation before it touches history
//! and may cancel it. `after_navigate` observers see it once it committed.

use crate::error::{retired_navigation_field, NavigationError};
use crate::params::RouteParams;
use crate::state::Field;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use url::Url;

/// What started a navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationType {
    /// A link click
    Link,
    /// A `goto` call (also redirects and form action redirects)
    Goto,
    /// Back/forward
    Popstate,
    /// The document is being left
    Unload,
    /// The initial page load
    Load,
}

impl NavigationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NavigationType::Link => "link",
            NavigationType::Goto => "goto",
            NavigationType::Popstate => "popstate",
            NavigationType::Unload => "unload",
            NavigationType::Load => "load",
        }
    }
}

impl fmt::Display for NavigationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end of a navigation
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationTarget {
    pub params: RouteParams,
    pub route_id: Option<String>,
    pub url: Url,
}

/// URL fields that used to live directly on a navigation target
const FLAT_URL_FIELDS: &[&str] = &[
    "hash",
    "href",
    "host",
    "hostname",
    "origin",
    "pathname",
    "port",
    "protocol",
    "search",
    "searchParams",
    "toString",
    "toJSON",
];

impl NavigationTarget {
    /// Read a field by name
    ///
    /// URL parts are under `url`; asking for one directly (`pathname`, `href`,
    /// ...) is a `NavigationShape` error naming the owner (`from`/`to`).
    pub fn field(&self, owner: &str, name: &str) -> Result<Field<'_>, NavigationError> {
        match name {
            "params" => Ok(Field::Params(&self.params)),
            "route_id" | "routeId" => Ok(Field::RouteId(self.route_id.as_deref())),
            "url" => Ok(Field::Url(&self.url)),
            flat if FLAT_URL_FIELDS.contains(&flat) => Err(retired_navigation_field(owner, flat)),
            other => Err(NavigationError::NavigationShape {
                message: format!("{}.{} does not exist", owner, other),
            }),
        }
    }
}

/// A navigation as observers see it
#[derive(Debug)]
pub struct Navigation {
    /// `None` before the first page committed
    pub from: Option<NavigationTarget>,
    /// `None` when leaving the document
    pub to: Option<NavigationTarget>,
    pub kind: NavigationType,
    /// History delta for popstate navigations
    pub delta: Option<i64>,
    cancelled: AtomicBool,
}

impl Navigation {
    pub fn new(
        from: Option<NavigationTarget>,
        to: Option<NavigationTarget>,
        kind: NavigationType,
        delta: Option<i64>,
    ) -> Self {
        Self {
            from,
            to,
            kind,
            delta,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Prevent the navigation (before-navigate observers only)
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub type NavigationObserver = Arc<dyn Fn(&Navigation) + Send + Sync>;

type ObserverList = Mutex<Vec<(u64, NavigationObserver)>>;

/// Registered observers of one kind
#[derive(Default)]
pub struct Observers {
    list: Arc<ObserverList>,
    next_id: Mutex<u64>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; it stays until the handle unsubscribes it
    pub fn subscribe<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&Navigation) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.list.lock().push((id, Arc::new(observer)));
        ObserverHandle {
            id,
            list: Arc::downgrade(&self.list),
        }
    }

    /// Call every observer in registration order
    ///
    /// Observers are called outside the lock, so one may unsubscribe itself.
    pub fn notify(&self, navigation: &Navigation) {
        let observers: Vec<NavigationObserver> =
            self.list.lock().iter().map(|(_, o)| Arc::clone(o)).collect();
        for observer in observers {
            observer(navigation);
        }
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("len", &self.len()).finish()
    }
}

/// Returned by `before_navigate` / `after_navigate`
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    id: u64,
    list: Weak<ObserverList>,
}

impl ObserverHandle {
    /// Remove the observer; a no-op once the router is gone
    pub fn unsubscribe(&self) {
        if let Some(list) = self.list.upgrade() {
            list.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
