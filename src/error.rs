//! Error handling for the router
//!
//! Provides the navigation error taxonomy, the user-visible error payload and the
//! injectable `handle_error` hook.

use crate::params::RouteParams;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use url::Url;

// ============================================================================
// Navigation Errors
// ============================================================================

/// Errors that can occur while resolving, loading or committing a navigation
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationError {
    /// No route matched the requested path
    NotFound { path: String },

    /// A redirect chain revisited a URL or exceeded the hop limit
    RedirectLoop { location: String },

    /// A load function failed
    Load { message: String },

    /// A load function (or the server) signalled an explicit status and body
    Http { status: u16, body: ErrorPayload },

    /// A fetch was rejected before producing a response
    Network { url: String, message: String },

    /// A retired navigation/load/page field was accessed
    NavigationShape { message: String },

    /// A wire payload could not be decoded
    Serialization { message: String },

    /// A route pattern references a param matcher that was never registered
    MissingMatcher { name: String },

    /// A route pattern could not be compiled
    InvalidPattern { pattern: String, message: String },
}

impl NavigationError {
    /// Create a load error from any message
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    /// Create an HTTP error with a plain message body
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: ErrorPayload::new(message),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Status code this error renders with
    pub fn status(&self) -> u16 {
        match self {
            NavigationError::NotFound { .. } => 404,
            NavigationError::Http { status, .. } => *status,
            _ => 500,
        }
    }
}

impl fmt::Display for NavigationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavigationError::NotFound { path } => write!(f, "Not found: {}", path),
            NavigationError::RedirectLoop { location } => {
                write!(f, "Redirect loop at {}", location)
            }
            NavigationError::Load { message } => write!(f, "Load failed: {}", message),
            NavigationError::Http { status, body } => {
                write!(f, "HTTP {}: {}", status, body.message)
            }
            NavigationError::Network { url, message } => {
                write!(f, "Network failure fetching {}: {}", url, message)
            }
            NavigationError::NavigationShape { message } => write!(f, "{}", message),
            NavigationError::Serialization { message } => {
                write!(f, "Malformed payload: {}", message)
            }
            NavigationError::MissingMatcher { name } => {
                write!(f, "Missing \"{}\" param matcher", name)
            }
            NavigationError::InvalidPattern { pattern, message } => {
                write!(f, "Invalid route pattern {:?}: {}", pattern, message)
            }
        }
    }
}

impl std::error::Error for NavigationError {}

impl From<serde_json::Error> for NavigationError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}

/// Error raised by a load function
///
/// Redirects travel through the error channel so a load function can bail out
/// with `?` at any point, the same way it would for a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Stop loading and navigate to `location` instead
    Redirect { status: u16, location: String },

    /// Loading failed
    Error(NavigationError),
}

impl LoadError {
    /// Redirect with a 307 status
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::Redirect {
            status: 307,
            location: location.into(),
        }
    }

    /// Fail with an explicit status and message
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Error(NavigationError::http(status, message))
    }
}

impl From<NavigationError> for LoadError {
    fn from(error: NavigationError) -> Self {
        Self::Error(error)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Redirect { status, location } => {
                write!(f, "Redirect ({}) to {}", status, location)
            }
            LoadError::Error(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for LoadError {}

// ============================================================================
// Retired fields
// ============================================================================

/// Error for a flat URL field that moved under `url` on navigation targets
pub fn retired_navigation_field(owner: &str, field: &str) -> NavigationError {
    NavigationError::NavigationShape {
        message: format!(
            "The navigation shape changed - {owner}.{field} should now be {owner}.url.{field}"
        ),
    }
}

/// Error for a page snapshot field that was replaced by a `url` property
pub fn retired_page_field(field: &str, replacement: &str) -> NavigationError {
    NavigationError::NavigationShape {
        message: format!("page.{field} has been replaced by page.url.{replacement}"),
    }
}

/// Error for a load event field that no longer exists
pub fn retired_load_field(field: &str) -> NavigationError {
    let message = match field {
        "props" => "Replace `props` with `data`".to_string(),
        "session" => "session is no longer available".to_string(),
        "stuff" => "Remove `stuff`, use `parent()` instead".to_string(),
        other => format!("{other} is not available on a load event"),
    };
    NavigationError::NavigationShape { message }
}

// ============================================================================
// Error payloads and the error hook
// ============================================================================

/// User-visible error body rendered by error pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human readable message
    pub message: String,

    /// Any extra fields the error hook chose to expose
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ErrorPayload {
    /// Payload with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// Attach an extra field
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// What the error hook knows about the failing request
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub url: Url,
    pub params: RouteParams,
    pub route_id: Option<String>,
}

/// Injectable `handle_error` hook
///
/// Called for every uncaught load/render error. The returned payload becomes the
/// user-visible error; returning `None` falls back to a generic message.
pub type ErrorHook =
    Arc<dyn Fn(&NavigationError, &ErrorContext) -> Option<ErrorPayload> + Send + Sync>;

/// Turn an error into the payload an error page renders
///
/// Explicit HTTP errors carry their own body and bypass the hook.
pub fn error_payload(
    error: &NavigationError,
    context: &ErrorContext,
    hook: Option<&ErrorHook>,
) -> ErrorPayload {
    if let NavigationError::Http { body, .. } = error {
        return body.clone();
    }

    hook.and_then(|hook| hook(error, context))
        .unwrap_or_else(|| {
            if context.route_id.is_some() {
                ErrorPayload::new("Internal Error")
            } else {
                ErrorPayload::new("Not Found")
            }
        })
}

// ============================================================================
// Tests
// ============================================================================
