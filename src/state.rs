//! Navigation state and the page snapshot handed to views

use crate::codec::PageData;
use crate::error::{retired_page_field, ErrorPayload, NavigationError};
use crate::loader::BranchNode;
use crate::params::RouteParams;
use crate::route::{CompiledRoute, PageNode};
use std::sync::Arc;
use url::Url;

/// The committed result of the last completed navigation
///
/// Owned by the controller and replaced wholesale; readers holding an `Arc` to
/// an older state keep seeing that state unchanged.
#[derive(Debug, Clone, Default)]
pub struct NavigationState {
    /// `None` until the first navigation commits
    pub url: Option<Url>,
    pub params: RouteParams,
    /// One entry per load chain position, `None` where the chain has a gap
    pub branch: Vec<Option<Arc<BranchNode>>>,
    pub error: Option<ErrorPayload>,
    pub route: Option<Arc<CompiledRoute>>,
}

impl NavigationState {
    pub fn route_id(&self) -> Option<&str> {
        self.route.as_ref().map(|route| route.id.as_str())
    }
}

/// How a navigation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Ok,
    Error,
}

/// Where the controller is in handling the latest accepted intent
///
/// Every navigation ends back in `Idle`; how it ended is reported separately
/// as a [`Settled`] outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NavigationPhase {
    /// Ready for the next intent
    #[default]
    Idle,
    /// Resolving the target URL to a route
    Matching,
    /// Waiting for the load chain
    Loading,
    /// Applying the result to history, renderer and scroll
    Committing,
}

impl NavigationPhase {
    /// Whether an intent is between acceptance and commit
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            NavigationPhase::Matching | NavigationPhase::Loading | NavigationPhase::Committing
        )
    }
}

/// A field read through one of the `field(name)` accessors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field<'a> {
    Url(&'a Url),
    Params(&'a RouteParams),
    RouteId(Option<&'a str>),
    Status(u16),
    Error(Option<&'a ErrorPayload>),
    Data(Option<&'a PageData>),
    Form(Option<&'a PageData>),
}

/// What views see as the current page
#[derive(Debug, Clone, PartialEq)]
pub struct PageSnapshot {
    pub url: Url,
    pub params: RouteParams,
    pub route_id: Option<String>,
    pub status: u16,
    pub error: Option<ErrorPayload>,
    /// Data of every branch position merged root first
    pub data: PageData,
    pub form: Option<PageData>,
}

impl PageSnapshot {
    /// Read a field by name
    ///
    /// `origin`, `path` and `query` moved under `url` and are reported as
    /// `NavigationShape` errors.
    pub fn field(&self, name: &str) -> Result<Field<'_>, NavigationError> {
        match name {
            "url" => Ok(Field::Url(&self.url)),
            "params" => Ok(Field::Params(&self.params)),
            "route_id" | "routeId" => Ok(Field::RouteId(self.route_id.as_deref())),
            "status" => Ok(Field::Status(self.status)),
            "error" => Ok(Field::Error(self.error.as_ref())),
            "data" => Ok(Field::Data(Some(&self.data))),
            "form" => Ok(Field::Form(self.form.as_ref())),
            "origin" => Err(retired_page_field("origin", "origin")),
            "path" => Err(retired_page_field("path", "pathname")),
            "query" => Err(retired_page_field("query", "searchParams")),
            other => Err(NavigationError::NavigationShape {
                message: format!("page.{} does not exist", other),
            }),
        }
    }
}

/// Everything the renderer needs for one commit
#[derive(Debug, Clone, Default)]
pub struct RenderProps {
    /// Components from the root layout down to the leaf (or error page)
    pub components: Vec<Arc<PageNode>>,
    /// Cumulative data per component; `None` where the level did not change
    pub data: Vec<Option<PageData>>,
    /// Set when a form action produced a new value
    pub form: Option<PageData>,
    /// Set when anything observable about the page changed
    pub page: Option<PageSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ValueGraph;

    fn snapshot() -> PageSnapshot {
        PageSnapshot {
            url: Url::parse("https://example.com/v2/guide.html?x=1").unwrap(),
            params: [("version", "v2")].into_iter().collect(),
            route_id: Some("[version]/[...documentId].html".to_string()),
            status: 200,
            error: None,
            data: ValueGraph::object(),
            form: None,
        }
    }

    #[test]
    fn test_page_fields() {
        let page = snapshot();
        assert_eq!(page.field("status").unwrap(), Field::Status(200));
        assert_eq!(
            page.field("routeId").unwrap(),
            Field::RouteId(Some("[version]/[...documentId].html"))
        );
        assert!(matches!(page.field("url").unwrap(), Field::Url(url) if url.path() == "/v2/guide.html"));
    }

    #[test]
    fn test_retired_page_fields() {
        let page = snapshot();
        assert_eq!(
            page.field("path").unwrap_err().to_string(),
            "page.path has been replaced by page.url.pathname"
        );
        assert_eq!(
            page.field("query").unwrap_err().to_string(),
            "page.query has been replaced by page.url.searchParams"
        );
        assert!(matches!(
            page.field("origin"),
            Err(NavigationError::NavigationShape { .. })
        ));
    }

    #[test]
    fn test_phase_busy() {
        assert!(!NavigationPhase::Idle.is_busy());
        assert!(NavigationPhase::Loading.is_busy());
        assert!(NavigationPhase::Committing.is_busy());
        assert_eq!(NavigationPhase::default(), NavigationPhase::Idle);
    }
}
