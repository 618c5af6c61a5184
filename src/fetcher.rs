//! Requests, responses and the replaying fetcher handed to load functions
//!
//! While the app hydrates, requests are answered from payloads the server
//! embedded in the document (so load functions see exactly what the server saw)
//! and those payloads seed the [`FetchCache`]. Afterwards the cache is consulted
//! before the network. Any request that is not a plain read evicts its URL.

use crate::cache::FetchCache;
use crate::codec::{self, Value};
use crate::error::NavigationError;
use crate::platform::Clock;
use crate::trace_log;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

// ============================================================================
// Body hashing
// ============================================================================

/// djb2 over UTF-16 code units, last unit first, rendered in base 36
///
/// Matches the hash the server writes into `data-hash` for requests with a body.
pub fn hash(text: &str) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    djb2(units.into_iter().rev().map(u32::from))
}

/// djb2 over raw bytes, last byte first, rendered in base 36
pub fn hash_bytes(bytes: &[u8]) -> String {
    djb2(bytes.iter().rev().map(|&b| u32::from(b)))
}

fn djb2(units: impl Iterator<Item = u32>) -> String {
    let hash = units.fold(5381_i32, |hash, unit| hash.wrapping_mul(33) ^ unit as i32);
    to_base36(hash as u32)
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

// ============================================================================
// Requests and responses
// ============================================================================

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    /// Reads that never change server state and so never evict cache entries
    pub fn is_safe(self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Hash of the body, used to tell apart requests to the same URL
    pub fn body_hash(&self) -> Option<String> {
        self.body.as_deref().map(hash)
    }
}

/// A received response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// Status in the 2xx range
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header with this name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Parse the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NavigationError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// `max-age` from `cache-control`, in seconds
    fn max_age(&self) -> Option<u64> {
        let control = self.header("cache-control")?;
        if control.contains("no-store") {
            return None;
        }
        control.split(',').find_map(|directive| {
            directive
                .trim()
                .strip_prefix("max-age=")
                .and_then(|seconds| seconds.parse().ok())
        })
    }
}

// ============================================================================
// Host traits
// ============================================================================

/// The network
///
/// Implementations return `NavigationError::Network` when the request could not
/// be made at all. HTTP error statuses are ordinary responses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NavigationError>;
}

/// Response the server inlined into the document
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedResponse {
    /// Codec wire format of `{body, status, statusText, headers}`
    pub text: String,
    /// How long the response may be replayed after hydration
    pub ttl_seconds: Option<u64>,
}

impl EmbeddedResponse {
    /// Rebuild the response
    pub fn to_response(&self) -> Result<Response, NavigationError> {
        let graph = codec::decode(&self.text)?;

        let body = graph
            .get("body")
            .and_then(Value::as_str)
            .ok_or_else(|| NavigationError::serialization("embedded response has no body"))?;
        let status = graph
            .get("status")
            .and_then(Value::as_f64)
            .map_or(200, |status| status as u16);

        let mut response = Response::new(status, body);
        if let Some(text) = graph.get("statusText").and_then(Value::as_str) {
            response.status_text = text.to_string();
        }
        if let Some(headers) = graph.get("headers").and_then(|h| graph.entries(h)) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    response.headers.push((name.clone(), value.to_string()));
                }
            }
        }

        Ok(response)
    }
}

/// Lookup of responses embedded in the initial document
pub trait EmbeddedPayloads: Send + Sync {
    /// Find the payload recorded for `url` (and `body_hash`, for bodied requests)
    fn find(&self, url: &str, body_hash: Option<&str>) -> Option<EmbeddedResponse>;
}

// ============================================================================
// Fetcher
// ============================================================================

/// The `fetch` load functions use
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    embedded: Option<Arc<dyn EmbeddedPayloads>>,
    cache: Mutex<FetchCache>,
    clock: Arc<dyn Clock>,
    hydrating: AtomicBool,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            transport,
            embedded: None,
            cache: Mutex::new(FetchCache::with_capacity(capacity)),
            clock,
            hydrating: AtomicBool::new(false),
        }
    }

    /// Replay these payloads while hydrating
    pub fn with_embedded(mut self, embedded: Arc<dyn EmbeddedPayloads>) -> Self {
        self.embedded = Some(embedded);
        self
    }

    pub fn set_hydrating(&self, hydrating: bool) {
        self.hydrating.store(hydrating, Ordering::SeqCst);
    }

    pub fn is_hydrating(&self) -> bool {
        self.hydrating.load(Ordering::SeqCst)
    }

    /// Straight to the network, no cache involved
    pub async fn fetch_uncached(&self, request: Request) -> Result<Response, NavigationError> {
        self.transport.fetch(request).await
    }

    /// Fetch through the embedded payloads and the cache
    pub async fn fetch(&self, request: Request) -> Result<Response, NavigationError> {
        let url = request.url.to_string();
        let body_hash = request.body_hash();

        if !request.method.is_safe() {
            self.cache.lock().evict(&url);
        }

        if self.is_hydrating() {
            if let Some(response) = self.replay_embedded(&url, body_hash.as_deref())? {
                return Ok(response);
            }
            return self.transport.fetch(request).await;
        }

        if request.method.is_safe() {
            let now = self.clock.now_ms();
            if let Some(cached) = self.cache.lock().get(&url, body_hash.as_deref(), now) {
                return Ok(cached);
            }
        }

        let method = request.method;
        let response = self.transport.fetch(request).await?;

        if method == Method::Get && response.ok() {
            if let Some(max_age) = response.max_age() {
                let now = self.clock.now_ms();
                self.cache.lock().put(
                    &url,
                    body_hash.as_deref(),
                    response.clone(),
                    max_age.saturating_mul(1_000),
                    now,
                );
            }
        }

        Ok(response)
    }

    fn replay_embedded(
        &self,
        url: &str,
        body_hash: Option<&str>,
    ) -> Result<Option<Response>, NavigationError> {
        let Some(embedded) = self.embedded.as_ref().and_then(|e| e.find(url, body_hash)) else {
            return Ok(None);
        };

        trace_log!("Replaying embedded response for {}", url);
        let response = embedded.to_response()?;
        if let Some(ttl) = embedded.ttl_seconds {
            let now = self.clock.now_ms();
            self.cache
                .lock()
                .put(url, body_hash, response.clone(), ttl.saturating_mul(1_000), now);
        }

        Ok(Some(response))
    }

    /// Number of cached responses
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("hydrating", &self.is_hydrating())
            .field("cached", &self.cached())
            .finish()
    }
}
