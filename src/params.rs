//! Route parameters, search parameters and path decoding
//!
//! Route params are captured from `[name]` segments of a route pattern; search
//! params come from the URL query string.

use std::collections::BTreeMap;
use url::Url;

/// Characters `decodeURI` leaves escaped because they carry URL structure.
const RESERVED: &[u8] = b";,/?:@&=+$#";

/// Route parameters extracted from path segments
///
/// Ordered by name so two param sets compare and print deterministically.
///
/// # Example
///
/// ```
/// use page_navigator::RouteParams;
///
/// // Route pattern: [version]/[...documentId].html
/// // Matched path:  /v2/guide/intro.html
/// let mut params = RouteParams::new();
/// params.insert("version", "v2");
///
/// assert_eq!(params.get("version"), Some("v2"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams {
    params: BTreeMap<String, String>,
}

impl RouteParams {
    /// Create new empty route params
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a parameter value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Get a parameter and parse it as a specific type
    ///
    /// Returns `None` if the parameter doesn't exist or cannot be parsed.
    pub fn get_as<T>(&self, key: &str) -> Option<T>
    where
        T: std::str::FromStr,
    {
        self.params.get(key)?.parse().ok()
    }

    /// Insert a parameter
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Check if parameter exists
    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Iterate over all parameters in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.params.iter()
    }

    /// Check if parameters are empty
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Get number of parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RouteParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            params: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

// ============================================================================
// Search Parameters
// ============================================================================

/// Search parameters parsed from a URL query string
///
/// Supports multiple values for the same key, kept in order of appearance.
///
/// # Example
///
/// ```
/// use page_navigator::QueryParams;
///
/// let query = QueryParams::from_query_string("page=1&tag=rust&tag=wasm");
///
/// assert_eq!(query.get("page"), Some("1"));
/// assert_eq!(query.get_all("tag"), vec!["rust", "wasm"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Create new empty query params
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a raw query string (without the leading `?`)
    pub fn from_query_string(query: &str) -> Self {
        Self {
            pairs: url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        }
    }

    /// Parse the query of a URL
    pub fn from_url(url: &Url) -> Self {
        Self {
            pairs: url.query_pairs().into_owned().collect(),
        }
    }

    /// Get first value for a parameter
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a parameter
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Get parameter as a specific type
    pub fn get_as<T>(&self, key: &str) -> Option<T>
    where
        T: std::str::FromStr,
    {
        self.get(key)?.parse().ok()
    }

    /// Check if parameter exists
    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// Check if parameters are empty
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of key/value pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

// ============================================================================
// Path decoding
// ============================================================================

/// Decode a pathname the way `decodeURI` does
///
/// Escapes of reserved characters (`%2F`, `%3F`, `%23`, ...) stay encoded so a
/// decoded `/` can never create a new path segment.
pub fn decode_pathname(path: &str) -> String {
    decode_escapes(path, |byte| !RESERVED.contains(&byte))
}

/// Decode the reserved escapes `decode_pathname` left in captured params
pub fn decode_params(params: RouteParams) -> RouteParams {
    params
        .params
        .into_iter()
        .map(|(key, value)| {
            let value = decode_escapes(&value, |byte| RESERVED.contains(&byte));
            (key, value)
        })
        .collect()
}

fn decode_escapes(input: &str, should_decode: impl Fn(u8) -> bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(byte) = hex_pair(bytes[i + 1], bytes[i + 2]) {
                if should_decode(byte) {
                    out.push(byte);
                } else {
                    out.extend_from_slice(&bytes[i..i + 3]);
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let high = (high as char).to_digit(16)?;
    let low = (low as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_params_basic() {
        let mut params = RouteParams::new();
        params.insert("id", "123");

        assert_eq!(params.get("id"), Some("123"));
        assert!(params.contains("id"));
        assert!(!params.contains("missing"));
        assert_eq!(params.get_as::<u32>("id"), Some(123));
    }

    #[test]
    fn test_route_params_equality_ignores_insertion_order() {
        let a: RouteParams = [("a", "1"), ("b", "2")].into_iter().collect();
        let b: RouteParams = [("b", "2"), ("a", "1")].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_query_params_multiple_values() {
        let query = QueryParams::from_query_string("tag=rust&tag=wasm&page=2");

        assert_eq!(query.get_all("tag"), vec!["rust", "wasm"]);
        assert_eq!(query.get_as::<i32>("page"), Some(2));
        assert_eq!(query.len(), 3);
    }

    #[test]
    fn test_query_params_decoding() {
        let url = Url::parse("https://example.com/?q=hello%20world&x=a+b").unwrap();
        let query = QueryParams::from_url(&url);

        assert_eq!(query.get("q"), Some("hello world"));
        assert_eq!(query.get("x"), Some("a b"));
    }

    #[test]
    fn test_decode_pathname_keeps_reserved() {
        assert_eq!(decode_pathname("/caf%C3%A9/a%2Fb"), "/café/a%2Fb");
        assert_eq!(decode_pathname("/what%3F%20now"), "/what%3F now");
    }

    #[test]
    fn test_decode_params_restores_reserved() {
        let params: RouteParams = [("slug", "a%2Fb%3Fc"), ("other", "100%25")]
            .into_iter()
            .collect();
        let decoded = decode_params(params);

        assert_eq!(decoded.get("slug"), Some("a/b?c"));
        // Only reserved escapes are decoded here
        assert_eq!(decoded.get("other"), Some("100%25"));
    }

    #[test]
    fn test_decode_ignores_truncated_escape() {
        assert_eq!(decode_pathname("/bad%2"), "/bad%2");
        assert_eq!(decode_pathname("/bad%zz"), "/bad%zz");
    }
}
