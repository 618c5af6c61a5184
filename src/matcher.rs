//! Route pattern compilation and matching
//!
//! A pattern is a slash-delimited template such as `[version]/[...documentId].html`:
//!
//! - literal text must match exactly
//! - `(group)` segments only group routes and never appear in the URL
//! - `[name]` captures one path segment (never a `/`)
//! - `[name=matcher]` additionally validates the capture with a registered matcher
//! - `[...name]` captures any remainder, slashes included, and may be empty
//!
//! Dynamic parts are lazy and a whole-segment rest part is greedy, so the first
//! successful match is the same one a backtracking regex engine would report.

use crate::error::NavigationError;
use crate::params::RouteParams;
use crate::trace_log;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Validator for a `[name=matcher]` capture
pub type ParamMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Registry of named param matchers
///
/// Matchers are looked up when a pattern is matched, not when it is compiled, so
/// a missing matcher only fails the navigation that needs it.
#[derive(Clone, Default)]
pub struct ParamMatchers {
    matchers: HashMap<String, ParamMatcher>,
}

impl ParamMatchers {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a matcher under `name`
    pub fn register<F>(&mut self, name: impl Into<String>, matcher: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.matchers.insert(name.into(), Arc::new(matcher));
    }

    /// Look up a matcher
    pub fn get(&self, name: &str) -> Option<&ParamMatcher> {
        self.matchers.get(name)
    }
}

impl fmt::Debug for ParamMatchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamMatchers")
            .field("names", &self.matchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A single compiled piece of a pattern
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Text that must appear verbatim
    Literal(String),
    /// `[name]` (one segment, lazy) or `[...name]` inside a segment (lazy, any text)
    Param { rest: bool },
    /// A whole `/[...name]` segment: optional, greedy
    RestSegment,
}

/// A named capture and its optional matcher
#[derive(Debug, Clone, PartialEq)]
struct Capture {
    name: String,
    matcher: Option<String>,
}

/// A compiled route pattern
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePattern {
    source: String,
    tokens: Vec<Token>,
    captures: Vec<Capture>,
    trailing_slash: bool,
}

impl RoutePattern {
    /// Compile a pattern string
    ///
    /// The empty pattern is the root route and matches `/` only.
    pub fn compile(pattern: &str) -> Result<Self, NavigationError> {
        let mut compiled = Self {
            source: pattern.to_string(),
            tokens: Vec::new(),
            captures: Vec::new(),
            trailing_slash: true,
        };

        if pattern.is_empty() {
            compiled.tokens.push(Token::Literal("/".to_string()));
            compiled.trailing_slash = false;
            return Ok(compiled);
        }

        let segments: Vec<&str> = pattern
            .split('/')
            .filter(|segment| !is_group(segment))
            .collect();
        let last = segments.len().saturating_sub(1);

        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                continue;
            }

            if let Some(inner) = whole_rest(segment) {
                let (name, matcher) = parse_param(pattern, inner)?;
                compiled.captures.push(Capture { name, matcher });
                compiled.tokens.push(Token::RestSegment);
                continue;
            }

            compiled.push_literal("/");
            for (part_index, part) in split_parts(pattern, segment)?.into_iter().enumerate() {
                if part_index % 2 == 1 {
                    let rest = part.starts_with("...");
                    let (name, matcher) = parse_param(pattern, part.trim_start_matches("..."))?;
                    compiled.captures.push(Capture { name, matcher });
                    compiled.tokens.push(Token::Param { rest });
                } else if !part.is_empty() {
                    // A file-like last segment makes the route slash-exact
                    if index == last && part.contains('.') {
                        compiled.trailing_slash = false;
                    }
                    compiled.push_literal(part);
                }
            }
        }

        Ok(compiled)
    }

    /// The pattern string this was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether a trailing `/` is tolerated
    pub fn allows_trailing_slash(&self) -> bool {
        self.trailing_slash
    }

    /// Names of the captured params, in pattern order
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.captures.iter().map(|capture| capture.name.as_str())
    }

    /// Match a decoded pathname
    ///
    /// Returns `Ok(None)` when the path does not match or a matcher rejects a
    /// capture, and an error when a referenced matcher was never registered.
    pub fn matches(
        &self,
        path: &str,
        matchers: &ParamMatchers,
    ) -> Result<Option<RouteParams>, NavigationError> {
        let normalized;
        let path = if path.starts_with('/') {
            path
        } else {
            normalized = format!("/{}", path);
            &normalized
        };

        let mut spans = vec![None; self.captures.len()];
        if !self.match_tokens(0, 0, path, 0, &mut spans) {
            return Ok(None);
        }

        let mut params = RouteParams::new();
        for (capture, span) in self.captures.iter().zip(spans) {
            let value = span.map_or("", |(start, end)| &path[start..end]);

            if let Some(name) = &capture.matcher {
                let matcher = matchers
                    .get(name)
                    .ok_or_else(|| NavigationError::MissingMatcher { name: name.clone() })?;
                if !matcher(value) {
                    trace_log!("Matcher '{}' rejected '{}' for {}", name, value, self.source);
                    return Ok(None);
                }
            }

            params.insert(capture.name.clone(), value);
        }

        Ok(Some(params))
    }

    fn push_literal(&mut self, text: &str) {
        if let Some(Token::Literal(previous)) = self.tokens.last_mut() {
            previous.push_str(text);
        } else {
            self.tokens.push(Token::Literal(text.to_string()));
        }
    }

    fn match_tokens(
        &self,
        token: usize,
        pos: usize,
        input: &str,
        capture: usize,
        spans: &mut [Option<(usize, usize)>],
    ) -> bool {
        let Some(current) = self.tokens.get(token) else {
            let remainder = &input[pos..];
            return remainder.is_empty() || (self.trailing_slash && remainder == "/");
        };

        match current {
            Token::Literal(text) => {
                input[pos..].starts_with(text.as_str())
                    && self.match_tokens(token + 1, pos + text.len(), input, capture, spans)
            }
            Token::Param { rest } => {
                let min = usize::from(!rest);
                let candidates = input[pos..]
                    .char_indices()
                    .map(|(offset, _)| pos + offset)
                    .skip(1)
                    .chain(std::iter::once(input.len()));
                let candidates = std::iter::once(pos).chain(candidates);

                for end in candidates {
                    if end - pos < min {
                        continue;
                    }
                    if !rest && input[pos..end].contains('/') {
                        break;
                    }
                    spans[capture] = Some((pos, end));
                    if self.match_tokens(token + 1, end, input, capture + 1, spans) {
                        return true;
                    }
                }
                false
            }
            Token::RestSegment => {
                if input[pos..].starts_with('/') {
                    let start = pos + 1;
                    let mut ends: Vec<usize> = input[start..]
                        .char_indices()
                        .map(|(offset, _)| start + offset)
                        .chain(std::iter::once(input.len()))
                        .collect();
                    ends.dedup();
                    for &end in ends.iter().rev() {
                        spans[capture] = Some((start, end));
                        if self.match_tokens(token + 1, end, input, capture + 1, spans) {
                            return true;
                        }
                    }
                }
                spans[capture] = None;
                self.match_tokens(token + 1, pos, input, capture + 1, spans)
            }
        }
    }
}

fn is_group(segment: &str) -> bool {
    segment.len() > 2 && segment.starts_with('(') && segment.ends_with(')')
}

fn whole_rest(segment: &str) -> Option<&str> {
    let inner = segment.strip_prefix("[...")?.strip_suffix(']')?;
    (!inner.contains('[') && !inner.contains(']')).then_some(inner)
}

/// Split a segment into alternating literal / param parts
///
/// Even indices are literal text, odd indices the contents of `[...]`.
fn split_parts<'a>(pattern: &str, segment: &'a str) -> Result<Vec<&'a str>, NavigationError> {
    let mut parts = Vec::new();
    let mut rest = segment;

    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        // The param body is at least one character long
        let close = after
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == ']')
            .map(|(offset, _)| offset)
            .ok_or_else(|| NavigationError::InvalidPattern {
                pattern: pattern.to_string(),
                message: format!("unclosed param in segment {:?}", segment),
            })?;
        parts.push(&rest[..open]);
        parts.push(&after[..close]);
        rest = &after[close + 1..];
    }
    parts.push(rest);

    Ok(parts)
}

fn parse_param(pattern: &str, body: &str) -> Result<(String, Option<String>), NavigationError> {
    let (name, matcher) = match body.split_once('=') {
        Some((name, matcher)) => (name, Some(matcher)),
        None => (body, None),
    };

    let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid(name) || !matcher.map_or(true, valid) {
        return Err(NavigationError::InvalidPattern {
            pattern: pattern.to_string(),
            message: format!(
                "Invalid param: {}. Params and matcher names can only have underscores and alphanumeric characters.",
                body
            ),
        });
    }

    Ok((name.to_string(), matcher.map(str::to_string)))
}
