//! Router configuration
//!
//! The host page embeds the configuration as JSON next to the hydration data, so
//! every field has a default and unknown fields are ignored.

use crate::error::NavigationError;
use serde::Deserialize;

/// How trailing slashes are normalised before matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingSlash {
    /// Strip a trailing `/`
    #[default]
    Never,
    /// Append a `/` (the root path is left alone)
    Always,
    /// Leave the path unchanged
    Ignore,
}

impl TrailingSlash {
    /// Apply the policy to a pathname
    pub fn normalize(self, pathname: &str) -> String {
        if pathname == "/" {
            return pathname.to_string();
        }

        match self {
            TrailingSlash::Ignore => pathname.to_string(),
            TrailingSlash::Never => pathname
                .strip_suffix('/')
                .unwrap_or(pathname)
                .to_string(),
            TrailingSlash::Always if !pathname.ends_with('/') => format!("{}/", pathname),
            TrailingSlash::Always => pathname.to_string(),
        }
    }
}

/// Router configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Path prefix the app is mounted under (no trailing slash, `""` for root)
    pub base: String,

    /// Trailing slash policy
    pub trailing_slash: TrailingSlash,

    /// Suffix appended to a pathname to reach its server data endpoint
    pub data_suffix: String,

    /// Redirects a single navigation may follow before it is a loop
    pub max_redirects: usize,

    /// Entries kept by the post-hydration fetch cache
    pub fetch_cache_capacity: usize,

    /// Session storage key for scroll positions
    pub scroll_storage_key: String,

    /// History state key holding the navigation index
    pub history_index_key: String,
}

impl RouterConfig {
    /// Parse a configuration blob
    pub fn from_json(json: &str) -> Result<Self, NavigationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the base path
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Set the trailing slash policy
    pub fn with_trailing_slash(mut self, policy: TrailingSlash) -> Self {
        self.trailing_slash = policy;
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base: String::new(),
            trailing_slash: TrailingSlash::Never,
            data_suffix: "/__data.json".to_string(),
            max_redirects: 10,
            fetch_cache_capacity: 256,
            scroll_storage_key: "sveltekit:scroll".to_string(),
            history_index_key: "sveltekit:index".to_string(),
        }
    }
}
