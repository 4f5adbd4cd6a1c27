//! Per-route rate limit rules and matching.
//!
//! Rules override the global threshold and window for the routes they
//! match. When several rules match a request the most specific one wins:
//! an exact path beats any prefix, and a longer prefix beats a shorter one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Longest accepted window, in seconds (one year).
pub const MAX_WINDOW_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Longest accepted window.
pub const MAX_WINDOW: Duration = Duration::from_secs(MAX_WINDOW_SECONDS);

/// How a rule's path is compared against the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMatch {
    /// The request path must equal the rule path
    #[default]
    Exact,
    /// The request path must start with the rule path on a segment boundary
    Prefix,
}

/// A per-route override of the global rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// The path (or path prefix) this rule protects
    pub path: String,
    /// How `path` is matched
    #[serde(default, rename = "match")]
    pub path_match: PathMatch,
    /// HTTP methods this rule applies to (empty means all methods)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Requests allowed per window
    pub rate_limit_threshold: u64,
    /// Window length in seconds
    pub rate_limit_window_seconds: u64,
}

impl RouteRule {
    /// Check whether this rule applies to a request.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if !self.methods.is_empty()
            && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        {
            return false;
        }

        match self.path_match {
            PathMatch::Exact => path == self.path,
            PathMatch::Prefix => {
                let prefix = self.path.trim_end_matches('/');
                match path.strip_prefix(prefix) {
                    Some(rest) => rest.is_empty() || rest.starts_with('/'),
                    None => false,
                }
            }
        }
    }

    /// Ordering weight: higher is more specific.
    fn specificity(&self) -> (u8, usize, bool) {
        let exact = match self.path_match {
            PathMatch::Exact => 1,
            PathMatch::Prefix => 0,
        };
        (exact, self.path.len(), !self.methods.is_empty())
    }

    /// The limit this rule applies.
    pub fn limit(&self) -> LimitRule {
        LimitRule {
            threshold: self.rate_limit_threshold,
            window: Duration::from_secs(self.rate_limit_window_seconds),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "route rule path must start with '/': {:?}",
                self.path
            )));
        }
        if self.rate_limit_threshold == 0 {
            return Err(GatewayError::Config(format!(
                "route rule {} has a zero rate_limit_threshold",
                self.path
            )));
        }
        if self.rate_limit_window_seconds == 0 {
            return Err(GatewayError::Config(format!(
                "route rule {} has a zero rate_limit_window_seconds",
                self.path
            )));
        }
        if self.rate_limit_window_seconds > MAX_WINDOW_SECONDS {
            return Err(GatewayError::Config(format!(
                "route rule {} rate_limit_window_seconds exceeds {}",
                self.path, MAX_WINDOW_SECONDS
            )));
        }
        Ok(())
    }
}

/// A resolved threshold and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRule {
    /// Maximum requests admitted in one window
    pub threshold: u64,
    /// Length of the window
    pub window: Duration,
}

/// The set of configured route rules.
#[derive(Debug, Clone, Default)]
pub struct RouteRules {
    rules: Vec<RouteRule>,
}

impl RouteRules {
    /// Build a validated rule set.
    pub fn new(rules: Vec<RouteRule>) -> Result<Self> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    /// Find the most specific rule matching a request.
    pub fn find(&self, method: &str, path: &str) -> Option<&RouteRule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(method, path))
            .max_by_key(|rule| rule.specificity())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
