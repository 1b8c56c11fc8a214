//! Screening configuration.
//!
//! The configuration is immutable by convention — live updates go through
//! [`ConfigUpdate`], an explicit partial-update value applied as a shallow
//! merge, never through deep mutation of shared state.

use serde::{Deserialize, Serialize};

/// One sliding rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_ms: i64,
    pub max_requests: usize,
}

/// The two independent sliding windows applied to navigation requests:
/// a short burst window and a longer sustained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub short_window: RateWindow,
    pub long_window: RateWindow,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            short_window: RateWindow { window_ms: 1_000, max_requests: 30 },
            long_window: RateWindow { window_ms: 60_000, max_requests: 200 },
        }
    }
}

/// Recognized options of the screening layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Origin allow-list. Empty means every origin passes — a documented
    /// development default, not an oversight. A `*` segment matches one or
    /// more non-slash characters, case-insensitively.
    pub allowed_origins: Vec<String>,
    /// Explicit scheme deny-list; takes precedence over the allow-list.
    pub blocked_schemes: Vec<String>,
    /// Scheme allow-list. `http` is additionally gated by
    /// `allow_insecure_http`; schemes in neither list are rejected.
    pub allowed_schemes: Vec<String>,
    /// Permits the `http` scheme (development convenience).
    pub allow_insecure_http: bool,
    /// Duration of an activated lockdown before auto-release.
    pub lockdown_duration_ms: u64,
    /// Maximum age of a timestamped bridge message.
    pub message_max_age_ms: i64,
    /// Sliding windows for navigation rate limiting.
    pub navigation_rate_limit: RateLimitConfig,
    /// Maximum redirect hops per logical navigation.
    pub max_redirect_chain: usize,
    /// Enables verbose logging and the behavioral-analysis layer.
    pub debug: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            blocked_schemes: vec![
                "javascript".into(),
                "data".into(),
                "file".into(),
                "blob".into(),
                "vbscript".into(),
            ],
            allowed_schemes: vec!["https".into(), "app".into()],
            allow_insecure_http: false,
            lockdown_duration_ms: 30_000,
            message_max_age_ms: 60_000,
            navigation_rate_limit: RateLimitConfig::default(),
            max_redirect_chain: 5,
            debug: false,
        }
    }
}

/// Partial configuration update. Fields left `None` keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub allowed_origins: Option<Vec<String>>,
    pub blocked_schemes: Option<Vec<String>>,
    pub allowed_schemes: Option<Vec<String>>,
    pub allow_insecure_http: Option<bool>,
    pub lockdown_duration_ms: Option<u64>,
    pub message_max_age_ms: Option<i64>,
    pub navigation_rate_limit: Option<RateLimitConfig>,
    pub max_redirect_chain: Option<usize>,
    pub debug: Option<bool>,
}

impl SecurityConfig {
    /// Shallow-merge `update` into this configuration.
    pub fn apply(&mut self, update: ConfigUpdate) {
        if let Some(v) = update.allowed_origins {
            self.allowed_origins = v;
        }
        if let Some(v) = update.blocked_schemes {
            self.blocked_schemes = v;
        }
        if let Some(v) = update.allowed_schemes {
            self.allowed_schemes = v;
        }
        if let Some(v) = update.allow_insecure_http {
            self.allow_insecure_http = v;
        }
        if let Some(v) = update.lockdown_duration_ms {
            self.lockdown_duration_ms = v;
        }
        if let Some(v) = update.message_max_age_ms {
            self.message_max_age_ms = v;
        }
        if let Some(v) = update.navigation_rate_limit {
            self.navigation_rate_limit = v;
        }
        if let Some(v) = update.max_redirect_chain {
            self.max_redirect_chain = v;
        }
        if let Some(v) = update.debug {
            self.debug = v;
        }
    }
}
