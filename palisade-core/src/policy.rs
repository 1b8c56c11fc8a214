//! Declarative policy evaluation.
//!
//! Every method is a pure function of its input and the current
//! configuration snapshot — no counters, no caches, no clocks beyond the
//! message-age comparison. Origin wildcard patterns are compiled once when
//! the configuration is (re)applied, never per call.

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use crate::config::{ConfigUpdate, RateLimitConfig, SecurityConfig};
use crate::events::{SecurityDecision, SecurityEvent, SecurityEventType, Severity};

const SOURCE: &str = "security_policy";

struct PolicyState {
    config: SecurityConfig,
    /// One compiled matcher per allow-list entry, in entry order.
    origin_matchers: Vec<Regex>,
}

/// Pure rule evaluator over the screening configuration.
pub struct SecurityPolicy {
    state: RwLock<PolicyState>,
}

impl SecurityPolicy {
    pub fn new(config: SecurityConfig) -> Self {
        let origin_matchers = compile_origin_matchers(&config.allowed_origins);
        Self { state: RwLock::new(PolicyState { config, origin_matchers }) }
    }

    /// Validate a URL scheme. Case and a trailing colon are normalized away.
    /// The deny-list wins over the allow-list; `http` is gated by
    /// `allow_insecure_http`; schemes in neither list are rejected.
    pub fn validate_url_scheme(&self, scheme: &str) -> SecurityDecision {
        let normalized = scheme.trim().trim_end_matches(':').to_ascii_lowercase();
        if normalized.is_empty() {
            return SecurityDecision::deny(
                "empty URL scheme",
                SecurityEvent::new(SecurityEventType::UrlValidationFailed, Severity::Warning, SOURCE),
            );
        }

        let state = self.state.read();
        if state.config.blocked_schemes.iter().any(|s| s == &normalized) {
            return SecurityDecision::deny(
                format!("dangerous scheme blocked: {normalized}"),
                SecurityEvent::new(SecurityEventType::DangerousSchemeBlocked, Severity::Error, SOURCE)
                    .detail("scheme", normalized),
            );
        }
        if state.config.allowed_schemes.iter().any(|s| s == &normalized) {
            return SecurityDecision::allow();
        }
        if normalized == "http" {
            if state.config.allow_insecure_http {
                return SecurityDecision::allow();
            }
            return SecurityDecision::deny(
                "insecure http scheme not permitted",
                SecurityEvent::new(SecurityEventType::UrlValidationFailed, Severity::Warning, SOURCE)
                    .detail("scheme", "http"),
            );
        }
        SecurityDecision::deny(
            format!("scheme not in allow-list: {normalized}"),
            SecurityEvent::new(SecurityEventType::UrlValidationFailed, Severity::Warning, SOURCE)
                .detail("scheme", normalized),
        )
    }

    /// Validate an origin against the allow-list. An empty allow-list passes
    /// every origin — the documented permissive development default.
    pub fn validate_origin(&self, origin: &str) -> SecurityDecision {
        let state = self.state.read();
        if state.origin_matchers.is_empty() {
            return SecurityDecision::allow();
        }
        if state.origin_matchers.iter().any(|m| m.is_match(origin)) {
            return SecurityDecision::allow();
        }
        SecurityDecision::deny(
            format!("origin not in allow-list: {origin}"),
            SecurityEvent::new(SecurityEventType::UrlValidationFailed, Severity::Warning, SOURCE)
                .detail("origin", origin),
        )
    }

    /// Reject message timestamps from the future and timestamps older than
    /// the configured maximum age.
    pub fn validate_message_timestamp(&self, timestamp_ms: i64) -> SecurityDecision {
        let age_ms = chrono::Utc::now().timestamp_millis() - timestamp_ms;
        if age_ms < 0 {
            return SecurityDecision::deny(
                "message timestamp is in the future",
                SecurityEvent::new(SecurityEventType::MessageExpired, Severity::Warning, SOURCE)
                    .detail("age_ms", age_ms),
            );
        }
        let max_age = self.state.read().config.message_max_age_ms;
        if age_ms > max_age {
            return SecurityDecision::deny(
                format!("message expired: age {age_ms}ms exceeds {max_age}ms"),
                SecurityEvent::new(SecurityEventType::MessageExpired, Severity::Warning, SOURCE)
                    .detail("age_ms", age_ms)
                    .detail("max_age_ms", max_age),
            );
        }
        SecurityDecision::allow()
    }

    /// Bound the length of a redirect chain. Negative lengths are a caller
    /// bookkeeping fault and are rejected outright.
    pub fn validate_redirect_chain(&self, length: i64) -> SecurityDecision {
        if length < 0 {
            return SecurityDecision::deny(
                "negative redirect chain length",
                SecurityEvent::new(SecurityEventType::NavigationBlocked, Severity::Warning, SOURCE)
                    .detail("chain_length", length),
            );
        }
        let max = self.state.read().config.max_redirect_chain as i64;
        if length > max {
            return SecurityDecision::deny(
                format!("redirect chain too long: {length} > {max}"),
                SecurityEvent::new(SecurityEventType::NavigationBlocked, Severity::Warning, SOURCE)
                    .detail("chain_length", length)
                    .detail("max_redirect_chain", max),
            );
        }
        SecurityDecision::allow()
    }

    /// Read-only copy of the rate-limit windows.
    pub fn rate_limit(&self) -> RateLimitConfig {
        self.state.read().config.navigation_rate_limit
    }

    pub fn lockdown_duration_ms(&self) -> u64 {
        self.state.read().config.lockdown_duration_ms
    }

    pub fn message_max_age_ms(&self) -> i64 {
        self.state.read().config.message_max_age_ms
    }

    pub fn debug_enabled(&self) -> bool {
        self.state.read().config.debug
    }

    /// Snapshot of the full configuration.
    pub fn config(&self) -> SecurityConfig {
        self.state.read().config.clone()
    }

    /// Shallow-merge a partial update into the live configuration and
    /// recompile the origin matchers.
    pub fn update_config(&self, update: ConfigUpdate) {
        let mut state = self.state.write();
        state.config.apply(update);
        state.origin_matchers = compile_origin_matchers(&state.config.allowed_origins);
        debug!(origins = state.config.allowed_origins.len(), "policy configuration updated");
    }
}

/// A `*` segment matches one or more non-slash characters; everything else
/// is literal. Matching is case-insensitive and anchored.
fn compile_origin_matchers(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            let escaped = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join("[^/]+");
            Regex::new(&format!("(?i)^{escaped}$")).ok()
        })
        .collect()
}
