//! Stateful navigation screening for one content surface.
//!
//! Holds the transient per-surface state the pure validators cannot: a
//! dual-window rate tracker, the current redirect chain, and the last-seen
//! origin. Lockdown and threat-level gates run first so a locked-down
//! surface rejects uniformly regardless of the target.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use palisade_core::config::RateLimitConfig;
use palisade_core::events::{SecurityDecision, SecurityEvent, SecurityEventType, Severity, ThreatLevel};
use palisade_core::{SecurityContext, SecurityPolicy};

use crate::types::NavigationRequest;
use crate::url_validator::UrlValidator;

const SOURCE: &str = "navigation_guard";

/// Recent request instants, pruned to the union of the configured windows.
struct RateTracker {
    timestamps: VecDeque<i64>,
}

impl RateTracker {
    fn new() -> Self {
        Self { timestamps: VecDeque::new() }
    }

    /// Check both sliding windows; the request is recorded only after
    /// passing both, so rejected requests do not consume budget.
    fn check_and_record(&mut self, now_ms: i64, cfg: &RateLimitConfig) -> Result<(), String> {
        let horizon = now_ms - cfg.short_window.window_ms.max(cfg.long_window.window_ms);
        while self.timestamps.front().is_some_and(|&t| t <= horizon) {
            self.timestamps.pop_front();
        }

        for (label, window) in [("short", cfg.short_window), ("long", cfg.long_window)] {
            let cutoff = now_ms - window.window_ms;
            let count = self.timestamps.iter().filter(|&&t| t > cutoff).count();
            if count >= window.max_requests {
                return Err(format!(
                    "{label} window exceeded: {count} requests in {}ms (max {})",
                    window.window_ms, window.max_requests
                ));
            }
        }

        self.timestamps.push_back(now_ms);
        Ok(())
    }
}

/// Navigation guard report counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NavigationGuardReport {
    pub total_validated: u64,
    pub total_blocked: u64,
    pub total_rate_limited: u64,
    pub total_redirect_violations: u64,
}

pub struct NavigationGuard {
    context: Arc<SecurityContext>,
    policy: Arc<SecurityPolicy>,
    validator: Arc<UrlValidator>,
    rate: Mutex<RateTracker>,
    redirect_chain: Mutex<Vec<String>>,
    last_origin: Mutex<Option<String>>,
    total_validated: AtomicU64,
    total_blocked: AtomicU64,
    total_rate_limited: AtomicU64,
    total_redirect_violations: AtomicU64,
}

impl NavigationGuard {
    pub fn new(
        context: Arc<SecurityContext>,
        policy: Arc<SecurityPolicy>,
        validator: Arc<UrlValidator>,
    ) -> Self {
        Self {
            context,
            policy,
            validator,
            rate: Mutex::new(RateTracker::new()),
            redirect_chain: Mutex::new(Vec::new()),
            last_origin: Mutex::new(None),
            total_validated: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            total_rate_limited: AtomicU64::new(0),
            total_redirect_violations: AtomicU64::new(0),
        }
    }

    pub fn validate(&self, request: &NavigationRequest) -> SecurityDecision {
        self.total_validated.fetch_add(1, Ordering::Relaxed);
        let decision = self.run_checks(request);
        if !decision.allowed {
            self.total_blocked.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    fn run_checks(&self, request: &NavigationRequest) -> SecurityDecision {
        // 1. Lockdown rejects everything.
        if self.context.is_lockdown_active() {
            return SecurityDecision::deny(
                "navigation rejected: lockdown active",
                SecurityEvent::new(SecurityEventType::NavigationBlocked, Severity::Warning, SOURCE)
                    .detail("url", request.url.clone())
                    .detail("lockdown", true),
            );
        }

        // 2. So does a CRITICAL threat level.
        if self.context.threat_level() == ThreatLevel::Critical {
            return SecurityDecision::deny(
                "navigation rejected: threat level critical",
                SecurityEvent::new(SecurityEventType::NavigationBlocked, Severity::Warning, SOURCE)
                    .detail("url", request.url.clone()),
            );
        }

        // 3. Rate limiting, before any per-URL work.
        let now_ms = chrono::Utc::now().timestamp_millis();
        let rate_cfg = self.policy.rate_limit();
        if let Err(reason) = self.rate.lock().check_and_record(now_ms, &rate_cfg) {
            self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
            warn!(url = %request.url, reason = %reason, "navigation rate limited");
            return SecurityDecision::deny(
                format!("rate limit exceeded: {reason}"),
                SecurityEvent::new(SecurityEventType::RateLimitExceeded, Severity::Warning, SOURCE)
                    .detail("url", request.url.clone())
                    .detail("reason", reason),
            );
        }

        // 4. Full URL screening.
        let url_decision = self.validator.validate(&request.url);
        if !url_decision.allowed {
            return url_decision;
        }

        // 5. Redirect chain bookkeeping.
        if request.is_redirect {
            let mut chain = self.redirect_chain.lock();
            if chain.iter().any(|u| u == &request.url) {
                self.total_redirect_violations.fetch_add(1, Ordering::Relaxed);
                let length = chain.len();
                chain.clear();
                return SecurityDecision::deny(
                    "circular redirect detected",
                    SecurityEvent::new(SecurityEventType::NavigationBlocked, Severity::Warning, SOURCE)
                        .detail("url", request.url.clone())
                        .detail("chain_length", length as i64)
                        .detail("circular", true),
                );
            }
            chain.push(request.url.clone());
            // The chain starts at the initiating URL; hops exclude it.
            let hops = chain.len() as i64 - 1;
            let chain_decision = self.policy.validate_redirect_chain(hops);
            if !chain_decision.allowed {
                self.total_redirect_violations.fetch_add(1, Ordering::Relaxed);
                chain.clear();
                return chain_decision;
            }
        } else {
            let mut chain = self.redirect_chain.lock();
            chain.clear();
            chain.push(request.url.clone());
        }

        // 6. Origin change re-validation, via the verified-origin cache.
        if let Some(origin) = origin_of(&request.url) {
            let changed = self.last_origin.lock().as_deref() != Some(origin.as_str());
            if changed {
                if !self.context.is_origin_cached(&origin) {
                    let origin_decision = self.policy.validate_origin(&origin);
                    if !origin_decision.allowed {
                        return origin_decision;
                    }
                    self.context.cache_verified_origin(&origin);
                }
                *self.last_origin.lock() = Some(origin);
            }
        }

        // 7. Allowed.
        SecurityDecision::allow_with(
            SecurityEvent::new(SecurityEventType::NavigationAllowed, Severity::Info, SOURCE)
                .detail("url", request.url.clone())
                .detail("is_redirect", request.is_redirect),
        )
    }

    /// Clear all per-surface transient state.
    pub fn reset(&self) {
        self.rate.lock().timestamps.clear();
        self.redirect_chain.lock().clear();
        *self.last_origin.lock() = None;
    }

    pub fn redirect_chain_len(&self) -> usize {
        self.redirect_chain.lock().len()
    }

    pub fn report(&self) -> NavigationGuardReport {
        NavigationGuardReport {
            total_validated: self.total_validated.load(Ordering::Relaxed),
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            total_rate_limited: self.total_rate_limited.load(Ordering::Relaxed),
            total_redirect_violations: self.total_redirect_violations.load(Ordering::Relaxed),
        }
    }
}

fn origin_of(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
