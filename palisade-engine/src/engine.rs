//! The security engine — the only surface exposed to the host application.
//!
//! Owns one instance of every screening component, routes validation calls,
//! records every decision in the audit logger, and drives the process-wide
//! threat-level / lockdown state machine. Critical events of three kinds
//! (invalid token, nonce reuse, injection detected) escalate into lockdown;
//! lockdown auto-releases through a cancellable one-shot timer, of which at
//! most one is pending per engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use palisade_core::events::{
    SecurityDecision, SecurityEvent, SecurityEventType, Severity, ThreatLevel,
};
use palisade_core::{ConfigUpdate, SecurityConfig, SecurityContext, SecurityLogger, SecurityPolicy};

use crate::injection_guard::{InjectionGuard, InjectionGuardReport};
use crate::navigation_guard::{NavigationGuard, NavigationGuardReport};
use crate::scheduler::OneShotTimer;
use crate::types::{BridgeMessage, CodeSource, NavigationRequest};
use crate::url_validator::UrlValidator;

const SOURCE: &str = "security_engine";

/// Listener invoked on every actual threat-level change.
pub type ThreatLevelListener = Arc<dyn Fn(ThreatLevel) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    callback: ThreatLevelListener,
}

/// Aggregated counters across the engine's components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineReport {
    pub threat_level: Option<ThreatLevel>,
    pub lockdown_active: bool,
    pub urls_checked: u64,
    pub urls_blocked: u64,
    pub navigation: NavigationGuardReport,
    pub injection: InjectionGuardReport,
    pub bridge_messages_validated: u64,
    pub bridge_messages_blocked: u64,
    pub events_logged: u64,
}

struct EngineCore {
    context: Arc<SecurityContext>,
    policy: Arc<SecurityPolicy>,
    url_validator: Arc<UrlValidator>,
    navigation_guard: NavigationGuard,
    injection_guard: InjectionGuard,
    logger: Arc<SecurityLogger>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
    /// Level listeners last saw; gates exactly-once notification.
    notified_level: Mutex<ThreatLevel>,
    /// At most one pending auto-release timer; replaced on re-activation.
    lockdown_timer: Mutex<Option<OneShotTimer>>,
    /// Stale-callback fence: a fired timer whose generation no longer
    /// matches is a no-op.
    lockdown_generation: AtomicU64,
    bridge_validated: AtomicU64,
    bridge_blocked: AtomicU64,
}

/// Cheaply cloneable handle to one engine instance. Construct one per
/// content surface; "reset" is constructing a new engine.
#[derive(Clone)]
pub struct SecurityEngine {
    core: Arc<EngineCore>,
}

impl SecurityEngine {
    pub fn new(config: SecurityConfig) -> Self {
        let debug = config.debug;
        let context = Arc::new(SecurityContext::new());
        let policy = Arc::new(SecurityPolicy::new(config));
        let url_validator = Arc::new(UrlValidator::new(policy.clone()));
        let navigation_guard =
            NavigationGuard::new(context.clone(), policy.clone(), url_validator.clone());
        let core = Arc::new(EngineCore {
            context,
            policy,
            url_validator,
            navigation_guard,
            injection_guard: InjectionGuard::new(),
            logger: Arc::new(SecurityLogger::with_default_capacity(debug)),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            notified_level: Mutex::new(ThreatLevel::Normal),
            lockdown_timer: Mutex::new(None),
            lockdown_generation: AtomicU64::new(0),
            bridge_validated: AtomicU64::new(0),
            bridge_blocked: AtomicU64::new(0),
        });
        info!(session = %core.context.session().session_id, "security engine initialized");
        Self { core }
    }

    // ── Validation surface ───────────────────────────────────────────────

    /// Screen a URL without navigation bookkeeping.
    pub fn validate_url(&self, url: &str) -> SecurityDecision {
        let decision = self.core.url_validator.validate(url);
        self.core.record(&decision);
        decision
    }

    /// Screen a navigation request (rate limits, redirect chains, origin
    /// changes included).
    pub fn validate_navigation(&self, request: &NavigationRequest) -> SecurityDecision {
        let decision = self.core.navigation_guard.validate(request);
        self.core.record(&decision);
        decision
    }

    /// Screen an inbound bridge message: lockdown, then token, then nonce,
    /// then timestamp, short-circuiting in that order.
    pub fn validate_bridge_message(&self, message: &BridgeMessage) -> SecurityDecision {
        self.core.bridge_validated.fetch_add(1, Ordering::Relaxed);
        let decision = self.core.check_bridge_message(message);
        if !decision.allowed {
            self.core.bridge_blocked.fetch_add(1, Ordering::Relaxed);
        }
        self.core.record(&decision);
        decision
    }

    /// Screen code before the content surface may evaluate it.
    pub fn validate_code(&self, code: &str, source: CodeSource) -> SecurityDecision {
        if self.core.policy.debug_enabled() {
            let signals = self.core.injection_guard.intent_signals(code);
            if !signals.is_empty() {
                self.core.logger.log(
                    SecurityEvent::new(
                        SecurityEventType::MaliciousIntentDetected,
                        Severity::Warning,
                        SOURCE,
                    )
                    .detail("signals", signals)
                    .detail("code_source", format!("{source:?}")),
                );
            }
        }
        let decision = self.core.injection_guard.validate_code(code, source);
        self.core.record(&decision);
        decision
    }

    /// Bundle for wiring a content surface: the navigation predicate plus
    /// the boundary script to inject before any page content loads.
    pub fn content_surface_handlers(&self) -> ContentSurfaceHandlers {
        ContentSurfaceHandlers {
            boundary_script: self
                .core
                .injection_guard
                .generate_boundary_script(self.core.context.token()),
            engine: self.clone(),
        }
    }

    // ── State surface ────────────────────────────────────────────────────

    pub fn security_token(&self) -> String {
        self.core.context.token().to_string()
    }

    pub fn session_id(&self) -> String {
        self.core.context.session().session_id.clone()
    }

    pub fn threat_level(&self) -> ThreatLevel {
        self.core.context.threat_level()
    }

    /// Register a threat-level listener. Returns an id for
    /// [`off_threat_level_change`](Self::off_threat_level_change).
    pub fn on_threat_level_change(&self, listener: ThreatLevelListener) -> u64 {
        let id = self.core.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.core.listeners.write().push(ListenerEntry { id, callback: listener });
        id
    }

    pub fn off_threat_level_change(&self, id: u64) -> bool {
        let mut listeners = self.core.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() < before
    }

    /// Manually enter lockdown for the configured duration.
    pub fn activate_lockdown(&self) {
        let duration = self.core.policy.lockdown_duration_ms();
        self.core.enter_lockdown(duration, "manual");
    }

    /// Manually release an active lockdown and cancel the pending timer.
    pub fn deactivate_lockdown(&self) {
        self.core.leave_lockdown(true);
    }

    pub fn is_lockdown_active(&self) -> bool {
        self.core.context.is_lockdown_active()
    }

    pub fn update_config(&self, update: ConfigUpdate) {
        self.core.policy.update_config(update);
    }

    /// The audit logger, for sink registration and queries.
    pub fn logger(&self) -> &Arc<SecurityLogger> {
        &self.core.logger
    }

    pub fn report(&self) -> EngineReport {
        EngineReport {
            threat_level: Some(self.threat_level()),
            lockdown_active: self.is_lockdown_active(),
            urls_checked: self.core.url_validator.total_checked(),
            urls_blocked: self.core.url_validator.total_blocked(),
            navigation: self.core.navigation_guard.report(),
            injection: self.core.injection_guard.report(),
            bridge_messages_validated: self.core.bridge_validated.load(Ordering::Relaxed),
            bridge_messages_blocked: self.core.bridge_blocked.load(Ordering::Relaxed),
            events_logged: self.core.logger.total_logged(),
        }
    }
}

impl EngineCore {
    fn check_bridge_message(&self, message: &BridgeMessage) -> SecurityDecision {
        // 1. Lockdown drops all bridge traffic; the activation is already on
        // record, so the drop itself carries no event.
        if self.context.is_lockdown_active() {
            return SecurityDecision::deny_without_event("bridge message rejected: lockdown active");
        }

        // 2. Token, exact match.
        let token_ok = message
            .token
            .as_deref()
            .is_some_and(|t| self.context.validate_token(t));
        if !token_ok {
            return SecurityDecision::deny(
                "bridge message carries an invalid token",
                SecurityEvent::new(SecurityEventType::InvalidToken, Severity::Critical, SOURCE)
                    .detail("protocol", message.protocol.clone()),
            );
        }

        // 3. Nonce, single use.
        let nonce_ok = message
            .nonce
            .as_deref()
            .is_some_and(|n| self.context.validate_and_use_nonce(n));
        if !nonce_ok {
            return SecurityDecision::deny(
                "bridge message nonce is missing or already used",
                SecurityEvent::new(SecurityEventType::NonceReuse, Severity::Critical, SOURCE)
                    .detail("protocol", message.protocol.clone()),
            );
        }

        // 4. Timestamp, when present.
        if let Some(ts) = message.timestamp {
            let age_decision = self.policy.validate_message_timestamp(ts);
            if !age_decision.allowed {
                return age_decision;
            }
        }

        SecurityDecision::allow()
    }

    /// Log the decision's event and drive the state machine off denials.
    fn record(self: &Arc<Self>, decision: &SecurityDecision) {
        let Some(event) = &decision.event else { return };
        self.logger.log(event.clone());
        if decision.allowed {
            return;
        }

        let lockdown_trigger = event.severity == Severity::Critical
            && matches!(
                event.event_type,
                SecurityEventType::InvalidToken
                    | SecurityEventType::NonceReuse
                    | SecurityEventType::InjectionDetected
            );
        if lockdown_trigger {
            let duration = self.policy.lockdown_duration_ms();
            self.enter_lockdown(duration, &format!("{:?}", event.event_type));
            return;
        }

        match event.severity {
            Severity::Warning => self.raise_threat(ThreatLevel::Elevated),
            Severity::Error | Severity::Critical => self.raise_threat(ThreatLevel::High),
            Severity::Info => {}
        }
    }

    /// Raise the threat level; never lowers, and never reaches CRITICAL —
    /// CRITICAL is owned by the lockdown path.
    fn raise_threat(&self, target: ThreatLevel) {
        let current = self.context.threat_level();
        if current >= target || current == ThreatLevel::Critical {
            return;
        }
        self.context.set_threat_level(target);
        self.notify_level(target);
    }

    /// The timer slot mutex serializes every generation change with the
    /// state mutation it guards, so a stale expiry callback can never
    /// deactivate a newer lockdown window. Listener notification happens
    /// outside the lock.
    fn enter_lockdown(self: &Arc<Self>, duration_ms: u64, trigger: &str) {
        {
            let mut slot = self.lockdown_timer.lock();
            let generation = self.lockdown_generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(old) = slot.take() {
                old.cancel();
            }
            self.context.activate_lockdown(duration_ms);

            let weak: Weak<EngineCore> = Arc::downgrade(self);
            *slot = Some(OneShotTimer::schedule(Duration::from_millis(duration_ms), move || {
                if let Some(core) = weak.upgrade() {
                    core.expire_lockdown(generation);
                }
            }));
        }
        warn!(duration_ms, trigger, "lockdown activated");
        self.logger.log_lockdown_activated(duration_ms, trigger);
        self.notify_level(ThreatLevel::Critical);
    }

    /// Auto-release path, reached only from the scheduled timer.
    fn expire_lockdown(&self, generation: u64) {
        {
            let mut slot = self.lockdown_timer.lock();
            if self.lockdown_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            self.lockdown_generation.fetch_add(1, Ordering::SeqCst);
            *slot = None;
            self.context.deactivate_lockdown();
        }
        info!(manual = false, "lockdown deactivated");
        self.logger.log_lockdown_deactivated(false);
        self.notify_level(ThreatLevel::Normal);
    }

    /// Manual release: cancels the pending timer.
    fn leave_lockdown(&self, manual: bool) {
        {
            let mut slot = self.lockdown_timer.lock();
            if let Some(timer) = slot.take() {
                timer.cancel();
            }
            self.lockdown_generation.fetch_add(1, Ordering::SeqCst);
            self.context.deactivate_lockdown();
        }
        info!(manual, "lockdown deactivated");
        self.logger.log_lockdown_deactivated(manual);
        self.notify_level(ThreatLevel::Normal);
    }

    /// Notify listeners exactly once per actual level change.
    fn notify_level(&self, to: ThreatLevel) {
        {
            let mut notified = self.notified_level.lock();
            if *notified == to {
                return;
            }
            let from = *notified;
            *notified = to;
            self.logger.log_threat_level_change(from, to);
        }
        let listeners = self.listeners.read();
        for entry in listeners.iter() {
            (entry.callback)(to);
        }
    }
}

/// What a content surface needs at wiring time: a navigation predicate and
/// the boundary script. The script bakes in the current token, so call
/// [`SecurityEngine::content_surface_handlers`] again whenever the engine
/// (and with it the token) is replaced.
pub struct ContentSurfaceHandlers {
    boundary_script: String,
    engine: SecurityEngine,
}

impl ContentSurfaceHandlers {
    /// Predicate for the surface's load/navigation callback.
    pub fn should_allow_navigation(&self, request: &NavigationRequest) -> bool {
        self.engine.validate_navigation(request).allowed
    }

    /// Script to inject before any page content loads.
    pub fn boundary_script(&self) -> &str {
        &self.boundary_script
    }
}
