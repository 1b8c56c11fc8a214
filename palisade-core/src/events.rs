//! Event vocabulary and decision shapes.
//!
//! Every validation operation in the workspace returns a [`SecurityDecision`];
//! expected rejection paths never panic and never return an error type. The
//! event taxonomy is closed — hosts can exhaustively match on
//! [`SecurityEventType`] instead of parsing reason strings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Severity attached to every security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Coarse four-value indicator of current security posture. `Critical` holds
/// exactly while lockdown is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

/// The closed set of auditable event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    NavigationBlocked,
    NavigationAllowed,
    UrlValidationFailed,
    DangerousSchemeBlocked,
    DoubleEncodingDetected,
    SsrfAttemptBlocked,
    InjectionDetected,
    MaliciousIntentDetected,
    PrototypePollutionDetected,
    InvalidToken,
    NonceReuse,
    MessageExpired,
    RateLimitExceeded,
    ThreatLevelChanged,
    LockdownActivated,
    LockdownDeactivated,
}

/// Immutable audit record. Construct through [`SecurityEvent::new`] and the
/// `detail` builder; events are never mutated after logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: Severity,
    /// Unix timestamp (millis).
    pub timestamp_ms: i64,
    /// Structured detail payload.
    pub details: HashMap<String, serde_json::Value>,
    /// Which component emitted this event.
    pub source: String,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, source: &str) -> Self {
        Self {
            event_type,
            severity,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            details: HashMap::new(),
            source: source.to_string(),
        }
    }

    /// Attach a structured detail value.
    #[must_use]
    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Universal return value of every validation operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub event: Option<SecurityEvent>,
}

impl SecurityDecision {
    pub fn allow() -> Self {
        Self { allowed: true, reason: None, event: None }
    }

    pub fn allow_with(event: SecurityEvent) -> Self {
        Self { allowed: true, reason: None, event: Some(event) }
    }

    pub fn deny(reason: impl Into<String>, event: SecurityEvent) -> Self {
        Self { allowed: false, reason: Some(reason.into()), event: Some(event) }
    }

    /// Rejection that rides on an already-logged condition (e.g. traffic
    /// dropped while a lockdown event is on record) and carries no event of
    /// its own.
    pub fn deny_without_event(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()), event: None }
    }

    /// Event type carried by this decision, if any.
    pub fn event_type(&self) -> Option<SecurityEventType> {
        self.event.as_ref().map(|e| e.event_type)
    }
}
