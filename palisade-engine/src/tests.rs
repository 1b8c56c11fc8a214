#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use palisade_core::events::{SecurityEventType, ThreatLevel};
    use palisade_core::logger::EventQuery;
    use palisade_core::{ConfigUpdate, SecurityConfig};

    use crate::types::{BridgeMessage, CodeSource, NavigationRequest};
    use crate::SecurityEngine;

    fn engine() -> SecurityEngine {
        SecurityEngine::new(SecurityConfig::default())
    }

    fn engine_with_lockdown_ms(ms: u64) -> SecurityEngine {
        let config = SecurityConfig { lockdown_duration_ms: ms, ..SecurityConfig::default() };
        SecurityEngine::new(config)
    }

    fn message(engine: &SecurityEngine, nonce: &str) -> BridgeMessage {
        BridgeMessage {
            protocol: "app://getUser".into(),
            action: Some("getUser".into()),
            payload: None,
            request_id: Some("req-1".into()),
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            token: Some(engine.security_token()),
            nonce: Some(nonce.into()),
        }
    }

    #[test]
    fn test_bridge_message_end_to_end() {
        let e = engine();
        let msg = message(&e, "n1");

        let first = e.validate_bridge_message(&msg);
        assert!(first.allowed);

        // Identical resubmission reuses the nonce and locks the engine down.
        let replay = e.validate_bridge_message(&msg);
        assert!(!replay.allowed);
        assert_eq!(replay.event_type(), Some(SecurityEventType::NonceReuse));
        assert!(e.is_lockdown_active());
        assert_eq!(e.threat_level(), ThreatLevel::Critical);

        // While locked down, even fresh messages are dropped.
        let fresh = e.validate_bridge_message(&message(&e, "n2"));
        assert!(!fresh.allowed);
        assert!(fresh.event.is_none());

        // And so is navigation.
        assert!(!e.validate_navigation(&NavigationRequest::new("https://example.com/")).allowed);
    }

    #[test]
    fn test_invalid_token_triggers_lockdown() {
        let e = engine();
        let mut msg = message(&e, "n1");
        msg.token = Some("forged".into());

        let d = e.validate_bridge_message(&msg);
        assert!(!d.allowed);
        assert_eq!(d.event_type(), Some(SecurityEventType::InvalidToken));
        assert!(e.is_lockdown_active());
    }

    #[test]
    fn test_missing_token_checked_before_nonce() {
        let e = engine();
        let mut msg = message(&e, "n1");
        msg.token = None;

        let d = e.validate_bridge_message(&msg);
        assert_eq!(d.event_type(), Some(SecurityEventType::InvalidToken));
        // The nonce was never consumed.
        e.deactivate_lockdown();
        assert!(e.validate_bridge_message(&message(&e, "n1")).allowed);
    }

    #[test]
    fn test_expired_message_rejected_without_lockdown() {
        let e = engine();
        let mut msg = message(&e, "n1");
        msg.timestamp = Some(chrono::Utc::now().timestamp_millis() - 120_000);

        let d = e.validate_bridge_message(&msg);
        assert!(!d.allowed);
        assert_eq!(d.event_type(), Some(SecurityEventType::MessageExpired));
        assert!(!e.is_lockdown_active());
    }

    #[test]
    fn test_untimestamped_message_skips_age_check() {
        let e = engine();
        let mut msg = message(&e, "n1");
        msg.timestamp = None;
        assert!(e.validate_bridge_message(&msg).allowed);
    }

    #[test]
    fn test_injection_detection_triggers_lockdown() {
        let e = engine();
        let d = e.validate_code("eval('payload')", CodeSource::ContentSurface);
        assert!(!d.allowed);
        assert_eq!(d.event_type(), Some(SecurityEventType::InjectionDetected));
        assert!(e.is_lockdown_active());
    }

    #[test]
    fn test_lockdown_auto_releases() {
        let e = engine_with_lockdown_ms(60);
        e.activate_lockdown();
        assert!(e.is_lockdown_active());

        std::thread::sleep(Duration::from_millis(250));
        assert!(!e.is_lockdown_active());
        assert_eq!(e.threat_level(), ThreatLevel::Normal);

        // Both transitions are on record.
        let deactivations = e.logger().query(&EventQuery {
            event_type: Some(SecurityEventType::LockdownDeactivated),
            ..EventQuery::default()
        });
        assert_eq!(deactivations.len(), 1);
    }

    #[test]
    fn test_reactivation_replaces_pending_release() {
        let e = engine_with_lockdown_ms(120);
        e.activate_lockdown();
        std::thread::sleep(Duration::from_millis(60));

        // Re-activation opens a fresh window; the first timer must not
        // release it at the original deadline.
        e.activate_lockdown();
        std::thread::sleep(Duration::from_millis(90));
        assert!(e.is_lockdown_active());

        std::thread::sleep(Duration::from_millis(120));
        assert!(!e.is_lockdown_active());
    }

    #[test]
    fn test_manual_deactivation_cancels_timer() {
        let e = engine_with_lockdown_ms(60_000);
        e.activate_lockdown();
        assert!(e.is_lockdown_active());
        e.deactivate_lockdown();
        assert!(!e.is_lockdown_active());
        assert_eq!(e.threat_level(), ThreatLevel::Normal);
    }

    #[test]
    fn test_threat_listener_notified_once_per_change() {
        let e = engine();
        let seen: Arc<Mutex<Vec<ThreatLevel>>> = Arc::new(Mutex::new(Vec::new()));
        let probe = seen.clone();
        let id = e.on_threat_level_change(Arc::new(move |level| {
            probe.lock().push(level);
        }));

        // Two warning-grade denials; only the first changes the level.
        assert!(!e.validate_url("not a url").allowed);
        assert!(!e.validate_url("also not a url").allowed);
        assert_eq!(e.threat_level(), ThreatLevel::Elevated);
        assert_eq!(seen.lock().as_slice(), &[ThreatLevel::Elevated]);

        // Escalation to lockdown notifies CRITICAL exactly once.
        e.activate_lockdown();
        assert_eq!(seen.lock().as_slice(), &[ThreatLevel::Elevated, ThreatLevel::Critical]);

        e.deactivate_lockdown();
        assert_eq!(
            seen.lock().as_slice(),
            &[ThreatLevel::Elevated, ThreatLevel::Critical, ThreatLevel::Normal]
        );

        assert!(e.off_threat_level_change(id));
        e.activate_lockdown();
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_error_grade_denial_raises_high() {
        let e = engine();
        assert!(!e.validate_url("https://example.com/%252e").allowed);
        assert_eq!(e.threat_level(), ThreatLevel::High);
        assert!(!e.is_lockdown_active());
    }

    #[test]
    fn test_content_surface_handlers() {
        let e = engine();
        let handlers = e.content_surface_handlers();

        assert!(handlers.boundary_script().contains(&e.security_token()));
        assert!(handlers.should_allow_navigation(&NavigationRequest::new("https://example.com/")));
        assert!(!handlers.should_allow_navigation(&NavigationRequest::new("javascript:alert(1)")));
    }

    #[test]
    fn test_update_config_is_live() {
        let e = engine();
        assert!(!e.validate_url("http://example.com/").allowed);
        e.update_config(ConfigUpdate { allow_insecure_http: Some(true), ..Default::default() });
        assert!(e.validate_url("http://example.com/").allowed);
    }

    #[test]
    fn test_debug_mode_records_intent_signals() {
        let e = SecurityEngine::new(SecurityConfig { debug: true, ..SecurityConfig::default() });
        let d = e.validate_code("document.cookie + window.open(u)", CodeSource::ContentSurface);
        assert!(d.allowed);

        let intents = e.logger().query(&EventQuery {
            event_type: Some(SecurityEventType::MaliciousIntentDetected),
            ..EventQuery::default()
        });
        assert_eq!(intents.len(), 1);
    }

    #[test]
    fn test_intent_signals_not_recorded_without_debug() {
        let e = engine();
        assert!(e.validate_code("document.cookie", CodeSource::ContentSurface).allowed);
        let intents = e.logger().query(&EventQuery {
            event_type: Some(SecurityEventType::MaliciousIntentDetected),
            ..EventQuery::default()
        });
        assert!(intents.is_empty());
    }

    #[test]
    fn test_decisions_are_audited() {
        let e = engine();
        assert!(e.validate_navigation(&NavigationRequest::new("https://example.com/")).allowed);
        assert!(!e.validate_url("javascript:alert(1)").allowed);

        let allowed = e.logger().query(&EventQuery {
            event_type: Some(SecurityEventType::NavigationAllowed),
            ..EventQuery::default()
        });
        assert_eq!(allowed.len(), 1);
        let schemes = e.logger().query(&EventQuery {
            event_type: Some(SecurityEventType::DangerousSchemeBlocked),
            ..EventQuery::default()
        });
        assert_eq!(schemes.len(), 1);
    }

    #[test]
    fn test_report_aggregates_components() {
        let e = engine();
        assert!(e.validate_navigation(&NavigationRequest::new("https://example.com/")).allowed);
        assert!(!e.validate_url("javascript:alert(1)").allowed);
        assert!(e.validate_bridge_message(&message(&e, "n1")).allowed);
        assert!(!e.validate_code("eval('x')", CodeSource::Bridge).allowed);

        let report = e.report();
        assert_eq!(report.navigation.total_validated, 1);
        assert!(report.urls_checked >= 2);
        assert_eq!(report.bridge_messages_validated, 1);
        assert_eq!(report.injection.total_blocked, 1);
        assert!(report.lockdown_active);
        assert!(report.events_logged > 0);
    }

    #[test]
    fn test_separate_engines_are_isolated() {
        let a = engine();
        let b = engine();
        assert_ne!(a.security_token(), b.security_token());

        // Locking one down leaves the other untouched.
        a.activate_lockdown();
        assert!(a.is_lockdown_active());
        assert!(!b.is_lockdown_active());
        assert!(b.validate_navigation(&NavigationRequest::new("https://example.com/")).allowed);
    }

    #[test]
    fn test_listener_ids_are_distinct() {
        let e = engine();
        let calls = Arc::new(AtomicU64::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let id1 = e.on_threat_level_change(Arc::new(move |_| {
            c1.fetch_add(1, Ordering::Relaxed);
        }));
        let id2 = e.on_threat_level_change(Arc::new(move |_| {
            c2.fetch_add(1, Ordering::Relaxed);
        }));
        assert_ne!(id1, id2);

        e.activate_lockdown();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(e.off_threat_level_change(id1));
        assert!(!e.off_threat_level_change(id1));
    }
}
