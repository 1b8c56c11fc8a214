//! Audit logger — bounded event buffer with filtering and sink fan-out.
//!
//! Every decision the screening layer makes lands here. The buffer is a ring
//! in behavior (oldest trimmed first); registered filters can drop events
//! before they are stored; external sinks receive a fan-out copy with
//! per-sink failure isolation so one broken sink cannot block the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::PalisadeResult;
use crate::events::{SecurityEvent, SecurityEventType, Severity, ThreatLevel};
use crate::EVENT_BUFFER_CAPACITY;

const SOURCE: &str = "security_logger";

/// A registered filter; any filter returning false drops the event.
pub type EventFilter = Arc<dyn Fn(&SecurityEvent) -> bool + Send + Sync>;

/// External event destination (SIEM forwarder, file writer, test probe).
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    fn emit(&self, event: &SecurityEvent) -> PalisadeResult<()>;
}

/// Query over the buffered events. Unset fields do not constrain.
#[derive(Default, Clone)]
pub struct EventQuery {
    pub event_type: Option<SecurityEventType>,
    pub min_severity: Option<Severity>,
    pub since_ms: Option<i64>,
    pub limit: Option<usize>,
}

pub struct SecurityLogger {
    buffer: RwLock<Vec<SecurityEvent>>,
    capacity: usize,
    filters: RwLock<Vec<EventFilter>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    debug: bool,
    total_logged: AtomicU64,
    total_filtered: AtomicU64,
    total_trimmed: AtomicU64,
    total_sink_failures: AtomicU64,
}

impl SecurityLogger {
    pub fn new(capacity: usize, debug: bool) -> Self {
        Self {
            buffer: RwLock::new(Vec::with_capacity(capacity.min(1024))),
            capacity,
            filters: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            debug,
            total_logged: AtomicU64::new(0),
            total_filtered: AtomicU64::new(0),
            total_trimmed: AtomicU64::new(0),
            total_sink_failures: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity(debug: bool) -> Self {
        Self::new(EVENT_BUFFER_CAPACITY, debug)
    }

    pub fn add_filter(&self, filter: EventFilter) {
        self.filters.write().push(filter);
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Record an event: filters, buffer trim, console output, sink fan-out.
    pub fn log(&self, event: SecurityEvent) {
        {
            let filters = self.filters.read();
            if filters.iter().any(|f| !f(&event)) {
                self.total_filtered.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.total_logged.fetch_add(1, Ordering::Relaxed);

        if self.debug || event.severity >= Severity::Error {
            match event.severity {
                Severity::Error | Severity::Critical => {
                    error!(event = ?event.event_type, source = %event.source, "security event");
                }
                _ => {
                    info!(event = ?event.event_type, source = %event.source, "security event");
                }
            }
        }

        {
            let mut buffer = self.buffer.write();
            if buffer.len() >= self.capacity {
                let drain = buffer.len() - self.capacity + 1;
                buffer.drain(..drain);
                self.total_trimmed.fetch_add(drain as u64, Ordering::Relaxed);
            }
            buffer.push(event.clone());
        }

        let sinks = self.sinks.read();
        for sink in sinks.iter() {
            if let Err(e) = sink.emit(&event) {
                self.total_sink_failures.fetch_add(1, Ordering::Relaxed);
                warn!(sink = %sink.name(), error = %e, "event sink failed");
            }
        }
    }

    /// Buffered events matching `query`, newest first.
    pub fn query(&self, query: &EventQuery) -> Vec<SecurityEvent> {
        let buffer = self.buffer.read();
        buffer
            .iter()
            .rev()
            .filter(|e| query.event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| query.min_severity.map_or(true, |s| e.severity >= s))
            .filter(|e| query.since_ms.map_or(true, |t| e.timestamp_ms >= t))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.query(&EventQuery { limit: Some(limit), ..EventQuery::default() })
    }

    /// Number of buffered events at or after `since_ms`.
    pub fn count_since(&self, since_ms: i64) -> usize {
        self.buffer.read().iter().filter(|e| e.timestamp_ms >= since_ms).count()
    }

    pub fn log_threat_level_change(&self, from: ThreatLevel, to: ThreatLevel) {
        let severity = if to == ThreatLevel::Critical { Severity::Critical } else { Severity::Warning };
        self.log(
            SecurityEvent::new(SecurityEventType::ThreatLevelChanged, severity, SOURCE)
                .detail("from", format!("{from:?}"))
                .detail("to", format!("{to:?}")),
        );
    }

    pub fn log_lockdown_activated(&self, duration_ms: u64, trigger: &str) {
        self.log(
            SecurityEvent::new(SecurityEventType::LockdownActivated, Severity::Critical, SOURCE)
                .detail("duration_ms", duration_ms)
                .detail("trigger", trigger),
        );
    }

    pub fn log_lockdown_deactivated(&self, manual: bool) {
        self.log(
            SecurityEvent::new(SecurityEventType::LockdownDeactivated, Severity::Warning, SOURCE)
                .detail("manual", manual),
        );
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn total_logged(&self) -> u64 {
        self.total_logged.load(Ordering::Relaxed)
    }

    pub fn total_filtered(&self) -> u64 {
        self.total_filtered.load(Ordering::Relaxed)
    }

    pub fn total_trimmed(&self) -> u64 {
        self.total_trimmed.load(Ordering::Relaxed)
    }

    pub fn total_sink_failures(&self) -> u64 {
        self.total_sink_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PalisadeError;
    use std::sync::atomic::AtomicU64 as TestCounter;

    fn event(severity: Severity) -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::NavigationAllowed, severity, "test")
    }

    struct CountingSink {
        delivered: TestCounter,
        fail: bool,
    }

    impl EventSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }
        fn emit(&self, _event: &SecurityEvent) -> PalisadeResult<()> {
            if self.fail {
                return Err(PalisadeError::SinkFailure {
                    sink: "counting".into(),
                    message: "simulated".into(),
                });
            }
            self.delivered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_filter_drops_events() {
        let logger = SecurityLogger::new(100, false);
        logger.add_filter(Arc::new(|e: &SecurityEvent| e.severity >= Severity::Warning));
        logger.log(event(Severity::Info));
        logger.log(event(Severity::Error));
        assert_eq!(logger.buffer_len(), 1);
        assert_eq!(logger.total_filtered(), 1);
        assert_eq!(logger.total_logged(), 1);
    }

    #[test]
    fn test_buffer_trims_oldest_first() {
        let logger = SecurityLogger::new(10, false);
        for i in 0..25 {
            logger.log(event(Severity::Info).detail("seq", i));
        }
        assert_eq!(logger.buffer_len(), 10);
        assert_eq!(logger.total_trimmed(), 15);
        let newest = logger.recent(1);
        assert_eq!(newest[0].details.get("seq"), Some(&serde_json::json!(24)));
    }

    #[test]
    fn test_query_by_type_severity_and_limit() {
        let logger = SecurityLogger::new(100, false);
        logger.log(SecurityEvent::new(SecurityEventType::NonceReuse, Severity::Critical, "t"));
        logger.log(SecurityEvent::new(SecurityEventType::NavigationAllowed, Severity::Info, "t"));
        logger.log(SecurityEvent::new(SecurityEventType::NonceReuse, Severity::Critical, "t"));

        let reuse = logger.query(&EventQuery {
            event_type: Some(SecurityEventType::NonceReuse),
            ..EventQuery::default()
        });
        assert_eq!(reuse.len(), 2);

        let critical = logger.query(&EventQuery {
            min_severity: Some(Severity::Critical),
            limit: Some(1),
            ..EventQuery::default()
        });
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].event_type, SecurityEventType::NonceReuse);
    }

    #[test]
    fn test_count_since() {
        let logger = SecurityLogger::new(100, false);
        let before = chrono::Utc::now().timestamp_millis() - 1;
        logger.log(event(Severity::Info));
        logger.log(event(Severity::Info));
        assert_eq!(logger.count_since(before), 2);
        assert_eq!(logger.count_since(chrono::Utc::now().timestamp_millis() + 1_000), 0);
    }

    #[test]
    fn test_broken_sink_does_not_block_others() {
        let logger = SecurityLogger::new(100, false);
        let good = Arc::new(CountingSink { delivered: TestCounter::new(0), fail: false });
        logger.add_sink(Arc::new(CountingSink { delivered: TestCounter::new(0), fail: true }));
        logger.add_sink(good.clone());

        logger.log(event(Severity::Info));

        assert_eq!(good.delivered.load(Ordering::Relaxed), 1);
        assert_eq!(logger.total_sink_failures(), 1);
        assert_eq!(logger.buffer_len(), 1);
    }

    #[test]
    fn test_lockdown_helpers() {
        let logger = SecurityLogger::new(100, false);
        logger.log_lockdown_activated(30_000, "NONCE_REUSE");
        logger.log_lockdown_deactivated(false);
        logger.log_threat_level_change(ThreatLevel::Normal, ThreatLevel::Critical);

        let activated = logger.query(&EventQuery {
            event_type: Some(SecurityEventType::LockdownActivated),
            ..EventQuery::default()
        });
        assert_eq!(activated.len(), 1);
        assert_eq!(activated[0].severity, Severity::Critical);
        assert_eq!(
            logger
                .query(&EventQuery {
                    event_type: Some(SecurityEventType::ThreatLevelChanged),
                    ..EventQuery::default()
                })
                .len(),
            1
        );
    }
}
