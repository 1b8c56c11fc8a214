//! Multi-layer code screening for script text the content surface could
//! evaluate.
//!
//! Layer 1 is an ordered catalog of static signatures (first match wins).
//! Layer 2 is obfuscation heuristics plus a Shannon-entropy gate with a
//! minified-code suppression so legitimate bundler output is not rejected.
//! Layer 3 never blocks — it extracts intent signals (cookie, storage,
//! network, window-open access) for observability when debug is on.
//!
//! The guard also generates the boundary script injected into the surface
//! before any page content loads.

use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use palisade_core::events::{SecurityDecision, SecurityEvent, SecurityEventType, Severity};

use crate::types::{CodeSource, DetectionSignature, APP_SCHEME, BRIDGE_OBJECT, NATIVE_POST};

const SOURCE: &str = "injection_guard";

/// Version of the static signature catalog below.
pub const CATALOG_VERSION: &str = "2025.07.1";

/// Inputs longer than this are candidates for the entropy gate.
const ENTROPY_MIN_LEN: usize = 500;
/// Shannon entropy (bits/byte) above which un-minified-looking code is blocked.
const ENTROPY_THRESHOLD: f64 = 6.0;
/// Minified-code heuristic hits required to suppress the entropy gate.
const MINIFIED_HITS_REQUIRED: usize = 3;

struct SignatureRule {
    signature: DetectionSignature,
    pattern: Regex,
}

/// Injection guard report counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InjectionGuardReport {
    pub total_scanned: u64,
    pub total_blocked: u64,
    pub entropy_blocked: u64,
}

pub struct InjectionGuard {
    signatures: Vec<SignatureRule>,
    obfuscation: Vec<SignatureRule>,
    minified_heuristics: Vec<Regex>,
    intent_patterns: Vec<(&'static str, Regex)>,
    total_scanned: AtomicU64,
    total_blocked: AtomicU64,
    entropy_blocked: AtomicU64,
}

impl InjectionGuard {
    pub fn new() -> Self {
        Self {
            signatures: compile_signature_catalog(),
            obfuscation: compile_obfuscation_catalog(),
            minified_heuristics: compile_minified_heuristics(),
            intent_patterns: compile_intent_patterns(),
            total_scanned: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            entropy_blocked: AtomicU64::new(0),
        }
    }

    /// Screen a piece of code before it may be evaluated. Empty or
    /// whitespace-only input is trivially allowed.
    pub fn validate_code(&self, code: &str, source: CodeSource) -> SecurityDecision {
        if code.trim().is_empty() {
            return SecurityDecision::allow();
        }
        self.total_scanned.fetch_add(1, Ordering::Relaxed);

        // Layer 1: static signatures, catalog order, first match wins.
        for rule in &self.signatures {
            if rule.pattern.is_match(code) {
                return self.block(&rule.signature, code, source);
            }
        }

        // Layer 2a: obfuscation patterns.
        for rule in &self.obfuscation {
            if rule.pattern.is_match(code) {
                return self.block(&rule.signature, code, source);
            }
        }

        // Layer 2b: entropy gate with minified-code suppression.
        if code.len() > ENTROPY_MIN_LEN {
            let entropy = shannon_entropy(code);
            if entropy > ENTROPY_THRESHOLD {
                let hits = self
                    .minified_heuristics
                    .iter()
                    .filter(|h| h.is_match(code))
                    .count();
                if hits < MINIFIED_HITS_REQUIRED {
                    self.total_blocked.fetch_add(1, Ordering::Relaxed);
                    self.entropy_blocked.fetch_add(1, Ordering::Relaxed);
                    warn!(source = ?source, entropy, len = code.len(), "high-entropy code blocked");
                    return SecurityDecision::deny(
                        format!("high-entropy code ({entropy:.2} bits/byte) with no minification markers"),
                        SecurityEvent::new(SecurityEventType::InjectionDetected, Severity::Error, SOURCE)
                            .detail("entropy", (entropy * 100.0).round() / 100.0)
                            .detail("length", code.len() as i64)
                            .detail("minified_hits", hits as i64)
                            .detail("code_source", format!("{source:?}")),
                    );
                }
            }
        }

        SecurityDecision::allow()
    }

    fn block(&self, sig: &DetectionSignature, code: &str, source: CodeSource) -> SecurityDecision {
        self.total_blocked.fetch_add(1, Ordering::Relaxed);
        let event_type = if sig.id.starts_with("SIG_PROTO") {
            SecurityEventType::PrototypePollutionDetected
        } else {
            SecurityEventType::InjectionDetected
        };
        warn!(signature = sig.id, source = ?source, len = code.len(), "malicious code blocked");
        SecurityDecision::deny(
            format!("{}: {}", sig.id, sig.description),
            SecurityEvent::new(event_type, sig.severity, SOURCE)
                .detail("signature_id", sig.id)
                .detail("signature_name", sig.name)
                .detail("description", sig.description)
                .detail("code_source", format!("{source:?}")),
        )
    }

    /// Behavioral intent signals (layer 3). Purely observational — callers
    /// log these; nothing is blocked on their account.
    pub fn intent_signals(&self, code: &str) -> Vec<String> {
        self.intent_patterns
            .iter()
            .filter(|(_, pattern)| pattern.is_match(code))
            .map(|(label, _)| label.to_string())
            .collect()
    }

    /// The static signature catalog, in evaluation order.
    pub fn signatures(&self) -> Vec<DetectionSignature> {
        self.signatures
            .iter()
            .chain(self.obfuscation.iter())
            .map(|r| r.signature.clone())
            .collect()
    }

    /// Self-contained script to run in the content surface before any page
    /// content. Hardens the prototype chain, token-gates the native outbound
    /// primitive, and hides internal bridge members once they are installed.
    /// Must be regenerated whenever the token changes.
    pub fn generate_boundary_script(&self, token: &str) -> String {
        BOUNDARY_SCRIPT_TEMPLATE
            .replace("__TOKEN__", token)
            .replace("__BRIDGE_OBJECT__", BRIDGE_OBJECT)
            .replace("__NATIVE_POST__", NATIVE_POST)
            .replace("__APP_SCHEME__", APP_SCHEME)
    }

    pub fn report(&self) -> InjectionGuardReport {
        InjectionGuardReport {
            total_scanned: self.total_scanned.load(Ordering::Relaxed),
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            entropy_blocked: self.entropy_blocked.load(Ordering::Relaxed),
        }
    }
}

impl Default for InjectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

fn rule(
    id: &'static str,
    name: &'static str,
    description: &'static str,
    severity: Severity,
    pattern: &str,
) -> Option<SignatureRule> {
    Regex::new(pattern).ok().map(|pattern| SignatureRule {
        signature: DetectionSignature { id, name, description, severity },
        pattern,
    })
}

fn compile_signature_catalog() -> Vec<SignatureRule> {
    [
        rule(
            "SIG_BRIDGE_001",
            "bridge_internal_access",
            "access to internal bridge members",
            Severity::Critical,
            &format!(r#"{BRIDGE_OBJECT}\s*(?:\.\s*_|\[\s*['"]_)"#),
        ),
        rule(
            "SIG_BRIDGE_002",
            "native_primitive_tampering",
            "direct manipulation of the native message-send primitive",
            Severity::Critical,
            &format!(r"{NATIVE_POST}\b"),
        ),
        rule(
            "SIG_PROTO_001",
            "prototype_pollution",
            "prototype chain pollution attempt",
            Severity::Critical,
            r#"__proto__\s*=[^=]|\[\s*['"]__proto__['"]\s*\]|Object\s*\.\s*setPrototypeOf\s*\(|constructor\s*\[\s*['"]prototype['"]\s*\]"#,
        ),
        rule(
            "SIG_INJECT_001",
            "eval_call",
            "direct eval invocation",
            Severity::Critical,
            r"\beval\s*\(",
        ),
        rule(
            "SIG_INJECT_002",
            "function_constructor",
            "dynamic code via the Function constructor",
            Severity::Critical,
            r#"\bnew\s+Function\s*\(|\bFunction\s*\(\s*['"]"#,
        ),
        rule(
            "SIG_INJECT_003",
            "constructor_route",
            "dynamic code via generator/async function constructors",
            Severity::Critical,
            r#"\.\s*constructor\s*\(\s*['"]"#,
        ),
        rule(
            "SIG_INJECT_004",
            "indexed_evaluator",
            "bracket-indexed access to the evaluator",
            Severity::Critical,
            r#"\[\s*['"](?:eval|Function)['"]\s*\]"#,
        ),
        rule(
            "SIG_INJECT_005",
            "string_timer",
            "string-argument timer evaluation",
            Severity::Error,
            r#"\bset(?:Timeout|Interval)\s*\(\s*['"]"#,
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn compile_obfuscation_catalog() -> Vec<SignatureRule> {
    [
        rule(
            "OBF_001",
            "hex_escape_run",
            "excessive hex escape sequence run",
            Severity::Error,
            r"(?:\\x[0-9a-fA-F]{2}){8,}",
        ),
        rule(
            "OBF_002",
            "unicode_escape_run",
            "excessive unicode escape sequence run",
            Severity::Error,
            r"(?:\\u[0-9a-fA-F]{4}){6,}",
        ),
        rule(
            "OBF_003",
            "base64_blob",
            "very long base64-shaped run",
            Severity::Error,
            r"[A-Za-z0-9+/]{120,}={0,2}",
        ),
        rule(
            "OBF_004",
            "hex_blob",
            "suspicious long hexadecimal run",
            Severity::Error,
            r"\b[0-9a-fA-F]{96,}\b",
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Markers of ordinary minified bundler output. Three or more suppress the
/// entropy gate.
fn compile_minified_heuristics() -> Vec<Regex> {
    [
        r"\b(?:var|let|const|function)\s+[A-Za-z]\b",
        r"\breturn\s+[A-Za-z]\s*;",
        r"\?\s*[^:?]{1,40}:",
        r"\.prototype\.",
        r"\belse\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
}

fn compile_intent_patterns() -> Vec<(&'static str, Regex)> {
    [
        ("cookie_access", r"document\s*\.\s*cookie"),
        ("storage_access", r"\b(?:localStorage|sessionStorage)\b"),
        ("network_call", r"\b(?:fetch\s*\(|XMLHttpRequest|sendBeacon)"),
        ("window_open", r"window\s*\.\s*open\s*\("),
    ]
    .iter()
    .filter_map(|(label, p)| Regex::new(p).ok().map(|re| (*label, re)))
    .collect()
}

/// Shannon entropy in bits per byte.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for b in s.bytes() {
        counts[b as usize] += 1;
    }
    let len = s.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

const BOUNDARY_SCRIPT_TEMPLATE: &str = r#"(function() {
  'use strict';
  var token = '__TOKEN__';

  // Pin the __proto__ accessor: reads keep working, writes are dropped with
  // a warning, and the property can no longer be redefined.
  try {
    var desc = Object.getOwnPropertyDescriptor(Object.prototype, '__proto__');
    if (!desc || desc.configurable) {
      Object.defineProperty(Object.prototype, '__proto__', {
        configurable: false,
        get: function() { return Object.getPrototypeOf(this); },
        set: function() { console.warn('[palisade] blocked __proto__ write'); }
      });
    }
  } catch (e) {}

  // Token-gate the native outbound primitive: app-protocol messages without
  // the baked-in token are dropped; accepted ones are frozen.
  try {
    var nativePost = window.__NATIVE_POST__;
    if (typeof nativePost === 'function') {
      var guarded = function(message) {
        if (message && typeof message.protocol === 'string' &&
            message.protocol.indexOf('__APP_SCHEME__://') === 0) {
          if (message.token !== token) {
            console.warn('[palisade] dropped bridge message without valid token');
            return;
          }
          Object.freeze(message);
        }
        return nativePost.call(window, message);
      };
      Object.defineProperty(window, '__NATIVE_POST__', {
        value: guarded,
        writable: false,
        configurable: false
      });
    }
  } catch (e) {}

  // Once the bridge library has installed itself, hide its internal members.
  setTimeout(function() {
    try {
      var bridge = window.__BRIDGE_OBJECT__;
      if (!bridge) { return; }
      Object.getOwnPropertyNames(bridge).forEach(function(key) {
        if (key.charAt(0) === '_') {
          Object.defineProperty(bridge, key, {
            value: bridge[key],
            enumerable: false,
            configurable: false,
            writable: false
          });
        }
      });
    } catch (e) {}
  }, 50);
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> InjectionGuard {
        InjectionGuard::new()
    }

    /// 600 bytes cycling over the printable ASCII range: near-uniform over
    /// ~94 symbols, entropy well above 6 bits/byte.
    fn high_entropy_payload() -> String {
        (0..600)
            .map(|i| char::from(33 + (i * 7 % 94) as u8))
            .collect()
    }

    #[test]
    fn test_empty_and_whitespace_allowed() {
        let g = guard();
        assert!(g.validate_code("", CodeSource::ContentSurface).allowed);
        assert!(g.validate_code("   \n\t", CodeSource::Bridge).allowed);
    }

    #[test]
    fn test_bridge_member_access_blocked() {
        let g = guard();
        let d = g.validate_code("AppBridge._token", CodeSource::ContentSurface);
        assert!(!d.allowed);
        assert!(d.reason.as_deref().unwrap().starts_with("SIG_BRIDGE_001"));
        let d = g.validate_code("AppBridge['_secret']", CodeSource::ContentSurface);
        assert!(!d.allowed);
        assert!(d.reason.as_deref().unwrap().starts_with("SIG_BRIDGE_001"));
        // Public members pass.
        assert!(g.validate_code("AppBridge.send({})", CodeSource::ContentSurface).allowed);
    }

    #[test]
    fn test_native_primitive_reference_blocked() {
        let g = guard();
        let d = g.validate_code("window.__nativePost = hijack;", CodeSource::ContentSurface);
        assert!(!d.allowed);
        assert!(d.reason.as_deref().unwrap().starts_with("SIG_BRIDGE_002"));
    }

    #[test]
    fn test_prototype_pollution_blocked() {
        let g = guard();
        let d = g.validate_code("obj.__proto__ = {admin: true}", CodeSource::Bridge);
        assert!(!d.allowed);
        assert_eq!(d.event_type(), Some(SecurityEventType::PrototypePollutionDetected));
        let d = g.validate_code("target['__proto__']['x'] = 1", CodeSource::Bridge);
        assert!(!d.allowed);
        // Equality comparison against __proto__ is not an assignment.
        assert!(g.validate_code("if (a.__proto__ === b) {}", CodeSource::Bridge).allowed);
    }

    #[test]
    fn test_dynamic_code_routes_blocked() {
        let g = guard();
        let eval = g.validate_code("eval('1+1')", CodeSource::ContentSurface);
        assert!(!eval.allowed);
        assert!(eval.reason.as_deref().unwrap().starts_with("SIG_INJECT_001"));

        assert!(!g.validate_code("new Function('return 1')()", CodeSource::Unknown).allowed);
        assert!(!g
            .validate_code("(function*(){}).constructor('yield 1')", CodeSource::Unknown)
            .allowed);
        assert!(!g.validate_code("window['eval']('x')", CodeSource::Unknown).allowed);
        assert!(!g.validate_code("setTimeout('doEvil()', 10)", CodeSource::Unknown).allowed);
        // A function-argument timer is fine.
        assert!(g.validate_code("setTimeout(tick, 10)", CodeSource::Unknown).allowed);
    }

    #[test]
    fn test_first_match_wins_catalog_order() {
        let g = guard();
        // Contains both a bridge signature and an eval signature; the bridge
        // rule sits earlier in the catalog.
        let d = g.validate_code("AppBridge._x; eval('y')", CodeSource::ContentSurface);
        assert!(d.reason.as_deref().unwrap().starts_with("SIG_BRIDGE_001"));
    }

    #[test]
    fn test_obfuscation_patterns() {
        let g = guard();
        let hex = format!("var s = \"{}\";", "\\x41".repeat(12));
        assert!(!g.validate_code(&hex, CodeSource::ContentSurface).allowed);

        let b64 = format!("load(\"{}\")", "QUJD".repeat(40));
        assert!(!g.validate_code(&b64, CodeSource::ContentSurface).allowed);

        assert!(g.validate_code("var s = \"\\x41\\x42\";", CodeSource::ContentSurface).allowed);
    }

    #[test]
    fn test_entropy_gate_blocks_unmarked_payload() {
        let g = guard();
        let payload = high_entropy_payload();
        assert!(payload.len() > ENTROPY_MIN_LEN);
        assert!(shannon_entropy(&payload) > ENTROPY_THRESHOLD);
        let d = g.validate_code(&payload, CodeSource::ContentSurface);
        assert!(!d.allowed);
        assert_eq!(d.event_type(), Some(SecurityEventType::InjectionDetected));
        assert_eq!(g.report().entropy_blocked, 1);
    }

    #[test]
    fn test_entropy_gate_suppressed_for_minified_code() {
        let g = guard();
        // Same payload, now carrying three minification markers.
        let code = format!("function a(b){{return a;}}var c=d?x:y;{}", high_entropy_payload());
        assert!(shannon_entropy(&code) > ENTROPY_THRESHOLD);
        assert!(g.validate_code(&code, CodeSource::ContentSurface).allowed);
    }

    #[test]
    fn test_intent_signals_observe_but_do_not_block() {
        let g = guard();
        let code = "document.cookie; localStorage.setItem('k', v); window.open(u); fetch(u);";
        let signals = g.intent_signals(code);
        assert!(signals.contains(&"cookie_access".to_string()));
        assert!(signals.contains(&"storage_access".to_string()));
        assert!(signals.contains(&"window_open".to_string()));
        assert!(signals.contains(&"network_call".to_string()));
        assert!(g.validate_code(code, CodeSource::ContentSurface).allowed);
    }

    #[test]
    fn test_boundary_script_embeds_token() {
        let g = guard();
        let script = g.generate_boundary_script("tok-123");
        assert!(script.contains("var token = 'tok-123';"));
        assert!(script.contains("__proto__"));
        assert!(script.contains("__nativePost"));
        assert!(script.contains("AppBridge"));
        assert!(!script.contains("__TOKEN__"));
    }

    #[test]
    fn test_catalog_exposed() {
        let g = guard();
        let ids: Vec<&str> = g.signatures().iter().map(|s| s.id).collect();
        assert!(ids.contains(&"SIG_BRIDGE_001"));
        assert!(ids.contains(&"SIG_INJECT_001"));
        assert!(ids.contains(&"OBF_003"));
    }
}
