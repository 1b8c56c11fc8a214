//! Structural and heuristic URL screening.
//!
//! `validate` runs a fixed sequence of checks, short-circuiting on the first
//! failure: emptiness, structural parse, scheme policy, encoded null bytes,
//! double percent-encoding, mixed-script hostnames, SSRF targets, path
//! traversal, and finally origin policy. `validate_scheme_only` is the cheap
//! entry point for call sites that only need a fast scheme reject.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::Regex;
use tracing::warn;
use url::Url;

use palisade_core::events::{SecurityDecision, SecurityEvent, SecurityEventType, Severity};
use palisade_core::SecurityPolicy;

const SOURCE: &str = "url_validator";

/// Homoglyph-prone Unicode blocks checked by the mixed-script heuristic.
/// Pure non-Latin hostnames are not penalized — only mixing with ASCII is.
const SUSPICIOUS_BLOCKS: &[(u32, u32)] = &[
    (0x0370, 0x03FF), // Greek and Coptic
    (0x0400, 0x04FF), // Cyrillic
    (0x2000, 0x206F), // General punctuation
    (0x2100, 0x214F), // Letterlike symbols
    (0xFF00, 0xFFEF), // Halfwidth and fullwidth forms
];

pub struct UrlValidator {
    policy: Arc<SecurityPolicy>,
    scheme_syntax: Regex,
    total_checked: AtomicU64,
    total_blocked: AtomicU64,
}

impl UrlValidator {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self {
            policy,
            // RFC 3986: scheme = ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )
            scheme_syntax: Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*$").expect("static pattern"),
            total_checked: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
        }
    }

    /// Full URL screening. Checks run in order and stop at the first failure.
    pub fn validate(&self, url_str: &str) -> SecurityDecision {
        self.total_checked.fetch_add(1, Ordering::Relaxed);
        let decision = self.run_checks(url_str);
        if !decision.allowed {
            self.total_blocked.fetch_add(1, Ordering::Relaxed);
            let shown: String = url_str.chars().take(200).collect();
            warn!(
                url = %shown,
                reason = %decision.reason.as_deref().unwrap_or("unknown"),
                "URL blocked"
            );
        }
        decision
    }

    fn run_checks(&self, url_str: &str) -> SecurityDecision {
        // 1. Emptiness
        if url_str.trim().is_empty() {
            return deny("empty URL", SecurityEventType::UrlValidationFailed, Severity::Warning);
        }

        // 2. Structural parse
        let parsed = match Url::parse(url_str) {
            Ok(u) => u,
            Err(e) => {
                return deny(
                    format!("malformed URL: {e}"),
                    SecurityEventType::UrlValidationFailed,
                    Severity::Warning,
                );
            }
        };

        // 3. Scheme policy
        let scheme_decision = self.policy.validate_url_scheme(parsed.scheme());
        if !scheme_decision.allowed {
            return scheme_decision;
        }

        // 4. Literal and percent-encoded null bytes
        let lower = url_str.to_ascii_lowercase();
        if url_str.contains('\0') || lower.contains("%00") {
            return deny("null byte in URL", SecurityEventType::UrlValidationFailed, Severity::Error);
        }

        // 5. Double percent-encoding (`%2F` re-encoded to `%252F` leaves `%25`)
        if lower.contains("%25") {
            return deny(
                "double URL encoding detected",
                SecurityEventType::DoubleEncodingDetected,
                Severity::Error,
            );
        }

        // 6. Mixed-script hostname, on the raw (pre-punycode) host text
        if let Some(raw_host) = raw_host_of(url_str) {
            if is_mixed_script(&raw_host) {
                return deny(
                    format!("mixed-script hostname: {raw_host}"),
                    SecurityEventType::UrlValidationFailed,
                    Severity::Warning,
                );
            }
        }

        // 7. SSRF targets
        if let Some(reason) = ssrf_reason(&parsed) {
            return deny(reason, SecurityEventType::SsrfAttemptBlocked, Severity::Error);
        }

        // 8. Path traversal on the decoded path, taken from the raw input:
        // the parser itself normalizes dot segments away, so the screen has
        // to look at the path as it was written. Falls back to the raw text
        // when decoding fails.
        let raw_path = raw_path_of(url_str);
        let path = percent_decode(raw_path).unwrap_or_else(|| raw_path.to_string());
        if path.contains("../") || path.contains("..\\") {
            return deny(
                "path traversal in URL path",
                SecurityEventType::UrlValidationFailed,
                Severity::Error,
            );
        }

        // 9. Origin policy
        if let Some(host) = parsed.host_str() {
            let origin = match parsed.port() {
                Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                None => format!("{}://{}", parsed.scheme(), host),
            };
            let origin_decision = self.policy.validate_origin(&origin);
            if !origin_decision.allowed {
                return origin_decision;
            }
        }

        SecurityDecision::allow()
    }

    /// Fast scheme-syntax reject without a full parse: RFC 3986 scheme
    /// grammar on the text before the first `:`, then the scheme policy.
    pub fn validate_scheme_only(&self, url_str: &str) -> SecurityDecision {
        let scheme = match url_str.split_once(':') {
            Some((s, _)) => s,
            None => url_str,
        };
        if !self.scheme_syntax.is_match(scheme) {
            return deny(
                format!("invalid scheme syntax: {scheme}"),
                SecurityEventType::UrlValidationFailed,
                Severity::Warning,
            );
        }
        self.policy.validate_url_scheme(scheme)
    }

    pub fn total_checked(&self) -> u64 {
        self.total_checked.load(Ordering::Relaxed)
    }

    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Ordering::Relaxed)
    }
}

fn deny(reason: impl Into<String>, event_type: SecurityEventType, severity: Severity) -> SecurityDecision {
    let reason = reason.into();
    let event = SecurityEvent::new(event_type, severity, SOURCE).detail("reason", reason.clone());
    SecurityDecision::deny(reason, event)
}

/// Extract the authority host exactly as written in the input, before any
/// punycode conversion the parser applies. Userinfo and a trailing numeric
/// port are stripped.
fn raw_host_of(url_str: &str) -> Option<String> {
    let after_scheme = url_str.split_once("://")?.1;
    let authority = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(after_scheme);
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    if let Some(stripped) = host.strip_prefix('[') {
        return Some(stripped.split(']').next().unwrap_or(stripped).to_string());
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            Some(name.to_string())
        }
        _ => Some(host.to_string()),
    }
}

/// The path portion exactly as written: after the authority (when one is
/// present) up to the query or fragment.
fn raw_path_of(url_str: &str) -> &str {
    let rest = match url_str.split_once(':') {
        Some((_, r)) => r,
        None => url_str,
    };
    let rest = match rest.strip_prefix("//") {
        Some(after_slashes) => match after_slashes.find('/') {
            Some(idx) => &after_slashes[idx..],
            None => "",
        },
        None => rest,
    };
    rest.split(['?', '#']).next().unwrap_or(rest)
}

/// A hostname is flagged only when ASCII host characters mix with code
/// points from the homoglyph-prone blocks.
fn is_mixed_script(host: &str) -> bool {
    let has_ascii = host.chars().any(|c| c.is_ascii_alphanumeric());
    let has_suspicious = host.chars().any(|c| {
        let cp = c as u32;
        SUSPICIOUS_BLOCKS.iter().any(|&(lo, hi)| cp >= lo && cp <= hi)
    });
    has_ascii && has_suspicious
}

/// Loopback, private, and link-local targets, in literal and mapped forms.
fn ssrf_reason(url: &Url) -> Option<String> {
    match url.host()? {
        url::Host::Domain(domain) => {
            let d = domain.to_ascii_lowercase();
            if d == "localhost" || d.ends_with(".localhost") {
                return Some(format!("localhost host blocked: {d}"));
            }
            // Dotted-quad hosts of non-special schemes parse as domains.
            if let Ok(v4) = d.parse::<Ipv4Addr>() {
                return ipv4_reason(v4);
            }
            None
        }
        url::Host::Ipv4(v4) => ipv4_reason(v4),
        url::Host::Ipv6(v6) => ipv6_reason(v6),
    }
}

fn ipv4_reason(addr: Ipv4Addr) -> Option<String> {
    if addr.is_loopback() {
        return Some(format!("loopback address blocked: {addr}"));
    }
    if addr.is_private() {
        return Some(format!("private address blocked: {addr}"));
    }
    if addr.is_link_local() {
        return Some(format!("link-local address blocked: {addr}"));
    }
    if addr.is_unspecified() {
        return Some(format!("unspecified address blocked: {addr}"));
    }
    None
}

fn ipv6_reason(addr: Ipv6Addr) -> Option<String> {
    if addr.is_loopback() {
        return Some(format!("loopback address blocked: {addr}"));
    }
    if addr.is_unspecified() {
        return Some(format!("unspecified address blocked: {addr}"));
    }
    // fe80::/10 link-local, fc00::/7 unique-local
    let seg0 = addr.segments()[0];
    if (seg0 & 0xffc0) == 0xfe80 {
        return Some(format!("link-local address blocked: {addr}"));
    }
    if (seg0 & 0xfe00) == 0xfc00 {
        return Some(format!("unique-local address blocked: {addr}"));
    }
    // IPv4-mapped (::ffff:a.b.c.d), bracketed or not in the original text
    if let Some(v4) = addr.to_ipv4_mapped() {
        return ipv4_reason(v4);
    }
    None
}

/// Single-pass percent decoding. Returns None when an escape is malformed or
/// the result is not valid UTF-8, so callers can fall back to the raw text.
fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
