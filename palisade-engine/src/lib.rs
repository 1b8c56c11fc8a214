//! # Palisade Engine — composed validators and the orchestrating engine
//!
//! Builds on `palisade-core` to provide the full screening surface a host
//! application wires into its embedded content surface:
//!
//! - [`url_validator`] — structural + heuristic URL screening
//! - [`navigation_guard`] — rate limiting, redirect chains, origin changes
//! - [`injection_guard`] — multi-layer code scanning and the boundary script
//! - [`engine`] — the orchestrator and threat-level/lockdown state machine
//!
//! ```no_run
//! use palisade_core::SecurityConfig;
//! use palisade_engine::{NavigationRequest, SecurityEngine};
//!
//! let engine = SecurityEngine::new(SecurityConfig::default());
//! let handlers = engine.content_surface_handlers();
//! // inject handlers.boundary_script() before page content loads, then
//! // gate every navigation:
//! let ok = handlers.should_allow_navigation(&NavigationRequest::new("https://example.com/"));
//! assert!(ok);
//! ```

pub mod engine;
pub mod injection_guard;
pub mod navigation_guard;
pub mod scheduler;
pub mod types;
pub mod url_validator;

pub use engine::{ContentSurfaceHandlers, EngineReport, SecurityEngine, ThreatLevelListener};
pub use injection_guard::{InjectionGuard, CATALOG_VERSION};
pub use navigation_guard::NavigationGuard;
pub use types::{BridgeMessage, CodeSource, DetectionSignature, NavigationRequest};
pub use url_validator::UrlValidator;

#[cfg(test)]
mod tests;
