//! Shared request/record shapes for the engine layer.

use serde::{Deserialize, Serialize};

use palisade_core::Severity;

/// Scheme prefix of the application's own bridge protocol
/// (`app://<action>`). Messages declaring it are token-gated.
pub const APP_SCHEME: &str = "app";

/// Name of the well-known bridge object installed into the content surface.
pub const BRIDGE_OBJECT: &str = "AppBridge";

/// Name of the native outbound-message primitive the host injects.
pub const NATIVE_POST: &str = "__nativePost";

/// A navigation the content surface wants to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationRequest {
    pub url: String,
    #[serde(default)]
    pub is_redirect: bool,
    #[serde(default)]
    pub main_document_url: Option<String>,
    #[serde(default)]
    pub navigation_type: Option<String>,
}

impl NavigationRequest {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            is_redirect: false,
            main_document_url: None,
            navigation_type: None,
        }
    }

    #[must_use]
    pub fn redirect(mut self) -> Self {
        self.is_redirect = true;
        self
    }
}

/// Inbound message from the content surface to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeMessage {
    /// `"<scheme>://<action>"`.
    pub protocol: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Unix timestamp (millis); absent messages skip the age check.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Provenance of a piece of code handed to the injection guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSource {
    ContentSurface,
    Bridge,
    Plugin,
    Internal,
    Unknown,
}

/// Static catalog entry referenced by a pattern-matching rule.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionSignature {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
}
