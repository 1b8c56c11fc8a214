use thiserror::Error;

pub type PalisadeResult<T> = Result<T, PalisadeError>;

/// Faults, as opposed to expected rejections. A screened-out navigation,
/// message, or script is a `SecurityDecision { allowed: false, .. }` and is
/// never surfaced through this type.
#[derive(Error, Debug)]
pub enum PalisadeError {
    #[error("log sink '{sink}' failed: {message}")]
    SinkFailure { sink: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
