use crate::domain::MessageId;

/// Core error type for the re-post engine.
///
/// Adapter crates should map their specific errors into this type so the
/// scheduler can handle failures consistently (fatal vs retryable vs
/// per-target). Per-target send failures are *not* errors — they are
/// outcomes (`stats::TargetOutcome`) and never abort a cycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("state store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("no forwardable message found in probed range {lo}..={hi}")]
    ProbeExhausted { lo: MessageId, hi: MessageId },

    #[error("source channel inaccessible: {0}")]
    Inaccessible(String),

    #[error("another forward cycle is in progress")]
    LockContention,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
