/// Shared error type used across all gateway crates.
///
/// The variants map onto the gateway's error kinds: configuration and
/// validation errors surface verbatim and are never retried; auth,
/// rate-limit, transport, and timeout errors are candidates for local
/// recovery (profile rotation, reconnect back-off); integrity errors mean
/// a durable store was quarantined and rebuilt.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("policy: {0}")]
    Policy(String),

    #[error("permission missing: {0}")]
    Permission(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("store integrity: {0}")]
    Integrity(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether local recovery (rotation, back-off retry) may be attempted.
    /// Everything else propagates to the caller and the user-visible reply.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::RateLimit(_) | Error::Transport(_) | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
