use thiserror::Error;

/// Closed error taxonomy for the whole crate.
///
/// Every fallible operation maps into one of these kinds; transports translate
/// kinds into HTTP status codes or WebSocket error frames without inspecting
/// messages. The kind string returned by [`Error::kind`] is part of the wire
/// contract.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid device type, OS version, or server configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Session, device, app, or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not valid in the current state (e.g. stop when not recording).
    #[error("bad state: {0}")]
    BadState(String),

    /// Resource in use (device mutex held, recording already active).
    #[error("busy: {0}")]
    Busy(String),

    /// Connection denied by the sliding-window rate limiter.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Connection denied by the per-session connection cap.
    #[error("connection cap exceeded: {0}")]
    CapExceeded(String),

    /// External call exceeded its deadline. The child process was killed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The underlying simulator tool failed or produced unparseable output.
    #[error("host driver: {0}")]
    HostDriver(String),

    /// Persistence read/write failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed client message.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Invariant violated. Logged loudly, surfaced as 500.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable kind string, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::NotFound(_) => "not-found",
            Error::BadState(_) => "bad-state",
            Error::Busy(_) => "busy",
            Error::RateLimited(_) => "rate-limited",
            Error::CapExceeded(_) => "cap-exceeded",
            Error::Timeout(_) => "timeout",
            Error::HostDriver(_) => "host-driver",
            Error::Io(_) => "io",
            Error::Protocol(_) => "protocol",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the host driver may transparently retry the operation.
    ///
    /// Only timeouts on idempotent operations qualify; everything else
    /// surfaces to the caller unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
