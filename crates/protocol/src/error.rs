use thiserror::Error;

/// Error taxonomy shared by every forwarder, the simulcast source and the
/// transcoding output. Callers that need to branch on failure kind (the
/// supervisor's retry-or-surface decision) match on this enum; anything
/// that only needs to propagate a fault uses `anyhow::Error` with this as
/// the source.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("already started")]
    AlreadyStarted,

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("upstream path {path} not ready after {waited_ms}ms")]
    UpstreamNotReady { path: String, waited_ms: u64 },

    #[error("no matching {media_type} format on upstream path {path}")]
    DescriptionMismatch { path: String, media_type: String },

    #[error("failed to spawn encoder child process: {0}")]
    ChildSpawnFailed(String),

    #[error("encoder child process exited: {0}")]
    ChildExited(String),

    #[error("WHIP session gone (404): {0}")]
    SessionGone(String),
}

impl RelayError {
    /// Whether a supervisor loop should treat this as retryable when the
    /// target's reconnect flag is set. Every forwarder-side fault is
    /// retryable; configuration and programmer errors are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RelayError::ConfigInvalid(_) | RelayError::AlreadyStarted
        )
    }
}
