use thiserror::Error;

/// Failures callers branch on. Everything else travels as a plain `anyhow::Error`.
#[derive(Debug, Error)]
pub enum SigprobsError {
    #[error("upstream unavailable during {operation}: {message}")]
    UpstreamUnavailable { operation: String, message: String },

    #[error("username contains invalid characters: {0}")]
    InvalidUsername(String),

    #[error("no report found for site {0}")]
    ReportNotFound(String),

    #[error("a replica database is required (set paths.replica_dir or SIGPROBS_REPLICA_DIR)")]
    ReplicaRequired,
}

#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The replica cannot be reached at all; callers fall back to the API.
    #[error("replica database unavailable: {0}")]
    Unavailable(String),

    #[error("replica query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

pub fn is_upstream_unavailable(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<SigprobsError>(),
        Some(SigprobsError::UpstreamUnavailable { .. })
    )
}
