//! Error taxonomy shared by the write, query and setup paths.

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, RagError>;

/// Failure modes surfaced by the coordinator.
///
/// `Transport` failures are retried inside the node client before they ever
/// reach a caller; everything else is returned as-is.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Missing or invalid node list, signing key or identifiers.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection failure or timeout talking to a node, after the retry budget.
    #[error("transport error talking to {node}: {source}")]
    Transport {
        /// Base URL of the node.
        node: String,
        /// Underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// Non-2xx status or a 2xx body missing the expected payload.
    #[error("protocol error from {node}: {detail}")]
    Protocol {
        /// Base URL of the node.
        node: String,
        /// What the node returned.
        detail: String,
    },

    /// Share set for a value was incomplete or carried mismatched precision.
    #[error("reconstruction failed: {0}")]
    Reconstruction(String),

    /// Query text was empty.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// One or more nodes exhausted retries during a fan-out.
    #[error("nodes unavailable: {}", nodes.join(", "))]
    NodeUnavailable {
        /// Base URLs of the failing nodes.
        nodes: Vec<String>,
    },

    /// No document could be fully reconstructed.
    #[error("no documents could be reconstructed from node responses")]
    NoResults,

    /// Caller-supplied data violated a precondition.
    #[error("invalid input: {0}")]
    Input(String),

    /// Token signing failed.
    #[error("auth error: {0}")]
    Auth(String),

    /// The embedding backend failed.
    #[error("embedding failed: {0}")]
    Embedding(String),
}

impl RagError {
    /// Base URL of the node this error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            RagError::Transport { node, .. } | RagError::Protocol { node, .. } => Some(node),
            _ => None,
        }
    }
}
