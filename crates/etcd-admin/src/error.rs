//! etcd admin client error types.

use thiserror::Error;

/// Errors surfaced by the etcd admin API client.
#[derive(Debug, Error)]
pub enum EtcdAdminError {
    /// HTTP transport failure (connection refused, timeout, TLS handshake)
    #[error("etcd request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The etcd endpoint answered with a non-success status
    #[error("etcd api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// No member with the requested name is registered
    #[error("etcd member not found: {0}")]
    MemberNotFound(String),

    /// None of the provided endpoints could be reached
    #[error("no reachable etcd endpoint out of {0} candidates")]
    NoReachableEndpoint(usize),

    /// The response body did not match the expected shape
    #[error("unexpected etcd response: {0}")]
    InvalidResponse(String),

    /// Client-side TLS material could not be loaded
    #[error("invalid tls material: {0}")]
    Tls(String),
}
