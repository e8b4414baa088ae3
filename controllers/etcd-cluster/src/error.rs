//! Controller-specific error types.
//!
//! Four kinds of failure flow through the engine: transient platform/etcd
//! errors (retried on the next tick), spec validation errors and the
//! refuse-to-resume case (both abort setup), and fatal reconcile errors
//! (logged with a marker; the loop keeps going).

use crds::InvalidClusterSpec;
use etcd_admin::EtcdAdminError;
use thiserror::Error;

use crate::cluster::backup::BackupServiceError;
use crate::k8s::PlatformError;
use crate::record::RecordError;

/// Errors that can occur while driving one cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The desired-state record failed validation
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(#[from] InvalidClusterSpec),

    /// The record says Creating: a previous create never finished and the
    /// controller refuses to resume it
    #[error("cluster is stuck in Creating phase; refusing to resume a half-finished create")]
    CreateInProgress,

    /// Failed phase observed at startup: the phase was rewritten to Running
    /// and the controller aborts so the next incarnation starts clean
    #[error("phase was Failed; status reset to Running, aborting for a clean restart")]
    ResetFromFailed,

    /// Kubernetes API error outside the platform trait (client setup,
    /// record listing)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource watch stream failed
    #[error("resource watch failed: {0}")]
    Watch(String),

    /// Orchestration platform call failed
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Cluster record read/write failed
    #[error("cluster record error: {0}")]
    Record(#[from] RecordError),

    /// etcd admin API call failed
    #[error("etcd admin error: {0}")]
    EtcdAdmin(#[from] EtcdAdminError),

    /// Backup sidecar HTTP API failed
    #[error("backup service error: {0}")]
    BackupService(#[from] BackupServiceError),

    /// The operator TLS secret is missing required keys
    #[error("malformed tls secret {secret}: missing key {key}")]
    BadTlsSecret { secret: String, key: String },

    /// Not all pods are running; reconciliation waits for them to settle
    #[error("not all pods are running")]
    PodsNotReady,

    /// Member reconciliation cannot make progress
    #[error("disaster recovery impossible: {0}")]
    DisasterRecoveryImpossible(String),
}

impl ClusterError {
    /// Fatal errors cannot be fixed by retrying; the loop logs them with a
    /// marker and keeps observing (phase is never flipped to Failed).
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::DisasterRecoveryImpossible(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unrecoverable_reconcile_errors_are_fatal() {
        assert!(ClusterError::DisasterRecoveryImpossible("no backup".into()).is_fatal());
        assert!(!ClusterError::PodsNotReady.is_fatal());
        assert!(!ClusterError::Platform(PlatformError::NotFound).is_fatal());
        assert!(!ClusterError::CreateInProgress.is_fatal());
    }
}
