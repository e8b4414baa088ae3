//! Controller configuration.
//!
//! One `Config` is shared (cloned) by every per-cluster worker. The remote
//! collaborators are trait objects so tests swap in the in-memory mocks.

use std::sync::Arc;

use etcd_admin::EtcdAdminOps;

use crate::cluster::backup::BackupServiceOps;
use crate::k8s::Platform;
use crate::metrics::MetricsSink;
use crate::record::ClusterRecordOps;

/// Operator-level S3 settings used when a backup policy selects S3 without
/// a per-cluster source.
#[derive(Debug, Clone)]
pub struct S3Context {
    pub bucket: String,
    pub prefix: String,
    pub credentials_secret: String,
}

#[derive(Clone)]
pub struct Config {
    /// Provisioner recorded on backup volume claims
    pub pv_provisioner: String,

    /// Service account the backup sidecar runs as
    pub service_account: String,

    /// Operator-level S3 fallback settings
    pub s3_context: Option<S3Context>,

    /// Image the backup sidecar is expected to run
    pub backup_sidecar_image: String,

    /// Orchestration platform client
    pub platform: Arc<dyn Platform>,

    /// Cluster record (desired state) client
    pub record: Arc<dyn ClusterRecordOps>,

    /// etcd membership/health client
    pub etcd: Arc<dyn EtcdAdminOps>,

    /// Backup sidecar HTTP client
    pub backup_service: Arc<dyn BackupServiceOps>,

    /// Metric emission
    pub metrics: Arc<dyn MetricsSink>,
}
