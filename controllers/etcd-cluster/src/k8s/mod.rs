//! Orchestration platform access.
//!
//! `Platform` is the seam between the reconcile engine and the cluster API:
//! everything the engine creates, lists, or deletes goes through it, so the
//! engine can be unit tested against an in-memory implementation. The pod
//! and service construction helpers live in the submodules.

pub mod kube_platform;
pub mod pod;
pub mod service;


use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use thiserror::Error;

pub use kube_platform::KubePlatform;

/// Label carrying the owning cluster's name on every child object.
pub const CLUSTER_LABEL: &str = "etcd_cluster";

/// App label shared by all member pods.
pub const APP_LABEL_VALUE: &str = "etcd";

pub const ETCD_CLIENT_PORT: i32 = 2379;
pub const ETCD_PEER_PORT: i32 = 2380;

/// Port the backup sidecar serves its HTTP API on.
pub const BACKUP_SIDECAR_PORT: i32 = 19999;

/// Name of the backup sidecar deployment and service for a cluster.
pub fn backup_sidecar_name(cluster_name: &str) -> String {
    format!("{}-backup-sidecar", cluster_name)
}

/// Selector matching every object that belongs to one cluster.
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", CLUSTER_LABEL, cluster_name)
}

/// Errors from the orchestration platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    AlreadyExists,

    #[error("platform api error: {0}")]
    Api(String),
}

impl From<kube::Error> for PlatformError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => PlatformError::NotFound,
            kube::Error::Api(resp) if resp.code == 409 => PlatformError::AlreadyExists,
            _ => PlatformError::Api(e.to_string()),
        }
    }
}

/// Platform operations the controller needs. All list operations take a
/// label selector; namespaces are explicit because the shared client serves
/// every cluster worker.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, PlatformError>;

    /// Deletes a pod with the given termination grace period.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<(), PlatformError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, PlatformError>;

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), PlatformError>;

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), PlatformError>;

    async fn list_pvcs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, PlatformError>;

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<(), PlatformError>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), PlatformError>;

    async fn list_services(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Service>, PlatformError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, PlatformError>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), PlatformError>;

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, PlatformError>;

    /// Merge-patches a deployment.
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), PlatformError>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), PlatformError>;
}

/// A pod belongs to a cluster iff its first owner reference carries the
/// cluster record's UID.
pub fn is_owned_by(pod: &Pod, cluster_uid: &str) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|r| r.uid == cluster_uid)
        .unwrap_or(false)
}

/// Pod phase as a plain string, empty when unset.
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

pub fn pod_names(pods: &[Pod]) -> Vec<&str> {
    pods.iter()
        .map(|p| p.metadata.name.as_deref().unwrap_or(""))
        .collect()
}
