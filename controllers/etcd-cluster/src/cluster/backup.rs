//! Backup manager facade.
//!
//! Owns the lifecycle of the backup sidecar (a deployment plus service that
//! periodically snapshots etcd and uploads through its configured writer)
//! and polls its status API. Storage-type dispatch (S3 / ABS / PV) stays
//! inside this module; the engine never sees it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crds::{BackupPolicy, BackupServiceStatus, BackupStorageType, EtcdCluster};

use crate::config::Config;
use crate::k8s::{
    backup_sidecar_name, Platform, PlatformError, BACKUP_SIDECAR_PORT, CLUSTER_LABEL,
};

const BACKUP_DIR: &str = "/var/etcd-backup";
const BACKUP_VOLUME: &str = "backup-storage";

/// Errors from the backup sidecar's HTTP API.
#[derive(Debug, Error)]
pub enum BackupServiceError {
    #[error("backup service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backup service error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// HTTP face of the backup sidecar, behind a trait so engine tests run
/// against a mock.
#[async_trait::async_trait]
pub trait BackupServiceOps: Send + Sync {
    /// Current backup-service status.
    async fn get_status(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<BackupServiceStatus, BackupServiceError>;

    /// Whether a backup usable by the given etcd version exists.
    async fn exists_backup(
        &self,
        namespace: &str,
        service: &str,
        version: &str,
    ) -> Result<bool, BackupServiceError>;

    /// Asks the sidecar to snapshot now.
    async fn request_backup(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<(), BackupServiceError>;

    /// Asks the sidecar to purge every stored backup.
    async fn purge(&self, namespace: &str, service: &str) -> Result<(), BackupServiceError>;
}

/// Production client talking to the sidecar over cluster DNS.
#[derive(Debug, Clone)]
pub struct HttpBackupService {
    timeout: Duration,
}

impl Default for HttpBackupService {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl HttpBackupService {
    fn base_url(namespace: &str, service: &str) -> String {
        format!(
            "http://{}.{}.svc:{}/v1",
            service, namespace, BACKUP_SIDECAR_PORT
        )
    }

    fn client(&self) -> Result<reqwest::Client, BackupServiceError> {
        Ok(reqwest::Client::builder().timeout(self.timeout).build()?)
    }
}

#[async_trait::async_trait]
impl BackupServiceOps for HttpBackupService {
    async fn get_status(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<BackupServiceStatus, BackupServiceError> {
        let url = format!("{}/status", Self::base_url(namespace, service));
        let resp = self.client()?.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackupServiceError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }

    async fn exists_backup(
        &self,
        namespace: &str,
        service: &str,
        version: &str,
    ) -> Result<bool, BackupServiceError> {
        let url = format!(
            "{}/backup?etcdVersion={}",
            Self::base_url(namespace, service),
            version
        );
        let resp = self.client()?.head(&url).send().await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(BackupServiceError::Api {
                status: code,
                message: "unexpected backup lookup response".into(),
            }),
        }
    }

    async fn request_backup(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<(), BackupServiceError> {
        let url = format!("{}/backupnow", Self::base_url(namespace, service));
        let resp = self.client()?.post(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackupServiceError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn purge(&self, namespace: &str, service: &str) -> Result<(), BackupServiceError> {
        let url = format!("{}/backups", Self::base_url(namespace, service));
        let resp = self.client()?.delete(&url).send().await?;
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            return Err(BackupServiceError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Identifying fields of the owning cluster. The manager holds these plus
/// clients only, never the controller itself.
#[derive(Debug, Clone)]
pub struct ClusterMeta {
    pub name: String,
    pub namespace: String,
    pub owner: OwnerReference,
}

impl ClusterMeta {
    pub fn from_cluster(cluster: &EtcdCluster) -> Self {
        Self {
            name: cluster.metadata.name.clone().unwrap_or_default(),
            namespace: cluster.metadata.namespace.clone().unwrap_or_default(),
            owner: cluster.as_owner(),
        }
    }
}

/// Lifecycle manager for one cluster's backup sidecar. Exists exactly as
/// long as the cluster spec carries a backup policy.
pub struct BackupManager {
    platform: Arc<dyn Platform>,
    service: Arc<dyn BackupServiceOps>,
    meta: ClusterMeta,
    policy: BackupPolicy,
    sidecar_image: String,
    service_account: String,
    pv_provisioner: String,
    s3_fallback: Option<crate::config::S3Context>,
}

impl BackupManager {
    pub fn new(config: &Config, meta: ClusterMeta, policy: BackupPolicy) -> Self {
        Self {
            platform: config.platform.clone(),
            service: config.backup_service.clone(),
            meta,
            policy,
            sidecar_image: config.backup_sidecar_image.clone(),
            service_account: config.service_account.clone(),
            pv_provisioner: config.pv_provisioner.clone(),
            s3_fallback: config.s3_context.clone(),
        }
    }

    fn sidecar_name(&self) -> String {
        backup_sidecar_name(&self.meta.name)
    }

    fn pvc_name(&self) -> String {
        format!("{}-backup-pvc", self.meta.name)
    }

    /// Creates the sidecar deployment and service. Safe to call again:
    /// AlreadyExists is success.
    pub async fn setup(&self) -> Result<(), PlatformError> {
        if self.policy.storage_type == BackupStorageType::PersistentVolume {
            let pvc = self.backup_pvc();
            match self.platform.create_pvc(&self.meta.namespace, &pvc).await {
                Ok(()) | Err(PlatformError::AlreadyExists) => {}
                Err(e) => return Err(e),
            }
        }

        let deployment = self.sidecar_deployment();
        match self
            .platform
            .create_deployment(&self.meta.namespace, &deployment)
            .await
        {
            Ok(()) | Err(PlatformError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }

        let svc = self.sidecar_service();
        match self.platform.create_service(&self.meta.namespace, &svc).await {
            Ok(()) | Err(PlatformError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }

        info!(cluster = %self.meta.name, "backup sidecar is set up");
        Ok(())
    }

    /// Applies a changed backup policy to the running sidecar.
    pub async fn update_sidecar(&mut self, cluster: &EtcdCluster) -> Result<(), PlatformError> {
        if let Some(policy) = &cluster.spec.backup {
            self.policy = policy.clone();
        }
        let deployment = self.sidecar_deployment();
        self.platform
            .patch_deployment(
                &self.meta.namespace,
                &self.sidecar_name(),
                json!({ "spec": deployment.spec }),
            )
            .await
    }

    /// Brings an existing sidecar up to the image this operator expects.
    /// Called at controller start when the cluster is already Running.
    pub async fn upgrade_if_needed(&self) -> Result<(), PlatformError> {
        let deployment = self
            .platform
            .get_deployment(&self.meta.namespace, &self.sidecar_name())
            .await?;
        let current_image = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.as_deref());

        if current_image == Some(self.sidecar_image.as_str()) {
            return Ok(());
        }
        info!(
            cluster = %self.meta.name,
            from = current_image.unwrap_or(""),
            to = %self.sidecar_image,
            "upgrading backup sidecar image"
        );
        self.platform
            .patch_deployment(
                &self.meta.namespace,
                &self.sidecar_name(),
                json!({
                    "spec": { "template": { "spec": { "containers": [{
                        "name": "backup",
                        "image": self.sidecar_image,
                    }]}}}
                }),
            )
            .await
    }

    /// Removes the sidecar deployment and its service.
    pub async fn delete_backup_sidecar(&self) -> Result<(), PlatformError> {
        match self
            .platform
            .delete_deployment(&self.meta.namespace, &self.sidecar_name())
            .await
        {
            Ok(()) | Err(PlatformError::NotFound) => {}
            Err(e) => return Err(e),
        }
        match self
            .platform
            .delete_service(&self.meta.namespace, &self.sidecar_name())
            .await
        {
            Ok(()) | Err(PlatformError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Full teardown on cluster deletion: purge stored backups when the
    /// policy asks for it, then remove the sidecar and its volume claim.
    pub async fn cleanup(&self) -> Result<(), PlatformError> {
        if self.policy.cleanup_backups_on_cluster_delete {
            if let Err(e) = self
                .service
                .purge(&self.meta.namespace, &self.sidecar_name())
                .await
            {
                warn!(cluster = %self.meta.name, error = %e, "failed to purge stored backups");
            }
        }
        self.delete_backup_sidecar().await?;
        if self.policy.storage_type == BackupStorageType::PersistentVolume {
            match self
                .platform
                .delete_pvc(&self.meta.namespace, &self.pvc_name())
                .await
            {
                Ok(()) | Err(PlatformError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn get_status(&self) -> Result<BackupServiceStatus, BackupServiceError> {
        self.service
            .get_status(&self.meta.namespace, &self.sidecar_name())
            .await
    }

    pub async fn exists_backup(&self, version: &str) -> Result<bool, BackupServiceError> {
        self.service
            .exists_backup(&self.meta.namespace, &self.sidecar_name(), version)
            .await
    }

    pub async fn request_backup_now(&self) -> Result<(), BackupServiceError> {
        self.service
            .request_backup(&self.meta.namespace, &self.sidecar_name())
            .await
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "etcd-backup-sidecar".to_string()),
            (CLUSTER_LABEL.to_string(), self.meta.name.clone()),
        ])
    }

    /// The sidecar pod: snapshot schedule flags plus storage-specific
    /// wiring chosen here and nowhere else.
    fn sidecar_deployment(&self) -> Deployment {
        let mut args = vec![
            format!("--etcd-cluster={}", self.meta.name),
            format!("--listen=0.0.0.0:{}", BACKUP_SIDECAR_PORT),
            format!(
                "--backup-interval-in-second={}",
                self.policy.backup_interval_in_second
            ),
            format!("--max-backups={}", self.policy.max_backups),
        ];
        let mut env = Vec::new();
        let mut volumes = Vec::new();
        let mut volume_mounts = Vec::new();

        match self.policy.storage_type {
            BackupStorageType::PersistentVolume => {
                args.push("--storage-type=PersistentVolume".to_string());
                args.push(format!("--backup-dir={}", BACKUP_DIR));
                volumes.push(Volume {
                    name: BACKUP_VOLUME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: self.pvc_name(),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                volume_mounts.push(VolumeMount {
                    name: BACKUP_VOLUME.to_string(),
                    mount_path: BACKUP_DIR.to_string(),
                    ..Default::default()
                });
            }
            BackupStorageType::S3 => {
                args.push("--storage-type=S3".to_string());
                let (bucket, prefix, creds) = match &self.policy.s3 {
                    Some(src) => (
                        src.s3_bucket.clone(),
                        src.prefix.clone().unwrap_or_default(),
                        self.s3_fallback
                            .as_ref()
                            .map(|c| c.credentials_secret.clone())
                            .unwrap_or_default(),
                    ),
                    None => {
                        let ctx = self.s3_fallback.clone().unwrap_or_else(|| {
                            crate::config::S3Context {
                                bucket: String::new(),
                                prefix: String::new(),
                                credentials_secret: String::new(),
                            }
                        });
                        (ctx.bucket, ctx.prefix, ctx.credentials_secret)
                    }
                };
                args.push(format!("--s3-bucket={}", bucket));
                if !prefix.is_empty() {
                    args.push(format!("--s3-prefix={}", prefix));
                }
                env.push(secret_env("AWS_ACCESS_KEY_ID", &creds, "access-key"));
                env.push(secret_env("AWS_SECRET_ACCESS_KEY", &creds, "secret-key"));
            }
            BackupStorageType::ABS => {
                args.push("--storage-type=ABS".to_string());
                let (container, secret) = self
                    .policy
                    .abs
                    .as_ref()
                    .map(|a| (a.abs_container.clone(), a.abs_secret.clone().unwrap_or_default()))
                    .unwrap_or_default();
                args.push(format!("--abs-container={}", container));
                env.push(secret_env("AZURE_STORAGE_ACCOUNT", &secret, "storage-account"));
                env.push(secret_env("AZURE_STORAGE_KEY", &secret, "storage-key"));
            }
        }

        let container = Container {
            name: "backup".to_string(),
            image: Some(self.sidecar_image.clone()),
            args: Some(args),
            env: Some(env),
            ports: Some(vec![ContainerPort {
                name: Some("api".to_string()),
                container_port: BACKUP_SIDECAR_PORT,
                ..Default::default()
            }]),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.sidecar_name()),
                namespace: Some(self.meta.namespace.clone()),
                labels: Some(self.labels()),
                owner_references: Some(vec![self.meta.owner.clone()]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(volumes),
                        service_account_name: if self.service_account.is_empty() {
                            None
                        } else {
                            Some(self.service_account.clone())
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    fn sidecar_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.sidecar_name()),
                namespace: Some(self.meta.namespace.clone()),
                labels: Some(self.labels()),
                owner_references: Some(vec![self.meta.owner.clone()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(self.labels()),
                ports: Some(vec![ServicePort {
                    name: Some("api".to_string()),
                    port: BACKUP_SIDECAR_PORT,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn backup_pvc(&self) -> PersistentVolumeClaim {
        let size_mb = self
            .policy
            .pv
            .as_ref()
            .map(|pv| pv.volume_size_in_mb)
            .unwrap_or(512);
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.pvc_name()),
                namespace: Some(self.meta.namespace.clone()),
                labels: Some(self.labels()),
                annotations: Some(BTreeMap::from([(
                    "volume.beta.kubernetes.io/storage-provisioner".to_string(),
                    self.pv_provisioner.clone(),
                )])),
                owner_references: Some(vec![self.meta.owner.clone()]),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(format!("{}Mi", size_mb)),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[path = "backup_test.rs"]
mod backup_test;
