//! Test utilities for unit testing the reconcile engine.
//!
//! In-memory implementations of the platform, record, and backup-service
//! traits plus fixture constructors. Scenario tests drive the engine's
//! tick and event methods directly against these mocks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodStatus, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crds::{BackupServiceStatus, ClusterSpec, EtcdCluster};
use etcd_admin::MockEtcdAdmin;

use crate::cluster::backup::{BackupServiceError, BackupServiceOps};
use crate::cluster::Cluster;
use crate::config::{Config, S3Context};
use crate::k8s::{Platform, PlatformError};
use crate::metrics::MetricsSink;
use crate::record::{ClusterRecordOps, RecordError};

pub const TEST_UID: &str = "0000-1111-2222-3333";

/// Call counters shared by assertions about "at most one action per tick".
#[derive(Debug, Default, Clone)]
pub struct PlatformCounters {
    pub pod_creates: usize,
    pub pod_deletes: usize,
    pub pvc_creates: usize,
    pub pvc_deletes: usize,
    pub service_creates: usize,
    pub service_deletes: usize,
    pub deployment_creates: usize,
    pub deployment_patches: usize,
    pub deployment_deletes: usize,
}

impl PlatformCounters {
    /// Pod-level mutations; the one-step-per-tick property is about these
    /// plus etcd membership calls.
    pub fn pod_mutations(&self) -> usize {
        self.pod_creates + self.pod_deletes
    }

    /// Every write the platform saw; the paused invariant is about this.
    pub fn total_mutations(&self) -> usize {
        self.pod_creates
            + self.pod_deletes
            + self.pvc_creates
            + self.pvc_deletes
            + self.service_creates
            + self.service_deletes
            + self.deployment_creates
            + self.deployment_patches
            + self.deployment_deletes
    }
}

/// In-memory `Platform`. Objects are keyed by name; a single namespace is
/// assumed, which is all the engine tests need.
#[derive(Clone, Default)]
pub struct MockPlatform {
    pods: Arc<Mutex<BTreeMap<String, Pod>>>,
    services: Arc<Mutex<BTreeMap<String, Service>>>,
    pvcs: Arc<Mutex<BTreeMap<String, PersistentVolumeClaim>>>,
    deployments: Arc<Mutex<BTreeMap<String, Deployment>>>,
    secrets: Arc<Mutex<BTreeMap<String, Secret>>>,
    counters: Arc<Mutex<PlatformCounters>>,
    fail_pod_create: Arc<Mutex<bool>>,
    fail_deployment_create: Arc<Mutex<bool>>,
    fail_pod_list: Arc<Mutex<bool>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> PlatformCounters {
        self.counters.lock().unwrap().clone()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.pods.lock().unwrap().keys().cloned().collect()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.pods.lock().unwrap().get(name).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.lock().unwrap().keys().cloned().collect()
    }

    pub fn pvc_names(&self) -> Vec<String> {
        self.pvcs.lock().unwrap().keys().cloned().collect()
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.deployments.lock().unwrap().get(name).cloned()
    }

    pub fn deployment_names(&self) -> Vec<String> {
        self.deployments.lock().unwrap().keys().cloned().collect()
    }

    pub fn insert_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.lock().unwrap().insert(name, pod);
    }

    pub fn insert_secret(&self, name: &str, entries: &[(&str, &[u8])]) {
        let data: BTreeMap<String, ByteString> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
            .collect();
        self.secrets.lock().unwrap().insert(
            name.to_string(),
            Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            },
        );
    }

    pub fn set_pod_phase(&self, name: &str, phase: &str) {
        if let Some(pod) = self.pods.lock().unwrap().get_mut(name) {
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
        }
    }

    pub fn mark_all_pods_running(&self) {
        let mut pods = self.pods.lock().unwrap();
        for pod in pods.values_mut() {
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            });
        }
    }

    pub fn fail_pod_create(&self, fail: bool) {
        *self.fail_pod_create.lock().unwrap() = fail;
    }

    pub fn fail_deployment_create(&self, fail: bool) {
        *self.fail_deployment_create.lock().unwrap() = fail;
    }

    pub fn fail_pod_list(&self, fail: bool) {
        *self.fail_pod_list.lock().unwrap() = fail;
    }

    /// Matches "key=value" and bare "key" label selectors.
    fn matches(selector: &str, meta: &ObjectMeta) -> bool {
        let labels = meta.labels.clone().unwrap_or_default();
        match selector.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(selector),
        }
    }
}

#[async_trait::async_trait]
impl Platform for MockPlatform {
    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<Pod, PlatformError> {
        if *self.fail_pod_create.lock().unwrap() {
            return Err(PlatformError::Api("injected pod create failure".into()));
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut pods = self.pods.lock().unwrap();
        if pods.contains_key(&name) {
            return Err(PlatformError::AlreadyExists);
        }
        let mut stored = pod.clone();
        stored.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        pods.insert(name, stored.clone());
        self.counters.lock().unwrap().pod_creates += 1;
        Ok(stored)
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        name: &str,
        _grace_period_seconds: u32,
    ) -> Result<(), PlatformError> {
        self.counters.lock().unwrap().pod_deletes += 1;
        match self.pods.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotFound),
        }
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, PlatformError> {
        if *self.fail_pod_list.lock().unwrap() {
            return Err(PlatformError::Api("injected pod list failure".into()));
        }
        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|p| Self::matches(label_selector, &p.metadata))
            .cloned()
            .collect())
    }

    async fn create_pvc(
        &self,
        _namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), PlatformError> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        let mut pvcs = self.pvcs.lock().unwrap();
        if pvcs.contains_key(&name) {
            return Err(PlatformError::AlreadyExists);
        }
        pvcs.insert(name, pvc.clone());
        self.counters.lock().unwrap().pvc_creates += 1;
        Ok(())
    }

    async fn delete_pvc(&self, _namespace: &str, name: &str) -> Result<(), PlatformError> {
        self.counters.lock().unwrap().pvc_deletes += 1;
        match self.pvcs.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotFound),
        }
    }

    async fn list_pvcs(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, PlatformError> {
        Ok(self
            .pvcs
            .lock()
            .unwrap()
            .values()
            .filter(|p| Self::matches(label_selector, &p.metadata))
            .cloned()
            .collect())
    }

    async fn create_service(&self, _namespace: &str, svc: &Service) -> Result<(), PlatformError> {
        let name = svc.metadata.name.clone().unwrap_or_default();
        let mut services = self.services.lock().unwrap();
        if services.contains_key(&name) {
            return Err(PlatformError::AlreadyExists);
        }
        services.insert(name, svc.clone());
        self.counters.lock().unwrap().service_creates += 1;
        Ok(())
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<(), PlatformError> {
        self.counters.lock().unwrap().service_deletes += 1;
        match self.services.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotFound),
        }
    }

    async fn list_services(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Service>, PlatformError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .values()
            .filter(|s| Self::matches(label_selector, &s.metadata))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Secret, PlatformError> {
        self.secrets
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(PlatformError::NotFound)
    }

    async fn create_deployment(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), PlatformError> {
        if *self.fail_deployment_create.lock().unwrap() {
            return Err(PlatformError::Api("injected deployment create failure".into()));
        }
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut deployments = self.deployments.lock().unwrap();
        if deployments.contains_key(&name) {
            return Err(PlatformError::AlreadyExists);
        }
        deployments.insert(name, deployment.clone());
        self.counters.lock().unwrap().deployment_creates += 1;
        Ok(())
    }

    async fn get_deployment(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Deployment, PlatformError> {
        self.deployments
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(PlatformError::NotFound)
    }

    async fn patch_deployment(
        &self,
        _namespace: &str,
        name: &str,
        _patch: serde_json::Value,
    ) -> Result<(), PlatformError> {
        self.counters.lock().unwrap().deployment_patches += 1;
        if self.deployments.lock().unwrap().contains_key(name) {
            Ok(())
        } else {
            Err(PlatformError::NotFound)
        }
    }

    async fn delete_deployment(&self, _namespace: &str, name: &str) -> Result<(), PlatformError> {
        self.counters.lock().unwrap().deployment_deletes += 1;
        match self.deployments.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotFound),
        }
    }
}

/// In-memory cluster record store.
#[derive(Clone, Default)]
pub struct MockRecordClient {
    stored: Arc<Mutex<Option<EtcdCluster>>>,
    writes: Arc<Mutex<usize>>,
}

impl MockRecordClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> Option<EtcdCluster> {
        self.stored.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl ClusterRecordOps for MockRecordClient {
    async fn get(&self, _namespace: &str, _name: &str) -> Result<EtcdCluster, RecordError> {
        self.stored.lock().unwrap().clone().ok_or(RecordError::NotFound)
    }

    async fn update_status(&self, cluster: &EtcdCluster) -> Result<EtcdCluster, RecordError> {
        *self.writes.lock().unwrap() += 1;
        *self.stored.lock().unwrap() = Some(cluster.clone());
        Ok(cluster.clone())
    }
}

/// In-memory backup sidecar API.
#[derive(Clone)]
pub struct MockBackupService {
    status: Arc<Mutex<BackupServiceStatus>>,
    exists: Arc<Mutex<bool>>,
    unreachable: Arc<Mutex<bool>>,
    backups_requested: Arc<Mutex<usize>>,
    purges: Arc<Mutex<usize>>,
}

impl Default for MockBackupService {
    fn default() -> Self {
        Self {
            status: Arc::new(Mutex::new(BackupServiceStatus::default())),
            exists: Arc::new(Mutex::new(false)),
            unreachable: Arc::new(Mutex::new(false)),
            backups_requested: Arc::new(Mutex::new(0)),
            purges: Arc::new(Mutex::new(0)),
        }
    }
}

impl MockBackupService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_exists(&self, exists: bool) {
        *self.exists.lock().unwrap() = exists;
    }

    pub fn set_status(&self, status: BackupServiceStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().unwrap() = unreachable;
    }

    pub fn purges(&self) -> usize {
        *self.purges.lock().unwrap()
    }

    pub fn backups_requested(&self) -> usize {
        *self.backups_requested.lock().unwrap()
    }

    fn check_reachable(&self) -> Result<(), BackupServiceError> {
        if *self.unreachable.lock().unwrap() {
            return Err(BackupServiceError::Api {
                status: 503,
                message: "injected backup service outage".into(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackupServiceOps for MockBackupService {
    async fn get_status(
        &self,
        _namespace: &str,
        _service: &str,
    ) -> Result<BackupServiceStatus, BackupServiceError> {
        self.check_reachable()?;
        Ok(self.status.lock().unwrap().clone())
    }

    async fn exists_backup(
        &self,
        _namespace: &str,
        _service: &str,
        _version: &str,
    ) -> Result<bool, BackupServiceError> {
        self.check_reachable()?;
        Ok(*self.exists.lock().unwrap())
    }

    async fn request_backup(
        &self,
        _namespace: &str,
        _service: &str,
    ) -> Result<(), BackupServiceError> {
        self.check_reachable()?;
        *self.backups_requested.lock().unwrap() += 1;
        Ok(())
    }

    async fn purge(&self, _namespace: &str, _service: &str) -> Result<(), BackupServiceError> {
        self.check_reachable()?;
        *self.purges.lock().unwrap() += 1;
        Ok(())
    }
}

/// Records every metric emission for assertions.
#[derive(Clone, Default)]
pub struct RecordingMetrics {
    failures: Arc<Mutex<Vec<String>>>,
    observations: Arc<Mutex<usize>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    pub fn observations(&self) -> usize {
        *self.observations.lock().unwrap()
    }
}

impl MetricsSink for RecordingMetrics {
    fn reconcile_failed(&self, reason: &str) {
        self.failures.lock().unwrap().push(reason.to_string());
    }

    fn observe_reconcile(&self, _cluster: &str, _seconds: f64) {
        *self.observations.lock().unwrap() += 1;
    }

    fn clusters_changed(&self, _delta: i64) {}
}

/// All mocks plus the Config wired to them.
pub struct TestFixture {
    pub platform: Arc<MockPlatform>,
    pub record: Arc<MockRecordClient>,
    pub etcd: Arc<MockEtcdAdmin>,
    pub backup: Arc<MockBackupService>,
    pub metrics: Arc<RecordingMetrics>,
    pub config: Config,
}

pub fn test_fixture() -> TestFixture {
    let platform = Arc::new(MockPlatform::new());
    let record = Arc::new(MockRecordClient::new());
    let etcd = Arc::new(MockEtcdAdmin::new());
    let backup = Arc::new(MockBackupService::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let config = Config {
        pv_provisioner: "kubernetes.io/gce-pd".to_string(),
        service_account: "etcd-operator".to_string(),
        s3_context: Some(S3Context {
            bucket: "test-bucket".to_string(),
            prefix: "clusters".to_string(),
            credentials_secret: "s3-creds".to_string(),
        }),
        backup_sidecar_image: "example/etcd-backup-sidecar:v1".to_string(),
        platform: platform.clone(),
        record: record.clone(),
        etcd: etcd.clone(),
        backup_service: backup.clone(),
        metrics: metrics.clone(),
    };
    TestFixture {
        platform,
        record,
        etcd,
        backup,
        metrics,
        config,
    }
}

pub fn test_cluster_record(name: &str, size: i32, version: &str) -> EtcdCluster {
    EtcdCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(TEST_UID.to_string()),
            ..Default::default()
        },
        spec: ClusterSpec {
            size,
            version: version.to_string(),
            paused: false,
            pod: None,
            backup: None,
            tls: None,
            self_hosted: None,
        },
        status: None,
    }
}

/// An engine instance wired to the fixture, not yet set up.
pub fn test_cluster(fixture: &TestFixture, record: EtcdCluster) -> Cluster {
    let (cluster, _handle) = Cluster::new(fixture.config.clone(), record);
    cluster
}

/// A member pod as the engine would have created it, for restart and
/// observation tests.
pub fn member_pod(cluster: &EtcdCluster, ordinal: u64, version: &str, phase: &str) -> Pod {
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
    let name = etcd_admin::member_name(cluster_name, ordinal);
    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.metadata.namespace.clone(),
            labels: Some(crate::k8s::pod::pod_labels(cluster_name, &name)),
            owner_references: Some(vec![cluster.as_owner()]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "etcd".to_string(),
                image: Some(crate::k8s::pod::etcd_image(version)),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}
