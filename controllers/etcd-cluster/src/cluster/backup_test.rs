//! Unit tests for the backup manager facade.

use crds::{ABSSource, BackupPolicy, BackupStorageType, PVSource, S3Source};

use super::{BackupManager, ClusterMeta};
use crate::k8s::backup_sidecar_name;
use crate::test_utils::*;

fn policy(storage_type: BackupStorageType) -> BackupPolicy {
    BackupPolicy {
        backup_interval_in_second: 1800,
        max_backups: 5,
        storage_type,
        pv: Some(PVSource {
            volume_size_in_mb: 512,
        }),
        ..Default::default()
    }
}

fn manager(fixture: &TestFixture, policy: BackupPolicy) -> BackupManager {
    let record = test_cluster_record("c1", 3, "3.2.13");
    BackupManager::new(&fixture.config, ClusterMeta::from_cluster(&record), policy)
}

fn sidecar_args(fixture: &TestFixture) -> Vec<String> {
    fixture
        .platform
        .deployment(&backup_sidecar_name("c1"))
        .unwrap()
        .spec
        .unwrap()
        .template
        .spec
        .unwrap()
        .containers[0]
        .args
        .clone()
        .unwrap()
}

#[tokio::test]
async fn pv_sidecar_mounts_backup_claim() {
    let fixture = test_fixture();
    let bm = manager(&fixture, policy(BackupStorageType::PersistentVolume));
    bm.setup().await.unwrap();

    assert_eq!(fixture.platform.pvc_names(), vec!["c1-backup-pvc"]);
    let args = sidecar_args(&fixture);
    assert!(args.contains(&"--storage-type=PersistentVolume".to_string()));

    let dep = fixture.platform.deployment(&backup_sidecar_name("c1")).unwrap();
    let pod_spec = dep.spec.unwrap().template.spec.unwrap();
    let volumes = pod_spec.volumes.unwrap();
    assert!(volumes.iter().any(|v| {
        v.persistent_volume_claim
            .as_ref()
            .map(|c| c.claim_name.as_str())
            == Some("c1-backup-pvc")
    }));
    // one owner reference back to the cluster record
    let owners = dep.metadata.owner_references.unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, TEST_UID);
}

#[tokio::test]
async fn s3_sidecar_falls_back_to_operator_context() {
    let fixture = test_fixture();
    let mut p = policy(BackupStorageType::S3);
    p.pv = None;
    let bm = manager(&fixture, p);
    bm.setup().await.unwrap();

    let args = sidecar_args(&fixture);
    assert!(args.contains(&"--storage-type=S3".to_string()));
    // operator-level context supplies the bucket
    assert!(args.contains(&"--s3-bucket=test-bucket".to_string()));
    assert!(fixture.platform.pvc_names().is_empty());

    let dep = fixture.platform.deployment(&backup_sidecar_name("c1")).unwrap();
    let env = dep.spec.unwrap().template.spec.unwrap().containers[0]
        .env
        .clone()
        .unwrap();
    assert!(env.iter().any(|e| e.name == "AWS_ACCESS_KEY_ID"));
    assert!(env.iter().any(|e| e.name == "AWS_SECRET_ACCESS_KEY"));
}

#[tokio::test]
async fn s3_sidecar_prefers_per_cluster_source() {
    let fixture = test_fixture();
    let mut p = policy(BackupStorageType::S3);
    p.pv = None;
    p.s3 = Some(S3Source {
        s3_bucket: "cluster-bucket".to_string(),
        prefix: Some("c1".to_string()),
    });
    let bm = manager(&fixture, p);
    bm.setup().await.unwrap();

    let args = sidecar_args(&fixture);
    assert!(args.contains(&"--s3-bucket=cluster-bucket".to_string()));
    assert!(args.contains(&"--s3-prefix=c1".to_string()));
}

#[tokio::test]
async fn abs_sidecar_wires_container_and_credentials() {
    let fixture = test_fixture();
    let mut p = policy(BackupStorageType::ABS);
    p.pv = None;
    p.abs = Some(ABSSource {
        abs_container: "etcd-backups".to_string(),
        abs_secret: Some("abs-creds".to_string()),
    });
    let bm = manager(&fixture, p);
    bm.setup().await.unwrap();

    let args = sidecar_args(&fixture);
    assert!(args.contains(&"--abs-container=etcd-backups".to_string()));

    let dep = fixture.platform.deployment(&backup_sidecar_name("c1")).unwrap();
    let env = dep.spec.unwrap().template.spec.unwrap().containers[0]
        .env
        .clone()
        .unwrap();
    assert!(env.iter().any(|e| e.name == "AZURE_STORAGE_ACCOUNT"));
}

#[tokio::test]
async fn setup_twice_is_idempotent() {
    let fixture = test_fixture();
    let bm = manager(&fixture, policy(BackupStorageType::PersistentVolume));
    bm.setup().await.unwrap();
    bm.setup().await.unwrap();

    let counters = fixture.platform.counters();
    assert_eq!(counters.deployment_creates, 1);
    assert_eq!(counters.pvc_creates, 1);
}

#[tokio::test]
async fn upgrade_patches_only_on_image_mismatch() {
    let fixture = test_fixture();
    let bm = manager(&fixture, policy(BackupStorageType::PersistentVolume));
    bm.setup().await.unwrap();

    // image already matches: no patch
    bm.upgrade_if_needed().await.unwrap();
    assert_eq!(fixture.platform.counters().deployment_patches, 0);
}

#[tokio::test]
async fn delete_backup_sidecar_tolerates_missing_objects() {
    let fixture = test_fixture();
    let bm = manager(&fixture, policy(BackupStorageType::PersistentVolume));

    // nothing was ever created
    bm.delete_backup_sidecar().await.unwrap();

    bm.setup().await.unwrap();
    bm.delete_backup_sidecar().await.unwrap();
    assert!(fixture.platform.deployment_names().is_empty());
}

#[tokio::test]
async fn cleanup_purges_backups_when_policy_asks() {
    let fixture = test_fixture();
    let mut p = policy(BackupStorageType::PersistentVolume);
    p.cleanup_backups_on_cluster_delete = true;
    let bm = manager(&fixture, p);
    bm.setup().await.unwrap();

    bm.cleanup().await.unwrap();

    assert_eq!(fixture.backup.purges(), 1);
    assert!(fixture.platform.deployment_names().is_empty());
    assert!(fixture.platform.pvc_names().is_empty());
}

#[tokio::test]
async fn cleanup_without_flag_leaves_remote_backups() {
    let fixture = test_fixture();
    let bm = manager(&fixture, policy(BackupStorageType::PersistentVolume));
    bm.setup().await.unwrap();

    bm.cleanup().await.unwrap();
    assert_eq!(fixture.backup.purges(), 0);
}
