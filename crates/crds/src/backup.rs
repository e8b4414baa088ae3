//! Backup policy and backup-service status types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Periodic backup policy for a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicy {
    /// Seconds between snapshots; 0 disables the periodic schedule
    #[serde(default)]
    pub backup_interval_in_second: i64,

    /// How many backups the sidecar retains before purging
    #[serde(default)]
    pub max_backups: i32,

    /// Where snapshots are written
    #[serde(default)]
    pub storage_type: BackupStorageType,

    /// PersistentVolume storage settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv: Option<PVSource>,

    /// S3 storage settings; absent falls back to the operator-level S3
    /// context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Source>,

    /// Azure Blob Storage settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs: Option<ABSSource>,

    /// Also remove stored backups when the cluster is deleted
    #[serde(default)]
    pub cleanup_backups_on_cluster_delete: bool,
}

impl BackupPolicy {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.backup_interval_in_second < 0 {
            return Err("backup interval must not be negative".into());
        }
        if self.max_backups < 0 {
            return Err("max backups must not be negative".into());
        }
        match self.storage_type {
            BackupStorageType::PersistentVolume => match &self.pv {
                Some(pv) if pv.volume_size_in_mb > 0 => Ok(()),
                Some(_) => Err("pv volume size must be > 0".into()),
                None => Err("storage type PersistentVolume requires a pv source".into()),
            },
            BackupStorageType::ABS => {
                if self.abs.as_ref().is_some_and(|a| !a.abs_container.is_empty()) {
                    Ok(())
                } else {
                    Err("storage type ABS requires an abs source with a container".into())
                }
            }
            // per-policy source optional: the operator-level S3 context is
            // the fallback
            BackupStorageType::S3 => Ok(()),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum BackupStorageType {
    #[default]
    PersistentVolume,
    S3,
    ABS,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PVSource {
    /// Size of the backup volume in MB
    pub volume_size_in_mb: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    /// Bucket backups are uploaded to
    pub s3_bucket: String,

    /// Key prefix inside the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ABSSource {
    /// Blob container backups are uploaded to
    pub abs_container: String,

    /// Secret holding the storage account credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_secret: Option<String>,
}

/// Status reported by the backup sidecar, mirrored onto the cluster record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupServiceStatus {
    /// Number of backups currently retained
    #[serde(default)]
    pub backups: i32,

    /// Total size of retained backups in MB
    #[serde(default)]
    pub backup_size: f64,

    /// The most recent backup, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_backup: Option<BackupInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// When the snapshot was taken (RFC 3339)
    #[serde(default)]
    pub creation_time: String,

    /// Snapshot size in MB
    #[serde(default)]
    pub size: f64,

    /// etcd server version the snapshot was taken from
    #[serde(default)]
    pub version: String,

    /// etcd store revision captured by the snapshot
    #[serde(default)]
    pub revision: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pv_policy_requires_sized_source() {
        let mut policy = BackupPolicy {
            storage_type: BackupStorageType::PersistentVolume,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        policy.pv = Some(PVSource {
            volume_size_in_mb: 0,
        });
        assert!(policy.validate().is_err());

        policy.pv = Some(PVSource {
            volume_size_in_mb: 512,
        });
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn s3_policy_may_rely_on_operator_context() {
        let policy = BackupPolicy {
            storage_type: BackupStorageType::S3,
            ..Default::default()
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn abs_policy_requires_container() {
        let mut policy = BackupPolicy {
            storage_type: BackupStorageType::ABS,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        policy.abs = Some(ABSSource {
            abs_container: "backups".into(),
            abs_secret: Some("abs-creds".into()),
        });
        assert!(policy.validate().is_ok());
    }
}
