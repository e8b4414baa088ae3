//! EtcdCluster CRD
//!
//! The desired-state record for one managed etcd cluster: size, version,
//! pause flag, pod placement/storage policy, TLS references, backup policy.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{HostPathVolumeSource, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backup::BackupPolicy;
use crate::status::ClusterStatus;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "etcd.microscaler.io",
    version = "v1alpha1",
    kind = "EtcdCluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Desired number of etcd members (>= 1)
    pub size: i32,

    /// etcd version to run, e.g. "3.2.13"
    pub version: String,

    /// When true, the controller observes but does not mutate the cluster
    #[serde(default)]
    pub paused: bool,

    /// Pod placement and storage policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodPolicy>,

    /// Periodic backup policy; absent means no backup sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupPolicy>,

    /// TLS certificate references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsPolicy>,

    /// Self-hosted bootstrap settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_hosted: Option<SelfHostedPolicy>,
}

/// Pod-level policy: node placement plus exactly one storage mode
/// (volume claim template, host path, or neither for emptyDir).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPolicy {
    /// Node selector applied to member pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Spread member pods across nodes
    #[serde(default)]
    pub anti_affinity: bool,

    /// Claim template for per-member persistent volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_spec: Option<PersistentVolumeClaimSpec>,

    /// Host-path data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsPolicy {
    /// Pre-provisioned certificates held in secrets
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub static_tls: Option<StaticTls>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaticTls {
    /// Member-side certificates (peer and serving)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<MemberSecret>,

    /// Secret holding the client certificate the operator uses to reach
    /// etcd client ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberSecret {
    /// Secret with peer-to-peer certificates
    pub peer_secret: String,

    /// Secret with client-facing serving certificates
    pub server_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelfHostedPolicy {
    /// Client endpoint of an existing boot member to migrate from; empty
    /// means bootstrap a fresh self-hosted seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_member_client_endpoint: Option<String>,
}

/// Why a cluster spec was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidClusterSpec {
    #[error("cluster size must be >= 1, got {0}")]
    BadSize(i32),

    #[error("etcd version must not be empty")]
    EmptyVersion,

    #[error("backup policy: {0}")]
    BadBackupPolicy(String),

    #[error("tls policy: {0}")]
    BadTlsPolicy(String),
}

impl ClusterSpec {
    /// Validates the spec; setup refuses to proceed on error.
    pub fn validate(&self) -> Result<(), InvalidClusterSpec> {
        if self.size < 1 {
            return Err(InvalidClusterSpec::BadSize(self.size));
        }
        if self.version.trim().is_empty() {
            return Err(InvalidClusterSpec::EmptyVersion);
        }
        if let Some(backup) = &self.backup {
            backup
                .validate()
                .map_err(InvalidClusterSpec::BadBackupPolicy)?;
        }
        if let Some(tls) = &self.tls {
            if let Some(st) = &tls.static_tls {
                if let Some(member) = &st.member {
                    if member.peer_secret.is_empty() || member.server_secret.is_empty() {
                        return Err(InvalidClusterSpec::BadTlsPolicy(
                            "member secret names must not be empty".into(),
                        ));
                    }
                }
                if st.operator_secret.as_deref() == Some("") {
                    return Err(InvalidClusterSpec::BadTlsPolicy(
                        "operator secret name must not be empty".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Peer traffic runs over TLS.
    pub fn is_secure_peer(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(|t| t.static_tls.as_ref())
            .and_then(|s| s.member.as_ref())
            .is_some()
    }

    /// Client traffic runs over TLS (the operator then needs the client
    /// certificate from the operator secret).
    pub fn is_secure_client(&self) -> bool {
        self.operator_secret().is_some()
    }

    /// Name of the secret carrying the operator's etcd client certificate.
    pub fn operator_secret(&self) -> Option<&str> {
        self.tls
            .as_ref()
            .and_then(|t| t.static_tls.as_ref())
            .and_then(|s| s.operator_secret.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Spec equality as the reconcile loop sees it: size, version, paused
    /// flag, and a deep-equal backup policy. Everything else on the record
    /// (resource version, timestamps) is deliberately ignored.
    pub fn is_spec_equal(&self, other: &ClusterSpec) -> bool {
        self.size == other.size
            && self.version == other.version
            && self.paused == other.paused
            && self.backup == other.backup
    }
}

impl EtcdCluster {
    /// The single owner reference every child object carries.
    pub fn as_owner(&self) -> OwnerReference {
        OwnerReference {
            api_version: EtcdCluster::api_version(&()).to_string(),
            kind: EtcdCluster::kind(&()).to_string(),
            name: self.metadata.name.clone().unwrap_or_default(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            ..Default::default()
        }
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupPolicy, BackupStorageType, PVSource};

    fn base_spec() -> ClusterSpec {
        ClusterSpec {
            size: 3,
            version: "3.2.13".to_string(),
            paused: false,
            pod: None,
            backup: None,
            tls: None,
            self_hosted: None,
        }
    }

    #[test]
    fn validate_rejects_bad_size_and_version() {
        let mut spec = base_spec();
        spec.size = 0;
        assert_eq!(spec.validate(), Err(InvalidClusterSpec::BadSize(0)));

        let mut spec = base_spec();
        spec.version = " ".to_string();
        assert_eq!(spec.validate(), Err(InvalidClusterSpec::EmptyVersion));

        assert!(base_spec().validate().is_ok());
    }

    #[test]
    fn spec_equality_ignores_pod_policy() {
        let a = base_spec();
        let mut b = base_spec();
        b.pod = Some(PodPolicy {
            anti_affinity: true,
            ..Default::default()
        });
        assert!(a.is_spec_equal(&b));

        b.size = 5;
        assert!(!a.is_spec_equal(&b));
    }

    #[test]
    fn spec_equality_is_deep_on_backup_policy() {
        let mut a = base_spec();
        let mut b = base_spec();
        let policy = BackupPolicy {
            backup_interval_in_second: 1800,
            max_backups: 5,
            storage_type: BackupStorageType::PersistentVolume,
            pv: Some(PVSource {
                volume_size_in_mb: 512,
            }),
            ..Default::default()
        };
        a.backup = Some(policy.clone());
        b.backup = Some(policy);
        assert!(a.is_spec_equal(&b));

        b.backup.as_mut().unwrap().max_backups = 6;
        assert!(!a.is_spec_equal(&b));
    }

    #[test]
    fn tls_predicates() {
        let mut spec = base_spec();
        assert!(!spec.is_secure_peer());
        assert!(!spec.is_secure_client());

        spec.tls = Some(TlsPolicy {
            static_tls: Some(StaticTls {
                member: Some(MemberSecret {
                    peer_secret: "peer".into(),
                    server_secret: "server".into(),
                }),
                operator_secret: Some("op".into()),
            }),
        });
        assert!(spec.is_secure_peer());
        assert!(spec.is_secure_client());
        assert_eq!(spec.operator_secret(), Some("op"));
    }
}
