//! etcd member pod construction.
//!
//! Builds the pod specifications the reconcile engine submits: seed pods
//! (fresh bootstrap token), joining pods (existing cluster state), and
//! recovery pods (init step restoring the data dir from the latest backup).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, HostPathVolumeSource,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodAffinityTerm, PodAntiAffinity, PodSpec, Probe, SecretVolumeSource, TCPSocketAction,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crds::ClusterSpec;
use etcd_admin::Member;

use super::{
    backup_sidecar_name, APP_LABEL_VALUE, BACKUP_SIDECAR_PORT, CLUSTER_LABEL, ETCD_CLIENT_PORT,
    ETCD_PEER_PORT,
};

const DATA_DIR: &str = "/var/etcd/data";
const DATA_VOLUME: &str = "etcd-data";
const PEER_TLS_DIR: &str = "/etc/etcdtls/member/peer-tls";
const PEER_TLS_VOLUME: &str = "member-peer-tls";
const SERVER_TLS_DIR: &str = "/etc/etcdtls/member/server-tls";
const SERVER_TLS_VOLUME: &str = "member-server-tls";

pub fn etcd_image(version: &str) -> String {
    format!("quay.io/coreos/etcd:v{}", version)
}

/// Recovers the etcd version a pod runs from its container image tag.
pub fn etcd_version_from_pod(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()?
        .rsplit_once(":v")
        .map(|(_, v)| v)
}

pub fn pod_labels(cluster_name: &str, member_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL_VALUE.to_string()),
        ("etcd_node".to_string(), member_name.to_string()),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Builds a member pod.
///
/// `initial_cluster` is the full `name=peerURL` list the member starts
/// with; `state` is `"new"` for the seed (with a fresh `token`) and
/// `"existing"` for members joining a live cluster. Storage is attached
/// separately with [`add_etcd_volume_to_pod`].
pub fn new_etcd_pod(
    m: &Member,
    initial_cluster: &[String],
    cluster_name: &str,
    state: &str,
    token: &str,
    spec: &ClusterSpec,
    owner: OwnerReference,
) -> Pod {
    let mut command = vec![
        "/usr/local/bin/etcd".to_string(),
        format!("--data-dir={}", DATA_DIR),
        format!("--name={}", m.name),
        format!("--initial-advertise-peer-urls={}", m.peer_url()),
        format!(
            "--listen-peer-urls={}://0.0.0.0:{}",
            if m.secure_peer { "https" } else { "http" },
            ETCD_PEER_PORT
        ),
        format!(
            "--listen-client-urls={}://0.0.0.0:{}",
            if m.secure_client { "https" } else { "http" },
            ETCD_CLIENT_PORT
        ),
        format!("--advertise-client-urls={}", m.client_url()),
        format!("--initial-cluster={}", initial_cluster.join(",")),
        format!("--initial-cluster-state={}", state),
    ];
    if state == "new" {
        command.push(format!("--initial-cluster-token={}", token));
    }

    let mut volume_mounts = vec![VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: DATA_DIR.to_string(),
        ..Default::default()
    }];
    let mut volumes = Vec::new();

    if m.secure_peer {
        command.extend([
            "--peer-client-cert-auth=true".to_string(),
            format!("--peer-trusted-ca-file={}/peer-ca.crt", PEER_TLS_DIR),
            format!("--peer-cert-file={}/peer.crt", PEER_TLS_DIR),
            format!("--peer-key-file={}/peer.key", PEER_TLS_DIR),
        ]);
        let peer_secret = spec
            .tls
            .as_ref()
            .and_then(|t| t.static_tls.as_ref())
            .and_then(|s| s.member.as_ref())
            .map(|ms| ms.peer_secret.clone())
            .unwrap_or_default();
        volume_mounts.push(VolumeMount {
            name: PEER_TLS_VOLUME.to_string(),
            mount_path: PEER_TLS_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(secret_volume(PEER_TLS_VOLUME, &peer_secret));
    }

    if m.secure_client {
        command.extend([
            "--client-cert-auth=true".to_string(),
            format!("--trusted-ca-file={}/server-ca.crt", SERVER_TLS_DIR),
            format!("--cert-file={}/server.crt", SERVER_TLS_DIR),
            format!("--key-file={}/server.key", SERVER_TLS_DIR),
        ]);
        let server_secret = spec
            .tls
            .as_ref()
            .and_then(|t| t.static_tls.as_ref())
            .and_then(|s| s.member.as_ref())
            .map(|ms| ms.server_secret.clone())
            .unwrap_or_default();
        volume_mounts.push(VolumeMount {
            name: SERVER_TLS_VOLUME.to_string(),
            mount_path: SERVER_TLS_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(secret_volume(SERVER_TLS_VOLUME, &server_secret));
    }

    let container = Container {
        name: "etcd".to_string(),
        image: Some(etcd_image(&spec.version)),
        command: Some(command),
        ports: Some(vec![
            ContainerPort {
                name: Some("server".to_string()),
                container_port: ETCD_PEER_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("client".to_string()),
                container_port: ETCD_CLIENT_PORT,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(volume_mounts),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(ETCD_CLIENT_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(1),
            period_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pod_policy = spec.pod.as_ref();
    let affinity = pod_policy.filter(|p| p.anti_affinity).map(|_| Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        CLUSTER_LABEL.to_string(),
                        cluster_name.to_string(),
                    )])),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(m.name.clone()),
            namespace: Some(m.namespace.clone()),
            labels: Some(pod_labels(cluster_name, &m.name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            // members joining at the next counter must not race a dying pod
            // of the same name; the operator restarts members itself
            restart_policy: Some("Never".to_string()),
            // per-pod DNS through the headless peer service
            hostname: Some(m.name.clone()),
            subdomain: Some(cluster_name.to_string()),
            node_selector: pod_policy.and_then(|p| p.node_selector.clone()),
            affinity,
            ..Default::default()
        }),
        status: None,
    }
}

/// Prepends the recovery init step: fetch the latest snapshot from the
/// backup sidecar and restore it into the data dir before etcd starts.
pub fn add_recovery_to_pod(
    pod: &mut Pod,
    cluster_name: &str,
    token: &str,
    m: &Member,
    spec: &ClusterSpec,
) {
    let backup_url = format!(
        "http://{}.{}.svc:{}/v1/backup?etcdVersion={}",
        backup_sidecar_name(cluster_name),
        m.namespace,
        BACKUP_SIDECAR_PORT,
        spec.version
    );
    let restore = format!(
        "wget -O /var/etcd/latest.snapshot '{url}' && \
         ETCDCTL_API=3 etcdctl snapshot restore /var/etcd/latest.snapshot \
         --name {name} \
         --initial-cluster {name}={peer} \
         --initial-cluster-token {token} \
         --initial-advertise-peer-urls {peer} \
         --data-dir {dir} && rm /var/etcd/latest.snapshot",
        url = backup_url,
        name = m.name,
        peer = m.peer_url(),
        token = token,
        dir = DATA_DIR,
    );

    let init = Container {
        name: "fetch-backup".to_string(),
        image: Some(etcd_image(&spec.version)),
        command: Some(vec!["/bin/sh".to_string(), "-ec".to_string(), restore]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: "/var/etcd".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    if let Some(pod_spec) = pod.spec.as_mut() {
        pod_spec
            .init_containers
            .get_or_insert_with(Vec::new)
            .insert(0, init);
    }
}

/// Claim for a member's data volume when the pod policy carries a claim
/// template.
pub fn new_etcd_pod_pvc(
    m: &Member,
    pvc_spec: PersistentVolumeClaimSpec,
    cluster_name: &str,
    namespace: &str,
    owner: OwnerReference,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(member_pvc_name(m)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                CLUSTER_LABEL.to_string(),
                cluster_name.to_string(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(pvc_spec),
        status: None,
    }
}

pub fn member_pvc_name(m: &Member) -> String {
    format!("pvc-{}", m.name)
}

/// Attaches exactly one storage mode to the pod's data volume: a claim, a
/// host path, or an emptyDir.
pub fn add_etcd_volume_to_pod(
    pod: &mut Pod,
    pvc_name: Option<&str>,
    host_path: Option<&HostPathVolumeSource>,
) {
    let volume = match (pvc_name, host_path) {
        (Some(claim), _) => Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        (None, Some(hp)) => Volume {
            name: DATA_VOLUME.to_string(),
            host_path: Some(hp.clone()),
            ..Default::default()
        },
        (None, None) => Volume {
            name: DATA_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    };

    if let Some(spec) = pod.spec.as_mut() {
        spec.volumes.get_or_insert_with(Vec::new).push(volume);
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
