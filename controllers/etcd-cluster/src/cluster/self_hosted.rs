//! Self-hosted bootstrap paths.
//!
//! A self-hosted cluster serves the control plane that schedules it, so
//! its members run on the host network and keep their data on the host:
//! the platform must be able to reach etcd before cluster networking is
//! up, and the data must survive pod churn without a volume provisioner.

use k8s_openapi::api::core::v1::HostPathVolumeSource;
use tracing::info;
use uuid::Uuid;

use etcd_admin::{member_name, Member, MemberSet};

use super::Cluster;
use crate::error::ClusterError;
use crate::k8s::pod::{add_etcd_volume_to_pod, new_etcd_pod};

impl Cluster {
    /// Bootstraps the seed member of a fresh self-hosted cluster.
    pub(crate) async fn new_self_hosted_seed_member(&mut self) -> Result<(), ClusterError> {
        let m = self.next_member();
        let ms = MemberSet::with_member(m.clone());
        let token = Uuid::new_v4().to_string();

        let pod = self.self_hosted_pod(&ms, &m, "new", &token);
        self.config.platform.create_pod(self.namespace(), &pod).await?;

        self.member_counter += 1;
        self.members = Some(ms);
        info!(cluster = %self.name(), seed = %m.name, "self-hosted cluster created with seed member");
        Ok(())
    }

    /// Joins a new member to an external boot member and takes over from
    /// it: the boot member's cluster grows by our seed, which then carries
    /// the data forward.
    pub(crate) async fn migrate_boot_member(&mut self, endpoint: &str) -> Result<(), ClusterError> {
        let m = self.next_member();
        let boot_endpoints = vec![endpoint.to_string()];

        info!(
            cluster = %self.name(),
            boot_endpoint = %endpoint,
            member = %m.name,
            "migrating from boot member"
        );

        self.config
            .etcd
            .member_add(&boot_endpoints, &m.peer_url(), self.tls.as_ref())
            .await?;

        // initial cluster = everything the boot cluster knows plus us;
        // the freshly added entry comes back unnamed
        let existing = self
            .config
            .etcd
            .member_list(&boot_endpoints, self.tls.as_ref())
            .await?;
        let mut initial_cluster: Vec<String> = existing
            .iter()
            .filter(|em| !em.name.is_empty())
            .flat_map(|em| {
                em.peer_urls
                    .iter()
                    .map(|u| format!("{}={}", em.name, u))
                    .collect::<Vec<_>>()
            })
            .collect();
        initial_cluster.push(format!("{}={}", m.name, m.peer_url()));
        initial_cluster.sort();

        let ms = MemberSet::with_member(m.clone());
        let mut pod = new_etcd_pod(
            &m,
            &initial_cluster,
            self.name(),
            "existing",
            "",
            &self.cluster.spec,
            self.cluster.as_owner(),
        );
        self.apply_self_hosted_overrides(&mut pod, &m);
        self.config.platform.create_pod(self.namespace(), &pod).await?;

        self.member_counter += 1;
        self.members = Some(ms);
        Ok(())
    }

    fn next_member(&self) -> Member {
        Member::new(
            member_name(self.name(), self.member_counter),
            self.namespace(),
            self.is_secure_peer(),
            self.is_secure_client(),
        )
    }

    fn self_hosted_pod(
        &self,
        members: &MemberSet,
        m: &Member,
        state: &str,
        token: &str,
    ) -> k8s_openapi::api::core::v1::Pod {
        let mut pod = new_etcd_pod(
            m,
            &members.peer_url_pairs(),
            self.name(),
            state,
            token,
            &self.cluster.spec,
            self.cluster.as_owner(),
        );
        self.apply_self_hosted_overrides(&mut pod, m);
        pod
    }

    fn apply_self_hosted_overrides(&self, pod: &mut k8s_openapi::api::core::v1::Pod, m: &Member) {
        add_etcd_volume_to_pod(
            pod,
            None,
            Some(&HostPathVolumeSource {
                path: format!("/var/etcd/{}-{}", self.namespace(), m.name),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
        );
        if let Some(spec) = pod.spec.as_mut() {
            spec.host_network = Some(true);
            spec.dns_policy = Some("ClusterFirstWithHostNet".to_string());
        }
    }
}
