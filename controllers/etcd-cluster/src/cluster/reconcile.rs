//! Membership convergence and disaster recovery.
//!
//! Each tick performs at most one membership-changing action, so every
//! change is observed by the next tick before another is attempted. That
//! one-step discipline is what keeps upgrades and scaling from
//! split-braining the cluster.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Pod;
use tracing::{info, warn};

use etcd_admin::{member_name, member_ordinal, Member, MemberSet};

use super::{Cluster, PodSnapshot};
use crate::error::ClusterError;
use crate::k8s::pod::etcd_version_from_pod;

/// Builds the membership view implied by a set of pods.
pub(crate) fn pods_to_member_set(
    pods: &[Pod],
    secure_peer: bool,
    secure_client: bool,
) -> MemberSet {
    let mut set = MemberSet::new();
    for pod in pods {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        set.add(Member::new(name, namespace, secure_peer, secure_client));
    }
    set
}

impl Cluster {
    /// Rebuilds the in-memory membership from observed running pods and
    /// advances the name counter past every ordinal already in use.
    pub(crate) fn update_members_from_pods(&mut self, running: &[Pod]) {
        let set = pods_to_member_set(running, self.is_secure_peer(), self.is_secure_client());
        if let Some(max) = set.max_ordinal() {
            self.member_counter = self.member_counter.max(max + 1);
        }
        info!(
            cluster = %self.name(),
            members = ?set.names(),
            "rebuilt membership from running pods"
        );
        self.members = Some(set);
    }

    /// Diffs desired against actual membership and converges by at most
    /// one action, in priority order.
    pub(crate) async fn reconcile_members(
        &mut self,
        snapshot: &PodSnapshot,
    ) -> Result<(), ClusterError> {
        let Some(members) = self.members.clone() else {
            return Ok(());
        };
        let running = pods_to_member_set(
            &snapshot.running,
            self.is_secure_peer(),
            self.is_secure_client(),
        );
        let dead_names: HashSet<&str> = snapshot
            .dead
            .iter()
            .filter_map(|p| p.metadata.name.as_deref())
            .collect();

        info!(
            cluster = %self.name(),
            running = ?running.names(),
            membership = ?members.names(),
            "reconciling membership"
        );

        // 1. a member whose pod died: drop it from etcd, then its pod
        if let Some(dead) = members
            .iter()
            .find(|m| dead_names.contains(m.name.as_str()))
            .cloned()
        {
            self.status.append_removing_dead_member(&dead.name);
            return self.remove_member(&dead).await;
        }

        // 2. a member with no pod at all: bring its pod back
        if let Some(missing) = members
            .iter()
            .find(|m| !running.contains(&m.name) && !dead_names.contains(m.name.as_str()))
            .cloned()
        {
            info!(cluster = %self.name(), member = %missing.name, "recreating pod for member");
            self.create_pod(&members, &missing, "existing", false).await?;
            return Ok(());
        }

        let desired = self.cluster.spec.size;

        // 3. too many members: retire the newest
        if members.size() as i32 > desired {
            let Some(victim) = members.highest_ordinal_member().cloned() else {
                return Ok(());
            };
            self.status
                .append_scaling_down_condition(members.size() as i32, desired);
            info!(cluster = %self.name(), member = %victim.name, "scaling down");
            return self.remove_member(&victim).await;
        }

        // 4. version drift: delete one stale pod; step 2 brings it back at
        // the target version on a later tick
        if let Some(stale) = snapshot.running.iter().find(|p| {
            etcd_version_from_pod(p).is_some_and(|v| v != self.cluster.spec.version)
        }) {
            let pod = stale.metadata.name.clone().unwrap_or_default();
            self.status
                .append_upgrading_condition(&self.cluster.spec.version, &pod);
            info!(
                cluster = %self.name(),
                member = %pod,
                from = etcd_version_from_pod(stale).unwrap_or(""),
                to = %self.cluster.spec.version,
                "upgrading one member"
            );
            return self.remove_pod(&pod).await;
        }

        // 5. too few members: register and start exactly one
        if (members.size() as i32) < desired {
            self.status
                .append_scaling_up_condition(members.size() as i32, desired);
            return self.add_one_member().await;
        }

        // steady state
        self.status.size = members.size() as i32;
        self.status.set_current_version(&self.cluster.spec.version);
        Ok(())
    }

    /// Registers the next member with etcd, then starts its pod. If the
    /// pod submission fails the membership entry survives and the
    /// recreate path finishes the job next tick.
    async fn add_one_member(&mut self) -> Result<(), ClusterError> {
        let mut members = self.members.clone().unwrap_or_default();
        let m = Member::new(
            member_name(self.name(), self.member_counter),
            self.namespace(),
            self.is_secure_peer(),
            self.is_secure_client(),
        );
        let endpoints = members.client_urls();

        self.config
            .etcd
            .member_add(&endpoints, &m.peer_url(), self.tls.as_ref())
            .await?;
        members.add(m.clone());
        self.member_counter += 1;
        self.status.size = members.size() as i32;
        self.members = Some(members.clone());

        self.create_pod(&members, &m, "existing", false).await?;
        info!(cluster = %self.name(), member = %m.name, "added member");
        Ok(())
    }

    /// Removes a member from etcd, forgets it, and deletes its pod.
    async fn remove_member(&mut self, m: &Member) -> Result<(), ClusterError> {
        let endpoints = self
            .members
            .as_ref()
            .map(|ms| ms.client_urls())
            .unwrap_or_default();
        self.config
            .etcd
            .member_remove(&endpoints, &m.name, self.tls.as_ref())
            .await?;
        if let Some(set) = self.members.as_mut() {
            set.remove(&m.name);
            self.status.size = set.size() as i32;
        }
        self.remove_pod(&m.name).await?;
        info!(cluster = %self.name(), member = %m.name, "removed member");
        Ok(())
    }

    /// Restores a cluster with zero running members from the latest
    /// backup. `left` carries any members still answering (none when
    /// invoked from the tick path); their pods are cleared before the
    /// recovery seed starts.
    pub(crate) async fn disaster_recovery(
        &mut self,
        left: Option<&MemberSet>,
        dead_pods: &[Pod],
    ) -> Result<(), ClusterError> {
        self.status.append_recovering_condition();

        if self.cluster.spec.self_hosted.is_some() {
            return Err(ClusterError::DisasterRecoveryImpossible(
                "self-hosted cluster cannot be recovered from disaster".into(),
            ));
        }
        let Some(bm) = &self.bm else {
            return Err(ClusterError::DisasterRecoveryImpossible(
                "no backup policy has been defined".into(),
            ));
        };

        let mut backup_ready = false;
        if let Some(left) = left.filter(|l| !l.is_empty()) {
            info!(
                cluster = %self.name(),
                members = ?left.names(),
                "members still answering, requesting a final backup"
            );
            match bm.request_backup_now().await {
                Ok(()) => backup_ready = true,
                Err(e) => warn!(cluster = %self.name(), error = %e, "failed to make a final backup"),
            }
        }
        if !backup_ready {
            let exists = bm.exists_backup(&self.cluster.spec.version).await?;
            if !exists {
                return Err(ClusterError::DisasterRecoveryImpossible(
                    "no backup exists for disaster recovery".into(),
                ));
            }
        }

        // clear remains so the recovery seed starts from a clean slate,
        // and keep the counter ahead of every name ever used
        for pod in dead_pods {
            if let Some(name) = pod.metadata.name.as_deref() {
                if let Some(ordinal) = member_ordinal(name) {
                    self.member_counter = self.member_counter.max(ordinal + 1);
                }
                self.remove_pod(name).await?;
            }
        }
        if let Some(left) = left {
            for m in left.iter() {
                if let Some(ordinal) = member_ordinal(&m.name) {
                    self.member_counter = self.member_counter.max(ordinal + 1);
                }
                self.remove_pod(&m.name).await?;
            }
        }

        self.recover().await
    }
}
