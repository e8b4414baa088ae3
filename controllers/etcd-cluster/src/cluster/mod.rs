//! Per-cluster reconcile engine.
//!
//! One worker task exists per managed cluster. It owns all mutable state
//! for that cluster (status, membership, backup manager, member counter)
//! and multiplexes three inputs: the bounded event queue, the stop signal,
//! and the periodic reconcile tick. External callers interact only through
//! [`ClusterHandle`].

pub mod backup;
mod reconcile;
mod self_hosted;


use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crds::{BackupPolicy, ClusterPhase, ClusterStatus, EtcdCluster};
use etcd_admin::{member_name, Member, MemberSet, TlsBundle};

use crate::config::Config;
use crate::error::ClusterError;
use crate::gc::{GarbageCollector, NULL_UID};
use crate::k8s::pod::{
    add_etcd_volume_to_pod, add_recovery_to_pod, member_pvc_name, new_etcd_pod, new_etcd_pod_pvc,
};
use crate::k8s::service::{new_client_service, new_peer_service};
use crate::k8s::{cluster_selector, is_owned_by, pod_names, pod_phase, PlatformError};
use backup::{BackupManager, ClusterMeta};

pub(crate) const RECONCILE_INTERVAL: Duration = Duration::from_secs(8);
const POD_TERMINATION_GRACE_SECONDS: u32 = 5;
const EVENT_QUEUE_CAPACITY: usize = 100;

/// TLS secret keys holding the operator's etcd client credentials.
const TLS_CA_KEY: &str = "etcd-client-ca.crt";
const TLS_CERT_KEY: &str = "etcd-client.crt";
const TLS_KEY_KEY: &str = "etcd-client.key";

/// Events delivered to a cluster worker.
#[derive(Debug)]
pub enum ClusterEvent {
    /// The desired-state record changed
    Modify(Box<EtcdCluster>),
    /// The record was removed
    Delete,
}

/// Why the run loop ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// Delete event: the owner sweeps children and cleans up backups
    Deleted,
    /// Stop signal, closed queue, or an unrecoverable event-handling error
    Stopped,
}

/// The caller-facing side of a cluster worker. Sends never block: events
/// are dropped with a warning when the queue is full, because blocking a
/// producer could stall the process driving every cluster.
pub struct ClusterHandle {
    event_tx: mpsc::Sender<ClusterEvent>,
    stop_tx: watch::Sender<bool>,
}

impl ClusterHandle {
    /// Delivers a changed desired-state record.
    pub fn update(&self, cluster: EtcdCluster) {
        self.send(ClusterEvent::Modify(Box::new(cluster)));
    }

    /// Tells the worker its record was deleted.
    pub fn delete(&self) {
        self.send(ClusterEvent::Delete);
    }

    /// Asks the worker to exit without cleaning anything up.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn send(&self, event: ClusterEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {
                let cap = self.event_tx.max_capacity();
                let used = cap - self.event_tx.capacity();
                if used * 5 > cap * 4 {
                    warn!(used = used, capacity = cap, "event queue is almost full");
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("event queue is full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("cluster worker has exited, dropping event");
            }
        }
    }
}

/// Pods owned by the cluster, bucketed by phase. Succeeded, Failed, and
/// Unknown pods land in `dead`; they are not part of the Running/Pending
/// classification but the reconcile step still needs to see them to tell a
/// dead member from a merely missing pod.
#[derive(Debug, Default)]
pub(crate) struct PodSnapshot {
    pub running: Vec<Pod>,
    pub pending: Vec<Pod>,
    pub dead: Vec<Pod>,
}

/// State machine for one managed cluster.
pub struct Cluster {
    config: Config,

    /// Latest desired-state record
    cluster: EtcdCluster,

    /// In-memory status; the source of truth once the worker is up
    pub(crate) status: ClusterStatus,

    /// Monotonic member name counter, never reused while this worker lives
    pub(crate) member_counter: u64,

    /// Current membership; None until the first observation
    pub(crate) members: Option<MemberSet>,

    /// Present iff the spec carries a backup policy
    bm: Option<BackupManager>,

    /// Refreshed from the operator secret when client TLS is on
    tls: Option<TlsBundle>,

    /// The last reconcile attempt failed; membership is rebuilt from pods
    /// before the next attempt
    recent_reconcile_failed: bool,

    gc: GarbageCollector,

    events: mpsc::Receiver<ClusterEvent>,
    stop: watch::Receiver<bool>,
}

impl Cluster {
    /// Builds the worker and its handle without starting it; `spawn` is the
    /// production entry point.
    pub(crate) fn new(config: Config, cluster: EtcdCluster) -> (Self, ClusterHandle) {
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (stop_tx, stop) = watch::channel(false);
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let status = cluster.status.clone().unwrap_or_default();
        let gc = GarbageCollector::new(config.platform.clone(), namespace);

        let worker = Cluster {
            config,
            cluster,
            status,
            member_counter: 0,
            members: None,
            bm: None,
            tls: None,
            recent_reconcile_failed: false,
            gc,
            events,
            stop,
        };
        (
            worker,
            ClusterHandle { event_tx, stop_tx },
        )
    }

    /// Creates the worker task for a cluster record and returns its handle.
    ///
    /// Setup failures panic the task: a half-constructed controller is
    /// worse than a restart of the host process.
    pub fn spawn(config: Config, cluster: EtcdCluster) -> ClusterHandle {
        let (mut worker, handle) = Cluster::new(config, cluster);
        let name = worker.name().to_string();
        tokio::spawn(async move {
            if let Err(e) = worker.setup().await {
                error!(cluster = %name, error = %e, "cluster failed to setup");
                panic!("cluster {} failed to setup: {}", name, e);
            }
            if worker.run().await == RunOutcome::Deleted {
                worker.on_delete().await;
            }
        });
        handle
    }

    pub(crate) fn name(&self) -> &str {
        self.cluster.metadata.name.as_deref().unwrap_or_default()
    }

    pub(crate) fn namespace(&self) -> &str {
        self.cluster.metadata.namespace.as_deref().unwrap_or_default()
    }

    fn is_secure_peer(&self) -> bool {
        self.cluster.spec.is_secure_peer()
    }

    fn is_secure_client(&self) -> bool {
        self.cluster.spec.is_secure_client()
    }

    /// One-time setup, dispatched on the persisted phase.
    pub(crate) async fn setup(&mut self) -> Result<(), ClusterError> {
        self.cluster.spec.validate()?;

        let should_create = match self.status.phase {
            ClusterPhase::None => true,
            ClusterPhase::Creating => return Err(ClusterError::CreateInProgress),
            ClusterPhase::Running => false,
            ClusterPhase::Failed => {
                // crash-to-reset: rewrite the phase so the next incarnation
                // starts clean, then abort this one
                error!(
                    cluster = %self.name(),
                    "phase is Failed: updating status to Running and aborting"
                );
                self.status.set_phase(ClusterPhase::Running);
                if let Err(e) = self.update_cr_status().await {
                    warn!(cluster = %self.name(), error = %e, "failed to persist phase reset");
                }
                return Err(ClusterError::ResetFromFailed);
            }
        };

        self.refresh_tls().await?;

        if let Some(policy) = self.cluster.spec.backup.clone() {
            let bm = BackupManager::new(
                &self.config,
                ClusterMeta::from_cluster(&self.cluster),
                policy,
            );
            if !should_create {
                bm.upgrade_if_needed().await?;
            }
            self.bm = Some(bm);
        }

        if should_create {
            self.create().await?;
        }
        Ok(())
    }

    /// First-time creation: Creating phase, ownership mark, backup sidecar,
    /// seed member, services. The Running transition belongs to the run
    /// loop.
    async fn create(&mut self) -> Result<(), ClusterError> {
        self.status.set_phase(ClusterPhase::Creating);
        self.update_cr_status().await?;
        self.log_cluster_creation();

        self.gc
            .collect_cluster(self.name(), self.cluster.uid())
            .await;

        if let Some(bm) = &self.bm {
            bm.setup().await?;
        }

        if self.cluster.spec.backup.is_none() {
            // a seed member is only bootstrapped fresh when there is no
            // backup policy; otherwise recovery seeds from the backup
            self.prepare_seed_member().await?;
        }

        self.setup_services().await?;
        Ok(())
    }

    async fn prepare_seed_member(&mut self) -> Result<(), ClusterError> {
        self.status
            .append_scaling_up_condition(0, self.cluster.spec.size);

        match self.cluster.spec.self_hosted.clone() {
            Some(sh) => match sh.boot_member_client_endpoint.as_deref() {
                None | Some("") => self.new_self_hosted_seed_member().await?,
                Some(endpoint) => self.migrate_boot_member(endpoint).await?,
            },
            None => self.bootstrap().await?,
        }

        self.status.size = 1;
        Ok(())
    }

    /// Creates the seed member for a brand-new cluster.
    async fn bootstrap(&mut self) -> Result<(), ClusterError> {
        self.start_seed_member(false).await
    }

    /// Creates a seed member that restores from the latest backup first.
    pub(crate) async fn recover(&mut self) -> Result<(), ClusterError> {
        self.start_seed_member(true).await
    }

    async fn start_seed_member(&mut self, recover_from_backup: bool) -> Result<(), ClusterError> {
        let m = Member::new(
            member_name(self.name(), self.member_counter),
            self.namespace(),
            self.is_secure_peer(),
            self.is_secure_client(),
        );
        let ms = MemberSet::with_member(m.clone());
        self.create_pod(&ms, &m, "new", recover_from_backup).await?;
        self.member_counter += 1;
        self.members = Some(ms);
        info!(
            cluster = %self.name(),
            seed = %m.name,
            from_backup = recover_from_backup,
            "cluster created with seed member"
        );
        Ok(())
    }

    /// The run loop: Running transition, then events/stop/tick forever.
    pub(crate) async fn run(&mut self) -> RunOutcome {
        self.begin_run().await;

        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + RECONCILE_INTERVAL,
            RECONCILE_INTERVAL,
        );

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ClusterEvent::Modify(new_cluster)) => {
                        if self.handle_modify(*new_cluster).await.is_err() {
                            // reason is already set; persist it and stop
                            if let Err(e) = self.update_cr_status().await {
                                warn!(cluster = %self.name(), error = %e, "failed to persist failure reason");
                            }
                            return RunOutcome::Stopped;
                        }
                    }
                    Some(ClusterEvent::Delete) => {
                        info!(cluster = %self.name(), "cluster is deleted by the user");
                        return RunOutcome::Deleted;
                    }
                    None => return RunOutcome::Stopped,
                },
                _ = self.stop.changed() => {
                    info!(cluster = %self.name(), "stop signal received");
                    return RunOutcome::Stopped;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.reconcile_tick().await {
                        self.config.metrics.reconcile_failed(&e.to_string());
                        if e.is_fatal() {
                            self.status.set_reason(e.to_string());
                            error!(
                                cluster = %self.name(),
                                error = %e,
                                "cluster failed (continuing reconcile loop)"
                            );
                        }
                    }
                }
            }
        }
    }

    pub(crate) async fn begin_run(&mut self) {
        self.status.set_phase(ClusterPhase::Running);
        if let Err(e) = self.update_cr_status().await {
            warn!(cluster = %self.name(), error = %e, "update initial CR status failed");
        }
        info!(cluster = %self.name(), "start running...");
    }

    /// Applies a Modify event.
    pub(crate) async fn handle_modify(
        &mut self,
        new_cluster: EtcdCluster,
    ) -> Result<(), ClusterError> {
        if let Err(e) = self.refresh_tls().await {
            warn!(cluster = %self.name(), error = %e, "failed to refresh tls config");
        }
        if self.cluster.spec.is_spec_equal(&new_cluster.spec) {
            return Ok(());
        }
        self.log_spec_update(&new_cluster);

        let old_backup = self.cluster.spec.backup.clone();
        let new_backup = new_cluster.spec.backup.clone();
        self.cluster = new_cluster;

        if old_backup != new_backup {
            if let Err(e) = self.update_backup_policy(old_backup, new_backup).await {
                error!(cluster = %self.name(), error = %e, "failed to update backup policy");
                self.status.set_reason(e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    async fn update_backup_policy(
        &mut self,
        old: Option<BackupPolicy>,
        new: Option<BackupPolicy>,
    ) -> Result<(), ClusterError> {
        match (old, new) {
            (None, Some(policy)) => {
                let bm = BackupManager::new(
                    &self.config,
                    ClusterMeta::from_cluster(&self.cluster),
                    policy,
                );
                bm.setup().await?;
                self.bm = Some(bm);
                Ok(())
            }
            (Some(_), None) => {
                if let Some(bm) = self.bm.take() {
                    bm.delete_backup_sidecar().await?;
                }
                Ok(())
            }
            (Some(_), Some(_)) => {
                let cluster = self.cluster.clone();
                match self.bm.as_mut() {
                    Some(bm) => bm.update_sidecar(&cluster).await?,
                    None => {
                        return Err(ClusterError::Platform(PlatformError::Api(
                            "backup policy present without a backup manager".into(),
                        )))
                    }
                }
                Ok(())
            }
            // the spec-equal short circuit already handled identical specs
            (None, None) => unreachable!("backup policy transition with both sides empty"),
        }
    }

    /// One observation-and-convergence step.
    pub(crate) async fn reconcile_tick(&mut self) -> Result<(), ClusterError> {
        if let Err(e) = self.refresh_tls().await {
            warn!(cluster = %self.name(), error = %e, "failed to refresh tls config");
        }
        let start = std::time::Instant::now();

        if self.cluster.spec.paused {
            self.status.pause_control();
            info!(cluster = %self.name(), "control is paused, skipping reconciliation");
            return Ok(());
        }
        self.status.resume_control();

        let snapshot = match self.poll_pods().await {
            Ok(s) => s,
            Err(e) => {
                error!(cluster = %self.name(), error = %e, "fail to poll pods");
                return Err(e);
            }
        };

        if !snapshot.pending.is_empty() {
            // image pulls can take a while; pods deterministically leave
            // Pending, so wait for them instead of acting on a stale view
            info!(
                cluster = %self.name(),
                running = ?pod_names(&snapshot.running),
                pending = ?pod_names(&snapshot.pending),
                "skip reconciliation: not all pods are running"
            );
            return Err(ClusterError::PodsNotReady);
        }

        if snapshot.running.is_empty() {
            warn!(
                cluster = %self.name(),
                "all etcd pods are dead, trying to recover from a previous backup"
            );
            return match self.disaster_recovery(None, &snapshot.dead).await {
                Ok(()) => {
                    self.recent_reconcile_failed = false;
                    Ok(())
                }
                Err(e) => {
                    self.recent_reconcile_failed = true;
                    error!(cluster = %self.name(), error = %e, "fail to do disaster recovery");
                    Err(e)
                }
            };
        }

        // after a failed attempt, or on a cold start, the in-memory
        // membership is rebuilt from what actually runs
        if self.recent_reconcile_failed || self.members.is_none() {
            self.update_members_from_pods(&snapshot.running);
        }

        match self.reconcile_members(&snapshot).await {
            Ok(()) => self.recent_reconcile_failed = false,
            Err(e) => {
                self.recent_reconcile_failed = true;
                error!(cluster = %self.name(), error = %e, "failed to reconcile");
                return Err(e);
            }
        }

        if let Err(e) = self.update_local_backup_status().await {
            warn!(cluster = %self.name(), error = %e, "failed to update local backup service status");
        }
        self.update_member_status().await;
        if let Err(e) = self.update_cr_status().await {
            warn!(cluster = %self.name(), error = %e, "periodic update CR status failed");
        }

        self.config
            .metrics
            .observe_reconcile(self.name(), start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Lists owned pods and buckets them by phase.
    pub(crate) async fn poll_pods(&self) -> Result<PodSnapshot, ClusterError> {
        let pods = self
            .config
            .platform
            .list_pods(self.namespace(), &cluster_selector(self.name()))
            .await?;

        let mut snapshot = PodSnapshot::default();
        for pod in pods {
            let name = pod.metadata.name.clone().unwrap_or_default();
            if !is_owned_by(&pod, self.cluster.uid()) {
                warn!(
                    cluster = %self.name(),
                    pod = %name,
                    "poll pods: ignoring pod not owned by this cluster"
                );
                continue;
            }
            match pod_phase(&pod) {
                "Running" => snapshot.running.push(pod),
                "Pending" => snapshot.pending.push(pod),
                _ => snapshot.dead.push(pod),
            }
        }
        Ok(snapshot)
    }

    /// Submits a member pod built from the cluster spec. `state` is "new"
    /// for seeds (a fresh bootstrap token is generated) and "existing" for
    /// joins; `need_recovery` prepends the restore-from-backup init step.
    pub(crate) async fn create_pod(
        &self,
        members: &MemberSet,
        m: &Member,
        state: &str,
        need_recovery: bool,
    ) -> Result<(), ClusterError> {
        let token = if state == "new" {
            Uuid::new_v4().to_string()
        } else {
            String::new()
        };

        let mut pod = new_etcd_pod(
            m,
            &members.peer_url_pairs(),
            self.name(),
            state,
            &token,
            &self.cluster.spec,
            self.cluster.as_owner(),
        );
        if need_recovery {
            add_recovery_to_pod(&mut pod, self.name(), &token, m, &self.cluster.spec);
        }

        let pod_policy = self.cluster.spec.pod.as_ref();
        if let Some(pvc_spec) = pod_policy.and_then(|p| p.persistent_volume_claim_spec.clone()) {
            let pvc = new_etcd_pod_pvc(
                m,
                pvc_spec,
                self.name(),
                self.namespace(),
                self.cluster.as_owner(),
            );
            match self.config.platform.create_pvc(self.namespace(), &pvc).await {
                Ok(()) | Err(PlatformError::AlreadyExists) => {}
                Err(e) => return Err(e.into()),
            }
            add_etcd_volume_to_pod(&mut pod, Some(&member_pvc_name(m)), None);
        } else if let Some(host_path) = pod_policy.and_then(|p| p.host_path.as_ref()) {
            add_etcd_volume_to_pod(&mut pod, None, Some(host_path));
        } else {
            add_etcd_volume_to_pod(&mut pod, None, None);
        }

        self.config.platform.create_pod(self.namespace(), &pod).await?;
        Ok(())
    }

    /// Deletes a member pod with the termination grace period. A pod that
    /// is already gone is success.
    pub(crate) async fn remove_pod(&self, name: &str) -> Result<(), ClusterError> {
        match self
            .config
            .platform
            .delete_pod(self.namespace(), name, POD_TERMINATION_GRACE_SECONDS)
            .await
        {
            Ok(()) | Err(PlatformError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the client and peer services; both tolerate AlreadyExists.
    async fn setup_services(&self) -> Result<(), ClusterError> {
        let client_svc = new_client_service(self.name(), self.namespace(), self.cluster.as_owner());
        match self
            .config
            .platform
            .create_service(self.namespace(), &client_svc)
            .await
        {
            Ok(()) | Err(PlatformError::AlreadyExists) => {}
            Err(e) => return Err(e.into()),
        }

        let peer_svc = new_peer_service(self.name(), self.namespace(), self.cluster.as_owner());
        match self
            .config
            .platform
            .create_service(self.namespace(), &peer_svc)
            .await
        {
            Ok(()) | Err(PlatformError::AlreadyExists) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reloads the operator's etcd client credentials when client TLS is
    /// enabled.
    pub(crate) async fn refresh_tls(&mut self) -> Result<(), ClusterError> {
        let Some(secret_name) = self.cluster.spec.operator_secret().map(str::to_string) else {
            return Ok(());
        };
        let secret = self
            .config
            .platform
            .get_secret(self.namespace(), &secret_name)
            .await?;
        let data = secret.data.unwrap_or_default();
        let fetch = |key: &str| -> Result<Vec<u8>, ClusterError> {
            data.get(key)
                .map(|b| b.0.clone())
                .ok_or_else(|| ClusterError::BadTlsSecret {
                    secret: secret_name.clone(),
                    key: key.to_string(),
                })
        };
        self.tls = Some(TlsBundle {
            ca_pem: fetch(TLS_CA_KEY)?,
            cert_pem: fetch(TLS_CERT_KEY)?,
            key_pem: fetch(TLS_KEY_KEY)?,
        });
        Ok(())
    }

    /// Probes every member's client URL and sorts names into ready/unready.
    async fn update_member_status(&mut self) {
        let Some(members) = &self.members else { return };
        let mut ready = Vec::new();
        let mut unready = Vec::new();
        for m in members.iter() {
            let url = m.client_url();
            if self.config.etcd.check_health(&url, self.tls.as_ref()).await {
                ready.push(m.name.clone());
            } else {
                warn!(cluster = %self.name(), member = %m.name, url = %url, "health check failed");
                unready.push(m.name.clone());
            }
        }
        self.status.members.ready = ready;
        self.status.members.unready = unready;
    }

    /// Mirrors the backup sidecar's reported status into ours.
    async fn update_local_backup_status(&mut self) -> Result<(), ClusterError> {
        let Some(bm) = &self.bm else { return Ok(()) };
        let bs = bm.get_status().await?;
        self.status.backup_service_status = Some(bs);
        Ok(())
    }

    /// Persists the status subdocument when it differs from the record's,
    /// adopting the stored record as the new baseline.
    pub(crate) async fn update_cr_status(&mut self) -> Result<(), ClusterError> {
        if self.cluster.status.as_ref() == Some(&self.status) {
            return Ok(());
        }
        let mut updated = self.cluster.clone();
        updated.status = Some(self.status.clone());
        let stored = self.config.record.update_status(&updated).await?;
        self.cluster = stored;
        Ok(())
    }

    /// Cluster deletion: force-collect every child, then tear down backups.
    pub(crate) async fn on_delete(&mut self) {
        self.gc.collect_cluster(self.name(), NULL_UID).await;
        if let Some(bm) = &self.bm {
            if let Err(e) = bm.cleanup().await {
                error!(
                    cluster = %self.name(),
                    error = %e,
                    "cluster deletion: backup manager failed to cleanup"
                );
            }
        }
    }

    fn log_cluster_creation(&self) {
        match serde_json::to_string_pretty(&self.cluster.spec) {
            Ok(spec) => {
                info!(cluster = %self.name(), "creating cluster with spec:");
                for line in spec.lines() {
                    info!("{}", line);
                }
            }
            Err(e) => error!(cluster = %self.name(), error = %e, "failed to marshal cluster spec"),
        }
    }

    fn log_spec_update(&self, new_cluster: &EtcdCluster) {
        let old = serde_json::to_string_pretty(&self.cluster.spec).unwrap_or_default();
        let new = serde_json::to_string_pretty(&new_cluster.spec).unwrap_or_default();
        info!(cluster = %self.name(), "spec update, old spec:");
        for line in old.lines() {
            info!("{}", line);
        }
        info!(cluster = %self.name(), "new spec:");
        for line in new.lines() {
            info!("{}", line);
        }
    }

    #[cfg(test)]
    pub(crate) fn has_backup_manager(&self) -> bool {
        self.bm.is_some()
    }
}
