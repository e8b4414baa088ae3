//! Garbage collection of orphaned cluster resources.
//!
//! Deletes pods, services, and volume claims that carry a cluster's label
//! but are no longer owned by the live cluster record. Passing [`NULL_UID`]
//! forces removal of everything under the label, which is how cluster
//! deletion sweeps its children.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::k8s::{cluster_selector, Platform, PlatformError, CLUSTER_LABEL};

/// Sentinel owner UID that matches nothing, forcing deletion.
pub const NULL_UID: &str = "";

pub struct GarbageCollector {
    platform: Arc<dyn Platform>,
    namespace: String,
}

impl GarbageCollector {
    pub fn new(platform: Arc<dyn Platform>, namespace: impl Into<String>) -> Self {
        Self {
            platform,
            namespace: namespace.into(),
        }
    }

    /// Removes every labelled object whose first owner UID differs from
    /// `cluster_uid`. With [`NULL_UID`] everything labelled for the cluster
    /// goes. Idempotent: missing objects are already collected.
    pub async fn collect_cluster(&self, cluster_name: &str, cluster_uid: &str) {
        let selector = cluster_selector(cluster_name);
        self.collect_resources(&selector, &keep_only(cluster_uid)).await;
    }

    /// Startup sweep: removes labelled objects owned by clusters that no
    /// longer exist. `live_uids` is the set of UIDs of known cluster
    /// records.
    pub async fn fully_collect(&self, live_uids: &HashSet<String>) {
        self.collect_resources(CLUSTER_LABEL, live_uids).await;
    }

    async fn collect_resources(&self, selector: &str, keep: &HashSet<String>) {
        let ns = &self.namespace;

        match self.platform.list_pods(ns, selector).await {
            Ok(pods) => {
                for pod in pods {
                    let name = pod.metadata.name.as_deref().unwrap_or_default();
                    if keep.contains(owner_uid(&pod.metadata)) {
                        continue;
                    }
                    info!(pod = %name, "gc: deleting orphaned pod");
                    if let Err(e) = self.platform.delete_pod(ns, name, 0).await {
                        log_delete_failure("pod", name, &e);
                    }
                }
            }
            Err(e) => warn!(error = %e, "gc: failed to list pods"),
        }

        match self.platform.list_services(ns, selector).await {
            Ok(services) => {
                for svc in services {
                    let name = svc.metadata.name.as_deref().unwrap_or_default();
                    if keep.contains(owner_uid(&svc.metadata)) {
                        continue;
                    }
                    info!(service = %name, "gc: deleting orphaned service");
                    if let Err(e) = self.platform.delete_service(ns, name).await {
                        log_delete_failure("service", name, &e);
                    }
                }
            }
            Err(e) => warn!(error = %e, "gc: failed to list services"),
        }

        match self.platform.list_pvcs(ns, selector).await {
            Ok(claims) => {
                for pvc in claims {
                    let name = pvc.metadata.name.as_deref().unwrap_or_default();
                    if keep.contains(owner_uid(&pvc.metadata)) {
                        continue;
                    }
                    info!(pvc = %name, "gc: deleting orphaned volume claim");
                    if let Err(e) = self.platform.delete_pvc(ns, name).await {
                        log_delete_failure("pvc", name, &e);
                    }
                }
            }
            Err(e) => warn!(error = %e, "gc: failed to list volume claims"),
        }
    }
}

fn keep_only(uid: &str) -> HashSet<String> {
    if uid == NULL_UID {
        HashSet::new()
    } else {
        HashSet::from([uid.to_string()])
    }
}

fn owner_uid(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|r| r.uid.as_str())
        .unwrap_or(NULL_UID)
}

fn log_delete_failure(kind: &str, name: &str, e: &PlatformError) {
    match e {
        PlatformError::NotFound => {}
        other => warn!(kind = %kind, name = %name, error = %other, "gc: delete failed"),
    }
}

#[cfg(test)]
#[path = "gc_test.rs"]
mod gc_test;
