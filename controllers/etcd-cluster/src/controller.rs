//! Top-level operator loop.
//!
//! Watches EtcdCluster records and keeps exactly one worker per cluster:
//! an unseen record spawns a worker, a changed record is forwarded as a
//! Modify event, a removed record becomes a Delete event. The interesting
//! machinery lives in [`crate::cluster`]; this layer stays thin.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, warn};

use crds::EtcdCluster;

use crate::cluster::{Cluster, ClusterHandle};
use crate::config::Config;
use crate::error::ClusterError;
use crate::gc::GarbageCollector;

pub struct Controller {
    client: Client,
    config: Config,
    namespace: Option<String>,
    clusters: HashMap<String, ClusterHandle>,
}

impl Controller {
    pub fn new(client: Client, config: Config, namespace: Option<String>) -> Self {
        Self {
            client,
            config,
            namespace,
            clusters: HashMap::new(),
        }
    }

    fn api(&self) -> Api<EtcdCluster> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Runs until the watch stream ends.
    pub async fn run(mut self) -> Result<(), ClusterError> {
        let api = self.api();

        // verify the CRD is reachable before settling into the watch
        let existing = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::Watch(format!("failed to list EtcdClusters: {}", e)))?;

        let items = existing.items;
        info!(count = items.len(), "resuming existing clusters");
        let mut live_uids = HashSet::new();
        for cluster in items {
            if let Some(uid) = cluster.metadata.uid.clone() {
                live_uids.insert(uid);
            }
            self.apply(cluster);
        }

        // sweep children of clusters that vanished while we were down
        if let Some(ns) = self.namespace.clone() {
            GarbageCollector::new(self.config.platform.clone(), ns)
                .fully_collect(&live_uids)
                .await;
        }

        let mut stream = watcher(api, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(cluster)) | Ok(watcher::Event::InitApply(cluster)) => {
                    self.apply(cluster);
                }
                Ok(watcher::Event::Delete(cluster)) => {
                    self.delete(&cluster);
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
                Err(e) => {
                    // the watcher reconnects by itself
                    error!(error = %e, "EtcdCluster watch error");
                }
            }
        }

        warn!("EtcdCluster watch stream ended");
        for handle in self.clusters.values() {
            handle.stop();
        }
        Ok(())
    }

    fn key(cluster: &EtcdCluster) -> String {
        format!(
            "{}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any()
        )
    }

    fn apply(&mut self, cluster: EtcdCluster) {
        let key = Self::key(&cluster);
        match self.clusters.get(&key) {
            Some(handle) => handle.update(cluster),
            None => {
                info!(cluster = %key, "starting worker for cluster");
                let handle = Cluster::spawn(self.config.clone(), cluster);
                self.config.metrics.clusters_changed(1);
                self.clusters.insert(key, handle);
            }
        }
    }

    fn delete(&mut self, cluster: &EtcdCluster) {
        let key = Self::key(cluster);
        if let Some(handle) = self.clusters.remove(&key) {
            info!(cluster = %key, "cluster record deleted");
            handle.delete();
            self.config.metrics.clusters_changed(-1);
        }
    }
}
