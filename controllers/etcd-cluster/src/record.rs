//! Cluster record persistence.
//!
//! The desired-state record lives behind `ClusterRecordOps` so the engine
//! and its tests never touch the API server directly. The production
//! implementation writes the status subresource with a merge patch and
//! hands back the server's view of the record.

use kube::api::{Patch, PatchParams};
use serde_json::json;
use kube::{Api, Client};
use thiserror::Error;

use crds::EtcdCluster;

/// Errors from reading or writing the cluster record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The record no longer exists
    #[error("cluster record not found")]
    NotFound,

    /// Optimistic update lost; retry with a fresh read
    #[error("cluster record update conflict")]
    Conflict,

    /// Anything else the API server reported
    #[error("cluster record api error: {0}")]
    Api(String),

    /// The record is missing its name or namespace
    #[error("malformed cluster record: {0}")]
    Malformed(String),
}

impl From<kube::Error> for RecordError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => RecordError::NotFound,
            kube::Error::Api(resp) if resp.code == 409 => RecordError::Conflict,
            _ => RecordError::Api(e.to_string()),
        }
    }
}

/// Read/write operations on the cluster record.
#[async_trait::async_trait]
pub trait ClusterRecordOps: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<EtcdCluster, RecordError>;

    /// Writes the record's status subdocument and returns the stored record.
    async fn update_status(&self, cluster: &EtcdCluster) -> Result<EtcdCluster, RecordError>;
}

/// Production record client backed by the CRD API.
#[derive(Clone)]
pub struct KubeRecordClient {
    client: Client,
}

impl KubeRecordClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<EtcdCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterRecordOps for KubeRecordClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<EtcdCluster, RecordError> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn update_status(&self, cluster: &EtcdCluster) -> Result<EtcdCluster, RecordError> {
        let name = cluster
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| RecordError::Malformed("missing name".into()))?;
        let namespace = cluster
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| RecordError::Malformed("missing namespace".into()))?;

        let patch = json!({ "status": cluster.status });
        let pp = PatchParams::default();
        let updated = self
            .api(namespace)
            .patch_status(name, &pp, &Patch::Merge(&patch))
            .await?;
        Ok(updated)
    }
}
