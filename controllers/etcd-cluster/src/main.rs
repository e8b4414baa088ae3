//! etcd cluster operator
//!
//! Watches EtcdCluster records and drives each one toward its desired
//! state: seed bootstrap, membership reconciliation, version upgrades,
//! disaster recovery from backups, and backup sidecar lifecycle.

mod cluster;
mod config;
mod controller;
mod error;
mod gc;
mod k8s;
mod metrics;
mod record;
#[cfg(test)]
mod test_utils;

use std::env;
use std::sync::Arc;

use kube::Client;
use tracing::info;

use cluster::backup::HttpBackupService;
use config::{Config, S3Context};
use controller::Controller;
use error::ClusterError;
use etcd_admin::EtcdAdminClient;
use k8s::KubePlatform;
use metrics::PrometheusSink;
use record::KubeRecordClient;

#[tokio::main]
async fn main() -> Result<(), ClusterError> {
    tracing_subscriber::fmt::init();

    info!("starting etcd cluster operator");

    let namespace = env::var("WATCH_NAMESPACE").ok();
    let pv_provisioner =
        env::var("PV_PROVISIONER").unwrap_or_else(|_| "kubernetes.io/gce-pd".to_string());
    let service_account = env::var("SERVICE_ACCOUNT").unwrap_or_default();
    let backup_sidecar_image = env::var("BACKUP_SIDECAR_IMAGE")
        .unwrap_or_else(|_| "quay.io/coreos/etcd-backup-sidecar:latest".to_string());
    let s3_context = env::var("S3_BUCKET").ok().map(|bucket| S3Context {
        bucket,
        prefix: env::var("S3_PREFIX").unwrap_or_default(),
        credentials_secret: env::var("S3_CREDS_SECRET").unwrap_or_default(),
    });
    let metrics_port: u16 = env::var("METRICS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9090);

    info!(
        namespace = %namespace.as_deref().unwrap_or("all namespaces"),
        pv_provisioner = %pv_provisioner,
        backup_sidecar_image = %backup_sidecar_image,
        "configuration loaded"
    );

    let client = Client::try_default().await?;

    let config = Config {
        pv_provisioner,
        service_account,
        s3_context,
        backup_sidecar_image,
        platform: Arc::new(KubePlatform::new(client.clone())),
        record: Arc::new(KubeRecordClient::new(client.clone())),
        etcd: Arc::new(EtcdAdminClient::default()),
        backup_service: Arc::new(HttpBackupService::default()),
        metrics: Arc::new(PrometheusSink),
    };

    tokio::spawn(metrics::run_metrics_server(metrics_port));

    Controller::new(client, config, namespace).run().await
}
