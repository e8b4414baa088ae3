//! Client and peer service construction.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use super::{APP_LABEL_VALUE, CLUSTER_LABEL, ETCD_CLIENT_PORT, ETCD_PEER_PORT};

pub fn client_service_name(cluster_name: &str) -> String {
    format!("{}-client", cluster_name)
}

fn selector(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL_VALUE.to_string()),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// The load-balanced service clients connect to.
pub fn new_client_service(cluster_name: &str, namespace: &str, owner: OwnerReference) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(client_service_name(cluster_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(selector(cluster_name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector(cluster_name)),
            ports: Some(vec![ServicePort {
                name: Some("client".to_string()),
                port: ETCD_CLIENT_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// The headless peer service, named after the cluster so members resolve
/// each other as `<member>.<cluster>.<namespace>.svc`. Addresses publish
/// before readiness because peers must find each other while bootstrapping.
pub fn new_peer_service(cluster_name: &str, namespace: &str, owner: OwnerReference) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(cluster_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector(cluster_name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector(cluster_name)),
            ports: Some(vec![
                ServicePort {
                    name: Some("client".to_string()),
                    port: ETCD_CLIENT_PORT,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("peer".to_string()),
                    port: ETCD_PEER_PORT,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}
