//! Production etcd admin client.
//!
//! Talks to the etcd v3 gRPC-gateway JSON endpoints
//! (`/v3/cluster/member/*`, `/health`). TLS material is supplied per call
//! because every managed cluster carries its own certificates.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::admin_trait::EtcdAdminOps;
use crate::error::EtcdAdminError;
use crate::models::{
    ClusterMember, HealthResponse, MemberAddResponse, MemberListResponse, TlsBundle,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// etcd admin API client.
#[derive(Debug, Clone)]
pub struct EtcdAdminClient {
    timeout: Duration,
}

impl Default for EtcdAdminClient {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl EtcdAdminClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Builds an HTTP client for one call, loading the per-cluster TLS
    /// material when present.
    fn http_client(&self, tls: Option<&TlsBundle>) -> Result<reqwest::Client, EtcdAdminError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(bundle) = tls {
            let ca = reqwest::Certificate::from_pem(&bundle.ca_pem)
                .map_err(|e| EtcdAdminError::Tls(format!("ca certificate: {}", e)))?;
            let mut identity_pem =
                Vec::with_capacity(bundle.cert_pem.len() + bundle.key_pem.len());
            identity_pem.extend_from_slice(&bundle.cert_pem);
            identity_pem.extend_from_slice(&bundle.key_pem);
            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| EtcdAdminError::Tls(format!("client identity: {}", e)))?;
            builder = builder.add_root_certificate(ca).identity(identity);
        }
        builder.build().map_err(EtcdAdminError::Http)
    }

    /// POSTs `body` to `path` on each endpoint in turn until one answers.
    async fn post_any<T: serde::de::DeserializeOwned>(
        &self,
        endpoints: &[String],
        path: &str,
        body: serde_json::Value,
        tls: Option<&TlsBundle>,
    ) -> Result<T, EtcdAdminError> {
        let client = self.http_client(tls)?;
        let mut last_err = None;
        for ep in endpoints {
            let url = format!("{}{}", ep.trim_end_matches('/'), path);
            match client.post(&url).json(&body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success() {
                        let message = resp.text().await.unwrap_or_default();
                        return Err(EtcdAdminError::Api {
                            status: status.as_u16(),
                            message,
                        });
                    }
                    return resp.json::<T>().await.map_err(EtcdAdminError::Http);
                }
                Err(e) => {
                    debug!(endpoint = %ep, error = %e, "etcd endpoint unreachable, trying next");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(EtcdAdminError::Http(e)),
            None => Err(EtcdAdminError::NoReachableEndpoint(endpoints.len())),
        }
    }
}

#[async_trait::async_trait]
impl EtcdAdminOps for EtcdAdminClient {
    async fn member_add(
        &self,
        endpoints: &[String],
        peer_url: &str,
        tls: Option<&TlsBundle>,
    ) -> Result<ClusterMember, EtcdAdminError> {
        let resp: MemberAddResponse = self
            .post_any(
                endpoints,
                "/v3/cluster/member/add",
                json!({ "peerURLs": [peer_url] }),
                tls,
            )
            .await?;
        Ok(resp.member)
    }

    async fn member_remove(
        &self,
        endpoints: &[String],
        name: &str,
        tls: Option<&TlsBundle>,
    ) -> Result<(), EtcdAdminError> {
        let members = self.member_list(endpoints, tls).await?;
        let Some(member) = members.iter().find(|m| m.name == name) else {
            // already gone
            warn!(member = %name, "member not present in etcd, treating removal as done");
            return Ok(());
        };
        let _: serde_json::Value = self
            .post_any(
                endpoints,
                "/v3/cluster/member/remove",
                json!({ "ID": member.id.to_string() }),
                tls,
            )
            .await?;
        Ok(())
    }

    async fn member_list(
        &self,
        endpoints: &[String],
        tls: Option<&TlsBundle>,
    ) -> Result<Vec<ClusterMember>, EtcdAdminError> {
        let resp: MemberListResponse = self
            .post_any(endpoints, "/v3/cluster/member/list", json!({}), tls)
            .await?;
        Ok(resp.members)
    }

    async fn check_health(&self, client_url: &str, tls: Option<&TlsBundle>) -> bool {
        let client = match self.http_client(tls) {
            Ok(c) => c,
            Err(e) => {
                warn!(url = %client_url, error = %e, "health probe client setup failed");
                return false;
            }
        };
        let url = format!("{}/health", client_url.trim_end_matches('/'));
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<HealthResponse>().await {
                Ok(h) => h.health == "true",
                Err(e) => {
                    warn!(url = %client_url, error = %e, "health probe returned malformed body");
                    false
                }
            },
            Ok(resp) => {
                debug!(url = %client_url, status = %resp.status(), "health probe rejected");
                false
            }
            Err(e) => {
                debug!(url = %client_url, error = %e, "health probe failed");
                false
            }
        }
    }
}
