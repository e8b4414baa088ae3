//! Mock etcd admin client for unit testing
//!
//! In-memory implementation of `EtcdAdminOps`: membership lives in a table,
//! health is a per-URL map with a configurable default. Reconciler tests
//! drive scenarios without a running etcd.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::admin_trait::EtcdAdminOps;
use crate::error::EtcdAdminError;
use crate::models::{ClusterMember, TlsBundle};

/// Mock etcd admin client.
#[derive(Clone)]
pub struct MockEtcdAdmin {
    members: Arc<Mutex<BTreeMap<String, ClusterMember>>>,
    health: Arc<Mutex<HashMap<String, bool>>>,
    default_healthy: Arc<Mutex<bool>>,
    fail_member_ops: Arc<Mutex<bool>>,
    next_id: Arc<Mutex<u64>>,
}

impl Default for MockEtcdAdmin {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEtcdAdmin {
    pub fn new() -> Self {
        Self {
            members: Arc::new(Mutex::new(BTreeMap::new())),
            health: Arc::new(Mutex::new(HashMap::new())),
            default_healthy: Arc::new(Mutex::new(true)),
            fail_member_ops: Arc::new(Mutex::new(false)),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Seeds a started member, as if its pod had already joined.
    pub fn add_started_member(&self, name: &str, peer_url: &str, client_url: &str) {
        let id = self.alloc_id();
        self.members.lock().unwrap().insert(
            name.to_string(),
            ClusterMember {
                id,
                name: name.to_string(),
                peer_urls: vec![peer_url.to_string()],
                client_urls: vec![client_url.to_string()],
            },
        );
    }

    /// Marks one client URL healthy or unhealthy.
    pub fn set_health(&self, client_url: &str, healthy: bool) {
        self.health
            .lock()
            .unwrap()
            .insert(client_url.to_string(), healthy);
    }

    /// Default verdict for URLs without an explicit entry.
    pub fn set_default_health(&self, healthy: bool) {
        *self.default_healthy.lock().unwrap() = healthy;
    }

    /// Makes subsequent member add/remove/list calls fail, for transient
    /// error paths.
    pub fn fail_member_ops(&self, fail: bool) {
        *self.fail_member_ops.lock().unwrap() = fail;
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.lock().unwrap().keys().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    fn alloc_id(&self) -> u64 {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    fn check_failure(&self) -> Result<(), EtcdAdminError> {
        if *self.fail_member_ops.lock().unwrap() {
            return Err(EtcdAdminError::NoReachableEndpoint(0));
        }
        Ok(())
    }

    /// Derives the member name from a peer URL the way the operator names
    /// pods: the first DNS label of the host.
    fn name_from_peer_url(peer_url: &str) -> String {
        peer_url
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .split([':', '/'])
            .next()
            .unwrap_or_default()
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait::async_trait]
impl EtcdAdminOps for MockEtcdAdmin {
    async fn member_add(
        &self,
        _endpoints: &[String],
        peer_url: &str,
        _tls: Option<&TlsBundle>,
    ) -> Result<ClusterMember, EtcdAdminError> {
        self.check_failure()?;
        let name = Self::name_from_peer_url(peer_url);
        let member = ClusterMember {
            id: self.alloc_id(),
            name: name.clone(),
            peer_urls: vec![peer_url.to_string()],
            client_urls: Vec::new(),
        };
        self.members.lock().unwrap().insert(name, member.clone());
        Ok(member)
    }

    async fn member_remove(
        &self,
        _endpoints: &[String],
        name: &str,
        _tls: Option<&TlsBundle>,
    ) -> Result<(), EtcdAdminError> {
        self.check_failure()?;
        self.members.lock().unwrap().remove(name);
        Ok(())
    }

    async fn member_list(
        &self,
        _endpoints: &[String],
        _tls: Option<&TlsBundle>,
    ) -> Result<Vec<ClusterMember>, EtcdAdminError> {
        self.check_failure()?;
        Ok(self.members.lock().unwrap().values().cloned().collect())
    }

    async fn check_health(&self, client_url: &str, _tls: Option<&TlsBundle>) -> bool {
        self.health
            .lock()
            .unwrap()
            .get(client_url)
            .copied()
            .unwrap_or(*self.default_healthy.lock().unwrap())
    }
}
