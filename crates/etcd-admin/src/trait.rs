//! EtcdAdminOps trait for mocking
//!
//! Abstracts the etcd membership/health operations so reconcilers can be
//! unit tested against an in-memory implementation. The concrete
//! `EtcdAdminClient` implements this trait; tests use `MockEtcdAdmin`.

use crate::error::EtcdAdminError;
use crate::models::{ClusterMember, TlsBundle};

/// Membership and health operations against a running etcd cluster.
///
/// All methods take the candidate endpoint list of the cluster being
/// administered; implementations try endpoints in order until one answers.
#[async_trait::async_trait]
pub trait EtcdAdminOps: Send + Sync {
    /// Registers a new member by its peer URL and returns the assigned id.
    async fn member_add(
        &self,
        endpoints: &[String],
        peer_url: &str,
        tls: Option<&TlsBundle>,
    ) -> Result<ClusterMember, EtcdAdminError>;

    /// Removes the member with the given name.
    ///
    /// Removing a name etcd no longer knows is success; the membership is
    /// already in the desired state.
    async fn member_remove(
        &self,
        endpoints: &[String],
        name: &str,
        tls: Option<&TlsBundle>,
    ) -> Result<(), EtcdAdminError>;

    /// Lists the current membership.
    async fn member_list(
        &self,
        endpoints: &[String],
        tls: Option<&TlsBundle>,
    ) -> Result<Vec<ClusterMember>, EtcdAdminError>;

    /// The health predicate: true iff the member behind `client_url`
    /// answers its health endpoint affirmatively. Probe failures count as
    /// unhealthy rather than erroring.
    async fn check_health(&self, client_url: &str, tls: Option<&TlsBundle>) -> bool;
}
