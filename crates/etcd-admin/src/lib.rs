//! etcd membership model and admin API client
//!
//! Shared between the cluster controller and its tests:
//!
//! - **Member model**: [`Member`] and [`MemberSet`] describe the controller's
//!   view of an etcd cluster's membership and derive the peer/client URLs
//!   used for bootstrap flags and health probes.
//! - **Admin operations**: [`EtcdAdminOps`] abstracts member add/remove/list
//!   and the health predicate. [`EtcdAdminClient`] implements it against the
//!   etcd v3 gRPC-gateway JSON API; [`MockEtcdAdmin`] implements it in
//!   memory for unit tests.

pub mod client;
pub mod error;
pub mod member;
pub mod mock;
pub mod models;
#[path = "trait.rs"]
pub mod admin_trait;

pub use admin_trait::EtcdAdminOps;
pub use client::EtcdAdminClient;
pub use error::EtcdAdminError;
pub use member::{
    cluster_name_from_member, member_name, member_ordinal, Member, MemberSet,
};
pub use mock::MockEtcdAdmin;
pub use models::{ClusterMember, TlsBundle};
