//! etcd member bookkeeping.
//!
//! A `Member` is a single etcd process; its name is the name of the pod the
//! process runs in. `MemberSet` is the controller's in-memory view of the
//! cluster membership, keyed by member name.

use std::collections::BTreeMap;

/// One etcd member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub namespace: String,
    pub secure_peer: bool,
    pub secure_client: bool,
}

impl Member {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        secure_peer: bool,
        secure_client: bool,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            secure_peer,
            secure_client,
        }
    }

    fn peer_scheme(&self) -> &'static str {
        if self.secure_peer {
            "https"
        } else {
            "http"
        }
    }

    fn client_scheme(&self) -> &'static str {
        if self.secure_client {
            "https"
        } else {
            "http"
        }
    }

    /// Per-pod DNS name under the cluster's headless peer service.
    fn fqdn(&self) -> String {
        format!(
            "{}.{}.{}.svc",
            self.name,
            cluster_name_from_member(&self.name),
            self.namespace
        )
    }

    /// URL the member listens on for peer traffic.
    pub fn peer_url(&self) -> String {
        format!("{}://{}:2380", self.peer_scheme(), self.fqdn())
    }

    /// URL clients (and the health probe) reach this member on.
    pub fn client_url(&self) -> String {
        format!("{}://{}:2379", self.client_scheme(), self.fqdn())
    }
}

/// Builds the member (and pod) name for an ordinal: `<cluster>-<nnnn>`.
pub fn member_name(cluster_name: &str, ordinal: u64) -> String {
    format!("{}-{:04}", cluster_name, ordinal)
}

/// Parses the ordinal back out of a member name.
pub fn member_ordinal(name: &str) -> Option<u64> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

/// Strips the ordinal suffix to recover the cluster name.
pub fn cluster_name_from_member(name: &str) -> &str {
    name.rsplit_once('-').map(|(c, _)| c).unwrap_or(name)
}

/// The controller's view of current cluster membership.
///
/// Backed by a `BTreeMap` so enumeration is ordered by member name; the
/// ordering makes `peer_url_pairs` deterministic, which keeps bootstrap
/// tokens stable across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberSet {
    members: BTreeMap<String, Member>,
}

impl MemberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding exactly one member (the seed case).
    pub fn with_member(m: Member) -> Self {
        let mut set = Self::new();
        set.add(m);
        set
    }

    pub fn add(&mut self, m: Member) {
        self.members.insert(m.name.clone(), m);
    }

    pub fn remove(&mut self, name: &str) -> Option<Member> {
        self.members.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    /// `name=peerURL` pairs ordered by member name, the form etcd expects in
    /// `--initial-cluster`.
    pub fn peer_url_pairs(&self) -> Vec<String> {
        self.members
            .values()
            .map(|m| format!("{}={}", m.name, m.peer_url()))
            .collect()
    }

    pub fn client_urls(&self) -> Vec<String> {
        self.members.values().map(|m| m.client_url()).collect()
    }

    /// Members present in `self` but absent from `other`.
    pub fn diff(&self, other: &MemberSet) -> MemberSet {
        let mut out = MemberSet::new();
        for m in self.members.values() {
            if !other.contains(&m.name) {
                out.add(m.clone());
            }
        }
        out
    }

    /// The member with the highest ordinal, if any.
    pub fn highest_ordinal_member(&self) -> Option<&Member> {
        self.members
            .values()
            .max_by_key(|m| member_ordinal(&m.name).unwrap_or(0))
    }

    /// Highest ordinal present in the set.
    pub fn max_ordinal(&self) -> Option<u64> {
        self.members
            .keys()
            .filter_map(|n| member_ordinal(n))
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(cluster: &str, ordinal: u64) -> Member {
        Member::new(member_name(cluster, ordinal), "default", false, false)
    }

    #[test]
    fn member_name_round_trip() {
        let name = member_name("etcd-test", 7);
        assert_eq!(name, "etcd-test-0007");
        assert_eq!(member_ordinal(&name), Some(7));
        assert_eq!(cluster_name_from_member(&name), "etcd-test");
    }

    #[test]
    fn urls_follow_secure_flags() {
        let m = Member::new(member_name("c", 0), "ns", true, false);
        assert_eq!(m.peer_url(), "https://c-0000.c.ns.svc:2380");
        assert_eq!(m.client_url(), "http://c-0000.c.ns.svc:2379");
    }

    #[test]
    fn peer_url_pairs_are_ordered_by_name() {
        let mut set = MemberSet::new();
        set.add(member("c", 2));
        set.add(member("c", 0));
        set.add(member("c", 1));
        let pairs = set.peer_url_pairs();
        assert_eq!(pairs.len(), 3);
        assert!(pairs[0].starts_with("c-0000="));
        assert!(pairs[1].starts_with("c-0001="));
        assert!(pairs[2].starts_with("c-0002="));
    }

    #[test]
    fn diff_reports_members_missing_from_other() {
        let mut a = MemberSet::new();
        a.add(member("c", 0));
        a.add(member("c", 1));
        let b = MemberSet::with_member(member("c", 0));

        let d = a.diff(&b);
        assert_eq!(d.size(), 1);
        assert!(d.contains("c-0001"));
        assert!(b.diff(&a).is_empty());
    }

    #[test]
    fn highest_ordinal_member_is_scale_down_victim() {
        let mut set = MemberSet::new();
        set.add(member("c", 3));
        set.add(member("c", 10));
        set.add(member("c", 7));
        assert_eq!(set.highest_ordinal_member().unwrap().name, "c-0010");
        assert_eq!(set.max_ordinal(), Some(10));
    }

    #[test]
    fn names_appear_at_most_once() {
        let mut set = MemberSet::new();
        set.add(member("c", 0));
        set.add(member("c", 0));
        assert_eq!(set.size(), 1);
    }
}
