//! Wire types for the etcd v3 gRPC-gateway JSON API.
//!
//! The gateway encodes uint64 fields as decimal strings; the serde helpers
//! below fold that back into `u64`.

use serde::{Deserialize, Serialize};

/// A member as reported by `/v3/cluster/member/list`.
///
/// An unstarted member (just added, pod not yet running) reports an empty
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    #[serde(
        rename = "ID",
        default,
        with = "string_u64"
    )]
    pub id: u64,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,

    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MemberListResponse {
    #[serde(default)]
    pub members: Vec<ClusterMember>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MemberAddResponse {
    pub member: ClusterMember,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HealthResponse {
    #[serde(default)]
    pub health: String,
}

/// Client-side TLS material, PEM-encoded, as read out of the cluster's
/// operator secret.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsBundle {
    // key material stays out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsBundle")
            .field("ca_pem", &self.ca_pem.len())
            .field("cert_pem", &self.cert_pem.len())
            .field("key_pem", &self.key_pem.len())
            .finish()
    }
}

/// uint64-as-string codec used by the gRPC gateway.
mod string_u64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_list_parses_string_ids() {
        let body = r#"{"header":{},"members":[
            {"ID":"10501334649042878790","name":"c-0000",
             "peerURLs":["http://c-0000.c.ns.svc:2380"],
             "clientURLs":["http://c-0000.c.ns.svc:2379"]},
            {"ID":"42","peerURLs":["http://c-0001.c.ns.svc:2380"]}
        ]}"#;
        let resp: MemberListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.members.len(), 2);
        assert_eq!(resp.members[0].id, 10501334649042878790);
        assert_eq!(resp.members[0].name, "c-0000");
        // unstarted member: no name, no client urls
        assert_eq!(resp.members[1].id, 42);
        assert!(resp.members[1].name.is_empty());
        assert!(resp.members[1].client_urls.is_empty());
    }
}
