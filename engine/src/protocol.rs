//! Wire events exchanged between registries and replicas.
//!
//! A registry with prefix `P = namespace:store` answers `P:registry:*`
//! requests; a replica with key `K = P:name` exchanges `K:state` and
//! `K:update`.

use serde::{Deserialize, Serialize};

pub mod events {
    pub const CONNECT: &str = "connect";
    pub const REMOVE: &str = "remove";
    pub const LIST: &str = "list";
    pub const PROBE: &str = "probe";

    /// `P:registry:<action>`
    pub fn registry(prefix: &str, action: &str) -> String {
        format!("{prefix}:registry:{action}")
    }

    /// `K:state`
    pub fn state(key: &str) -> String {
        format!("{key}:state")
    }

    /// `K:update`
    pub fn update(key: &str) -> String {
        format!("{key}:update")
    }
}

/// A client asking the coordinator to connect its side of a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub name: String,
    #[serde(default)]
    pub initial: Option<serde_json::Value>,
    /// Highest migration the client declares
    #[serde(default)]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaListing {
    pub name: String,
    pub connected: bool,
}
