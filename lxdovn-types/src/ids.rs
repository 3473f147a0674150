//! Shared identifiers. Kept newtype-wrapped rather than bare so a
//! `NetworkId` can never be passed where an instance id or operation id is
//! expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cluster-unique integer id for a network (spec.md §3: "Identified by
/// (project, name) with a cluster-unique integer id").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub i64);

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(instance_uuid, device_name)` — the key for an instance NIC binding
/// (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NicKey {
    pub instance_uuid: Uuid,
    pub device_name: String,
}

impl std::fmt::Display for NicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instance_uuid, self.device_name)
    }
}

/// `(project, name)` — the natural key for a network before its integer id
/// is known (e.g. when resolving a peer by name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkRef {
    pub project: String,
    pub name: String,
}
