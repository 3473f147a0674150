//! Contract-only traits for the external collaborators this core consumes
//! (spec.md §6 "External Interfaces"). Concrete SQL, OVSDB, and HTTP
//! plumbing live entirely in whichever binary wires a real implementation
//! in; tests use the in-memory fakes alongside each trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreResult;
use crate::ids::NetworkId;
use crate::network::Project;

/// One cluster member, as listed by the cluster DB's node table. Used for
/// stable priority ordering (chassis group priorities, §4.8 step 6) and as
/// the pool of members `ClusterLocks` may open a client connection to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub address: String,
    pub is_local: bool,
    /// Whether this member carries the OVN chassis role (spec.md §4.8
    /// Start: "if local member has the chassis role").
    pub has_chassis_role: bool,
}

/// A persisted network row, as the cluster DB stores it: raw option map
/// plus the identifiers the DB itself owns. `lxdovn-net` parses `options`
/// into a [`crate::network::NetworkConfig`] at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRow {
    pub id: NetworkId,
    pub project: String,
    pub name: String,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRow {
    pub network_id: NetworkId,
    pub listen_address: String,
    pub default_target: Option<String>,
    pub ports: Vec<PortMapRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerRow {
    pub network_id: NetworkId,
    pub listen_address: String,
    pub ports: Vec<PortMapRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapRow {
    pub protocol: String,
    pub listen_ports: Vec<u16>,
    pub target_address: String,
    pub target_ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Pending,
    Created,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRow {
    pub network_id: NetworkId,
    pub name: String,
    pub target_project: String,
    pub target_network: String,
    pub target_network_id: Option<NetworkId>,
    pub state: PeerState,
}

/// Transactional access to networks, forwards, load balancers, peers,
/// projects, and the node list (spec.md §6, "Cluster DB (contract only)").
#[async_trait]
pub trait ClusterDb: Send + Sync {
    async fn get_network(&self, project: &str, name: &str) -> CoreResult<Option<NetworkRow>>;
    async fn list_networks(&self) -> CoreResult<Vec<NetworkRow>>;
    async fn list_networks_on_uplink(&self, uplink: &str) -> CoreResult<Vec<NetworkRow>>;
    async fn upsert_network(&self, row: NetworkRow) -> CoreResult<()>;
    async fn delete_network(&self, project: &str, name: &str) -> CoreResult<()>;

    async fn get_project(&self, name: &str) -> CoreResult<Option<Project>>;

    async fn list_forwards(&self, network_id: NetworkId) -> CoreResult<Vec<ForwardRow>>;
    async fn upsert_forward(&self, row: ForwardRow) -> CoreResult<()>;
    async fn delete_forward(&self, network_id: NetworkId, listen_address: &str) -> CoreResult<()>;

    async fn list_load_balancers(&self, network_id: NetworkId) -> CoreResult<Vec<LoadBalancerRow>>;
    async fn upsert_load_balancer(&self, row: LoadBalancerRow) -> CoreResult<()>;
    async fn delete_load_balancer(&self, network_id: NetworkId, listen_address: &str) -> CoreResult<()>;

    async fn list_peers(&self, network_id: NetworkId) -> CoreResult<Vec<PeerRow>>;
    async fn upsert_peer(&self, row: PeerRow) -> CoreResult<()>;
    async fn delete_peer(&self, network_id: NetworkId, name: &str) -> CoreResult<()>;

    async fn list_members(&self) -> CoreResult<Vec<ClusterMember>>;
}

/// In-memory `ClusterDb`, keyed the way a real cluster database would key
/// these rows. Used by the bootstrap binary in single-node/dev mode and by
/// every `lxdovn-net` unit test that previously hand-rolled its own
/// equivalent fake.
#[derive(Default)]
pub struct InMemoryClusterDb {
    networks: dashmap::DashMap<(String, String), NetworkRow>,
    projects: dashmap::DashMap<String, Project>,
    forwards: dashmap::DashMap<NetworkId, BTreeMap<String, ForwardRow>>,
    load_balancers: dashmap::DashMap<NetworkId, BTreeMap<String, LoadBalancerRow>>,
    peers: dashmap::DashMap<NetworkId, BTreeMap<String, PeerRow>>,
    members: dashmap::DashMap<String, ClusterMember>,
}

impl InMemoryClusterDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_project(&self, project: Project) {
        self.projects.insert(project.name.clone(), project);
    }

    pub fn seed_member(&self, member: ClusterMember) {
        self.members.insert(member.name.clone(), member);
    }
}

#[async_trait]
impl ClusterDb for InMemoryClusterDb {
    async fn get_network(&self, project: &str, name: &str) -> CoreResult<Option<NetworkRow>> {
        Ok(self
            .networks
            .get(&(project.to_string(), name.to_string()))
            .map(|entry| entry.clone()))
    }

    async fn list_networks(&self) -> CoreResult<Vec<NetworkRow>> {
        Ok(self.networks.iter().map(|entry| entry.clone()).collect())
    }

    async fn list_networks_on_uplink(&self, uplink: &str) -> CoreResult<Vec<NetworkRow>> {
        Ok(self
            .networks
            .iter()
            .filter(|entry| entry.options.get("network").map(String::as_str) == Some(uplink))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn upsert_network(&self, row: NetworkRow) -> CoreResult<()> {
        self.networks
            .insert((row.project.clone(), row.name.clone()), row);
        Ok(())
    }

    async fn delete_network(&self, project: &str, name: &str) -> CoreResult<()> {
        self.networks
            .remove(&(project.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_project(&self, name: &str) -> CoreResult<Option<Project>> {
        Ok(self.projects.get(name).map(|entry| entry.clone()))
    }

    async fn list_forwards(&self, network_id: NetworkId) -> CoreResult<Vec<ForwardRow>> {
        Ok(self
            .forwards
            .get(&network_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_forward(&self, row: ForwardRow) -> CoreResult<()> {
        self.forwards
            .entry(row.network_id)
            .or_default()
            .insert(row.listen_address.clone(), row);
        Ok(())
    }

    async fn delete_forward(&self, network_id: NetworkId, listen_address: &str) -> CoreResult<()> {
        if let Some(mut entry) = self.forwards.get_mut(&network_id) {
            entry.remove(listen_address);
        }
        Ok(())
    }

    async fn list_load_balancers(&self, network_id: NetworkId) -> CoreResult<Vec<LoadBalancerRow>> {
        Ok(self
            .load_balancers
            .get(&network_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_load_balancer(&self, row: LoadBalancerRow) -> CoreResult<()> {
        self.load_balancers
            .entry(row.network_id)
            .or_default()
            .insert(row.listen_address.clone(), row);
        Ok(())
    }

    async fn delete_load_balancer(
        &self,
        network_id: NetworkId,
        listen_address: &str,
    ) -> CoreResult<()> {
        if let Some(mut entry) = self.load_balancers.get_mut(&network_id) {
            entry.remove(listen_address);
        }
        Ok(())
    }

    async fn list_peers(&self, network_id: NetworkId) -> CoreResult<Vec<PeerRow>> {
        Ok(self
            .peers
            .get(&network_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_peer(&self, row: PeerRow) -> CoreResult<()> {
        self.peers
            .entry(row.network_id)
            .or_default()
            .insert(row.name.clone(), row);
        Ok(())
    }

    async fn delete_peer(&self, network_id: NetworkId, name: &str) -> CoreResult<()> {
        if let Some(mut entry) = self.peers.get_mut(&network_id) {
            entry.remove(name);
        }
        Ok(())
    }

    async fn list_members(&self) -> CoreResult<Vec<ClusterMember>> {
        Ok(self.members.iter().map(|entry| entry.clone()).collect())
    }
}
