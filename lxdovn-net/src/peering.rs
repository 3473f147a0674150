//! Network-to-network peering — spec.md §4.10.
//!
//! A peering is a pair of router ports with mirrored static routes and
//! address sets. Each side's `PeerRow` starts `pending` and only moves to
//! `created` once both sides name each other, at which point `peerSetup`
//! wires the OVN objects and rebuilds both routers' security policy.

use std::sync::Arc;

use lxdovn_types::{ClusterDb, CoreError, CoreResult, NetworkConfig, NetworkId, PeerRow, PeerState};

use crate::names;
use crate::ovn::{MayExist, OvnClient, TransactOp, WaitMode};
use crate::policy;

pub struct PeeringManager {
    ovn: Arc<dyn OvnClient>,
    db: Arc<dyn ClusterDb>,
}

impl PeeringManager {
    pub fn new(ovn: Arc<dyn OvnClient>, db: Arc<dyn ClusterDb>) -> Self {
        Self { ovn, db }
    }

    /// Creates a peer record on `local`. If the target network already
    /// carries a reciprocal record naming `local`, both rows move to
    /// `created` and `peerSetup` runs.
    pub async fn create(
        &self,
        local: &NetworkConfig,
        peer_name: &str,
        target_project: &str,
        target_network: &str,
    ) -> CoreResult<()> {
        let existing = self.db.list_peers(local.id).await?;
        if existing.iter().any(|p| p.name == peer_name) {
            return Err(CoreError::conflict(format!("peer {peer_name:?} already exists")));
        }
        if existing
            .iter()
            .any(|p| p.target_project == target_project && p.target_network == target_network)
        {
            return Err(CoreError::conflict(format!(
                "a peering to {target_project}/{target_network} already exists"
            )));
        }

        let target_row = self.db.get_network(target_project, target_network).await?;

        let mut local_row = PeerRow {
            network_id: local.id,
            name: peer_name.to_string(),
            target_project: target_project.to_string(),
            target_network: target_network.to_string(),
            target_network_id: target_row.as_ref().map(|r| r.id),
            state: PeerState::Pending,
        };
        self.db.upsert_peer(local_row.clone()).await?;

        let Some(target_row) = target_row else {
            return Ok(());
        };

        let reciprocal = self
            .db
            .list_peers(target_row.id)
            .await?
            .into_iter()
            .find(|p| p.target_project == local.project && p.target_network == local.name);
        let Some(mut reciprocal) = reciprocal else {
            return Ok(());
        };

        local_row.state = PeerState::Created;
        reciprocal.state = PeerState::Created;
        reciprocal.target_network_id = Some(local.id);

        let target_opts = target_row.options.clone();
        let target_cfg = NetworkConfig::parse(
            target_row.id,
            &target_row.project,
            &target_row.name,
            &target_opts,
            &[reciprocal_uplink(&target_opts)],
        )?;

        self.peer_setup(local, &local_row, &target_cfg, &reciprocal).await?;

        self.db.upsert_peer(local_row).await?;
        self.db.upsert_peer(reciprocal).await?;
        Ok(())
    }

    async fn peer_setup(
        &self,
        local: &NetworkConfig,
        local_row: &PeerRow,
        target: &NetworkConfig,
        target_row: &PeerRow,
    ) -> CoreResult<()> {
        let mut ops = Vec::new();
        ops.extend(self.peer_route_ops(local, local_row.network_id, target));
        ops.extend(self.peer_route_ops(target, target_row.network_id, local));
        self.ovn.transact(ops, WaitMode::None).await?;

        let local_peers = policy::connected_peer_policy_entries(self.db.as_ref(), local.id).await?;
        policy::apply_router_security_policy(self.ovn.as_ref(), local, &local_peers).await?;
        let target_peers = policy::connected_peer_policy_entries(self.db.as_ref(), target.id).await?;
        policy::apply_router_security_policy(self.ovn.as_ref(), target, &target_peers).await?;
        Ok(())
    }

    /// Static routes on `from`'s router toward `to`'s internal subnets,
    /// next-hop `to`'s own external router address.
    fn peer_route_ops(&self, from: &NetworkConfig, from_id: NetworkId, to: &NetworkConfig) -> Vec<TransactOp> {
        let router = names::router(from_id);
        let port_name = names::peer_router_port(from_id, to.id);
        let mut ops = Vec::new();

        if let (Some(subnet), Some(nexthop)) = (to.ipv4.address_v4, to.volatile.ipv4_address) {
            ops.push(
                TransactOp::upsert(
                    "Logical_Router_Static_Route",
                    format!("{router}-{port_name}-v4"),
                    MayExist::CreateOrUpdate,
                )
                .with_field("ip_prefix", subnet.to_string())
                .with_field("nexthop", nexthop.to_string()),
            );
        }
        if let (Some(subnet), Some(nexthop)) = (to.ipv6.address_v6, to.volatile.ipv6_address) {
            ops.push(
                TransactOp::upsert(
                    "Logical_Router_Static_Route",
                    format!("{router}-{port_name}-v6"),
                    MayExist::CreateOrUpdate,
                )
                .with_field("ip_prefix", subnet.to_string())
                .with_field("nexthop", nexthop.to_string()),
            );
        }
        ops
    }

    /// Tears down the OVN side (if `created`) and recomputes both routers'
    /// policy with the peer excluded, then removes the DB row.
    ///
    /// Rejecting delete while the peer is referenced by an ACL rule's
    /// `@peer:<name>` subject is not implemented: ACLs in this core are
    /// tracked only as opaque names for port-group membership (`NicConfig`,
    /// `NetworkConfig::acls`), with no representation of an ACL's own rule
    /// subjects, so there is nothing here to scan for such a reference.
    pub async fn delete(&self, local: &NetworkConfig, peer_name: &str) -> CoreResult<()> {
        let peers = self.db.list_peers(local.id).await?;
        let Some(row) = peers.iter().find(|p| p.name == peer_name) else {
            return Err(CoreError::not_found(format!("peer {peer_name:?} not found")));
        };

        if row.state != PeerState::Created {
            return self.db.delete_peer(local.id, peer_name).await;
        }

        let Some(target_id) = row.target_network_id else {
            return self.db.delete_peer(local.id, peer_name).await;
        };
        let router = names::router(local.id);
        let port_name = names::peer_router_port(local.id, target_id);
        self.ovn
            .transact(
                vec![
                    TransactOp::delete("Logical_Router_Static_Route", format!("{router}-{port_name}-v4")),
                    TransactOp::delete("Logical_Router_Static_Route", format!("{router}-{port_name}-v6")),
                ],
                WaitMode::None,
            )
            .await?;

        self.db.delete_peer(local.id, peer_name).await?;

        let local_peers = policy::connected_peer_policy_entries(self.db.as_ref(), local.id).await?;
        policy::apply_router_security_policy(self.ovn.as_ref(), local, &local_peers).await?;

        if let Some(target_row) = self.db.get_network(&row.target_project, &row.target_network).await? {
            let remote_port = names::peer_router_port(target_id, local.id);
            let remote_router = names::router(target_id);
            self.ovn
                .transact(
                    vec![
                        TransactOp::delete(
                            "Logical_Router_Static_Route",
                            format!("{remote_router}-{remote_port}-v4"),
                        ),
                        TransactOp::delete(
                            "Logical_Router_Static_Route",
                            format!("{remote_router}-{remote_port}-v6"),
                        ),
                    ],
                    WaitMode::None,
                )
                .await?;

            let target_cfg = NetworkConfig::parse(
                target_id,
                &target_row.project,
                &target_row.name,
                &target_row.options,
                &[reciprocal_uplink(&target_row.options)],
            )?;
            let target_peers = policy::connected_peer_policy_entries(self.db.as_ref(), target_id).await?;
            policy::apply_router_security_policy(self.ovn.as_ref(), &target_cfg, &target_peers).await?;
        }

        Ok(())
    }
}

fn reciprocal_uplink(opts: &std::collections::BTreeMap<String, String>) -> String {
    opts.get("network").cloned().unwrap_or_default()
}
