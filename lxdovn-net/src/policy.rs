//! Router security policy — spec.md §4.12. Shared between `NetworkProjection`
//! (rebuilt on every setup) and `PeeringManager` (rebuilt on peer create/delete
//! so policy always mirrors the current peer set).

use lxdovn_types::{ClusterDb, CoreResult, NetworkConfig, NetworkId, PeerState};

use crate::names;
use crate::ovn::{MayExist, OvnClient, TransactOp, WaitMode};

/// One connected peer's contribution to the local router's policy: its
/// address set (source to match/drop) and its own router-port name (used
/// only to label the generated rule so a diff on update is possible).
#[derive(Debug, Clone)]
pub struct PeerPolicyEntry {
    pub peer_router_port_name: String,
    pub peer_address_set: String,
}

fn rule_name(router: &str, suffix: &str) -> String {
    format!("{router}-policy-{suffix}")
}

/// Rebuilds the full policy set for one network's router: the three fixed
/// base policies plus two priority-500 drop rules per connected peer
/// (v4 and v6), each labelled with the peer's router-port name so a
/// subsequent rebuild can recognize and replace its own rows.
pub async fn apply_router_security_policy(
    ovn: &dyn OvnClient,
    cfg: &NetworkConfig,
    peers: &[PeerPolicyEntry],
) -> CoreResult<()> {
    let router = names::router(cfg.id);
    let internal_port = names::router_port_int(cfg.id);
    let external_port = names::router_port_ext(cfg.id);
    let address_set = names::network_address_set(cfg.id);

    let mut ops = vec![
        TransactOp::upsert(
            "Logical_Router_Policy",
            rule_name(&router, "allow-internal-v6"),
            MayExist::CreateOrUpdate,
        )
        .with_field("priority", 600)
        .with_field("action", "allow")
        .with_field(
            "match",
            format!("inport == {internal_port:?} && ip6 && ip6.src == ${address_set}_ip6"),
        ),
        TransactOp::upsert(
            "Logical_Router_Policy",
            rule_name(&router, "allow-internal-v4"),
            MayExist::CreateOrUpdate,
        )
        .with_field("priority", 600)
        .with_field("action", "allow")
        .with_field(
            "match",
            format!("inport == {internal_port:?} && ip4 && ip4.src == ${address_set}_ip4"),
        ),
        TransactOp::upsert(
            "Logical_Router_Policy",
            rule_name(&router, "drop-internal-catchall"),
            MayExist::CreateOrUpdate,
        )
        .with_field("priority", 500)
        .with_field("action", "drop")
        .with_field("match", format!("inport == {internal_port:?}")),
    ];

    for peer in peers {
        ops.push(
            TransactOp::upsert(
                "Logical_Router_Policy",
                rule_name(&router, &format!("drop-peer-v4-{}", peer.peer_router_port_name)),
                MayExist::CreateOrUpdate,
            )
            .with_field("priority", 500)
            .with_field("action", "drop")
            .with_field(
                "match",
                format!(
                    "inport == {external_port:?} && ip4 && ip4.src == ${}_ip4 /* {} */",
                    peer.peer_address_set, peer.peer_router_port_name
                ),
            ),
        );
        ops.push(
            TransactOp::upsert(
                "Logical_Router_Policy",
                rule_name(&router, &format!("drop-peer-v6-{}", peer.peer_router_port_name)),
                MayExist::CreateOrUpdate,
            )
            .with_field("priority", 500)
            .with_field("action", "drop")
            .with_field(
                "match",
                format!(
                    "inport == {external_port:?} && ip6 && ip6.src == ${}_ip6 /* {} */",
                    peer.peer_address_set, peer.peer_router_port_name
                ),
            ),
        );
    }

    ovn.transact(ops, WaitMode::None).await
}

/// The peer set as `apply_router_security_policy` wants it: only peers that
/// have finished `peerSetup` (`PeerState::Created`) contribute a drop rule.
pub(crate) async fn connected_peer_policy_entries(
    db: &dyn ClusterDb,
    network_id: NetworkId,
) -> CoreResult<Vec<PeerPolicyEntry>> {
    let peers = db.list_peers(network_id).await?;
    Ok(peers
        .iter()
        .filter(|p| p.state == PeerState::Created)
        .filter_map(|p| {
            p.target_network_id.map(|target_id| PeerPolicyEntry {
                peer_router_port_name: names::peer_router_port(network_id, target_id),
                peer_address_set: names::network_address_set(target_id),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::InMemoryOvnClient;
    use std::collections::BTreeMap;

    fn cfg() -> NetworkConfig {
        NetworkConfig::parse(
            lxdovn_types::NetworkId(7),
            "p1",
            "n1",
            &BTreeMap::from([("network".to_string(), "uplink1".to_string())]),
            &["uplink1".to_string()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn base_policies_are_always_present() {
        let ovn = InMemoryOvnClient::new();
        apply_router_security_policy(&ovn, &cfg(), &[]).await.unwrap();
        let rows = ovn.list("Logical_Router_Policy").await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn each_peer_adds_two_drop_rules() {
        let ovn = InMemoryOvnClient::new();
        let peers = vec![PeerPolicyEntry {
            peer_router_port_name: "lxd-net7-lrp-peer-net9".into(),
            peer_address_set: "lxd-net9-addrset".into(),
        }];
        apply_router_security_policy(&ovn, &cfg(), &peers).await.unwrap();
        let rows = ovn.list("Logical_Router_Policy").await.unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let ovn = InMemoryOvnClient::new();
        apply_router_security_policy(&ovn, &cfg(), &[]).await.unwrap();
        apply_router_security_policy(&ovn, &cfg(), &[]).await.unwrap();
        let rows = ovn.list("Logical_Router_Policy").await.unwrap();
        assert_eq!(rows.len(), 3);
    }
}
