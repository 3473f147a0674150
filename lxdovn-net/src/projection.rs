//! Realizes one network's logical projection on OVN — spec.md §4.8. This
//! is the largest single responsibility in the crate: building routers,
//! switches, ports, NAT, routes, address sets, and the ACL/internal port
//! groups, idempotently, with LIFO rollback on failure.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::Ipv6Net;
use lxdovn_types::{ClusterDb, CoreResult, NetworkConfig, NetworkId, Project};

use crate::ipam;
use crate::names;
use crate::ovn::{MayExist, OvnClient, TransactOp, WaitMode};
use crate::policy;
use crate::types::{RevertStack, UplinkInfo};

fn derive_mtu(cfg: &NetworkConfig, uplink: &UplinkInfo) -> u32 {
    if let Some(mtu) = cfg.bridge_mtu {
        return mtu;
    }
    let overhead: u32 = if cfg.ipv6.address_v6.is_some() { 78 } else { 58 };
    let headroom = uplink.mtu.saturating_sub(overhead);
    [1500u32, 1442, 1422]
        .into_iter()
        .find(|candidate| *candidate <= headroom)
        .unwrap_or(1280)
}

pub(crate) fn eui64_address(mac: &str, prefix: Ipv6Net) -> Option<Ipv6Addr> {
    let octets: Vec<u8> = mac
        .split(':')
        .map(|h| u8::from_str_radix(h, 16))
        .collect::<Result<_, _>>()
        .ok()?;
    if octets.len() != 6 {
        return None;
    }
    let mut iid = [0u8; 8];
    iid[0] = octets[0] ^ 0x02;
    iid[1] = octets[1];
    iid[2] = octets[2];
    iid[3] = 0xff;
    iid[4] = 0xfe;
    iid[5] = octets[3];
    iid[6] = octets[4];
    iid[7] = octets[5];

    let prefix_octets = prefix.network().octets();
    let mut addr_octets = [0u8; 16];
    addr_octets[..8].copy_from_slice(&prefix_octets[..8]);
    addr_octets[8..].copy_from_slice(&iid);
    Some(Ipv6Addr::from(addr_octets))
}

pub struct NetworkProjection {
    ovn: Arc<dyn OvnClient>,
    db: Arc<dyn ClusterDb>,
    server_cert_fingerprint: String,
}

impl NetworkProjection {
    pub fn new(ovn: Arc<dyn OvnClient>, db: Arc<dyn ClusterDb>, server_cert_fingerprint: String) -> Self {
        Self {
            ovn,
            db,
            server_cert_fingerprint,
        }
    }

    pub async fn create(
        &self,
        cfg: &NetworkConfig,
        project: &Project,
        uplink: &UplinkInfo,
    ) -> CoreResult<()> {
        self.setup(cfg, project, uplink, false).await
    }

    /// `Update(newConfig)`. If the uplink changed, stops the network on the
    /// old config first (dropping its volatile uplink IPs is the caller's
    /// responsibility — it owns persistence of `new_cfg.volatile`).
    pub async fn update(
        &self,
        old: &NetworkConfig,
        new_cfg: &NetworkConfig,
        project: &Project,
        uplink: &UplinkInfo,
    ) -> CoreResult<()> {
        if old.changed_keys(new_cfg).contains(&"network") {
            self.stop(old).await?;
        }
        self.setup(new_cfg, project, uplink, true).await
    }

    async fn setup(
        &self,
        cfg: &NetworkConfig,
        project: &Project,
        uplink: &UplinkInfo,
        update: bool,
    ) -> CoreResult<()> {
        let mut revert = RevertStack::new();
        match self.setup_inner(cfg, project, uplink, update, &mut revert).await {
            Ok(()) => Ok(()),
            Err(err) => {
                revert.unwind(self.ovn.as_ref()).await;
                Err(err)
            }
        }
    }

    async fn ensure(
        &self,
        kind: &str,
        name: &str,
        op: TransactOp,
        revert: &mut RevertStack,
    ) -> CoreResult<()> {
        let existed = self.ovn.get(kind, name).await?.is_some();
        self.ovn.transact(vec![op], WaitMode::None).await?;
        if !existed {
            revert.record_created(kind, name);
        }
        Ok(())
    }

    async fn setup_inner(
        &self,
        cfg: &NetworkConfig,
        _project: &Project,
        uplink: &UplinkInfo,
        _update: bool,
        revert: &mut RevertStack,
    ) -> CoreResult<()> {
        let mtu = derive_mtu(cfg, uplink);
        let mac = match &cfg.router_mac {
            Some(explicit) => explicit.clone(),
            None => lxdovn_crypto::router_mac(&format!(
                "{}.0.{}",
                self.server_cert_fingerprint, cfg.id
            )),
        };

        let (v4, v6) = self.resolve_uplink_addresses(cfg, uplink, &mac).await?;

        self.ensure_logical_objects(cfg, uplink, &mac, mtu, v4, v6, revert).await?;
        self.apply_snat(cfg, uplink, v4, v6, revert).await?;
        self.apply_routes(cfg, uplink, v4, v6, revert).await?;
        self.ensure_address_set(cfg, revert).await?;
        let peer_entries = policy::connected_peer_policy_entries(self.db.as_ref(), cfg.id).await?;
        policy::apply_router_security_policy(self.ovn.as_ref(), cfg, &peer_entries).await?;
        self.ensure_port_group(&names::network_port_group(cfg.id), revert).await?;
        for acl in &cfg.acls {
            self.ensure_port_group(&names::acl_port_group(acl), revert).await?;
        }

        Ok(())
    }

    /// Picks uplink external addresses for this network, excluding
    /// addresses already held by every other OVN network sharing the
    /// uplink (spec.md §4.8 step 5, §8 "uplink allocation uniqueness").
    async fn resolve_uplink_addresses(
        &self,
        cfg: &NetworkConfig,
        uplink: &UplinkInfo,
        mac: &str,
    ) -> CoreResult<(Option<Ipv4Addr>, Option<Ipv6Addr>)> {
        let mut v4 = cfg.volatile.ipv4_address;
        let mut v6 = cfg.volatile.ipv6_address;

        if v4.is_none() && !uplink.ovn_ranges_v4.is_empty() {
            let excluded = self.excluded_uplink_addresses(cfg.id, uplink, true).await?;
            let ranges: Vec<(IpAddr, IpAddr)> = uplink
                .ovn_ranges_v4
                .iter()
                .map(|(a, b)| (IpAddr::V4(*a), IpAddr::V4(*b)))
                .collect();
            if let IpAddr::V4(picked) = ipam::allocate(&ranges, &excluded)? {
                v4 = Some(picked);
            }
        }

        if v6.is_none() {
            if let Some((start, end)) = uplink.ovn_ranges_v6 {
                let excluded = self.excluded_uplink_addresses(cfg.id, uplink, false).await?;
                let ranges = vec![(IpAddr::V6(start), IpAddr::V6(end))];
                if let IpAddr::V6(picked) = ipam::allocate(&ranges, &excluded)? {
                    v6 = Some(picked);
                }
            } else if let Some(prefix) = uplink.routes_v6.first() {
                v6 = eui64_address(mac, *prefix);
            }
        }

        Ok((v4, v6))
    }

    async fn excluded_uplink_addresses(
        &self,
        this_network: NetworkId,
        uplink: &UplinkInfo,
        v4: bool,
    ) -> CoreResult<HashSet<IpAddr>> {
        let key = if v4 {
            "volatile.network.ipv4.address"
        } else {
            "volatile.network.ipv6.address"
        };
        let rows = self.db.list_networks_on_uplink(&uplink.name).await?;
        Ok(rows
            .iter()
            .filter(|row| row.id != this_network)
            .filter_map(|row| row.options.get(key))
            .filter_map(|s| s.parse().ok())
            .collect())
    }

    async fn ensure_logical_objects(
        &self,
        cfg: &NetworkConfig,
        uplink: &UplinkInfo,
        mac: &str,
        mtu: u32,
        v4: Option<Ipv4Addr>,
        v6: Option<Ipv6Addr>,
        revert: &mut RevertStack,
    ) -> CoreResult<()> {
        let router = names::router(cfg.id);
        self.ensure(
            "Logical_Router",
            &router,
            TransactOp::upsert("Logical_Router", router.clone(), MayExist::CreateOrUpdate)
                .with_field("mac", mac)
                .with_field("mtu", mtu),
            revert,
        )
        .await?;

        let ext_switch = names::switch_ext(cfg.id);
        self.ensure(
            "Logical_Switch",
            &ext_switch,
            TransactOp::upsert("Logical_Switch", ext_switch.clone(), MayExist::CreateOrUpdate),
            revert,
        )
        .await?;

        let int_switch = names::switch_int(cfg.id);
        self.ensure(
            "Logical_Switch",
            &int_switch,
            TransactOp::upsert("Logical_Switch", int_switch.clone(), MayExist::CreateOrUpdate),
            revert,
        )
        .await?;

        let router_port_ext = names::router_port_ext(cfg.id);
        let mut ext_networks = Vec::new();
        if let Some(ip) = v4 {
            let len = uplink.cidr_v4.map(|n| n.prefix_len()).unwrap_or(24);
            ext_networks.push(format!("{ip}/{len}"));
        }
        if let Some(ip) = v6 {
            let len = uplink.cidr_v6.map(|n| n.prefix_len()).unwrap_or(64);
            ext_networks.push(format!("{ip}/{len}"));
        }
        self.ensure(
            "Logical_Router_Port",
            &router_port_ext,
            TransactOp::upsert(
                "Logical_Router_Port",
                router_port_ext.clone(),
                MayExist::CreateOrUpdate,
            )
            .with_field("mac", mac)
            .with_field("networks", serde_json::json!(ext_networks)),
            revert,
        )
        .await?;

        let router_port_int = names::router_port_int(cfg.id);
        let mut int_networks = Vec::new();
        if let Some(net) = cfg.ipv4.address_v4 {
            int_networks.push(net.to_string());
        }
        if let Some(net) = cfg.ipv6.address_v6 {
            int_networks.push(net.to_string());
        }
        self.ensure(
            "Logical_Router_Port",
            &router_port_int,
            TransactOp::upsert(
                "Logical_Router_Port",
                router_port_int.clone(),
                MayExist::CreateOrUpdate,
            )
            .with_field("mac", mac)
            .with_field("networks", serde_json::json!(int_networks)),
            revert,
        )
        .await?;

        let ext_lsp_router = names::switch_ext_port_router(cfg.id);
        self.ensure(
            "Logical_Switch_Port",
            &ext_lsp_router,
            TransactOp::upsert(
                "Logical_Switch_Port",
                ext_lsp_router.clone(),
                MayExist::CreateOrUpdate,
            )
            .with_field("type", "router")
            .with_field("router_port", router_port_ext.clone()),
            revert,
        )
        .await?;

        let ext_lsp_provider = names::switch_ext_port_provider(cfg.id);
        self.ensure(
            "Logical_Switch_Port",
            &ext_lsp_provider,
            TransactOp::upsert(
                "Logical_Switch_Port",
                ext_lsp_provider.clone(),
                MayExist::CreateOrUpdate,
            )
            .with_field("type", "localnet"),
            revert,
        )
        .await?;

        let int_lsp_router = names::switch_int_port_router(cfg.id);
        self.ensure(
            "Logical_Switch_Port",
            &int_lsp_router,
            TransactOp::upsert(
                "Logical_Switch_Port",
                int_lsp_router.clone(),
                MayExist::CreateOrUpdate,
            )
            .with_field("type", "router")
            .with_field("router_port", router_port_int.clone()),
            revert,
        )
        .await?;

        if cfg.ipv4.dhcp && cfg.ipv4.address_v4.is_some() {
            let dhcpv4 = names::dhcpv4_options(cfg.id);
            self.ensure(
                "DHCP_Options",
                &dhcpv4,
                TransactOp::upsert("DHCP_Options", dhcpv4.clone(), MayExist::CreateOrUpdate)
                    .with_field("cidr", cfg.ipv4.address_v4.unwrap().to_string()),
                revert,
            )
            .await?;
        }
        if cfg.ipv6.dhcp && cfg.ipv6.address_v6.is_some() {
            let dhcpv6 = names::dhcpv6_options(cfg.id);
            self.ensure(
                "DHCP_Options",
                &dhcpv6,
                TransactOp::upsert("DHCP_Options", dhcpv6.clone(), MayExist::CreateOrUpdate)
                    .with_field("cidr", cfg.ipv6.address_v6.unwrap().to_string())
                    .with_field("stateful", cfg.ipv6.dhcp_stateful),
                revert,
            )
            .await?;
        }

        let chassis_group = names::chassis_group(cfg.id);
        self.ensure(
            "HA_Chassis_Group",
            &chassis_group,
            TransactOp::upsert("HA_Chassis_Group", chassis_group.clone(), MayExist::CreateOrUpdate),
            revert,
        )
        .await?;

        Ok(())
    }

    /// SNAT is always deleted and recreated on update (spec.md §4.8 step 7).
    async fn apply_snat(
        &self,
        cfg: &NetworkConfig,
        _uplink: &UplinkInfo,
        v4: Option<Ipv4Addr>,
        v6: Option<Ipv6Addr>,
        revert: &mut RevertStack,
    ) -> CoreResult<()> {
        if cfg.ipv4.nat {
            if let Some(subnet) = cfg.ipv4.address_v4 {
                let external = cfg
                    .ipv4
                    .nat_address_v4
                    .map(|a| a.to_string())
                    .or_else(|| v4.map(|a| a.to_string()));
                if let Some(external) = external {
                    let name = format!("lxd-net{}-snat-v4", cfg.id);
                    self.ovn
                        .transact(vec![TransactOp::delete("NAT", name.clone())], WaitMode::None)
                        .await?;
                    self.ensure(
                        "NAT",
                        &name,
                        TransactOp::upsert("NAT", name.clone(), MayExist::CreateOrUpdate)
                            .with_field("type", "snat")
                            .with_field("logical_ip", subnet.to_string())
                            .with_field("external_ip", external),
                        revert,
                    )
                    .await?;
                }
            }
        }
        if cfg.ipv6.nat {
            if let Some(subnet) = cfg.ipv6.address_v6 {
                let external = cfg
                    .ipv6
                    .nat_address_v6
                    .map(|a| a.to_string())
                    .or_else(|| v6.map(|a| a.to_string()));
                if let Some(external) = external {
                    let name = format!("lxd-net{}-snat-v6", cfg.id);
                    self.ovn
                        .transact(vec![TransactOp::delete("NAT", name.clone())], WaitMode::None)
                        .await?;
                    self.ensure(
                        "NAT",
                        &name,
                        TransactOp::upsert("NAT", name.clone(), MayExist::CreateOrUpdate)
                            .with_field("type", "snat")
                            .with_field("logical_ip", subnet.to_string())
                            .with_field("external_ip", external),
                        revert,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Default routes toward the uplink gateway, with the internal subnet
    /// route suppressed under l3only (spec.md §4.8 step 8).
    async fn apply_routes(
        &self,
        cfg: &NetworkConfig,
        uplink: &UplinkInfo,
        v4: Option<Ipv4Addr>,
        v6: Option<Ipv6Addr>,
        revert: &mut RevertStack,
    ) -> CoreResult<()> {
        if v4.is_some() {
            if let Some(gw) = uplink.gateway_v4 {
                let name = format!("lxd-net{}-route-default-v4", cfg.id);
                self.ensure(
                    "Logical_Router_Static_Route",
                    &name,
                    TransactOp::upsert(
                        "Logical_Router_Static_Route",
                        name.clone(),
                        MayExist::CreateOrUpdate,
                    )
                    .with_field("ip_prefix", "0.0.0.0/0")
                    .with_field("nexthop", gw.to_string()),
                    revert,
                )
                .await?;
            }
            if !cfg.ipv4.l3only {
                if let Some(subnet) = cfg.ipv4.address_v4 {
                    let name = format!("lxd-net{}-route-internal-v4", cfg.id);
                    self.ensure(
                        "Logical_Router_Static_Route",
                        &name,
                        TransactOp::upsert(
                            "Logical_Router_Static_Route",
                            name.clone(),
                            MayExist::CreateOrUpdate,
                        )
                        .with_field("ip_prefix", subnet.to_string())
                        .with_field("nexthop", "discard"),
                        revert,
                    )
                    .await?;
                }
            }
        }
        if v6.is_some() {
            if let Some(gw) = uplink.gateway_v6 {
                let name = format!("lxd-net{}-route-default-v6", cfg.id);
                self.ensure(
                    "Logical_Router_Static_Route",
                    &name,
                    TransactOp::upsert(
                        "Logical_Router_Static_Route",
                        name.clone(),
                        MayExist::CreateOrUpdate,
                    )
                    .with_field("ip_prefix", "::/0")
                    .with_field("nexthop", gw.to_string()),
                    revert,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn ensure_address_set(&self, cfg: &NetworkConfig, revert: &mut RevertStack) -> CoreResult<()> {
        let mut addresses = Vec::new();
        if let Some(net) = cfg.ipv4.address_v4 {
            addresses.push(net.to_string());
        }
        if let Some(net) = cfg.ipv6.address_v6 {
            addresses.push(net.to_string());
        }
        let name = names::network_address_set(cfg.id);
        self.ensure(
            "Address_Set",
            &name,
            TransactOp::upsert("Address_Set", name.clone(), MayExist::CreateOrUpdate)
                .with_field("addresses", serde_json::json!(addresses)),
            revert,
        )
        .await
    }

    async fn ensure_port_group(&self, name: &str, revert: &mut RevertStack) -> CoreResult<()> {
        self.ensure(
            "Port_Group",
            name,
            TransactOp::upsert("Port_Group", name.to_string(), MayExist::CreateOrUpdate),
            revert,
        )
        .await
    }

    /// Start (per member): add the local chassis to the HA chassis group if
    /// this member carries the role, bring up the host-side uplink port.
    /// Actual bridge plumbing is `UplinkPortManager`'s job; this only
    /// records the router's membership in OVN.
    pub async fn start(&self, cfg: &NetworkConfig, local_has_chassis_role: bool) -> CoreResult<()> {
        if local_has_chassis_role {
            let chassis_group = names::chassis_group(cfg.id);
            self.ovn
                .transact(
                    vec![TransactOp::upsert(
                        "HA_Chassis_Group",
                        chassis_group,
                        MayExist::CreateOrUpdate,
                    )
                    .with_field("active", true)],
                    WaitMode::None,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn stop(&self, cfg: &NetworkConfig) -> CoreResult<()> {
        let chassis_group = names::chassis_group(cfg.id);
        self.ovn
            .transact(
                vec![TransactOp::upsert(
                    "HA_Chassis_Group",
                    chassis_group,
                    MayExist::CreateOrUpdate,
                )
                .with_field("active", false)],
                WaitMode::None,
            )
            .await
    }

    /// Delete: stop, then (authoritative member only) remove every OVN
    /// object this network owns.
    pub async fn delete(&self, cfg: &NetworkConfig, authoritative: bool) -> CoreResult<()> {
        self.stop(cfg).await?;
        if !authoritative {
            return Ok(());
        }

        let mut ops = vec![
            TransactOp::delete("Logical_Router", names::router(cfg.id)),
            TransactOp::delete("Logical_Switch", names::switch_ext(cfg.id)),
            TransactOp::delete("Logical_Switch", names::switch_int(cfg.id)),
            TransactOp::delete("Address_Set", names::network_address_set(cfg.id)),
            TransactOp::delete("Logical_Router_Port", names::router_port_ext(cfg.id)),
            TransactOp::delete("Logical_Router_Port", names::router_port_int(cfg.id)),
            TransactOp::delete(
                "Logical_Switch_Port",
                names::switch_ext_port_router(cfg.id),
            ),
            TransactOp::delete(
                "Logical_Switch_Port",
                names::switch_ext_port_provider(cfg.id),
            ),
            TransactOp::delete(
                "Logical_Switch_Port",
                names::switch_int_port_router(cfg.id),
            ),
            TransactOp::delete("HA_Chassis_Group", names::chassis_group(cfg.id)),
        ];

        for fwd in self.db.list_forwards(cfg.id).await? {
            ops.push(TransactOp::delete(
                "Load_Balancer",
                names::load_balancer(cfg.id, &fwd.listen_address),
            ));
        }
        for lb in self.db.list_load_balancers(cfg.id).await? {
            ops.push(TransactOp::delete(
                "Load_Balancer",
                names::load_balancer(cfg.id, &lb.listen_address),
            ));
        }

        self.ovn.transact(ops, WaitMode::None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxdovn_types::{ClusterMember, ForwardRow, IngressMode, LoadBalancerRow, NetworkRow, PeerRow};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::ovn::InMemoryOvnClient;

    struct FakeDb {
        networks: parking_lot::Mutex<Vec<NetworkRow>>,
    }

    #[async_trait::async_trait]
    impl ClusterDb for FakeDb {
        async fn get_network(&self, project: &str, name: &str) -> CoreResult<Option<NetworkRow>> {
            Ok(self
                .networks
                .lock()
                .iter()
                .find(|n| n.project == project && n.name == name)
                .cloned())
        }
        async fn list_networks(&self) -> CoreResult<Vec<NetworkRow>> {
            Ok(self.networks.lock().clone())
        }
        async fn list_networks_on_uplink(&self, uplink: &str) -> CoreResult<Vec<NetworkRow>> {
            Ok(self
                .networks
                .lock()
                .iter()
                .filter(|n| n.options.get("network").map(|s| s.as_str()) == Some(uplink))
                .cloned()
                .collect())
        }
        async fn upsert_network(&self, row: NetworkRow) -> CoreResult<()> {
            let mut nets = self.networks.lock();
            nets.retain(|n| n.id != row.id);
            nets.push(row);
            Ok(())
        }
        async fn delete_network(&self, _project: &str, _name: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn get_project(&self, _name: &str) -> CoreResult<Option<Project>> {
            Ok(None)
        }
        async fn list_forwards(&self, _network_id: NetworkId) -> CoreResult<Vec<ForwardRow>> {
            Ok(vec![])
        }
        async fn upsert_forward(&self, _row: ForwardRow) -> CoreResult<()> {
            Ok(())
        }
        async fn delete_forward(&self, _network_id: NetworkId, _listen_address: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn list_load_balancers(&self, _network_id: NetworkId) -> CoreResult<Vec<LoadBalancerRow>> {
            Ok(vec![])
        }
        async fn upsert_load_balancer(&self, _row: LoadBalancerRow) -> CoreResult<()> {
            Ok(())
        }
        async fn delete_load_balancer(&self, _network_id: NetworkId, _listen_address: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn list_peers(&self, _network_id: NetworkId) -> CoreResult<Vec<PeerRow>> {
            Ok(vec![])
        }
        async fn upsert_peer(&self, _row: PeerRow) -> CoreResult<()> {
            Ok(())
        }
        async fn delete_peer(&self, _network_id: NetworkId, _name: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn list_members(&self) -> CoreResult<Vec<ClusterMember>> {
            Ok(vec![])
        }
    }

    fn uplink() -> UplinkInfo {
        UplinkInfo {
            name: "uplink1".into(),
            mtu: 1500,
            cidr_v4: Some("10.1.0.0/16".parse().unwrap()),
            cidr_v6: None,
            ovn_ranges_v4: vec![("10.1.0.10".parse().unwrap(), "10.1.0.20".parse().unwrap())],
            ovn_ranges_v6: None,
            routes_v4: vec!["10.1.0.0/16".parse().unwrap()],
            routes_v6: vec![],
            gateway_v4: Some("10.1.0.1".parse().unwrap()),
            gateway_v6: None,
            ingress_mode: IngressMode::L2Proxy,
        }
    }

    fn network_config() -> NetworkConfig {
        let opts: BTreeMap<String, String> = [
            ("network", "uplink1"),
            ("ipv4.address", "10.0.0.1/24"),
            ("ipv4.nat", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        NetworkConfig::parse(NetworkId(7), "p1", "n1", &opts, &["uplink1".to_string()]).unwrap()
    }

    fn projection() -> NetworkProjection {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let db = Arc::new(FakeDb {
            networks: parking_lot::Mutex::new(vec![]),
        });
        NetworkProjection::new(ovn, db, "fp:test-fingerprint".to_string())
    }

    #[tokio::test]
    async fn create_allocates_uplink_v4_and_builds_router() {
        let p = projection();
        let cfg = network_config();
        let project = Project {
            name: "p1".into(),
            ..Default::default()
        };
        p.create(&cfg, &project, &uplink()).await.unwrap();

        let router = p.ovn.get("Logical_Router", &names::router(cfg.id)).await.unwrap();
        assert!(router.is_some());

        let snat = p
            .ovn
            .get("NAT", &format!("lxd-net{}-snat-v4", cfg.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            snat.fields.get("external_ip").unwrap().as_str().unwrap(),
            "10.1.0.10"
        );
    }

    #[tokio::test]
    async fn setup_is_idempotent_on_second_run() {
        let p = projection();
        let cfg = network_config();
        let project = Project::default();
        p.create(&cfg, &project, &uplink()).await.unwrap();
        let before = p.ovn.list("Logical_Router").await.unwrap();

        p.setup(&cfg, &project, &uplink(), true).await.unwrap();
        let after = p.ovn.list("Logical_Router").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn router_mac_is_stable_across_calls() {
        let p = projection();
        let cfg = network_config();
        let project = Project::default();
        p.create(&cfg, &project, &uplink()).await.unwrap();
        let router1 = p
            .ovn
            .get("Logical_Router", &names::router(cfg.id))
            .await
            .unwrap()
            .unwrap();
        let mac1 = router1.fields.get("mac").unwrap().clone();

        let p2 = NetworkProjection::new(
            Arc::new(InMemoryOvnClient::new()),
            Arc::new(FakeDb {
                networks: parking_lot::Mutex::new(vec![]),
            }),
            "fp:test-fingerprint".to_string(),
        );
        p2.create(&cfg, &project, &uplink()).await.unwrap();
        let router2 = p2
            .ovn
            .get("Logical_Router", &names::router(cfg.id))
            .await
            .unwrap()
            .unwrap();
        let mac2 = router2.fields.get("mac").unwrap().clone();

        assert_eq!(mac1, mac2);
    }
}
