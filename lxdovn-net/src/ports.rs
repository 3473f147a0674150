//! Per-NIC logical port lifecycle — spec.md §4.9 InstancePortManager.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use lxdovn_types::{ClusterDb, CoreError, CoreResult, NetworkConfig, NicKey, PeerState};

use crate::names;
use crate::ovn::{MayExist, OvnClient, TransactOp, WaitMode};

/// The subset of a NIC's device config relevant to port setup. Static
/// addresses are host addresses, not subnets — the internal subnet's
/// prefix length is read off `NetworkConfig`.
#[derive(Debug, Clone, Default)]
pub struct NicConfig {
    pub static_mac: Option<String>,
    pub static_v4: Option<Ipv4Addr>,
    pub static_v6: Option<Ipv6Addr>,
    pub internal_routes: Vec<Ipv4Net>,
    pub internal_routes_v6: Vec<Ipv6Net>,
    pub external_routes: Vec<Ipv4Net>,
    pub external_routes_v6: Vec<Ipv6Net>,
    pub acls: Vec<String>,
    pub parent: Option<(String, u16)>,
}

pub struct InstancePortManager {
    ovn: Arc<dyn OvnClient>,
    db: Arc<dyn ClusterDb>,
    local_member: String,
}

impl InstancePortManager {
    pub fn new(ovn: Arc<dyn OvnClient>, db: Arc<dyn ClusterDb>, local_member: String) -> Self {
        Self { ovn, db, local_member }
    }

    fn dns_record_name(port_name: &str) -> String {
        format!("{port_name}-dns")
    }

    /// Registers `<dnsName>.<domain> -> [v4?, v6?]` as an OVN `DNS` row.
    /// Fails if the family DHCP requires produced no address.
    async fn register_dns(
        &self,
        cfg: &NetworkConfig,
        port_name: &str,
        dns_name: &str,
        v4: Option<Ipv4Addr>,
        v6: Option<Ipv6Addr>,
    ) -> CoreResult<()> {
        let fqdn = format!("{dns_name}.{}", cfg.dns_domain);
        let mut records = Vec::new();
        if let Some(v4) = v4 {
            records.push(v4.to_string());
        }
        if let Some(v6) = v6 {
            records.push(v6.to_string());
        }
        self.ovn
            .transact(
                vec![TransactOp::upsert(
                    "DNS",
                    Self::dns_record_name(port_name),
                    MayExist::CreateOrUpdate,
                )
                .with_field("records", serde_json::json!({ fqdn: records }))],
                WaitMode::None,
            )
            .await
    }

    /// Pre-registers a NIC before it starts: reserves its static v4 in the
    /// switch's DHCPv4 reservation list, without duplicates.
    pub async fn add(&self, cfg: &NetworkConfig, nic: &NicConfig) -> CoreResult<()> {
        if let Some(v4) = nic.static_v4 {
            self.reserve_dhcpv4(cfg, v4).await?;
        }
        Ok(())
    }

    async fn reserve_dhcpv4(&self, cfg: &NetworkConfig, addr: Ipv4Addr) -> CoreResult<()> {
        let dhcpv4 = names::dhcpv4_options(cfg.id);
        let mut reservations = self.current_reservations(&dhcpv4).await?;
        let addr_str = addr.to_string();
        if !reservations.contains(&addr_str) {
            reservations.push(addr_str);
            self.ovn
                .transact(
                    vec![TransactOp::upsert(
                        "DHCP_Options",
                        dhcpv4,
                        MayExist::CreateOrUpdate,
                    )
                    .with_field("reservations", serde_json::json!(reservations))],
                    WaitMode::None,
                )
                .await?;
        }
        Ok(())
    }

    async fn current_reservations(&self, dhcp_options_name: &str) -> CoreResult<Vec<String>> {
        Ok(self
            .ovn
            .get("DHCP_Options", dhcp_options_name)
            .await?
            .and_then(|row| row.fields.get("reservations").cloned())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    async fn release_dhcpv4(&self, cfg: &NetworkConfig, addr: Ipv4Addr) -> CoreResult<()> {
        let dhcpv4 = names::dhcpv4_options(cfg.id);
        let mut reservations = self.current_reservations(&dhcpv4).await?;
        let addr_str = addr.to_string();
        if reservations.iter().any(|r| r == &addr_str) {
            reservations.retain(|r| r != &addr_str);
            self.ovn
                .transact(
                    vec![TransactOp::upsert(
                        "DHCP_Options",
                        dhcpv4,
                        MayExist::CreateOrUpdate,
                    )
                    .with_field("reservations", serde_json::json!(reservations))],
                    WaitMode::None,
                )
                .await?;
        }
        Ok(())
    }

    /// The heavy path: creates/updates the switch port, registers DNS, and
    /// applies route/NAT/ACL membership. Returns the logical switch port's
    /// name.
    pub async fn start(
        &self,
        cfg: &NetworkConfig,
        nic_key: &NicKey,
        nic: &NicConfig,
        acls_to_remove: &[String],
    ) -> CoreResult<String> {
        let port_name = names::instance_port(cfg.id, nic_key);
        let mac = nic
            .static_mac
            .clone()
            .unwrap_or_else(|| lxdovn_crypto::router_mac(&format!("{port_name}.nic")));

        let mut static_v6 = nic.static_v6;
        if nic.static_v4.is_some() && static_v6.is_none() && cfg.ipv6.dhcp {
            if let Some(prefix) = cfg.ipv6.address_v6 {
                static_v6 = crate::projection::eui64_address(&mac, prefix);
            }
        }

        let mut fields: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        fields.insert("mac".into(), serde_json::json!(mac));
        fields.insert("location".into(), serde_json::json!(self.local_member));
        if cfg.ipv4.address_v4.is_some() {
            fields.insert(
                "dhcpv4_options".into(),
                serde_json::json!(names::dhcpv4_options(cfg.id)),
            );
        }
        if cfg.ipv6.address_v6.is_some() {
            fields.insert(
                "dhcpv6_options".into(),
                serde_json::json!(names::dhcpv6_options(cfg.id)),
            );
        }
        if let Some((parent, vlan)) = &nic.parent {
            fields.insert("parent_name".into(), serde_json::json!(parent));
            fields.insert("tag".into(), serde_json::json!(vlan));
        }
        let mut static_addrs = Vec::new();
        if let Some(v4) = nic.static_v4 {
            static_addrs.push(v4.to_string());
        }
        if let Some(v6) = static_v6 {
            static_addrs.push(v6.to_string());
        }
        if !static_addrs.is_empty() {
            fields.insert("addresses".into(), serde_json::json!(static_addrs));
        }

        let mut op = TransactOp::upsert("Logical_Switch_Port", port_name.clone(), MayExist::CreateOrUpdate);
        for (k, v) in fields {
            op = op.with_field(k, v);
        }
        self.ovn.transact(vec![op], WaitMode::None).await?;

        let dns_v4 = match nic.static_v4 {
            Some(v4) => Some(v4),
            None if cfg.ipv4.dhcp => self.poll_dynamic_v4(&port_name).await,
            None => None,
        };
        let dns_v6 = match static_v6 {
            Some(v6) => Some(v6),
            None if cfg.ipv6.dhcp => self.poll_dynamic_v6(&port_name).await,
            None => None,
        };

        if cfg.ipv4.address_v4.is_some() && cfg.ipv4.dhcp && dns_v4.is_none() {
            return Err(CoreError::conflict(
                "dynamic IPv4 allocation did not produce an address in time",
            ));
        }
        if cfg.ipv6.address_v6.is_some() && cfg.ipv6.dhcp && dns_v6.is_none() {
            return Err(CoreError::conflict(
                "dynamic IPv6 allocation did not produce an address in time",
            ));
        }

        if let Some(v4) = nic.static_v4 {
            self.reserve_dhcpv4(cfg, v4).await?;
        }

        self.register_dns(cfg, &port_name, &nic_key.device_name, dns_v4, dns_v6)
            .await?;

        let publish_via_l2proxy =
            matches!(cfg.uplink_ingress_mode, lxdovn_types::IngressMode::L2Proxy);
        if publish_via_l2proxy {
            if !cfg.ipv4.nat {
                if let Some(v4) = dns_v4 {
                    self.install_dnat_and_snat(cfg, IpAddr::V4(v4)).await?;
                }
            }
            if !cfg.ipv6.nat {
                if let Some(v6) = dns_v6 {
                    self.install_dnat_and_snat(cfg, IpAddr::V6(v6)).await?;
                }
            }
        }

        self.apply_routes(cfg, &port_name, dns_v4, dns_v6, nic).await?;
        self.apply_acl_membership(cfg, &port_name, &nic.acls, acls_to_remove)
            .await?;
        self.apply_default_acl_rule(cfg, &port_name, nic).await?;

        Ok(port_name)
    }

    async fn poll_dynamic_v4(&self, port_name: &str) -> Option<Ipv4Addr> {
        for _ in 0..5 {
            if let Ok(Some(row)) = self.ovn.get("Logical_Switch_Port", port_name).await {
                if let Some(addrs) = row.fields.get("dynamic_addresses").and_then(|v| v.as_str()) {
                    if let Some(first) = addrs.split_whitespace().next() {
                        if let Ok(v4) = first.parse() {
                            return Some(v4);
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }

    async fn poll_dynamic_v6(&self, port_name: &str) -> Option<Ipv6Addr> {
        for _ in 0..5 {
            if let Ok(Some(row)) = self.ovn.get("Logical_Switch_Port", port_name).await {
                if let Some(addr) = row.fields.get("dynamic_address_v6").and_then(|v| v.as_str()) {
                    if let Ok(v6) = addr.parse() {
                        return Some(v6);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }

    async fn install_dnat_and_snat(&self, cfg: &NetworkConfig, ip: IpAddr) -> CoreResult<()> {
        let name = format!("lxd-net{}-dnat-snat-{ip}", cfg.id);
        self.ovn
            .transact(
                vec![TransactOp::upsert("NAT", name, MayExist::CreateOrUpdate)
                    .with_field("type", "dnat_and_snat")
                    .with_field("logical_ip", ip.to_string())
                    .with_field("external_ip", ip.to_string())],
                WaitMode::None,
            )
            .await
    }

    async fn apply_routes(
        &self,
        cfg: &NetworkConfig,
        port_name: &str,
        dns_v4: Option<Ipv4Addr>,
        dns_v6: Option<Ipv6Addr>,
        nic: &NicConfig,
    ) -> CoreResult<()> {
        let mut address_set_adds = Vec::new();
        let mut ops = Vec::new();
        let mut mirror_entries: Vec<(String, String, bool)> = Vec::new();

        if cfg.ipv4.l3only {
            if let Some(v4) = dns_v4 {
                let prefix = format!("{v4}/32");
                ops.push(route_op(cfg, &prefix, &v4.to_string(), port_name, "l3only-v4"));
                address_set_adds.push(prefix);
            }
        }
        if cfg.ipv6.l3only {
            if let Some(v6) = dns_v6 {
                let prefix = format!("{v6}/128");
                ops.push(route_op(cfg, &prefix, &v6.to_string(), port_name, "l3only-v6"));
                address_set_adds.push(prefix);
            }
        }

        for (i, route) in nic.internal_routes.iter().enumerate() {
            let suffix = format!("internal-v4-{i}");
            if let Some(v4) = dns_v4 {
                ops.push(route_op(cfg, &route.to_string(), &v4.to_string(), port_name, &suffix));
            }
            address_set_adds.push(route.to_string());
            mirror_entries.push((route.to_string(), suffix, false));
        }
        for (i, route) in nic.internal_routes_v6.iter().enumerate() {
            let suffix = format!("internal-v6-{i}");
            if let Some(v6) = dns_v6 {
                ops.push(route_op(cfg, &route.to_string(), &v6.to_string(), port_name, &suffix));
            }
            address_set_adds.push(route.to_string());
            mirror_entries.push((route.to_string(), suffix, true));
        }
        for (i, route) in nic.external_routes.iter().enumerate() {
            let suffix = format!("external-v4-{i}");
            if let Some(v4) = dns_v4 {
                ops.push(route_op(cfg, &route.to_string(), &v4.to_string(), port_name, &suffix));
                if matches!(cfg.uplink_ingress_mode, lxdovn_types::IngressMode::L2Proxy) {
                    for host in route.hosts() {
                        self.install_dnat_and_snat(cfg, IpAddr::V4(host)).await?;
                    }
                }
            }
            address_set_adds.push(route.to_string());
            mirror_entries.push((route.to_string(), suffix, false));
        }
        for (i, route) in nic.external_routes_v6.iter().enumerate() {
            let suffix = format!("external-v6-{i}");
            if let Some(v6) = dns_v6 {
                ops.push(route_op(cfg, &route.to_string(), &v6.to_string(), port_name, &suffix));
            }
            address_set_adds.push(route.to_string());
            mirror_entries.push((route.to_string(), suffix, true));
        }

        if !ops.is_empty() {
            self.ovn.transact(ops, WaitMode::None).await?;
        }
        if !address_set_adds.is_empty() {
            self.extend_address_set(cfg, &address_set_adds).await?;
        }
        if !mirror_entries.is_empty() {
            self.mirror_routes_to_peers(cfg, port_name, &mirror_entries, false)
                .await?;
        }
        Ok(())
    }

    /// Mirrors each `(prefix, suffix, is_v6)` route onto every peer whose
    /// `PeerRow` is `created`, next-hop this network's own internal router
    /// address (the address `NetworkProjection` assigns the internal
    /// `Logical_Router_Port`, i.e. the host part of `ipv4.address`/
    /// `ipv6.address`) — distinct from `PeeringManager`'s own peer routes,
    /// which carry the *peer's* external address as next-hop. `remove`
    /// issues deletes instead of upserts, so `stop` can call this with the
    /// same entries it computed for `start`.
    async fn mirror_routes_to_peers(
        &self,
        cfg: &NetworkConfig,
        port_name: &str,
        entries: &[(String, String, bool)],
        remove: bool,
    ) -> CoreResult<()> {
        let our_v4 = cfg.ipv4.address_v4.map(|net| net.addr().to_string());
        let our_v6 = cfg.ipv6.address_v6.map(|net| net.addr().to_string());

        let peers = self.db.list_peers(cfg.id).await?;
        let mut ops = Vec::new();
        for peer in peers.iter().filter(|p| p.state == PeerState::Created) {
            let Some(peer_id) = peer.target_network_id else {
                continue;
            };
            let peer_router = names::router(peer_id);
            for (prefix, suffix, is_v6) in entries {
                let name = format!("{peer_router}-{port_name}-{suffix}");
                if remove {
                    ops.push(TransactOp::delete("Logical_Router_Static_Route", name));
                    continue;
                }
                let nexthop = if *is_v6 { &our_v6 } else { &our_v4 };
                let Some(nexthop) = nexthop else {
                    continue;
                };
                ops.push(
                    TransactOp::upsert("Logical_Router_Static_Route", name, MayExist::CreateOrUpdate)
                        .with_field("ip_prefix", prefix.clone())
                        .with_field("nexthop", nexthop.clone()),
                );
            }
        }
        if !ops.is_empty() {
            self.ovn.transact(ops, WaitMode::None).await?;
        }
        Ok(())
    }

    async fn extend_address_set(&self, cfg: &NetworkConfig, additions: &[String]) -> CoreResult<()> {
        let name = names::network_address_set(cfg.id);
        let mut current: Vec<String> = self
            .ovn
            .get("Address_Set", &name)
            .await?
            .and_then(|row| row.fields.get("addresses").cloned())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let before: HashSet<String> = current.iter().cloned().collect();
        for addr in additions {
            if !before.contains(addr) {
                current.push(addr.clone());
            }
        }
        self.ovn
            .transact(
                vec![TransactOp::upsert("Address_Set", name, MayExist::CreateOrUpdate)
                    .with_field("addresses", serde_json::json!(current))],
                WaitMode::None,
            )
            .await
    }

    async fn subtract_address_set(&self, cfg: &NetworkConfig, removals: &[String]) -> CoreResult<()> {
        let name = names::network_address_set(cfg.id);
        let removals: HashSet<&String> = removals.iter().collect();
        let current: Vec<String> = self
            .ovn
            .get("Address_Set", &name)
            .await?
            .and_then(|row| row.fields.get("addresses").cloned())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let remaining: Vec<String> = current.into_iter().filter(|a| !removals.contains(a)).collect();
        self.ovn
            .transact(
                vec![TransactOp::upsert("Address_Set", name, MayExist::CreateOrUpdate)
                    .with_field("addresses", serde_json::json!(remaining))],
                WaitMode::None,
            )
            .await
    }

    /// Adds the port to the network port group (always) and every ACL's
    /// port group in `acls`; removes it from every ACL in `acls_to_remove`
    /// that is no longer part of `acls`.
    async fn apply_acl_membership(
        &self,
        cfg: &NetworkConfig,
        port_name: &str,
        acls: &[String],
        acls_to_remove: &[String],
    ) -> CoreResult<()> {
        let union: HashSet<&String> = cfg.acls.iter().chain(acls.iter()).collect();
        let mut ops = vec![self.port_group_membership_op(&names::network_port_group(cfg.id), port_name, true)];
        for acl in &union {
            ops.push(self.port_group_membership_op(&names::acl_port_group(acl), port_name, true));
        }
        for acl in acls_to_remove {
            if !union.contains(acl) {
                ops.push(self.port_group_membership_op(&names::acl_port_group(acl), port_name, false));
            }
        }
        self.ovn.transact(ops, WaitMode::None).await
    }

    fn port_group_membership_op(&self, port_group: &str, port_name: &str, add: bool) -> TransactOp {
        if add {
            TransactOp::upsert(
                "Port_Group",
                port_group.to_string(),
                MayExist::CreateOrUpdate,
            )
            .with_field("add_port", port_name.to_string())
        } else {
            TransactOp::upsert(
                "Port_Group",
                port_group.to_string(),
                MayExist::CreateOrUpdate,
            )
            .with_field("remove_port", port_name.to_string())
        }
    }

    async fn apply_default_acl_rule(
        &self,
        cfg: &NetworkConfig,
        port_name: &str,
        nic: &NicConfig,
    ) -> CoreResult<()> {
        let name = format!("{port_name}-default-acl");
        if nic.acls.is_empty() && cfg.acls.is_empty() {
            self.ovn
                .transact(vec![TransactOp::delete("ACL", name)], WaitMode::None)
                .await?;
            return Ok(());
        }
        let (action, logged) = (&cfg.acl_defaults.ingress_action, cfg.acl_defaults.ingress_logged);
        self.ovn
            .transact(
                vec![TransactOp::upsert("ACL", name, MayExist::CreateOrUpdate)
                    .with_field("action", action.clone())
                    .with_field("log", logged)
                    .with_field("match", format!("outport == {port_name:?}"))],
                WaitMode::None,
            )
            .await
    }

    /// Stops a NIC port. No-op if the port is currently active on a
    /// different cluster member (live migration in progress). Mirrors every
    /// addition `start`/`apply_routes` made: router static routes, DNAT/SNAT
    /// entries, address-set membership, and peer-router route mirrors.
    pub async fn stop(&self, cfg: &NetworkConfig, nic_key: &NicKey, nic: &NicConfig) -> CoreResult<()> {
        let port_name = names::instance_port(cfg.id, nic_key);
        let Some(row) = self.ovn.get("Logical_Switch_Port", &port_name).await? else {
            return Ok(());
        };
        if let Some(location) = row.fields.get("location").and_then(|v| v.as_str()) {
            if location != self.local_member {
                return Ok(());
            }
        }

        let (dns_v4, dns_v6) = self.resolved_addresses(cfg, nic, &row);

        let union: HashSet<&String> = cfg.acls.iter().chain(nic.acls.iter()).collect();
        let mut ops = vec![
            self.port_group_membership_op(&names::network_port_group(cfg.id), &port_name, false),
        ];
        for acl in union {
            ops.push(self.port_group_membership_op(&names::acl_port_group(acl), &port_name, false));
        }
        ops.push(TransactOp::delete("Logical_Switch_Port", port_name.clone()));
        ops.push(TransactOp::delete("ACL", format!("{port_name}-default-acl")));
        ops.push(TransactOp::delete("DNS", Self::dns_record_name(&port_name)));

        let mut address_set_removals = Vec::new();
        let mut mirror_entries: Vec<(String, String, bool)> = Vec::new();

        if cfg.ipv4.l3only {
            if let Some(v4) = dns_v4 {
                ops.push(TransactOp::delete(
                    "Logical_Router_Static_Route",
                    route_name(cfg, &port_name, "l3only-v4"),
                ));
                address_set_removals.push(format!("{v4}/32"));
            }
        }
        if cfg.ipv6.l3only {
            if let Some(v6) = dns_v6 {
                ops.push(TransactOp::delete(
                    "Logical_Router_Static_Route",
                    route_name(cfg, &port_name, "l3only-v6"),
                ));
                address_set_removals.push(format!("{v6}/128"));
            }
        }

        for (i, route) in nic.internal_routes.iter().enumerate() {
            let suffix = format!("internal-v4-{i}");
            ops.push(TransactOp::delete(
                "Logical_Router_Static_Route",
                route_name(cfg, &port_name, &suffix),
            ));
            address_set_removals.push(route.to_string());
            mirror_entries.push((route.to_string(), suffix, false));
        }
        for (i, route) in nic.internal_routes_v6.iter().enumerate() {
            let suffix = format!("internal-v6-{i}");
            ops.push(TransactOp::delete(
                "Logical_Router_Static_Route",
                route_name(cfg, &port_name, &suffix),
            ));
            address_set_removals.push(route.to_string());
            mirror_entries.push((route.to_string(), suffix, true));
        }
        let l2proxy = matches!(cfg.uplink_ingress_mode, lxdovn_types::IngressMode::L2Proxy);
        for (i, route) in nic.external_routes.iter().enumerate() {
            let suffix = format!("external-v4-{i}");
            ops.push(TransactOp::delete(
                "Logical_Router_Static_Route",
                route_name(cfg, &port_name, &suffix),
            ));
            address_set_removals.push(route.to_string());
            mirror_entries.push((route.to_string(), suffix, false));
            if l2proxy {
                for host in route.hosts() {
                    ops.push(TransactOp::delete(
                        "NAT",
                        format!("lxd-net{}-dnat-snat-{host}", cfg.id),
                    ));
                }
            }
        }
        for (i, route) in nic.external_routes_v6.iter().enumerate() {
            let suffix = format!("external-v6-{i}");
            ops.push(TransactOp::delete(
                "Logical_Router_Static_Route",
                route_name(cfg, &port_name, &suffix),
            ));
            address_set_removals.push(route.to_string());
            mirror_entries.push((route.to_string(), suffix, true));
        }

        if l2proxy {
            if !cfg.ipv4.nat {
                if let Some(v4) = dns_v4 {
                    ops.push(TransactOp::delete(
                        "NAT",
                        format!("lxd-net{}-dnat-snat-{v4}", cfg.id),
                    ));
                }
            }
            if !cfg.ipv6.nat {
                if let Some(v6) = dns_v6 {
                    ops.push(TransactOp::delete(
                        "NAT",
                        format!("lxd-net{}-dnat-snat-{v6}", cfg.id),
                    ));
                }
            }
        }

        self.ovn.transact(ops, WaitMode::None).await?;

        if !address_set_removals.is_empty() {
            self.subtract_address_set(cfg, &address_set_removals).await?;
        }
        if !mirror_entries.is_empty() {
            self.mirror_routes_to_peers(cfg, &port_name, &mirror_entries, true)
                .await?;
        }

        if let Some(v4) = nic.static_v4 {
            self.release_dhcpv4(cfg, v4).await?;
        }

        Ok(())
    }

    /// Recovers the addresses `start` resolved for this port without
    /// polling: static addresses come straight off `nic`, dynamic ones off
    /// the fields OVN already populated on the existing row, and an
    /// EUI-64 v6 is re-derived from the row's own MAC the same way `start`
    /// derives it.
    fn resolved_addresses(
        &self,
        cfg: &NetworkConfig,
        nic: &NicConfig,
        row: &crate::ovn::LogicalObject,
    ) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
        let dns_v4 = nic.static_v4.or_else(|| {
            row.fields
                .get("dynamic_addresses")
                .and_then(|v| v.as_str())
                .and_then(|s| s.split_whitespace().next())
                .and_then(|s| s.parse().ok())
        });

        let static_v6 = nic.static_v6.or_else(|| {
            if nic.static_v4.is_some() && cfg.ipv6.dhcp {
                let mac = row.fields.get("mac").and_then(|v| v.as_str())?;
                let prefix = cfg.ipv6.address_v6?;
                crate::projection::eui64_address(mac, prefix)
            } else {
                None
            }
        });
        let dns_v6 = static_v6.or_else(|| {
            row.fields
                .get("dynamic_address_v6")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
        });

        (dns_v4, dns_v6)
    }
}

fn route_name(cfg: &NetworkConfig, port_name: &str, suffix: &str) -> String {
    format!("lxd-net{}-route-{port_name}-{suffix}", cfg.id)
}

fn route_op(cfg: &NetworkConfig, prefix: &str, nexthop: &str, port_name: &str, suffix: &str) -> TransactOp {
    TransactOp::upsert(
        "Logical_Router_Static_Route",
        route_name(cfg, port_name, suffix),
        MayExist::CreateOrUpdate,
    )
    .with_field("ip_prefix", prefix.to_string())
    .with_field("nexthop", nexthop.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::InMemoryOvnClient;
    use lxdovn_types::InMemoryClusterDb;
    use std::collections::BTreeMap as Map;
    use uuid::Uuid;

    fn manager(ovn: Arc<InMemoryOvnClient>, local_member: &str) -> InstancePortManager {
        InstancePortManager::new(ovn, Arc::new(InMemoryClusterDb::new()), local_member.to_string())
    }

    fn cfg() -> NetworkConfig {
        NetworkConfig::parse(
            lxdovn_types::NetworkId(7),
            "p1",
            "n1",
            &Map::from([
                ("network".to_string(), "uplink1".to_string()),
                ("ipv4.address".to_string(), "10.0.0.1/24".to_string()),
            ]),
            &["uplink1".to_string()],
        )
        .unwrap()
    }

    fn nic_key() -> NicKey {
        NicKey {
            instance_uuid: Uuid::nil(),
            device_name: "eth0".into(),
        }
    }

    #[tokio::test]
    async fn add_reserves_static_v4_without_duplicates() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let mgr = manager(ovn.clone(), "m1");
        let cfg = cfg();
        let nic = NicConfig {
            static_v4: Some("10.0.0.50".parse().unwrap()),
            ..Default::default()
        };
        mgr.add(&cfg, &nic).await.unwrap();
        mgr.add(&cfg, &nic).await.unwrap();

        let reservations = mgr.current_reservations(&names::dhcpv4_options(cfg.id)).await.unwrap();
        assert_eq!(reservations, vec!["10.0.0.50".to_string()]);
    }

    #[tokio::test]
    async fn start_places_port_in_network_and_acl_groups() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let mgr = manager(ovn.clone(), "m1");
        let cfg = cfg();
        let nic = NicConfig {
            static_v4: Some("10.0.0.50".parse().unwrap()),
            acls: vec!["web".into()],
            ..Default::default()
        };
        let port_name = mgr.start(&cfg, &nic_key(), &nic, &[]).await.unwrap();

        let pg = ovn
            .get("Port_Group", &names::network_port_group(cfg.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            pg.fields.get("add_port").unwrap().as_str().unwrap(),
            port_name
        );
        let acl_pg = ovn
            .get("Port_Group", &names::acl_port_group("web"))
            .await
            .unwrap();
        assert!(acl_pg.is_some());
    }

    #[tokio::test]
    async fn stop_is_noop_when_port_lives_on_another_member() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let mgr = manager(ovn.clone(), "m1");
        let cfg = cfg();
        let nic = NicConfig {
            static_v4: Some("10.0.0.50".parse().unwrap()),
            ..Default::default()
        };
        let port_name = mgr.start(&cfg, &nic_key(), &nic, &[]).await.unwrap();
        ovn.transact(
            vec![TransactOp::upsert(
                "Logical_Switch_Port",
                port_name.clone(),
                MayExist::CreateOrUpdate,
            )
            .with_field("location", "other-member")],
            WaitMode::None,
        )
        .await
        .unwrap();

        mgr.stop(&cfg, &nic_key(), &nic).await.unwrap();
        assert!(ovn.get("Logical_Switch_Port", &port_name).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stop_tears_down_routes_and_address_set() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let mgr = manager(ovn.clone(), "m1");
        let cfg = cfg();
        let nic = NicConfig {
            static_v4: Some("10.0.0.50".parse().unwrap()),
            internal_routes: vec!["10.1.0.0/24".parse().unwrap()],
            ..Default::default()
        };
        mgr.start(&cfg, &nic_key(), &nic, &[]).await.unwrap();

        let port_name = names::instance_port(cfg.id, &nic_key());
        let route = route_name(&cfg, &port_name, "internal-v4-0");
        assert!(ovn.get("Logical_Router_Static_Route", &route).await.unwrap().is_some());

        let addrset = ovn
            .get("Address_Set", &names::network_address_set(cfg.id))
            .await
            .unwrap()
            .unwrap();
        let addrs: Vec<String> =
            serde_json::from_value(addrset.fields.get("addresses").unwrap().clone()).unwrap();
        assert!(addrs.contains(&"10.1.0.0/24".to_string()));

        mgr.stop(&cfg, &nic_key(), &nic).await.unwrap();

        assert!(ovn.get("Logical_Router_Static_Route", &route).await.unwrap().is_none());
        let addrset = ovn
            .get("Address_Set", &names::network_address_set(cfg.id))
            .await
            .unwrap()
            .unwrap();
        let addrs: Vec<String> =
            serde_json::from_value(addrset.fields.get("addresses").unwrap().clone()).unwrap();
        assert!(!addrs.contains(&"10.1.0.0/24".to_string()));
    }

    #[tokio::test]
    async fn start_and_stop_mirror_routes_to_created_peer_router() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let db = Arc::new(InMemoryClusterDb::new());
        let mgr = InstancePortManager::new(ovn.clone(), db.clone(), "m1".into());
        let cfg = cfg();
        let peer_id = lxdovn_types::NetworkId(9);
        db.upsert_peer(lxdovn_types::PeerRow {
            network_id: cfg.id,
            name: "p9".into(),
            target_project: "p1".into(),
            target_network: "n2".into(),
            target_network_id: Some(peer_id),
            state: lxdovn_types::PeerState::Created,
        })
        .await
        .unwrap();

        let nic = NicConfig {
            static_v4: Some("10.0.0.50".parse().unwrap()),
            internal_routes: vec!["10.1.0.0/24".parse().unwrap()],
            ..Default::default()
        };
        let port_name = mgr.start(&cfg, &nic_key(), &nic, &[]).await.unwrap();

        let mirrored_name = format!("{}-{port_name}-internal-v4-0", names::router(peer_id));
        let mirrored = ovn
            .get("Logical_Router_Static_Route", &mirrored_name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            mirrored.fields.get("nexthop").unwrap().as_str().unwrap(),
            "10.0.0.1"
        );

        mgr.stop(&cfg, &nic_key(), &nic).await.unwrap();
        assert!(ovn
            .get("Logical_Router_Static_Route", &mirrored_name)
            .await
            .unwrap()
            .is_none());
    }
}
