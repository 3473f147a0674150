//! Forwards and load balancers — spec.md §4.11. Both persist as, and
//! flatten to, the same OVN load-balancer object; a forward is simply a
//! load balancer with at most one target per listen port.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use lxdovn_types::{
    ClusterDb, CoreError, CoreResult, ForwardRow, LoadBalancerRow, NetworkConfig, NetworkId,
    PortMapRow, Project,
};
use sha2::{Digest, Sha256};

use crate::ipam;
use crate::names;
use crate::ovn::{MayExist, OvnClient, TransactOp, WaitMode};
use crate::types::UplinkInfo;

/// How long `Create` is willing to spend sampling candidates for an
/// unspecified listen address before giving up (spec.md §4.7 `randomExternal`).
const AUTO_ALLOCATE_DEADLINE: Duration = Duration::from_secs(5);

/// Cluster-wide collaborator notified after a VIP set changes so peers can
/// refresh any BGP advertisement built from it. Contract-only, matching the
/// other external collaborators this core consumes (spec.md §6).
#[async_trait]
pub trait PeerNotifier: Send + Sync {
    async fn notify_vip_changed(&self, network_id: NetworkId, listen_address: &str) -> CoreResult<()>;
}

/// A notifier that does nothing; for deployments without peering, or tests.
pub struct NoopNotifier;

#[async_trait]
impl PeerNotifier for NoopNotifier {
    async fn notify_vip_changed(&self, _network_id: NetworkId, _listen_address: &str) -> CoreResult<()> {
        Ok(())
    }
}

fn is_unspecified(addr: &str) -> bool {
    addr.is_empty() || addr == "0.0.0.0" || addr == "::"
}

/// Whether `addr` (a listen address, possibly the `0.0.0.0`/`::`
/// auto-allocate sentinel) refers to the v4 or v6 family.
fn wants_v4(addr: &str) -> CoreResult<bool> {
    if addr.is_empty() || addr == "0.0.0.0" {
        return Ok(true);
    }
    if addr == "::" {
        return Ok(false);
    }
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok(true),
        Ok(IpAddr::V6(_)) => Ok(false),
        Err(_) => Err(CoreError::invalid_config(format!("invalid listen address {addr:?}"))),
    }
}

fn vips(default_target: Option<&str>, ports: &[PortMapRow]) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(target) = default_target {
        out.entry(String::new()).or_default().push(target.to_string());
    }
    for p in ports {
        if p.listen_ports.len() == p.target_ports.len() {
            for (lp, tp) in p.listen_ports.iter().zip(p.target_ports.iter()) {
                out.entry(format!("{lp}")).or_default().push(format!(
                    "{}:{}:{}",
                    p.protocol, p.target_address, tp
                ));
            }
        } else if p.target_ports.len() == 1 {
            let tp = p.target_ports[0];
            for lp in &p.listen_ports {
                out.entry(format!("{lp}")).or_default().push(format!(
                    "{}:{}:{}",
                    p.protocol, p.target_address, tp
                ));
            }
        }
    }
    out
}

fn etag(listen_address: &str, default_target: Option<&str>, ports: &[PortMapRow]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(listen_address.as_bytes());
    if let Some(t) = default_target {
        hasher.update(b"default:");
        hasher.update(t.as_bytes());
    }
    for p in ports {
        hasher.update(p.protocol.as_bytes());
        hasher.update(p.target_address.as_bytes());
        for lp in &p.listen_ports {
            hasher.update(lp.to_be_bytes());
        }
        for tp in &p.target_ports {
            hasher.update(tp.to_be_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

pub struct ForwardAndLbManager {
    ovn: Arc<dyn OvnClient>,
    db: Arc<dyn ClusterDb>,
    notifier: Arc<dyn PeerNotifier>,
}

impl ForwardAndLbManager {
    pub fn new(ovn: Arc<dyn OvnClient>, db: Arc<dyn ClusterDb>, notifier: Arc<dyn PeerNotifier>) -> Self {
        Self { ovn, db, notifier }
    }

    async fn resolve_listen_address(
        &self,
        cfg: &NetworkConfig,
        project: &Project,
        uplink: &UplinkInfo,
        requested: &str,
        want_v4: bool,
    ) -> CoreResult<IpAddr> {
        let uplink_routes: Vec<IpNet> = if want_v4 {
            uplink.routes_v4.iter().copied().map(IpNet::V4).collect()
        } else {
            uplink.routes_v6.iter().copied().map(IpNet::V6).collect()
        };
        let restricted: Option<Vec<IpNet>> = if project.restricted {
            Some(if want_v4 {
                project.allowed_subnets_v4.iter().copied().map(IpNet::V4).collect()
            } else {
                project.allowed_subnets_v6.iter().copied().map(IpNet::V6).collect()
            })
        } else {
            None
        };

        if is_unspecified(requested) {
            let existing = self.existing_vip_addresses(cfg.id, &cfg.uplink).await?;
            let net = ipam::random_external(
                want_v4,
                &uplink_routes,
                restricted.as_deref(),
                AUTO_ALLOCATE_DEADLINE,
                |candidate| !existing.contains(&candidate.addr()),
            )
            .await?;
            return Ok(net.addr());
        }

        let addr: IpAddr = requested
            .parse()
            .map_err(|_| CoreError::invalid_config(format!("invalid listen address {requested:?}")))?;
        let candidate = IpNet::new(addr, if want_v4 { 32 } else { 128 })
            .map_err(|e| CoreError::invalid_config(e.to_string()))?;
        ipam::validate_external_subnet(&uplink_routes, restricted.as_deref(), candidate)
            .map_err(|_| CoreError::invalid_config("overlaps with another network or NIC"))?;

        let existing = self.existing_vip_addresses(cfg.id, &cfg.uplink).await?;
        if existing.contains(&addr) {
            return Err(CoreError::invalid_config("overlaps with another network or NIC"));
        }
        Ok(addr)
    }

    /// VIPs already claimed by other networks sharing this uplink — the
    /// `ClusterDb` contract has no NIC/port listing, so this only checks
    /// other forwards/load-balancers, not in-use instance addresses.
    async fn existing_vip_addresses(&self, this_network: NetworkId, uplink: &str) -> CoreResult<HashSet<IpAddr>> {
        let mut out = HashSet::new();
        for net in self.db.list_networks_on_uplink(uplink).await? {
            if net.id == this_network {
                continue;
            }
            for fwd in self.db.list_forwards(net.id).await? {
                if let Ok(addr) = fwd.listen_address.parse() {
                    out.insert(addr);
                }
            }
            for lb in self.db.list_load_balancers(net.id).await? {
                if let Ok(addr) = lb.listen_address.parse() {
                    out.insert(addr);
                }
            }
        }
        Ok(out)
    }

    fn apply_vips_op(&self, cfg: &NetworkConfig, listen_address: &str, default_target: Option<&str>, ports: &[PortMapRow]) -> TransactOp {
        TransactOp::upsert(
            "Load_Balancer",
            names::load_balancer(cfg.id, listen_address),
            MayExist::CreateOrUpdate,
        )
        .with_field("vips", serde_json::json!(vips(default_target, ports)))
    }

    pub async fn create_forward(
        &self,
        cfg: &NetworkConfig,
        project: &Project,
        uplink: &UplinkInfo,
        mut row: ForwardRow,
    ) -> CoreResult<()> {
        let want_v4 = wants_v4(&row.listen_address)?;
        let addr = self
            .resolve_listen_address(cfg, project, uplink, &row.listen_address, want_v4)
            .await?;
        row.listen_address = addr.to_string();
        row.network_id = cfg.id;

        self.db.upsert_forward(row.clone()).await?;
        let op = self.apply_vips_op(cfg, &row.listen_address, row.default_target.as_deref(), &row.ports);
        if let Err(err) = self.ovn.transact(vec![op], WaitMode::None).await {
            let _ = self.db.delete_forward(cfg.id, &row.listen_address).await;
            return Err(err);
        }
        self.notifier.notify_vip_changed(cfg.id, &row.listen_address).await
    }

    pub async fn update_forward(&self, cfg: &NetworkConfig, row: ForwardRow) -> CoreResult<()> {
        let current = self
            .db
            .list_forwards(cfg.id)
            .await?
            .into_iter()
            .find(|f| f.listen_address == row.listen_address);
        let Some(current) = current else {
            return Err(CoreError::not_found(format!(
                "forward {} not found",
                row.listen_address
            )));
        };
        if etag(&current.listen_address, current.default_target.as_deref(), &current.ports)
            == etag(&row.listen_address, row.default_target.as_deref(), &row.ports)
        {
            return Ok(());
        }

        self.db.upsert_forward(row.clone()).await?;
        let op = self.apply_vips_op(cfg, &row.listen_address, row.default_target.as_deref(), &row.ports);
        if let Err(err) = self.ovn.transact(vec![op], WaitMode::None).await {
            let revert = self.apply_vips_op(
                cfg,
                &current.listen_address,
                current.default_target.as_deref(),
                &current.ports,
            );
            let _ = self.db.upsert_forward(current).await;
            let _ = self.ovn.transact(vec![revert], WaitMode::None).await;
            return Err(err);
        }
        self.notifier.notify_vip_changed(cfg.id, &row.listen_address).await
    }

    pub async fn delete_forward(&self, cfg: &NetworkConfig, listen_address: &str) -> CoreResult<()> {
        self.ovn
            .transact(
                vec![TransactOp::delete("Load_Balancer", names::load_balancer(cfg.id, listen_address))],
                WaitMode::None,
            )
            .await?;
        self.db.delete_forward(cfg.id, listen_address).await?;
        self.notifier.notify_vip_changed(cfg.id, listen_address).await
    }

    pub async fn create_load_balancer(
        &self,
        cfg: &NetworkConfig,
        project: &Project,
        uplink: &UplinkInfo,
        mut row: LoadBalancerRow,
    ) -> CoreResult<()> {
        let want_v4 = wants_v4(&row.listen_address)?;
        let addr = self
            .resolve_listen_address(cfg, project, uplink, &row.listen_address, want_v4)
            .await?;
        row.listen_address = addr.to_string();
        row.network_id = cfg.id;

        self.db.upsert_load_balancer(row.clone()).await?;
        let op = self.apply_vips_op(cfg, &row.listen_address, None, &row.ports);
        if let Err(err) = self.ovn.transact(vec![op], WaitMode::None).await {
            let _ = self.db.delete_load_balancer(cfg.id, &row.listen_address).await;
            return Err(err);
        }
        self.notifier.notify_vip_changed(cfg.id, &row.listen_address).await
    }

    pub async fn update_load_balancer(&self, cfg: &NetworkConfig, row: LoadBalancerRow) -> CoreResult<()> {
        let current = self
            .db
            .list_load_balancers(cfg.id)
            .await?
            .into_iter()
            .find(|lb| lb.listen_address == row.listen_address);
        let Some(current) = current else {
            return Err(CoreError::not_found(format!(
                "load balancer {} not found",
                row.listen_address
            )));
        };
        if etag(&current.listen_address, None, &current.ports) == etag(&row.listen_address, None, &row.ports) {
            return Ok(());
        }

        self.db.upsert_load_balancer(row.clone()).await?;
        let op = self.apply_vips_op(cfg, &row.listen_address, None, &row.ports);
        if let Err(err) = self.ovn.transact(vec![op], WaitMode::None).await {
            let revert = self.apply_vips_op(cfg, &current.listen_address, None, &current.ports);
            let _ = self.db.upsert_load_balancer(current).await;
            let _ = self.ovn.transact(vec![revert], WaitMode::None).await;
            return Err(err);
        }
        self.notifier.notify_vip_changed(cfg.id, &row.listen_address).await
    }

    pub async fn delete_load_balancer(&self, cfg: &NetworkConfig, listen_address: &str) -> CoreResult<()> {
        self.ovn
            .transact(
                vec![TransactOp::delete("Load_Balancer", names::load_balancer(cfg.id, listen_address))],
                WaitMode::None,
            )
            .await?;
        self.db.delete_load_balancer(cfg.id, listen_address).await?;
        self.notifier.notify_vip_changed(cfg.id, listen_address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::InMemoryOvnClient;
    use dashmap::DashMap;
    use lxdovn_types::{ClusterMember, NetworkRow, PeerRow};
    use std::collections::BTreeMap as Map;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[derive(Default)]
    struct FakeDb {
        forwards: DashMap<NetworkId, Vec<ForwardRow>>,
        lbs: DashMap<NetworkId, Vec<LoadBalancerRow>>,
    }

    #[async_trait]
    impl ClusterDb for FakeDb {
        async fn get_network(&self, _project: &str, _name: &str) -> CoreResult<Option<NetworkRow>> {
            Ok(None)
        }
        async fn list_networks(&self) -> CoreResult<Vec<NetworkRow>> {
            Ok(vec![])
        }
        async fn list_networks_on_uplink(&self, _uplink: &str) -> CoreResult<Vec<NetworkRow>> {
            Ok(vec![])
        }
        async fn upsert_network(&self, _row: NetworkRow) -> CoreResult<()> {
            Ok(())
        }
        async fn delete_network(&self, _project: &str, _name: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn get_project(&self, _name: &str) -> CoreResult<Option<Project>> {
            Ok(None)
        }
        async fn list_forwards(&self, network_id: NetworkId) -> CoreResult<Vec<ForwardRow>> {
            Ok(self.forwards.get(&network_id).map(|v| v.clone()).unwrap_or_default())
        }
        async fn upsert_forward(&self, row: ForwardRow) -> CoreResult<()> {
            let mut entry = self.forwards.entry(row.network_id).or_default();
            entry.retain(|f| f.listen_address != row.listen_address);
            entry.push(row);
            Ok(())
        }
        async fn delete_forward(&self, network_id: NetworkId, listen_address: &str) -> CoreResult<()> {
            if let Some(mut entry) = self.forwards.get_mut(&network_id) {
                entry.retain(|f| f.listen_address != listen_address);
            }
            Ok(())
        }
        async fn list_load_balancers(&self, network_id: NetworkId) -> CoreResult<Vec<LoadBalancerRow>> {
            Ok(self.lbs.get(&network_id).map(|v| v.clone()).unwrap_or_default())
        }
        async fn upsert_load_balancer(&self, row: LoadBalancerRow) -> CoreResult<()> {
            let mut entry = self.lbs.entry(row.network_id).or_default();
            entry.retain(|f| f.listen_address != row.listen_address);
            entry.push(row);
            Ok(())
        }
        async fn delete_load_balancer(&self, network_id: NetworkId, listen_address: &str) -> CoreResult<()> {
            if let Some(mut entry) = self.lbs.get_mut(&network_id) {
                entry.retain(|f| f.listen_address != listen_address);
            }
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

    fn cfg() -> NetworkConfig {
        NetworkConfig::parse(
            NetworkId(7),
            "p1",
            "n1",
            &Map::from([("network".to_string(), "uplink1".to_string())]),
            &["uplink1".to_string()],
        )
        .unwrap()
    }

    fn uplink() -> UplinkInfo {
        UplinkInfo {
            name: "uplink1".into(),
            mtu: 1500,
            cidr_v4: None,
            cidr_v6: None,
            ovn_ranges_v4: vec![],
            ovn_ranges_v6: None,
            routes_v4: vec!["203.0.113.0/24".parse().unwrap()],
            routes_v6: vec!["2001:db8::/64".parse().unwrap()],
            gateway_v4: Some(Ipv4Addr::new(203, 0, 113, 1)),
            gateway_v6: Some(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            ingress_mode: lxdovn_types::IngressMode::L2Proxy,
        }
    }

    #[tokio::test]
    async fn explicit_listen_address_outside_uplink_routes_is_rejected() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let db = Arc::new(FakeDb::default());
        let mgr = ForwardAndLbManager::new(ovn, db, Arc::new(NoopNotifier));
        let row = ForwardRow {
            network_id: cfg().id,
            listen_address: "198.51.100.5".into(),
            default_target: Some("10.0.0.5".into()),
            ports: vec![],
        };
        let err = mgr
            .create_forward(&cfg(), &Project::default(), &uplink(), row)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn create_forward_flattens_ports_into_one_load_balancer_object() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let db = Arc::new(FakeDb::default());
        let mgr = ForwardAndLbManager::new(ovn.clone(), db, Arc::new(NoopNotifier));
        let row = ForwardRow {
            network_id: cfg().id,
            listen_address: "203.0.113.50".into(),
            default_target: None,
            ports: vec![PortMapRow {
                protocol: "tcp".into(),
                listen_ports: vec![80, 443],
                target_address: "10.0.0.5".into(),
                target_ports: vec![8080],
            }],
        };
        mgr.create_forward(&cfg(), &Project::default(), &uplink(), row)
            .await
            .unwrap();

        let obj = ovn
            .get("Load_Balancer", &names::load_balancer(cfg().id, "203.0.113.50"))
            .await
            .unwrap()
            .unwrap();
        let vips: BTreeMap<String, Vec<String>> =
            serde_json::from_value(obj.fields.get("vips").unwrap().clone()).unwrap();
        assert_eq!(vips.len(), 2);
        assert_eq!(vips["80"], vec!["tcp:10.0.0.5:8080".to_string()]);
    }

    #[tokio::test]
    async fn update_is_a_noop_when_etag_matches() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let db = Arc::new(FakeDb::default());
        let mgr = ForwardAndLbManager::new(ovn.clone(), db, Arc::new(NoopNotifier));
        let row = ForwardRow {
            network_id: cfg().id,
            listen_address: "203.0.113.50".into(),
            default_target: Some("10.0.0.5".into()),
            ports: vec![],
        };
        mgr.create_forward(&cfg(), &Project::default(), &uplink(), row.clone())
            .await
            .unwrap();
        let nb_before = ovn.nb_cfg();
        mgr.update_forward(&cfg(), row).await.unwrap();
        assert_eq!(ovn.nb_cfg(), nb_before);
    }

    #[tokio::test]
    async fn delete_removes_ovn_object_and_db_row() {
        let ovn = Arc::new(InMemoryOvnClient::new());
        let db = Arc::new(FakeDb::default());
        let mgr = ForwardAndLbManager::new(ovn.clone(), db.clone(), Arc::new(NoopNotifier));
        let row = ForwardRow {
            network_id: cfg().id,
            listen_address: "203.0.113.50".into(),
            default_target: Some("10.0.0.5".into()),
            ports: vec![],
        };
        mgr.create_forward(&cfg(), &Project::default(), &uplink(), row)
            .await
            .unwrap();
        mgr.delete_forward(&cfg(), "203.0.113.50").await.unwrap();
        assert!(ovn
            .get("Load_Balancer", &names::load_balancer(cfg().id, "203.0.113.50"))
            .await
            .unwrap()
            .is_none());
        assert!(db.list_forwards(cfg().id).await.unwrap().is_empty());
    }
}
