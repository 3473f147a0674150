//! Uplink host-network plumbing — spec.md §4.13 UplinkPortManager.
//!
//! Bridge/veth/OVS-mapping management is host-local system state, not an
//! OVN northbound object, so it is consumed through its own contract-only
//! collaborator (`HostNetwork`) the same way `OvnClient` and `ClusterDb`
//! are: a real binary wires this to `ip`/`ovs-vsctl` calls, tests use
//! [`InMemoryHostNetwork`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use lxdovn_types::{CoreError, CoreResult};
use tokio_util::sync::CancellationToken;

use lxdovn_locks::NamedLocks;

/// What kind of host object backs an uplink network.
#[derive(Debug, Clone)]
pub enum UplinkKind {
    /// A Linux bridge the admin already manages; `host_if` is the bridge's
    /// own interface name, which our OVS bridge reaches over a veth pair.
    NativeBridge { host_if: String },
    /// An OVS bridge the admin already manages; we only add the
    /// NB-to-bridge mapping, never create or delete the bridge itself.
    OvsBridge { bridge: String },
    /// A raw physical NIC, attached to our dedicated OVS bridge directly.
    Physical { host_if: String },
}

fn dedicated_bridge_name(uplink_id: i64) -> String {
    format!("lxdovn{uplink_id}")
}

fn veth_host_name(uplink_id: i64) -> String {
    format!("veth-lxdovn{uplink_id}")
}

fn veth_bridge_name(uplink_id: i64) -> String {
    format!("veth-lxdovn{uplink_id}-ovs")
}

/// Host-local network state this crate needs to mutate, kept thin for the
/// same reason `OvnClient` is: the wire-level tooling (`ip link`,
/// `ovs-vsctl`) is an explicit Non-goal.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    async fn ensure_ovs_bridge(&self, bridge: &str) -> CoreResult<()>;
    async fn delete_ovs_bridge(&self, bridge: &str) -> CoreResult<()>;
    async fn bridge_port_count(&self, bridge: &str) -> CoreResult<usize>;

    async fn attach_physical(&self, bridge: &str, iface: &str) -> CoreResult<()>;
    async fn detach_physical(&self, bridge: &str, iface: &str) -> CoreResult<()>;

    /// Creates a veth pair, plugs `bridge_side` into our OVS bridge and
    /// `host_side` into the admin's native bridge, sets MTU on both ends,
    /// and suppresses IPv6 on `host_side`.
    async fn ensure_veth_to_bridge(
        &self,
        ovs_bridge: &str,
        native_bridge: &str,
        host_side: &str,
        bridge_side: &str,
        mtu: u32,
    ) -> CoreResult<()>;
    async fn delete_veth(&self, host_side: &str, bridge_side: &str) -> CoreResult<()>;

    async fn set_ovn_mapping(&self, bridge: &str, uplink: &str) -> CoreResult<()>;
    async fn clear_ovn_mapping(&self, bridge: &str, uplink: &str) -> CoreResult<()>;
}

#[derive(Default)]
pub struct InMemoryHostNetwork {
    bridges: DashMap<String, Vec<String>>,
    veths: DashMap<String, String>,
    mappings: DashMap<String, String>,
}

impl InMemoryHostNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mapping_for(&self, bridge: &str) -> Option<String> {
        self.mappings.get(bridge).map(|v| v.clone())
    }
}

#[async_trait]
impl HostNetwork for InMemoryHostNetwork {
    async fn ensure_ovs_bridge(&self, bridge: &str) -> CoreResult<()> {
        self.bridges.entry(bridge.to_string()).or_default();
        Ok(())
    }

    async fn delete_ovs_bridge(&self, bridge: &str) -> CoreResult<()> {
        self.bridges.remove(bridge);
        self.mappings.remove(bridge);
        Ok(())
    }

    async fn bridge_port_count(&self, bridge: &str) -> CoreResult<usize> {
        Ok(self.bridges.get(bridge).map(|p| p.len()).unwrap_or(0))
    }

    async fn attach_physical(&self, bridge: &str, iface: &str) -> CoreResult<()> {
        let mut ports = self.bridges.entry(bridge.to_string()).or_default();
        if !ports.iter().any(|p| p == iface) {
            ports.push(iface.to_string());
        }
        Ok(())
    }

    async fn detach_physical(&self, bridge: &str, iface: &str) -> CoreResult<()> {
        if let Some(mut ports) = self.bridges.get_mut(bridge) {
            ports.retain(|p| p != iface);
        }
        Ok(())
    }

    async fn ensure_veth_to_bridge(
        &self,
        ovs_bridge: &str,
        native_bridge: &str,
        host_side: &str,
        bridge_side: &str,
        _mtu: u32,
    ) -> CoreResult<()> {
        self.veths.insert(host_side.to_string(), bridge_side.to_string());
        let mut ovs_ports = self.bridges.entry(ovs_bridge.to_string()).or_default();
        if !ovs_ports.iter().any(|p| p == bridge_side) {
            ovs_ports.push(bridge_side.to_string());
        }
        drop(ovs_ports);
        let mut native_ports = self.bridges.entry(native_bridge.to_string()).or_default();
        if !native_ports.iter().any(|p| p == host_side) {
            native_ports.push(host_side.to_string());
        }
        Ok(())
    }

    async fn delete_veth(&self, host_side: &str, _bridge_side: &str) -> CoreResult<()> {
        self.veths.remove(host_side);
        Ok(())
    }

    async fn set_ovn_mapping(&self, bridge: &str, uplink: &str) -> CoreResult<()> {
        self.mappings.insert(bridge.to_string(), uplink.to_string());
        Ok(())
    }

    async fn clear_ovn_mapping(&self, bridge: &str, _uplink: &str) -> CoreResult<()> {
        self.mappings.remove(bridge);
        Ok(())
    }
}

pub struct UplinkPortManager {
    host: Arc<dyn HostNetwork>,
    locks: Arc<NamedLocks>,
}

impl UplinkPortManager {
    pub fn new(host: Arc<dyn HostNetwork>, locks: Arc<NamedLocks>) -> Self {
        Self { host, locks }
    }

    /// Guarantees the host side of `uplink_name` (identified by
    /// `uplink_id` for our dedicated-bridge/veth naming) is wired and
    /// mapped into OVN. Idempotent; guarded by a per-uplink named lock so
    /// two OVN networks sharing an uplink cannot race.
    pub async fn ensure(
        &self,
        uplink_id: i64,
        uplink_name: &str,
        kind: &UplinkKind,
        mtu: u32,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let lock = self
            .locks
            .lock(&format!("network.ovn.{uplink_name}"), cancel)
            .await
            .map_err(|_| CoreError::Transient("uplink lock wait was cancelled".into()))?;
        let result = self.ensure_inner(uplink_id, uplink_name, kind, mtu).await;
        lock.unlock();
        result
    }

    async fn ensure_inner(&self, uplink_id: i64, uplink_name: &str, kind: &UplinkKind, mtu: u32) -> CoreResult<()> {
        match kind {
            UplinkKind::OvsBridge { bridge } => {
                self.host.set_ovn_mapping(bridge, uplink_name).await
            }
            UplinkKind::Physical { host_if } => {
                let bridge = dedicated_bridge_name(uplink_id);
                self.host.ensure_ovs_bridge(&bridge).await?;
                self.host.attach_physical(&bridge, host_if).await?;
                self.host.set_ovn_mapping(&bridge, uplink_name).await
            }
            UplinkKind::NativeBridge { host_if } => {
                let bridge = dedicated_bridge_name(uplink_id);
                self.host.ensure_ovs_bridge(&bridge).await?;
                self.host
                    .ensure_veth_to_bridge(
                        &bridge,
                        host_if,
                        &veth_host_name(uplink_id),
                        &veth_bridge_name(uplink_id),
                        mtu,
                    )
                    .await?;
                self.host.set_ovn_mapping(&bridge, uplink_name).await
            }
        }
    }

    /// Reverses the bridge mapping, and — only if no other OVN network
    /// still references this uplink — tears down the dedicated bridge and
    /// veth pair (or detaches the physical NIC). The caller passes the
    /// `still_referenced` verdict; this module has no visibility into the
    /// cluster DB's network table.
    pub async fn teardown(
        &self,
        uplink_id: i64,
        uplink_name: &str,
        kind: &UplinkKind,
        still_referenced: bool,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let lock = self
            .locks
            .lock(&format!("network.ovn.{uplink_name}"), cancel)
            .await
            .map_err(|_| CoreError::Transient("uplink lock wait was cancelled".into()))?;
        let result = self
            .teardown_inner(uplink_id, uplink_name, kind, still_referenced)
            .await;
        lock.unlock();
        result
    }

    async fn teardown_inner(
        &self,
        uplink_id: i64,
        uplink_name: &str,
        kind: &UplinkKind,
        still_referenced: bool,
    ) -> CoreResult<()> {
        match kind {
            // An admin-owned OVS bridge is named independently of the
            // uplink network; deleting it here would be wrong even when
            // unreferenced, so only the mapping it owns is cleared.
            UplinkKind::OvsBridge { bridge } => self.host.clear_ovn_mapping(bridge, uplink_name).await,
            UplinkKind::Physical { host_if } => {
                let bridge = dedicated_bridge_name(uplink_id);
                self.host.clear_ovn_mapping(&bridge, uplink_name).await?;
                if still_referenced {
                    return Ok(());
                }
                self.host.detach_physical(&bridge, host_if).await?;
                self.host.delete_ovs_bridge(&bridge).await
            }
            UplinkKind::NativeBridge { .. } => {
                let bridge = dedicated_bridge_name(uplink_id);
                self.host.clear_ovn_mapping(&bridge, uplink_name).await?;
                if still_referenced {
                    return Ok(());
                }
                self.host
                    .delete_veth(&veth_host_name(uplink_id), &veth_bridge_name(uplink_id))
                    .await?;
                self.host.delete_ovs_bridge(&bridge).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn native_bridge_uplink_creates_dedicated_ovs_bridge_and_veth() {
        let host = Arc::new(InMemoryHostNetwork::new());
        let mgr = UplinkPortManager::new(host.clone(), NamedLocks::new());
        let kind = UplinkKind::NativeBridge { host_if: "br0".into() };
        mgr.ensure(7, "uplink1", &kind, 1500, &cancel()).await.unwrap();

        assert_eq!(host.mapping_for("lxdovn7").as_deref(), Some("uplink1"));
        assert_eq!(host.bridge_port_count("lxdovn7").await.unwrap(), 1);
        assert_eq!(host.bridge_port_count("br0").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ovs_bridge_uplink_only_sets_mapping_without_creating_bridge() {
        let host = Arc::new(InMemoryHostNetwork::new());
        let mgr = UplinkPortManager::new(host.clone(), NamedLocks::new());
        let kind = UplinkKind::OvsBridge { bridge: "br-provider".into() };
        mgr.ensure(7, "uplink1", &kind, 1500, &cancel()).await.unwrap();

        assert_eq!(host.mapping_for("br-provider").as_deref(), Some("uplink1"));
        assert_eq!(host.bridge_port_count("br-provider").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn teardown_keeps_dedicated_bridge_while_still_referenced() {
        let host = Arc::new(InMemoryHostNetwork::new());
        let mgr = UplinkPortManager::new(host.clone(), NamedLocks::new());
        let kind = UplinkKind::Physical { host_if: "eth1".into() };
        mgr.ensure(9, "uplink2", &kind, 1500, &cancel()).await.unwrap();

        mgr.teardown(9, "uplink2", &kind, true, &cancel()).await.unwrap();
        assert!(host.mapping_for("lxdovn9").is_none());
        assert_eq!(host.bridge_port_count("lxdovn9").await.unwrap(), 1);

        mgr.teardown(9, "uplink2", &kind, false, &cancel()).await.unwrap();
        assert_eq!(host.bridge_port_count("lxdovn9").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn teardown_never_deletes_an_admin_owned_ovs_bridge() {
        let host = Arc::new(InMemoryHostNetwork::new());
        let mgr = UplinkPortManager::new(host.clone(), NamedLocks::new());
        let kind = UplinkKind::OvsBridge { bridge: "br-provider".into() };
        mgr.ensure(1, "uplink1", &kind, 1500, &cancel()).await.unwrap();
        mgr.teardown(1, "uplink1", &kind, false, &cancel()).await.unwrap();
        assert!(host.mapping_for("br-provider").is_none());
    }
}
