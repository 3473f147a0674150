//! Shared plumbing types used across the ONO modules: the uplink's own
//! view of the world (an external input to `NetworkProjection`, since the
//! uplink network itself is out of this crate's scope) and the revert
//! stack used by idempotent setup/rollback.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use lxdovn_types::IngressMode;

use crate::ovn::{OvnClient, TransactOp, WaitMode};

/// What `NetworkProjection` needs to know about the parent uplink network.
/// The uplink network's own lifecycle (bridge plumbing aside, see
/// `uplink.rs`) is a collaborator's responsibility.
#[derive(Debug, Clone)]
pub struct UplinkInfo {
    pub name: String,
    pub mtu: u32,
    /// The uplink's own OVN-side subnet, used to size the external router
    /// port's address (prefix length) once an address is allocated from
    /// `ovn_ranges_v4`/`ovn_ranges_v6`.
    pub cidr_v4: Option<Ipv4Net>,
    pub cidr_v6: Option<Ipv6Net>,
    pub ovn_ranges_v4: Vec<(Ipv4Addr, Ipv4Addr)>,
    pub ovn_ranges_v6: Option<(Ipv6Addr, Ipv6Addr)>,
    pub routes_v4: Vec<Ipv4Net>,
    pub routes_v6: Vec<Ipv6Net>,
    pub gateway_v4: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
    pub ingress_mode: IngressMode,
}

/// Records only the deletions that would undo work this call actually
/// performed (objects that did not already exist before this call
/// touched them); replayed LIFO on failure, discarded on success.
#[derive(Default)]
pub struct RevertStack {
    actions: Vec<(String, String)>,
}

impl RevertStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&mut self, kind: impl Into<String>, name: impl Into<String>) {
        self.actions.push((kind.into(), name.into()));
    }

    pub async fn unwind(&self, ovn: &dyn OvnClient) {
        for (kind, name) in self.actions.iter().rev() {
            if let Err(err) = ovn
                .transact(vec![TransactOp::delete(kind.clone(), name.clone())], WaitMode::None)
                .await
            {
                tracing::warn!(%kind, %name, %err, "revert step failed; continuing unwind");
            }
        }
    }
}
