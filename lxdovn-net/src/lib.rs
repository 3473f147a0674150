//! Overlay Network Orchestrator — spec.md §4.6 through §4.13.
//!
//! Programs a logical multi-tenant overlay network on OVN: per-network
//! routers/switches/ports (`projection`), per-instance NICs (`ports`),
//! cross-network peering (`peering`), forwards and load balancers (`lb`),
//! router security policy shared by both (`policy`), and the host-side
//! uplink bridge plumbing (`uplink`). `ovn`, `ipam`, and `names` are the
//! shared primitives everything above is built from.

mod ipam;
mod lb;
mod names;
mod ovn;
mod peering;
mod policy;
mod ports;
mod projection;
mod types;
mod uplink;

pub use ipam::{allocate, random_external, validate_external_subnet};
pub use lb::{ForwardAndLbManager, NoopNotifier, PeerNotifier};
pub use ovn::{InMemoryOvnClient, LogicalObject, MayExist, OvnClient, TransactOp, WaitMode};
pub use peering::PeeringManager;
pub use policy::{apply_router_security_policy, PeerPolicyEntry};
pub use ports::{InstancePortManager, NicConfig};
pub use projection::NetworkProjection;
pub use types::{RevertStack, UplinkInfo};
pub use uplink::{HostNetwork, InMemoryHostNetwork, UplinkKind, UplinkPortManager};
