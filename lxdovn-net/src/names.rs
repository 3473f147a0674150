//! Deterministic OVN object naming — spec.md §6.
//!
//! Every name is derived purely from the network id (or peer/instance key)
//! so any cluster member computes the same name without coordination.

use lxdovn_types::{NetworkId, NicKey};

pub fn router(id: NetworkId) -> String {
    format!("lxd-net{id}-lr")
}

pub fn router_port_ext(id: NetworkId) -> String {
    format!("lxd-net{id}-lr-lrp-ext")
}

pub fn router_port_int(id: NetworkId) -> String {
    format!("lxd-net{id}-lr-lrp-int")
}

pub fn switch_ext(id: NetworkId) -> String {
    format!("lxd-net{id}-ls-ext")
}

pub fn switch_int(id: NetworkId) -> String {
    format!("lxd-net{id}-ls-int")
}

pub fn switch_ext_port_router(id: NetworkId) -> String {
    format!("lxd-net{id}-ls-ext-lsp-router")
}

pub fn switch_ext_port_provider(id: NetworkId) -> String {
    format!("lxd-net{id}-ls-ext-lsp-provider")
}

pub fn switch_int_port_router(id: NetworkId) -> String {
    format!("lxd-net{id}-ls-int-lsp-router")
}

pub fn load_balancer(id: NetworkId, listen_address: &str) -> String {
    format!("lxd-net{id}-lb-{listen_address}")
}

pub fn instance_port(id: NetworkId, nic: &NicKey) -> String {
    format!("lxd-net{id}-instance-{}-{}", nic.instance_uuid, nic.device_name)
}

pub fn peer_router_port(id: NetworkId, peer_network_id: NetworkId) -> String {
    format!("lxd-net{id}-lrp-peer-net{peer_network_id}")
}

pub fn dhcpv4_options(id: NetworkId) -> String {
    format!("lxd-net{id}-dhcpv4")
}

pub fn dhcpv6_options(id: NetworkId) -> String {
    format!("lxd-net{id}-dhcpv6")
}

pub fn network_port_group(id: NetworkId) -> String {
    format!("lxd-net{id}-pg-internal")
}

pub fn acl_port_group(acl_name: &str) -> String {
    format!("lxd-acl-{acl_name}-pg")
}

pub fn network_address_set(id: NetworkId) -> String {
    format!("lxd-net{id}-addrset")
}

pub fn chassis_group(id: NetworkId) -> String {
    format!("lxd-net{id}-cg")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn names_are_deterministic_in_network_id() {
        let id = NetworkId(7);
        assert_eq!(router(id), router(NetworkId(7)));
        assert_eq!(router(id), "lxd-net7-lr");
        assert_eq!(switch_ext(id), "lxd-net7-ls-ext");
        assert_eq!(peer_router_port(id, NetworkId(9)), "lxd-net7-lrp-peer-net9");
    }

    #[test]
    fn instance_port_name_is_stable_for_same_key() {
        let id = NetworkId(7);
        let nic = NicKey {
            instance_uuid: Uuid::nil(),
            device_name: "eth0".into(),
        };
        assert_eq!(instance_port(id, &nic), instance_port(id, &nic));
    }
}
