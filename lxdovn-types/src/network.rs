//! Typed network configuration — spec.md §3 and §9 ("Configuration as a
//! typed struct, not a free-form map").
//!
//! The collaborator that owns the cluster DB and the CLI/REST layer hands
//! us a `BTreeMap<String, String>` of the closed option vocabulary; we parse
//! and validate it exactly once, at the boundary, into [`NetworkConfig`].
//! `NetworkProjection::setup` never re-parses strings.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::NetworkId;

/// Uplink ingress mode — glossary: l2proxy / l3only / routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngressMode {
    L2Proxy,
    Routed,
}

impl Default for IngressMode {
    fn default() -> Self {
        IngressMode::L2Proxy
    }
}

impl IngressMode {
    fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "l2proxy" | "" => Ok(IngressMode::L2Proxy),
            "routed" => Ok(IngressMode::Routed),
            other => Err(CoreError::invalid_config(format!(
                "unknown ovn.ingress_mode {other:?}"
            ))),
        }
    }
}

/// Per-address-family addressing and DHCP configuration (`ipv4.*` / `ipv6.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// `ipv4.address` / `ipv6.address` — the internal subnet on this
    /// network's internal switch, e.g. `10.0.0.1/24`.
    pub address_v4: Option<Ipv4Net>,
    pub address_v6: Option<Ipv6Net>,

    /// `ipv4.nat` / `ipv6.nat`.
    pub nat: bool,

    /// `ipv4.nat.address` / `ipv6.nat.address` — explicit SNAT address;
    /// requires uplink ingress mode `routed` (spec.md §3 invariant).
    pub nat_address_v4: Option<Ipv4Addr>,
    pub nat_address_v6: Option<Ipv6Addr>,

    /// `ipv4.dhcp` / `ipv6.dhcp`.
    pub dhcp: bool,

    /// `ipv6.dhcp.stateful` — required when `ipv6.l3only=true` and DHCPv6
    /// is enabled.
    pub dhcp_stateful: bool,

    /// `ipv4.l3only` / `ipv6.l3only`.
    pub l3only: bool,
}

/// ACL default-action configuration (`security.acls.default.{in,e}gress.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclDefaults {
    pub ingress_action: String,
    pub ingress_logged: bool,
    pub egress_action: String,
    pub egress_logged: bool,
}

impl Default for AclDefaults {
    fn default() -> Self {
        Self {
            ingress_action: "reject".to_string(),
            ingress_logged: false,
            egress_action: "reject".to_string(),
            egress_logged: false,
        }
    }
}

/// The volatile, ONO-owned uplink allocation state (spec.md §3, "Uplink
/// allocation state"). Must never be user-edited; `setup` only reads it to
/// decide whether allocation is needed and writes it back once allocated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolatileUplinkState {
    pub ipv4_address: Option<Ipv4Addr>,
    pub ipv6_address: Option<Ipv6Addr>,
}

/// The fully validated, typed projection of a network's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub id: NetworkId,
    pub project: String,
    pub name: String,

    /// `network` — name of the uplink network; must be in the default
    /// project (spec.md §3 invariant).
    pub uplink: String,

    pub ipv4: FamilyConfig,
    pub ipv6: FamilyConfig,

    /// `bridge.mtu` — explicit MTU, else derived (spec.md §4.8 step 2).
    pub bridge_mtu: Option<u32>,

    /// `bridge.hwaddr` — explicit stable router MAC, else derived
    /// (spec.md §4.8 step 3).
    pub router_mac: Option<String>,

    /// `dns.domain`.
    pub dns_domain: String,

    pub acl_defaults: AclDefaults,

    /// `security.acls` — network-level ACL list applied to every NIC.
    pub acls: Vec<String>,

    /// `ovn.ingress_mode` on the *uplink* network, mirrored here for
    /// convenience since it gates several validations on this network.
    pub uplink_ingress_mode: IngressMode,

    pub volatile: VolatileUplinkState,
}

impl NetworkConfig {
    /// Parse and validate the closed option vocabulary (spec.md §3) into a
    /// typed struct. `opts` is the flat `key -> value` map the cluster DB
    /// hands us; unknown keys are rejected here so `setup` never has to.
    pub fn parse(
        id: NetworkId,
        project: &str,
        name: &str,
        opts: &BTreeMap<String, String>,
        allowed_uplinks: &[String],
    ) -> CoreResult<Self> {
        let uplink = match opts.get("network").map(|s| s.as_str()) {
            Some("") | None => {
                if allowed_uplinks.len() == 1 {
                    allowed_uplinks[0].clone()
                } else {
                    return Err(CoreError::invalid_config(
                        "network: uplink is ambiguous; exactly one uplink must be configured or allowed",
                    ));
                }
            }
            Some(explicit) => {
                if !allowed_uplinks.iter().any(|u| u == explicit) {
                    return Err(CoreError::invalid_config(format!(
                        "uplink {explicit:?} is not allowed for this project"
                    )));
                }
                explicit.to_string()
            }
        };

        let mut ipv4 = FamilyConfig::default();
        if let Some(v) = opts.get("ipv4.address") {
            ipv4.address_v4 = Some(
                v.parse()
                    .map_err(|_| CoreError::invalid_config(format!("invalid ipv4.address {v:?}")))?,
            );
        }
        ipv4.nat = bool_opt(opts, "ipv4.nat", true);
        if let Some(v) = opts.get("ipv4.nat.address") {
            ipv4.nat_address_v4 = Some(
                v.parse()
                    .map_err(|_| CoreError::invalid_config(format!("invalid ipv4.nat.address {v:?}")))?,
            );
        }
        ipv4.dhcp = bool_opt(opts, "ipv4.dhcp", true);
        ipv4.l3only = bool_opt(opts, "ipv4.l3only", false);

        let mut ipv6 = FamilyConfig::default();
        if let Some(v) = opts.get("ipv6.address") {
            let net: Ipv6Net = v
                .parse()
                .map_err(|_| CoreError::invalid_config(format!("invalid ipv6.address {v:?}")))?;
            if net.prefix_len() < 64 {
                return Err(CoreError::invalid_config(
                    "ipv6.address: prefix length must be >= /64 (EUI-64 requirement)",
                ));
            }
            ipv6.address_v6 = Some(net);
        }
        ipv6.nat = bool_opt(opts, "ipv6.nat", true);
        if let Some(v) = opts.get("ipv6.nat.address") {
            ipv6.nat_address_v6 = Some(
                v.parse()
                    .map_err(|_| CoreError::invalid_config(format!("invalid ipv6.nat.address {v:?}")))?,
            );
        }
        ipv6.dhcp = bool_opt(opts, "ipv6.dhcp", true);
        ipv6.dhcp_stateful = bool_opt(opts, "ipv6.dhcp.stateful", false);
        ipv6.l3only = bool_opt(opts, "ipv6.l3only", false);

        if ipv6.l3only && ipv6.dhcp && !ipv6.dhcp_stateful {
            return Err(CoreError::invalid_config(
                "ipv6.l3only=true requires ipv6.dhcp.stateful=true when DHCPv6 is enabled",
            ));
        }

        let uplink_ingress_mode = IngressMode::parse(
            opts.get("uplink.ovn.ingress_mode").map(|s| s.as_str()).unwrap_or(""),
        )?;

        if ipv4.nat_address_v4.is_some() && uplink_ingress_mode != IngressMode::Routed {
            return Err(CoreError::invalid_config(
                "ipv4.nat.address requires uplink ovn.ingress_mode=routed",
            ));
        }
        if ipv6.nat_address_v6.is_some() && uplink_ingress_mode != IngressMode::Routed {
            return Err(CoreError::invalid_config(
                "ipv6.nat.address requires uplink ovn.ingress_mode=routed",
            ));
        }

        let bridge_mtu = opts
            .get("bridge.mtu")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| CoreError::invalid_config("invalid bridge.mtu"))?;

        let router_mac = opts.get("bridge.hwaddr").cloned();

        let dns_domain = opts
            .get("dns.domain")
            .cloned()
            .unwrap_or_else(|| format!("{name}.{project}.lxd"));

        let acl_defaults = AclDefaults {
            ingress_action: opts
                .get("security.acls.default.ingress.action")
                .cloned()
                .unwrap_or_else(|| "reject".to_string()),
            ingress_logged: bool_opt(opts, "security.acls.default.ingress.logged", false),
            egress_action: opts
                .get("security.acls.default.egress.action")
                .cloned()
                .unwrap_or_else(|| "reject".to_string()),
            egress_logged: bool_opt(opts, "security.acls.default.egress.logged", false),
        };

        let acls = opts
            .get("security.acls")
            .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        let volatile = VolatileUplinkState {
            ipv4_address: opts
                .get("volatile.network.ipv4.address")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| CoreError::invalid_config("invalid volatile.network.ipv4.address"))?,
            ipv6_address: opts
                .get("volatile.network.ipv6.address")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| CoreError::invalid_config("invalid volatile.network.ipv6.address"))?,
        };

        Ok(NetworkConfig {
            id,
            project: project.to_string(),
            name: name.to_string(),
            uplink,
            ipv4,
            ipv6,
            bridge_mtu,
            router_mac,
            dns_domain,
            acl_defaults,
            acls,
            uplink_ingress_mode,
            volatile,
        })
    }

    /// Keys the user changed between two configurations, used by
    /// `NetworkProjection::Update` to decide which parts of setup must
    /// re-run (spec.md §4.8 Update).
    pub fn changed_keys(&self, new: &NetworkConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.uplink != new.uplink {
            changed.push("network");
        }
        if self.ipv4.address_v4 != new.ipv4.address_v4 {
            changed.push("ipv4.address");
        }
        if self.ipv6.address_v6 != new.ipv6.address_v6 {
            changed.push("ipv6.address");
        }
        if self.acls != new.acls {
            changed.push("security.acls");
        }
        changed
    }
}

fn bool_opt(opts: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    match opts.get(key).map(|s| s.as_str()) {
        Some("true") => true,
        Some("false") => false,
        _ => default,
    }
}

/// Project-level restrictions referenced throughout §3/§4.7/§4.8 ("the
/// project's allowed subnets"). Minimal shape: spec.md never defines the
/// full Project type (out of scope), only what ONO needs from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub restricted: bool,
    pub allowed_uplinks: Vec<String>,
    pub allowed_subnets_v4: Vec<Ipv4Net>,
    pub allowed_subnets_v6: Vec<Ipv6Net>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn single_allowed_uplink_is_adopted_when_network_key_absent() {
        let cfg = NetworkConfig::parse(
            NetworkId(7),
            "p1",
            "n1",
            &opts(&[("ipv4.address", "10.0.0.1/24")]),
            &["uplink1".to_string()],
        )
        .unwrap();
        assert_eq!(cfg.uplink, "uplink1");
    }

    #[test]
    fn ambiguous_uplink_without_explicit_choice_is_rejected() {
        let err = NetworkConfig::parse(
            NetworkId(7),
            "p1",
            "n1",
            &BTreeMap::new(),
            &["uplink1".to_string(), "uplink2".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn ipv6_prefix_shorter_than_64_is_rejected() {
        let err = NetworkConfig::parse(
            NetworkId(7),
            "p1",
            "n1",
            &opts(&[("network", "uplink1"), ("ipv6.address", "fd00::1/48")]),
            &["uplink1".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn l3only_v6_requires_stateful_dhcp() {
        let err = NetworkConfig::parse(
            NetworkId(7),
            "p1",
            "n1",
            &opts(&[
                ("network", "uplink1"),
                ("ipv6.address", "fd00::1/64"),
                ("ipv6.l3only", "true"),
                ("ipv6.dhcp", "true"),
            ]),
            &["uplink1".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn nat_address_requires_routed_uplink() {
        let err = NetworkConfig::parse(
            NetworkId(7),
            "p1",
            "n1",
            &opts(&[
                ("network", "uplink1"),
                ("ipv4.address", "10.0.0.1/24"),
                ("ipv4.nat.address", "10.1.0.99"),
            ]),
            &["uplink1".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));

        let ok = NetworkConfig::parse(
            NetworkId(7),
            "p1",
            "n1",
            &opts(&[
                ("network", "uplink1"),
                ("ipv4.address", "10.0.0.1/24"),
                ("ipv4.nat.address", "10.1.0.99"),
                ("uplink.ovn.ingress_mode", "routed"),
            ]),
            &["uplink1".to_string()],
        );
        assert!(ok.is_ok());
    }
}
