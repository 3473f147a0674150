//! IP address allocation and subnet validation — spec.md §4.7.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use ipnet::{Contains, IpNet};
use lxdovn_types::{CoreError, CoreResult};
use rand::seq::SliceRandom;
use rand::Rng;

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(value: u128, is_v4: bool) -> IpAddr {
    if is_v4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

/// `allocate(ranges, excluded) -> ip`: iterates each range in order,
/// walking its big-integer representation, and returns the first address
/// not in `excluded`. Ranges must each be entirely v4 or entirely v6.
pub fn allocate(ranges: &[(IpAddr, IpAddr)], excluded: &HashSet<IpAddr>) -> CoreResult<IpAddr> {
    for &(start, end) in ranges {
        if start.is_ipv4() != end.is_ipv4() {
            return Err(CoreError::invalid_config(
                "range start and end must be the same address family",
            ));
        }
        let is_v4 = start.is_ipv4();
        let mut cur = ip_to_u128(start);
        let last = ip_to_u128(end);
        while cur <= last {
            let candidate = u128_to_ip(cur, is_v4);
            if !excluded.contains(&candidate) {
                return Ok(candidate);
            }
            cur += 1;
        }
    }
    Err(CoreError::conflict(
        "no free address remains in the given ranges",
    ))
}

/// `validateExternalSubnet(uplinkRoutes, projectRestricted, ipNet)`.
pub fn validate_external_subnet(
    uplink_routes: &[IpNet],
    project_restricted: Option<&[IpNet]>,
    candidate: IpNet,
) -> CoreResult<()> {
    if let Some(restricted) = project_restricted {
        if !restricted.iter().any(|r| net_contains(r, &candidate)) {
            return Err(CoreError::invalid_config(format!(
                "{candidate} is not contained in any of the project's allowed subnets"
            )));
        }
    }
    if !uplink_routes.iter().any(|r| net_contains(r, &candidate)) {
        return Err(CoreError::invalid_config(format!(
            "{candidate} is not contained in any of the uplink's routed subnets"
        )));
    }
    Ok(())
}

fn net_contains(outer: &IpNet, inner: &IpNet) -> bool {
    match (outer, inner) {
        (IpNet::V4(o), IpNet::V4(i)) => {
            o.contains(&i.network()) && i.prefix_len() >= o.prefix_len()
        }
        (IpNet::V6(o), IpNet::V6(i)) => {
            o.contains(&i.network()) && i.prefix_len() >= o.prefix_len()
        }
        _ => false,
    }
}

fn family_matches(net: &IpNet, want_v4: bool) -> bool {
    matches!(net, IpNet::V4(_)) == want_v4
}

fn random_address_in(net: &IpNet, rng: &mut impl Rng) -> IpAddr {
    match net {
        IpNet::V4(n) => {
            let base = u32::from(n.network());
            let host_bits = 32 - n.prefix_len();
            let span: u32 = if host_bits == 0 {
                0
            } else {
                (1u64 << host_bits) as u32 - 1
            };
            let offset = if span == 0 { 0 } else { rng.gen_range(0..=span) };
            IpAddr::V4(Ipv4Addr::from(base.wrapping_add(offset)))
        }
        IpNet::V6(n) => {
            let base = u128::from(n.network());
            let host_bits = 128 - n.prefix_len();
            let span: u128 = if host_bits == 0 {
                0
            } else if host_bits >= 127 {
                u128::MAX
            } else {
                (1u128 << host_bits) - 1
            };
            let offset: u128 = if span == 0 {
                0
            } else {
                rng.gen_range(0..=span)
            };
            IpAddr::V6(Ipv6Addr::from(base.wrapping_add(offset)))
        }
    }
}

fn single_address_net(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(v4) => IpNet::new(IpAddr::V4(v4), 32).expect("valid /32"),
        IpAddr::V6(v6) => IpNet::new(IpAddr::V6(v6), 128).expect("valid /128"),
    }
}

/// `randomExternal(ctx, version, uplinkRoutes, projectRestricted, validator)
/// -> cidr`. Candidate pools are the restricted subnets if the project is
/// restricted, else the uplink's routed subnets, filtered to the requested
/// family. Pools are tried in random order with the deadline divided
/// equally across them; within a pool, addresses are sampled at random and
/// checked by `validator` until one is accepted or the pool's time share
/// runs out.
pub async fn random_external(
    want_v4: bool,
    uplink_routes: &[IpNet],
    project_restricted: Option<&[IpNet]>,
    deadline: Duration,
    mut validator: impl FnMut(IpNet) -> bool,
) -> CoreResult<IpNet> {
    let source: &[IpNet] = project_restricted.unwrap_or(uplink_routes);
    let mut pools: Vec<IpNet> = source
        .iter()
        .copied()
        .filter(|n| family_matches(n, want_v4))
        .collect();

    if pools.is_empty() {
        return Err(CoreError::invalid_config(
            "no candidate subnet available for the requested address family",
        ));
    }

    let mut rng = rand::thread_rng();
    pools.shuffle(&mut rng);

    let per_pool = deadline / pools.len() as u32;

    for pool in pools {
        let pool_deadline = tokio::time::Instant::now() + per_pool;
        let host_bits: u32 = match pool {
            IpNet::V4(n) => 32 - n.prefix_len() as u32,
            IpNet::V6(n) => 128 - n.prefix_len() as u32,
        };
        let attempts_cap: u64 = 1u64 << host_bits.min(20);

        let mut attempts = 0u64;
        while tokio::time::Instant::now() < pool_deadline && attempts < attempts_cap.max(64) {
            let candidate = random_address_in(&pool, &mut rng);
            let candidate_net = single_address_net(candidate);
            if validator(candidate_net) {
                return Ok(candidate_net);
            }
            attempts += 1;
            tokio::task::yield_now().await;
        }
    }

    Err(CoreError::Transient(
        "no acceptable address found before the deadline across all candidate pools".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn allocate_returns_first_free_address() {
        let ranges = vec![(
            IpAddr::from_str("10.0.0.1").unwrap(),
            IpAddr::from_str("10.0.0.5").unwrap(),
        )];
        let mut excluded = HashSet::new();
        excluded.insert(IpAddr::from_str("10.0.0.1").unwrap());
        excluded.insert(IpAddr::from_str("10.0.0.2").unwrap());
        let ip = allocate(&ranges, &excluded).unwrap();
        assert_eq!(ip, IpAddr::from_str("10.0.0.3").unwrap());
    }

    #[test]
    fn allocate_falls_through_to_next_range_when_exhausted() {
        let ranges = vec![
            (
                IpAddr::from_str("10.0.0.1").unwrap(),
                IpAddr::from_str("10.0.0.1").unwrap(),
            ),
            (
                IpAddr::from_str("10.0.1.1").unwrap(),
                IpAddr::from_str("10.0.1.2").unwrap(),
            ),
        ];
        let mut excluded = HashSet::new();
        excluded.insert(IpAddr::from_str("10.0.0.1").unwrap());
        let ip = allocate(&ranges, &excluded).unwrap();
        assert_eq!(ip, IpAddr::from_str("10.0.1.1").unwrap());
    }

    #[test]
    fn allocate_errors_when_all_ranges_exhausted() {
        let ranges = vec![(
            IpAddr::from_str("10.0.0.1").unwrap(),
            IpAddr::from_str("10.0.0.1").unwrap(),
        )];
        let mut excluded = HashSet::new();
        excluded.insert(IpAddr::from_str("10.0.0.1").unwrap());
        assert!(allocate(&ranges, &excluded).is_err());
    }

    #[test]
    fn allocate_works_uniformly_for_v6() {
        let ranges = vec![(
            IpAddr::from_str("2001:db8::1").unwrap(),
            IpAddr::from_str("2001:db8::5").unwrap(),
        )];
        let excluded = HashSet::new();
        let ip = allocate(&ranges, &excluded).unwrap();
        assert_eq!(ip, IpAddr::from_str("2001:db8::1").unwrap());
    }

    #[test]
    fn validate_external_subnet_requires_uplink_containment() {
        let uplink_routes = vec![IpNet::from_str("203.0.113.0/24").unwrap()];
        let candidate = IpNet::from_str("198.51.100.0/28").unwrap();
        assert!(validate_external_subnet(&uplink_routes, None, candidate).is_err());
    }

    #[test]
    fn validate_external_subnet_requires_project_restriction_containment() {
        let uplink_routes = vec![IpNet::from_str("203.0.113.0/24").unwrap()];
        let restricted = vec![IpNet::from_str("203.0.113.0/28").unwrap()];
        let candidate = IpNet::from_str("203.0.113.64/28").unwrap();
        assert!(validate_external_subnet(&uplink_routes, Some(&restricted), candidate).is_err());
    }

    #[test]
    fn validate_external_subnet_accepts_contained_candidate() {
        let uplink_routes = vec![IpNet::from_str("203.0.113.0/24").unwrap()];
        let candidate = IpNet::from_str("203.0.113.16/28").unwrap();
        assert!(validate_external_subnet(&uplink_routes, None, candidate).is_ok());
    }

    #[tokio::test]
    async fn random_external_returns_address_accepted_by_validator() {
        let uplink_routes = vec![IpNet::from_str("203.0.113.0/28").unwrap()];
        let result = random_external(
            true,
            &uplink_routes,
            None,
            Duration::from_millis(200),
            |_net| true,
        )
        .await
        .unwrap();
        assert!(matches!(result, IpNet::V4(_)));
    }

    #[tokio::test]
    async fn random_external_times_out_when_validator_never_accepts() {
        let uplink_routes = vec![IpNet::from_str("203.0.113.0/28").unwrap()];
        let result = random_external(
            true,
            &uplink_routes,
            None,
            Duration::from_millis(50),
            |_net| false,
        )
        .await;
        assert!(result.is_err());
    }
}
