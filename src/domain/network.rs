//! Heuristics over the origin address.
//!
//! These rules only look at the address itself and at attribution the caller
//! supplies; no lookups happen here.

use crate::domain::context::NetworkInfo;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Organisation name fragments of well-known hosting providers.
pub const DEFAULT_HOSTING_PATTERNS: &[&str] = &[
    "amazon",
    "aws",
    "google cloud",
    "microsoft",
    "azure",
    "digitalocean",
    "ovh",
    "hetzner",
    "linode",
    "akamai",
    "vultr",
    "choopa",
    "contabo",
    "scaleway",
    "leaseweb",
    "m247",
    "datacamp",
    "hosting",
    "datacenter",
    "data center",
    "server",
    "vps",
];

/// ASNs of well-known hosting providers.
pub const DEFAULT_HOSTING_ASNS: &[u32] = &[
    16509,  // Amazon
    14618,  // Amazon
    15169,  // Google
    396982, // Google Cloud
    8075,   // Microsoft
    14061,  // DigitalOcean
    16276,  // OVH
    24940,  // Hetzner
    63949,  // Linode / Akamai
    20473,  // Vultr / Choopa
    51167,  // Contabo
    12876,  // Scaleway
    60781,  // Leaseweb
    9009,   // M247
    60068,  // Datacamp
];

/// Whether the address is private, reserved or otherwise not publicly routable.
pub fn is_private_or_reserved(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_reserved_v4(mapped);
            }
            is_reserved_v6(v6)
        }
    }
}

fn is_reserved_v4(addr: Ipv4Addr) -> bool {
    let [a, b, c, _] = addr.octets();
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_multicast()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
        // 192.0.0.0/24 IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b == 18 || b == 19))
        // 240.0.0.0/4 reserved
        || a >= 240
}

fn is_reserved_v6(addr: Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && addr.segments()[1] == 0x0db8)
}

/// Whether the address falls in any of `ranges`.
pub fn in_ranges(addr: IpAddr, ranges: &[IpNet]) -> bool {
    let addr = match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    };
    ranges.iter().any(|net| net.contains(&addr))
}

/// Whether the attribution points at a hosting provider.
pub fn is_datacenter(info: &NetworkInfo, asns: &[u32], patterns: &[String]) -> bool {
    if let Some(asn) = info.asn {
        if asns.contains(&asn) {
            return true;
        }
    }

    match &info.organization {
        Some(org) => {
            let org = org.to_lowercase();
            patterns
                .iter()
                .any(|pattern| !pattern.is_empty() && org.contains(pattern.as_str()))
        }
        None => false,
    }
}
