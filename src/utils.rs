//! Utility functions for handling domain names.
//!
//! This module provides helpers for normalizing names, matching names against
//! zones and converting between IPv4 addresses and reverse-zone names.

use std::net::Ipv4Addr;

/// Suffix of the IPv4 reverse mapping tree.
pub const REVERSE_SUFFIX: &str = "in-addr.arpa";

/// Normalize a domain name for comparison.
///
/// Lowercases the name and strips any trailing dot, so `Host1.Example.com.`
/// and `host1.example.com` compare equal.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Return the name in fully qualified form (with a trailing dot).
pub fn fqdn(name: &str) -> String {
    let mut name = name.trim_end_matches('.').to_string();
    name.push('.');
    name
}

/// Check whether `name` lies within `zone`.
///
/// The zone apex itself counts as inside the zone. Matching is label-aware:
/// `badexample.com` is not inside `example.com`.
pub fn in_zone(name: &str, zone: &str) -> bool {
    let name = normalize_name(name);
    let zone = normalize_name(zone.trim_start_matches('.'));
    if zone.is_empty() {
        return true;
    }
    name == zone
        || name
            .strip_suffix(&zone)
            .map_or(false, |prefix| prefix.ends_with('.'))
}

/// Qualify a `Name` tag value into a hostname within `zone`.
///
/// When `includes_domain` is set the tag already carries the full hostname
/// and is returned normalized only if it lies within the zone. Otherwise the
/// tag is a bare label and the zone is appended.
pub fn qualify_name(tag: &str, zone: &str, includes_domain: bool) -> Option<String> {
    let tag = normalize_name(tag);
    if tag.is_empty() {
        return None;
    }
    if includes_domain {
        return in_zone(&tag, zone).then_some(tag);
    }
    let zone = normalize_name(zone.trim_start_matches('.'));
    if zone.is_empty() {
        Some(tag)
    } else {
        Some(format!("{}.{}", tag, zone))
    }
}

/// Build the reverse-zone name for an IPv4 address.
///
/// `10.0.0.5` becomes `5.0.0.10.in-addr.arpa`.
pub fn reverse_name(addr: Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{}.{}.{}.{}.{}", d, c, b, a, REVERSE_SUFFIX)
}

/// Parse a reverse-zone name back into the IPv4 address it names.
///
/// Returns `None` for anything that is not a complete four-octet
/// `in-addr.arpa` name.
pub fn parse_reverse_name(name: &str) -> Option<Ipv4Addr> {
    let name = normalize_name(name);
    let labels = name.strip_suffix(REVERSE_SUFFIX)?.strip_suffix('.')?;

    let mut octets = [0u8; 4];
    let mut count = 0;
    for label in labels.rsplit('.') {
        if count == 4 {
            return None;
        }
        octets[count] = label.parse().ok()?;
        count += 1;
    }

    (count == 4).then(|| Ipv4Addr::from(octets))
}
