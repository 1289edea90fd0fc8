use crate::{addr::MacAddress, error::DiscoveryError};
use regex::Regex;
use std::{net::Ipv4Addr, sync::LazyLock};

static IPV4_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([0-9]{1,3})\.([0-9]{1,3})\.([0-9]{1,3})\.([0-9]{1,3})\b")
        .expect("IPv4 pattern is valid")
});

// One delimiter style per address: all colons, all dashes, or none.
static MAC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:[0-9a-f]{1,2}(?::[0-9a-f]{1,2}){5}|[0-9a-f]{1,2}(?:-[0-9a-f]{1,2}){5}|[0-9a-f]{12})$",
    )
    .expect("MAC pattern is valid")
});

/// Extracts the IPv4 and hardware address from one line of ARP table output.
///
/// Handles the common layouts:
/// - `? (192.168.1.1) at aa:bb:cc:dd:ee:ff [ether] on eth0` (Linux/BSD `arp -a`)
/// - `  192.168.1.1     aa-bb-cc-dd-ee-ff     dynamic` (Windows `arp -a`)
/// - `192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE` (`ip neigh`)
///
/// Returns `Ok(None)` when the line lacks either address, and an error when
/// a matched token does not hold a valid address.
pub fn parse_arp_line(line: &str) -> Result<Option<(Ipv4Addr, MacAddress)>, DiscoveryError> {
    let Some(ip_text) = IPV4_PATTERN.find(line).map(|m| m.as_str()) else {
        return Ok(None);
    };

    let mac_text = line
        .split_whitespace()
        .map(|token| token.trim_matches(|c| matches!(c, '(' | ')' | '[' | ']' | ',')))
        .find(|token| MAC_PATTERN.is_match(token));
    let Some(mac_text) = mac_text else {
        return Ok(None);
    };

    let ip_address = ip_text
        .parse::<Ipv4Addr>()
        .map_err(|_| DiscoveryError::InvalidAddress(ip_text.to_string()))?;
    let physical_address = mac_text.parse::<MacAddress>()?;

    Ok(Some((ip_address, physical_address)))
}
