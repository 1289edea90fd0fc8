use crate::error::DiscoveryError;
use std::{cmp::Ordering, fmt, net::Ipv4Addr, str::FromStr};

pub const SUBNET_CLASS_A: Ipv4Addr = Ipv4Addr::new(255, 0, 0, 0);
pub const SUBNET_CLASS_B: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);
pub const SUBNET_CLASS_C: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Subnet arithmetic on plain IPv4 addresses.
pub trait Ipv4Ext: Sized {
    fn to_u32(self) -> u32;
    /// Next address, or `self` when already at `255.255.255.255`.
    fn increment(self) -> Self;
    /// Previous address, or `self` when already at `0.0.0.0`.
    fn decrement(self) -> Self;
    fn network_address(self, mask: Ipv4Addr) -> Self;
    fn broadcast_address(self, mask: Ipv4Addr) -> Self;
    fn is_on_same_subnet(self, other: Self, mask: Ipv4Addr) -> bool;
}

impl Ipv4Ext for Ipv4Addr {
    fn to_u32(self) -> u32 {
        u32::from(self)
    }

    fn increment(self) -> Self {
        u32::from(self).checked_add(1).map_or(self, Ipv4Addr::from)
    }

    fn decrement(self) -> Self {
        u32::from(self).checked_sub(1).map_or(self, Ipv4Addr::from)
    }

    fn network_address(self, mask: Ipv4Addr) -> Self {
        Ipv4Addr::from(u32::from(self) & u32::from(mask))
    }

    fn broadcast_address(self, mask: Ipv4Addr) -> Self {
        Ipv4Addr::from(u32::from(self) | !u32::from(mask))
    }

    fn is_on_same_subnet(self, other: Self, mask: Ipv4Addr) -> bool {
        self.network_address(mask) == other.network_address(mask)
    }
}

/// Converts a CIDR prefix length to a dotted mask.
pub fn mask_from_prefix(prefix_len: u8) -> Result<Ipv4Addr, DiscoveryError> {
    match prefix_len {
        0 => Ok(Ipv4Addr::UNSPECIFIED),
        1..=32 => Ok(Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len)))),
        _ => Err(DiscoveryError::InvalidSubnet(format!(
            "prefix length {prefix_len} is out of range"
        ))),
    }
}

/// Inclusive range of IPv4 addresses, iterated in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Range {
    pub lower: Ipv4Addr,
    pub upper: Ipv4Addr,
}

impl Ipv4Range {
    pub fn new(lower: Ipv4Addr, upper: Ipv4Addr) -> Self {
        Self { lower, upper }
    }

    pub fn len(&self) -> u64 {
        let (lower, upper) = (u64::from(self.lower.to_u32()), u64::from(self.upper.to_u32()));
        if lower > upper {
            0
        } else {
            upper - lower + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        (self.lower..=self.upper).contains(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.lower.to_u32()..=self.upper.to_u32()).map(Ipv4Addr::from)
    }
}

impl IntoIterator for Ipv4Range {
    type Item = Ipv4Addr;
    type IntoIter = std::iter::Map<std::ops::RangeInclusive<u32>, fn(u32) -> Ipv4Addr>;

    fn into_iter(self) -> Self::IntoIter {
        (self.lower.to_u32()..=self.upper.to_u32()).map(from_u32 as fn(u32) -> Ipv4Addr)
    }
}

fn from_u32(bits: u32) -> Ipv4Addr {
    Ipv4Addr::from(bits)
}

/// An IPv4 network given by any address inside it and its mask.
///
/// Two subnets compare equal when their network addresses match; the mask
/// is not part of the ordering.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Subnet {
    address: Ipv4Addr,
    mask: Ipv4Addr,
}

impl Ipv4Subnet {
    pub fn new(address: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, DiscoveryError> {
        let bits = mask.to_u32();
        // A valid mask is a run of ones followed by a run of zeros.
        if bits.leading_ones() + bits.trailing_zeros() != 32 {
            return Err(DiscoveryError::InvalidSubnet(format!(
                "{mask} is not a contiguous subnet mask"
            )));
        }
        Ok(Self { address, mask })
    }

    pub fn with_prefix(address: Ipv4Addr, prefix_len: u8) -> Result<Self, DiscoveryError> {
        Self::new(address, mask_from_prefix(prefix_len)?)
    }

    /// A /24 around `address`.
    pub fn class_c(address: Ipv4Addr) -> Self {
        Self {
            address,
            mask: SUBNET_CLASS_C,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.mask
    }

    pub fn prefix_len(&self) -> u8 {
        self.mask.to_u32().leading_ones() as u8
    }

    pub fn network_address(&self) -> Ipv4Addr {
        self.address.network_address(self.mask)
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        self.address.broadcast_address(self.mask)
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        address.is_on_same_subnet(self.address, self.mask)
    }

    /// Every address from the network address to the broadcast address.
    pub fn range(&self) -> Ipv4Range {
        Ipv4Range::new(self.network_address(), self.broadcast_address())
    }

    /// Assignable host addresses. Network and broadcast addresses are
    /// excluded except on /31 and /32 networks, which have none to spare.
    pub fn hosts(&self) -> Ipv4Range {
        if self.prefix_len() >= 31 {
            self.range()
        } else {
            Ipv4Range::new(
                self.network_address().increment(),
                self.broadcast_address().decrement(),
            )
        }
    }
}

impl PartialEq for Ipv4Subnet {
    fn eq(&self, other: &Self) -> bool {
        self.network_address() == other.network_address()
    }
}

impl Eq for Ipv4Subnet {}

impl PartialOrd for Ipv4Subnet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ipv4Subnet {
    fn cmp(&self, other: &Self) -> Ordering {
        self.network_address().cmp(&other.network_address())
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_address(), self.prefix_len())
    }
}

impl FromStr for Ipv4Subnet {
    type Err = DiscoveryError;

    /// Parses `a.b.c.d/nn`, `a.b.c.d/m.m.m.m`, or a bare address (class C).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DiscoveryError::InvalidSubnet(s.to_string());
        let (address, suffix) = match s.trim().split_once('/') {
            Some((address, suffix)) => (address, Some(suffix)),
            None => (s.trim(), None),
        };
        let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;

        match suffix {
            None => Ok(Self::class_c(address)),
            Some(suffix) if suffix.contains('.') => {
                Self::new(address, suffix.parse().map_err(|_| invalid())?)
            }
            Some(suffix) => Self::with_prefix(address, suffix.parse().map_err(|_| invalid())?),
        }
    }
}
