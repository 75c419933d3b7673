//! # ip-range
//!
//! Address arithmetic every allocation check is built from. Addresses are
//! mapped onto `u128` keys so v4 and v6 share one ordering, but any
//! comparison between the two families is refused with
//! [`RangeError::MixedFamily`] instead of being coerced.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{
    cmp::Ordering,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("cannot compare {a} with {b}: address families differ")]
    MixedFamily { a: IpAddr, b: IpAddr },
    #[error("range start {begin} is after range end {end}")]
    Inverted { begin: IpAddr, end: IpAddr },
    #[error("invalid ip address {0:?}")]
    InvalidAddress(String),
    #[error("template {name} has no capacity")]
    EmptyTemplate { name: String },
    #[error("template {name} does not fit in subnet {subnet}")]
    TemplateOutsideSubnet { name: String, subnet: IpNet },
}

pub type Result<T> = std::result::Result<T, RangeError>;

/// address family of a subnet, range or address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// numeric key of an address, only meaningful next to keys of the same family
pub fn addr_key(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(ip) => u32::from(ip) as u128,
        IpAddr::V6(ip) => u128::from(ip),
    }
}

/// inverse of [`addr_key`], `None` if the key does not fit in `family`
pub fn from_key(family: Family, key: u128) -> Option<IpAddr> {
    match family {
        Family::V4 => u32::try_from(key).ok().map(|k| Ipv4Addr::from(k).into()),
        Family::V6 => Some(Ipv6Addr::from(key).into()),
    }
}

pub fn parse_addr(s: &str) -> Result<IpAddr> {
    s.trim()
        .parse()
        .map_err(|_| RangeError::InvalidAddress(s.to_owned()))
}

/// total order of two addresses of the same family
pub fn compare(a: IpAddr, b: IpAddr) -> Result<Ordering> {
    same_family(a, b)?;
    Ok(addr_key(a).cmp(&addr_key(b)))
}

fn same_family(a: IpAddr, b: IpAddr) -> Result<()> {
    if Family::of(&a) == Family::of(&b) {
        Ok(())
    } else {
        Err(RangeError::MixedFamily { a, b })
    }
}

/// `true` if `ip` is inside `net`
pub fn cidr_contains(net: &IpNet, ip: IpAddr) -> Result<bool> {
    same_family(net.network(), ip)?;
    Ok(net.contains(&ip))
}

/// An inclusive `[begin, end]` range of one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct IpRange {
    begin: IpAddr,
    end: IpAddr,
}

/// wire form of [`IpRange`], checked by [`IpRange::new`] on the way in
#[derive(Deserialize)]
struct RawRange {
    begin: IpAddr,
    end: IpAddr,
}

impl TryFrom<RawRange> for IpRange {
    type Error = RangeError;

    fn try_from(raw: RawRange) -> Result<Self> {
        Self::new(raw.begin, raw.end)
    }
}

impl IpRange {
    pub fn new(begin: IpAddr, end: IpAddr) -> Result<Self> {
        if compare(begin, end)? == Ordering::Greater {
            return Err(RangeError::Inverted { begin, end });
        }
        Ok(Self { begin, end })
    }

    pub fn parse(begin: &str, end: &str) -> Result<Self> {
        Self::new(parse_addr(begin)?, parse_addr(end)?)
    }

    pub fn single(ip: IpAddr) -> Self {
        Self { begin: ip, end: ip }
    }

    pub fn begin(&self) -> IpAddr {
        self.begin
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    pub fn family(&self) -> Family {
        Family::of(&self.begin)
    }

    pub fn contains(&self, ip: IpAddr) -> Result<bool> {
        same_family(self.begin, ip)?;
        let key = addr_key(ip);
        Ok(addr_key(self.begin) <= key && key <= addr_key(self.end))
    }

    /// `max(begin_a, begin_b) <= min(end_a, end_b)`
    pub fn overlaps(&self, other: &IpRange) -> Result<bool> {
        same_family(self.begin, other.begin)?;
        let begin = addr_key(self.begin).max(addr_key(other.begin));
        let end = addr_key(self.end).min(addr_key(other.end));
        Ok(begin <= end)
    }

    /// number of addresses in the range; the full v6 space saturates
    pub fn size(&self) -> u128 {
        addr_key(self.end)
            .abs_diff(addr_key(self.begin))
            .saturating_add(1)
    }

    /// [`IpRange::size`] clamped into `u64`
    pub fn capacity(&self) -> u64 {
        u64::try_from(self.size()).unwrap_or(u64::MAX)
    }

    /// `true` if both ends are inside `net`
    pub fn within(&self, net: &IpNet) -> Result<bool> {
        Ok(cidr_contains(net, self.begin)? && cidr_contains(net, self.end)?)
    }
}

impl From<IpNet> for IpRange {
    fn from(net: IpNet) -> Self {
        Self {
            begin: net.network(),
            end: net.broadcast(),
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.begin, self.end)
    }
}

/// A named pool shape expressed relative to a subnet's network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTemplate {
    pub name: String,
    pub begin_offset: u64,
    pub capacity: u64,
}

impl PoolTemplate {
    /// resolve the template against `net`, the result must fit inside `net`
    pub fn expand(&self, net: &IpNet) -> Result<IpRange> {
        if self.capacity == 0 {
            return Err(RangeError::EmptyTemplate {
                name: self.name.clone(),
            });
        }
        let outside = || RangeError::TemplateOutsideSubnet {
            name: self.name.clone(),
            subnet: *net,
        };
        let family = Family::of_net(net);
        let begin = addr_key(net.network())
            .checked_add(self.begin_offset as u128)
            .ok_or_else(outside)?;
        let end = begin
            .checked_add(self.capacity as u128 - 1)
            .ok_or_else(outside)?;
        let range = IpRange::new(
            from_key(family, begin).ok_or_else(outside)?,
            from_key(family, end).ok_or_else(outside)?,
        )?;
        if !range.within(net)? {
            return Err(outside());
        }
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(begin: &str, end: &str) -> IpRange {
        IpRange::parse(begin, end).unwrap()
    }

    #[test]
    fn keys_order_addresses() {
        let a = parse_addr("10.0.0.9").unwrap();
        let b = parse_addr("10.0.0.10").unwrap();
        assert_eq!(compare(a, b).unwrap(), Ordering::Less);
        assert!(addr_key(a) < addr_key(b));
        assert_eq!(from_key(Family::V4, addr_key(b)), Some(b));
        assert_eq!(from_key(Family::V4, u32::MAX as u128 + 1), None);
    }

    #[test]
    fn mixed_family_is_an_error() {
        let v4 = parse_addr("10.0.0.1").unwrap();
        let v6 = parse_addr("::a00:1").unwrap();
        // same key, different family
        assert_eq!(addr_key(v4), addr_key(v6));
        assert!(matches!(
            compare(v4, v6),
            Err(RangeError::MixedFamily { .. })
        ));
        assert!(r("10.0.0.0", "10.0.0.255").contains(v6).is_err());
        assert!(
            r("10.0.0.0", "10.0.0.255")
                .overlaps(&r("::", "::ffff"))
                .is_err()
        );
        assert!(IpRange::parse("10.0.0.1", "::1").is_err());
    }

    #[test]
    fn inverted_and_garbage_rejected() {
        assert!(matches!(
            IpRange::parse("10.0.0.9", "10.0.0.1"),
            Err(RangeError::Inverted { .. })
        ));
        assert!(matches!(
            IpRange::parse("10.0.0.300", "10.0.0.1"),
            Err(RangeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn overlap_edges() {
        let a = r("10.0.0.10", "10.0.0.100");
        assert!(a.overlaps(&r("10.0.0.100", "10.0.0.200")).unwrap());
        assert!(a.overlaps(&r("10.0.0.50", "10.0.0.50")).unwrap());
        assert!(a.overlaps(&r("10.0.0.0", "10.0.0.255")).unwrap());
        assert!(!a.overlaps(&r("10.0.0.101", "10.0.0.200")).unwrap());
        assert!(!a.overlaps(&r("10.0.0.1", "10.0.0.9")).unwrap());
    }

    #[test]
    fn sizes() {
        assert_eq!(r("10.0.0.10", "10.0.0.100").size(), 91);
        assert_eq!(r("10.0.0.10", "10.0.0.10").capacity(), 1);
        let v6: IpRange = "2001:db8::/64".parse::<IpNet>().unwrap().into();
        assert_eq!(v6.size(), 1u128 << 64);
        assert_eq!(v6.capacity(), u64::MAX);
        assert_eq!(r("::", "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff").size(), u128::MAX);
    }

    #[test]
    fn deserialize_checks_the_range() {
        let ok: IpRange =
            serde_json::from_str(r#"{"begin":"10.0.0.1","end":"10.0.0.9"}"#).unwrap();
        assert_eq!(ok, r("10.0.0.1", "10.0.0.9"));
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"begin":"10.0.0.1","end":"10.0.0.9"}"#);

        let inverted = serde_json::from_str::<IpRange>(r#"{"begin":"10.0.0.9","end":"10.0.0.1"}"#);
        assert!(inverted.unwrap_err().to_string().contains("is after range end"));
        let mixed = serde_json::from_str::<IpRange>(r#"{"begin":"10.0.0.1","end":"::1"}"#);
        assert!(mixed.unwrap_err().to_string().contains("address families differ"));
    }

    #[test]
    fn cidr_containment() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        assert!(cidr_contains(&net, parse_addr("10.0.0.255").unwrap()).unwrap());
        assert!(!cidr_contains(&net, parse_addr("10.0.1.0").unwrap()).unwrap());
        assert!(cidr_contains(&net, parse_addr("::1").unwrap()).is_err());
        assert!(r("10.0.0.10", "10.0.0.100").within(&net).unwrap());
        assert!(!r("10.0.0.10", "10.0.1.100").within(&net).unwrap());
    }

    #[test]
    fn template_expansion() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        let tpl = PoolTemplate {
            name: "office".into(),
            begin_offset: 10,
            capacity: 91,
        };
        assert_eq!(tpl.expand(&net).unwrap(), r("10.0.0.10", "10.0.0.100"));

        let too_big = PoolTemplate {
            capacity: 300,
            ..tpl.clone()
        };
        assert!(matches!(
            too_big.expand(&net),
            Err(RangeError::TemplateOutsideSubnet { .. })
        ));
        let empty = PoolTemplate { capacity: 0, ..tpl };
        assert!(matches!(
            empty.expand(&net),
            Err(RangeError::EmptyTemplate { .. })
        ));

        let net6: IpNet = "2001:db8::/64".parse().unwrap();
        let tpl6 = PoolTemplate {
            name: "v6".into(),
            begin_offset: 0x100,
            capacity: 0x100,
        };
        assert_eq!(tpl6.expand(&net6).unwrap(), r("2001:db8::100", "2001:db8::1ff"));
    }
}
