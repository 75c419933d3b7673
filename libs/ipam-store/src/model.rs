//! rows of the address-space tables
use std::{fmt, net::IpAddr, str::FromStr};

use chrono::{DateTime, Utc};
use ip_range::{Family, IpRange};
use ipnet::{IpNet, Ipv6Net};
use serde::{Deserialize, Serialize};
use upstream::{Lease, LeaseState, LeaseType};

/// row id, assigned by the store on insert
pub type Id = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: Id,
    pub subnet: IpNet,
    /// sum of the capacity of the subnet's pools
    pub capacity: u64,
}

impl Subnet {
    pub fn family(&self) -> Family {
        Family::of_net(&self.subnet)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subnet {} ({})", self.id, self.subnet)
    }
}

/// administrative settings of a pool, the only part an update may change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    #[serde(default)]
    pub routers: Vec<IpAddr>,
    #[serde(default)]
    pub domain_servers: Vec<IpAddr>,
    pub client_class: Option<String>,
    pub comment: Option<String>,
}

/// dynamic allocation range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: Id,
    pub subnet_id: Id,
    pub range: IpRange,
    /// range size minus reserved addresses inside the range
    pub capacity: u64,
    /// name of the template the range was expanded from
    pub template: Option<String>,
    pub options: PoolOptions,
}

impl Pool {
    pub fn family(&self) -> Family {
        self.range.family()
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == 0 {
            write!(f, "pool {}", self.range)
        } else {
            write!(f, "pool {} ({})", self.id, self.range)
        }
    }
}

/// administratively excluded range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedPool {
    pub id: Id,
    pub subnet_id: Id,
    pub range: IpRange,
    pub comment: Option<String>,
}

impl fmt::Display for ReservedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reserved pool {} ({})", self.id, self.range)
    }
}

/// v6 prefix delegation range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdPool {
    pub id: Id,
    pub subnet_id: Id,
    pub prefix: Ipv6Net,
    /// length of the prefixes handed to clients
    pub delegated_len: u8,
}

impl PdPool {
    pub fn range(&self) -> IpRange {
        IpNet::V6(self.prefix).into()
    }
}

impl fmt::Display for PdPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pd pool {} ({}/{})", self.id, self.prefix, self.delegated_len)
    }
}

/// who a reservation or static address belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ClientIdentity {
    HwAddress(String),
    Duid(String),
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::HwAddress(hw) => write!(f, "hw-address {hw}"),
            ClientIdentity::Duid(duid) => write!(f, "duid {duid}"),
        }
    }
}

/// fixed addresses (and for v6, prefixes) bound to one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Id,
    pub subnet_id: Id,
    pub identity: ClientIdentity,
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub prefixes: Vec<Ipv6Net>,
}

impl Reservation {
    pub fn capacity(&self) -> u64 {
        (self.addresses.len() + self.prefixes.len()) as u64
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reservation {} ({})", self.id, self.identity)
    }
}

/// address managed outside the pool model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAddress {
    pub id: Id,
    pub subnet_id: Id,
    pub address: IpAddr,
    pub identity: ClientIdentity,
}

impl fmt::Display for StaticAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "static address {} ({})", self.id, self.address)
    }
}

/// how an address is accounted for in its subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    Reservation,
    Dynamic,
    Reserve,
    Exclusion,
}

impl AddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::Reservation => "reservation",
            AddressType::Dynamic => "dynamic",
            AddressType::Reserve => "reserve",
            AddressType::Exclusion => "exclusion",
        }
    }
}

impl FromStr for AddressType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "reservation" => AddressType::Reservation,
            "dynamic" => AddressType::Dynamic,
            "reserve" => AddressType::Reserve,
            "exclusion" => AddressType::Exclusion,
            other => return Err(format!("unknown address type {other:?}")),
        })
    }
}

/// a lease last seen for a subnet, kept until the authority stops reporting it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetLease {
    pub id: Id,
    pub subnet_id: Id,
    pub address: IpAddr,
    pub hw_address: Option<String>,
    pub duid: Option<String>,
    pub client_id: Option<String>,
    pub expire: DateTime<Utc>,
    pub lease_type: LeaseType,
    pub state: LeaseState,
    pub hostname: Option<String>,
    pub address_type: AddressType,
}

impl SubnetLease {
    /// a view of `lease`, not yet stored (`id` is 0)
    pub fn from_lease(subnet_id: Id, lease: &Lease, address_type: AddressType) -> Self {
        Self {
            id: 0,
            subnet_id,
            address: lease.address,
            hw_address: lease.hw_address.clone(),
            duid: lease.duid.clone(),
            client_id: lease.client_id.clone(),
            expire: lease.expire,
            lease_type: lease.lease_type,
            state: lease.state,
            hostname: lease.hostname.clone(),
            address_type,
        }
    }

    /// `true` if every field the authority reports matches
    pub fn same_as(&self, lease: &Lease) -> bool {
        self.address == lease.address
            && self.expire == lease.expire
            && self.hw_address == lease.hw_address
            && self.duid == lease.duid
            && self.client_id == lease.client_id
            && self.lease_type == lease.lease_type
            && self.state == lease.state
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn lease() -> Lease {
        Lease {
            address: "10.0.0.20".parse().unwrap(),
            hw_address: Some("aa:bb:cc:dd:ee:ff".into()),
            duid: None,
            client_id: Some("01aabbccddeeff".into()),
            expire: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            lease_type: LeaseType::V4,
            state: LeaseState::Default,
            hostname: Some("printer".into()),
        }
    }

    #[test]
    fn comparable_fields() {
        let live = lease();
        let mut cached = SubnetLease::from_lease(1, &live, AddressType::Dynamic);
        assert!(cached.same_as(&live));

        // hostname is informational
        cached.hostname = None;
        assert!(cached.same_as(&live));

        cached.expire = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        assert!(!cached.same_as(&live));
    }

    #[test]
    fn reservation_capacity_counts_addresses_and_prefixes() {
        let r = Reservation {
            id: 1,
            subnet_id: 1,
            identity: ClientIdentity::Duid("000300011c".into()),
            addresses: vec!["2001:db8::10".parse().unwrap()],
            prefixes: vec!["2001:db8:1::/56".parse().unwrap()],
        };
        assert_eq!(r.capacity(), 2);
        assert_eq!(r.to_string(), "reservation 1 (duid 000300011c)");
    }

    #[test]
    fn address_type_strings() {
        for t in [
            AddressType::Reservation,
            AddressType::Dynamic,
            AddressType::Reserve,
            AddressType::Exclusion,
        ] {
            assert_eq!(t.as_str().parse::<AddressType>().unwrap(), t);
        }
    }
}
