//! A subnet and everything allocated in it, read inside the transaction that
//! is about to change it. Every check runs against this snapshot, never
//! against rows handed in by a caller.
use std::{fmt::Display, net::IpAddr};

use ip_range::{IpRange, cidr_contains};
use ipam_store::{
    Id, PdPool, Pool, Reservation, ReservedPool, StaticAddress, Subnet, Transaction,
};
use ipnet::IpNet;

use crate::AllocError;

#[derive(Debug)]
pub(crate) struct SubnetState {
    pub(crate) subnet: Subnet,
    pub(crate) pools: Vec<Pool>,
    pub(crate) pd_pools: Vec<PdPool>,
    pub(crate) reserved_pools: Vec<ReservedPool>,
    pub(crate) reservations: Vec<Reservation>,
    pub(crate) statics: Vec<StaticAddress>,
}

impl SubnetState {
    pub(crate) async fn load<T: Transaction>(
        tx: &mut T,
        subnet_id: Id,
    ) -> Result<Self, AllocError<T::Error>> {
        let subnet = tx
            .subnet(subnet_id)
            .await?
            .ok_or(AllocError::NotFound {
                kind: "subnet",
                id: subnet_id,
            })?;
        Ok(Self {
            pools: tx.pools(subnet_id).await?,
            pd_pools: tx.pd_pools(subnet_id).await?,
            reserved_pools: tx.reserved_pools(subnet_id).await?,
            reservations: tx.reservations(subnet_id).await?,
            statics: tx.static_addresses(subnet_id).await?,
            subnet,
        })
    }

    /// every address held by a reservation of this subnet
    pub(crate) fn reserved_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.reservations
            .iter()
            .flat_map(|r| r.addresses.iter().copied())
    }

    pub(crate) fn is_reserved(&self, ip: IpAddr) -> bool {
        self.reserved_addresses().any(|r| r == ip)
    }

    /// range size minus the reserved addresses inside it
    pub(crate) fn pool_capacity<E>(&self, range: &IpRange) -> Result<u64, AllocError<E>> {
        let reserved = count_in(range, self.reserved_addresses())?;
        Ok(range.capacity().saturating_sub(reserved))
    }

    fn in_subnet<E>(&self, ip: IpAddr, what: &dyn Display) -> Result<(), AllocError<E>> {
        let net = self.subnet.subnet;
        if ip_range::Family::of(&ip) != self.subnet.family() {
            return Err(AllocError::FamilyMismatch {
                subnet: net,
                resource: what.to_string(),
            });
        }
        if !cidr_contains(&net, ip).map_err(AllocError::InvalidRange)? {
            return Err(AllocError::OutsideSubnet {
                subnet: net,
                resource: what.to_string(),
            });
        }
        Ok(())
    }

    /// rules for a new dynamic pool
    pub(crate) fn check_pool<E>(&self, pool: &Pool) -> Result<(), AllocError<E>> {
        let net = self.subnet.subnet;
        // templated ranges were produced from the subnet itself
        if pool.template.is_none() && pool.family() != self.subnet.family() {
            return Err(AllocError::FamilyMismatch {
                subnet: net,
                resource: pool.to_string(),
            });
        }
        if !pool.range.within(&net).map_err(AllocError::InvalidRange)? {
            return Err(AllocError::OutsideSubnet {
                subnet: net,
                resource: pool.to_string(),
            });
        }
        if matches!(net, IpNet::V6(v6) if v6.prefix_len() != 64) {
            return Err(AllocError::PrefixLength {
                subnet: net,
                required: 64,
            });
        }
        for existing in &self.pools {
            if existing.id != pool.id
                && existing
                    .range
                    .overlaps(&pool.range)
                    .map_err(AllocError::InvalidRange)?
            {
                return Err(conflict(pool, existing));
            }
        }
        // a pool may neither start inside a delegated prefix nor span one
        for pd in &self.pd_pools {
            let pd_range = pd.range();
            if pd_range.family() == pool.family()
                && pd_range
                    .overlaps(&pool.range)
                    .map_err(AllocError::InvalidRange)?
            {
                return Err(conflict(pool, pd));
            }
        }
        for st in &self.statics {
            if pool
                .range
                .contains(st.address)
                .map_err(AllocError::InvalidRange)?
            {
                return Err(conflict(pool, st));
            }
        }
        Ok(())
    }

    /// rules shared by reservation and static addresses: right family, inside
    /// the subnet, not administratively reserved, not already taken
    pub(crate) fn check_fixed_address<E>(
        &self,
        ip: IpAddr,
        what: &dyn Display,
    ) -> Result<(), AllocError<E>> {
        self.in_subnet(ip, what)?;
        for rp in &self.reserved_pools {
            if rp.range.contains(ip).map_err(AllocError::InvalidRange)? {
                return Err(conflict(what, rp));
            }
        }
        if let Some(res) = self.reservations.iter().find(|r| r.addresses.contains(&ip)) {
            return Err(conflict(what, res));
        }
        if let Some(st) = self.statics.iter().find(|s| s.address == ip) {
            return Err(conflict(what, st));
        }
        Ok(())
    }

    /// a static address is managed outside the pools and may not sit in one
    pub(crate) fn check_static<E>(
        &self,
        ip: IpAddr,
        what: &dyn Display,
    ) -> Result<(), AllocError<E>> {
        self.check_fixed_address(ip, what)?;
        for pool in &self.pools {
            if pool.range.contains(ip).map_err(AllocError::InvalidRange)? {
                return Err(conflict(what, pool));
            }
        }
        Ok(())
    }

    pub(crate) fn check_reserved_pool<E>(&self, range: &IpRange) -> Result<(), AllocError<E>> {
        let what = format!("reserved pool {range}");
        self.in_subnet(range.begin(), &what)?;
        self.in_subnet(range.end(), &what)?;
        for rp in &self.reserved_pools {
            if rp.range.overlaps(range).map_err(AllocError::InvalidRange)? {
                return Err(conflict(&what, rp));
            }
        }
        for res in &self.reservations {
            if count_in(range, res.addresses.iter().copied())? > 0 {
                return Err(conflict(&what, res));
            }
        }
        for st in &self.statics {
            if range.contains(st.address).map_err(AllocError::InvalidRange)? {
                return Err(conflict(&what, st));
            }
        }
        Ok(())
    }

    pub(crate) fn check_pd_pool<E>(&self, pd: &PdPool) -> Result<(), AllocError<E>> {
        let what = format!("pd pool {}/{}", pd.prefix, pd.delegated_len);
        if !matches!(self.subnet.subnet, IpNet::V6(_)) {
            return Err(AllocError::FamilyMismatch {
                subnet: self.subnet.subnet,
                resource: what,
            });
        }
        if pd.delegated_len < pd.prefix.prefix_len() || pd.delegated_len > 128 {
            return Err(AllocError::InvalidDelegatedLength {
                prefix: pd.prefix,
                delegated_len: pd.delegated_len,
            });
        }
        let range = pd.range();
        for existing in &self.pd_pools {
            if existing
                .range()
                .overlaps(&range)
                .map_err(AllocError::InvalidRange)?
            {
                return Err(conflict(&what, existing));
            }
        }
        for pool in &self.pools {
            if pool.family() == range.family()
                && range
                    .overlaps(&pool.range)
                    .map_err(AllocError::InvalidRange)?
            {
                return Err(conflict(&what, pool));
            }
        }
        Ok(())
    }
}

/// number of `ips` inside `range`
pub(crate) fn count_in<E>(
    range: &IpRange,
    ips: impl IntoIterator<Item = IpAddr>,
) -> Result<u64, AllocError<E>> {
    let mut n = 0;
    for ip in ips {
        if range.contains(ip).map_err(AllocError::InvalidRange)? {
            n += 1;
        }
    }
    Ok(n)
}

fn conflict<E>(new: impl Display, existing: impl Display) -> AllocError<E> {
    AllocError::Conflict {
        new: new.to_string(),
        existing: existing.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use ipam_store::{ClientIdentity, PoolOptions};

    use super::*;

    type Err = AllocError<std::io::Error>;

    fn pool(id: Id, begin: &str, end: &str) -> Pool {
        Pool {
            id,
            subnet_id: 1,
            range: IpRange::parse(begin, end).unwrap(),
            capacity: 0,
            template: None,
            options: PoolOptions::default(),
        }
    }

    fn state(net: &str) -> SubnetState {
        SubnetState {
            subnet: Subnet {
                id: 1,
                subnet: net.parse().unwrap(),
                capacity: 0,
            },
            pools: vec![],
            pd_pools: vec![],
            reserved_pools: vec![],
            reservations: vec![],
            statics: vec![],
        }
    }

    #[test]
    fn pool_rules() {
        let mut st = state("10.0.0.0/24");
        st.pools.push(pool(1, "10.0.0.10", "10.0.0.100"));
        st.statics.push(StaticAddress {
            id: 2,
            subnet_id: 1,
            address: "10.0.0.200".parse().unwrap(),
            identity: ClientIdentity::HwAddress("aa:bb:cc:dd:ee:ff".into()),
        });

        assert!(st.check_pool::<std::io::Error>(&pool(0, "10.0.0.101", "10.0.0.150")).is_ok());

        let err: Err = st.check_pool(&pool(0, "10.0.0.100", "10.0.0.150")).unwrap_err();
        match err {
            AllocError::Conflict { new, existing } => {
                assert_eq!(new, "pool 10.0.0.100-10.0.0.150");
                assert_eq!(existing, "pool 1 (10.0.0.10-10.0.0.100)");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err: Err = st.check_pool(&pool(0, "10.0.0.150", "10.0.0.250")).unwrap_err();
        assert!(matches!(err, AllocError::Conflict { existing, .. } if existing.contains("static address")));

        let err: Err = st.check_pool(&pool(0, "10.0.1.1", "10.0.1.5")).unwrap_err();
        assert!(matches!(err, AllocError::OutsideSubnet { .. }));

        let err: Err = st.check_pool(&pool(0, "2001:db8::1", "2001:db8::5")).unwrap_err();
        assert!(matches!(err, AllocError::FamilyMismatch { .. }));
    }

    #[test]
    fn v6_pools_need_a_64() {
        let st = state("2001:db8::/56");
        let err: Err = st.check_pool(&pool(0, "2001:db8::10", "2001:db8::ff")).unwrap_err();
        assert!(matches!(err, AllocError::PrefixLength { required: 64, .. }));

        let st = state("2001:db8::/64");
        assert!(st.check_pool::<std::io::Error>(&pool(0, "2001:db8::10", "2001:db8::ff")).is_ok());
    }

    #[test]
    fn pd_pool_blocks_pool_begin() {
        let mut st = state("2001:db8::/64");
        st.pd_pools.push(PdPool {
            id: 3,
            subnet_id: 1,
            prefix: "2001:db8::/120".parse().unwrap(),
            delegated_len: 124,
        });
        let err: Err = st.check_pool(&pool(0, "2001:db8::10", "2001:db8::1ff")).unwrap_err();
        assert!(matches!(err, AllocError::Conflict { existing, .. } if existing.starts_with("pd pool 3")));
        // begin outside the pd prefix
        assert!(st.check_pool::<std::io::Error>(&pool(0, "2001:db8::100", "2001:db8::1ff")).is_ok());
    }

    #[test]
    fn pool_spanning_a_pd_prefix_conflicts() {
        let mut st = state("2001:db8::/64");
        st.pd_pools.push(PdPool {
            id: 3,
            subnet_id: 1,
            prefix: "2001:db8::100/120".parse().unwrap(),
            delegated_len: 124,
        });
        // starts below the prefix and runs through it
        let err: Err = st.check_pool(&pool(0, "2001:db8::10", "2001:db8::2ff")).unwrap_err();
        assert!(matches!(err, AllocError::Conflict { existing, .. } if existing.starts_with("pd pool 3")));

        // and the other way round: a new pd prefix inside an existing pool
        let mut st = state("2001:db8::/64");
        st.pools.push(pool(1, "2001:db8::10", "2001:db8::2ff"));
        let pd = PdPool {
            id: 0,
            subnet_id: 1,
            prefix: "2001:db8::100/120".parse().unwrap(),
            delegated_len: 124,
        };
        let err: Err = st.check_pd_pool(&pd).unwrap_err();
        assert!(matches!(err, AllocError::Conflict { existing, .. } if existing.starts_with("pool 1")));
    }

    #[test]
    fn capacity_subtracts_reserved_addresses() {
        let mut st = state("10.0.0.0/24");
        st.reservations.push(Reservation {
            id: 4,
            subnet_id: 1,
            identity: ClientIdentity::HwAddress("aa:bb:cc:dd:ee:01".into()),
            addresses: vec!["10.0.0.50".parse().unwrap(), "10.0.0.150".parse().unwrap()],
            prefixes: vec![],
        });
        let range = IpRange::parse("10.0.0.10", "10.0.0.100").unwrap();
        assert_eq!(st.pool_capacity::<std::io::Error>(&range).unwrap(), 90);
        assert!(st.is_reserved("10.0.0.150".parse().unwrap()));
    }
}
