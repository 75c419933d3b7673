//! in-memory backend. One transaction at a time holds the tables; writes go
//! to a working copy that replaces the tables on commit.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::{
    Id, PdPool, Pool, PoolOptions, Reservation, ReservedPool, StaticAddress, Storage, Subnet,
    SubnetLease, Transaction,
};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no {table} row with id {id}")]
    Missing { table: &'static str, id: Id },
    #[error("subnet already exists in memory store: {0}")]
    SubnetExists(IpNet),
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: Id,
    subnets: BTreeMap<Id, Subnet>,
    pools: BTreeMap<Id, Pool>,
    reserved_pools: BTreeMap<Id, ReservedPool>,
    pd_pools: BTreeMap<Id, PdPool>,
    reservations: BTreeMap<Id, Reservation>,
    static_addresses: BTreeMap<Id, StaticAddress>,
    subnet_leases: BTreeMap<Id, SubnetLease>,
}

impl Tables {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

#[async_trait]
impl Storage for MemoryStore {
    type Error = MemoryError;
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx, Self::Error> {
        let guard = self.inner.clone().lock_owned().await;
        let work = guard.clone();
        Ok(MemoryTx { guard, work })
    }
}

fn by_subnet<T: Clone>(
    table: &BTreeMap<Id, T>,
    subnet_id: Id,
    owner: impl Fn(&T) -> Id,
) -> Vec<T> {
    table
        .values()
        .filter(|row| owner(row) == subnet_id)
        .cloned()
        .collect()
}

#[async_trait]
impl Transaction for MemoryTx {
    type Error = MemoryError;

    async fn subnet(&mut self, id: Id) -> Result<Option<Subnet>, Self::Error> {
        Ok(self.work.subnets.get(&id).cloned())
    }

    async fn insert_subnet(&mut self, subnet: IpNet) -> Result<Id, Self::Error> {
        if self.work.subnets.values().any(|s| s.subnet == subnet) {
            return Err(MemoryError::SubnetExists(subnet));
        }
        let id = self.work.next_id();
        self.work.subnets.insert(
            id,
            Subnet {
                id,
                subnet,
                capacity: 0,
            },
        );
        Ok(id)
    }

    async fn set_subnet_capacity(&mut self, id: Id, capacity: u64) -> Result<(), Self::Error> {
        let subnet = self.work.subnets.get_mut(&id).ok_or(MemoryError::Missing {
            table: "subnets",
            id,
        })?;
        subnet.capacity = capacity;
        Ok(())
    }

    async fn pools(&mut self, subnet_id: Id) -> Result<Vec<Pool>, Self::Error> {
        Ok(by_subnet(&self.work.pools, subnet_id, |p| p.subnet_id))
    }

    async fn pool(&mut self, id: Id) -> Result<Option<Pool>, Self::Error> {
        Ok(self.work.pools.get(&id).cloned())
    }

    async fn insert_pool(&mut self, pool: &Pool) -> Result<Id, Self::Error> {
        let id = self.work.next_id();
        self.work.pools.insert(id, Pool { id, ..pool.clone() });
        Ok(id)
    }

    async fn update_pool_options(
        &mut self,
        id: Id,
        options: &PoolOptions,
    ) -> Result<(), Self::Error> {
        let pool = self
            .work
            .pools
            .get_mut(&id)
            .ok_or(MemoryError::Missing { table: "pools", id })?;
        pool.options = options.clone();
        Ok(())
    }

    async fn set_pool_capacity(&mut self, id: Id, capacity: u64) -> Result<(), Self::Error> {
        let pool = self
            .work
            .pools
            .get_mut(&id)
            .ok_or(MemoryError::Missing { table: "pools", id })?;
        pool.capacity = capacity;
        Ok(())
    }

    async fn delete_pool(&mut self, id: Id) -> Result<(), Self::Error> {
        self.work.pools.remove(&id);
        Ok(())
    }

    async fn reserved_pools(&mut self, subnet_id: Id) -> Result<Vec<ReservedPool>, Self::Error> {
        Ok(by_subnet(&self.work.reserved_pools, subnet_id, |p| {
            p.subnet_id
        }))
    }

    async fn reserved_pool(&mut self, id: Id) -> Result<Option<ReservedPool>, Self::Error> {
        Ok(self.work.reserved_pools.get(&id).cloned())
    }

    async fn insert_reserved_pool(&mut self, pool: &ReservedPool) -> Result<Id, Self::Error> {
        let id = self.work.next_id();
        self.work
            .reserved_pools
            .insert(id, ReservedPool { id, ..pool.clone() });
        Ok(id)
    }

    async fn delete_reserved_pool(&mut self, id: Id) -> Result<(), Self::Error> {
        self.work.reserved_pools.remove(&id);
        Ok(())
    }

    async fn pd_pools(&mut self, subnet_id: Id) -> Result<Vec<PdPool>, Self::Error> {
        Ok(by_subnet(&self.work.pd_pools, subnet_id, |p| p.subnet_id))
    }

    async fn pd_pool(&mut self, id: Id) -> Result<Option<PdPool>, Self::Error> {
        Ok(self.work.pd_pools.get(&id).cloned())
    }

    async fn insert_pd_pool(&mut self, pool: &PdPool) -> Result<Id, Self::Error> {
        let id = self.work.next_id();
        self.work.pd_pools.insert(id, PdPool { id, ..pool.clone() });
        Ok(id)
    }

    async fn delete_pd_pool(&mut self, id: Id) -> Result<(), Self::Error> {
        self.work.pd_pools.remove(&id);
        Ok(())
    }

    async fn reservations(&mut self, subnet_id: Id) -> Result<Vec<Reservation>, Self::Error> {
        Ok(by_subnet(&self.work.reservations, subnet_id, |r| {
            r.subnet_id
        }))
    }

    async fn reservation(&mut self, id: Id) -> Result<Option<Reservation>, Self::Error> {
        Ok(self.work.reservations.get(&id).cloned())
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<Id, Self::Error> {
        let id = self.work.next_id();
        self.work.reservations.insert(
            id,
            Reservation {
                id,
                ..reservation.clone()
            },
        );
        Ok(id)
    }

    async fn delete_reservation(&mut self, id: Id) -> Result<(), Self::Error> {
        self.work.reservations.remove(&id);
        Ok(())
    }

    async fn static_addresses(
        &mut self,
        subnet_id: Id,
    ) -> Result<Vec<StaticAddress>, Self::Error> {
        Ok(by_subnet(&self.work.static_addresses, subnet_id, |s| {
            s.subnet_id
        }))
    }

    async fn static_address(&mut self, id: Id) -> Result<Option<StaticAddress>, Self::Error> {
        Ok(self.work.static_addresses.get(&id).cloned())
    }

    async fn insert_static_address(&mut self, addr: &StaticAddress) -> Result<Id, Self::Error> {
        let id = self.work.next_id();
        self.work
            .static_addresses
            .insert(id, StaticAddress { id, ..addr.clone() });
        Ok(id)
    }

    async fn delete_static_address(&mut self, id: Id) -> Result<(), Self::Error> {
        self.work.static_addresses.remove(&id);
        Ok(())
    }

    async fn subnet_leases(&mut self, subnet_id: Id) -> Result<Vec<SubnetLease>, Self::Error> {
        Ok(by_subnet(&self.work.subnet_leases, subnet_id, |l| {
            l.subnet_id
        }))
    }

    async fn insert_subnet_lease(&mut self, lease: &SubnetLease) -> Result<Id, Self::Error> {
        let id = self.work.next_id();
        self.work
            .subnet_leases
            .insert(id, SubnetLease { id, ..lease.clone() });
        Ok(id)
    }

    async fn delete_subnet_lease(&mut self, id: Id) -> Result<(), Self::Error> {
        self.work.subnet_leases.remove(&id);
        Ok(())
    }

    async fn delete_subnet_leases_except(
        &mut self,
        subnet_id: Id,
        keep: &[Id],
    ) -> Result<u64, Self::Error> {
        let before = self.work.subnet_leases.len();
        self.work
            .subnet_leases
            .retain(|id, l| l.subnet_id != subnet_id || keep.contains(id));
        Ok((before - self.work.subnet_leases.len()) as u64)
    }

    async fn commit(self) -> Result<(), Self::Error> {
        let MemoryTx { mut guard, work } = self;
        *guard = work;
        trace!("memory transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_tx_rolls_back() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_subnet("10.0.0.0/24".parse().unwrap()).await.unwrap();
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.subnet(id).await.unwrap().is_none());
        let id = tx.insert_subnet("10.0.0.0/24".parse().unwrap()).await.unwrap();
        tx.set_subnet_capacity(id, 5).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.subnet(id).await.unwrap().unwrap().capacity, 5);
        assert!(matches!(
            tx.insert_subnet("10.0.0.0/24".parse().unwrap()).await,
            Err(MemoryError::SubnetExists(_))
        ));
    }

    #[tokio::test]
    async fn transactions_are_serialized() {
        let store = MemoryStore::new();
        let tx = store.begin().await.unwrap();
        let other = store.clone();
        let waiter = tokio::spawn(async move { other.begin().await.map(|_| ()) });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(tx);
        waiter.await.unwrap().unwrap();
    }
}
