//! # ipam-store
//!
//! `ipam-store` defines the persistence contract for the address space:
//! a [`Storage`] hands out [`Transaction`]s, and every read or write of
//! subnets, pools, reservations, static addresses and cached leases goes
//! through one.
//!
//! A transaction becomes visible to others only on [`Transaction::commit`].
//! Dropping it without committing rolls it back, so an early `?` return in a
//! caller can never leave a partial write behind.
//!
//! Two backends are provided, [`memory::MemoryStore`] and [`sqlite::SqliteDb`].
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use async_trait::async_trait;
use ipnet::IpNet;

pub mod memory;
pub mod model;
pub mod sqlite;

pub use model::*;

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;
    type Tx: Transaction<Error = Self::Error>;

    /// start a transaction. Concurrent transactions are serialized by the backend
    async fn begin(&self) -> Result<Self::Tx, Self::Error>;
}

/// Unit of work against the store. Inserts ignore the `id` field of the row
/// they are given and return the assigned one.
#[async_trait]
pub trait Transaction: Send + Sized {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn subnet(&mut self, id: Id) -> Result<Option<Subnet>, Self::Error>;
    async fn insert_subnet(&mut self, subnet: IpNet) -> Result<Id, Self::Error>;
    async fn set_subnet_capacity(&mut self, id: Id, capacity: u64) -> Result<(), Self::Error>;

    async fn pools(&mut self, subnet_id: Id) -> Result<Vec<Pool>, Self::Error>;
    async fn pool(&mut self, id: Id) -> Result<Option<Pool>, Self::Error>;
    async fn insert_pool(&mut self, pool: &Pool) -> Result<Id, Self::Error>;
    async fn update_pool_options(&mut self, id: Id, options: &PoolOptions)
    -> Result<(), Self::Error>;
    async fn set_pool_capacity(&mut self, id: Id, capacity: u64) -> Result<(), Self::Error>;
    async fn delete_pool(&mut self, id: Id) -> Result<(), Self::Error>;

    async fn reserved_pools(&mut self, subnet_id: Id) -> Result<Vec<ReservedPool>, Self::Error>;
    async fn reserved_pool(&mut self, id: Id) -> Result<Option<ReservedPool>, Self::Error>;
    async fn insert_reserved_pool(&mut self, pool: &ReservedPool) -> Result<Id, Self::Error>;
    async fn delete_reserved_pool(&mut self, id: Id) -> Result<(), Self::Error>;

    async fn pd_pools(&mut self, subnet_id: Id) -> Result<Vec<PdPool>, Self::Error>;
    async fn pd_pool(&mut self, id: Id) -> Result<Option<PdPool>, Self::Error>;
    async fn insert_pd_pool(&mut self, pool: &PdPool) -> Result<Id, Self::Error>;
    async fn delete_pd_pool(&mut self, id: Id) -> Result<(), Self::Error>;

    async fn reservations(&mut self, subnet_id: Id) -> Result<Vec<Reservation>, Self::Error>;
    async fn reservation(&mut self, id: Id) -> Result<Option<Reservation>, Self::Error>;
    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<Id, Self::Error>;
    async fn delete_reservation(&mut self, id: Id) -> Result<(), Self::Error>;

    async fn static_addresses(&mut self, subnet_id: Id)
    -> Result<Vec<StaticAddress>, Self::Error>;
    async fn static_address(&mut self, id: Id) -> Result<Option<StaticAddress>, Self::Error>;
    async fn insert_static_address(&mut self, addr: &StaticAddress) -> Result<Id, Self::Error>;
    async fn delete_static_address(&mut self, id: Id) -> Result<(), Self::Error>;

    async fn subnet_leases(&mut self, subnet_id: Id) -> Result<Vec<SubnetLease>, Self::Error>;
    async fn insert_subnet_lease(&mut self, lease: &SubnetLease) -> Result<Id, Self::Error>;
    async fn delete_subnet_lease(&mut self, id: Id) -> Result<(), Self::Error>;
    /// delete every cached lease of `subnet_id` whose id is not in `keep`.
    /// An empty `keep` deletes them all. Returns the number of rows deleted
    async fn delete_subnet_leases_except(
        &mut self,
        subnet_id: Id,
        keep: &[Id],
    ) -> Result<u64, Self::Error>;

    async fn commit(self) -> Result<(), Self::Error>;
}
