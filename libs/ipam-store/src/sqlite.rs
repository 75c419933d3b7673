use std::{net::IpAddr, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ip_range::IpRange;
use ipnet::{IpNet, Ipv6Net};
use sqlx::{
    ConnectOptions, Sqlite,
    error::BoxDynError,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use tracing::debug;

use crate::{
    AddressType, ClientIdentity, Id, PdPool, Pool, PoolOptions, Reservation, ReservedPool,
    StaticAddress, Storage, Subnet, SubnetLease, Transaction,
};

#[derive(Debug, Clone)]
pub struct SqliteDb {
    inner: SqlitePool,
}

impl SqliteDb {
    pub async fn new(uri: impl AsRef<str>) -> Result<Self, sqlx::Error> {
        let mut opts = SqliteConnectOptions::from_str(uri.as_ref())?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);
        // make sqlite log queries at trace level so we don't get a bloated log on `info`
        opts.log_statements(tracing::log::LevelFilter::Trace);

        // every connection to an in memory db gets its own db, keep a single one
        let inner = if uri.as_ref().contains("memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(opts)
                .await?
        } else {
            SqlitePool::connect_with(opts).await?
        };
        sqlx::migrate!("./migrations").run(&inner).await?;
        debug!("sqlite migrations applied");
        Ok(Self { inner })
    }
}

pub struct SqliteTx {
    inner: sqlx::Transaction<'static, Sqlite>,
}

impl std::fmt::Debug for SqliteTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTx").finish_non_exhaustive()
    }
}

#[async_trait]
impl Storage for SqliteDb {
    type Error = sqlx::Error;
    type Tx = SqliteTx;

    async fn begin(&self) -> Result<Self::Tx, Self::Error> {
        Ok(SqliteTx {
            inner: self.inner.begin().await?,
        })
    }
}

#[async_trait]
impl Transaction for SqliteTx {
    type Error = sqlx::Error;

    async fn subnet(&mut self, id: Id) -> Result<Option<Subnet>, Self::Error> {
        sqlx::query_as::<_, util::SubnetRow>("SELECT * FROM subnets WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut self.inner)
            .await?
            .map(Subnet::try_from)
            .transpose()
    }

    async fn insert_subnet(&mut self, subnet: IpNet) -> Result<Id, Self::Error> {
        Ok(
            sqlx::query("INSERT INTO subnets (subnet, capacity) VALUES (?1, '0')")
                .bind(subnet.to_string())
                .execute(&mut self.inner)
                .await?
                .last_insert_rowid(),
        )
    }

    async fn set_subnet_capacity(&mut self, id: Id, capacity: u64) -> Result<(), Self::Error> {
        util::expect_one(
            sqlx::query("UPDATE subnets SET capacity = ?2 WHERE id = ?1")
                .bind(id)
                .bind(capacity.to_string())
                .execute(&mut self.inner)
                .await?
                .rows_affected(),
        )
    }

    async fn pools(&mut self, subnet_id: Id) -> Result<Vec<Pool>, Self::Error> {
        sqlx::query_as::<_, util::PoolRow>("SELECT * FROM pools WHERE subnet_id = ?1 ORDER BY id")
            .bind(subnet_id)
            .fetch_all(&mut self.inner)
            .await?
            .into_iter()
            .map(Pool::try_from)
            .collect()
    }

    async fn pool(&mut self, id: Id) -> Result<Option<Pool>, Self::Error> {
        sqlx::query_as::<_, util::PoolRow>("SELECT * FROM pools WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut self.inner)
            .await?
            .map(Pool::try_from)
            .transpose()
    }

    async fn insert_pool(&mut self, pool: &Pool) -> Result<Id, Self::Error> {
        Ok(sqlx::query(
            r#"INSERT INTO pools
                (subnet_id, begin_addr, end_addr, capacity, template, options)
            VALUES
                (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(pool.subnet_id)
        .bind(pool.range.begin().to_string())
        .bind(pool.range.end().to_string())
        .bind(pool.capacity.to_string())
        .bind(pool.template.clone())
        .bind(util::to_json(&pool.options)?)
        .execute(&mut self.inner)
        .await?
        .last_insert_rowid())
    }

    async fn update_pool_options(
        &mut self,
        id: Id,
        options: &PoolOptions,
    ) -> Result<(), Self::Error> {
        util::expect_one(
            sqlx::query("UPDATE pools SET options = ?2 WHERE id = ?1")
                .bind(id)
                .bind(util::to_json(options)?)
                .execute(&mut self.inner)
                .await?
                .rows_affected(),
        )
    }

    async fn set_pool_capacity(&mut self, id: Id, capacity: u64) -> Result<(), Self::Error> {
        util::expect_one(
            sqlx::query("UPDATE pools SET capacity = ?2 WHERE id = ?1")
                .bind(id)
                .bind(capacity.to_string())
                .execute(&mut self.inner)
                .await?
                .rows_affected(),
        )
    }

    async fn delete_pool(&mut self, id: Id) -> Result<(), Self::Error> {
        util::delete(&mut self.inner, "pools", id).await
    }

    async fn reserved_pools(&mut self, subnet_id: Id) -> Result<Vec<ReservedPool>, Self::Error> {
        sqlx::query_as::<_, util::ReservedPoolRow>(
            "SELECT * FROM reserved_pools WHERE subnet_id = ?1 ORDER BY id",
        )
        .bind(subnet_id)
        .fetch_all(&mut self.inner)
        .await?
        .into_iter()
        .map(ReservedPool::try_from)
        .collect()
    }

    async fn reserved_pool(&mut self, id: Id) -> Result<Option<ReservedPool>, Self::Error> {
        sqlx::query_as::<_, util::ReservedPoolRow>("SELECT * FROM reserved_pools WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut self.inner)
            .await?
            .map(ReservedPool::try_from)
            .transpose()
    }

    async fn insert_reserved_pool(&mut self, pool: &ReservedPool) -> Result<Id, Self::Error> {
        Ok(sqlx::query(
            "INSERT INTO reserved_pools (subnet_id, begin_addr, end_addr, comment) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(pool.subnet_id)
        .bind(pool.range.begin().to_string())
        .bind(pool.range.end().to_string())
        .bind(pool.comment.clone())
        .execute(&mut self.inner)
        .await?
        .last_insert_rowid())
    }

    async fn delete_reserved_pool(&mut self, id: Id) -> Result<(), Self::Error> {
        util::delete(&mut self.inner, "reserved_pools", id).await
    }

    async fn pd_pools(&mut self, subnet_id: Id) -> Result<Vec<PdPool>, Self::Error> {
        sqlx::query_as::<_, util::PdPoolRow>(
            "SELECT * FROM pd_pools WHERE subnet_id = ?1 ORDER BY id",
        )
        .bind(subnet_id)
        .fetch_all(&mut self.inner)
        .await?
        .into_iter()
        .map(PdPool::try_from)
        .collect()
    }

    async fn pd_pool(&mut self, id: Id) -> Result<Option<PdPool>, Self::Error> {
        sqlx::query_as::<_, util::PdPoolRow>("SELECT * FROM pd_pools WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut self.inner)
            .await?
            .map(PdPool::try_from)
            .transpose()
    }

    async fn insert_pd_pool(&mut self, pool: &PdPool) -> Result<Id, Self::Error> {
        Ok(sqlx::query(
            "INSERT INTO pd_pools (subnet_id, prefix, delegated_len) VALUES (?1, ?2, ?3)",
        )
        .bind(pool.subnet_id)
        .bind(pool.prefix.to_string())
        .bind(pool.delegated_len as i64)
        .execute(&mut self.inner)
        .await?
        .last_insert_rowid())
    }

    async fn delete_pd_pool(&mut self, id: Id) -> Result<(), Self::Error> {
        util::delete(&mut self.inner, "pd_pools", id).await
    }

    async fn reservations(&mut self, subnet_id: Id) -> Result<Vec<Reservation>, Self::Error> {
        sqlx::query_as::<_, util::ReservationRow>(
            "SELECT * FROM reservations WHERE subnet_id = ?1 ORDER BY id",
        )
        .bind(subnet_id)
        .fetch_all(&mut self.inner)
        .await?
        .into_iter()
        .map(Reservation::try_from)
        .collect()
    }

    async fn reservation(&mut self, id: Id) -> Result<Option<Reservation>, Self::Error> {
        sqlx::query_as::<_, util::ReservationRow>("SELECT * FROM reservations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut self.inner)
            .await?
            .map(Reservation::try_from)
            .transpose()
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<Id, Self::Error> {
        Ok(sqlx::query(
            "INSERT INTO reservations (subnet_id, identity, addresses, prefixes) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(reservation.subnet_id)
        .bind(util::to_json(&reservation.identity)?)
        .bind(util::join(&reservation.addresses))
        .bind(util::join(&reservation.prefixes))
        .execute(&mut self.inner)
        .await?
        .last_insert_rowid())
    }

    async fn delete_reservation(&mut self, id: Id) -> Result<(), Self::Error> {
        util::delete(&mut self.inner, "reservations", id).await
    }

    async fn static_addresses(
        &mut self,
        subnet_id: Id,
    ) -> Result<Vec<StaticAddress>, Self::Error> {
        sqlx::query_as::<_, util::StaticAddressRow>(
            "SELECT * FROM static_addresses WHERE subnet_id = ?1 ORDER BY id",
        )
        .bind(subnet_id)
        .fetch_all(&mut self.inner)
        .await?
        .into_iter()
        .map(StaticAddress::try_from)
        .collect()
    }

    async fn static_address(&mut self, id: Id) -> Result<Option<StaticAddress>, Self::Error> {
        sqlx::query_as::<_, util::StaticAddressRow>(
            "SELECT * FROM static_addresses WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut self.inner)
        .await?
        .map(StaticAddress::try_from)
        .transpose()
    }

    async fn insert_static_address(&mut self, addr: &StaticAddress) -> Result<Id, Self::Error> {
        Ok(sqlx::query(
            "INSERT INTO static_addresses (subnet_id, address, identity) VALUES (?1, ?2, ?3)",
        )
        .bind(addr.subnet_id)
        .bind(addr.address.to_string())
        .bind(util::to_json(&addr.identity)?)
        .execute(&mut self.inner)
        .await?
        .last_insert_rowid())
    }

    async fn delete_static_address(&mut self, id: Id) -> Result<(), Self::Error> {
        util::delete(&mut self.inner, "static_addresses", id).await
    }

    async fn subnet_leases(&mut self, subnet_id: Id) -> Result<Vec<SubnetLease>, Self::Error> {
        sqlx::query_as::<_, util::SubnetLeaseRow>(
            "SELECT * FROM subnet_leases WHERE subnet_id = ?1 ORDER BY id",
        )
        .bind(subnet_id)
        .fetch_all(&mut self.inner)
        .await?
        .into_iter()
        .map(SubnetLease::try_from)
        .collect()
    }

    async fn insert_subnet_lease(&mut self, lease: &SubnetLease) -> Result<Id, Self::Error> {
        Ok(sqlx::query(
            r#"INSERT INTO subnet_leases
                (subnet_id, address, hw_address, duid, client_id, expire,
                 expire_nanos, lease_type, state, hostname, address_type)
            VALUES
                (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        )
        .bind(lease.subnet_id)
        .bind(lease.address.to_string())
        .bind(lease.hw_address.clone())
        .bind(lease.duid.clone())
        .bind(lease.client_id.clone())
        .bind(lease.expire.timestamp())
        // sub-second part kept apart so rows compare equal to the live lease
        .bind(lease.expire.timestamp_subsec_nanos() as i64)
        .bind(lease.lease_type.as_str())
        .bind(lease.state.as_str())
        .bind(lease.hostname.clone())
        .bind(lease.address_type.as_str())
        .execute(&mut self.inner)
        .await?
        .last_insert_rowid())
    }

    async fn delete_subnet_lease(&mut self, id: Id) -> Result<(), Self::Error> {
        util::delete(&mut self.inner, "subnet_leases", id).await
    }

    async fn delete_subnet_leases_except(
        &mut self,
        subnet_id: Id,
        keep: &[Id],
    ) -> Result<u64, Self::Error> {
        // ids travel as one json array so the statement never hits the bind limit
        let keep = util::to_json(&keep)?;
        Ok(sqlx::query(
            r#"DELETE FROM subnet_leases
            WHERE
                subnet_id = ?1
                AND id NOT IN (SELECT value FROM json_each(?2))"#,
        )
        .bind(subnet_id)
        .bind(keep)
        .execute(&mut self.inner)
        .await?
        .rows_affected())
    }

    async fn commit(self) -> Result<(), Self::Error> {
        self.inner.commit().await
    }
}

mod util {
    use super::*;

    pub(super) fn decode(err: impl Into<BoxDynError>) -> sqlx::Error {
        sqlx::Error::Decode(err.into())
    }

    pub(super) fn to_json<T: serde::Serialize + ?Sized>(val: &T) -> Result<String, sqlx::Error> {
        serde_json::to_string(val).map_err(|err| sqlx::Error::Protocol(err.to_string()))
    }

    pub(super) fn parse<T>(s: &str) -> Result<T, sqlx::Error>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        s.parse::<T>()
            .map_err(|err| decode(format!("bad column value {s:?}: {err}")))
    }

    pub(super) fn join<T: ToString>(items: &[T]) -> String {
        items
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(super) fn split<T>(s: &str) -> Result<Vec<T>, sqlx::Error>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        s.split(',').filter(|i| !i.is_empty()).map(parse).collect()
    }

    pub(super) fn range(begin: &str, end: &str) -> Result<IpRange, sqlx::Error> {
        IpRange::new(parse::<IpAddr>(begin)?, parse::<IpAddr>(end)?).map_err(decode)
    }

    pub(super) fn expect_one(rows: u64) -> Result<(), sqlx::Error> {
        if rows == 0 {
            Err(sqlx::Error::RowNotFound)
        } else {
            Ok(())
        }
    }

    pub(super) async fn delete(
        conn: &mut sqlx::Transaction<'static, Sqlite>,
        table: &'static str,
        id: Id,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    #[derive(sqlx::FromRow)]
    pub(super) struct SubnetRow {
        id: i64,
        subnet: String,
        capacity: String,
    }

    impl TryFrom<SubnetRow> for Subnet {
        type Error = sqlx::Error;

        fn try_from(row: SubnetRow) -> Result<Self, Self::Error> {
            Ok(Subnet {
                id: row.id,
                subnet: parse(&row.subnet)?,
                capacity: parse(&row.capacity)?,
            })
        }
    }

    #[derive(sqlx::FromRow)]
    pub(super) struct PoolRow {
        id: i64,
        subnet_id: i64,
        begin_addr: String,
        end_addr: String,
        capacity: String,
        template: Option<String>,
        options: String,
    }

    impl TryFrom<PoolRow> for Pool {
        type Error = sqlx::Error;

        fn try_from(row: PoolRow) -> Result<Self, Self::Error> {
            Ok(Pool {
                id: row.id,
                subnet_id: row.subnet_id,
                range: range(&row.begin_addr, &row.end_addr)?,
                capacity: parse(&row.capacity)?,
                template: row.template,
                options: serde_json::from_str(&row.options).map_err(decode)?,
            })
        }
    }

    #[derive(sqlx::FromRow)]
    pub(super) struct ReservedPoolRow {
        id: i64,
        subnet_id: i64,
        begin_addr: String,
        end_addr: String,
        comment: Option<String>,
    }

    impl TryFrom<ReservedPoolRow> for ReservedPool {
        type Error = sqlx::Error;

        fn try_from(row: ReservedPoolRow) -> Result<Self, Self::Error> {
            Ok(ReservedPool {
                id: row.id,
                subnet_id: row.subnet_id,
                range: range(&row.begin_addr, &row.end_addr)?,
                comment: row.comment,
            })
        }
    }

    #[derive(sqlx::FromRow)]
    pub(super) struct PdPoolRow {
        id: i64,
        subnet_id: i64,
        prefix: String,
        delegated_len: i64,
    }

    impl TryFrom<PdPoolRow> for PdPool {
        type Error = sqlx::Error;

        fn try_from(row: PdPoolRow) -> Result<Self, Self::Error> {
            Ok(PdPool {
                id: row.id,
                subnet_id: row.subnet_id,
                prefix: parse::<Ipv6Net>(&row.prefix)?,
                delegated_len: u8::try_from(row.delegated_len).map_err(decode)?,
            })
        }
    }

    #[derive(sqlx::FromRow)]
    pub(super) struct ReservationRow {
        id: i64,
        subnet_id: i64,
        identity: String,
        addresses: String,
        prefixes: String,
    }

    impl TryFrom<ReservationRow> for Reservation {
        type Error = sqlx::Error;

        fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
            Ok(Reservation {
                id: row.id,
                subnet_id: row.subnet_id,
                identity: serde_json::from_str::<ClientIdentity>(&row.identity)
                    .map_err(decode)?,
                addresses: split(&row.addresses)?,
                prefixes: split(&row.prefixes)?,
            })
        }
    }

    #[derive(sqlx::FromRow)]
    pub(super) struct StaticAddressRow {
        id: i64,
        subnet_id: i64,
        address: String,
        identity: String,
    }

    impl TryFrom<StaticAddressRow> for StaticAddress {
        type Error = sqlx::Error;

        fn try_from(row: StaticAddressRow) -> Result<Self, Self::Error> {
            Ok(StaticAddress {
                id: row.id,
                subnet_id: row.subnet_id,
                address: parse(&row.address)?,
                identity: serde_json::from_str(&row.identity).map_err(decode)?,
            })
        }
    }

    #[derive(sqlx::FromRow)]
    pub(super) struct SubnetLeaseRow {
        id: i64,
        subnet_id: i64,
        address: String,
        hw_address: Option<String>,
        duid: Option<String>,
        client_id: Option<String>,
        expire: i64,
        expire_nanos: i64,
        lease_type: String,
        state: String,
        hostname: Option<String>,
        address_type: String,
    }

    impl TryFrom<SubnetLeaseRow> for SubnetLease {
        type Error = sqlx::Error;

        fn try_from(row: SubnetLeaseRow) -> Result<Self, Self::Error> {
            Ok(SubnetLease {
                id: row.id,
                subnet_id: row.subnet_id,
                address: parse(&row.address)?,
                hw_address: row.hw_address,
                duid: row.duid,
                client_id: row.client_id,
                expire: u32::try_from(row.expire_nanos)
                    .ok()
                    .and_then(|nanos| DateTime::<Utc>::from_timestamp(row.expire, nanos))
                    .ok_or_else(|| {
                        decode(format!(
                            "expire out of range: {}.{:09}",
                            row.expire, row.expire_nanos
                        ))
                    })?,
                lease_type: parse(&row.lease_type)?,
                state: parse(&row.state)?,
                hostname: row.hostname,
                address_type: parse::<AddressType>(&row.address_type)?,
            })
        }
    }
}
