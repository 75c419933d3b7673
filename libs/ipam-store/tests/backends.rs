use chrono::{TimeZone, Utc};
use ip_range::IpRange;
use ipam_store::{
    AddressType, ClientIdentity, Pool, PoolOptions, Reservation, Storage, SubnetLease,
    Transaction, memory::MemoryStore, sqlite::SqliteDb,
};
use upstream::{LeaseState, LeaseType};

fn cached(subnet_id: i64, ip: &str, expire: i64) -> SubnetLease {
    SubnetLease {
        id: 0,
        subnet_id,
        address: ip.parse().unwrap(),
        hw_address: Some("aa:bb:cc:dd:ee:ff".into()),
        duid: None,
        client_id: None,
        expire: Utc.timestamp_opt(expire, 0).unwrap(),
        lease_type: LeaseType::V4,
        state: LeaseState::Default,
        hostname: None,
        address_type: AddressType::Dynamic,
    }
}

async fn exercise<S: Storage>(store: S) {
    let mut tx = store.begin().await.unwrap();
    let subnet_id = tx.insert_subnet("10.0.0.0/24".parse().unwrap()).await.unwrap();
    let other_id = tx.insert_subnet("10.0.1.0/24".parse().unwrap()).await.unwrap();

    let pool_id = tx
        .insert_pool(&Pool {
            id: 0,
            subnet_id,
            range: IpRange::parse("10.0.0.10", "10.0.0.100").unwrap(),
            capacity: 91,
            template: None,
            options: PoolOptions {
                routers: vec!["10.0.0.1".parse().unwrap()],
                ..Default::default()
            },
        })
        .await
        .unwrap();
    tx.set_subnet_capacity(subnet_id, 91).await.unwrap();

    let res_id = tx
        .insert_reservation(&Reservation {
            id: 0,
            subnet_id,
            identity: ClientIdentity::HwAddress("aa:bb:cc:dd:ee:01".into()),
            addresses: vec!["10.0.0.50".parse().unwrap(), "10.0.0.51".parse().unwrap()],
            prefixes: vec![],
        })
        .await
        .unwrap();

    let a = tx.insert_subnet_lease(&cached(subnet_id, "10.0.0.20", 1_000)).await.unwrap();
    let b = tx.insert_subnet_lease(&cached(subnet_id, "10.0.0.21", 1_000)).await.unwrap();
    let c = tx.insert_subnet_lease(&cached(subnet_id, "10.0.0.22", 1_000)).await.unwrap();
    let foreign = tx.insert_subnet_lease(&cached(other_id, "10.0.1.5", 1_000)).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.subnet(subnet_id).await.unwrap().unwrap().capacity, 91);
    let pool = tx.pool(pool_id).await.unwrap().unwrap();
    assert_eq!(pool.capacity, 91);
    assert_eq!(pool.options.routers.len(), 1);
    assert_eq!(tx.pools(subnet_id).await.unwrap().len(), 1);
    assert!(tx.pools(other_id).await.unwrap().is_empty());
    let res = tx.reservation(res_id).await.unwrap().unwrap();
    assert_eq!(res.addresses.len(), 2);
    assert_eq!(res.capacity(), 2);

    // keep c only
    assert_eq!(tx.delete_subnet_leases_except(subnet_id, &[c]).await.unwrap(), 2);
    let left: Vec<_> = tx
        .subnet_leases(subnet_id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.id)
        .collect();
    assert_eq!(left, vec![c]);
    assert!(!left.contains(&a) && !left.contains(&b));

    // empty keep set prunes the whole subnet, nothing else
    assert_eq!(tx.delete_subnet_leases_except(subnet_id, &[]).await.unwrap(), 1);
    assert!(tx.subnet_leases(subnet_id).await.unwrap().is_empty());
    assert_eq!(tx.subnet_leases(other_id).await.unwrap()[0].id, foreign);
    // rolled back on drop
    drop(tx);

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.subnet_leases(subnet_id).await.unwrap().len(), 3);
    let lease = &tx.subnet_leases(subnet_id).await.unwrap()[0];
    assert_eq!(lease.expire.timestamp(), 1_000);
    assert_eq!(lease.address_type, AddressType::Dynamic);
    drop(tx);

    // sub-second expiry survives a round trip
    let mut precise = cached(subnet_id, "10.0.0.30", 0);
    precise.expire = Utc.timestamp_opt(1_900_000_000, 500_000_123).unwrap();
    let mut tx = store.begin().await.unwrap();
    let id = tx.insert_subnet_lease(&precise).await.unwrap();
    tx.commit().await.unwrap();
    let mut tx = store.begin().await.unwrap();
    let back = tx
        .subnet_leases(subnet_id)
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.id == id)
        .unwrap();
    assert_eq!(back.expire, precise.expire);
}

#[tokio::test]
async fn memory_backend() {
    exercise(MemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_backend() {
    exercise(SqliteDb::new("sqlite::memory:").await.unwrap()).await;
}
