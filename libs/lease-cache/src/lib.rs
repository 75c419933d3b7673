//! # lease-cache
//!
//! Keeps the stored [`SubnetLease`] rows of a subnet in step with what the
//! lease authority reports. A read reconciles: rows that still match a live
//! lease on every field the authority reports are retained, everything else
//! in the subnet is deleted. Live leases without a matching row are returned
//! as fresh views but not written; only [`LeaseCache::record_lease`] writes.
//!
//! When the authority cannot be reached the cached rows are returned as they
//! are and nothing is deleted.
#![warn(
    missing_debug_implementations,
    // missing_docs, // we shall remove thee, someday!
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    time::Duration,
};

use ip_range::IpRange;
use ipam_core::{config::cli::DEFAULT_UPSTREAM_TIMEOUT, metrics};
use ipam_store::{AddressType, Id, Storage, Subnet, SubnetLease, Transaction};
use ipnet::Ipv6Net;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use upstream::{Lease, LeaseAuthority, UpstreamError, bounded};

#[derive(Error, Debug)]
pub enum CacheError<E> {
    #[error("database error")]
    DbError(#[from] E),
    #[error("no {kind} with id {id}")]
    NotFound { kind: &'static str, id: Id },
}

pub type Result<T, E> = std::result::Result<T, CacheError<E>>;

/// outcome of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// the subnet's leases, retained rows and fresh views alike
    pub leases: Vec<SubnetLease>,
    /// ids of the stored rows that survived
    pub retained: Vec<Id>,
    /// rows deleted
    pub pruned: u64,
}

pub struct LeaseCache<S, A> {
    store: S,
    authority: A,
    timeout: Duration,
}

impl<S, A> fmt::Debug for LeaseCache<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCache")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<S: Clone, A: Clone> Clone for LeaseCache<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            authority: self.authority.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S, A> LeaseCache<S, A>
where
    S: Storage,
    A: LeaseAuthority,
{
    pub fn new(store: S, authority: A) -> Self {
        Self {
            store,
            authority,
            timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT),
        }
    }

    /// bound on every lease authority call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// reconcile and return every lease of the subnet
    #[instrument(level = "debug", skip(self))]
    pub async fn list_subnet_leases(&self, subnet_id: Id) -> Result<Reconciled, S::Error> {
        let mut tx = self.store.begin().await?;
        let subnet = subnet(&mut tx, subnet_id).await?;
        let layout = Layout::load(&mut tx, subnet_id).await?;
        let cached = tx.subnet_leases(subnet_id).await?;

        let live = match self.live(&subnet).await {
            Ok(live) => live,
            Err(err) => {
                warn!(?err, subnet_id, "lease authority failed, serving cached leases");
                let retained = cached.iter().map(|l| l.id).collect();
                return Ok(Reconciled {
                    leases: cached,
                    retained,
                    pruned: 0,
                });
            }
        };

        let mut by_addr: HashMap<IpAddr, Vec<SubnetLease>> = HashMap::new();
        for row in cached {
            by_addr.entry(row.address).or_default().push(row);
        }
        let mut leases = Vec::with_capacity(live.len());
        let mut retained = Vec::new();
        for lease in &live {
            let address_type = layout.classify(lease);
            let hit = by_addr.get_mut(&lease.address).and_then(|rows| {
                let pos = rows.iter().position(|row| row.same_as(lease))?;
                Some(rows.swap_remove(pos))
            });
            match hit {
                Some(mut row) => {
                    retained.push(row.id);
                    row.address_type = address_type;
                    leases.push(row);
                }
                None => leases.push(SubnetLease::from_lease(subnet_id, lease, address_type)),
            }
        }

        // an empty keep list clears the subnet
        let pruned = tx.delete_subnet_leases_except(subnet_id, &retained).await?;
        tx.commit().await?;
        if pruned > 0 {
            metrics::LEASE_CACHE_PRUNED.inc_by(pruned);
            info!(subnet_id, pruned, retained = retained.len(), "stale cached leases pruned");
        }
        debug!(subnet_id, leases = leases.len(), "subnet leases reconciled");
        Ok(Reconciled {
            leases,
            retained,
            pruned,
        })
    }

    /// reconcile the pool's subnet, then keep the leases inside the pool
    #[instrument(level = "debug", skip(self))]
    pub async fn list_pool_leases(&self, pool_id: Id) -> Result<Reconciled, S::Error> {
        let pool = {
            let mut tx = self.store.begin().await?;
            tx.pool(pool_id).await?.ok_or(CacheError::NotFound {
                kind: "pool",
                id: pool_id,
            })?
        };
        let mut all = self.list_subnet_leases(pool.subnet_id).await?;
        all.leases
            .retain(|l| pool.range.contains(l.address).unwrap_or(false));
        Ok(all)
    }

    /// Reconcile a single address. `Ok(None)` when the authority has no
    /// lease there; any stale row at the address is deleted.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_lease(&self, subnet_id: Id, ip: IpAddr) -> Result<Option<SubnetLease>, S::Error> {
        let mut tx = self.store.begin().await?;
        let subnet = subnet(&mut tx, subnet_id).await?;
        let mut rows: Vec<SubnetLease> = tx
            .subnet_leases(subnet_id)
            .await?
            .into_iter()
            .filter(|l| l.address == ip)
            .collect();

        let live = bounded(
            "authority",
            self.timeout,
            self.authority.lease(subnet.family(), subnet_id, ip),
        )
        .await;
        let live = match live {
            Ok(live) => live,
            Err(err) => {
                count(&err);
                warn!(?err, subnet_id, %ip, "lease authority failed, serving cached lease");
                return Ok(rows.into_iter().next());
            }
        };

        let found = match live {
            Some(lease) => {
                let layout = Layout::load(&mut tx, subnet_id).await?;
                let address_type = layout.classify(&lease);
                let view = match rows.iter().position(|row| row.same_as(&lease)) {
                    Some(pos) => {
                        let mut row = rows.swap_remove(pos);
                        row.address_type = address_type;
                        row
                    }
                    None => SubnetLease::from_lease(subnet_id, &lease, address_type),
                };
                Some(view)
            }
            None => None,
        };
        // whatever is left at the address no longer matches
        let pruned = rows.len() as u64;
        for stale in rows {
            tx.delete_subnet_lease(stale.id).await?;
        }
        tx.commit().await?;
        if pruned > 0 {
            metrics::LEASE_CACHE_PRUNED.inc_by(pruned);
            debug!(subnet_id, %ip, pruned, "stale cached lease pruned");
        }
        Ok(found)
    }

    /// Store `lease` in the subnet's cache, replacing whatever row sat at the
    /// same address. A row that already matches is kept as is.
    #[instrument(level = "debug", skip(self, lease), fields(address = %lease.address))]
    pub async fn record_lease(&self, subnet_id: Id, lease: &Lease) -> Result<SubnetLease, S::Error> {
        let mut tx = self.store.begin().await?;
        subnet(&mut tx, subnet_id).await?;
        let layout = Layout::load(&mut tx, subnet_id).await?;
        let rows = tx.subnet_leases(subnet_id).await?;

        let mut kept = None;
        for row in rows.into_iter().filter(|l| l.address == lease.address) {
            if kept.is_none() && row.same_as(lease) {
                kept = Some(row);
            } else {
                tx.delete_subnet_lease(row.id).await?;
            }
        }
        let row = match kept {
            Some(row) => row,
            None => {
                let mut row = SubnetLease::from_lease(subnet_id, lease, layout.classify(lease));
                row.id = tx.insert_subnet_lease(&row).await?;
                row
            }
        };
        tx.commit().await?;
        debug!(id = row.id, address_type = row.address_type.as_str(), "lease recorded");
        Ok(row)
    }

    async fn live(&self, subnet: &Subnet) -> std::result::Result<Vec<Lease>, UpstreamError> {
        bounded(
            "authority",
            self.timeout,
            self.authority.leases_for_subnet(subnet.family(), subnet.id),
        )
        .await
        .inspect_err(count)
    }
}

fn count(err: &UpstreamError) {
    metrics::UPSTREAM_ERRORS
        .with_label_values(&[err.collaborator()])
        .inc();
}

async fn subnet<T: Transaction>(tx: &mut T, subnet_id: Id) -> Result<Subnet, T::Error> {
    tx.subnet(subnet_id).await?.ok_or(CacheError::NotFound {
        kind: "subnet",
        id: subnet_id,
    })
}

/// what the subnet's address space is carved into, for tagging leases
#[derive(Debug, Default)]
struct Layout {
    reserved: Vec<IpAddr>,
    reserved_prefixes: Vec<Ipv6Net>,
    pools: Vec<IpRange>,
    reserve: Vec<IpRange>,
}

impl Layout {
    async fn load<T: Transaction>(tx: &mut T, subnet_id: Id) -> Result<Self, T::Error> {
        let mut layout = Layout::default();
        for res in tx.reservations(subnet_id).await? {
            layout.reserved.extend(res.addresses);
            layout.reserved_prefixes.extend(res.prefixes);
        }
        layout.pools = tx
            .pools(subnet_id)
            .await?
            .into_iter()
            .map(|p| p.range)
            .collect();
        layout.reserve = tx
            .reserved_pools(subnet_id)
            .await?
            .into_iter()
            .map(|p| p.range)
            .collect();
        layout
            .reserve
            .extend(tx.pd_pools(subnet_id).await?.iter().map(|p| p.range()));
        Ok(layout)
    }

    /// reservation, then dynamic pool, then reserved or pd pool, else exclusion
    fn classify(&self, lease: &Lease) -> AddressType {
        let ip = lease.address;
        let inside = |ranges: &[IpRange]| ranges.iter().any(|r| r.contains(ip).unwrap_or(false));
        if self.reserved.contains(&ip)
            || self
                .reserved_prefixes
                .iter()
                .any(|p| IpAddr::V6(p.network()) == ip)
        {
            AddressType::Reservation
        } else if inside(&self.pools) {
            AddressType::Dynamic
        } else if inside(&self.reserve) {
            AddressType::Reserve
        } else {
            AddressType::Exclusion
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use upstream::{LeaseState, LeaseType};

    use super::*;

    fn lease(ip: &str) -> Lease {
        Lease {
            address: ip.parse().unwrap(),
            hw_address: None,
            duid: Some("00:01:02".into()),
            client_id: None,
            expire: Utc.timestamp_opt(1_800_000_000, 0).unwrap(),
            lease_type: LeaseType::Na,
            state: LeaseState::Default,
            hostname: None,
        }
    }

    #[test]
    fn classify_order() {
        let layout = Layout {
            reserved: vec!["2001:db8::50".parse().unwrap()],
            reserved_prefixes: vec!["2001:db8:1::/56".parse().unwrap()],
            pools: vec![IpRange::parse("2001:db8::10", "2001:db8::ff").unwrap()],
            reserve: vec![IpRange::parse("2001:db8::100", "2001:db8::1ff").unwrap()],
        };
        assert_eq!(layout.classify(&lease("2001:db8::50")), AddressType::Reservation);
        assert_eq!(layout.classify(&lease("2001:db8:1::")), AddressType::Reservation);
        assert_eq!(layout.classify(&lease("2001:db8::20")), AddressType::Dynamic);
        assert_eq!(layout.classify(&lease("2001:db8::120")), AddressType::Reserve);
        assert_eq!(layout.classify(&lease("2001:db8::900")), AddressType::Exclusion);
        // other family never matches a range
        assert_eq!(layout.classify(&lease("10.0.0.20")), AddressType::Exclusion);
    }
}
