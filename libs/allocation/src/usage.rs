//! read-time usage figures, never stored
use std::net::IpAddr;

use ipam_store::{Id, Storage, Transaction};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use upstream::{CommandChannel, LeaseAuthority, bounded};

use crate::{
    AllocError, Engine,
    engine::dynamic_in,
    state::SubnetState,
};

/// where the used count came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    /// the lease authority answered
    Live,
    /// the authority failed, counted from cached leases
    Cache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub used_count: u64,
    pub capacity: u64,
    /// `used_count / capacity` to 4 decimal places, unset when capacity is 0
    pub used_ratio: Option<String>,
    pub source: UsageSource,
}

impl Usage {
    pub fn new(used_count: u64, capacity: u64, source: UsageSource) -> Self {
        Self {
            used_count,
            capacity,
            used_ratio: used_ratio(used_count, capacity),
            source,
        }
    }
}

fn used_ratio(used: u64, capacity: u64) -> Option<String> {
    (capacity != 0).then(|| format!("{:.4}", used as f64 / capacity as f64))
}

type Result<T, S> = std::result::Result<T, AllocError<<S as Storage>::Error>>;

impl<S, A, C> Engine<S, A, C>
where
    S: Storage,
    A: LeaseAuthority,
    C: CommandChannel,
{
    /// addresses in the subnet the authority currently reports, or the
    /// cached ones when it can't be reached
    async fn addresses_in_use(
        &self,
        tx: &mut S::Tx,
        state: &SubnetState,
    ) -> Result<(Vec<IpAddr>, UsageSource), S> {
        match self.live_leases(state.subnet.family(), state.subnet.id).await {
            Ok(leases) => Ok((
                leases.into_iter().map(|l| l.address).collect(),
                UsageSource::Live,
            )),
            Err(err) => {
                warn!(?err, subnet_id = state.subnet.id, "lease authority failed, using cached leases");
                let cached = tx.subnet_leases(state.subnet.id).await?;
                Ok((
                    cached.into_iter().map(|l| l.address).collect(),
                    UsageSource::Cache,
                ))
            }
        }
    }

    /// Dynamic usage of a pool. Leases at reserved addresses are the
    /// reservation's, not the pool's.
    #[instrument(level = "debug", skip(self))]
    pub async fn pool_usage(&self, pool_id: Id) -> Result<Usage, S> {
        let mut tx = self.store().begin().await?;
        let pool = tx.pool(pool_id).await?.ok_or(AllocError::NotFound {
            kind: "pool",
            id: pool_id,
        })?;
        let state = SubnetState::load(&mut tx, pool.subnet_id).await?;
        let (addresses, source) = self.addresses_in_use(&mut tx, &state).await?;
        let used = dynamic_in(&state, &pool.range, addresses)?;
        debug!(used, capacity = pool.capacity, ?source, "pool usage");
        Ok(Usage::new(used, pool.capacity, source))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn subnet_usage(&self, subnet_id: Id) -> Result<Usage, S> {
        let mut tx = self.store().begin().await?;
        let state = SubnetState::load(&mut tx, subnet_id).await?;
        let capacity = state.subnet.capacity;

        if state.reservations.is_empty() {
            // nothing to subtract, the authority's count is the answer
            let count = bounded(
                "authority",
                self.cfg().upstream_timeout,
                self.authority()
                    .lease_count(state.subnet.family(), subnet_id),
            )
            .await;
            match count {
                Ok(used) => return Ok(Usage::new(used, capacity, UsageSource::Live)),
                Err(err) => {
                    ipam_core::metrics::UPSTREAM_ERRORS
                        .with_label_values(&[err.collaborator()])
                        .inc();
                    warn!(?err, subnet_id, "lease authority failed, using cached leases");
                    let used = tx.subnet_leases(subnet_id).await?.len() as u64;
                    return Ok(Usage::new(used, capacity, UsageSource::Cache));
                }
            }
        }

        let (addresses, source) = self.addresses_in_use(&mut tx, &state).await?;
        let used = addresses
            .into_iter()
            .filter(|ip| !state.is_reserved(*ip))
            .count() as u64;
        Ok(Usage::new(used, capacity, source))
    }

    /// how many of a reservation's addresses are leased right now, tracked
    /// apart from any pool's usage
    #[instrument(level = "debug", skip(self))]
    pub async fn reservation_usage(&self, reservation_id: Id) -> Result<Usage, S> {
        let mut tx = self.store().begin().await?;
        let reservation = tx
            .reservation(reservation_id)
            .await?
            .ok_or(AllocError::NotFound {
                kind: "reservation",
                id: reservation_id,
            })?;
        let state = SubnetState::load(&mut tx, reservation.subnet_id).await?;
        let (addresses, source) = self.addresses_in_use(&mut tx, &state).await?;
        let used = addresses
            .iter()
            .filter(|ip| {
                reservation.addresses.contains(ip)
                    || reservation.prefixes.iter().any(|p| IpAddr::V6(p.network()) == **ip)
            })
            .count() as u64;
        Ok(Usage::new(used, reservation.capacity(), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_formatting() {
        assert_eq!(used_ratio(0, 91).as_deref(), Some("0.0000"));
        assert_eq!(used_ratio(1, 3).as_deref(), Some("0.3333"));
        assert_eq!(used_ratio(90, 90).as_deref(), Some("1.0000"));
        assert_eq!(used_ratio(5, 0), None);
    }
}
