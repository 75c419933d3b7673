use std::{collections::HashSet, fmt, net::IpAddr};

use ip_range::{Family, IpRange, PoolTemplate};
use ipam_core::metrics;
use ipam_store::{
    Id, PdPool, Pool, PoolOptions, Reservation, ReservedPool, StaticAddress, Storage, Subnet,
    Transaction,
};
use ipnet::{IpNet, Ipv6Net};
use tracing::{debug, error, info, instrument};
use upstream::{Command, CommandChannel, Lease, LeaseAuthority, UpstreamError, bounded};

use crate::{
    AllocError, EngineConfig, NewPool, NewReservation, PoolPreview,
    state::{SubnetState, count_in},
};

type Result<T, S> = std::result::Result<T, AllocError<<S as Storage>::Error>>;

/// Validates and applies address-space changes. Collaborators are injected
/// at construction.
pub struct Engine<S, A, C> {
    store: S,
    authority: A,
    commands: C,
    cfg: EngineConfig,
}

impl<S, A, C> fmt::Debug for Engine<S, A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").field("cfg", &self.cfg).finish()
    }
}

impl<S: Clone, A: Clone, C: Clone> Clone for Engine<S, A, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            authority: self.authority.clone(),
            commands: self.commands.clone(),
            cfg: self.cfg.clone(),
        }
    }
}

impl<S, A, C> Engine<S, A, C>
where
    S: Storage,
    A: LeaseAuthority,
    C: CommandChannel,
{
    pub fn new(store: S, authority: A, commands: C, cfg: EngineConfig) -> Self {
        Self {
            store,
            authority,
            commands,
            cfg,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    pub(crate) fn cfg(&self) -> &EngineConfig {
        &self.cfg
    }

    /// register a subnet, its capacity starts at 0
    #[instrument(level = "debug", skip(self))]
    pub async fn create_subnet(&self, subnet: IpNet) -> Result<Subnet, S> {
        let subnet = subnet.trunc();
        let mut tx = self.store.begin().await?;
        let id = tx.insert_subnet(subnet).await?;
        tx.commit().await?;
        info!(id, %subnet, "subnet created");
        Ok(Subnet {
            id,
            subnet,
            capacity: 0,
        })
    }

    pub async fn subnet(&self, subnet_id: Id) -> Result<Subnet, S> {
        let mut tx = self.store.begin().await?;
        tx.subnet(subnet_id).await?.ok_or(AllocError::NotFound {
            kind: "subnet",
            id: subnet_id,
        })
    }

    pub async fn pool(&self, pool_id: Id) -> Result<Pool, S> {
        let mut tx = self.store.begin().await?;
        tx.pool(pool_id).await?.ok_or(AllocError::NotFound {
            kind: "pool",
            id: pool_id,
        })
    }

    /// Create a dynamic pool. The pool's capacity is its size minus the
    /// reserved addresses inside it, and is added to the subnet's capacity.
    #[instrument(level = "debug", skip(self, new))]
    pub async fn create_pool(&self, subnet_id: Id, new: NewPool) -> Result<Pool, S> {
        let mut tx = self.store.begin().await?;
        let state = SubnetState::load(&mut tx, subnet_id).await?;
        let pool = Pool {
            id: 0,
            subnet_id,
            range: new.range,
            capacity: 0,
            template: new.template,
            options: new.options,
        };
        let pool = self.insert_pool(&mut tx, &state, pool).await?;
        tx.commit().await?;
        info!(pool_id = pool.id, range = %pool.range, capacity = pool.capacity, "pool created");

        self.notify(|| {
            Ok(Command::CreatePool {
                subnet_id,
                pool_id: pool.id,
                family: pool.family(),
                range: pool.range,
                options: serde_json::to_value(&pool.options)?,
            })
        })
        .await;
        Ok(pool)
    }

    /// Expand `template` against the subnet and create the resulting pool
    #[instrument(level = "debug", skip(self, template, options), fields(template = %template.name))]
    pub async fn create_pool_from_template(
        &self,
        subnet_id: Id,
        template: &PoolTemplate,
        options: PoolOptions,
    ) -> Result<Pool, S> {
        let range = {
            let mut tx = self.store.begin().await?;
            let state = SubnetState::load(&mut tx, subnet_id).await?;
            template
                .expand(&state.subnet.subnet)
                .map_err(AllocError::InvalidRange)?
        };
        self.create_pool(
            subnet_id,
            NewPool {
                range,
                template: Some(template.name.clone()),
                options,
            },
        )
        .await
    }

    /// Dry run of [`Engine::create_pool`] for a template: nothing is written.
    pub async fn validate_template(
        &self,
        subnet_id: Id,
        template: &PoolTemplate,
    ) -> Result<PoolPreview, S> {
        let mut tx = self.store.begin().await?;
        let state = SubnetState::load(&mut tx, subnet_id).await?;
        let range = template
            .expand(&state.subnet.subnet)
            .map_err(AllocError::InvalidRange)?;
        let pool = Pool {
            id: 0,
            subnet_id,
            range,
            capacity: 0,
            template: Some(template.name.clone()),
            options: PoolOptions::default(),
        };
        state.check_pool(&pool)?;
        let capacity = state.pool_capacity(&range)?;
        debug!(%range, capacity, "template resolves");
        Ok(PoolPreview { range, capacity })
    }

    async fn insert_pool(
        &self,
        tx: &mut S::Tx,
        state: &SubnetState,
        mut pool: Pool,
    ) -> Result<Pool, S> {
        state.check_pool(&pool)?;
        pool.capacity = state.pool_capacity(&pool.range)?;
        pool.id = tx.insert_pool(&pool).await?;
        tx.set_subnet_capacity(
            state.subnet.id,
            state.subnet.capacity.saturating_add(pool.capacity),
        )
        .await?;
        Ok(pool)
    }

    /// Write a pool's administrative options. Range, family, subnet and
    /// capacity always come from storage.
    #[instrument(level = "debug", skip(self, options))]
    pub async fn update_pool(&self, pool_id: Id, options: PoolOptions) -> Result<Pool, S> {
        let mut tx = self.store.begin().await?;
        let mut pool = tx.pool(pool_id).await?.ok_or(AllocError::NotFound {
            kind: "pool",
            id: pool_id,
        })?;
        tx.update_pool_options(pool_id, &options).await?;
        tx.commit().await?;
        pool.options = options;
        debug!(pool_id, "pool options updated");

        self.notify(|| {
            Ok(Command::UpdatePool {
                subnet_id: pool.subnet_id,
                pool_id,
                range: pool.range,
                options: serde_json::to_value(&pool.options)?,
            })
        })
        .await;
        Ok(pool)
    }

    /// Delete a pool that has no live, non-reserved leases. Fails closed when
    /// the lease authority cannot be asked.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_pool(&self, subnet_id: Id, pool_id: Id) -> Result<(), S> {
        let mut tx = self.store.begin().await?;
        let state = SubnetState::load(&mut tx, subnet_id).await?;
        let pool = state
            .pools
            .iter()
            .find(|p| p.id == pool_id)
            .ok_or(AllocError::NotFound {
                kind: "pool",
                id: pool_id,
            })?;

        let leases = self
            .live_leases(state.subnet.family(), subnet_id)
            .await
            .map_err(AllocError::Upstream)?;
        let count = dynamic_in(&state, &pool.range, leases.iter().map(|l| l.address))?;
        if count > 0 {
            return Err(AllocError::LiveLeases {
                pool: pool.to_string(),
                count,
            });
        }

        tx.set_subnet_capacity(subnet_id, state.subnet.capacity.saturating_sub(pool.capacity))
            .await?;
        tx.delete_pool(pool_id).await?;
        tx.commit().await?;
        info!(pool_id, range = %pool.range, "pool deleted");

        let range = pool.range;
        self.notify(|| {
            Ok(Command::DeletePool {
                subnet_id,
                pool_id,
                range,
            })
        })
        .await;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, comment))]
    pub async fn create_reserved_pool(
        &self,
        subnet_id: Id,
        range: IpRange,
        comment: Option<String>,
    ) -> Result<ReservedPool, S> {
        let mut tx = self.store.begin().await?;
        let state = SubnetState::load(&mut tx, subnet_id).await?;
        state.check_reserved_pool(&range)?;
        let mut rp = ReservedPool {
            id: 0,
            subnet_id,
            range,
            comment,
        };
        rp.id = tx.insert_reserved_pool(&rp).await?;
        tx.commit().await?;
        info!(id = rp.id, %range, "reserved pool created");
        Ok(rp)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete_reserved_pool(&self, id: Id) -> Result<(), S> {
        let mut tx = self.store.begin().await?;
        tx.reserved_pool(id).await?.ok_or(AllocError::NotFound {
            kind: "reserved pool",
            id,
        })?;
        tx.delete_reserved_pool(id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// prefix delegation pools live in v6 subnets only
    #[instrument(level = "debug", skip(self))]
    pub async fn create_pd_pool(
        &self,
        subnet_id: Id,
        prefix: Ipv6Net,
        delegated_len: u8,
    ) -> Result<PdPool, S> {
        let mut tx = self.store.begin().await?;
        let state = SubnetState::load(&mut tx, subnet_id).await?;
        let mut pd = PdPool {
            id: 0,
            subnet_id,
            prefix: prefix.trunc(),
            delegated_len,
        };
        state.check_pd_pool(&pd)?;
        pd.id = tx.insert_pd_pool(&pd).await?;
        tx.commit().await?;
        info!(id = pd.id, prefix = %pd.prefix, delegated_len, "pd pool created");
        Ok(pd)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete_pd_pool(&self, id: Id) -> Result<(), S> {
        let mut tx = self.store.begin().await?;
        tx.pd_pool(id).await?.ok_or(AllocError::NotFound {
            kind: "pd pool",
            id,
        })?;
        tx.delete_pd_pool(id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Bind fixed addresses to a client. Every pool holding one of the
    /// addresses loses that much capacity, and so does the subnet.
    #[instrument(level = "debug", skip(self, new), fields(identity = %new.identity))]
    pub async fn create_reservation(
        &self,
        subnet_id: Id,
        new: NewReservation,
    ) -> Result<Reservation, S> {
        if new.addresses.is_empty() && new.prefixes.is_empty() {
            return Err(AllocError::EmptyReservation);
        }
        let mut tx = self.store.begin().await?;
        let state = SubnetState::load(&mut tx, subnet_id).await?;

        if let Some(existing) = state
            .reservations
            .iter()
            .find(|r| r.identity == new.identity)
        {
            return Err(AllocError::Conflict {
                new: format!("reservation for {}", new.identity),
                existing: existing.to_string(),
            });
        }
        let mut seen = HashSet::new();
        for ip in &new.addresses {
            let what = format!("reservation {ip} ({})", new.identity);
            if !seen.insert(*ip) {
                return Err(AllocError::Conflict {
                    existing: what.clone(),
                    new: what,
                });
            }
            state.check_fixed_address(*ip, &what)?;
        }
        if !new.prefixes.is_empty() && state.subnet.family() != Family::V6 {
            return Err(AllocError::FamilyMismatch {
                subnet: state.subnet.subnet,
                resource: format!("reservation prefixes ({})", new.identity),
            });
        }

        let mut reservation = Reservation {
            id: 0,
            subnet_id,
            identity: new.identity,
            addresses: new.addresses,
            prefixes: new.prefixes.into_iter().map(|p| p.trunc()).collect(),
        };
        reservation.id = tx.insert_reservation(&reservation).await?;

        let mut deducted = 0;
        for pool in &state.pools {
            let n = count_in(&pool.range, reservation.addresses.iter().copied())?;
            if n > 0 {
                tx.set_pool_capacity(pool.id, pool.capacity.saturating_sub(n))
                    .await?;
                deducted += n;
            }
        }
        if deducted > 0 {
            tx.set_subnet_capacity(subnet_id, state.subnet.capacity.saturating_sub(deducted))
                .await?;
        }
        tx.commit().await?;
        info!(id = reservation.id, deducted, "reservation created");
        Ok(reservation)
    }

    /// inverse of [`Engine::create_reservation`]: capacity goes back to the pools
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_reservation(&self, id: Id) -> Result<(), S> {
        let mut tx = self.store.begin().await?;
        let reservation = tx.reservation(id).await?.ok_or(AllocError::NotFound {
            kind: "reservation",
            id,
        })?;
        let state = SubnetState::load(&mut tx, reservation.subnet_id).await?;

        let mut restored = 0u64;
        for pool in &state.pools {
            let n = count_in(&pool.range, reservation.addresses.iter().copied())?;
            if n > 0 {
                let capacity = pool
                    .capacity
                    .saturating_add(n)
                    .min(pool.range.capacity());
                tx.set_pool_capacity(pool.id, capacity).await?;
                restored += capacity.saturating_sub(pool.capacity);
            }
        }
        if restored > 0 {
            tx.set_subnet_capacity(
                state.subnet.id,
                state.subnet.capacity.saturating_add(restored),
            )
            .await?;
        }
        tx.delete_reservation(id).await?;
        tx.commit().await?;
        info!(id, restored, "reservation deleted");
        Ok(())
    }

    /// An address managed outside the pool model. It may not sit inside any
    /// pool or reserved pool, and may not be reserved already.
    #[instrument(level = "debug", skip(self, identity))]
    pub async fn create_static_address(
        &self,
        subnet_id: Id,
        address: IpAddr,
        identity: ipam_store::ClientIdentity,
    ) -> Result<StaticAddress, S> {
        let mut tx = self.store.begin().await?;
        let state = SubnetState::load(&mut tx, subnet_id).await?;
        let what = format!("static address {address} ({identity})");
        state.check_static(address, &what)?;
        let mut st = StaticAddress {
            id: 0,
            subnet_id,
            address,
            identity,
        };
        st.id = tx.insert_static_address(&st).await?;
        tx.commit().await?;
        info!(id = st.id, %address, "static address created");
        Ok(st)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete_static_address(&self, id: Id) -> Result<(), S> {
        let mut tx = self.store.begin().await?;
        tx.static_address(id).await?.ok_or(AllocError::NotFound {
            kind: "static address",
            id,
        })?;
        tx.delete_static_address(id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// live leases of a subnet, bounded by the upstream timeout
    pub(crate) async fn live_leases(
        &self,
        family: Family,
        subnet_id: Id,
    ) -> std::result::Result<Vec<Lease>, UpstreamError> {
        bounded(
            "authority",
            self.cfg.upstream_timeout,
            self.authority.leases_for_subnet(family, subnet_id),
        )
        .await
        .inspect_err(|err| {
            metrics::UPSTREAM_ERRORS
                .with_label_values(&[err.collaborator()])
                .inc()
        })
    }

    /// Send a pool command once the local change is committed. A failure is
    /// logged and counted, the local change stays.
    async fn notify<F>(&self, build: F)
    where
        F: FnOnce() -> std::result::Result<Command, UpstreamError>,
    {
        let res = match build() {
            Ok(cmd) => bounded(
                "command",
                self.cfg.upstream_timeout,
                cmd.dispatch(&self.commands),
            )
            .await
            .map(|_| cmd.name()),
            Err(err) => Err(err),
        };
        match res {
            Ok(name) => debug!(command = name, "dhcp engine notified"),
            Err(err) => {
                metrics::UPSTREAM_ERRORS
                    .with_label_values(&[err.collaborator()])
                    .inc();
                error!(?err, "failed to notify dhcp engine, local change kept");
            }
        }
    }
}

/// leases in `range` that are not attributed to a reservation
pub(crate) fn dynamic_in<E>(
    state: &SubnetState,
    range: &IpRange,
    addresses: impl IntoIterator<Item = IpAddr>,
) -> std::result::Result<u64, AllocError<E>> {
    count_in(
        range,
        addresses.into_iter().filter(|ip| !state.is_reserved(*ip)),
    )
}
