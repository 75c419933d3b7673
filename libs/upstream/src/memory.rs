//! in-process collaborators
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use ip_range::Family;
use parking_lot::Mutex;
use tracing::debug;

use crate::{AlarmEvent, AlarmSink, CommandChannel, Lease, LeaseAuthority, UpstreamError};

type LeaseMap = HashMap<(Family, i64), Vec<Lease>>;

/// Lease authority backed by a map, leases are set by whoever owns a clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuthority {
    leases: Arc<Mutex<LeaseMap>>,
    down: Arc<AtomicBool>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// replace the live leases of a subnet
    pub fn set_leases(&self, family: Family, subnet_id: i64, leases: Vec<Lease>) {
        self.leases.lock().insert((family, subnet_id), leases);
    }

    /// add or replace the lease at `lease.address`
    pub fn upsert(&self, family: Family, subnet_id: i64, lease: Lease) {
        let mut guard = self.leases.lock();
        let entry = guard.entry((family, subnet_id)).or_default();
        entry.retain(|l| l.address != lease.address);
        entry.push(lease);
    }

    pub fn remove(&self, family: Family, subnet_id: i64, address: IpAddr) {
        if let Some(entry) = self.leases.lock().get_mut(&(family, subnet_id)) {
            entry.retain(|l| l.address != address);
        }
    }

    /// while `down` every call fails with `Unavailable`
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), UpstreamError> {
        if self.down.load(Ordering::Relaxed) {
            Err(UpstreamError::Unavailable {
                collaborator: "authority",
                reason: "authority marked down".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseAuthority for MemoryAuthority {
    async fn leases_for_subnet(
        &self,
        family: Family,
        subnet_id: i64,
    ) -> Result<Vec<Lease>, UpstreamError> {
        self.check()?;
        Ok(self
            .leases
            .lock()
            .get(&(family, subnet_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn lease_count(&self, family: Family, subnet_id: i64) -> Result<u64, UpstreamError> {
        self.check()?;
        Ok(self
            .leases
            .lock()
            .get(&(family, subnet_id))
            .map_or(0, |l| l.len() as u64))
    }

    async fn lease(
        &self,
        family: Family,
        subnet_id: i64,
        address: IpAddr,
    ) -> Result<Option<Lease>, UpstreamError> {
        self.check()?;
        Ok(self
            .leases
            .lock()
            .get(&(family, subnet_id))
            .and_then(|l| l.iter().find(|l| l.address == address).cloned()))
    }
}

/// Command channel that keeps every sent command
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    down: Arc<AtomicBool>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// names of the commands sent so far, oldest first
    pub fn names(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Relaxed);
    }
}

#[async_trait]
impl CommandChannel for RecordingChannel {
    async fn send(&self, name: &str, payload: Vec<u8>) -> Result<(), UpstreamError> {
        if self.down.load(Ordering::Relaxed) {
            return Err(UpstreamError::Unavailable {
                collaborator: "command",
                reason: "channel marked down".into(),
            });
        }
        debug!(name, len = payload.len(), "command recorded");
        self.sent.lock().push((name.to_owned(), payload));
        Ok(())
    }
}

/// Alarm sink that keeps every event
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<AlarmEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlarmEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AlarmSink for RecordingSink {
    async fn emit(&self, event: AlarmEvent) -> Result<(), UpstreamError> {
        self.events.lock().push(event);
        Ok(())
    }
}
