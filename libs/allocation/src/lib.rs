//! # allocation
//!
//! The allocation & conflict engine. [`Engine`] decides whether a pool,
//! reserved pool, prefix delegation pool, reservation or static address may
//! be created, and keeps pool and subnet capacity consistent while
//! reservations come and go.
//!
//! Every mutation runs in a single store [`Transaction`]: the subnet and all
//! of its allocations are re-read inside it, checked, written and committed.
//! Any failed check returns early and the dropped transaction rolls back.
//! Pool commands for the DHCP engine are only sent once the local commit
//! succeeded, and a failed send never undoes the local change.
//!
//! [`Transaction`]: ipam_store::Transaction
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

use std::time::Duration;

use ip_range::{IpRange, RangeError};
use ipam_core::config::cli::DEFAULT_UPSTREAM_TIMEOUT;
use ipam_store::{ClientIdentity, Id, PoolOptions};
use ipnet::{IpNet, Ipv6Net};
use thiserror::Error;
use upstream::UpstreamError;

mod engine;
mod state;
mod usage;

pub use engine::Engine;
pub use usage::{Usage, UsageSource};

#[derive(Error, Debug)]
pub enum AllocError<E> {
    #[error("database error")]
    DbError(#[from] E),
    #[error("no {kind} with id {id}")]
    NotFound { kind: &'static str, id: Id },
    #[error("{resource} does not match the address family of subnet {subnet}")]
    FamilyMismatch { subnet: IpNet, resource: String },
    #[error("{resource} is not inside subnet {subnet}")]
    OutsideSubnet { subnet: IpNet, resource: String },
    #[error("invalid range")]
    InvalidRange(#[source] RangeError),
    #[error("dynamic pools in subnet {subnet} require a /{required} prefix")]
    PrefixLength { subnet: IpNet, required: u8 },
    #[error("delegated length {delegated_len} is invalid for prefix {prefix}")]
    InvalidDelegatedLength { prefix: Ipv6Net, delegated_len: u8 },
    #[error("reservation holds no address or prefix")]
    EmptyReservation,
    #[error("{new} conflicts with {existing}")]
    Conflict { new: String, existing: String },
    #[error("{pool} still has {count} live leases")]
    LiveLeases { pool: String, count: u64 },
    #[error("upstream error")]
    Upstream(#[source] UpstreamError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// bound on every lease authority & command channel call
    pub upstream_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT),
        }
    }
}

/// a dynamic pool to create. A `template` name marks a range that was
/// expanded from a template rather than typed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPool {
    pub range: IpRange,
    pub template: Option<String>,
    pub options: PoolOptions,
}

/// what a template would resolve to in a subnet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPreview {
    pub range: IpRange,
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub identity: ClientIdentity,
    pub addresses: Vec<std::net::IpAddr>,
    pub prefixes: Vec<Ipv6Net>,
}
