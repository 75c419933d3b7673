//! # upstream
//!
//! The collaborators the address-space core talks to but does not own:
//!
//! * [`LeaseAuthority`] - the DHCP engine's live view of issued leases
//! * [`CommandChannel`] - fire-and-forget pool commands to the DHCP engine
//! * [`AlarmSink`] - where rogue server findings are reported
//!
//! Implementations are constructed once at startup and handed to the engine,
//! cache and probe. The [`memory`] module has in-process versions used by the
//! daemon's standalone mode and by tests.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{future::Future, net::IpAddr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ip_range::{Family, IpRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod memory;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable {
        collaborator: &'static str,
        reason: String,
    },
    #[error("{collaborator} did not answer within {timeout:?}")]
    Timeout {
        collaborator: &'static str,
        timeout: Duration,
    },
    #[error("{collaborator} rejected the request: {reason}")]
    Rejected {
        collaborator: &'static str,
        reason: String,
    },
    #[error("failed to encode payload")]
    Encode(#[from] serde_json::Error),
}

impl UpstreamError {
    /// which collaborator failed, used as a metric label
    pub fn collaborator(&self) -> &'static str {
        match self {
            UpstreamError::Unavailable { collaborator, .. }
            | UpstreamError::Timeout { collaborator, .. }
            | UpstreamError::Rejected { collaborator, .. } => *collaborator,
            UpstreamError::Encode(_) => "command",
        }
    }
}

/// Run `fut` against `collaborator`, turning an elapsed `timeout` into
/// [`UpstreamError::Timeout`]
pub async fn bounded<T, F>(
    collaborator: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(UpstreamError::Timeout {
            collaborator,
            timeout,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseType {
    V4,
    /// v6 non-temporary address
    Na,
    /// v6 temporary address
    Ta,
    /// v6 delegated prefix
    Pd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Default,
    Declined,
    ExpiredReclaimed,
}

macro_rules! str_enum {
    ($ty:ty, $err:literal, $($var:path => $s:literal),+ $(,)?) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($var => $s,)+
                }
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($var),)+
                    other => Err(format!(concat!("unknown ", $err, " {:?}"), other)),
                }
            }
        }
    };
}

str_enum!(LeaseType, "lease type",
    LeaseType::V4 => "v4",
    LeaseType::Na => "na",
    LeaseType::Ta => "ta",
    LeaseType::Pd => "pd",
);

str_enum!(LeaseState, "lease state",
    LeaseState::Default => "default",
    LeaseState::Declined => "declined",
    LeaseState::ExpiredReclaimed => "expired_reclaimed",
);

/// A lease as currently reported by the DHCP engine. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub address: IpAddr,
    pub hw_address: Option<String>,
    pub duid: Option<String>,
    pub client_id: Option<String>,
    pub expire: DateTime<Utc>,
    pub lease_type: LeaseType,
    pub state: LeaseState,
    pub hostname: Option<String>,
}

#[async_trait]
pub trait LeaseAuthority: Send + Sync + 'static {
    /// every live lease of the subnet with numeric id `subnet_id`
    async fn leases_for_subnet(
        &self,
        family: Family,
        subnet_id: i64,
    ) -> Result<Vec<Lease>, UpstreamError>;

    async fn lease_count(&self, family: Family, subnet_id: i64) -> Result<u64, UpstreamError>;

    /// `Ok(None)` when nothing is leased at `address`
    async fn lease(
        &self,
        family: Family,
        subnet_id: i64,
        address: IpAddr,
    ) -> Result<Option<Lease>, UpstreamError>;
}

#[async_trait]
pub trait CommandChannel: Send + Sync + 'static {
    /// deliver a named, serialized command. No reply is expected
    async fn send(&self, name: &str, payload: Vec<u8>) -> Result<(), UpstreamError>;
}

/// Pool changes forwarded to the DHCP engine after they are committed locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command", content = "arguments")]
pub enum Command {
    CreatePool {
        subnet_id: i64,
        pool_id: i64,
        family: Family,
        range: IpRange,
        options: serde_json::Value,
    },
    UpdatePool {
        subnet_id: i64,
        pool_id: i64,
        range: IpRange,
        options: serde_json::Value,
    },
    DeletePool {
        subnet_id: i64,
        pool_id: i64,
        range: IpRange,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreatePool { .. } => "create_pool",
            Command::UpdatePool { .. } => "update_pool",
            Command::DeletePool { .. } => "delete_pool",
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>, UpstreamError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// serialize and send over `channel`
    pub async fn dispatch<C>(&self, channel: &C) -> Result<(), UpstreamError>
    where
        C: CommandChannel + ?Sized,
    {
        channel.send(self.name(), self.payload()?).await
    }
}

/// Events raised for the alarm pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AlarmEvent {
    /// a DHCP server answered a scan
    IllegalDhcpServer { address: IpAddr, mac: Option<String> },
}

impl AlarmEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AlarmEvent::IllegalDhcpServer { .. } => "illegal_dhcp_server",
        }
    }
}

#[async_trait]
pub trait AlarmSink: Send + Sync + 'static {
    async fn emit(&self, event: AlarmEvent) -> Result<(), UpstreamError>;
}

/// Alarm sink that only writes the event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AlarmSink for TracingSink {
    async fn emit(&self, event: AlarmEvent) -> Result<(), UpstreamError> {
        match &event {
            AlarmEvent::IllegalDhcpServer { address, mac } => {
                warn!(kind = event.kind(), %address, ?mac, "dhcp server detected on the wire");
            }
        }
        Ok(())
    }
}
