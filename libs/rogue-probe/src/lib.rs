//! # rogue-probe
//!
//! Periodically asks the local links who is handing out addresses. Each cycle
//! broadcasts a DHCPDISCOVER and multicasts a DHCPv6 Solicit at the same
//! time, listens for the read timeout, and raises an
//! [`AlarmEvent::IllegalDhcpServer`] for every server that answered.
//!
//! A sub-probe that fails (no interface, no permission for raw sockets) is
//! logged and counted; the other family still runs. Hearing nothing before
//! the timeout is a normal, empty result.
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

use std::{future::Future, net::IpAddr, sync::Arc, time::Duration};

use ipam_core::{
    config::cli,
    metrics,
    pnet::datalink::{self, MacAddr},
    tokio::{
        self,
        task::{JoinHandle, JoinSet},
        time::{self, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
};
use tracing::{debug, error, info, warn};
use upstream::{AlarmEvent, AlarmSink, bounded};

mod error;
mod interfaces;
mod v4;
mod v6;

pub use error::ProbeError;
pub use interfaces::{Selected, Sources};

/// a server that answered a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpServer {
    pub address: IpAddr,
    pub mac: Option<MacAddr>,
}

impl From<DhcpServer> for AlarmEvent {
    fn from(server: DhcpServer) -> Self {
        AlarmEvent::IllegalDhcpServer {
            address: server.address,
            mac: server.mac.map(|m| m.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// time between two scans
    pub interval: Duration,
    /// how long each scan listens for replies
    pub timeout: Duration,
    /// bound on each alarm delivery
    pub alarm_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(cli::DEFAULT_PROBE_INTERVAL),
            timeout: Duration::from_secs(cli::DEFAULT_PROBE_TIMEOUT),
            alarm_timeout: Duration::from_secs(cli::DEFAULT_UPSTREAM_TIMEOUT),
        }
    }
}

impl From<&cli::Config> for ProbeConfig {
    fn from(cfg: &cli::Config) -> Self {
        Self {
            interval: cfg.probe_interval(),
            timeout: cfg.probe_timeout(),
            alarm_timeout: cfg.upstream_timeout(),
        }
    }
}

/// Handle to the running probe task
#[derive(Debug)]
pub struct ProbeHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ProbeHandle {
    /// stop after the current step, undelivered alarms are dropped
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// wait for the task to exit
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            error!(?err, "rogue server probe task failed");
        }
    }
}

/// Spawn the scan loop. The first scan runs right away, then one every
/// `config.interval` until the handle is cancelled.
pub fn start_rogue_server_probe<S>(config: ProbeConfig, sink: S) -> ProbeHandle
where
    S: AlarmSink + 'static,
{
    spawn_with(config, sink, scan)
}

fn spawn_with<S, F, Fut>(config: ProbeConfig, sink: S, scanner: F) -> ProbeHandle
where
    S: AlarmSink + 'static,
    F: Fn(Duration, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Vec<DhcpServer>> + Send + 'static,
{
    let token = CancellationToken::new();
    let task = tokio::spawn(run(config, Arc::new(sink), scanner, token.clone()));
    info!(interval = ?config.interval, timeout = ?config.timeout, "rogue server probe started");
    ProbeHandle { token, task }
}

async fn run<S, F, Fut>(config: ProbeConfig, sink: Arc<S>, scanner: F, token: CancellationToken)
where
    S: AlarmSink + 'static,
    F: Fn(Duration, CancellationToken) -> Fut,
    Fut: Future<Output = Vec<DhcpServer>>,
{
    let mut ticker = time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reports = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(res) = reports.join_next(), if !reports.is_empty() => {
                if let Err(err) = res {
                    error!(?err, "alarm task failed");
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        // the scan sees the token itself so its sockets are closed before we exit
        let servers = scanner(config.timeout, token.clone()).await;
        if token.is_cancelled() {
            break;
        }
        metrics::PROBE_CYCLES.inc();
        debug!(found = servers.len(), "rogue server scan finished");
        for server in servers {
            let sink = sink.clone();
            reports.spawn(report(sink, server, config.alarm_timeout));
        }
    }
    reports.abort_all();
    info!("rogue server probe stopped");
}

async fn report<S: AlarmSink>(sink: Arc<S>, server: DhcpServer, timeout: Duration) {
    let event = AlarmEvent::from(server);
    if let Err(err) = bounded("alarm", timeout, sink.emit(event)).await {
        metrics::UPSTREAM_ERRORS
            .with_label_values(&[err.collaborator()])
            .inc();
        error!(?err, address = %server.address, "failed to raise rogue server alarm");
    }
}

/// One scan over the current interfaces: v4 then v6, each deduplicated by
/// server address. Returns early with what was heard once `cancel` fires.
pub async fn scan(timeout: Duration, cancel: CancellationToken) -> Vec<DhcpServer> {
    let sources = Sources::select(&datalink::interfaces());
    scan_sources(&sources, timeout, cancel).await
}

pub async fn scan_sources(
    sources: &Sources,
    timeout: Duration,
    cancel: CancellationToken,
) -> Vec<DhcpServer> {
    let v4 = async {
        match sources.v4.clone() {
            Some(src) => v4::probe(src, timeout, cancel.clone()).await,
            None => Err(ProbeError::NoInterface { family: "v4" }),
        }
    };
    let v6 = async {
        match sources.v6().cloned() {
            Some(src) => v6::probe(src, timeout, cancel.clone()).await,
            None => Err(ProbeError::NoInterface { family: "v6" }),
        }
    };
    let (v4, v6) = tokio::join!(v4, v6);
    let mut found = settle("v4", v4);
    found.extend(settle("v6", v6));
    found
}

fn settle(family: &'static str, res: Result<Vec<DhcpServer>, ProbeError>) -> Vec<DhcpServer> {
    match res {
        Ok(servers) => {
            let servers = dedup(servers);
            metrics::ROGUE_SERVERS_FOUND
                .with_label_values(&[family])
                .inc_by(servers.len() as u64);
            servers
        }
        Err(err) => {
            metrics::PROBE_ERRORS.with_label_values(&[family]).inc();
            if matches!(err, ProbeError::NoInterface { .. }) {
                debug!(?err, family, "skipping sub-probe");
            } else {
                warn!(?err, family, "sub-probe failed");
            }
            Vec::new()
        }
    }
}

/// one entry per address, the last answer wins
fn dedup(servers: Vec<DhcpServer>) -> Vec<DhcpServer> {
    let mut out: Vec<DhcpServer> = Vec::with_capacity(servers.len());
    for server in servers {
        match out.iter_mut().find(|s| s.address == server.address) {
            Some(seen) => *seen = server,
            None => out.push(server),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;
    use upstream::memory::RecordingSink;

    use super::*;

    fn server(ip: &str, last: u8) -> DhcpServer {
        DhcpServer {
            address: ip.parse().unwrap(),
            mac: Some(MacAddr(2, 0, 0, 0, 0, last)),
        }
    }

    #[test]
    fn last_answer_wins() {
        let out = dedup(vec![
            server("10.0.0.1", 1),
            server("10.0.0.2", 2),
            server("10.0.0.1", 3),
        ]);
        assert_eq!(out, vec![server("10.0.0.1", 3), server("10.0.0.2", 2)]);
    }

    #[test]
    fn alarm_carries_mac() {
        let event = AlarmEvent::from(server("10.0.0.1", 0xab));
        assert_eq!(
            event,
            AlarmEvent::IllegalDhcpServer {
                address: "10.0.0.1".parse().unwrap(),
                mac: Some("02:00:00:00:00:ab".into()),
            }
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn no_interfaces_no_servers() {
        let found = scan_sources(
            &Sources::default(),
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await;
        assert!(found.is_empty());
        assert!(logs_contain("skipping sub-probe"));
    }

    #[tokio::test]
    async fn every_answer_becomes_an_alarm() {
        let sink = RecordingSink::new();
        let cfg = ProbeConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(10),
            alarm_timeout: Duration::from_secs(1),
        };
        let handle = spawn_with(cfg, sink.clone(), |_timeout, _cancel| async {
            vec![server("10.0.0.1", 1), server("fe80::1", 2)]
        });

        for _ in 0..100 {
            if sink.events().len() == 2 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.contains(&AlarmEvent::from(server("fe80::1", 2))));

        handle.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn cancel_stops_a_scan_in_flight() {
        let cfg = ProbeConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(3600),
            alarm_timeout: Duration::from_secs(1),
        };
        let sink = RecordingSink::new();
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = closed.clone();
        let handle = spawn_with(cfg, sink.clone(), move |timeout, cancel: CancellationToken| {
            let closed = closed.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = time::sleep(timeout) => {}
                }
                // stands in for the sockets being dropped
                closed.store(true, std::sync::atomic::Ordering::SeqCst);
                vec![server("10.0.0.1", 1)]
            }
        });
        time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
        // the scan wound down before the handle reported done
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
        assert!(sink.events().is_empty());
    }
}
