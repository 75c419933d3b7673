#![allow(clippy::cognitive_complexity)]
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use ipam_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    env::parse_secs_opt,
    tokio::{self, runtime::Builder, signal, time},
    tokio_util::sync::CancellationToken,
    tracing::*,
};
use ipam_store::sqlite::SqliteDb;
use rogue_probe::{ProbeConfig, start_rogue_server_probe};
use upstream::TracingSink;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// how long the probe gets to wind down after ctrl-c, override with IPAM_SHUTDOWN_GRACE (secs)
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.ipam_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start ipamd"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let database_url = config.database_url.clone();
    info!(?database_url, "using database at path");
    // opening the pool also runs migrations
    let _store = SqliteDb::new(&database_url)
        .await
        .with_context(|| format!("failed to open database {database_url}"))?;

    let token = CancellationToken::new();
    let shutdown = tokio::spawn(shutdown_signal(token.clone()));

    let probe = if config.no_probe {
        info!("rogue dhcp server probe disabled");
        None
    } else {
        Some(start_rogue_server_probe(
            ProbeConfig::from(&config),
            TracingSink,
        ))
    };

    token.cancelled().await;
    info!("shutting down");
    if let Some(probe) = probe {
        probe.cancel();
        let grace = parse_secs_opt("IPAM_SHUTDOWN_GRACE").unwrap_or(DEFAULT_SHUTDOWN_GRACE);
        if time::timeout(grace, probe.join()).await.is_err() {
            warn!(?grace, "rogue server probe did not stop in time");
        }
    }
    shutdown.await.map_err(|err| anyhow!(err))?
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
