//! ipamd configs

pub mod cli {
    //! Parse from either cli or env var

    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "ipam-worker";
    /// default database location
    pub const DEFAULT_DATABASE_URL: &str = "/var/lib/ipamd/ipam.db";
    /// default log level. Can use this argument or IPAM_LOG env var
    pub const DEFAULT_IPAM_LOG: &str = "info";
    /// seconds between two rogue server scans
    pub const DEFAULT_PROBE_INTERVAL: u64 = 750;
    /// seconds a single scan waits for replies
    pub const DEFAULT_PROBE_TIMEOUT: u64 = 10;
    /// seconds to wait on the lease authority / dhcp engine before giving up
    pub const DEFAULT_UPSTREAM_TIMEOUT: u64 = 5;

    use std::time::Duration;

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "ipamd", bin_name = "ipamd", about, long_about = None)]
    /// parses from cli & environment var. ipamd will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// Path to the database, use "sqlite::memory:" for an in memory db
        #[clap(short, long, env, value_parser, default_value = DEFAULT_DATABASE_URL)]
        pub database_url: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_IPAM_LOG)]
        pub ipam_log: String,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of logical cpus
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// seconds between rogue dhcp server scans
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PROBE_INTERVAL)]
        pub probe_interval: u64,
        /// seconds each scan listens for replies
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PROBE_TIMEOUT)]
        pub probe_timeout: u64,
        /// disable the rogue dhcp server scan
        #[clap(long, env)]
        pub no_probe: bool,
        /// timeout for calls to the lease authority & dhcp engine
        #[clap(long, env, value_parser, default_value_t = DEFAULT_UPSTREAM_TIMEOUT)]
        pub upstream_timeout: u64,
    }

    impl Config {
        /// scan interval as `Duration`
        pub fn probe_interval(&self) -> Duration {
            Duration::from_secs(self.probe_interval)
        }

        /// scan read timeout as `Duration`
        pub fn probe_timeout(&self) -> Duration {
            Duration::from_secs(self.probe_timeout)
        }

        /// upstream call timeout as `Duration`
        pub fn upstream_timeout(&self) -> Duration {
            Duration::from_secs(self.upstream_timeout)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn defaults() {
            let cfg = Config::parse_from(["ipamd"]);
            assert_eq!(cfg.probe_interval(), Duration::from_secs(750));
            assert_eq!(cfg.probe_timeout(), Duration::from_secs(10));
            assert_eq!(cfg.upstream_timeout(), Duration::from_secs(5));
            assert!(!cfg.no_probe);
        }

        #[test]
        fn flags_override() {
            let cfg = Config::parse_from([
                "ipamd",
                "--probe-interval",
                "30",
                "--no-probe",
                "-d",
                "sqlite::memory:",
            ]);
            assert_eq!(cfg.probe_interval(), Duration::from_secs(30));
            assert!(cfg.no_probe);
            assert_eq!(cfg.database_url, "sqlite::memory:");
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Logging configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Log level comes from IPAM_LOG
        pub fn parse(ipam_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(ipam_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("sqlx=warn".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
