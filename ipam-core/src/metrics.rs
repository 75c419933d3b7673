#![allow(missing_docs)] // lazy_static statics dont play nicely with docstrings

//! # metrics
//!
//! process-wide counters for the probe, the lease cache and upstream calls
use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec,
};

lazy_static! {
    /// completed rogue server scan cycles
    pub static ref PROBE_CYCLES: IntCounter =
        register_int_counter!("probe_cycles", "count of completed rogue dhcp server scans").unwrap();

    /// dhcp servers seen on the wire, by address family
    pub static ref ROGUE_SERVERS_FOUND: IntCounterVec = register_int_counter_vec!(
        "rogue_servers_found",
        "count of dhcp servers answering a scan",
        &["family"]
    )
    .unwrap();

    /// sub-probes that failed before or during the scan, by address family
    pub static ref PROBE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "probe_errors",
        "count of failed rogue server sub-probes",
        &["family"]
    )
    .unwrap();

    /// cached lease rows removed by reconciliation
    pub static ref LEASE_CACHE_PRUNED: IntCounter =
        register_int_counter!("lease_cache_pruned", "count of cached lease rows pruned").unwrap();

    /// failed calls to external collaborators
    pub static ref UPSTREAM_ERRORS: IntCounterVec = register_int_counter_vec!(
        "upstream_errors",
        "count of failed calls to the lease authority, dhcp engine or alarm sink",
        &["collaborator"]
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{PROBE_ERRORS, ROGUE_SERVERS_FOUND, UPSTREAM_ERRORS};

    #[test]
    fn counters_are_registered_and_exposed() {
        ROGUE_SERVERS_FOUND.with_label_values(&["v4"]).inc();
        PROBE_ERRORS.with_label_values(&["v6"]).inc();
        UPSTREAM_ERRORS.with_label_values(&["authority"]).inc();

        let names = gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        for name in ["rogue_servers_found", "probe_errors", "upstream_errors"] {
            assert!(names.contains(name), "registered metric families: {names:?}");
        }
    }
}
