// Prometheus metrics for tunnels and the resource cache.

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static::lazy_static! {
    // Tunnel lifecycle
    pub static ref TUNNELS_OPENED: IntCounter = register_int_counter!(
        "culvert_tunnels_opened_total",
        "Total number of tunnels successfully established"
    ).unwrap();

    pub static ref TUNNELS_CLOSED: IntCounter = register_int_counter!(
        "culvert_tunnels_closed_total",
        "Total number of tunnels torn down"
    ).unwrap();

    pub static ref TUNNELS_FAILED: IntCounterVec = register_int_counter_vec!(
        "culvert_tunnels_failed_total",
        "Total number of tunnel setups that failed, by reason",
        &["reason"]
    ).unwrap();

    pub static ref TUNNELS_ACTIVE: IntGauge = register_int_gauge!(
        "culvert_tunnels_active",
        "Tunnels currently open"
    ).unwrap();

    pub static ref TUNNEL_BYTES: IntCounterVec = register_int_counter_vec!(
        "culvert_tunnel_bytes_total",
        "Bytes relayed through tunnels, by direction",
        &["direction"]
    ).unwrap();

    // Resource cache
    pub static ref CACHE_HITS: IntCounter = register_int_counter!(
        "culvert_cache_hits_total",
        "Resource cache lookups served from cache"
    ).unwrap();

    pub static ref CACHE_MISSES: IntCounter = register_int_counter!(
        "culvert_cache_misses_total",
        "Resource cache lookups that had to load from disk"
    ).unwrap();

    pub static ref CACHE_EVICTIONS: IntCounterVec = register_int_counter_vec!(
        "culvert_cache_evictions_total",
        "Resource cache evictions, by reason",
        &["reason"]
    ).unwrap();
}
