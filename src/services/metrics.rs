use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder};

lazy_static! {
    // ── Pool lifecycle ──────────────────────────────────────────────────────
    pub static ref TENANT_POOLS_GAUGE: Gauge = register_gauge!(
        "tenantdb_tenant_pools_cached",
        "Tenant connection pools currently cached"
    ).unwrap();

    /// event: opened | reused | raced | evicted_stale | evicted | closed
    pub static ref POOL_EVENTS_COUNTER: CounterVec = register_counter_vec!(
        "tenantdb_pool_events_total",
        "Tenant pool lifecycle events",
        &["event"]
    ).unwrap();

    pub static ref TENANT_REJECTIONS_COUNTER: CounterVec = register_counter_vec!(
        "tenantdb_tenant_rejections_total",
        "Connection requests refused for unknown or inactive tenants",
        &["reason"]
    ).unwrap();

    /// outcome: ready | failed | reconciled
    pub static ref PROVISIONING_COUNTER: CounterVec = register_counter_vec!(
        "tenantdb_provisioning_total",
        "Tenant database provisioning runs by outcome",
        &["outcome"]
    ).unwrap();
}

pub fn pool_event(event: &str) {
    POOL_EVENTS_COUNTER.with_label_values(&[event]).inc();
}

/// Renders every registered metric in the Prometheus text format.
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
