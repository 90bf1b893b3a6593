pub mod metrics;
pub mod provisioning;
pub mod tenant_sweeper;
