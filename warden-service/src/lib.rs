// Warden - tenant-aware admission control
// File: warden-service/src/lib.rs

//! The deployable admission-control service: Envoy ext_authz and
//! rate-limit-service gRPC adapters over the `warden-core` engine, plus
//! the admin HTTP surface, Prometheus metrics and configuration.

pub mod admin;
pub mod grpc;
pub mod metrics;
pub mod proto;
pub mod settings;

pub use metrics::WardenMetrics;
pub use settings::Settings;
