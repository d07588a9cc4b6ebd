// Warden - tenant-aware admission control for metrics remote-write
// File: warden-core/src/lib.rs

//! Core admission-control engine.
//!
//! Everything here is synchronous and in-memory: token buckets, the
//! tenant registry with its rolling activity windows and denial rings,
//! the remote-write payload decoder, and the decision engine that ties
//! them together. Network adapters live in `warden-service`; this crate
//! never does I/O on the decision path.

pub mod bucket;
pub mod decision;
pub mod decode;
pub mod denial;
pub mod engine;
pub mod limits;
pub mod registry;
pub mod remote_write;
pub mod window;

pub use bucket::TokenBucket;
pub use decision::{Decision, Observed, Reason, Verdict};
pub use decode::{DecodeError, ParseResult, SampleMetric};
pub use denial::{DenialRecord, DenialRing};
pub use engine::{BodySource, Engine, EngineConfig};
pub use limits::{EnforcementConfig, TenantLimits};
pub use registry::{
    spawn_aggregator, AggregatorHandle, BucketInfo, Commit, Overview, RegistryConfig, Tenant,
    TenantCounters, TenantInfo, TenantRates, TenantRegistry,
};
pub use window::{RollingWindow, WindowSlot, WindowTotals};
