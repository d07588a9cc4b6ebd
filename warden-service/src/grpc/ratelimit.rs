// Warden - tenant-aware admission control
// File: warden-service/src/grpc/ratelimit.rs

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tonic::{Request, Response, Status};
use tracing::info;
use warden_core::{BodySource, Engine};

use crate::grpc::{admit, parse_grpc_timeout, InflightGuard};
use crate::metrics::WardenMetrics;
use crate::proto::envoy::service::ratelimit::v3::{
    rate_limit_response::{self, rate_limit::Unit, Code, DescriptorStatus},
    rate_limit_service_server::RateLimitService,
    RateLimitRequest, RateLimitResponse,
};

/// Descriptor entry key carrying the tenant identity.
const TENANT_DESCRIPTOR_KEY: &str = "tenant_id";

/// Envoy rate-limit-service adapter. Each descriptor is evaluated
/// through the decision engine as a descriptor-only rate check; one
/// OVER_LIMIT descriptor flips the whole request to OVER_LIMIT with a
/// per-descriptor breakdown.
pub struct RlsService {
    engine: Arc<Engine>,
    metrics: Arc<WardenMetrics>,
    semaphore: Arc<Semaphore>,
    /// Lower-cased tenant header name, accepted as an alternate
    /// descriptor key.
    tenant_header: String,
}

impl RlsService {
    pub fn new(
        engine: Arc<Engine>,
        metrics: Arc<WardenMetrics>,
        semaphore: Arc<Semaphore>,
        tenant_header: String,
    ) -> Self {
        Self {
            engine,
            metrics,
            semaphore,
            tenant_header: tenant_header.to_lowercase(),
        }
    }

    fn tenant_of<'a>(
        &self,
        descriptor: &'a crate::proto::envoy::extensions::common::ratelimit::v3::RateLimitDescriptor,
    ) -> &'a str {
        descriptor
            .entries
            .iter()
            .find(|entry| {
                entry.key == TENANT_DESCRIPTOR_KEY
                    || entry.key.eq_ignore_ascii_case(&self.tenant_header)
            })
            .map(|entry| entry.value.as_str())
            .unwrap_or("")
    }

    /// Limit hint reported back per descriptor.
    fn descriptor_limit(&self, tenant: &str) -> (Option<rate_limit_response::RateLimit>, u32) {
        let Some(snapshot) = self.engine.registry().snapshot(tenant) else {
            return (None, 0);
        };
        let limit = snapshot.limits.samples_per_second;
        if limit <= 0.0 {
            return (None, u32::MAX);
        }
        let current = rate_limit_response::RateLimit {
            requests_per_unit: limit as u32,
            unit: Unit::Second as i32,
        };
        let remaining = snapshot.samples_bucket.available.max(0.0) as u32;
        (Some(current), remaining)
    }

    fn failure_mode_code(&self) -> Code {
        if self.engine.config().failure_mode_allow {
            Code::Ok
        } else {
            Code::OverLimit
        }
    }
}

#[tonic::async_trait]
impl RateLimitService for RlsService {
    async fn should_rate_limit(
        &self,
        request: Request<RateLimitRequest>,
    ) -> Result<Response<RateLimitResponse>, Status> {
        let _permit = admit(&self.semaphore)?;
        let _inflight = InflightGuard::new(&self.metrics.inflight_decisions);

        if let Some(timeout) = parse_grpc_timeout(request.metadata()) {
            if timeout.is_zero() {
                let code = self.failure_mode_code();
                return Ok(Response::new(RateLimitResponse {
                    overall_code: code as i32,
                    statuses: Vec::new(),
                }));
            }
        }

        let req = request.into_inner();
        if req.domain.is_empty() {
            return Err(Status::invalid_argument("rate limit domain must not be empty"));
        }

        let hits = u64::from(req.hits_addend.max(1));
        let mut statuses = Vec::with_capacity(req.descriptors.len());
        let mut over_limit = false;

        for descriptor in &req.descriptors {
            let started = Instant::now();
            let tenant = self.tenant_of(descriptor);
            let decision = self
                .engine
                .check(tenant, BodySource::Descriptor { hits }, started);
            self.metrics
                .record_decision("rls", tenant, &decision, started.elapsed());

            let code = if decision.allowed() {
                Code::Ok
            } else {
                over_limit = true;
                info!(
                    domain = %req.domain,
                    tenant,
                    reason = decision.reason.map(|r| r.as_str()).unwrap_or(""),
                    hits,
                    "descriptor over limit"
                );
                Code::OverLimit
            };
            let (current_limit, limit_remaining) = self.descriptor_limit(tenant);
            statuses.push(DescriptorStatus {
                code: code as i32,
                current_limit,
                limit_remaining,
            });
        }

        let overall_code = if statuses.is_empty() {
            Code::Unknown
        } else if over_limit {
            Code::OverLimit
        } else {
            Code::Ok
        };

        Ok(Response::new(RateLimitResponse {
            overall_code: overall_code as i32,
            statuses,
        }))
    }
}
