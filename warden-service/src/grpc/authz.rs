// Warden - tenant-aware admission control
// File: warden-service/src/grpc/authz.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tonic::{Request, Response, Status};
use tracing::info;
use warden_core::{BodySource, Decision, Engine, Observed, Reason};

use crate::grpc::{
    admit, http_status_for, parse_grpc_timeout, InflightGuard, DENY_REASON_HEADER,
    OBSERVED_BYTES_HEADER, OBSERVED_SAMPLES_HEADER, RPC_OK, RPC_PERMISSION_DENIED,
};
use crate::metrics::WardenMetrics;
use crate::proto::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use crate::proto::envoy::service::auth::v3::{
    authorization_server::Authorization, check_response::HttpResponse, CheckRequest,
    CheckResponse, DeniedHttpResponse, OkHttpResponse,
};
use crate::proto::envoy::r#type::v3::HttpStatus;
use crate::proto::google::rpc::Status as RpcStatus;

/// Envoy external-authorization adapter. Extracts the tenant header and
/// body from the HTTP attribute context, runs one engine check, and maps
/// the verdict onto the ext_authz response shape.
pub struct AuthzService {
    engine: Arc<Engine>,
    metrics: Arc<WardenMetrics>,
    semaphore: Arc<Semaphore>,
    /// Lower-cased tenant header name.
    tenant_header: String,
}

impl AuthzService {
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

    /// The verdict to report when the caller's deadline fired before the
    /// engine ran. The registry is intentionally left untouched.
    fn deadline_response(&self) -> CheckResponse {
        if self.engine.config().failure_mode_allow {
            allow_response(&Decision::allow(
                Some(Reason::InternalError),
                Observed::default(),
            ))
        } else {
            deny_response(&Decision::deny(Reason::InternalError, Observed::default()))
        }
    }
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn header_option(key: &str, value: String) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            value,
        }),
    }
}

fn allow_response(decision: &Decision) -> CheckResponse {
    let mut headers = Vec::new();
    // Allow-path markers (enforcement_disabled, parse_failed_allow, ...)
    // ride the same header so operators can spot degraded allows.
    if let Some(reason) = decision.reason {
        headers.push(header_option(DENY_REASON_HEADER, reason.as_str().to_string()));
    }
    CheckResponse {
        status: Some(RpcStatus {
            code: RPC_OK,
            message: String::new(),
        }),
        http_response: Some(HttpResponse::OkResponse(OkHttpResponse { headers })),
    }
}

fn deny_response(decision: &Decision) -> CheckResponse {
    let reason = decision.reason.unwrap_or(Reason::InternalError);
    let headers = vec![
        header_option(DENY_REASON_HEADER, reason.as_str().to_string()),
        header_option(
            OBSERVED_SAMPLES_HEADER,
            decision.observed.samples.to_string(),
        ),
        header_option(OBSERVED_BYTES_HEADER, decision.observed.bytes.to_string()),
    ];
    CheckResponse {
        status: Some(RpcStatus {
            code: RPC_PERMISSION_DENIED,
            message: reason.as_str().to_string(),
        }),
        http_response: Some(HttpResponse::DeniedResponse(DeniedHttpResponse {
            status: Some(HttpStatus {
                code: http_status_for(reason) as i32,
            }),
            headers,
            body: format!("remote write denied: {reason}"),
        })),
    }
}

#[tonic::async_trait]
impl Authorization for AuthzService {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let _permit = admit(&self.semaphore)?;
        let _inflight = InflightGuard::new(&self.metrics.inflight_decisions);

        if let Some(timeout) = parse_grpc_timeout(request.metadata()) {
            if timeout.is_zero() {
                return Ok(Response::new(self.deadline_response()));
            }
        }

        let started = Instant::now();
        let http = request
            .into_inner()
            .attributes
            .and_then(|attributes| attributes.request)
            .and_then(|request| request.http)
            .unwrap_or_default();

        let tenant = header(&http.headers, &self.tenant_header).unwrap_or("");
        let content_encoding = header(&http.headers, "content-encoding");

        let body = if !http.raw_body.is_empty() {
            BodySource::Bytes {
                body: &http.raw_body,
                content_encoding,
            }
        } else if !http.body.is_empty() {
            BodySource::Bytes {
                body: http.body.as_bytes(),
                content_encoding,
            }
        } else if http.size > 0 {
            BodySource::SizeOnly(http.size as u64)
        } else {
            BodySource::Absent
        };

        let decision = self.engine.check(tenant, body, started);
        self.metrics
            .record_decision("ext_authz", tenant, &decision, started.elapsed());

        if !decision.allowed() {
            info!(
                tenant,
                reason = decision.reason.map(|r| r.as_str()).unwrap_or(""),
                samples = decision.observed.samples,
                bytes = decision.observed.bytes,
                "remote write denied"
            );
            return Ok(Response::new(deny_response(&decision)));
        }
        Ok(Response::new(allow_response(&decision)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::envoy::r#type::v3::StatusCode;
    use crate::proto::envoy::service::auth::v3::attribute_context::{self, HttpRequest};
    use crate::proto::envoy::service::auth::v3::AttributeContext;
    use prost::Message;
    use warden_core::{
        EnforcementConfig, EngineConfig, RegistryConfig, TenantLimits, TenantRegistry,
    };

    fn service(config: EngineConfig) -> AuthzService {
        let registry = TenantRegistry::new(RegistryConfig::default());
        AuthzService::new(
            Arc::new(Engine::new(registry, config)),
            Arc::new(WardenMetrics::new().unwrap()),
            Arc::new(Semaphore::new(8)),
            "x-scope-orgid".to_string(),
        )
    }

    fn configure(service: &AuthzService, tenant: &str, limits: TenantLimits) {
        service.engine.registry().set_limits(tenant, limits);
        service.engine.registry().set_enforcement(
            tenant,
            EnforcementConfig {
                enabled: true,
                burst_pct_override: None,
            },
        );
    }

    fn check_request(headers: &[(&str, &str)], raw_body: Vec<u8>) -> Request<CheckRequest> {
        Request::new(CheckRequest {
            attributes: Some(AttributeContext {
                request: Some(attribute_context::Request {
                    http: Some(HttpRequest {
                        method: "POST".to_string(),
                        path: "/api/v1/push".to_string(),
                        headers: headers
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                        size: raw_body.len() as i64,
                        raw_body,
                        ..Default::default()
                    }),
                }),
            }),
        })
    }

    fn remote_write_body(samples: usize) -> Vec<u8> {
        let request = warden_core::remote_write::WriteRequest {
            timeseries: vec![warden_core::remote_write::TimeSeries {
                labels: vec![warden_core::remote_write::Label {
                    name: "__name__".to_string(),
                    value: "up".to_string(),
                }],
                samples: (0..samples)
                    .map(|i| warden_core::remote_write::Sample {
                        value: i as f64,
                        timestamp: i as i64,
                    })
                    .collect(),
            }],
        };
        let mut raw = Vec::new();
        request.encode(&mut raw).unwrap();
        snap::raw::Encoder::new().compress_vec(&raw).unwrap()
    }

    fn denied(response: &CheckResponse) -> &DeniedHttpResponse {
        match response.http_response.as_ref().unwrap() {
            HttpResponse::DeniedResponse(denied) => denied,
            HttpResponse::OkResponse(_) => panic!("expected a denied response"),
        }
    }

    fn header_value<'a>(denied: &'a DeniedHttpResponse, key: &str) -> &'a str {
        denied
            .headers
            .iter()
            .find(|h| h.header.as_ref().map(|h| h.key.as_str()) == Some(key))
            .and_then(|h| h.header.as_ref())
            .map(|h| h.value.as_str())
            .unwrap_or_else(|| panic!("missing header {key}"))
    }

    #[tokio::test]
    async fn allowed_write_returns_ok() {
        let svc = service(EngineConfig::default());
        configure(
            &svc,
            "acme",
            TenantLimits {
                samples_per_second: 1000.0,
                ..Default::default()
            },
        );

        let request = check_request(
            &[("x-scope-orgid", "acme"), ("content-encoding", "snappy")],
            remote_write_body(10),
        );
        let response = svc.check(request).await.unwrap().into_inner();
        assert_eq!(response.status.as_ref().unwrap().code, RPC_OK);
        assert!(matches!(
            response.http_response,
            Some(HttpResponse::OkResponse(_))
        ));
    }

    #[tokio::test]
    async fn missing_tenant_header_maps_to_400() {
        let svc = service(EngineConfig::default());
        let request = check_request(&[("content-encoding", "snappy")], remote_write_body(1));
        let response = svc.check(request).await.unwrap().into_inner();

        assert_eq!(
            response.status.as_ref().unwrap().code,
            RPC_PERMISSION_DENIED
        );
        let denied = denied(&response);
        assert_eq!(
            denied.status.as_ref().unwrap().code,
            StatusCode::BadRequest as i32
        );
        assert_eq!(
            header_value(denied, DENY_REASON_HEADER),
            "missing_tenant_header"
        );
    }

    #[tokio::test]
    async fn rate_denial_maps_to_429_with_observed_headers() {
        let svc = service(EngineConfig::default());
        configure(
            &svc,
            "acme",
            TenantLimits {
                samples_per_second: 5.0,
                ..Default::default()
            },
        );

        let body = remote_write_body(50);
        let body_len = body.len();
        let request = check_request(
            &[("X-Scope-OrgID", "acme"), ("content-encoding", "snappy")],
            body,
        );
        let response = svc.check(request).await.unwrap().into_inner();

        let denied = denied(&response);
        assert_eq!(
            denied.status.as_ref().unwrap().code,
            StatusCode::TooManyRequests as i32
        );
        assert_eq!(
            header_value(denied, DENY_REASON_HEADER),
            "samples_rate_exceeded"
        );
        assert_eq!(header_value(denied, OBSERVED_SAMPLES_HEADER), "50");
        assert_eq!(
            header_value(denied, OBSERVED_BYTES_HEADER),
            body_len.to_string()
        );
    }

    #[tokio::test]
    async fn oversized_body_maps_to_413() {
        let svc = service(EngineConfig::default());
        configure(
            &svc,
            "acme",
            TenantLimits {
                max_body_bytes: 16,
                ..Default::default()
            },
        );

        let request = check_request(&[("x-scope-orgid", "acme")], vec![0u8; 64]);
        let response = svc.check(request).await.unwrap().into_inner();
        let denied = denied(&response);
        assert_eq!(
            denied.status.as_ref().unwrap().code,
            StatusCode::PayloadTooLarge as i32
        );
    }

    #[tokio::test]
    async fn monitoring_mode_marks_the_allow() {
        let svc = service(EngineConfig::default());
        // Tenant is auto-created with enforcement disabled.
        let request = check_request(
            &[("x-scope-orgid", "canary"), ("content-encoding", "snappy")],
            remote_write_body(3),
        );
        let response = svc.check(request).await.unwrap().into_inner();
        match response.http_response.unwrap() {
            HttpResponse::OkResponse(ok) => {
                let marker = ok
                    .headers
                    .iter()
                    .filter_map(|h| h.header.as_ref())
                    .find(|h| h.key == DENY_REASON_HEADER)
                    .expect("marker header");
                assert_eq!(marker.value, "enforcement_disabled");
            }
            HttpResponse::DeniedResponse(_) => panic!("expected ok response"),
        }
    }

    #[tokio::test]
    async fn absent_body_with_size_only_still_checks_size_caps() {
        let svc = service(EngineConfig::default());
        configure(
            &svc,
            "acme",
            TenantLimits {
                max_body_bytes: 100,
                ..Default::default()
            },
        );

        let mut request = CheckRequest::default();
        request.attributes = Some(AttributeContext {
            request: Some(attribute_context::Request {
                http: Some(HttpRequest {
                    headers: [("x-scope-orgid".to_string(), "acme".to_string())]
                        .into_iter()
                        .collect(),
                    size: 5000,
                    ..Default::default()
                }),
            }),
        });
        let response = svc.check(Request::new(request)).await.unwrap().into_inner();
        let denied = denied(&response);
        assert_eq!(header_value(denied, DENY_REASON_HEADER), "max_body_bytes");
    }

    #[tokio::test]
    async fn exhausted_semaphore_is_resource_exhausted() {
        let registry = TenantRegistry::new(RegistryConfig::default());
        let svc = AuthzService::new(
            Arc::new(Engine::new(registry, EngineConfig::default())),
            Arc::new(WardenMetrics::new().unwrap()),
            Arc::new(Semaphore::new(0)),
            "x-scope-orgid".to_string(),
        );
        let err = svc
            .check(check_request(&[], Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn expired_deadline_returns_failure_mode_without_registry_updates() {
        let svc = service(EngineConfig::default());
        let mut request = check_request(&[("x-scope-orgid", "acme")], remote_write_body(1));
        request
            .metadata_mut()
            .insert("grpc-timeout", "0m".parse().unwrap());

        let response = svc.check(request).await.unwrap().into_inner();
        assert_eq!(response.status.as_ref().unwrap().code, RPC_OK);
        // The engine never ran: no tenant was created.
        assert!(svc.engine.registry().snapshot("acme").is_none());
    }
}
