use tonic::transport::Channel;
use tonic::Request;

use crate::error::{ClientError, Result};
use crate::proto::envoy::service::auth::v3::{
    attribute_context, authorization_client::AuthorizationClient, check_response::HttpResponse,
    AttributeContext, CheckRequest,
};
use crate::proto::envoy::extensions::common::ratelimit::v3::{
    rate_limit_descriptor::Entry, RateLimitDescriptor,
};
use crate::proto::envoy::service::ratelimit::v3::{
    rate_limit_response::Code, rate_limit_service_client::RateLimitServiceClient, RateLimitRequest,
};

const DEFAULT_TENANT_HEADER: &str = "x-scope-orgid";
const DENY_REASON_HEADER: &str = "x-warden-deny-reason";

/// Outcome of one external-authorization check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub allowed: bool,
    /// Stable reason string from the deny (or allow-marker) header.
    pub reason: Option<String>,
    /// HTTP status the proxy would return on deny.
    pub http_status: Option<i32>,
}

/// Outcome of one rate-limit-service check.
#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub over_limit: bool,
    /// Per-descriptor verdicts, in request order.
    pub descriptor_over_limit: Vec<bool>,
}

/// Client for both Warden gRPC surfaces.
pub struct WardenClient {
    authz: AuthorizationClient<Channel>,
    ratelimit: RateLimitServiceClient<Channel>,
    tenant_header: String,
}

impl WardenClient {
    /// Connect to the two Warden endpoints.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use warden_client::WardenClient;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let client =
    ///     WardenClient::connect("http://localhost:50051", "http://localhost:50052").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect<A, R>(authz: A, ratelimit: R) -> Result<Self>
    where
        A: TryInto<tonic::transport::Endpoint>,
        A::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        R: TryInto<tonic::transport::Endpoint>,
        R::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let authz_channel = Self::open(authz).await?;
        let ratelimit_channel = Self::open(ratelimit).await?;
        Ok(Self {
            authz: AuthorizationClient::new(authz_channel),
            ratelimit: RateLimitServiceClient::new(ratelimit_channel),
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
        })
    }

    /// Use a non-default tenant header name.
    pub fn with_tenant_header(mut self, header: impl Into<String>) -> Self {
        self.tenant_header = header.into().to_lowercase();
        self
    }

    async fn open<D>(dst: D) -> Result<Channel>
    where
        D: TryInto<tonic::transport::Endpoint>,
        D::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let endpoint = dst.try_into().map_err(|e| {
            ClientError::ConnectionError(format!("invalid endpoint: {:?}", e.into()))
        })?;
        endpoint
            .connect()
            .await
            .map_err(|e| ClientError::ConnectionError(e.to_string()))
    }

    /// Submit one remote-write body for an admission verdict.
    ///
    /// # Arguments
    ///
    /// * `tenant` - tenant identity, sent in the configured header
    /// * `body` - the compressed remote-write payload
    /// * `content_encoding` - declared codec (`snappy`, `gzip`, ...)
    pub async fn check_remote_write(
        &mut self,
        tenant: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
    ) -> Result<CheckOutcome> {
        let mut headers = std::collections::HashMap::new();
        headers.insert(self.tenant_header.clone(), tenant.to_string());
        if let Some(encoding) = content_encoding {
            headers.insert("content-encoding".to_string(), encoding.to_string());
        }

        let request = Request::new(CheckRequest {
            attributes: Some(AttributeContext {
                request: Some(attribute_context::Request {
                    http: Some(attribute_context::HttpRequest {
                        method: "POST".to_string(),
                        path: "/api/v1/push".to_string(),
                        headers,
                        size: body.len() as i64,
                        raw_body: body,
                        ..Default::default()
                    }),
                }),
            }),
        });

        let response = self.authz.check(request).await?.into_inner();
        match response.http_response {
            Some(HttpResponse::OkResponse(ok)) => Ok(CheckOutcome {
                allowed: true,
                reason: header_value(&ok.headers, DENY_REASON_HEADER),
                http_status: None,
            }),
            Some(HttpResponse::DeniedResponse(denied)) => Ok(CheckOutcome {
                allowed: false,
                reason: header_value(&denied.headers, DENY_REASON_HEADER),
                http_status: denied.status.map(|s| s.code),
            }),
            None => Err(ClientError::MalformedResponse(
                "check response carried no http_response".to_string(),
            )),
        }
    }

    /// Run a descriptor-only rate check for `tenant`, debiting `hits`.
    pub async fn should_rate_limit(
        &mut self,
        domain: &str,
        tenant: &str,
        hits: u32,
    ) -> Result<RateLimitOutcome> {
        let request = Request::new(RateLimitRequest {
            domain: domain.to_string(),
            descriptors: vec![RateLimitDescriptor {
                entries: vec![Entry {
                    key: "tenant_id".to_string(),
                    value: tenant.to_string(),
                }],
            }],
            hits_addend: hits,
        });

        let response = self.ratelimit.should_rate_limit(request).await?.into_inner();
        Ok(RateLimitOutcome {
            over_limit: response.overall_code == Code::OverLimit as i32,
            descriptor_over_limit: response
                .statuses
                .iter()
                .map(|status| status.code == Code::OverLimit as i32)
                .collect(),
        })
    }

    /// Submit a write and fail with [`ClientError::Denied`] when it is
    /// not admitted.
    pub async fn require_admission(
        &mut self,
        tenant: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        let outcome = self
            .check_remote_write(tenant, body, content_encoding)
            .await?;
        if outcome.allowed {
            Ok(())
        } else {
            Err(ClientError::Denied(
                outcome.reason.unwrap_or_else(|| "unspecified".to_string()),
            ))
        }
    }
}

fn header_value(
    headers: &[crate::proto::envoy::config::core::v3::HeaderValueOption],
    key: &str,
) -> Option<String> {
    headers
        .iter()
        .filter_map(|option| option.header.as_ref())
        .find(|header| header.key == key)
        .map(|header| header.value.clone())
}
