//! The two Envoy-facing gRPC adapters and their shared plumbing.

pub mod authz;
pub mod ratelimit;

use std::sync::Arc;
use std::time::Duration;

use prometheus::IntGauge;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use warden_core::Reason;

use crate::proto::envoy::r#type::v3::StatusCode;

/// Response header carrying the stable deny reason string.
pub const DENY_REASON_HEADER: &str = "x-warden-deny-reason";
pub const OBSERVED_SAMPLES_HEADER: &str = "x-warden-observed-samples";
pub const OBSERVED_BYTES_HEADER: &str = "x-warden-observed-bytes";

/// google.rpc code values used on the authorization response.
pub(crate) const RPC_OK: i32 = 0;
pub(crate) const RPC_PERMISSION_DENIED: i32 = 7;

/// Admits one decision under the global in-flight cap. Overload is an
/// immediate RESOURCE_EXHAUSTED, never a queue.
pub(crate) fn admit(semaphore: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit, Status> {
    Arc::clone(semaphore)
        .try_acquire_owned()
        .map_err(|_| Status::resource_exhausted("in-flight decision cap reached"))
}

/// Tracks the in-flight gauge for the duration of one decision.
pub(crate) struct InflightGuard {
    gauge: IntGauge,
}

impl InflightGuard {
    pub(crate) fn new(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self {
            gauge: gauge.clone(),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Parses the `grpc-timeout` request header (e.g. `250m`, `2S`).
pub(crate) fn parse_grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let raw = metadata.get("grpc-timeout")?.to_str().ok()?;
    if raw.len() < 2 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(value * 3600)),
        "M" => Some(Duration::from_secs(value * 60)),
        "S" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_millis(value)),
        "u" => Some(Duration::from_micros(value)),
        "n" => Some(Duration::from_nanos(value)),
        _ => None,
    }
}

/// Maps a deny reason to the HTTP status Envoy should return: 429 for
/// the rate check, 413 for the byte caps, 400 for structural and
/// missing-tenant denials, 403 otherwise.
pub(crate) fn http_status_for(reason: Reason) -> StatusCode {
    match reason {
        Reason::SamplesRateExceeded => StatusCode::TooManyRequests,
        Reason::MaxBodyBytes => StatusCode::PayloadTooLarge,
        Reason::MissingTenantHeader
        | Reason::ParseFailedDeny
        | Reason::BodyExtractFailedDeny
        | Reason::MaxLabelsPerSeries
        | Reason::MaxLabelValueLength
        | Reason::MaxSeriesPerRequest => StatusCode::BadRequest,
        _ => StatusCode::Forbidden,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_timeout_units_parse() {
        let mut metadata = MetadataMap::new();
        metadata.insert("grpc-timeout", "250m".parse().unwrap());
        assert_eq!(
            parse_grpc_timeout(&metadata),
            Some(Duration::from_millis(250))
        );

        metadata.insert("grpc-timeout", "2S".parse().unwrap());
        assert_eq!(parse_grpc_timeout(&metadata), Some(Duration::from_secs(2)));

        metadata.insert("grpc-timeout", "0m".parse().unwrap());
        assert_eq!(parse_grpc_timeout(&metadata), Some(Duration::ZERO));

        metadata.insert("grpc-timeout", "bogus".parse().unwrap());
        assert_eq!(parse_grpc_timeout(&metadata), None);
    }

    #[test]
    fn status_mapping_covers_the_reason_table() {
        assert_eq!(
            http_status_for(Reason::SamplesRateExceeded),
            StatusCode::TooManyRequests
        );
        assert_eq!(
            http_status_for(Reason::MaxBodyBytes),
            StatusCode::PayloadTooLarge
        );
        for reason in [
            Reason::MissingTenantHeader,
            Reason::ParseFailedDeny,
            Reason::BodyExtractFailedDeny,
            Reason::MaxLabelsPerSeries,
            Reason::MaxLabelValueLength,
            Reason::MaxSeriesPerRequest,
        ] {
            assert_eq!(http_status_for(reason), StatusCode::BadRequest);
        }
        assert_eq!(http_status_for(Reason::InternalError), StatusCode::Forbidden);
    }

    #[test]
    fn admit_rejects_when_exhausted() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = admit(&semaphore).unwrap();
        let err = admit(&semaphore).unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
        drop(permit);
        assert!(admit(&semaphore).is_ok());
    }
}
