use serde::{Deserialize, Serialize};

use crate::decode::SampleMetric;

/// Final admission verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

/// Stable reason codes. The snake_case strings below are wire contract:
/// they appear in deny response headers, denial records, exported
/// metrics, and the admin API, and must never change meaning.
///
/// The `*_allow` variants and `enforcement_disabled` are allow-path
/// markers, not denials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    MissingTenantHeader,
    EnforcementDisabled,
    BodyExtractFailedAllow,
    BodyExtractFailedDeny,
    ParseFailedAllow,
    ParseFailedDeny,
    MaxBodyBytes,
    MaxLabelsPerSeries,
    MaxLabelValueLength,
    MaxSeriesPerRequest,
    SamplesRateExceeded,
    InternalError,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::MissingTenantHeader => "missing_tenant_header",
            Reason::EnforcementDisabled => "enforcement_disabled",
            Reason::BodyExtractFailedAllow => "body_extract_failed_allow",
            Reason::BodyExtractFailedDeny => "body_extract_failed_deny",
            Reason::ParseFailedAllow => "parse_failed_allow",
            Reason::ParseFailedDeny => "parse_failed_deny",
            Reason::MaxBodyBytes => "max_body_bytes",
            Reason::MaxLabelsPerSeries => "max_labels_per_series",
            Reason::MaxLabelValueLength => "max_label_value_length",
            Reason::MaxSeriesPerRequest => "max_series_per_request",
            Reason::SamplesRateExceeded => "samples_rate_exceeded",
            Reason::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the request was measured at, independent of the verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    pub samples: u64,
    pub bytes: u64,
    pub series: u64,
    pub labels: u64,
}

/// The decision engine's output for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// Deny reason, or an allow-path marker; `None` on a clean allow.
    pub reason: Option<Reason>,
    pub observed: Observed,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_metrics: Vec<SampleMetric>,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    pub fn allow(reason: Option<Reason>, observed: Observed) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason,
            observed,
            sample_metrics: Vec::new(),
        }
    }

    pub fn deny(reason: Reason, observed: Observed) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason: Some(reason),
            observed,
            sample_metrics: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_wire_strings_are_stable() {
        let table = [
            (Reason::MissingTenantHeader, "missing_tenant_header"),
            (Reason::EnforcementDisabled, "enforcement_disabled"),
            (Reason::BodyExtractFailedAllow, "body_extract_failed_allow"),
            (Reason::BodyExtractFailedDeny, "body_extract_failed_deny"),
            (Reason::ParseFailedAllow, "parse_failed_allow"),
            (Reason::ParseFailedDeny, "parse_failed_deny"),
            (Reason::MaxBodyBytes, "max_body_bytes"),
            (Reason::MaxLabelsPerSeries, "max_labels_per_series"),
            (Reason::MaxLabelValueLength, "max_label_value_length"),
            (Reason::MaxSeriesPerRequest, "max_series_per_request"),
            (Reason::SamplesRateExceeded, "samples_rate_exceeded"),
            (Reason::InternalError, "internal_error"),
        ];
        for (reason, wire) in table {
            assert_eq!(reason.as_str(), wire);
            // serde uses the same representation.
            assert_eq!(
                serde_json::to_string(&reason).unwrap(),
                format!("\"{wire}\"")
            );
        }
    }
}
