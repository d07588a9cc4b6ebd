// Warden - tenant-aware admission control
// File: warden-core/src/engine.rs

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::decode::{self, ParseResult, SampleMetric, DEFAULT_MAX_DECOMPRESSED_BYTES};
use crate::decision::{Decision, Observed, Reason, Verdict};
use crate::denial::DenialRecord;
use crate::limits::TenantLimits;
use crate::registry::{Commit, Tenant, TenantRegistry};

/// Engine-level policy, shared by every tenant.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// When false the decoder is skipped and every request counts as one
    /// sample.
    pub enforce_body_parsing: bool,
    /// Allow-by-default vs deny-by-default when a confident verdict is
    /// impossible (missing body, parse failure, recovered panic).
    pub failure_mode_allow: bool,
    /// Global hard cap on body size, applied before the per-tenant
    /// `max_body_bytes`. 0 disables the cap.
    pub max_request_bytes: u64,
    /// Ceiling on decompressed payload size.
    pub max_decompressed_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enforce_body_parsing: true,
            failure_mode_allow: true,
            max_request_bytes: 0,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
        }
    }
}

/// What the wire adapter managed to extract for inspection.
#[derive(Debug, Clone, Copy)]
pub enum BodySource<'a> {
    /// The full payload, with the declared content encoding if any.
    Bytes {
        body: &'a [u8],
        content_encoding: Option<&'a str>,
    },
    /// Only the declared size; the proxy did not buffer the body.
    SizeOnly(u64),
    /// No payload at all: a descriptor-only rate check debiting `hits`.
    Descriptor { hits: u64 },
    /// A body was expected but none arrived.
    Absent,
}

/// Ordered structural limit checks. First failing predicate wins; new
/// limits are added by extending this list.
type LimitCheck = fn(&TenantLimits, &ParseResult) -> Option<Reason>;

const STRUCTURAL_CHECKS: &[LimitCheck] = &[
    labels_per_series_check,
    label_value_length_check,
    series_per_request_check,
];

fn labels_per_series_check(limits: &TenantLimits, parsed: &ParseResult) -> Option<Reason> {
    (limits.max_labels_per_series > 0 && parsed.max_labels_in_series > limits.max_labels_per_series)
        .then_some(Reason::MaxLabelsPerSeries)
}

fn label_value_length_check(limits: &TenantLimits, parsed: &ParseResult) -> Option<Reason> {
    (limits.max_label_value_length > 0 && parsed.max_label_value_len > limits.max_label_value_length)
        .then_some(Reason::MaxLabelValueLength)
}

fn series_per_request_check(limits: &TenantLimits, parsed: &ParseResult) -> Option<Reason> {
    (limits.max_series_per_request > 0 && parsed.series > limits.max_series_per_request)
        .then_some(Reason::MaxSeriesPerRequest)
}

fn structural_reason(limits: &TenantLimits, parsed: &ParseResult) -> Option<Reason> {
    STRUCTURAL_CHECKS.iter().find_map(|check| check(limits, parsed))
}

/// The decision engine. One `check` call inspects the body once and
/// produces the verdict both wire protocols report.
pub struct Engine {
    registry: Arc<TenantRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(registry: Arc<TenantRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Produces the verdict for one request. Deterministic given the
    /// registry state, the request bytes and `now`; time enters only
    /// through bucket refill. A panic anywhere below is recovered and
    /// mapped to the failure-mode verdict.
    pub fn check(&self, tenant_id: &str, body: BodySource<'_>, now: Instant) -> Decision {
        match catch_unwind(AssertUnwindSafe(|| self.check_inner(tenant_id, body, now))) {
            Ok(decision) => decision,
            Err(_) => {
                error!(tenant = tenant_id, "recovered panic in decision path");
                if self.config.failure_mode_allow {
                    Decision::allow(Some(Reason::InternalError), Observed::default())
                } else {
                    Decision::deny(Reason::InternalError, Observed::default())
                }
            }
        }
    }

    fn check_inner(&self, tenant_id: &str, body: BodySource<'_>, now: Instant) -> Decision {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            // No tenant to attribute this to; the adapter's metrics see it.
            return Decision::deny(Reason::MissingTenantHeader, Observed::default());
        }

        let tenant = self.registry.get_or_create(tenant_id);
        let (limits, enforcement) = tenant.policy();

        if !enforcement.enabled {
            let (observed, sample_metrics) = self.observe_best_effort(&body);
            tenant.commit(&observed, Commit::Unenforced, now);
            let mut decision = Decision::allow(Some(Reason::EnforcementDisabled), observed);
            decision.sample_metrics = sample_metrics;
            return decision;
        }

        match body {
            BodySource::Absent => {
                if self.config.failure_mode_allow {
                    let observed = Observed {
                        samples: 1,
                        ..Default::default()
                    };
                    tenant.commit(&observed, Commit::AllowPlaceholder, now);
                    Decision::allow(Some(Reason::BodyExtractFailedAllow), observed)
                } else {
                    self.deny_structural(
                        &tenant,
                        Reason::BodyExtractFailedDeny,
                        Observed::default(),
                        Vec::new(),
                        false,
                        now,
                    )
                }
            }
            BodySource::Descriptor { hits } => {
                let observed = Observed {
                    samples: hits.max(1),
                    ..Default::default()
                };
                self.settle(&tenant, observed, Vec::new(), false, None, now)
            }
            BodySource::SizeOnly(size) => {
                let observed = Observed {
                    samples: 1,
                    bytes: size,
                    ..Default::default()
                };
                if let Some(reason) = self.body_size_reason(size, &limits) {
                    return self.deny_structural(&tenant, reason, observed, Vec::new(), false, now);
                }
                self.settle(&tenant, observed, Vec::new(), false, None, now)
            }
            BodySource::Bytes {
                body: bytes,
                content_encoding,
            } => {
                let len = bytes.len() as u64;
                if let Some(reason) = self.body_size_reason(len, &limits) {
                    // Oversized bodies never reach the decoder.
                    let observed = Observed {
                        bytes: len,
                        ..Default::default()
                    };
                    return self.deny_structural(&tenant, reason, observed, Vec::new(), false, now);
                }

                if !self.config.enforce_body_parsing {
                    let observed = Observed {
                        samples: 1,
                        bytes: len,
                        ..Default::default()
                    };
                    return self.settle(&tenant, observed, Vec::new(), false, None, now);
                }

                match decode::parse(bytes, content_encoding, self.config.max_decompressed_bytes) {
                    Ok(parsed) => {
                        let observed = Observed {
                            samples: parsed.samples,
                            bytes: len,
                            series: parsed.series,
                            labels: parsed.labels,
                        };
                        if let Some(reason) = structural_reason(&limits, &parsed) {
                            return self.deny_structural(
                                &tenant,
                                reason,
                                observed,
                                parsed.sample_metrics,
                                true,
                                now,
                            );
                        }
                        self.settle(&tenant, observed, parsed.sample_metrics, true, None, now)
                    }
                    Err(err) => {
                        debug!(tenant = tenant.id(), error = %err, "remote-write decode failed");
                        let observed = Observed {
                            samples: 1,
                            bytes: len,
                            ..Default::default()
                        };
                        if self.config.failure_mode_allow {
                            self.settle(
                                &tenant,
                                observed,
                                Vec::new(),
                                false,
                                Some(Reason::ParseFailedAllow),
                                now,
                            )
                        } else {
                            self.deny_structural(
                                &tenant,
                                Reason::ParseFailedDeny,
                                observed,
                                Vec::new(),
                                false,
                                now,
                            )
                        }
                    }
                }
            }
        }
    }

    /// Last stage: debit the sample bucket and settle the verdict.
    fn settle(
        &self,
        tenant: &Arc<Tenant>,
        observed: Observed,
        sample_metrics: Vec<SampleMetric>,
        parsed: bool,
        allow_marker: Option<Reason>,
        now: Instant,
    ) -> Decision {
        let (verdict, reason) = tenant.commit(
            &observed,
            Commit::Debit {
                tokens: observed.samples,
            },
            now,
        );
        match verdict {
            Verdict::Allow => {
                let mut decision = Decision::allow(allow_marker, observed);
                decision.sample_metrics = sample_metrics;
                decision
            }
            Verdict::Deny => {
                let reason = reason.unwrap_or(Reason::SamplesRateExceeded);
                self.push_denial(tenant, reason, &observed, &sample_metrics, parsed);
                let mut decision = Decision::deny(reason, observed);
                decision.sample_metrics = sample_metrics;
                decision
            }
        }
    }

    /// Denial decided before the rate stage: no debit, record and return.
    fn deny_structural(
        &self,
        tenant: &Arc<Tenant>,
        reason: Reason,
        observed: Observed,
        sample_metrics: Vec<SampleMetric>,
        parsed: bool,
        now: Instant,
    ) -> Decision {
        tenant.commit(&observed, Commit::Structural(reason), now);
        self.push_denial(tenant, reason, &observed, &sample_metrics, parsed);
        let mut decision = Decision::deny(reason, observed);
        decision.sample_metrics = sample_metrics;
        decision
    }

    fn push_denial(
        &self,
        tenant: &Arc<Tenant>,
        reason: Reason,
        observed: &Observed,
        sample_metrics: &[SampleMetric],
        parsed: bool,
    ) {
        let mut record = DenialRecord::new(tenant.id(), reason);
        record.observed_samples = observed.samples;
        record.observed_body_bytes = observed.bytes;
        if parsed {
            record.observed_series = Some(observed.series);
            record.observed_labels = Some(observed.labels);
        }
        record.sample_metrics = sample_metrics.to_vec();
        self.registry.record_denial(record);
    }

    fn body_size_reason(&self, len: u64, limits: &TenantLimits) -> Option<Reason> {
        if self.config.max_request_bytes > 0 && len > self.config.max_request_bytes {
            return Some(Reason::MaxBodyBytes);
        }
        if limits.max_body_bytes > 0 && len > limits.max_body_bytes {
            return Some(Reason::MaxBodyBytes);
        }
        None
    }

    /// Monitoring-mode observation: extraction errors degrade to the
    /// one-sample fallback instead of failing the request.
    fn observe_best_effort(&self, body: &BodySource<'_>) -> (Observed, Vec<SampleMetric>) {
        match body {
            BodySource::Absent => (Observed::default(), Vec::new()),
            BodySource::Descriptor { hits } => (
                Observed {
                    samples: (*hits).max(1),
                    ..Default::default()
                },
                Vec::new(),
            ),
            BodySource::SizeOnly(size) => (
                Observed {
                    samples: 1,
                    bytes: *size,
                    ..Default::default()
                },
                Vec::new(),
            ),
            BodySource::Bytes {
                body: bytes,
                content_encoding,
            } => {
                let len = bytes.len() as u64;
                if !self.config.enforce_body_parsing {
                    return (
                        Observed {
                            samples: 1,
                            bytes: len,
                            ..Default::default()
                        },
                        Vec::new(),
                    );
                }
                match decode::parse(bytes, *content_encoding, self.config.max_decompressed_bytes) {
                    Ok(parsed) => (
                        Observed {
                            samples: parsed.samples,
                            bytes: len,
                            series: parsed.series,
                            labels: parsed.labels,
                        },
                        parsed.sample_metrics,
                    ),
                    Err(_) => (
                        Observed {
                            samples: 1,
                            bytes: len,
                            ..Default::default()
                        },
                        Vec::new(),
                    ),
                }
            }
        }
    }
}
