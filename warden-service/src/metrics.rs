//! Prometheus metrics for the admission path.
//!
//! One counter per verdict and per denial reason, observed-traffic
//! counters, gauges for tenant count and in-flight decisions, and a
//! decision-latency histogram. Exposed in text format on the admin
//! listener's `/metrics`.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use warden_core::Decision;

/// Tenant label used when the request carried no tenant identity.
const UNATTRIBUTED: &str = "unknown";

pub struct WardenMetrics {
    registry: Registry,
    /// Counter: decisions by (protocol, tenant, verdict)
    pub decisions_total: IntCounterVec,
    /// Counter: denials by (tenant, reason)
    pub denials_total: IntCounterVec,
    /// Counter: samples observed per tenant, allowed or not
    pub observed_samples_total: IntCounterVec,
    /// Counter: body bytes observed per tenant
    pub observed_bytes_total: IntCounterVec,
    /// Histogram: decision latency by protocol
    pub decision_duration_seconds: HistogramVec,
    /// Gauge: tenants known to the registry
    pub tenants: IntGauge,
    /// Gauge: decisions currently in flight
    pub inflight_decisions: IntGauge,
}

impl WardenMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("warden".to_string()), None)?;

        let decisions_total = IntCounterVec::new(
            Opts::new("decisions_total", "Admission decisions by verdict"),
            &["protocol", "tenant", "verdict"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let denials_total = IntCounterVec::new(
            Opts::new("denials_total", "Denials by reason code"),
            &["tenant", "reason"],
        )?;
        registry.register(Box::new(denials_total.clone()))?;

        let observed_samples_total = IntCounterVec::new(
            Opts::new("observed_samples_total", "Samples observed in payloads"),
            &["tenant"],
        )?;
        registry.register(Box::new(observed_samples_total.clone()))?;

        let observed_bytes_total = IntCounterVec::new(
            Opts::new("observed_bytes_total", "Body bytes observed"),
            &["tenant"],
        )?;
        registry.register(Box::new(observed_bytes_total.clone()))?;

        let decision_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "decision_duration_seconds",
                "Decision engine latency in seconds",
            )
            .buckets(vec![0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.005, 0.05]),
            &["protocol"],
        )?;
        registry.register(Box::new(decision_duration_seconds.clone()))?;

        let tenants = IntGauge::new("tenants", "Tenants known to the registry")?;
        registry.register(Box::new(tenants.clone()))?;

        let inflight_decisions =
            IntGauge::new("inflight_decisions", "Decisions currently in flight")?;
        registry.register(Box::new(inflight_decisions.clone()))?;

        Ok(Self {
            registry,
            decisions_total,
            denials_total,
            observed_samples_total,
            observed_bytes_total,
            decision_duration_seconds,
            tenants,
            inflight_decisions,
        })
    }

    /// Record one settled decision at the adapter boundary.
    pub fn record_decision(
        &self,
        protocol: &str,
        tenant: &str,
        decision: &Decision,
        elapsed: Duration,
    ) {
        let tenant = if tenant.is_empty() { UNATTRIBUTED } else { tenant };
        let verdict = if decision.allowed() { "allow" } else { "deny" };
        self.decisions_total
            .with_label_values(&[protocol, tenant, verdict])
            .inc();
        if !decision.allowed() {
            if let Some(reason) = decision.reason {
                self.denials_total
                    .with_label_values(&[tenant, reason.as_str()])
                    .inc();
            }
        }
        self.observed_samples_total
            .with_label_values(&[tenant])
            .inc_by(decision.observed.samples);
        self.observed_bytes_total
            .with_label_values(&[tenant])
            .inc_by(decision.observed.bytes);
        self.decision_duration_seconds
            .with_label_values(&[protocol])
            .observe(elapsed.as_secs_f64());
    }

    /// Text-format scrape output.
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{Observed, Reason, Verdict};

    fn decision(verdict: Verdict, reason: Option<Reason>) -> Decision {
        Decision {
            verdict,
            reason,
            observed: Observed {
                samples: 100,
                bytes: 1000,
                series: 2,
                labels: 6,
            },
            sample_metrics: Vec::new(),
        }
    }

    #[test]
    fn decisions_and_denials_are_counted() {
        let metrics = WardenMetrics::new().unwrap();
        metrics.record_decision(
            "ext_authz",
            "acme",
            &decision(Verdict::Allow, None),
            Duration::from_micros(80),
        );
        metrics.record_decision(
            "ext_authz",
            "acme",
            &decision(Verdict::Deny, Some(Reason::SamplesRateExceeded)),
            Duration::from_micros(80),
        );

        let text = metrics.gather().unwrap();
        assert!(text.contains("warden_decisions_total"));
        assert!(text.contains("verdict=\"deny\""));
        assert!(text.contains("reason=\"samples_rate_exceeded\""));
        assert!(text.contains("warden_observed_samples_total"));
    }

    #[test]
    fn empty_tenant_is_relabeled() {
        let metrics = WardenMetrics::new().unwrap();
        metrics.record_decision(
            "rls",
            "",
            &decision(Verdict::Deny, Some(Reason::MissingTenantHeader)),
            Duration::from_micros(10),
        );
        let text = metrics.gather().unwrap();
        assert!(text.contains("tenant=\"unknown\""));
    }
}
