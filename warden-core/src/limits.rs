use serde::{Deserialize, Serialize};

/// Per-tenant admission limits. A value of zero always means unlimited
/// for that dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantLimits {
    /// Steady-state ingest rate in samples per second. 0 = unlimited.
    pub samples_per_second: f64,
    /// Fractional headroom above the steady-state rate, in [0, 1].
    pub burst_percent: f64,
    /// Maximum accepted body size in bytes. 0 = unlimited.
    pub max_body_bytes: u64,
    /// Maximum labels on any single series. 0 = unlimited.
    pub max_labels_per_series: u64,
    /// Maximum length of any label value. 0 = unlimited.
    pub max_label_value_length: u64,
    /// Maximum series in one request. 0 = unlimited.
    pub max_series_per_request: u64,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            samples_per_second: 0.0,
            burst_percent: 0.0,
            max_body_bytes: 0,
            max_labels_per_series: 0,
            max_label_value_length: 0,
            max_series_per_request: 0,
        }
    }
}

impl TenantLimits {
    /// Clamps fields into their legal ranges.
    pub fn normalized(mut self) -> Self {
        if !self.samples_per_second.is_finite() || self.samples_per_second < 0.0 {
            self.samples_per_second = 0.0;
        }
        self.burst_percent = self.burst_percent.clamp(0.0, 1.0);
        self
    }

    /// Token-bucket tuning for the samples dimension, honoring an
    /// enforcement-level burst override when present.
    ///
    /// Burst capacity is `rate × (1 + burst_percent)` when the burst
    /// fraction is positive, otherwise exactly `rate`. A zero rate tunes
    /// the bucket to the unlimited state.
    pub fn samples_bucket_tuning(&self, burst_override: Option<f64>) -> (f64, f64) {
        let rate = self.samples_per_second;
        if rate <= 0.0 {
            return (0.0, 0.0);
        }
        let burst = burst_override
            .unwrap_or(self.burst_percent)
            .clamp(0.0, 1.0);
        let capacity = if burst > 0.0 { rate * (1.0 + burst) } else { rate };
        (rate, capacity)
    }
}

/// Per-tenant enforcement switches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// When false every verdict is allow, but counters still increment
    /// (monitoring mode).
    pub enabled: bool,
    /// Replaces the limit table's `burst_percent` when set.
    pub burst_pct_override: Option<f64>,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            burst_pct_override: None,
        }
    }
}
