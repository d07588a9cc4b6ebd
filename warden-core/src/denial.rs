use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::Reason;
use crate::decode::SampleMetric;

/// Default per-tenant denial ring capacity.
pub const DEFAULT_TENANT_DENIAL_CAPACITY: usize = 10_000;
/// Default global denial ring capacity.
pub const DEFAULT_GLOBAL_DENIAL_CAPACITY: usize = 100_000;

/// One recorded denial, kept for operator forensics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenialRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub reason: Reason,
    pub timestamp: DateTime<Utc>,
    pub observed_samples: u64,
    pub observed_body_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_series: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_labels: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_metrics: Vec<SampleMetric>,
}

impl DenialRecord {
    pub fn new(tenant_id: impl Into<String>, reason: Reason) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            reason,
            timestamp: Utc::now(),
            observed_samples: 0,
            observed_body_bytes: 0,
            observed_series: None,
            observed_labels: None,
            sample_metrics: Vec::new(),
        }
    }
}

/// Bounded ring of denial records. Eviction is oldest-first; the ring
/// has its own lock so recording a denial never re-takes a tenant lock.
#[derive(Debug)]
pub struct DenialRing {
    capacity: usize,
    records: Mutex<VecDeque<DenialRecord>>,
}

impl DenialRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: DenialRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records newer than `since` ago, newest first. Insertion order is
    /// only approximately chronological, so this filters rather than
    /// stopping at the first old record.
    pub fn recent(&self, since: Duration) -> Vec<DenialRecord> {
        let cutoff = Utc::now() - since;
        let records = self.records.lock();
        records
            .iter()
            .rev()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
