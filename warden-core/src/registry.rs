// Warden - tenant-aware admission control
// File: warden-core/src/registry.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::bucket::TokenBucket;
use crate::decision::{Observed, Reason, Verdict};
use crate::denial::{
    DenialRecord, DenialRing, DEFAULT_GLOBAL_DENIAL_CAPACITY, DEFAULT_TENANT_DENIAL_CAPACITY,
};
use crate::limits::{EnforcementConfig, TenantLimits};
use crate::window::{RollingWindow, WindowSlot, WindowTotals};

/// Shard count for the tenant map.
const TENANT_MAP_SHARDS: usize = 64;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Limits applied to tenants discovered on first reference.
    pub default_limits: TenantLimits,
    /// Enforcement applied to discovered tenants. Disabled by default so
    /// unknown traffic is observed, never throttled, until configured.
    pub default_enforcement: EnforcementConfig,
    pub tenant_denial_capacity: usize,
    pub global_denial_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_limits: TenantLimits::default(),
            default_enforcement: EnforcementConfig::default(),
            tenant_denial_capacity: DEFAULT_TENANT_DENIAL_CAPACITY,
            global_denial_capacity: DEFAULT_GLOBAL_DENIAL_CAPACITY,
        }
    }
}

/// Monotonic per-tenant counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TenantCounters {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub observed_samples_total: u64,
    pub observed_bytes_total: u64,
    pub denials_by_reason: HashMap<Reason, u64>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Point-in-time view of one token bucket.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BucketInfo {
    pub rate: f64,
    pub capacity: f64,
    pub available: f64,
}

/// Immutable copy of one tenant's state, safe to hand to readers.
#[derive(Debug, Clone, Serialize)]
pub struct TenantInfo {
    pub id: String,
    pub limits: TenantLimits,
    pub enforcement: EnforcementConfig,
    pub counters: TenantCounters,
    pub samples_bucket: BucketInfo,
}

/// Windowed activity rates for one tenant.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TenantRates {
    pub rps: f64,
    pub samples_per_sec: f64,
    pub allow_rate: f64,
    pub deny_rate: f64,
    /// Fraction of the configured sample rate in use; 0 when unlimited.
    pub utilization: f64,
}

/// Aggregated activity across all tenants over a window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Overview {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub observed_samples: u64,
    pub observed_bytes: u64,
    /// Tenants with any activity inside the window.
    pub active_tenants: u64,
    /// Tenants known to the registry.
    pub known_tenants: u64,
}

/// How a decision settles against tenant state. The debit, the counter
/// increments and the rolling-window update all happen inside one
/// critical section on the tenant lock.
#[derive(Debug, Clone, Copy)]
pub enum Commit {
    /// Monitoring mode: count observed activity, leave buckets alone.
    Unenforced,
    /// Allow with a best-effort placeholder debit of one token.
    AllowPlaceholder,
    /// Denial decided before the rate stage; nothing is debited.
    Structural(Reason),
    /// Debit `tokens`: allow on success, refuse as a rate denial.
    Debit { tokens: u64 },
}

struct TenantState {
    limits: TenantLimits,
    enforcement: EnforcementConfig,
    samples_bucket: TokenBucket,
    counters: TenantCounters,
    window: RollingWindow,
    current: WindowSlot,
}

impl TenantState {
    fn new(limits: TenantLimits, enforcement: EnforcementConfig) -> Self {
        let (rate, capacity) = limits.samples_bucket_tuning(enforcement.burst_pct_override);
        Self {
            limits,
            enforcement,
            samples_bucket: TokenBucket::new(rate, capacity),
            counters: TenantCounters::default(),
            window: RollingWindow::new(),
            current: WindowSlot::default(),
        }
    }

    fn retune_bucket(&mut self) {
        let (rate, capacity) = self
            .limits
            .samples_bucket_tuning(self.enforcement.burst_pct_override);
        self.samples_bucket.retune(rate, capacity);
    }
}

/// One live tenant. The mutex covers the bucket, counters and the
/// current-second window accumulator; the denial ring locks separately
/// so recording a denial never re-enters the tenant lock.
pub struct Tenant {
    id: String,
    seq: u64,
    state: Mutex<TenantState>,
    denials: DenialRing,
}

impl Tenant {
    /// Original-casing tenant id, as first seen.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the limit table and enforcement switches.
    pub fn policy(&self) -> (TenantLimits, EnforcementConfig) {
        let st = self.state.lock();
        (st.limits, st.enforcement)
    }

    /// Settles one decision: debits (per `commit`), then updates the
    /// counters and the current-second accumulator, atomically under the
    /// tenant lock.
    pub fn commit(&self, observed: &Observed, commit: Commit, now: Instant) -> (Verdict, Option<Reason>) {
        let mut st = self.state.lock();
        let (verdict, reason) = match commit {
            Commit::Unenforced => (Verdict::Allow, Some(Reason::EnforcementDisabled)),
            Commit::AllowPlaceholder => {
                st.samples_bucket.take_max_at(1.0, now);
                (Verdict::Allow, Some(Reason::BodyExtractFailedAllow))
            }
            Commit::Structural(reason) => (Verdict::Deny, Some(reason)),
            Commit::Debit { tokens } => {
                if st.samples_bucket.take_at(tokens as f64, now) {
                    (Verdict::Allow, None)
                } else {
                    (Verdict::Deny, Some(Reason::SamplesRateExceeded))
                }
            }
        };

        st.counters.total_requests += 1;
        st.current.requests += 1;
        match verdict {
            Verdict::Allow => {
                st.counters.allowed_requests += 1;
                st.current.allowed += 1;
            }
            Verdict::Deny => {
                st.counters.denied_requests += 1;
                st.current.denied += 1;
                if let Some(reason) = reason {
                    *st.counters.denials_by_reason.entry(reason).or_insert(0) += 1;
                }
            }
        }
        st.counters.observed_samples_total += observed.samples;
        st.counters.observed_bytes_total += observed.bytes;
        st.current.samples += observed.samples;
        st.current.bytes += observed.bytes;
        st.counters.last_activity = Some(Utc::now());

        (verdict, reason)
    }

    fn info(&self) -> TenantInfo {
        let st = self.state.lock();
        TenantInfo {
            id: self.id.clone(),
            limits: st.limits,
            enforcement: st.enforcement,
            counters: st.counters.clone(),
            samples_bucket: BucketInfo {
                rate: st.samples_bucket.rate(),
                capacity: st.samples_bucket.capacity(),
                available: st.samples_bucket.available(),
            },
        }
    }
}

/// The tenant state store. Lookup is case-insensitive (keys are
/// lower-cased); the original casing is preserved for reporting. Tenants
/// are created on first reference and never destroyed within a process
/// lifetime.
pub struct TenantRegistry {
    tenants: DashMap<String, Arc<Tenant>>,
    config: RegistryConfig,
    epoch: Instant,
    global_denials: DenialRing,
    next_seq: AtomicU64,
}

impl TenantRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            tenants: DashMap::with_capacity_and_shard_amount(256, TENANT_MAP_SHARDS),
            global_denials: DenialRing::new(config.global_denial_capacity),
            config,
            epoch: Instant::now(),
            next_seq: AtomicU64::new(0),
        })
    }

    fn key(id: &str) -> String {
        id.trim().to_lowercase()
    }

    /// Idempotent lookup-or-insert. New tenants get the configured
    /// defaults; with the stock config that means enforcement disabled.
    pub fn get_or_create(&self, id: &str) -> Arc<Tenant> {
        let key = Self::key(id);
        if let Some(tenant) = self.tenants.get(&key) {
            return Arc::clone(&tenant);
        }
        let entry = self.tenants.entry(key).or_insert_with(|| {
            debug!(tenant = id.trim(), "registering tenant");
            Arc::new(Tenant {
                id: id.trim().to_string(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(TenantState::new(
                    self.config.default_limits,
                    self.config.default_enforcement,
                )),
                denials: DenialRing::new(self.config.tenant_denial_capacity),
            })
        });
        Arc::clone(&entry)
    }

    /// Replaces a tenant's limit table, creating the tenant when needed.
    /// Buckets are retuned in place; accumulated credit survives.
    pub fn set_limits(&self, id: &str, limits: TenantLimits) {
        let tenant = self.get_or_create(id);
        let mut st = tenant.state.lock();
        st.limits = limits.normalized();
        st.retune_bucket();
    }

    /// Replaces a tenant's enforcement switches, creating the tenant
    /// when needed. A burst override retunes the bucket capacity.
    pub fn set_enforcement(&self, id: &str, enforcement: EnforcementConfig) {
        let tenant = self.get_or_create(id);
        let mut st = tenant.state.lock();
        st.enforcement = EnforcementConfig {
            enabled: enforcement.enabled,
            burst_pct_override: enforcement.burst_pct_override.map(|b| b.clamp(0.0, 1.0)),
        };
        st.retune_bucket();
    }

    /// Read-only snapshot; `None` for tenants never referenced.
    pub fn snapshot(&self, id: &str) -> Option<TenantInfo> {
        self.tenants.get(&Self::key(id)).map(|t| t.info())
    }

    /// All tenants in registration order (lexicographic id tie-break).
    pub fn list(&self) -> Vec<TenantInfo> {
        let mut entries: Vec<(u64, TenantInfo)> = self
            .tenants
            .iter()
            .map(|entry| (entry.value().seq, entry.value().info()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        entries.into_iter().map(|(_, info)| info).collect()
    }

    /// Settles a decision against a tenant; see [`Tenant::commit`].
    pub fn record_decision(
        &self,
        id: &str,
        observed: &Observed,
        commit: Commit,
        now: Instant,
    ) -> (Verdict, Option<Reason>) {
        self.get_or_create(id).commit(observed, commit, now)
    }

    /// Appends a denial to the tenant's ring and the global ring. Both
    /// rings are bounded; the oldest record is evicted at capacity.
    pub fn record_denial(&self, record: DenialRecord) {
        let tenant = self.get_or_create(&record.tenant_id);
        tenant.denials.push(record.clone());
        self.global_denials.push(record);
    }

    /// Recent denials, newest first. `None` or `"*"` selects the global
    /// ring across all tenants.
    pub fn recent_denials(&self, tenant: Option<&str>, since: Duration) -> Vec<DenialRecord> {
        let since = chrono::Duration::from_std(since).unwrap_or_else(|_| chrono::Duration::MAX);
        match tenant {
            None | Some("*") => self.global_denials.recent(since),
            Some(id) => self
                .tenants
                .get(&Self::key(id))
                .map(|t| t.denials.recent(since))
                .unwrap_or_default(),
        }
    }

    /// Number of tenants known to the registry.
    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Seconds since the registry epoch, the time base for window ticks.
    pub fn now_tick(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// One aggregator step: drains every tenant's current-second
    /// accumulator into its window bands. Takes each tenant lock in
    /// turn, never all at once.
    pub fn tick(&self) {
        let tick = self.now_tick();
        for entry in self.tenants.iter() {
            let mut st = entry.value().state.lock();
            let slot = std::mem::take(&mut st.current);
            st.window.push(tick, slot);
        }
    }

    /// Windowed rates for one tenant; `None` for unknown tenants.
    pub fn rates(&self, id: &str, window: Duration) -> Option<TenantRates> {
        let tenant = self.tenants.get(&Self::key(id))?;
        let now_tick = self.now_tick();
        let st = tenant.state.lock();
        let mut totals = st.window.query(now_tick, window.as_secs());
        totals.absorb(&st.current);
        let secs = window.as_secs().max(1) as f64;
        let samples_per_sec = totals.samples as f64 / secs;
        let limit = st.limits.samples_per_second;
        Some(TenantRates {
            rps: totals.requests as f64 / secs,
            samples_per_sec,
            allow_rate: totals.allowed as f64 / secs,
            deny_rate: totals.denied as f64 / secs,
            utilization: if limit > 0.0 {
                samples_per_sec / limit
            } else {
                0.0
            },
        })
    }

    /// Aggregated counters across all tenants over a window.
    pub fn overview(&self, window: Duration) -> Overview {
        let now_tick = self.now_tick();
        let mut overview = Overview::default();
        for entry in self.tenants.iter() {
            overview.known_tenants += 1;
            let st = entry.value().state.lock();
            let mut totals = st.window.query(now_tick, window.as_secs());
            totals.absorb(&st.current);
            if totals.requests > 0 {
                overview.active_tenants += 1;
            }
            overview.total_requests += totals.requests;
            overview.allowed_requests += totals.allowed;
            overview.denied_requests += totals.denied;
            overview.observed_samples += totals.samples;
            overview.observed_bytes += totals.bytes;
        }
        overview
    }
}

/// Handle to the background window aggregator.
pub struct AggregatorHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl AggregatorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawns the once-per-second aggregation task. The task never blocks
/// decisions: it visits tenants one at a time, yielding each lock before
/// taking the next.
pub fn spawn_aggregator(registry: Arc<TenantRegistry>, interval: Duration) -> AggregatorHandle {
    let (shutdown, mut rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => registry.tick(),
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    AggregatorHandle { shutdown, task }
}
