//! Downsampled rolling history of per-tenant activity.
//!
//! Four time-indexed ring bands hold the last week of counters:
//! 1-second slots for the most recent 15 minutes, 1-minute slots for the
//! last hour, 10-minute slots for the last day, and 1-hour slots for the
//! last week. The aggregator pushes one slot per second; completed
//! coarse slots are promoted on their time boundary. Queries sum each
//! band only over its exclusive age range so overlapping retention never
//! double-counts.

use std::collections::VecDeque;

/// One slot of accumulated activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSlot {
    pub requests: u64,
    pub allowed: u64,
    pub denied: u64,
    pub samples: u64,
    pub bytes: u64,
}

impl WindowSlot {
    pub fn is_empty(&self) -> bool {
        self.requests == 0 && self.samples == 0 && self.bytes == 0
    }

    fn absorb(&mut self, other: &WindowSlot) {
        self.requests += other.requests;
        self.allowed += other.allowed;
        self.denied += other.denied;
        self.samples += other.samples;
        self.bytes += other.bytes;
    }
}

/// Aggregated counters over a queried horizon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub requests: u64,
    pub allowed: u64,
    pub denied: u64,
    pub samples: u64,
    pub bytes: u64,
}

impl WindowTotals {
    pub(crate) fn absorb(&mut self, slot: &WindowSlot) {
        self.requests += slot.requests;
        self.allowed += slot.allowed;
        self.denied += slot.denied;
        self.samples += slot.samples;
        self.bytes += slot.bytes;
    }
}

const SECONDS_BAND_SECS: u64 = 15 * 60;
const MINUTES_BAND_SECS: u64 = 60 * 60;
const TEN_MIN_BAND_SECS: u64 = 24 * 60 * 60;
const HOURS_BAND_SECS: u64 = 7 * 24 * 60 * 60;

const SECONDS_CAP: usize = SECONDS_BAND_SECS as usize;
const MINUTES_CAP: usize = 60;
const TEN_MIN_CAP: usize = 144;
const HOURS_CAP: usize = 168;

#[derive(Debug, Default)]
struct Band {
    /// (slot start tick, slot) pairs, oldest first.
    slots: VecDeque<(u64, WindowSlot)>,
    cap: usize,
}

impl Band {
    fn with_cap(cap: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, tick: u64, slot: WindowSlot) {
        if self.slots.len() == self.cap {
            self.slots.pop_front();
        }
        self.slots.push_back((tick, slot));
    }

    /// Sums slots with `from <= tick < until`.
    fn sum_range(&self, from: u64, until: u64, totals: &mut WindowTotals) {
        for (tick, slot) in self.slots.iter().rev() {
            if *tick >= until {
                continue;
            }
            if *tick < from {
                break;
            }
            totals.absorb(slot);
        }
    }
}

/// A partially accumulated coarse slot awaiting its boundary.
#[derive(Debug, Default)]
struct Partial {
    start: Option<u64>,
    slot: WindowSlot,
}

impl Partial {
    /// Accumulates `slot`; when `tick` crosses into a new period of
    /// `width` seconds, returns the completed (start, slot) pair.
    fn accumulate(&mut self, tick: u64, slot: &WindowSlot, width: u64) -> Option<(u64, WindowSlot)> {
        let period_start = (tick / width) * width;
        let flushed = match self.start {
            Some(start) if start != period_start => {
                Some((start, std::mem::take(&mut self.slot)))
            }
            _ => None,
        };
        self.start = Some(period_start);
        self.slot.absorb(slot);
        flushed
    }
}

/// The per-tenant rolling history. Ticks are seconds since the registry
/// epoch (monotonic), never wall-clock.
#[derive(Debug)]
pub struct RollingWindow {
    seconds: Band,
    minutes: Band,
    ten_minutes: Band,
    hours: Band,
    minute_partial: Partial,
    ten_min_partial: Partial,
    hour_partial: Partial,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingWindow {
    pub fn new() -> Self {
        Self {
            seconds: Band::with_cap(SECONDS_CAP),
            minutes: Band::with_cap(MINUTES_CAP),
            ten_minutes: Band::with_cap(TEN_MIN_CAP),
            hours: Band::with_cap(HOURS_CAP),
            minute_partial: Partial::default(),
            ten_min_partial: Partial::default(),
            hour_partial: Partial::default(),
        }
    }

    /// Appends one second of activity and promotes completed coarse
    /// slots across the bands.
    pub fn push(&mut self, tick: u64, slot: WindowSlot) {
        self.seconds.push(tick, slot);

        if let Some((start, minute)) = self.minute_partial.accumulate(tick, &slot, 60) {
            self.minutes.push(start, minute);
            if let Some((start, ten)) = self.ten_min_partial.accumulate(start, &minute, 600) {
                self.ten_minutes.push(start, ten);
                if let Some((start, hour)) = self.hour_partial.accumulate(start, &ten, 3600) {
                    self.hours.push(start, hour);
                }
            }
        }
    }

    /// Sums activity over `[now_tick − horizon_secs, now_tick]`, reading
    /// each band only inside its exclusive age range. Coarse slots not
    /// yet promoted are covered by the finer band that still retains
    /// them.
    pub fn query(&self, now_tick: u64, horizon_secs: u64) -> WindowTotals {
        let mut totals = WindowTotals::default();
        let from = now_tick.saturating_sub(horizon_secs);

        let seconds_from = from.max(now_tick.saturating_sub(SECONDS_BAND_SECS));
        self.seconds.sum_range(seconds_from, u64::MAX, &mut totals);

        if horizon_secs > SECONDS_BAND_SECS {
            let minutes_from = from.max(now_tick.saturating_sub(MINUTES_BAND_SECS));
            self.minutes
                .sum_range(minutes_from, now_tick.saturating_sub(SECONDS_BAND_SECS), &mut totals);
        }
        if horizon_secs > MINUTES_BAND_SECS {
            let ten_from = from.max(now_tick.saturating_sub(TEN_MIN_BAND_SECS));
            self.ten_minutes
                .sum_range(ten_from, now_tick.saturating_sub(MINUTES_BAND_SECS), &mut totals);
        }
        if horizon_secs > TEN_MIN_BAND_SECS {
            let hours_from = from.max(now_tick.saturating_sub(HOURS_BAND_SECS));
            self.hours
                .sum_range(hours_from, now_tick.saturating_sub(TEN_MIN_BAND_SECS), &mut totals);
        }
        totals
    }
}
