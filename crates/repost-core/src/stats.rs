use std::{collections::VecDeque, sync::RwLock};

use chrono::{DateTime, Utc};

use crate::domain::{ChatId, MessageId};

/// Per-target outcome of one dispatch cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetOutcome {
    Sent,
    SkippedInactive,
    FailedTransient,
    FailedPermanent,
}

/// Aggregated record of one forward cycle.
#[derive(Clone, Debug)]
pub struct CycleResult {
    pub candidate: MessageId,
    pub per_target: Vec<(ChatId, TargetOutcome)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleResult {
    pub fn sent(&self) -> usize {
        self.count(TargetOutcome::Sent)
    }

    pub fn failed(&self) -> usize {
        self.count(TargetOutcome::FailedTransient) + self.count(TargetOutcome::FailedPermanent)
    }

    pub fn skipped(&self) -> usize {
        self.count(TargetOutcome::SkippedInactive)
    }

    fn count(&self, outcome: TargetOutcome) -> usize {
        self.per_target.iter().filter(|(_, o)| *o == outcome).count()
    }
}

/// Lifetime counters across all recorded cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_sent: u64,
    pub total_failed: u64,
    pub uptime_cycles: u64,
}

/// In-memory ring buffer of recent cycle results plus running totals.
///
/// History is capped; totals are not. Nothing here is persisted — restart
/// resets the counters, which is fine for operator `/stats` output.
pub struct CycleStats {
    inner: RwLock<Inner>,
    capacity: usize,
}

struct Inner {
    recent: VecDeque<CycleResult>,
    totals: Statistics,
}

impl CycleStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                recent: VecDeque::with_capacity(capacity),
                totals: Statistics::default(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, result: CycleResult) {
        let Ok(mut inner) = self.inner.write() else {
            return; // poisoned lock, drop the sample
        };
        inner.totals.uptime_cycles += 1;
        inner.totals.total_sent += result.sent() as u64;
        inner.totals.total_failed += result.failed() as u64;

        if inner.recent.len() == self.capacity {
            inner.recent.pop_front();
        }
        inner.recent.push_back(result);
    }

    /// Up to `n` most recent cycles, newest first.
    pub fn recent(&self, n: usize) -> Vec<CycleResult> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        inner.recent.iter().rev().take(n).cloned().collect()
    }

    pub fn statistics(&self) -> Statistics {
        self.inner
            .read()
            .map(|inner| inner.totals)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(candidate: i32, outcomes: &[TargetOutcome]) -> CycleResult {
        let now = Utc::now();
        CycleResult {
            candidate: MessageId(candidate),
            per_target: outcomes
                .iter()
                .enumerate()
                .map(|(i, o)| (ChatId(i as i64 + 1), *o))
                .collect(),
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn totals_accumulate_across_cycles() {
        let stats = CycleStats::new(10);
        stats.record(cycle(1, &[TargetOutcome::Sent, TargetOutcome::Sent]));
        stats.record(cycle(
            2,
            &[
                TargetOutcome::Sent,
                TargetOutcome::FailedTransient,
                TargetOutcome::SkippedInactive,
            ],
        ));

        let totals = stats.statistics();
        assert_eq!(totals.uptime_cycles, 2);
        assert_eq!(totals.total_sent, 3);
        assert_eq!(totals.total_failed, 1);
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let stats = CycleStats::new(2);
        for i in 1..=3 {
            stats.record(cycle(i, &[TargetOutcome::Sent]));
        }

        let recent = stats.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].candidate, MessageId(3));
        assert_eq!(recent[1].candidate, MessageId(2));

        // Totals still count the evicted cycle.
        assert_eq!(stats.statistics().uptime_cycles, 3);
    }

    #[test]
    fn skipped_targets_do_not_count_as_failures() {
        let c = cycle(1, &[TargetOutcome::SkippedInactive, TargetOutcome::Sent]);
        assert_eq!(c.sent(), 1);
        assert_eq!(c.failed(), 0);
        assert_eq!(c.skipped(), 1);
    }
}
