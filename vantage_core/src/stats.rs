//! Pipeline counters.
//!
//! Everything is a relaxed atomic: counters are for observation, not
//! synchronisation.

use crate::worker::WorkerKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkerCounters {
    cycles: AtomicU64,
    failures: AtomicU64,
    overruns: AtomicU64,
}

/// Counters shared by every worker of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    workers: [WorkerCounters; WorkerKind::COUNT],
    rounds: AtomicU64,
    failed_slots: AtomicU64,
    frames_published: AtomicU64,
    rebases: AtomicU64,
    merges: AtomicU64,
    skeleton_refreshes: AtomicU64,
    skeleton_evictions: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, kind: WorkerKind, ok: bool) {
        let w = &self.workers[kind.index()];
        bump(&w.cycles, 1);
        if !ok {
            bump(&w.failures, 1);
        }
    }

    pub fn record_overrun(&self, kind: WorkerKind) {
        bump(&self.workers[kind.index()].overruns, 1);
    }

    pub fn record_rounds(&self, rounds: u64, failed_slots: u64) {
        bump(&self.rounds, rounds);
        bump(&self.failed_slots, failed_slots);
    }

    pub fn record_frame(&self) {
        bump(&self.frames_published, 1);
    }

    pub fn record_rebase(&self) {
        bump(&self.rebases, 1);
    }

    pub fn record_merges(&self, n: u64) {
        bump(&self.merges, n);
    }

    pub fn record_skeletons(&self, refreshed: u64, evicted: u64) {
        bump(&self.skeleton_refreshes, refreshed);
        bump(&self.skeleton_evictions, evicted);
    }

    /// Copies every counter into a plain value.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            workers: WorkerKind::ALL
                .iter()
                .map(|&kind| {
                    let w = &self.workers[kind.index()];
                    WorkerStats {
                        worker: kind,
                        cycles: load(&w.cycles),
                        failures: load(&w.failures),
                        overruns: load(&w.overruns),
                    }
                })
                .collect(),
            rounds: load(&self.rounds),
            failed_slots: load(&self.failed_slots),
            frames_published: load(&self.frames_published),
            rebases: load(&self.rebases),
            merges: load(&self.merges),
            skeleton_refreshes: load(&self.skeleton_refreshes),
            skeleton_evictions: load(&self.skeleton_evictions),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker: WorkerKind,
    pub cycles: u64,
    pub failures: u64,
    pub overruns: u64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub workers: Vec<WorkerStats>,
    pub rounds: u64,
    pub failed_slots: u64,
    pub frames_published: u64,
    pub rebases: u64,
    pub merges: u64,
    pub skeleton_refreshes: u64,
    pub skeleton_evictions: u64,
}

impl StatsSnapshot {
    pub fn worker(&self, kind: WorkerKind) -> Option<&WorkerStats> {
        self.workers.iter().find(|w| w.worker == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        stats.record_cycle(WorkerKind::Camera, true);
        stats.record_cycle(WorkerKind::Camera, false);
        stats.record_overrun(WorkerKind::Pose);
        stats.record_rounds(3, 2);
        stats.record_skeletons(4, 1);

        let snap = stats.snapshot();
        let camera = snap.worker(WorkerKind::Camera).unwrap();
        assert_eq!((camera.cycles, camera.failures), (2, 1));
        assert_eq!(snap.worker(WorkerKind::Pose).unwrap().overruns, 1);
        assert_eq!(snap.rounds, 3);
        assert_eq!(snap.failed_slots, 2);
        assert_eq!(snap.skeleton_refreshes, 4);
        assert_eq!(snap.skeleton_evictions, 1);
        assert_eq!(snap.workers.len(), WorkerKind::COUNT);
    }
}
