//! Worker contract and the paced loop that drives it.
//!
//! A worker is a plain state machine with one entry point,
//! [`Worker::run_cycle`]. [`WorkerLoop`] owns the timing: measure, run,
//! record, then sleep/spin to the next tick. Nothing a cycle returns (or
//! panics with) escapes the loop.

use crate::stats::PipelineStats;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use vantage_env::{ReadError, RoundResult, VantageContext};

// ============================================================================
// WORKER IDENTITY
// ============================================================================

/// The five pipeline workers, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Camera,
    Roster,
    Vitals,
    Pose,
    Position,
}

impl WorkerKind {
    pub const COUNT: usize = 5;
    pub const ALL: [WorkerKind; Self::COUNT] = [
        WorkerKind::Camera,
        WorkerKind::Roster,
        WorkerKind::Vitals,
        WorkerKind::Pose,
        WorkerKind::Position,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WorkerKind::Camera => "camera",
            WorkerKind::Roster => "roster",
            WorkerKind::Vitals => "vitals",
            WorkerKind::Pose => "pose",
            WorkerKind::Position => "position",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Latency sensitivity of each worker.
    pub fn priority(self) -> PriorityHint {
        match self {
            WorkerKind::Camera => PriorityHint::Highest,
            WorkerKind::Position | WorkerKind::Pose => PriorityHint::High,
            WorkerKind::Vitals => PriorityHint::Normal,
            WorkerKind::Roster => PriorityHint::Low,
        }
    }
}

/// Scheduling hint recorded per worker thread.
///
/// Applying it to the OS scheduler is platform-specific and left to the
/// embedding process; the pipeline records and logs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityHint {
    Low,
    Normal,
    High,
    Highest,
}

// ============================================================================
// CYCLE RESULTS
// ============================================================================

/// What one successful cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Read rounds that reached the backend
    pub rounds: u32,
    /// Slots that produced no value
    pub failed_slots: u32,
    /// Entities (or joints, samples...) produced
    pub items: usize,
}

impl CycleReport {
    /// Accounts for an executed round.
    pub fn absorb(&mut self, round: &RoundResult) {
        if round.executed() {
            self.rounds += 1;
            self.failed_slots += round.failed_count() as u32;
        }
    }
}

/// Why a cycle produced nothing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CycleError {
    /// Headers or counts read back as nonsense; output discarded
    #[error("Structural invalidation: {0}")]
    Structural(String),

    /// A read this cycle depends on had no value
    #[error("Read failed: {0}")]
    Read(#[from] ReadError),

    /// Upstream snapshot not available yet
    #[error("Waiting for {0}")]
    NotReady(&'static str),
}

impl CycleError {
    pub fn structural(msg: impl Into<String>) -> Self {
        CycleError::Structural(msg.into())
    }
}

// ============================================================================
// WORKER TRAIT
// ============================================================================

/// One independently-paced poller.
pub trait Worker: Send {
    fn kind(&self) -> WorkerKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Target period between cycle starts.
    fn period(&self) -> Duration;

    fn priority(&self) -> PriorityHint {
        self.kind().priority()
    }

    /// Runs one bounded cycle.
    fn run_cycle(&mut self, now: Duration) -> Result<CycleReport, CycleError>;
}

/// Runs one cycle and records it. Panics are caught and counted as
/// failures.
pub fn execute_cycle(
    worker: &mut dyn Worker,
    now: Duration,
    stats: &PipelineStats,
) -> Result<CycleReport, CycleError> {
    let kind = worker.kind();
    let result = match panic::catch_unwind(AssertUnwindSafe(|| worker.run_cycle(now))) {
        Ok(result) => result,
        Err(_) => {
            warn!(worker = kind.name(), "cycle panicked; continuing");
            stats.record_cycle(kind, false);
            return Err(CycleError::structural("cycle panicked"));
        }
    };

    match &result {
        Ok(report) => {
            stats.record_rounds(u64::from(report.rounds), u64::from(report.failed_slots));
            trace!(
                worker = kind.name(),
                rounds = report.rounds,
                failed_slots = report.failed_slots,
                items = report.items,
                "cycle complete"
            );
        }
        Err(CycleError::Structural(msg)) => {
            warn!(worker = kind.name(), "structural failure: {}", msg);
        }
        Err(CycleError::Read(err)) => {
            trace!(worker = kind.name(), "read failure: {}", err);
        }
        Err(CycleError::NotReady(what)) => {
            trace!(worker = kind.name(), "waiting for {}", what);
        }
    }
    stats.record_cycle(kind, result.is_ok());
    result
}

// ============================================================================
// PACING
// ============================================================================

/// Hybrid sleeper: chunked sleeps so the running flag is re-checked, with
/// the context providing the final spin tail.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    max_chunk: Duration,
}

impl Default for Pacer {
    fn default() -> Self {
        Self {
            max_chunk: Self::MAX_CHUNK,
        }
    }
}

impl Pacer {
    /// Longest uninterrupted sleep before re-checking the running flag.
    pub const MAX_CHUNK: Duration = Duration::from_millis(50);

    /// Sleeps for `remaining` unless `running` clears first.
    pub fn pace(&self, ctx: &dyn VantageContext, remaining: Duration, running: &AtomicBool) {
        let deadline = ctx.now() + remaining;
        loop {
            if !running.load(Ordering::Acquire) {
                return;
            }
            let now = ctx.now();
            if now >= deadline {
                return;
            }
            ctx.sleep((deadline - now).min(self.max_chunk));
        }
    }
}

// ============================================================================
// LOOP
// ============================================================================

/// Drives one worker on its own thread until the running flag clears.
pub struct WorkerLoop {
    worker: Box<dyn Worker>,
    ctx: Arc<dyn VantageContext>,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    pacer: Pacer,
}

impl WorkerLoop {
    pub fn new(
        worker: Box<dyn Worker>,
        ctx: Arc<dyn VantageContext>,
        running: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            worker,
            ctx,
            running,
            stats,
            pacer: Pacer::default(),
        }
    }

    /// Runs until stopped and hands the worker back.
    pub fn run(mut self) -> Box<dyn Worker> {
        let kind = self.worker.kind();
        let period = self.worker.period();
        info!(
            worker = kind.name(),
            period_us = period.as_micros() as u64,
            priority = ?self.worker.priority(),
            "worker started"
        );

        let mut cycles: u64 = 0;
        while self.running.load(Ordering::Acquire) {
            let start = self.ctx.now();
            let _ = execute_cycle(self.worker.as_mut(), start, &self.stats);
            cycles += 1;

            let elapsed = self.ctx.now().saturating_sub(start);
            if elapsed > period {
                self.stats.record_overrun(kind);
                debug!(
                    worker = kind.name(),
                    elapsed_us = elapsed.as_micros() as u64,
                    "cycle overran its period"
                );
                continue;
            }
            self.pacer
                .pace(self.ctx.as_ref(), period - elapsed, &self.running);
        }

        info!(worker = kind.name(), cycles, "worker stopped");
        self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use vantage_env::SystemContext;

    struct Flaky {
        calls: Arc<AtomicU32>,
    }

    impl Worker for Flaky {
        fn kind(&self) -> WorkerKind {
            WorkerKind::Vitals
        }

        fn period(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn run_cycle(&mut self, _now: Duration) -> Result<CycleReport, CycleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match n % 3 {
                0 => Err(CycleError::Read(ReadError::SlotFailed)),
                1 => panic!("bad read"),
                _ => Ok(CycleReport {
                    rounds: 1,
                    failed_slots: 0,
                    items: 1,
                }),
            }
        }
    }

    #[test]
    fn test_priority_order() {
        assert!(WorkerKind::Camera.priority() > WorkerKind::Position.priority());
        assert!(WorkerKind::Position.priority() > WorkerKind::Roster.priority());
    }

    #[test]
    fn test_failures_and_panics_are_contained() {
        let stats = PipelineStats::new();
        let calls = Arc::new(AtomicU32::new(0));
        let mut worker = Flaky {
            calls: Arc::clone(&calls),
        };

        for _ in 0..3 {
            let _ = execute_cycle(&mut worker, Duration::ZERO, &stats);
        }

        let snap = stats.snapshot();
        let vitals = snap.worker(WorkerKind::Vitals).unwrap();
        assert_eq!(vitals.cycles, 3);
        assert_eq!(vitals.failures, 2);
        assert_eq!(snap.rounds, 1);
    }

    #[test]
    fn test_loop_keeps_running_through_failures_and_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(PipelineStats::new());
        let worker_loop = WorkerLoop::new(
            Box::new(Flaky {
                calls: Arc::clone(&calls),
            }),
            SystemContext::shared(),
            Arc::clone(&running),
            Arc::clone(&stats),
        );

        let handle = thread::spawn(move || worker_loop.run());
        while calls.load(Ordering::SeqCst) < 10 {
            thread::yield_now();
        }
        running.store(false, Ordering::Release);
        let worker = handle.join().unwrap();

        assert_eq!(worker.kind(), WorkerKind::Vitals);
        assert!(stats.snapshot().worker(WorkerKind::Vitals).unwrap().failures >= 6);
    }

    #[test]
    fn test_pacer_returns_early_when_stopped() {
        let ctx = SystemContext::new();
        let running = AtomicBool::new(false);
        let start = std::time::Instant::now();
        Pacer::default().pace(&ctx, Duration::from_secs(10), &running);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
