//! Pipeline wiring and lifecycle.
//!
//! [`Pipeline`] owns every shared container (no process-wide state), so
//! several pipelines can coexist and each is testable in isolation.
//!
//! ```text
//!              +-----------+    camera snapshot, bias
//!   camera --->|  shared   |----------------------------+
//!   roster --->| snapshots |--- roster -----+           |
//!              +-----------+                v           v
//!                           vitals ---> position ---> frame seqlock ---> PipelineHandle
//!                           pose -----> skeleton cache ---------------->
//! ```
//!
//! Two ways to drive it:
//! - [`Pipeline::start`] / [`Pipeline::stop`]: one OS thread per worker
//! - [`Pipeline::step_all`] / [`Pipeline::step_due`]: cycles run on the
//!   caller's thread, for deterministic simulation and tests

use crate::bias::{Bias, BiasCorrector, BiasHandle};
use crate::camera::CameraSnapshot;
use crate::config::{ConfigError, PipelineConfig};
use crate::frame::{frame_channel, Frame, FrameReader};
use crate::identity::IdentityKey;
use crate::math::Vec3;
use crate::ownership::{anchors_from_frame, Ownership, OwnershipResolver};
use crate::roster::RosterSnapshot;
use crate::skeleton::SkeletonCache;
use crate::snapshot::SnapshotCell;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::vitals::VitalsSnapshot;
use crate::worker::{execute_cycle, CycleError, CycleReport, Worker, WorkerKind, WorkerLoop};
use crate::workers::{CameraWorker, PoseWorker, PositionWorker, RosterWorker, VitalsWorker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vantage_env::{ScatterReader, VantageContext};

/// Default join budget used when a running pipeline is dropped.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Worker {0} was lost after a stop timeout")]
    WorkersConsumed(&'static str),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Outcome of one stepped cycle.
pub type StepOutcome = (WorkerKind, Result<CycleReport, CycleError>);

/// The snapshot engine.
pub struct Pipeline {
    config: PipelineConfig,
    ctx: Arc<dyn VantageContext>,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,

    /// Indexed like [`WorkerKind::ALL`]; `None` while on a thread
    workers: Vec<Option<Box<dyn Worker>>>,
    next_due: [Duration; WorkerKind::COUNT],
    threads: Vec<(WorkerKind, JoinHandle<Box<dyn Worker>>)>,

    handle: PipelineHandle,
}

impl Pipeline {
    /// Builds the shared state and all five workers.
    pub fn new<R, C>(reader: Arc<R>, ctx: Arc<C>, config: PipelineConfig) -> Result<Self, ConfigError>
    where
        R: ScatterReader,
        C: VantageContext,
    {
        config.validate()?;
        let ctx: Arc<dyn VantageContext> = ctx;
        let rates = &config.rates;

        let stats = Arc::new(PipelineStats::new());
        let corrector = BiasCorrector::new(config.bias.rebase_threshold);
        let bias = corrector.handle();
        let camera = SnapshotCell::new(CameraSnapshot::empty());
        let roster = SnapshotCell::new(RosterSnapshot::default());
        let vitals = SnapshotCell::new(VitalsSnapshot::default());
        let skeletons = SkeletonCache::new(config.skeleton.force_refresh(), config.skeleton.max_age());
        let (publisher, frames) = frame_channel();

        let workers: Vec<Option<Box<dyn Worker>>> = vec![
            Some(Box::new(CameraWorker::new(
                Arc::clone(&reader),
                config.layout.clone(),
                rates.camera_period(),
                corrector,
                camera.clone(),
                Arc::clone(&stats),
            ))),
            Some(Box::new(RosterWorker::new(
                Arc::clone(&reader),
                config.roster.clone(),
                config.layout.clone(),
                rates.roster_period(),
                roster.clone(),
            ))),
            Some(Box::new(VitalsWorker::new(
                Arc::clone(&reader),
                config.layout.clone(),
                rates.vitals_period(),
                roster.clone(),
                vitals.clone(),
            ))),
            Some(Box::new(PoseWorker::new(
                Arc::clone(&reader),
                config.layout.clone(),
                config.skeleton.clone(),
                config.viewport,
                rates.pose_period(),
                roster.clone(),
                camera.clone(),
                bias.clone(),
                skeletons.clone(),
                Arc::clone(&stats),
                Arc::clone(&ctx),
            ))),
            Some(Box::new(PositionWorker::new(
                reader,
                config.layout.clone(),
                config.coalesce.clone(),
                config.viewport,
                rates.position_period(),
                roster.clone(),
                camera.clone(),
                vitals,
                skeletons.clone(),
                bias.clone(),
                publisher,
                Arc::clone(&stats),
            ))),
        ];

        let handle = PipelineHandle {
            frames,
            skeletons,
            bias,
            roster,
            camera,
            stats: Arc::clone(&stats),
            ctx: Arc::clone(&ctx),
            ownership: Arc::new(Mutex::new(OwnershipResolver::new(config.ownership.clone()))),
        };

        Ok(Self {
            config,
            ctx,
            stats,
            running: Arc::new(AtomicBool::new(false)),
            workers,
            next_due: [Duration::ZERO; WorkerKind::COUNT],
            threads: Vec::new(),
            handle,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A clonable consumer handle.
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns one named thread per worker.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }
        if let Some(i) = self.workers.iter().position(Option::is_none) {
            return Err(PipelineError::WorkersConsumed(WorkerKind::ALL[i].name()));
        }

        self.running.store(true, Ordering::Release);
        for slot in self.workers.iter_mut() {
            let Some(worker) = slot.take() else {
                continue;
            };
            let kind = worker.kind();
            let worker_loop = WorkerLoop::new(
                worker,
                Arc::clone(&self.ctx),
                Arc::clone(&self.running),
                Arc::clone(&self.stats),
            );
            let spawned = thread::Builder::new()
                .name(format!("vantage-{}", kind.name()))
                .spawn(move || worker_loop.run());
            match spawned {
                Ok(handle) => self.threads.push((kind, handle)),
                Err(e) => {
                    warn!(worker = kind.name(), "failed to spawn worker thread: {}", e);
                    self.stop(DEFAULT_STOP_TIMEOUT);
                    return Err(PipelineError::Spawn(e.to_string()));
                }
            }
        }

        info!(workers = self.threads.len(), "pipeline started");
        Ok(())
    }

    /// Clears the running flag and joins every worker within `timeout`.
    ///
    /// In-flight reads are never interrupted. Returns the workers that did
    /// not stop in time; those are detached and cannot be restarted.
    pub fn stop(&mut self, timeout: Duration) -> Vec<WorkerKind> {
        self.running.store(false, Ordering::Release);
        if self.threads.is_empty() {
            return Vec::new();
        }

        let deadline = Instant::now() + timeout;
        let (tx, rx) = mpsc::channel();
        let mut pending: Vec<WorkerKind> = Vec::with_capacity(self.threads.len());
        for (kind, handle) in self.threads.drain(..) {
            let tx = tx.clone();
            pending.push(kind);
            // JoinHandle has no timed join; wait on a helper thread instead
            thread::spawn(move || {
                let _ = tx.send((kind, handle.join()));
            });
        }
        drop(tx);

        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((kind, Ok(worker))) => {
                    pending.retain(|k| *k != kind);
                    self.workers[kind.index()] = Some(worker);
                }
                Ok((kind, Err(_))) => {
                    pending.retain(|k| *k != kind);
                    warn!(worker = kind.name(), "worker thread panicked during shutdown");
                }
                Err(_) => break,
            }
        }

        for kind in &pending {
            warn!(worker = kind.name(), ?timeout, "worker did not stop in time");
        }
        info!(stragglers = pending.len(), "pipeline stopped");
        pending
    }

    /// Runs every worker once in dependency order on this thread.
    pub fn step_all(&mut self, now: Duration) -> Result<Vec<StepOutcome>, PipelineError> {
        self.step_where(now, |_, _| true)
    }

    /// Runs only the workers whose period has elapsed since their last
    /// stepped cycle.
    pub fn step_due(&mut self, now: Duration) -> Result<Vec<StepOutcome>, PipelineError> {
        let next_due = self.next_due;
        self.step_where(now, |i, now| now >= next_due[i])
    }

    fn step_where(
        &mut self,
        now: Duration,
        due: impl Fn(usize, Duration) -> bool,
    ) -> Result<Vec<StepOutcome>, PipelineError> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }

        let mut outcomes = Vec::new();
        for (i, slot) in self.workers.iter_mut().enumerate() {
            let worker = slot
                .as_mut()
                .ok_or(PipelineError::WorkersConsumed(WorkerKind::ALL[i].name()))?;
            if !due(i, now) {
                continue;
            }
            let result = execute_cycle(worker.as_mut(), now, &self.stats);
            self.next_due[i] = now + worker.period();
            outcomes.push((worker.kind(), result));
        }
        Ok(outcomes)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop(DEFAULT_STOP_TIMEOUT);
        }
    }
}

// ============================================================================
// CONSUMER HANDLE
// ============================================================================

/// Read side of a pipeline, for the render loop and other consumers.
///
/// Every query is non-blocking; `None` means "nothing this tick".
#[derive(Clone)]
pub struct PipelineHandle {
    frames: FrameReader,
    skeletons: SkeletonCache,
    bias: BiasHandle,
    roster: SnapshotCell<RosterSnapshot>,
    camera: SnapshotCell<CameraSnapshot>,
    stats: Arc<PipelineStats>,
    ctx: Arc<dyn VantageContext>,
    ownership: Arc<Mutex<OwnershipResolver>>,
}

impl PipelineHandle {
    /// Latest published frame.
    pub fn try_get_frame(&self) -> Option<Arc<Frame>> {
        self.frames.try_get_frame()
    }

    /// Cached world-space joints for `key`.
    pub fn try_get_skeleton(&self, key: IdentityKey) -> Option<Arc<[Vec3]>> {
        self.skeletons.try_get_skeleton(key, self.ctx.now())
    }

    /// Resolves which entity owns an external object at `position`.
    ///
    /// `position_bias` is the bias already applied to `position`, which
    /// must have been read in the latest frame's source origin.
    pub fn nearest_owner(
        &self,
        object: u64,
        position: Vec3,
        position_bias: &Bias,
    ) -> Option<Ownership> {
        let frame = self.try_get_frame()?;
        let mut resolver = self.ownership.lock();
        let anchors = anchors_from_frame(
            &frame,
            &self.skeletons,
            self.ctx.now(),
            resolver.config().head_height,
        );
        resolver.resolve(object, position, position_bias, &frame, &anchors)
    }

    /// Drops ownership state for an object that no longer exists.
    pub fn forget_object(&self, object: u64) {
        self.ownership.lock().forget(object);
    }

    pub fn current_bias(&self) -> Bias {
        self.bias.current()
    }

    pub fn roster(&self) -> Arc<RosterSnapshot> {
        self.roster.load()
    }

    pub fn camera(&self) -> Arc<CameraSnapshot> {
        self.camera.load()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeEntity, FakeWorld};
    use vantage_env::SystemContext;

    fn pipeline(world: &FakeWorld) -> Pipeline {
        Pipeline::new(world.shared(), SystemContext::shared(), PipelineConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let world = FakeWorld::new();
        let mut config = PipelineConfig::default();
        config.rates.camera_ms = 0.0;
        assert!(Pipeline::new(world.shared(), SystemContext::shared(), config).is_err());
    }

    #[test]
    fn test_step_all_publishes_frame() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        let b = FakeEntity::npc(2);
        world.spawn_all(&[&a, &b]);

        let mut p = pipeline(&world);
        let handle = p.handle();
        assert!(handle.try_get_frame().is_none());

        let outcomes = p.step_all(Duration::ZERO).unwrap();
        let order: Vec<_> = outcomes.iter().map(|(k, _)| *k).collect();
        assert_eq!(order, WorkerKind::ALL.to_vec());
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));

        let frame = handle.try_get_frame().unwrap();
        assert_eq!(frame.len(), 2);
        assert!(handle.try_get_skeleton(a.key()).is_some());
        assert_eq!(handle.stats().frames_published, 1);
    }

    #[test]
    fn test_step_due_respects_periods() {
        let world = FakeWorld::new();
        let mut p = pipeline(&world);

        assert_eq!(p.step_due(Duration::ZERO).unwrap().len(), 5);
        // 3 ms: camera (1 ms) and position (3 ms) are due
        let kinds: Vec<_> = p
            .step_due(Duration::from_millis(3))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(kinds, vec![WorkerKind::Camera, WorkerKind::Position]);
    }

    #[test]
    fn test_threads_start_stop_restart() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        world.spawn_all(&[&a]);
        let mut p = pipeline(&world);
        let handle = p.handle();

        p.start().unwrap();
        assert_eq!(p.start(), Err(PipelineError::AlreadyRunning));
        assert!(matches!(p.step_all(Duration::ZERO), Err(PipelineError::AlreadyRunning)));

        let started = Instant::now();
        while handle.try_get_frame().map_or(true, |f| f.is_empty()) {
            assert!(started.elapsed() < Duration::from_secs(5), "no frame published");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(p.stop(Duration::from_secs(2)).is_empty());
        assert!(!p.is_running());

        p.start().unwrap();
        assert!(p.stop(Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_nearest_owner_uses_published_frame() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        world.spawn_all(&[&a]);
        let mut p = pipeline(&world);
        let handle = p.handle();

        assert!(handle.nearest_owner(7, a.position, &Bias::zero()).is_none());
        p.step_all(Duration::ZERO).unwrap();

        let owner = handle
            .nearest_owner(7, a.position + Vec3::new(20.0, 0.0, 0.0), &Bias::zero())
            .unwrap();
        assert_eq!(owner.owner, a.key());
    }
}
