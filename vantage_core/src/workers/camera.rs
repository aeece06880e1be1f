use crate::bias::BiasCorrector;
use crate::camera::{CameraPose, CameraSnapshot};
use crate::config::SourceLayout;
use crate::math::vec3;
use crate::snapshot::SnapshotCell;
use crate::stats::PipelineStats;
use crate::worker::{CycleError, CycleReport, Worker, WorkerKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use vantage_env::{Address, ReadError, ReadKind, ScatterReader};

/// Highest-rate worker: camera pose and origin-bias tracking.
///
/// Sole owner of the [`BiasCorrector`]. One read round per cycle: the
/// local viewpoint is read through the root pointer cached last cycle, and
/// a changed root pointer discards that speculative read.
pub struct CameraWorker<R> {
    reader: Arc<R>,
    layout: SourceLayout,
    period: Duration,
    corrector: BiasCorrector,
    out: SnapshotCell<CameraSnapshot>,
    stats: Arc<PipelineStats>,
    local_root: Address,
    sequence: u64,
}

impl<R: ScatterReader> CameraWorker<R> {
    pub fn new(
        reader: Arc<R>,
        layout: SourceLayout,
        period: Duration,
        corrector: BiasCorrector,
        out: SnapshotCell<CameraSnapshot>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            reader,
            layout,
            period,
            corrector,
            out,
            stats,
            local_root: Address::NULL,
            sequence: 0,
        }
    }
}

impl<R: ScatterReader> Worker for CameraWorker<R> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Camera
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run_cycle(&mut self, now: Duration) -> Result<CycleReport, CycleError> {
        let l = &self.layout;
        let mut report = CycleReport::default();

        let mut round = self.reader.begin_round();
        let location = round.add(l.camera.offset(l.camera_location), ReadKind::Vec3);
        let rotation = round.add(l.camera.offset(l.camera_rotation), ReadKind::Vec3);
        let fov = round.add(l.camera.offset(l.camera_fov), ReadKind::F32);
        let root = round.add(l.local_root, ReadKind::Pointer);
        let local = (!self.local_root.is_null())
            .then(|| round.add(self.local_root.offset(l.root_location), ReadKind::Vec3));
        let result = round.execute();
        report.absorb(&result);

        let location = result.vec3(location).ok_or(ReadError::SlotFailed)?;
        let rotation = result.vec3(rotation).ok_or(ReadError::SlotFailed)?;

        let mut local_raw = local.and_then(|slot| result.vec3(slot)).map(vec3);
        if let Some(root) = result.pointer(root) {
            if root != self.local_root {
                debug!(from = %self.local_root, to = %root, "local viewpoint changed");
                self.local_root = root;
                self.corrector.reset_reference();
                local_raw = None;
            }
        }

        if let Some(raw) = local_raw {
            if let Some(event) = self.corrector.observe(raw) {
                self.stats.record_rebase();
                info!(
                    jump_x = event.jump.x,
                    jump_y = event.jump.y,
                    jump_z = event.jump.z,
                    generation = event.bias.generation,
                    "origin rebase detected"
                );
            }
        }

        let bias = self.corrector.current();
        let previous = self.out.load();
        self.sequence += 1;
        self.out.store(CameraSnapshot {
            pose: CameraPose {
                location: bias.apply(&vec3(location)),
                rotation: vec3(rotation),
                fov_deg: result.f32(fov).unwrap_or(previous.pose.fov_deg),
            },
            local_view: local_raw
                .map(|raw| bias.apply(&raw))
                .or(previous.local_view),
            bias,
            captured_at: now,
            sequence: self.sequence,
        });

        report.items = 1;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;
    use crate::test_support::{FakeMemory, FakeWorld};
    use approx::assert_relative_eq;

    fn worker(world: &FakeWorld) -> (CameraWorker<FakeMemory>, SnapshotCell<CameraSnapshot>) {
        let out = SnapshotCell::new(CameraSnapshot::empty());
        let w = CameraWorker::new(
            world.shared(),
            world.layout.clone(),
            Duration::from_millis(1),
            BiasCorrector::new(5000.0),
            out.clone(),
            Arc::new(PipelineStats::new()),
        );
        (w, out)
    }

    #[test]
    fn test_publishes_camera_snapshot() {
        let world = FakeWorld::new();
        world.set_camera(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.0, 45.0, 0.0), 100.0);
        let (mut w, out) = worker(&world);

        assert!(!out.load().is_ready());
        w.run_cycle(Duration::from_millis(1)).unwrap();

        let snap = out.load();
        assert!(snap.is_ready());
        assert_relative_eq!(snap.pose.location, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(snap.pose.fov_deg, 100.0);
    }

    #[test]
    fn test_single_round_per_cycle() {
        let world = FakeWorld::new();
        let (mut w, _out) = worker(&world);
        for i in 0..5 {
            w.run_cycle(Duration::from_millis(i)).unwrap();
        }
        assert_eq!(world.memory().rounds(), 5);
    }

    #[test]
    fn test_origin_jump_is_absorbed_into_bias() {
        let world = FakeWorld::new();
        let (mut w, out) = worker(&world);

        world.set_local_view(Vec3::new(100.0, 0.0, 0.0));
        w.run_cycle(Duration::from_millis(1)).unwrap();
        w.run_cycle(Duration::from_millis(2)).unwrap();
        let before = out.load().local_view.unwrap();

        world.set_local_view(Vec3::new(100.0 - 20_000.0, 0.0, 0.0));
        world.set_camera(Vec3::new(-20_000.0, 0.0, 0.0), Vec3::zeros(), 90.0);
        w.run_cycle(Duration::from_millis(3)).unwrap();

        let snap = out.load();
        assert_eq!(snap.bias.generation, 1);
        assert_relative_eq!(snap.bias.offset, Vec3::new(20_000.0, 0.0, 0.0));
        assert_relative_eq!(snap.local_view.unwrap(), before);
        assert_relative_eq!(snap.pose.location, Vec3::zeros());
    }

    #[test]
    fn test_failed_local_read_keeps_last_view() {
        let world = FakeWorld::new();
        let (mut w, out) = worker(&world);

        world.set_local_view(Vec3::new(100.0, 0.0, 0.0));
        w.run_cycle(Duration::from_millis(1)).unwrap();
        w.run_cycle(Duration::from_millis(2)).unwrap();
        world.set_local_view(Vec3::new(100.0 + 30_000.0, 0.0, 0.0));
        w.run_cycle(Duration::from_millis(3)).unwrap();
        let before = out.load().local_view.unwrap();
        assert_eq!(out.load().bias.generation, 1);

        world.memory().fail(world.local_view_address());
        w.run_cycle(Duration::from_millis(4)).unwrap();

        let snap = out.load();
        assert_eq!(snap.sequence, 4);
        assert_relative_eq!(snap.local_view.unwrap(), before);
        assert_relative_eq!(before, Vec3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn test_viewpoint_change_is_not_a_rebase() {
        let world = FakeWorld::new();
        let (mut w, out) = worker(&world);
        w.run_cycle(Duration::from_millis(1)).unwrap();
        w.run_cycle(Duration::from_millis(2)).unwrap();

        // Respawn far away under a new root component
        let new_root = Address::new(0x4EEE_0000);
        world.set_local_root(new_root);
        world.memory().put(
            new_root.offset(world.layout.root_location),
            vantage_env::ReadValue::Vec3([90_000.0, 0.0, 0.0]),
        );
        for i in 3..6 {
            w.run_cycle(Duration::from_millis(i)).unwrap();
        }
        assert_eq!(out.load().bias.generation, 0);
    }

    #[test]
    fn test_failed_camera_read_keeps_previous_snapshot() {
        let world = FakeWorld::new();
        let (mut w, out) = worker(&world);
        w.run_cycle(Duration::from_millis(1)).unwrap();

        let l = world.layout.clone();
        world.memory().fail(l.camera.offset(l.camera_location));
        assert!(w.run_cycle(Duration::from_millis(2)).is_err());
        assert_eq!(out.load().sequence, 1);
    }
}
