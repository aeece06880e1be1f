use crate::bias::{Bias, BiasHandle};
use crate::camera::CameraSnapshot;
use crate::config::{SkeletonConfig, SourceLayout, Viewport};
use crate::identity::IdentityKey;
use crate::math::{vec3, Vec3, WorldTransform};
use crate::roster::{RosterEntry, RosterSnapshot};
use crate::skeleton::{RefreshReason, SkeletonCache, SkeletonEntry};
use crate::snapshot::SnapshotCell;
use crate::stats::PipelineStats;
use crate::worker::{CycleError, CycleReport, Worker, WorkerKind};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use vantage_env::{Address, ReadKind, ScatterReader, SlotId, VantageContext};

/// One entity due for a skeleton refresh.
#[derive(Debug, Clone)]
struct Due {
    key: IdentityKey,
    mesh: Address,
    counter: Option<u32>,
    reason: RefreshReason,
    background: bool,
    visible: bool,
    distance: f32,
}

impl Due {
    /// Entries with no skeleton or one past the force-refresh budget.
    fn urgent(&self) -> bool {
        !matches!(self.reason, RefreshReason::CounterAdvanced)
    }

    /// Urgent first, then non-background, then visible, then nearest; key
    /// breaks ties.
    ///
    /// An entry is urgent at most once per force-refresh period, so every
    /// class gets its first skeleton and its forced refresh even while
    /// counter refreshes of animating entities saturate the cap.
    fn priority_cmp(&self, other: &Due) -> Ordering {
        other
            .urgent()
            .cmp(&self.urgent())
            .then(self.background.cmp(&other.background))
            .then(other.visible.cmp(&self.visible))
            .then(self.distance.total_cmp(&other.distance))
            .then(self.key.cmp(&other.key))
    }
}

/// High-rate skeleton refresher.
///
/// ```text
/// R1  submit counter + root location per candidate
///     -> refresh decision, priority sort, cap
/// per chunk of `refresh_chunk` entities, while within `cycle_budget`:
///   R2  bone array, bone count, component-to-world
///   R3  configured joints
/// ```
pub struct PoseWorker<R> {
    reader: Arc<R>,
    layout: SourceLayout,
    config: SkeletonConfig,
    viewport: Viewport,
    period: Duration,
    roster: SnapshotCell<RosterSnapshot>,
    camera: SnapshotCell<CameraSnapshot>,
    bias: BiasHandle,
    cache: SkeletonCache,
    stats: Arc<PipelineStats>,
    ctx: Arc<dyn VantageContext>,
}

impl<R: ScatterReader> PoseWorker<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: Arc<R>,
        layout: SourceLayout,
        config: SkeletonConfig,
        viewport: Viewport,
        period: Duration,
        roster: SnapshotCell<RosterSnapshot>,
        camera: SnapshotCell<CameraSnapshot>,
        bias: BiasHandle,
        cache: SkeletonCache,
        stats: Arc<PipelineStats>,
        ctx: Arc<dyn VantageContext>,
    ) -> Self {
        Self {
            reader,
            layout,
            config,
            viewport,
            period,
            roster,
            camera,
            bias,
            cache,
            stats,
            ctx,
        }
    }

    /// R1: decide who needs a refresh, in priority order, capped.
    fn select(
        &self,
        candidates: &[&RosterEntry],
        camera: &CameraSnapshot,
        bias: &Bias,
        now: Duration,
        report: &mut CycleReport,
    ) -> Vec<Due> {
        let l = &self.layout;
        let mut round = self.reader.begin_round();
        let slots: Vec<(SlotId, Option<SlotId>)> = candidates
            .iter()
            .map(|e| {
                let counter = round.add(e.sub.mesh.offset(l.submit_counter), ReadKind::U32);
                let root = (!e.sub.root.is_null())
                    .then(|| round.add(e.sub.root.offset(l.root_location), ReadKind::Vec3));
                (counter, root)
            })
            .collect();
        let result = round.execute();
        report.absorb(&result);

        let mut due: Vec<Due> = candidates
            .iter()
            .zip(&slots)
            .filter_map(|(e, (counter_slot, root_slot))| {
                let counter = result.u32(*counter_slot);
                let reason = self.cache.refresh_reason(e.key, counter, now)?;
                let location = root_slot
                    .and_then(|s| result.vec3(s))
                    .map(|raw| bias.apply(&vec3(raw)));
                let (visible, distance) = match location {
                    Some(p) => (
                        camera
                            .pose
                            .project(&p, &self.viewport)
                            .is_some_and(|s| s.on_screen(&self.viewport)),
                        camera.pose.distance_to(&p),
                    ),
                    None => (false, f32::MAX),
                };
                Some(Due {
                    key: e.key,
                    mesh: e.sub.mesh,
                    counter,
                    reason,
                    background: e.class.is_background(),
                    visible,
                    distance,
                })
            })
            .collect();

        due.sort_by(Due::priority_cmp);
        if due.len() > self.config.refresh_cap {
            trace!(due = due.len(), cap = self.config.refresh_cap, "skeleton refreshes deferred");
            due.truncate(self.config.refresh_cap);
        }
        due
    }

    /// R2 + R3 for one chunk; returns how many skeletons were stored.
    fn refresh(&self, due: &[Due], bias: &Bias, now: Duration, report: &mut CycleReport) -> u64 {
        // --- R2: bone headers ---
        let l = &self.layout;
        let mut round = self.reader.begin_round();
        let header_slots: Vec<[SlotId; 3]> = due
            .iter()
            .map(|d| {
                [
                    round.add(d.mesh.offset(l.bone_array), ReadKind::Pointer),
                    round.add(d.mesh.offset(l.bone_count), ReadKind::I32),
                    round.add(d.mesh.offset(l.component_to_world), ReadKind::Transform),
                ]
            })
            .collect();
        let headers = round.execute();
        report.absorb(&headers);

        // --- R3: joints ---
        let mut round = self.reader.begin_round();
        let mut joint_slots: Vec<(usize, WorldTransform, Vec<SlotId>)> = Vec::new();
        for (i, [array, count, transform]) in header_slots.iter().enumerate() {
            let (Some(array), Some(count), Some(transform)) = (
                headers.pointer(*array).filter(|a| a.is_plausible()),
                headers.i32(*count),
                headers.transform(*transform).and_then(|t| WorldTransform::from_raw(&t)),
            ) else {
                continue;
            };
            let needed = self.config.joint_indices.iter().copied().max().unwrap_or(0);
            if count <= 0 || needed as i64 >= i64::from(count) {
                debug!(key = %due[i].key, count, "bone count too small, skipping");
                continue;
            }
            let slots = self
                .config
                .joint_indices
                .iter()
                .map(|&j| {
                    let at = array.offset(u64::from(j) * l.bone_stride + l.bone_translation);
                    round.add(at, ReadKind::Vec3)
                })
                .collect();
            joint_slots.push((i, transform, slots));
        }
        let joints = round.execute();
        report.absorb(&joints);

        // Raw joints read after a rebase belong to the new origin
        let current = self.bias.current();
        let shift = bias.delta_to(&current);

        let mut refreshed = 0u64;
        for (i, transform, slots) in joint_slots {
            let resolved: Option<Vec<Vec3>> = slots
                .iter()
                .map(|s| {
                    joints
                        .vec3(*s)
                        .map(|local| bias.apply(&transform.transform_point(&vec3(local))) + shift)
                })
                .collect();
            // A partial skeleton is worse than the cached one
            let Some(resolved) = resolved else {
                continue;
            };

            let d = &due[i];
            let submit_counter = match (d.counter, self.cache.get(d.key, now)) {
                (Some(c), _) => c,
                (None, Some(prev)) => prev.submit_counter,
                (None, None) => 0,
            };
            trace!(key = %d.key, reason = ?d.reason, "skeleton refreshed");
            self.cache.insert(SkeletonEntry {
                key: d.key,
                joints: resolved.into(),
                captured_at: now,
                submit_counter,
                bias: current,
            });
            refreshed += 1;
        }
        refreshed
    }
}

impl<R: ScatterReader> Worker for PoseWorker<R> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Pose
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run_cycle(&mut self, now: Duration) -> Result<CycleReport, CycleError> {
        let roster = self.roster.load();
        if roster.epoch == 0 {
            return Err(CycleError::NotReady("roster"));
        }

        let started = self.ctx.now();
        let budget = self.config.cycle_budget();
        // One bias for everything resolved this cycle
        let bias = self.bias.current();
        let camera = self.camera.load();
        let mut report = CycleReport::default();

        let candidates: Vec<&RosterEntry> = roster
            .unique_by_key()
            .filter(|e| !e.sub.mesh.is_null())
            .collect();
        let due = self.select(&candidates, &camera, &bias, now, &mut report);

        // The first chunk always runs so a tight budget still makes progress
        let mut refreshed = 0u64;
        let mut done = 0usize;
        for chunk in due.chunks(self.config.refresh_chunk.max(1)) {
            let elapsed = self.ctx.now().saturating_sub(started);
            if done > 0 && elapsed >= budget {
                debug!(
                    deferred = due.len() - done,
                    elapsed_us = elapsed.as_micros() as u64,
                    "pose cycle budget spent"
                );
                break;
            }
            refreshed += self.refresh(chunk, &bias, now, &mut report);
            done += chunk.len();
        }

        let evicted = self.cache.prune(now);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "skeletons evicted");
        }
        self.cache
            .forget_evicted(|key| roster.entries.iter().any(|e| e.key == key));
        self.stats.record_skeletons(refreshed, evicted.len() as u64);

        report.items = refreshed as usize;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bias::BiasCorrector;
    use crate::camera::CameraPose;
    use crate::config::RosterConfig;
    use crate::roster::RosterBuilder;
    use crate::skeleton::SkeletonState;
    use crate::test_support::{FakeClock, FakeEntity, FakeMemory, FakeWorld};
    use approx::assert_relative_eq;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn setup(world: &FakeWorld, config: SkeletonConfig) -> (PoseWorker<FakeMemory>, SkeletonCache) {
        let build = RosterBuilder::new(RosterConfig::default(), world.layout.clone())
            .build(world.memory())
            .unwrap();
        let roster = SnapshotCell::new(RosterSnapshot {
            epoch: 1,
            entries: build.entries,
            ..RosterSnapshot::default()
        });
        let camera = SnapshotCell::new(CameraSnapshot {
            pose: CameraPose::default(),
            sequence: 1,
            ..CameraSnapshot::empty()
        });
        let cache = SkeletonCache::new(config.force_refresh(), config.max_age());
        let worker = PoseWorker::new(
            world.shared(),
            world.layout.clone(),
            config,
            Viewport::default(),
            ms(4),
            roster,
            camera,
            BiasCorrector::new(5000.0).handle(),
            cache.clone(),
            Arc::new(PipelineStats::new()),
            Arc::new(FakeClock::default()),
        );
        (worker, cache)
    }

    #[test]
    fn test_first_cycle_resolves_world_joints() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        world.spawn_all(&[&a]);
        let (mut w, cache) = setup(&world, SkeletonConfig::default());

        let report = w.run_cycle(ms(0)).unwrap();
        assert_eq!(report.items, 1);
        assert_eq!(report.rounds, 3);

        let joints = cache.try_get_skeleton(a.key(), ms(1)).unwrap();
        assert_eq!(joints.len(), 14);
        // Head is bone 6, five units per bone above the component origin
        assert_relative_eq!(joints[0], a.position + Vec3::new(0.0, 0.0, 30.0));
    }

    #[test]
    fn test_unchanged_counter_skips_joint_reads() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        world.spawn_all(&[&a]);
        let (mut w, _cache) = setup(&world, SkeletonConfig::default());

        w.run_cycle(ms(0)).unwrap();
        let report = w.run_cycle(ms(100)).unwrap();

        // Only the counter round reaches the backend
        assert_eq!(report.rounds, 1);
        assert_eq!(report.items, 0);
    }

    #[test]
    fn test_counter_advance_refreshes() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        world.spawn_all(&[&a]);
        let (mut w, cache) = setup(&world, SkeletonConfig::default());

        w.run_cycle(ms(0)).unwrap();
        world.move_entity(&a, a.position + Vec3::new(0.0, 10.0, 0.0));
        world.set_submit_counter(&a, 2);
        let report = w.run_cycle(ms(100)).unwrap();

        assert_eq!(report.items, 1);
        let entry = cache.get(a.key(), ms(100)).unwrap();
        assert_eq!(entry.submit_counter, 2);
        assert_relative_eq!(entry.joints[0].y, 10.0);
    }

    #[test]
    fn test_force_refresh_without_counter_change() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        world.spawn_all(&[&a]);
        let (mut w, cache) = setup(&world, SkeletonConfig::default());

        w.run_cycle(ms(0)).unwrap();
        assert_eq!(w.run_cycle(ms(499)).unwrap().items, 0);
        assert_eq!(w.run_cycle(ms(500)).unwrap().items, 1);
        assert_eq!(cache.get(a.key(), ms(500)).unwrap().captured_at, ms(500));
    }

    #[test]
    fn test_failed_refreshes_lead_to_eviction() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        world.spawn_all(&[&a]);
        let (mut w, cache) = setup(&world, SkeletonConfig::default());
        w.run_cycle(ms(0)).unwrap();

        world.memory().fail(a.mesh.offset(world.layout.bone_array));
        w.run_cycle(ms(600)).unwrap();
        assert_eq!(cache.state_of(a.key(), ms(600)), SkeletonState::StaleServed);

        w.run_cycle(ms(900)).unwrap();
        assert_eq!(cache.state_of(a.key(), ms(900)), SkeletonState::Evicted);
        assert!(cache.try_get_skeleton(a.key(), ms(900)).is_none());
    }

    #[test]
    fn test_refresh_cap_prefers_nearest() {
        let world = FakeWorld::new();
        let entities: Vec<FakeEntity> = (1..=4).map(FakeEntity::npc).collect();
        world.spawn_all(&entities.iter().collect::<Vec<_>>());
        let config = SkeletonConfig {
            refresh_cap: 2,
            ..SkeletonConfig::default()
        };
        let (mut w, cache) = setup(&world, config);

        w.run_cycle(ms(0)).unwrap();
        assert!(cache.contains(entities[0].key(), ms(0)));
        assert!(cache.contains(entities[1].key(), ms(0)));
        assert!(!cache.contains(entities[3].key(), ms(0)));

        w.run_cycle(ms(4)).unwrap();
        assert!(cache.contains(entities[3].key(), ms(4)));
    }

    #[test]
    fn test_new_entities_outrank_counter_refreshes() {
        let world = FakeWorld::new();
        let entities: Vec<FakeEntity> = (1..=4).map(FakeEntity::npc).collect();
        world.spawn_all(&entities.iter().collect::<Vec<_>>());
        let config = SkeletonConfig {
            refresh_cap: 2,
            ..SkeletonConfig::default()
        };
        let (mut w, cache) = setup(&world, config);

        w.run_cycle(ms(0)).unwrap();
        world.set_submit_counter(&entities[0], 2);
        world.set_submit_counter(&entities[1], 2);

        w.run_cycle(ms(4)).unwrap();
        assert!(cache.contains(entities[2].key(), ms(4)));
        assert!(cache.contains(entities[3].key(), ms(4)));
        assert_eq!(cache.get(entities[0].key(), ms(4)).unwrap().captured_at, ms(0));

        w.run_cycle(ms(8)).unwrap();
        assert_eq!(cache.get(entities[0].key(), ms(8)).unwrap().captured_at, ms(8));
    }

    #[test]
    fn test_background_entity_gets_first_skeleton_under_load() {
        let world = FakeWorld::new();
        let npcs: Vec<FakeEntity> = (1..=3).map(FakeEntity::npc).collect();
        let ambient = FakeEntity::with_type(9, 20, "AmbientBird_C");
        world.spawn_all(&[&npcs[0], &npcs[1], &npcs[2], &ambient]);
        let config = SkeletonConfig {
            refresh_cap: 2,
            ..SkeletonConfig::default()
        };
        let (mut w, cache) = setup(&world, config);

        w.run_cycle(ms(0)).unwrap();
        assert!(!cache.contains(ambient.key(), ms(0)));

        // Animating entities keep asking for refreshes every cycle
        for (i, now) in [4u64, 8, 12].into_iter().enumerate() {
            for npc in &npcs {
                world.set_submit_counter(npc, 2 + i as u32);
            }
            w.run_cycle(ms(now)).unwrap();
        }
        assert!(cache.contains(ambient.key(), ms(12)));
        assert!(npcs.iter().all(|n| cache.contains(n.key(), ms(12))));
    }

    #[test]
    fn test_spent_budget_defers_remaining_chunks() {
        let world = FakeWorld::new();
        let entities: Vec<FakeEntity> = (1..=10).map(FakeEntity::npc).collect();
        world.spawn_all(&entities.iter().collect::<Vec<_>>());
        let config = SkeletonConfig {
            refresh_chunk: 4,
            cycle_budget_ms: 0.0,
            ..SkeletonConfig::default()
        };
        let (mut w, cache) = setup(&world, config);

        // Only the first chunk runs, nearest first
        let report = w.run_cycle(ms(0)).unwrap();
        assert_eq!(report.items, 4);
        assert_eq!(report.rounds, 3);
        assert!(cache.contains(entities[3].key(), ms(0)));
        assert!(!cache.contains(entities[4].key(), ms(0)));

        assert_eq!(w.run_cycle(ms(4)).unwrap().items, 4);
        assert_eq!(w.run_cycle(ms(8)).unwrap().items, 2);
        assert!(entities.iter().all(|e| cache.contains(e.key(), ms(8))));
    }

    #[test]
    fn test_budget_left_runs_every_chunk() {
        let world = FakeWorld::new();
        let entities: Vec<FakeEntity> = (1..=10).map(FakeEntity::npc).collect();
        world.spawn_all(&entities.iter().collect::<Vec<_>>());
        let (mut w, _cache) = setup(&world, SkeletonConfig::default());

        // Cap 8 in chunks of 4: counter round plus two header/joint pairs
        let report = w.run_cycle(ms(0)).unwrap();
        assert_eq!(report.items, 8);
        assert_eq!(report.rounds, 5);
    }
}
