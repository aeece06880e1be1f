use crate::bias::BiasHandle;
use crate::camera::CameraSnapshot;
use crate::coalesce::{coalesce, Candidate, Quality};
use crate::config::{CoalesceConfig, SourceLayout, Viewport};
use crate::frame::{Frame, FramePublisher, PositionSample};
use crate::identity::IdentityKey;
use crate::math::{vec3, WorldTransform};
use crate::roster::RosterSnapshot;
use crate::skeleton::SkeletonCache;
use crate::snapshot::SnapshotCell;
use crate::stats::PipelineStats;
use crate::vitals::VitalsSnapshot;
use crate::worker::{CycleError, CycleReport, Worker, WorkerKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use vantage_env::{ReadKind, ScatterReader, SlotId};

/// Slots read per entity.
struct EntitySlots {
    location: SlotId,
    transform: Option<SlotId>,
    submit_time: Option<SlotId>,
    on_screen_time: Option<SlotId>,
}

/// High-rate frame assembler and the only frame publisher.
///
/// Every frame is built completely in a private buffer, coalesced, then
/// published. Positions read this cycle are moved to the bias that is
/// current at publish time; last-good fallbacks are already
/// world-continuous and are republished as they were. One read round per
/// cycle.
pub struct PositionWorker<R> {
    reader: Arc<R>,
    layout: SourceLayout,
    coalesce: CoalesceConfig,
    viewport: Viewport,
    period: Duration,
    roster: SnapshotCell<RosterSnapshot>,
    camera: SnapshotCell<CameraSnapshot>,
    vitals: SnapshotCell<VitalsSnapshot>,
    skeletons: SkeletonCache,
    bias: BiasHandle,
    publisher: FramePublisher,
    stats: Arc<PipelineStats>,

    /// Last published sample per key, for slots that fail
    last: HashMap<IdentityKey, PositionSample>,
}

impl<R: ScatterReader> PositionWorker<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: Arc<R>,
        layout: SourceLayout,
        coalesce: CoalesceConfig,
        viewport: Viewport,
        period: Duration,
        roster: SnapshotCell<RosterSnapshot>,
        camera: SnapshotCell<CameraSnapshot>,
        vitals: SnapshotCell<VitalsSnapshot>,
        skeletons: SkeletonCache,
        bias: BiasHandle,
        publisher: FramePublisher,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            reader,
            layout,
            coalesce,
            viewport,
            period,
            roster,
            camera,
            vitals,
            skeletons,
            bias,
            publisher,
            stats,
            last: HashMap::new(),
        }
    }
}

impl<R: ScatterReader> Worker for PositionWorker<R> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Position
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run_cycle(&mut self, now: Duration) -> Result<CycleReport, CycleError> {
        let camera = self.camera.load();
        if !camera.is_ready() {
            return Err(CycleError::NotReady("camera"));
        }
        let roster = self.roster.load();
        if roster.epoch == 0 {
            return Err(CycleError::NotReady("roster"));
        }
        let vitals = self.vitals.load();

        let bias = self.bias.current();
        let l = &self.layout;
        let mut report = CycleReport::default();

        let mut round = self.reader.begin_round();
        let slots: Vec<Option<EntitySlots>> = roster
            .entries
            .iter()
            .map(|e| {
                if e.sub.root.is_null() {
                    return None;
                }
                let location = round.add(e.sub.root.offset(l.root_location), ReadKind::Vec3);
                let mesh = (!e.sub.mesh.is_null()).then_some(e.sub.mesh);
                let mut on_mesh = |offset: u64, kind: ReadKind| {
                    mesh.map(|m| round.add(m.offset(offset), kind))
                };
                Some(EntitySlots {
                    location,
                    transform: on_mesh(l.component_to_world, ReadKind::Transform),
                    submit_time: on_mesh(l.last_submit_time, ReadKind::F32),
                    on_screen_time: on_mesh(l.last_on_screen_time, ReadKind::F32),
                })
            })
            .collect();
        let result = round.execute();
        report.absorb(&result);

        let mut candidates = Vec::with_capacity(roster.entries.len());
        let mut fresh = HashSet::new();
        for (entry, slots) in roster.entries.iter().zip(&slots) {
            let Some(slots) = slots else {
                continue;
            };
            let fallback = self.last.get(&entry.key);

            let (position, pose) = match (result.vec3(slots.location), fallback) {
                (Some(raw), _) => {
                    let position = bias.apply(&vec3(raw));
                    let pose = slots
                        .transform
                        .and_then(|s| result.transform(s))
                        .and_then(|raw| WorldTransform::from_raw(&raw))
                        .map(|t| t.translated(&bias.offset))
                        .unwrap_or_else(|| WorldTransform::from_translation(position));
                    fresh.insert(entry.key);
                    (position, pose)
                }
                // Last good sample, published as it was
                (None, Some(prev)) => (prev.position, prev.pose),
                (None, None) => continue,
            };
            let read_f32 = |slot: Option<SlotId>| slot.and_then(|s| result.f32(s));

            let v = vitals.get(entry.key);
            let (health, health_max, dead, downed) = v
                .map(|v| (v.health, v.health_max, v.dead, v.downed))
                .unwrap_or((0.0, 0.0, false, false));

            let sample = PositionSample {
                key: entry.key,
                class: entry.class,
                faction: entry.faction,
                name: entry.name.clone(),
                position,
                pose,
                submit_time: read_f32(slots.submit_time)
                    .or(fallback.map(|p| p.submit_time))
                    .unwrap_or(0.0),
                on_screen_time: read_f32(slots.on_screen_time)
                    .or(fallback.map(|p| p.on_screen_time))
                    .unwrap_or(0.0),
                health,
                health_max,
                dead,
                downed,
                screen: camera.pose.project(&position, &self.viewport),
                distance: camera.pose.distance_to(&position),
            };
            let quality = Quality::new(
                !entry.sub.animation.is_null(),
                self.skeletons.contains(entry.key, now),
                v.map_or(true, |v| v.alive()),
                health,
                !entry.name.is_empty(),
            );
            candidates.push(Candidate { sample, quality });
        }

        let outcome = coalesce(candidates, &self.coalesce);
        if !outcome.merges.is_empty() {
            for merge in &outcome.merges {
                trace!(
                    winner = %merge.winner,
                    loser = %merge.loser,
                    winner_index = merge.winner_index,
                    loser_index = merge.loser_index,
                    reason = ?merge.reason,
                    "merged"
                );
            }
            debug!(merges = outcome.merges.len(), "coalesced duplicate entities");
            self.stats.record_merges(outcome.merges.len() as u64);
        }

        let mut frame = Frame {
            stamp: self.publisher.published() + 1,
            captured_at: now,
            camera: camera.pose,
            local_view: camera.local_view,
            bias,
            samples: outcome.samples,
        };

        // The camera worker may have rebased while we were reading: this
        // cycle's raw reads belong to the new origin
        let current = self.bias.current();
        if current != bias {
            debug!(
                from = bias.generation,
                to = current.generation,
                "bias moved during assembly, rebasing fresh samples"
            );
            for sample in frame.samples.iter_mut().filter(|s| fresh.contains(&s.key)) {
                sample.rebase(&bias, &current);
                sample.screen = camera.pose.project(&sample.position, &self.viewport);
                sample.distance = camera.pose.distance_to(&sample.position);
            }
            frame.bias = current;
        }

        self.last = frame
            .samples
            .iter()
            .map(|s| (s.key, s.clone()))
            .collect();

        report.items = frame.samples.len();
        self.publisher.publish(frame);
        self.stats.record_frame();
        Ok(report)
    }
}
