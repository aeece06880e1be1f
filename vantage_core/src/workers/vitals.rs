use crate::config::SourceLayout;
use crate::roster::RosterSnapshot;
use crate::snapshot::SnapshotCell;
use crate::vitals::{Vitals, VitalsSnapshot};
use crate::worker::{CycleError, CycleReport, Worker, WorkerKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use vantage_env::{ReadKind, ScatterReader, SlotId};

/// Medium-rate health and life-state reads.
pub struct VitalsWorker<R> {
    reader: Arc<R>,
    layout: SourceLayout,
    period: Duration,
    roster: SnapshotCell<RosterSnapshot>,
    out: SnapshotCell<VitalsSnapshot>,
}

impl<R: ScatterReader> VitalsWorker<R> {
    pub fn new(
        reader: Arc<R>,
        layout: SourceLayout,
        period: Duration,
        roster: SnapshotCell<RosterSnapshot>,
        out: SnapshotCell<VitalsSnapshot>,
    ) -> Self {
        Self {
            reader,
            layout,
            period,
            roster,
            out,
        }
    }
}

impl<R: ScatterReader> Worker for VitalsWorker<R> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Vitals
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run_cycle(&mut self, now: Duration) -> Result<CycleReport, CycleError> {
        let roster = self.roster.load();
        if roster.epoch == 0 {
            return Err(CycleError::NotReady("roster"));
        }
        let previous = self.out.load();
        let l = &self.layout;
        let mut report = CycleReport::default();

        let mut round = self.reader.begin_round();
        let slots: Vec<_> = roster
            .unique_by_key()
            .map(|e| {
                let slots: [SlotId; 4] = [
                    round.add(e.entity.offset(l.health), ReadKind::F32),
                    round.add(e.entity.offset(l.health_max), ReadKind::F32),
                    round.add(e.entity.offset(l.dead_flag), ReadKind::U8),
                    round.add(e.entity.offset(l.downed_flag), ReadKind::U8),
                ];
                (e.key, slots)
            })
            .collect();
        let result = round.execute();
        report.absorb(&result);

        let mut by_key = HashMap::with_capacity(slots.len());
        for (key, [health, health_max, dead, downed]) in slots {
            let merged = Vitals::merge(
                previous.get(key),
                result.f32(health),
                result.f32(health_max),
                result.u8(dead).map(|v| v != 0),
                result.u8(downed).map(|v| v != 0),
                now,
            );
            if let Some(v) = merged {
                by_key.insert(key, v);
            }
        }

        report.items = by_key.len();
        self.out.store(VitalsSnapshot {
            captured_at: now,
            by_key,
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RosterConfig;
    use crate::roster::RosterBuilder;
    use crate::test_support::{FakeEntity, FakeWorld};

    fn roster_of(world: &FakeWorld) -> SnapshotCell<RosterSnapshot> {
        let build = RosterBuilder::new(RosterConfig::default(), world.layout.clone())
            .build(world.memory())
            .unwrap();
        SnapshotCell::new(RosterSnapshot {
            epoch: 1,
            entries: build.entries,
            ..RosterSnapshot::default()
        })
    }

    #[test]
    fn test_waits_for_roster() {
        let world = FakeWorld::new();
        let mut w = VitalsWorker::new(
            world.shared(),
            world.layout.clone(),
            Duration::from_millis(16),
            SnapshotCell::default(),
            SnapshotCell::default(),
        );
        assert_eq!(w.run_cycle(Duration::ZERO), Err(CycleError::NotReady("roster")));
    }

    #[test]
    fn test_reads_and_retains_on_failure() {
        let world = FakeWorld::new();
        let a = FakeEntity::npc(1);
        world.spawn_all(&[&a]);
        world.set_health(&a, 42.0, false);

        let out = SnapshotCell::default();
        let mut w = VitalsWorker::new(
            world.shared(),
            world.layout.clone(),
            Duration::from_millis(16),
            roster_of(&world),
            out.clone(),
        );
        w.run_cycle(Duration::from_millis(16)).unwrap();
        assert_eq!(out.load().get(a.key()).unwrap().health, 42.0);

        world.memory().fail(a.entity.offset(world.layout.health));
        world.set_health(&a, 10.0, true);
        w.run_cycle(Duration::from_millis(32)).unwrap();

        let v = *out.load().get(a.key()).unwrap();
        assert_eq!(v.health, 42.0);
        assert!(v.dead);
    }
}
