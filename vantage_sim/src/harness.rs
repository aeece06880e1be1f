//! A pipeline wired to a simulated source on the virtual clock.

use crate::context::SimContext;
use crate::memory::SimMemory;
use crate::oracle::{Oracle, BONE_SPACING};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use vantage_core::config::ConfigError;
use vantage_core::pipeline::StepOutcome;
use vantage_core::{Frame, IdentityKey, Pipeline, PipelineConfig, PipelineError, PipelineHandle, Vec3};
use vantage_env::VantageContext;

/// Seed mixers so the fault stream and the spawn stream are independent.
pub(crate) const FAULT_STREAM: u64 = 0x5bd1_e995_7f4a_7c15;
pub(crate) const PHYSICS_STREAM: u64 = 0x9e37_79b9_7f4a_7c15;

/// Comparison of the latest published frame against ground truth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameCheck {
    pub stamp: u64,
    pub samples: usize,

    /// Tracked bodies with no sample
    pub missing: Vec<IdentityKey>,

    /// Samples that map to no live entity
    pub unknown: Vec<IdentityKey>,

    /// Samples published under a fallback key (animation or entity pointer)
    pub aliased: usize,

    /// Samples for ghost copies, or a second sample for one body
    pub ghosts: usize,

    /// Largest distance between a published position and the truth
    pub max_error: f32,

    /// Samples with a cached skeleton
    pub skeletons: usize,

    /// Largest distance between a cached head joint and the true head
    pub max_skeleton_error: f32,
}

impl FrameCheck {
    /// True if every tracked body is published exactly once under its
    /// canonical key.
    pub fn keys_exact(&self) -> bool {
        self.missing.is_empty() && self.unknown.is_empty() && self.aliased == 0 && self.ghosts == 0
    }

    /// Compares `frame` with the oracle's current ground truth.
    ///
    /// Skeletons are looked up through `handle` in the frame's bias.
    pub fn compare(frame: &Frame, oracle: &Oracle, handle: &PipelineHandle) -> Self {
        let expected = oracle.expected_keys();
        let mut seen = BTreeSet::new();
        let mut check = FrameCheck {
            stamp: frame.stamp,
            samples: frame.len(),
            ..FrameCheck::default()
        };

        for sample in &frame.samples {
            let Some(body) = oracle.canonical(sample.key) else {
                check.unknown.push(sample.key);
                continue;
            };
            if body != sample.key {
                check.aliased += 1;
            }
            if !expected.contains(&body) || !seen.insert(body) {
                check.ghosts += 1;
                continue;
            }

            let Some(truth) = oracle.truth_of(body) else {
                continue;
            };
            check.max_error = check.max_error.max((sample.position - truth).norm());

            if let Some(head) = handle
                .try_get_skeleton(sample.key)
                .and_then(|joints| joints.first().copied())
            {
                let true_head = truth + Vec3::new(0.0, 0.0, 6.0 * BONE_SPACING);
                check.skeletons += 1;
                check.max_skeleton_error = check.max_skeleton_error.max((head - true_head).norm());
            }
        }

        check.missing = expected.difference(&seen).copied().collect();
        check
    }
}

/// Pipeline + oracle + virtual clock.
pub struct SimHarness {
    ctx: Arc<SimContext>,
    memory: Arc<SimMemory>,
    oracle: Oracle,
    pipeline: Pipeline,
    handle: PipelineHandle,
}

impl SimHarness {
    /// Builds a harness. The source starts with only the local viewer.
    pub fn new(seed: u64, config: PipelineConfig) -> Result<Self, ConfigError> {
        let ctx = SimContext::shared(seed);
        let memory = Arc::new(SimMemory::new(seed ^ FAULT_STREAM));
        let oracle = Oracle::new(
            seed.wrapping_mul(PHYSICS_STREAM),
            config.layout.clone(),
            Arc::clone(&memory),
        );
        let pipeline = Pipeline::new(Arc::clone(&memory), Arc::clone(&ctx), config)?;
        let handle = pipeline.handle();

        Ok(Self {
            ctx,
            memory,
            oracle,
            pipeline,
            handle,
        })
    }

    pub fn now(&self) -> Duration {
        self.ctx.now()
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.memory
    }

    pub fn oracle(&self) -> &Oracle {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut Oracle {
        &mut self.oracle
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn handle(&self) -> &PipelineHandle {
        &self.handle
    }

    /// Runs every worker once at the current time.
    pub fn step_all(&mut self) -> Result<Vec<StepOutcome>, PipelineError> {
        self.pipeline.step_all(self.now())
    }

    /// Advances the clock and the source by `dt`, then runs due workers.
    pub fn tick(&mut self, dt: Duration) -> Result<Vec<StepOutcome>, PipelineError> {
        self.ctx.advance_time(dt);
        self.oracle.step(dt.as_secs_f64());
        self.pipeline.step_due(self.now())
    }

    /// Ticks until `duration` of virtual time has passed.
    pub fn run_for(&mut self, duration: Duration, dt: Duration) -> Result<(), PipelineError> {
        let end = self.now() + duration;
        while self.now() < end {
            self.tick(dt)?;
        }
        Ok(())
    }

    /// Compares the latest published frame with ground truth.
    pub fn check_frame(&self) -> Option<FrameCheck> {
        let frame = self.handle.try_get_frame()?;
        Some(FrameCheck::compare(&frame, &self.oracle, &self.handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Archetype;
    use vantage_core::WorkerKind;

    #[test]
    fn test_first_step_publishes_ground_truth() {
        let mut h = SimHarness::new(3, PipelineConfig::default()).unwrap();
        h.oracle_mut().spawn_random(Archetype::Npc, 5);
        h.oracle_mut().spawn(Archetype::Prop, Vec3::new(900.0, 0.0, 0.0), Vec3::zeros());

        assert!(h.check_frame().is_none());
        let outcomes = h.step_all().unwrap();
        assert!(outcomes
            .iter()
            .any(|(k, r)| *k == WorkerKind::Position && r.is_ok()));

        let check = h.check_frame().unwrap();
        assert!(check.keys_exact(), "{:?}", check);
        assert_eq!(check.samples, 5);
        assert!(check.max_error < 1e-3);
        assert_eq!(check.skeletons, 5);
        assert!(check.max_skeleton_error < 1e-3);
    }

    #[test]
    fn test_tick_advances_clock_and_source() {
        let mut h = SimHarness::new(3, PipelineConfig::default()).unwrap();
        h.oracle_mut().spawn_random(Archetype::Npc, 2);
        h.run_for(Duration::from_millis(30), Duration::from_millis(1))
            .unwrap();

        assert_eq!(h.now(), Duration::from_millis(30));
        assert!((h.oracle().time() - 0.030).abs() < 1e-9);
        // Last position cycle ran at 28 ms; the source kept moving
        let check = h.check_frame().unwrap();
        assert!(check.keys_exact());
        assert!(check.max_error < 2.0);
    }
}
