//! Vantage Core - Consistent Snapshots from Unreliable Remote Memory
//!
//! This library turns scattered, high-latency, partially-stale reads of a
//! remote address space into one internally-consistent [`Frame`] per tick:
//! 1. **Torn Frame Problem**: seqlock publication, readers never block the writer
//! 2. **Moving Origin Problem**: a single bias vector absorbs floating-origin rebases
//! 3. **Duplicate Body Problem**: identity keys plus a spatial coalesce pass
//! 4. **Wasted Round Problem**: sticky sub-object caches and a staleness-budgeted skeleton cache
//!
//! Data flows from the roster worker through the vitals, pose and position
//! workers into the frame publisher; see [`pipeline`] for the wiring.

pub mod bias;
pub mod camera;
pub mod coalesce;
pub mod config;
pub mod frame;
pub mod identity;
pub mod math;
pub mod ownership;
pub mod pipeline;
pub mod roster;
pub mod seqlock;
pub mod skeleton;
pub mod snapshot;
pub mod stats;
pub mod vitals;
pub mod worker;
pub mod workers;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export key types for convenience
pub use bias::{Bias, BiasCorrector, BiasHandle};
pub use camera::{CameraPose, CameraSnapshot, ScreenPoint};
pub use config::{ConfigError, PipelineConfig, SourceLayout};
pub use frame::{Frame, PositionSample};
pub use identity::{EntityClass, IdentityKey};
pub use math::{Vec3, WorldTransform};
pub use pipeline::{Pipeline, PipelineError, PipelineHandle, StepOutcome};
pub use skeleton::SkeletonCache;
pub use stats::{PipelineStats, StatsSnapshot};
pub use worker::{CycleError, CycleReport, Worker, WorkerKind};
