//! Vantage Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a simulated remote address space and a ground-truth
//! world that writes into it, so the whole Vantage pipeline can be run and
//! checked deterministically.
//!
//! # Core Principle: Injected Everything
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock that only moves when the harness ticks it
//! - **Memory**: a scatter-read backend with seeded slot and round faults
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SimHarness                           │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock)                           │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                                                     │
//! │  ┌────▼──────────────┐   scatter    ┌───────────────────┐   │
//! │  │ Pipeline workers  │◄────────────►│    SimMemory      │   │
//! │  │ (stepped)         │    rounds    │ (faults, stale)   │   │
//! │  └────────┬──────────┘              └─────────▲─────────┘   │
//! │           │ frames                            │ writes      │
//! │  ┌────────▼──────────┐              ┌─────────┴─────────┐   │
//! │  │    FrameCheck     │◄─────────────│      Oracle       │   │
//! │  │                   │ ground truth │ (moving entities) │   │
//! │  └───────────────────┘              └───────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vantage_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42)
//!     .with_duration(5.0)
//!     .run(ScenarioId::OriginRebase);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod harness;
mod memory;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{EntityPosition, ExportError, SamplePosition, SimEvent, SimExport, SimFrame};
pub use harness::{FrameCheck, SimHarness};
pub use memory::{FaultConfig, MemoryCounters, SimMemory};
pub use oracle::{Archetype, Oracle, SimEntity, BONE_COUNT, BONE_SPACING};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};
