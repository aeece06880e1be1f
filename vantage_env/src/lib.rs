//! Vantage Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary that lets the Vantage snapshot
//! engine run against a real memory-reading backend in production and
//! against a simulated address space in tests.
//!
//! # Core Concept: Everything External Is Injected
//!
//! The engine never touches a clock or a remote address directly:
//! - Time (`now()`, `sleep()`) goes through [`VantageContext`]
//! - Remote reads go through [`ScatterReader`] as batched rounds
//!
//! A round is the unit of cost. Callers add as many independent slots as
//! they need and pay one round trip for all of them; each slot may fail on
//! its own without affecting its siblings.
//!
//! # Example
//!
//! ```ignore
//! use vantage_env::{Address, ReadKind, ScatterReader};
//!
//! fn read_header<R: ScatterReader>(reader: &R, base: Address) -> Option<(u32, Address)> {
//!     let mut round = reader.begin_round();
//!     let count = round.add(base.offset(0x8), ReadKind::U32);
//!     let data = round.add(base, ReadKind::Pointer);
//!     let result = round.execute();
//!     Some((result.u32(count)?, result.pointer(data)?))
//! }
//! ```

mod context;
mod error;
mod reader;
mod system_impl;
mod types;

pub use context::VantageContext;
pub use error::ReadError;
pub use reader::{ReadRound, RoundResult, ScatterReader, SlotResult};
pub use system_impl::SystemContext;
pub use types::{Address, RawTransform, ReadKind, ReadRequest, ReadValue, SlotId};
