//! The "BIAS" Corrector - Floating-Origin Compensation
//!
//! The source simulation periodically rebases its world origin, which makes
//! every raw coordinate jump by the same vector in one tick. The corrector
//! detects that jump on the local viewpoint and folds it into one additive
//! bias so published positions stay continuous:
//!
//! ```text
//! published = raw + bias
//! ```
//!
//! Exactly one [`BiasCorrector`] exists per pipeline (owned by the camera
//! worker). Everyone else holds a read-only [`BiasHandle`].

use crate::math::Vec3;
use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The bias active when a value was captured.
///
/// Sign convention: `published = raw + offset`. When the raw viewpoint
/// jumps by `j` in one cycle, `offset` becomes `offset - j`, so the jump
/// cancels out of every published position. The accumulated `offset` is
/// therefore the negated sum of all detected jumps.
///
/// `generation` increments on every rebase so consumers can detect a change
/// without comparing floats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bias {
    pub offset: Vec3,
    pub generation: u64,
}

impl Bias {
    /// No correction.
    pub fn zero() -> Self {
        Self {
            offset: Vec3::zeros(),
            generation: 0,
        }
    }

    /// Applies this bias to a raw source position.
    #[inline]
    pub fn apply(&self, raw: &Vec3) -> Vec3 {
        raw + self.offset
    }

    /// Moves a position whose raw read was corrected with `self` over to
    /// `to`.
    ///
    /// Only meaningful for raw data read in `to`'s source origin. Values
    /// published earlier are already continuous and must not be rebased.
    #[inline]
    pub fn rebase(&self, position: &Vec3, to: &Bias) -> Vec3 {
        position - self.offset + to.offset
    }

    /// Shift that [`Bias::rebase`] adds when going from `self` to `to`.
    #[inline]
    pub fn delta_to(&self, to: &Bias) -> Vec3 {
        to.offset - self.offset
    }
}

impl Default for Bias {
    fn default() -> Self {
        Self::zero()
    }
}

/// A detected origin rebase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebaseEvent {
    /// Raw viewpoint displacement that triggered the rebase
    pub jump: Vec3,

    /// Bias after the rebase
    pub bias: Bias,
}

/// Read-only view of the shared bias.
#[derive(Debug, Clone)]
pub struct BiasHandle {
    cell: Arc<AtomicCell<Bias>>,
}

impl BiasHandle {
    /// Returns the bias in effect right now.
    pub fn current(&self) -> Bias {
        self.cell.load()
    }
}

/// The single writer of the shared bias.
///
/// Deliberately not `Clone`: owning a `BiasCorrector` is the authority to
/// move the origin.
#[derive(Debug)]
pub struct BiasCorrector {
    cell: Arc<AtomicCell<Bias>>,

    /// Displacement magnitude treated as a rebase
    threshold: f32,

    /// Previous raw viewpoint sample
    last_raw: Option<Vec3>,

    /// Rebases applied so far
    rebases: u64,
}

impl BiasCorrector {
    /// Creates a corrector with zero bias.
    pub fn new(threshold: f32) -> Self {
        Self {
            cell: Arc::new(AtomicCell::new(Bias::zero())),
            threshold,
            last_raw: None,
            rebases: 0,
        }
    }

    /// Returns a read-only handle to the shared bias.
    pub fn handle(&self) -> BiasHandle {
        BiasHandle {
            cell: Arc::clone(&self.cell),
        }
    }

    /// Returns the current bias.
    pub fn current(&self) -> Bias {
        self.cell.load()
    }

    /// Number of rebases applied.
    pub fn rebase_count(&self) -> u64 {
        self.rebases
    }

    /// Feeds the latest raw local-viewpoint position.
    ///
    /// A single-cycle jump larger than the threshold is an origin rebase,
    /// not motion: the jump is subtracted from the bias so `raw + bias`
    /// stays continuous across it. Smaller displacements are ordinary
    /// movement.
    pub fn observe(&mut self, raw: Vec3) -> Option<RebaseEvent> {
        if !raw.iter().all(|c| c.is_finite()) {
            return None;
        }

        let previous = self.last_raw.replace(raw)?;
        let jump = raw - previous;
        if jump.norm() <= self.threshold {
            return None;
        }

        let mut bias = self.cell.load();
        bias.offset -= jump;
        bias.generation += 1;
        self.cell.store(bias);
        self.rebases += 1;

        Some(RebaseEvent { jump, bias })
    }

    /// Forgets the previous sample.
    ///
    /// Called when the viewpoint itself changes identity (respawn,
    /// possession change) so the switch is not mistaken for a rebase.
    pub fn reset_reference(&mut self) {
        self.last_raw = None;
    }
}
