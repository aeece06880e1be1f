//! Core environment context trait for Vantage workers.

use std::time::Duration;

/// The central interface for clock interaction.
///
/// This trait abstracts the "real world" so that the polling workers can
/// run against the OS clock in production and against a virtual clock in
/// deterministic simulation.
///
/// # Implementations
///
/// - **Production**: `SystemContext` - wraps `Instant` and `thread::sleep`
/// - **Simulation**: `SimContext` (in `vantage_sim`) - manual virtual clock
pub trait VantageContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Every timestamp in the engine (snapshot capture times, skeleton
    /// ages, frame stamps) is measured on this clock.
    fn now(&self) -> Duration;

    /// Suspends the calling worker for the given duration.
    ///
    /// Production implementations are expected to be precise to well
    /// under a millisecond. In simulation, this advances virtual time.
    fn sleep(&self, duration: Duration);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
