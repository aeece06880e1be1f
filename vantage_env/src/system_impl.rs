//! Production implementation of VantageContext using the OS clock.

use crate::VantageContext;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Production context backed by `Instant` and `thread::sleep`.
///
/// `thread::sleep` overshoots by up to a scheduler quantum, which is far
/// too coarse for a 1 ms camera loop. Sleeps therefore stop `spin_tail`
/// early and finish with a short busy-wait.
pub struct SystemContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    /// Portion of every sleep spent spinning instead of sleeping
    spin_tail: Duration,
}

impl SystemContext {
    /// Default spin tail (200 µs).
    pub const DEFAULT_SPIN_TAIL: Duration = Duration::from_micros(200);

    /// Creates a new SystemContext.
    pub fn new() -> Self {
        Self::with_spin_tail(Self::DEFAULT_SPIN_TAIL)
    }

    /// Creates a context with a custom spin tail.
    pub fn with_spin_tail(spin_tail: Duration) -> Self {
        Self {
            start: Instant::now(),
            spin_tail,
        }
    }

    /// Creates an Arc-wrapped context for sharing across workers.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for SystemContext {
    fn default() -> Self {
        Self::new()
    }
}

impl VantageContext for SystemContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        if duration > self.spin_tail {
            std::thread::sleep(duration - self.spin_tail);
        }
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_context_time() {
        let ctx = SystemContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10));
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[test]
    fn test_short_sleep_spins_to_deadline() {
        let ctx = SystemContext::with_spin_tail(Duration::from_millis(1));
        let t1 = ctx.now();
        ctx.sleep(Duration::from_micros(300));
        assert!(ctx.now() - t1 >= Duration::from_micros(300));
    }

    #[test]
    fn test_system_context_seed() {
        let ctx = SystemContext::new();
        assert_eq!(ctx.seed(), 0);
    }
}
