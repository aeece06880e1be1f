use crate::config::{RosterConfig, SourceLayout};
use crate::roster::{RosterBuilder, RosterSnapshot};
use crate::snapshot::SnapshotCell;
use crate::worker::{CycleError, CycleReport, Worker, WorkerKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vantage_env::ScatterReader;

/// Low-rate roster enumeration.
///
/// A structural failure leaves the previous roster published; after
/// `clear_after_failures` consecutive ones the roster is cleared so stale
/// entities stop being tracked.
pub struct RosterWorker<R> {
    reader: Arc<R>,
    builder: RosterBuilder,
    period: Duration,
    out: SnapshotCell<RosterSnapshot>,
    epoch: u64,
    structural_failures: u32,
    clear_after: u32,
}

impl<R: ScatterReader> RosterWorker<R> {
    pub fn new(
        reader: Arc<R>,
        config: RosterConfig,
        layout: SourceLayout,
        period: Duration,
        out: SnapshotCell<RosterSnapshot>,
    ) -> Self {
        let clear_after = config.clear_after_failures;
        Self {
            reader,
            builder: RosterBuilder::new(config, layout),
            period,
            out,
            epoch: 0,
            structural_failures: 0,
            clear_after,
        }
    }

    fn publish(&mut self, snapshot: RosterSnapshot) {
        self.epoch += 1;
        self.out.store(RosterSnapshot {
            epoch: self.epoch,
            ..snapshot
        });
    }
}

impl<R: ScatterReader> Worker for RosterWorker<R> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Roster
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn run_cycle(&mut self, now: Duration) -> Result<CycleReport, CycleError> {
        match self.builder.build(self.reader.as_ref()) {
            Ok(build) => {
                self.structural_failures = 0;
                debug!(
                    entities = build.entries.len(),
                    truncated = build.truncated,
                    "roster built"
                );
                self.publish(RosterSnapshot {
                    epoch: 0,
                    captured_at: now,
                    entries: build.entries,
                    local_entity: build.local_entity,
                    truncated: build.truncated,
                });
                Ok(build.report)
            }
            Err(err @ CycleError::Structural(_)) => {
                self.structural_failures += 1;
                if self.structural_failures >= self.clear_after && !self.out.load().is_empty() {
                    warn!(
                        failures = self.structural_failures,
                        "roster invalid for too long, clearing"
                    );
                    self.publish(RosterSnapshot {
                        captured_at: now,
                        ..RosterSnapshot::default()
                    });
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
