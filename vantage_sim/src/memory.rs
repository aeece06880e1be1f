//! Simulated remote address space.
//!
//! [`SimMemory`] is a flat map from address to typed value that implements
//! [`ScatterReader`]. It can be told to misbehave the way a real backend
//! does:
//! - individual slots fail at a configured rate
//! - specific addresses are poisoned (always fail)
//! - whole rounds fail at a configured rate
//!
//! All randomness comes from a seeded ChaCha8 stream, so a given seed and
//! read sequence produce the same failures every run.

use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use vantage_env::{Address, ReadError, ReadKind, ReadRequest, ReadValue, ScatterReader, SlotResult};

/// Fault injection rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Probability that any one slot fails
    pub slot_failure_rate: f64,

    /// Probability that a whole round fails
    pub round_failure_rate: f64,
}

impl FaultConfig {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn flaky(slot_failure_rate: f64, round_failure_rate: f64) -> Self {
        Self {
            slot_failure_rate,
            round_failure_rate,
        }
    }
}

/// Read counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCounters {
    pub rounds: u64,
    pub failed_rounds: u64,
    pub slots: u64,
    pub failed_slots: u64,
}

struct FaultState {
    config: FaultConfig,
    rng: ChaCha8Rng,
}

/// In-memory [`ScatterReader`] with fault injection.
pub struct SimMemory {
    cells: RwLock<HashMap<u64, ReadValue>>,
    poisoned: RwLock<HashSet<u64>>,
    faults: Mutex<FaultState>,

    rounds: AtomicU64,
    failed_rounds: AtomicU64,
    slots: AtomicU64,
    failed_slots: AtomicU64,

    /// Every address read, in order (when enabled)
    read_log: Mutex<Option<Vec<Address>>>,
}

impl SimMemory {
    /// Creates an empty address space whose faults are drawn from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            poisoned: RwLock::new(HashSet::new()),
            faults: Mutex::new(FaultState {
                config: FaultConfig::none(),
                rng: ChaCha8Rng::seed_from_u64(seed),
            }),
            rounds: AtomicU64::new(0),
            failed_rounds: AtomicU64::new(0),
            slots: AtomicU64::new(0),
            failed_slots: AtomicU64::new(0),
            read_log: Mutex::new(None),
        }
    }

    pub fn write(&self, address: Address, value: ReadValue) {
        self.cells.write().insert(address.raw(), value);
    }

    pub fn write_pointer(&self, address: Address, target: Address) {
        self.write(address, ReadValue::Pointer(target));
    }

    /// Unmaps one address.
    pub fn remove(&self, address: Address) -> Option<ReadValue> {
        self.cells.write().remove(&address.raw())
    }

    /// Returns the value stored at `address`, bypassing faults.
    pub fn peek(&self, address: Address) -> Option<ReadValue> {
        self.cells.read().get(&address.raw()).cloned()
    }

    /// Number of mapped addresses.
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    /// Makes every read of `address` fail until [`SimMemory::unpoison`].
    pub fn poison(&self, address: Address) {
        self.poisoned.write().insert(address.raw());
    }

    pub fn unpoison(&self, address: Address) {
        self.poisoned.write().remove(&address.raw());
    }

    pub fn set_faults(&self, config: FaultConfig) {
        self.faults.lock().config = config;
    }

    pub fn faults(&self) -> FaultConfig {
        self.faults.lock().config
    }

    pub fn counters(&self) -> MemoryCounters {
        MemoryCounters {
            rounds: self.rounds.load(Ordering::Relaxed),
            failed_rounds: self.failed_rounds.load(Ordering::Relaxed),
            slots: self.slots.load(Ordering::Relaxed),
            failed_slots: self.failed_slots.load(Ordering::Relaxed),
        }
    }

    /// Starts recording every address read.
    pub fn enable_read_log(&self) {
        self.read_log.lock().get_or_insert_with(Vec::new);
    }

    /// Returns and clears the recorded addresses.
    pub fn take_read_log(&self) -> Vec<Address> {
        self.read_log
            .lock()
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn read_one(
        &self,
        request: &ReadRequest,
        cells: &HashMap<u64, ReadValue>,
        poisoned: &HashSet<u64>,
        injected: bool,
    ) -> SlotResult {
        let raw = request.address.raw();
        if injected || poisoned.contains(&raw) {
            return Err(ReadError::SlotFailed);
        }
        let value = cells.get(&raw).ok_or(ReadError::InvalidAddress(raw))?;
        if !value.matches(&request.kind) {
            return Err(ReadError::TypeMismatch {
                expected: request.kind.name(),
                found: value.kind_name(),
            });
        }
        Ok(match (value, request.kind) {
            (ReadValue::Text(s), ReadKind::Text { max_len }) => {
                ReadValue::Text(s.chars().take(usize::from(max_len)).collect())
            }
            (v, _) => v.clone(),
        })
    }
}

impl ScatterReader for SimMemory {
    fn execute(&self, requests: &[ReadRequest]) -> Result<Vec<SlotResult>, ReadError> {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        self.slots.fetch_add(requests.len() as u64, Ordering::Relaxed);

        if let Some(log) = self.read_log.lock().as_mut() {
            log.extend(requests.iter().map(|r| r.address));
        }

        // Draw every fault up front so the stream does not depend on contents
        let (round_failed, slot_faults) = {
            let mut faults = self.faults.lock();
            let FaultState { config, rng } = &mut *faults;
            let round_failed = config.round_failure_rate > 0.0
                && rng.gen::<f64>() < config.round_failure_rate;
            let slot_faults: Vec<bool> = if config.slot_failure_rate > 0.0 {
                requests
                    .iter()
                    .map(|_| rng.gen::<f64>() < config.slot_failure_rate)
                    .collect()
            } else {
                vec![false; requests.len()]
            };
            (round_failed, slot_faults)
        };

        if round_failed {
            self.failed_rounds.fetch_add(1, Ordering::Relaxed);
            self.failed_slots
                .fetch_add(requests.len() as u64, Ordering::Relaxed);
            return Err(ReadError::backend("simulated round failure"));
        }

        let cells = self.cells.read();
        let poisoned = self.poisoned.read();
        let results: Vec<SlotResult> = requests
            .iter()
            .zip(slot_faults)
            .map(|(r, injected)| self.read_one(r, &cells, &poisoned, injected))
            .collect();

        let failed = results.iter().filter(|r| r.is_err()).count() as u64;
        self.failed_slots.fetch_add(failed, Ordering::Relaxed);
        Ok(results)
    }
}
