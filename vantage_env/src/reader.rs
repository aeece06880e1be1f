//! Batched remote read abstraction ("scatter rounds").

use crate::error::ReadError;
use crate::types::{Address, RawTransform, ReadKind, ReadRequest, ReadValue, SlotId};

/// Outcome of a single slot.
pub type SlotResult = Result<ReadValue, ReadError>;

/// Abstraction over the memory-reading backend.
///
/// # Implementations
///
/// - **Production**: a DMA/driver backend (outside this workspace)
/// - **Simulation**: `SimMemory` in `vantage_sim`, with fault injection
///
/// # Cost Model
///
/// ```text
/// Worker                       Backend
///   |-- execute([s0..sN]) ------->|
///   |                             |-- one round trip for all slots
///   |<-- [r0..rN] ----------------|
/// ```
///
/// `execute` is the expensive call. Workers minimise the number of rounds,
/// not the number of slots per round.
pub trait ScatterReader: Send + Sync + 'static {
    /// Executes every request as one logical round.
    ///
    /// # Returns
    /// * `Ok(results)` - One result per request, in request order
    /// * `Err(e)` - The round failed as a whole; every slot is treated as failed
    fn execute(&self, requests: &[ReadRequest]) -> Result<Vec<SlotResult>, ReadError>;

    /// Starts building a new round against this reader.
    fn begin_round(&self) -> ReadRound<'_, Self>
    where
        Self: Sized,
    {
        ReadRound::new(self)
    }
}

/// Builder for one batched round.
pub struct ReadRound<'r, R: ScatterReader> {
    reader: &'r R,
    requests: Vec<ReadRequest>,
}

impl<'r, R: ScatterReader> ReadRound<'r, R> {
    /// Creates an empty round.
    pub fn new(reader: &'r R) -> Self {
        Self {
            reader,
            requests: Vec::new(),
        }
    }

    /// Adds a slot and returns its handle.
    pub fn add(&mut self, address: Address, kind: ReadKind) -> SlotId {
        self.requests.push(ReadRequest { address, kind });
        SlotId(self.requests.len() - 1)
    }

    /// Number of slots queued so far.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns true if no slots were added.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Executes the round.
    ///
    /// An empty round never reaches the backend. A backend that returns the
    /// wrong number of results is treated as a whole-round failure.
    pub fn execute(self) -> RoundResult {
        if self.requests.is_empty() {
            return RoundResult {
                requests: self.requests,
                slots: Vec::new(),
                executed: false,
            };
        }

        let slots = match self.reader.execute(&self.requests) {
            Ok(values) if values.len() == self.requests.len() => values
                .into_iter()
                .zip(self.requests.iter())
                .map(|(value, request)| match value {
                    Ok(v) if !v.matches(&request.kind) => Err(ReadError::TypeMismatch {
                        expected: request.kind.name(),
                        found: v.kind_name(),
                    }),
                    other => other,
                })
                .collect(),
            Ok(values) => {
                let err = ReadError::backend(format!(
                    "round returned {} results for {} requests",
                    values.len(),
                    self.requests.len()
                ));
                vec![Err(err); self.requests.len()]
            }
            Err(err) => vec![Err(err); self.requests.len()],
        };

        RoundResult {
            requests: self.requests,
            slots,
            executed: true,
        }
    }
}

/// Per-slot results of an executed round.
#[derive(Debug, Clone)]
pub struct RoundResult {
    requests: Vec<ReadRequest>,
    slots: Vec<SlotResult>,
    executed: bool,
}

impl RoundResult {
    /// Returns true if the round actually reached the backend.
    pub fn executed(&self) -> bool {
        self.executed
    }

    /// Number of slots in the round.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the round had no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots that failed.
    pub fn failed_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_err()).count()
    }

    /// Returns the request behind a slot.
    pub fn request(&self, slot: SlotId) -> Option<&ReadRequest> {
        self.requests.get(slot.0)
    }

    /// Returns the raw slot result.
    pub fn get(&self, slot: SlotId) -> Result<&ReadValue, ReadError> {
        match self.slots.get(slot.0) {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(err.clone()),
            None => Err(ReadError::SlotFailed),
        }
    }

    /// Pointer slot, or `None` if the slot failed.
    pub fn pointer(&self, slot: SlotId) -> Option<Address> {
        match self.get(slot) {
            Ok(ReadValue::Pointer(a)) => Some(*a),
            _ => None,
        }
    }

    pub fn u8(&self, slot: SlotId) -> Option<u8> {
        match self.get(slot) {
            Ok(ReadValue::U8(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn u32(&self, slot: SlotId) -> Option<u32> {
        match self.get(slot) {
            Ok(ReadValue::U32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn i32(&self, slot: SlotId) -> Option<i32> {
        match self.get(slot) {
            Ok(ReadValue::I32(v)) => Some(*v),
            _ => None,
        }
    }

    /// `f32` slot; non-finite values count as failed.
    pub fn f32(&self, slot: SlotId) -> Option<f32> {
        match self.get(slot) {
            Ok(ReadValue::F32(v)) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    /// Vector slot; any non-finite component counts as failed.
    pub fn vec3(&self, slot: SlotId) -> Option<[f32; 3]> {
        match self.get(slot) {
            Ok(ReadValue::Vec3(v)) if v.iter().all(|c| c.is_finite()) => Some(*v),
            _ => None,
        }
    }

    pub fn transform(&self, slot: SlotId) -> Option<RawTransform> {
        match self.get(slot) {
            Ok(ReadValue::Transform(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn text(&self, slot: SlotId) -> Option<&str> {
        match self.slots.get(slot.0) {
            Some(Ok(ReadValue::Text(s))) => Some(s.as_str()),
            _ => None,
        }
    }
}
