//! Error types for the Vantage environment abstraction.

use thiserror::Error;

/// Errors that can occur while reading the remote address space.
///
/// A `ReadError` always describes a single slot (or a whole round that
/// failed as a unit). It never aborts sibling slots.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadError {
    /// The backend could not read this slot (page not present, contention)
    #[error("Slot read failed")]
    SlotFailed,

    /// The requested address is outside anything the backend can map
    #[error("Invalid address: {0:#x}")]
    InvalidAddress(u64),

    /// The slot produced a value of a different kind than requested
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// The backend itself failed (device lost, driver error)
    #[error("Backend error: {0}")]
    Backend(String),

    /// The round did not complete within the backend's bound
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl ReadError {
    /// Creates a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Returns true if the whole round failed rather than one slot.
    pub fn is_round_level(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_))
    }
}
