//! Common types for the Vantage environment abstraction.

use serde::{Deserialize, Serialize};

/// An address in the remote (read-only) address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u64);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Lowest address a live object can occupy.
    const MIN_PLAUSIBLE: u64 = 0x1_0000;

    /// Highest user-space address on the targets we read from.
    const MAX_PLAUSIBLE: u64 = 0x0000_7FFF_FFFF_FFFF;

    /// Creates an address from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns this address advanced by `offset` bytes.
    #[inline]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Returns true if the address could point at a live, aligned object.
    ///
    /// Used to reject garbage pointers before spending a round on them.
    pub fn is_plausible(self) -> bool {
        self.0 >= Self::MIN_PLAUSIBLE && self.0 <= Self::MAX_PLAUSIBLE && self.0 % 8 == 0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The shape of value a slot should decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    Pointer,
    U8,
    U32,
    I32,
    F32,
    /// Three packed `f32` (x, y, z)
    Vec3,
    /// Rotation quaternion, translation and scale (10 packed `f32`)
    Transform,
    /// Null-terminated string of at most `max_len` bytes
    Text { max_len: u16 },
}

impl ReadKind {
    /// Human-readable name (for error messages).
    pub fn name(&self) -> &'static str {
        match self {
            ReadKind::Pointer => "pointer",
            ReadKind::U8 => "u8",
            ReadKind::U32 => "u32",
            ReadKind::I32 => "i32",
            ReadKind::F32 => "f32",
            ReadKind::Vec3 => "vec3",
            ReadKind::Transform => "transform",
            ReadKind::Text { .. } => "text",
        }
    }
}

/// A rigid transform with non-uniform scale, as stored by the source.
///
/// Kept as plain arrays; the core crate converts to its math types.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawTransform {
    /// Quaternion `[x, y, z, w]`
    pub rotation: [f32; 4],
    pub translation: [f32; 3],
    pub scale: [f32; 3],
}

impl RawTransform {
    /// The identity transform.
    pub const IDENTITY: RawTransform = RawTransform {
        rotation: [0.0, 0.0, 0.0, 1.0],
        translation: [0.0, 0.0, 0.0],
        scale: [1.0, 1.0, 1.0],
    };

    /// Creates a pure translation.
    pub fn from_translation(translation: [f32; 3]) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }
}

impl Default for RawTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// A decoded slot value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadValue {
    Pointer(Address),
    U8(u8),
    U32(u32),
    I32(i32),
    F32(f32),
    Vec3([f32; 3]),
    Transform(RawTransform),
    Text(String),
}

impl ReadValue {
    /// Human-readable kind name (for error messages).
    pub fn kind_name(&self) -> &'static str {
        match self {
            ReadValue::Pointer(_) => "pointer",
            ReadValue::U8(_) => "u8",
            ReadValue::U32(_) => "u32",
            ReadValue::I32(_) => "i32",
            ReadValue::F32(_) => "f32",
            ReadValue::Vec3(_) => "vec3",
            ReadValue::Transform(_) => "transform",
            ReadValue::Text(_) => "text",
        }
    }

    /// Returns true if this value is what a slot of `kind` should yield.
    pub fn matches(&self, kind: &ReadKind) -> bool {
        matches!(
            (self, kind),
            (ReadValue::Pointer(_), ReadKind::Pointer)
                | (ReadValue::U8(_), ReadKind::U8)
                | (ReadValue::U32(_), ReadKind::U32)
                | (ReadValue::I32(_), ReadKind::I32)
                | (ReadValue::F32(_), ReadKind::F32)
                | (ReadValue::Vec3(_), ReadKind::Vec3)
                | (ReadValue::Transform(_), ReadKind::Transform)
                | (ReadValue::Text(_), ReadKind::Text { .. })
        )
    }
}

/// One independent read in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: Address,
    pub kind: ReadKind,
}

/// Handle to a slot inside a round, returned by `ReadRound::add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_plausibility() {
        assert!(!Address::NULL.is_plausible());
        assert!(!Address::new(0x100).is_plausible());
        assert!(!Address::new(0x7FF0_0000_0001).is_plausible()); // misaligned
        assert!(!Address::new(0xFFFF_8000_0000_0000).is_plausible()); // kernel space
        assert!(Address::new(0x1_4000_0000).is_plausible());
    }

    #[test]
    fn test_address_offset_and_display() {
        let base = Address::new(0x1000);
        assert_eq!(base.offset(0x20), Address::new(0x1020));
        assert_eq!(base.to_string(), "0x1000");
    }

    #[test]
    fn test_value_matches_kind() {
        assert!(ReadValue::U32(4).matches(&ReadKind::U32));
        assert!(!ReadValue::U32(4).matches(&ReadKind::I32));
        assert!(ReadValue::Text("a".into()).matches(&ReadKind::Text { max_len: 8 }));
    }

    #[test]
    fn test_address_serializes_transparently() {
        let json = serde_json::to_string(&Address::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
