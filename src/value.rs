//! Slot level value model shared by the stack, the heap and class statics.
//!
//! Everything the interpreter moves around is a 32-bit `Slot`. Longs and
//! doubles span two consecutive slots with the high half first, floats and
//! doubles are kept as their raw IEEE bit patterns.
use std::fmt;

/// Unit of storage for operands, locals, fields and array elements.
pub type Slot = u32;

/// Handle to an object living in the heap's object table.
///
/// The zero handle is `null`, handles are never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Reference(pub u32);

impl Reference {
    pub const NULL: Reference = Reference(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn from_slot(slot: Slot) -> Self {
        Reference(slot)
    }

    pub const fn to_slot(self) -> Slot {
        self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// Split a 64-bit value into its (high, low) slot pair.
pub const fn split_wide(value: u64) -> (Slot, Slot) {
    ((value >> 32) as Slot, value as Slot)
}

/// Join a (high, low) slot pair back into a 64-bit value.
pub const fn join_wide(high: Slot, low: Slot) -> u64 {
    ((high as u64) << 32) | low as u64
}

pub fn float_to_slot(value: f32) -> Slot {
    value.to_bits()
}

pub fn slot_to_float(slot: Slot) -> f32 {
    f32::from_bits(slot)
}
