//! Bit-field descriptors and their access disciplines.

use crate::access::bit_mask;

/// Access discipline of a bit-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FieldMode {
    /// Writes latch, reads return the stored bits.
    #[default]
    ReadWrite,
    /// Writes are ignored.
    ReadOnly,
    /// Writes latch, reads return zero.
    WriteOnly,
    /// Written ones clear stored bits.
    WriteOneToClear,
    /// Written zeros clear stored bits.
    WriteZeroToClear,
    /// Written ones set stored bits.
    WriteOneToSet,
    /// Written ones invert stored bits.
    Toggle,
    /// Reads return the stored bits and then clear them. Writes are ignored.
    ReadToClear,
    /// Bits keep their reset value forever.
    Reserved,
    /// Bits exist in hardware but have no modeled behavior. They store and
    /// return the last written value.
    Unmodeled,
}

impl FieldMode {
    /// Whether bus writes reach the field and fire its write callback.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly | Self::ReadToClear | Self::Reserved)
    }

    /// Whether bus reads observe the stored bits.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        !matches!(self, Self::WriteOnly)
    }

    /// Applies the mode's update rule to a stored slice.
    #[must_use]
    pub const fn apply(self, stored: u64, written: u64) -> u64 {
        match self {
            Self::ReadWrite | Self::WriteOnly | Self::Unmodeled => written,
            Self::ReadOnly | Self::ReadToClear | Self::Reserved => stored,
            Self::WriteOneToClear => stored & !written,
            Self::WriteZeroToClear => stored & written,
            Self::WriteOneToSet => stored | written,
            Self::Toggle => stored ^ written,
        }
    }

    /// The written slice that leaves `stored` untouched under this mode.
    ///
    /// Used to fill bit lanes a narrow bus access does not cover.
    #[must_use]
    pub const fn neutral(self, stored: u64, mask: u64) -> u64 {
        match self {
            Self::WriteOneToClear | Self::WriteOneToSet | Self::Toggle => 0,
            Self::WriteZeroToClear => mask,
            _ => stored,
        }
    }
}

/// Handle to a declared field, valid for the bank it was built into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub(crate) usize);

impl FieldId {
    /// Arena index of the field.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Declaration of one bit-field, consumed by [`crate::BankBuilder::field`].
///
/// `A` is the peripheral's action token type: callbacks are named actions
/// that the bank hands back to the owning peripheral as effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec<A> {
    pub(crate) start: u32,
    pub(crate) width: u32,
    pub(crate) mode: FieldMode,
    pub(crate) name: &'static str,
    pub(crate) on_write: Option<A>,
    pub(crate) on_change: Option<A>,
    pub(crate) on_read: Option<A>,
}

impl<A> FieldSpec<A> {
    /// A multi-bit value field.
    #[must_use]
    pub const fn value(start: u32, width: u32, name: &'static str) -> Self {
        Self {
            start,
            width,
            mode: FieldMode::ReadWrite,
            name,
            on_write: None,
            on_change: None,
            on_read: None,
        }
    }

    /// A single-bit flag.
    #[must_use]
    pub const fn flag(bit: u32, name: &'static str) -> Self {
        Self::value(bit, 1, name)
    }

    /// Reserved bits pinned to the register's reset value.
    #[must_use]
    pub const fn reserved(start: u32, width: u32) -> Self {
        Self::value(start, width, "RESERVED").mode(FieldMode::Reserved)
    }

    /// Bits documented by hardware but intentionally inert in the model.
    #[must_use]
    pub const fn unmodeled(start: u32, width: u32, name: &'static str) -> Self {
        Self::value(start, width, name).mode(FieldMode::Unmodeled)
    }

    /// Sets the access discipline.
    #[must_use]
    pub const fn mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    /// Emits `action` with `(old stored, written)` on every bus write.
    #[must_use]
    pub fn on_write(mut self, action: A) -> Self {
        self.on_write = Some(action);
        self
    }

    /// Emits `action` with `(old stored, new stored)` when a write changes the field.
    #[must_use]
    pub fn on_change(mut self, action: A) -> Self {
        self.on_change = Some(action);
        self
    }

    /// Asks the read provider for an override on every bus read.
    #[must_use]
    pub fn on_read(mut self, action: A) -> Self {
        self.on_read = Some(action);
        self
    }

    /// Field name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Mask of the field, already shifted into register position.
    #[must_use]
    pub const fn mask(&self) -> u64 {
        match bit_mask(self.width).checked_shl(self.start) {
            Some(mask) => mask,
            None => 0,
        }
    }
}

/// A field placed into a bank.
#[derive(Debug, Clone)]
pub(crate) struct Field<A> {
    pub(crate) spec: FieldSpec<A>,
    pub(crate) cell: usize,
}

impl<A> Field<A> {
    pub(crate) const fn slice(&self, raw: u64) -> u64 {
        (raw >> self.spec.start) & bit_mask(self.spec.width)
    }

    pub(crate) const fn place(&self, raw: u64, slice: u64) -> u64 {
        let mask = self.spec.mask();
        (raw & !mask) | ((slice << self.spec.start) & mask)
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldMode, FieldSpec};
    use rstest::rstest;

    #[rstest]
    #[case(FieldMode::ReadWrite, 0b1010, 0b0110, 0b0110)]
    #[case(FieldMode::ReadOnly, 0b1010, 0b0110, 0b1010)]
    #[case(FieldMode::WriteOnly, 0b1010, 0b0110, 0b0110)]
    #[case(FieldMode::WriteOneToClear, 0b1010, 0b0110, 0b1000)]
    #[case(FieldMode::WriteZeroToClear, 0b1010, 0b0110, 0b0010)]
    #[case(FieldMode::WriteOneToSet, 0b1010, 0b0110, 0b1110)]
    #[case(FieldMode::Toggle, 0b1010, 0b0110, 0b1100)]
    #[case(FieldMode::ReadToClear, 0b1010, 0b0110, 0b1010)]
    #[case(FieldMode::Reserved, 0b1010, 0b0110, 0b1010)]
    #[case(FieldMode::Unmodeled, 0b1010, 0b0110, 0b0110)]
    fn update_rules(
        #[case] mode: FieldMode,
        #[case] stored: u64,
        #[case] written: u64,
        #[case] expected: u64,
    ) {
        assert_eq!(mode.apply(stored, written), expected);
    }

    #[rstest]
    #[case(FieldMode::WriteOneToClear)]
    #[case(FieldMode::WriteZeroToClear)]
    #[case(FieldMode::WriteOneToSet)]
    #[case(FieldMode::Toggle)]
    #[case(FieldMode::ReadWrite)]
    fn neutral_value_preserves_storage(#[case] mode: FieldMode) {
        let stored = 0b1011;
        assert_eq!(mode.apply(stored, mode.neutral(stored, 0b1111)), stored);
    }

    #[test]
    fn writability_and_readability() {
        assert!(FieldMode::WriteOneToClear.is_writable());
        assert!(!FieldMode::ReadOnly.is_writable());
        assert!(!FieldMode::Reserved.is_writable());
        assert!(!FieldMode::WriteOnly.is_readable());
        assert!(FieldMode::Unmodeled.is_readable());
    }

    #[test]
    fn mask_is_positioned() {
        let spec: FieldSpec<()> = FieldSpec::value(4, 3, "X");
        assert_eq!(spec.mask(), 0b111_0000);
        let top: FieldSpec<()> = FieldSpec::value(0, 64, "ALL");
        assert_eq!(top.mask(), u64::MAX);
    }
}
