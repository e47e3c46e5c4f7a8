//! Bus access widths and the width/alignment policy helpers.

use crate::AccessFault;

/// Width of a single bus access or register cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte = 1,
    /// 16-bit access.
    Word = 2,
    /// 32-bit access.
    DoubleWord = 4,
    /// 64-bit access.
    QuadWord = 8,
}

impl AccessWidth {
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> u8 {
        self as u8
    }

    /// Width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// All-ones mask covering the width.
    #[must_use]
    pub const fn mask(self) -> u64 {
        bit_mask(self.bits())
    }

    /// Maps a byte count onto a width.
    #[must_use]
    pub const fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::DoubleWord),
            8 => Some(Self::QuadWord),
            _ => None,
        }
    }
}

/// Returns a mask of the low `bits` bits, saturating at 64.
#[must_use]
pub const fn bit_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Validates a raw access width in bytes.
///
/// # Errors
///
/// Returns [`AccessFault::UnsupportedWidth`] for anything other than 1, 2, 4 or 8.
pub const fn validate_access_width(width_bytes: u8) -> Result<AccessWidth, AccessFault> {
    match AccessWidth::from_bytes(width_bytes) {
        Some(width) => Ok(width),
        None => Err(AccessFault::UnsupportedWidth),
    }
}

/// Validates that `offset` is naturally aligned for `width`.
///
/// # Errors
///
/// Returns [`AccessFault::MisalignedAccess`] when `offset` is not a multiple
/// of the width.
pub const fn validate_alignment(offset: u64, width: AccessWidth) -> Result<(), AccessFault> {
    if offset % width.bytes() as u64 == 0 {
        Ok(())
    } else {
        Err(AccessFault::MisalignedAccess)
    }
}

#[cfg(test)]
mod tests {
    use super::{bit_mask, validate_access_width, validate_alignment, AccessWidth};
    use crate::AccessFault;
    use rstest::rstest;

    #[rstest]
    #[case(1, AccessWidth::Byte, 0xFF)]
    #[case(2, AccessWidth::Word, 0xFFFF)]
    #[case(4, AccessWidth::DoubleWord, 0xFFFF_FFFF)]
    #[case(8, AccessWidth::QuadWord, u64::MAX)]
    fn widths_map_to_masks(#[case] bytes: u8, #[case] width: AccessWidth, #[case] mask: u64) {
        assert_eq!(validate_access_width(bytes), Ok(width));
        assert_eq!(width.bytes(), bytes);
        assert_eq!(width.mask(), mask);
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(16)]
    fn odd_widths_are_rejected(#[case] bytes: u8) {
        assert_eq!(
            validate_access_width(bytes),
            Err(AccessFault::UnsupportedWidth)
        );
    }

    #[test]
    fn alignment_follows_width() {
        assert!(validate_alignment(0x13, AccessWidth::Byte).is_ok());
        assert!(validate_alignment(0x12, AccessWidth::Word).is_ok());
        assert_eq!(
            validate_alignment(0x12, AccessWidth::DoubleWord),
            Err(AccessFault::MisalignedAccess)
        );
        assert!(validate_alignment(0x18, AccessWidth::QuadWord).is_ok());
    }

    #[test]
    fn bit_mask_saturates() {
        assert_eq!(bit_mask(0), 0);
        assert_eq!(bit_mask(5), 0x1F);
        assert_eq!(bit_mask(64), u64::MAX);
        assert_eq!(bit_mask(70), u64::MAX);
    }
}
