//! Redundantly encoded booleans and enumeration decode errors.

use thiserror::Error;

/// A field value that does not map onto any variant of the target enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown {kind} encoding {value:#x}")]
pub struct UnknownEncoding {
    /// Enumeration being decoded.
    pub kind: &'static str,
    /// Raw field value.
    pub value: u64,
}

/// Four-bit hardware boolean: 0x6 is true, 0x9 is false, anything else is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MultiBitBool4 {
    /// Encoded as `0x6`.
    True,
    /// Encoded as `0x9`.
    False,
    /// Any other nibble.
    Invalid(u8),
}

impl MultiBitBool4 {
    /// Encoding of true.
    pub const TRUE: u64 = 0x6;
    /// Encoding of false.
    pub const FALSE: u64 = 0x9;

    /// Decodes the low nibble of `value`.
    #[must_use]
    pub const fn from_bits(value: u64) -> Self {
        match value & 0xF {
            Self::TRUE => Self::True,
            Self::FALSE => Self::False,
            #[allow(clippy::cast_possible_truncation)]
            other => Self::Invalid(other as u8),
        }
    }

    /// Encodes a boolean.
    #[must_use]
    pub const fn encode(value: bool) -> u64 {
        if value {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    /// True only for the canonical true encoding.
    #[must_use]
    pub const fn is_true(self) -> bool {
        matches!(self, Self::True)
    }

    /// Whether the nibble is one of the two canonical encodings.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}
