use thiserror::Error;

/// Fault classes used for diagnostics aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessClass {
    /// Access targeted an offset with no register behind it.
    Unmapped,
    /// Access width or alignment did not fit the addressed register.
    Width,
    /// Access touched bits the register layout does not accept.
    Layout,
}

/// Stable taxonomy of invalid bus accesses.
///
/// Access faults are never returned to the bus caller. The bank logs them,
/// answers with a benign default and records them in its diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum AccessFault {
    /// Read from an offset not covered by any register.
    #[error("read from unmapped offset")]
    UnmappedRead = 0x01,
    /// Write to an offset not covered by any register.
    #[error("write to unmapped offset")]
    UnmappedWrite = 0x02,
    /// Access wider than the register or crossing its boundary.
    #[error("access width not supported by register")]
    UnsupportedWidth = 0x03,
    /// Access offset not aligned to the access width.
    #[error("misaligned register access")]
    MisalignedAccess = 0x04,
    /// Write tried to change a reserved field.
    #[error("write to reserved bits")]
    ReservedBitsWrite = 0x05,
    /// Write set bits that no field covers.
    #[error("write to undefined bits")]
    UndefinedBitsWrite = 0x06,
}

impl AccessFault {
    /// Converts a fault to its stable code.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a stable code back into a fault.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::UnmappedRead),
            0x02 => Some(Self::UnmappedWrite),
            0x03 => Some(Self::UnsupportedWidth),
            0x04 => Some(Self::MisalignedAccess),
            0x05 => Some(Self::ReservedBitsWrite),
            0x06 => Some(Self::UndefinedBitsWrite),
            _ => None,
        }
    }

    /// Returns the diagnostics class for this fault.
    #[must_use]
    pub const fn class(self) -> AccessClass {
        match self {
            Self::UnmappedRead | Self::UnmappedWrite => AccessClass::Unmapped,
            Self::UnsupportedWidth | Self::MisalignedAccess => AccessClass::Width,
            Self::ReservedBitsWrite | Self::UndefinedBitsWrite => AccessClass::Layout,
        }
    }
}

/// Construction-time failures. These are fatal for the object being built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two registers occupy overlapping offsets.
    #[error("register at {offset:#x} overlaps register at {other:#x}")]
    OverlappingRegisters {
        /// Offset of the rejected register.
        offset: u64,
        /// Offset of the register already occupying the range.
        other: u64,
    },
    /// Register offset is not a multiple of its width.
    #[error("register at {offset:#x} is not aligned to {width_bytes} bytes")]
    MisalignedRegister {
        /// Offset of the rejected register.
        offset: u64,
        /// Register width in bytes.
        width_bytes: u8,
    },
    /// Register would extend past the end of the offset space.
    #[error("register at {offset:#x} of {width_bytes} bytes runs past the end of the offset space")]
    RegisterOutOfRange {
        /// Offset of the rejected register.
        offset: u64,
        /// Register width in bytes.
        width_bytes: u8,
    },
    /// Reset value does not fit the register width.
    #[error("reset value {value:#x} does not fit register at {offset:#x}")]
    ResetValueTooWide {
        /// Offset of the rejected register.
        offset: u64,
        /// Offending reset value.
        value: u64,
    },
    /// Field declared with zero width.
    #[error("field `{name}` has zero width")]
    ZeroWidthField {
        /// Field name.
        name: &'static str,
    },
    /// Field extends past the top of its register.
    #[error("field `{name}` ends at bit {end} beyond register width {width_bits}")]
    FieldOutOfRange {
        /// Field name.
        name: &'static str,
        /// First bit past the field.
        end: u32,
        /// Register width in bits.
        width_bits: u32,
    },
    /// Two fields of one register share bits.
    #[error("field `{name}` overlaps field `{other}` in register at {offset:#x}")]
    OverlappingFields {
        /// Register offset.
        offset: u64,
        /// Field being added.
        name: &'static str,
        /// Field already present.
        other: &'static str,
    },
    /// Field was attached to a register id the builder did not hand out.
    #[error("unknown register id {0}")]
    UnknownRegister(usize),
    /// Peripheral construction argument out of range.
    #[error("invalid `{name}`: {reason}")]
    InvalidArgument {
        /// Argument name.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}
