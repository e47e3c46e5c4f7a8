use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tracing::warn;

use crate::{AccessWidth, BankDiagnostics};

/// Static configuration of one register bank.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BankConfig {
    /// Name carried by every log line of the bank.
    pub name: String,
    /// Value answered to reads from unmapped offsets.
    pub unmapped_read_value: u64,
    /// Width of registers that do not declare their own.
    pub register_width: AccessWidth,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            name: String::from("bank"),
            unmapped_read_value: 0,
            register_width: AccessWidth::DoubleWord,
        }
    }
}

impl BankConfig {
    /// Default configuration with the given bank name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Snapshot format versions accepted by [`crate::RegisterBank::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u16)]
pub enum SnapshotVersion {
    /// Offset/value pairs in ascending offset order.
    V1 = 1,
}

impl SnapshotVersion {
    /// Returns the stable wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parses a stable wire value.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::V1),
            _ => None,
        }
    }
}

/// Captured register contents of one bank.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct BankSnapshot {
    /// Wire value of the snapshot format version, see [`SnapshotVersion`].
    pub version: u16,
    /// Name of the bank the snapshot was taken from.
    pub bank: String,
    /// Raw stored value of every register as `(offset, value)`.
    pub registers: Vec<(u64, u64)>,
}

/// Reasons a snapshot cannot be restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The snapshot was produced by an unsupported format version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),
    /// The snapshot does not describe the same register layout.
    #[error("snapshot layout mismatch at offset {offset:#x}")]
    LayoutMismatch {
        /// First offset that did not match.
        offset: u64,
    },
    /// The snapshot register count differs from the bank.
    #[error("snapshot holds {found} registers, bank has {expected}")]
    RegisterCount {
        /// Registers in the bank.
        expected: usize,
        /// Registers in the snapshot.
        found: usize,
    },
}

/// Bus-facing contract of a peripheral model.
///
/// Accesses are infallible: invalid traffic is logged and answered with a
/// benign default inside the peripheral.
pub trait BusPeripheral {
    /// Length of the peripheral's address window in bytes.
    fn size(&self) -> u64;

    /// Restores reset state without raising any line.
    fn reset(&mut self);

    /// Reads `width` bytes at `offset` within the window.
    fn read(&mut self, offset: u64, width: AccessWidth) -> u64;

    /// Writes `width` bytes at `offset` within the window.
    fn write(&mut self, offset: u64, width: AccessWidth, value: u64);

    /// Level of the named output line, `None` if the peripheral has no such line.
    fn line_level(&self, _name: &str) -> Option<bool> {
        None
    }

    /// Names of the output lines this peripheral drives.
    fn line_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Access counters of the peripheral's register bank, if it has one.
    fn diagnostics(&self) -> Option<BankDiagnostics> {
        None
    }

    /// Byte read.
    #[allow(clippy::cast_possible_truncation)]
    fn read_u8(&mut self, offset: u64) -> u8 {
        self.read(offset, AccessWidth::Byte) as u8
    }

    /// Word read.
    #[allow(clippy::cast_possible_truncation)]
    fn read_u16(&mut self, offset: u64) -> u16 {
        self.read(offset, AccessWidth::Word) as u16
    }

    /// Double-word read.
    #[allow(clippy::cast_possible_truncation)]
    fn read_u32(&mut self, offset: u64) -> u32 {
        self.read(offset, AccessWidth::DoubleWord) as u32
    }

    /// Quad-word read.
    fn read_u64(&mut self, offset: u64) -> u64 {
        self.read(offset, AccessWidth::QuadWord)
    }

    /// Byte write.
    fn write_u8(&mut self, offset: u64, value: u8) {
        self.write(offset, AccessWidth::Byte, u64::from(value));
    }

    /// Word write.
    fn write_u16(&mut self, offset: u64, value: u16) {
        self.write(offset, AccessWidth::Word, u64::from(value));
    }

    /// Double-word write.
    fn write_u32(&mut self, offset: u64, value: u32) {
        self.write(offset, AccessWidth::DoubleWord, u64::from(value));
    }

    /// Quad-word write.
    fn write_u64(&mut self, offset: u64, value: u64) {
        self.write(offset, AccessWidth::QuadWord, value);
    }
}

/// Shared peripherals are reachable from the bus and from collaborators.
///
/// A bus access arriving while the peripheral is already borrowed (a
/// collaborator calling back into the bus mid-transaction) is refused with a
/// warning instead of aliasing its state.
impl<T: BusPeripheral + ?Sized> BusPeripheral for Rc<RefCell<T>> {
    fn size(&self) -> u64 {
        self.try_borrow().map_or(0, |inner| inner.size())
    }

    fn reset(&mut self) {
        match self.try_borrow_mut() {
            Ok(mut inner) => inner.reset(),
            Err(_) => warn!("reset of busy peripheral dropped"),
        }
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        self.try_borrow_mut().map_or_else(
            |_| {
                warn!("reentrant read at {offset:#x} refused");
                0
            },
            |mut inner| inner.read(offset, width),
        )
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) {
        match self.try_borrow_mut() {
            Ok(mut inner) => inner.write(offset, width, value),
            Err(_) => warn!("reentrant write at {offset:#x} refused"),
        }
    }

    fn line_level(&self, name: &str) -> Option<bool> {
        self.try_borrow().ok().and_then(|inner| inner.line_level(name))
    }

    fn line_names(&self) -> Vec<&'static str> {
        self.try_borrow()
            .map(|inner| inner.line_names())
            .unwrap_or_default()
    }

    fn diagnostics(&self) -> Option<BankDiagnostics> {
        self.try_borrow().ok().and_then(|inner| inner.diagnostics())
    }
}

#[cfg(test)]
mod tests {
    use super::{BankConfig, BusPeripheral, SnapshotVersion};
    use crate::AccessWidth;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Scratch {
        word: u64,
    }

    impl BusPeripheral for Scratch {
        fn size(&self) -> u64 {
            8
        }

        fn reset(&mut self) {
            self.word = 0;
        }

        fn read(&mut self, _offset: u64, width: AccessWidth) -> u64 {
            self.word & width.mask()
        }

        fn write(&mut self, _offset: u64, width: AccessWidth, value: u64) {
            self.word = value & width.mask();
        }
    }

    #[test]
    fn default_config_answers_zero_with_double_words() {
        let config = BankConfig::default();
        assert_eq!(config.unmapped_read_value, 0);
        assert_eq!(config.register_width, AccessWidth::DoubleWord);
        assert_eq!(BankConfig::named("uart").name, "uart");
    }

    #[test]
    fn snapshot_version_parse() {
        assert_eq!(SnapshotVersion::from_u16(1), Some(SnapshotVersion::V1));
        assert_eq!(SnapshotVersion::V1.as_u16(), 1);
        assert_eq!(SnapshotVersion::from_u16(2), None);
    }

    #[test]
    fn sized_helpers_truncate() {
        let mut scratch = Scratch::default();
        scratch.write_u32(0, 0x1234_5678);
        assert_eq!(scratch.read_u8(0), 0x78);
        assert_eq!(scratch.read_u16(0), 0x5678);
        assert_eq!(scratch.read_u64(0), 0x1234_5678);
    }

    #[test]
    fn shared_peripheral_refuses_reentrant_access() {
        let shared = Rc::new(RefCell::new(Scratch::default()));
        let mut handle = Rc::clone(&shared);
        handle.write_u32(0, 7);
        assert_eq!(handle.read_u32(0), 7);

        let guard = shared.borrow_mut();
        assert_eq!(handle.read_u32(0), 0);
        handle.write_u32(0, 9);
        drop(guard);
        assert_eq!(handle.read_u32(0), 7);
    }
}
