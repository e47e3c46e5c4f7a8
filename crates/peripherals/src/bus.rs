//! System bus: named peripherals mapped into one address space.

use std::fmt;

use regbank_core::{AccessWidth, BusPeripheral, ConfigError};
use tracing::{trace, warn};

/// Placement of one mapped peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusWindow {
    /// Peripheral name.
    pub name: String,
    /// Inclusive start address.
    pub start: u64,
    /// Inclusive end address.
    pub end: u64,
}

impl BusWindow {
    /// Returns `true` when `address` falls inside the window.
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.start && address <= self.end
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for BusWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}..={:#010x} {}", self.start, self.end, self.name)
    }
}

struct Mapping {
    window: BusWindow,
    peripheral: Box<dyn BusPeripheral>,
}

/// Address decoder over non-overlapping peripheral windows.
///
/// Accesses that hit no window are logged; reads return 0 and writes are
/// dropped.
#[derive(Default)]
pub struct SystemBus {
    // Sorted by start address.
    mappings: Vec<Mapping>,
}

impl fmt::Debug for SystemBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.mappings.iter().map(|m| &m.window))
            .finish()
    }
}

impl SystemBus {
    /// An empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `peripheral` at `base` for its full [`BusPeripheral::size`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] for a zero-sized or
    /// wrapping window, a window that overlaps an existing one, or a name
    /// that is already taken.
    pub fn map(
        &mut self,
        name: impl Into<String>,
        base: u64,
        peripheral: Box<dyn BusPeripheral>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        let size = peripheral.size();
        let end = size
            .checked_sub(1)
            .and_then(|last| base.checked_add(last))
            .ok_or_else(|| ConfigError::InvalidArgument {
                name: "base",
                reason: format!("`{name}` of size {size:#x} cannot be placed at {base:#x}"),
            })?;
        let window = BusWindow {
            name,
            start: base,
            end,
        };
        if let Some(other) = self.mappings.iter().find(|m| m.window.name == window.name) {
            return Err(ConfigError::InvalidArgument {
                name: "name",
                reason: format!("`{}` is already mapped at {:#x}", other.window.name, other.window.start),
            });
        }
        if let Some(other) = self.mappings.iter().find(|m| m.window.overlaps(&window)) {
            return Err(ConfigError::InvalidArgument {
                name: "base",
                reason: format!("{window} overlaps {}", other.window),
            });
        }
        let index = self
            .mappings
            .partition_point(|m| m.window.start < window.start);
        self.mappings.insert(index, Mapping { window, peripheral });
        Ok(())
    }

    /// Mapped windows in address order.
    pub fn windows(&self) -> impl Iterator<Item = &BusWindow> + '_ {
        self.mappings.iter().map(|m| &m.window)
    }

    /// Number of mapped peripherals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Returns `true` when nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    fn decode(&mut self, address: u64) -> Option<(&mut Mapping, u64)> {
        let index = self
            .mappings
            .partition_point(|m| m.window.start <= address)
            .checked_sub(1)?;
        let mapping = &mut self.mappings[index];
        if !mapping.window.contains(address) {
            return None;
        }
        let offset = address - mapping.window.start;
        Some((mapping, offset))
    }

    /// Peripheral mapped under `name`.
    #[must_use]
    pub fn peripheral(&self, name: &str) -> Option<&dyn BusPeripheral> {
        self.mappings
            .iter()
            .find(|m| m.window.name == name)
            .map(|m| m.peripheral.as_ref())
    }

    /// Mutable peripheral mapped under `name`.
    pub fn peripheral_mut(&mut self, name: &str) -> Option<&mut (dyn BusPeripheral + 'static)> {
        self.mappings
            .iter_mut()
            .find(|m| m.window.name == name)
            .map(|m| m.peripheral.as_mut())
    }

    /// Level of output line `line` of the peripheral mapped under `name`.
    #[must_use]
    pub fn line_level(&self, name: &str, line: &str) -> Option<bool> {
        self.peripheral(name)?.line_level(line)
    }

    /// Resets every mapped peripheral.
    pub fn reset(&mut self) {
        for mapping in &mut self.mappings {
            mapping.peripheral.reset();
        }
    }

    /// Reads `width` bytes at `address`.
    pub fn read(&mut self, address: u64, width: AccessWidth) -> u64 {
        let Some((mapping, offset)) = self.decode(address) else {
            warn!(address = format_args!("{address:#x}"), "read from unmapped address");
            return 0;
        };
        let value = mapping.peripheral.read(offset, width);
        trace!(peripheral = %mapping.window.name, offset, value, "bus read");
        value
    }

    /// Writes `width` bytes at `address`.
    pub fn write(&mut self, address: u64, width: AccessWidth, value: u64) {
        let Some((mapping, offset)) = self.decode(address) else {
            warn!(
                address = format_args!("{address:#x}"),
                value, "write to unmapped address dropped"
            );
            return;
        };
        trace!(peripheral = %mapping.window.name, offset, value, "bus write");
        mapping.peripheral.write(offset, width, value);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::rng::{RngConfig, SimpleRng, RNG_CTRL, RNG_VALUE};

    fn rng() -> Box<dyn BusPeripheral> {
        Box::new(SimpleRng::new(RngConfig::default()).unwrap())
    }

    #[test]
    fn decodes_into_the_right_window() {
        let mut bus = SystemBus::new();
        bus.map("rng1", 0x2000, rng()).unwrap();
        bus.map("rng0", 0x1000, rng()).unwrap();
        bus.write(0x2000 + RNG_CTRL, AccessWidth::DoubleWord, 1);
        assert_eq!(bus.read(0x1000 + RNG_CTRL, AccessWidth::DoubleWord), 0);
        assert_eq!(bus.read(0x2000 + RNG_CTRL, AccessWidth::DoubleWord), 1);
        let names: Vec<&str> = bus.windows().map(|w| w.name.as_str()).collect();
        assert_eq!(names, ["rng0", "rng1"]);
    }

    #[test]
    fn unmapped_accesses_are_benign() {
        let mut bus = SystemBus::new();
        bus.map("rng", 0x1000, rng()).unwrap();
        assert_eq!(bus.read(0x0FFC, AccessWidth::DoubleWord), 0);
        bus.write(0x9000, AccessWidth::DoubleWord, 0xFFFF_FFFF);
        assert_eq!(bus.read(0x1000 + RNG_VALUE, AccessWidth::DoubleWord), 0);
    }

    #[test]
    fn overlapping_window_is_rejected() {
        let mut bus = SystemBus::new();
        bus.map("rng0", 0x1000, rng()).unwrap();
        let size = bus.peripheral("rng0").unwrap().size();
        assert!(matches!(
            bus.map("rng1", 0x1000 + size - 4, rng()),
            Err(ConfigError::InvalidArgument { name: "base", .. })
        ));
        assert!(matches!(
            bus.map("rng0", 0x8000, rng()),
            Err(ConfigError::InvalidArgument { name: "name", .. })
        ));
        assert!(bus.map("rng1", 0x1000 + size, rng()).is_ok());
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn reset_reaches_every_peripheral() {
        let mut bus = SystemBus::new();
        let shared = Rc::new(RefCell::new(SimpleRng::new(RngConfig::default()).unwrap()));
        bus.map("rng", 0x1000, Box::new(Rc::clone(&shared))).unwrap();
        bus.write(0x1000 + RNG_CTRL, AccessWidth::DoubleWord, 1);
        assert!(shared.borrow().is_started());
        bus.reset();
        assert!(!shared.borrow().is_started());
    }
}
