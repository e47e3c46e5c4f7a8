//! Register bank: offset routing, builder validation, reset and snapshots.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::access::{bit_mask, validate_alignment};
use crate::field::Field;
use crate::register::{Cell, WriteReport};
use crate::{
    AccessFault, AccessWidth, BankConfig, BankDiagnostics, BankSnapshot, ConfigError, FieldId,
    FieldSpec, RegisterId, RegisterSpec, SnapshotError, SnapshotVersion, WriteEffect,
};

/// Collects register and field declarations and validates them as a whole.
///
/// Errors are deferred to [`BankBuilder::build`] so peripheral constructors
/// can declare their tables without threading `?` through every line.
#[derive(Debug, Clone)]
pub struct BankBuilder<A> {
    config: BankConfig,
    registers: Vec<RegisterSpec<A>>,
    fields: Vec<(usize, FieldSpec<A>)>,
}

impl<A: Copy> BankBuilder<A> {
    /// Starts an empty bank.
    #[must_use]
    pub const fn new(config: BankConfig) -> Self {
        Self {
            config,
            registers: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Declares a register cell.
    pub fn register(&mut self, spec: RegisterSpec<A>) -> RegisterId {
        self.registers.push(spec);
        RegisterId(self.registers.len() - 1)
    }

    /// Declares a field inside a previously declared register.
    pub fn field(&mut self, register: RegisterId, spec: FieldSpec<A>) -> FieldId {
        self.fields.push((register.0, spec));
        FieldId(self.fields.len() - 1)
    }

    /// Declares a register holding exactly one field and returns the field.
    pub fn register_with(&mut self, spec: RegisterSpec<A>, field: FieldSpec<A>) -> FieldId {
        let register = self.register(spec);
        self.field(register, field)
    }

    /// Validates the layout and produces the bank in its reset state.
    ///
    /// Registers declared without fields get one read-write field spanning
    /// the full register.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found: misaligned, overlapping or
    /// out-of-range registers, reset values wider than their register, zero-width,
    /// out-of-range or overlapping fields, or fields attached to an unknown
    /// register.
    pub fn build(self) -> Result<RegisterBank<A>, ConfigError> {
        let mut cells = Vec::with_capacity(self.registers.len());
        let mut by_offset: BTreeMap<u64, usize> = BTreeMap::new();

        for (index, spec) in self.registers.iter().enumerate() {
            let width = spec.width.unwrap_or(self.config.register_width);
            validate_alignment(spec.offset, width).map_err(|_| {
                ConfigError::MisalignedRegister {
                    offset: spec.offset,
                    width_bytes: width.bytes(),
                }
            })?;
            if spec.offset.checked_add(u64::from(width.bytes())).is_none() {
                return Err(ConfigError::RegisterOutOfRange {
                    offset: spec.offset,
                    width_bytes: width.bytes(),
                });
            }
            if spec.reset & !width.mask() != 0 {
                return Err(ConfigError::ResetValueTooWide {
                    offset: spec.offset,
                    value: spec.reset,
                });
            }
            let cell = Cell {
                offset: spec.offset,
                width,
                reset: spec.reset,
                name: spec.name,
                on_write: spec.on_write,
                on_change: spec.on_change,
                fields: Vec::new(),
                defined: 0,
                raw: 0,
            };
            let previous = by_offset.range(..=cell.offset).next_back();
            let next = by_offset.range(cell.offset..).next();
            for (_, &other) in previous.into_iter().chain(next) {
                let other: &Cell<A> = &cells[other];
                if other.offset < cell.end() && cell.offset < other.end() {
                    return Err(ConfigError::OverlappingRegisters {
                        offset: cell.offset,
                        other: other.offset,
                    });
                }
            }
            by_offset.insert(cell.offset, index);
            cells.push(cell);
        }

        let mut fields: Vec<Field<A>> = Vec::with_capacity(self.fields.len());
        for (register, spec) in self.fields {
            let cell = cells
                .get_mut(register)
                .ok_or(ConfigError::UnknownRegister(register))?;
            place_field(cell, &fields, spec)?;
            cell.fields.push(fields.len());
            fields.push(Field {
                spec,
                cell: register,
            });
        }

        for (index, cell) in cells.iter_mut().enumerate() {
            if cell.fields.is_empty() {
                let name = if cell.name.is_empty() {
                    "VALUE"
                } else {
                    cell.name
                };
                let spec = FieldSpec::value(0, cell.width.bits(), name);
                cell.defined = spec.mask();
                cell.fields.push(fields.len());
                fields.push(Field { spec, cell: index });
            }
            cell.fields.sort_by_key(|&field| fields[field].spec.start);
            cell.raw = cell.reset_raw();
        }

        Ok(RegisterBank {
            config: self.config,
            cells,
            fields,
            by_offset,
            diagnostics: BankDiagnostics::default(),
        })
    }
}

fn place_field<A: Copy>(
    cell: &mut Cell<A>,
    fields: &[Field<A>],
    spec: FieldSpec<A>,
) -> Result<(), ConfigError> {
    if spec.width == 0 {
        return Err(ConfigError::ZeroWidthField { name: spec.name });
    }
    let end = spec.start.saturating_add(spec.width);
    if end > cell.width.bits() {
        return Err(ConfigError::FieldOutOfRange {
            name: spec.name,
            end,
            width_bits: cell.width.bits(),
        });
    }
    let mask = spec.mask();
    if cell.defined & mask != 0 {
        let other = cell
            .fields
            .iter()
            .map(|&index| &fields[index].spec)
            .find(|other| other.mask() & mask != 0)
            .map_or("", |other| other.name);
        return Err(ConfigError::OverlappingFields {
            offset: cell.offset,
            name: spec.name,
            other,
        });
    }
    cell.defined |= mask;
    Ok(())
}

enum Target {
    Hit { cell: usize, shift: u64 },
    Unmapped,
    Fault(AccessFault),
}

/// A validated set of register cells addressed by byte offset.
///
/// `A` is the owning peripheral's action token type. Writes return the
/// requested effects instead of running callbacks, so the peripheral applies
/// them with full access to its own state.
#[derive(Debug, Clone)]
pub struct RegisterBank<A> {
    config: BankConfig,
    cells: Vec<Cell<A>>,
    fields: Vec<Field<A>>,
    by_offset: BTreeMap<u64, usize>,
    diagnostics: BankDiagnostics,
}

impl<A: Copy> RegisterBank<A> {
    /// Bank configuration.
    #[must_use]
    pub const fn config(&self) -> &BankConfig {
        &self.config
    }

    /// Bank name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Number of register cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the bank has no registers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Register offsets in ascending order.
    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_offset.keys().copied()
    }

    /// Whether a register starts exactly at `offset`.
    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        self.by_offset.contains_key(&offset)
    }

    /// Register starting exactly at `offset`.
    #[must_use]
    pub fn register_at(&self, offset: u64) -> Option<RegisterId> {
        self.by_offset.get(&offset).map(|&index| RegisterId(index))
    }

    /// Offset of a register.
    #[must_use]
    pub fn offset_of(&self, register: RegisterId) -> u64 {
        self.cells[register.0].offset
    }

    /// Name of a register.
    #[must_use]
    pub fn register_name(&self, register: RegisterId) -> &'static str {
        self.cells[register.0].name
    }

    /// Name of a field.
    #[must_use]
    pub fn field_name(&self, field: FieldId) -> &'static str {
        self.fields[field.0].spec.name
    }

    /// Register that holds a field.
    #[must_use]
    pub fn field_register(&self, field: FieldId) -> RegisterId {
        RegisterId(self.fields[field.0].cell)
    }

    /// Access counters.
    #[must_use]
    pub const fn diagnostics(&self) -> &BankDiagnostics {
        &self.diagnostics
    }

    /// Clears the access counters.
    pub fn clear_diagnostics(&mut self) {
        self.diagnostics.reset();
    }

    fn target(&self, offset: u64, width: AccessWidth) -> Target {
        let Some((&base, &cell)) = self.by_offset.range(..=offset).next_back() else {
            return Target::Unmapped;
        };
        let end = self.cells[cell].end();
        if offset >= end {
            return Target::Unmapped;
        }
        if let Err(fault) = validate_alignment(offset, width) {
            return Target::Fault(fault);
        }
        if offset.saturating_add(u64::from(width.bytes())) > end {
            return Target::Fault(AccessFault::UnsupportedWidth);
        }
        Target::Hit {
            cell,
            shift: (offset - base) * 8,
        }
    }

    fn record(&mut self, fault: AccessFault, offset: u64) {
        warn!(bank = %self.config.name, code = fault.as_u8(), "{fault} at {offset:#x}");
        self.diagnostics.record(fault, offset);
    }

    fn natural_width(&self, offset: u64) -> AccessWidth {
        self.by_offset
            .get(&offset)
            .map_or(self.config.register_width, |&cell| self.cells[cell].width)
    }

    /// Full-width read of the register at `offset`, without read providers.
    pub fn read(&mut self, offset: u64) -> u64 {
        self.read_with(offset, |_, _| None)
    }

    /// Full-width read of the register at `offset`.
    ///
    /// Fields declared with an `on_read` action ask `provider(action, stored)`
    /// for an override; a returned value is masked and latched.
    pub fn read_with<P>(&mut self, offset: u64, provider: P) -> u64
    where
        P: FnMut(A, u64) -> Option<u64>,
    {
        let width = self.natural_width(offset);
        self.read_sized_with(offset, width, provider)
    }

    /// Sized read without read providers.
    pub fn read_sized(&mut self, offset: u64, width: AccessWidth) -> u64 {
        self.read_sized_with(offset, width, |_, _| None)
    }

    /// Reads `width` bytes at `offset`, which may be a narrower lane of a register.
    ///
    /// Only fields overlapping the accessed lanes run read side effects.
    /// Unmapped, misaligned or boundary-crossing reads are logged, counted
    /// and answered with the configured unmapped value.
    pub fn read_sized_with<P>(&mut self, offset: u64, width: AccessWidth, mut provider: P) -> u64
    where
        P: FnMut(A, u64) -> Option<u64>,
    {
        match self.target(offset, width) {
            Target::Hit { cell, shift } => {
                let lanes = width.mask() << shift;
                let raw = self.cells[cell].read(&self.fields, lanes, &mut provider);
                let value = (raw >> shift) & width.mask();
                trace!(
                    bank = %self.config.name,
                    register = self.cells[cell].name,
                    "read {offset:#x} -> {value:#x}"
                );
                value
            }
            Target::Unmapped => {
                self.record(AccessFault::UnmappedRead, offset);
                self.config.unmapped_read_value & width.mask()
            }
            Target::Fault(fault) => {
                self.record(fault, offset);
                self.config.unmapped_read_value & width.mask()
            }
        }
    }

    /// Full-width write of the register at `offset`.
    pub fn write(&mut self, offset: u64, value: u64) -> Vec<WriteEffect<A>> {
        let width = self.natural_width(offset);
        self.write_sized(offset, width, value)
    }

    /// Writes `width` bytes at `offset`, which may be a narrower lane of a register.
    ///
    /// Storage of every affected field is updated first, in ascending bit
    /// order. The returned effects are ordered: field write actions, field
    /// change actions, the register write action, the register change action.
    /// Fields outside the accessed lanes are neither updated nor reported.
    /// Unmapped, misaligned or boundary-crossing writes are logged, counted
    /// and dropped.
    pub fn write_sized(&mut self, offset: u64, width: AccessWidth, value: u64) -> Vec<WriteEffect<A>> {
        let mut effects = Vec::new();
        match self.target(offset, width) {
            Target::Hit { cell, shift } => {
                let lanes = width.mask() << shift;
                let shifted = (value & width.mask()) << shift;
                trace!(
                    bank = %self.config.name,
                    register = self.cells[cell].name,
                    "write {offset:#x} <- {value:#x}"
                );
                let report = self.cells[cell].write(
                    RegisterId(cell),
                    &self.fields,
                    shifted,
                    lanes,
                    &mut effects,
                );
                self.report(cell, offset, report);
            }
            Target::Unmapped => self.record(AccessFault::UnmappedWrite, offset),
            Target::Fault(fault) => self.record(fault, offset),
        }
        effects
    }

    fn report(&mut self, cell: usize, offset: u64, report: WriteReport) {
        if report.undefined_bits != 0 {
            warn!(
                bank = %self.config.name,
                register = self.cells[cell].name,
                "write sets undefined bits {:#x}", report.undefined_bits
            );
            self.diagnostics
                .record(AccessFault::UndefinedBitsWrite, offset);
        }
        if report.reserved_violation {
            self.record(AccessFault::ReservedBitsWrite, offset);
        }
        if report.unmodeled_touched {
            debug!(
                bank = %self.config.name,
                register = self.cells[cell].name,
                "write reached unmodeled bits at {offset:#x}"
            );
            self.diagnostics.record_unmodeled_write();
        }
    }

    /// Returns `true` when an access of `width` at `offset` lands on a
    /// register, i.e. a read or write there would not be faulted.
    #[must_use]
    pub fn accepts(&self, offset: u64, width: AccessWidth) -> bool {
        matches!(self.target(offset, width), Target::Hit { .. })
    }

    /// Bus-visible value of the register at `offset` without side effects.
    #[must_use]
    pub fn peek(&self, offset: u64) -> Option<u64> {
        self.by_offset
            .get(&offset)
            .map(|&cell| self.cells[cell].peek(&self.fields))
    }

    /// Raw stored value of a register, including write-only bits.
    #[must_use]
    pub fn register_value(&self, register: RegisterId) -> u64 {
        self.cells[register.0].raw
    }

    /// Overwrites a register's storage. Bits outside any field are dropped.
    pub fn set_register_value(&mut self, register: RegisterId, value: u64) {
        let cell = &mut self.cells[register.0];
        cell.raw = value & cell.defined;
    }

    /// Stored value of a field.
    #[must_use]
    pub fn value(&self, field: FieldId) -> u64 {
        let field = &self.fields[field.0];
        field.slice(self.cells[field.cell].raw)
    }

    /// Overwrites a field's storage without effects.
    ///
    /// Values wider than the field are truncated with a warning.
    pub fn set_value(&mut self, field: FieldId, value: u64) {
        let field = &self.fields[field.0];
        let mask = bit_mask(field.spec.width);
        if value & !mask != 0 {
            warn!(
                bank = %self.config.name,
                field = field.spec.name,
                "value {value:#x} truncated to {} bits", field.spec.width
            );
        }
        let cell = &mut self.cells[field.cell];
        cell.raw = field.place(cell.raw, value & mask);
    }

    /// Stored value of a single-bit field.
    #[must_use]
    pub fn flag(&self, field: FieldId) -> bool {
        self.value(field) != 0
    }

    /// Sets a single-bit field without effects.
    pub fn set_flag(&mut self, field: FieldId, set: bool) {
        self.set_value(field, u64::from(set));
    }

    /// Stored value of a field converted to an enumeration.
    #[must_use]
    pub fn value_as<E: TryFrom<u64>>(&self, field: FieldId) -> Option<E> {
        E::try_from(self.value(field)).ok()
    }

    /// Restores every register to its declared reset value.
    ///
    /// No effects are produced and diagnostics are kept.
    pub fn reset(&mut self) {
        for cell in &mut self.cells {
            cell.raw = cell.reset_raw();
        }
        debug!(bank = %self.config.name, "reset");
    }

    /// Captures the storage of every register.
    #[must_use]
    pub fn snapshot(&self) -> BankSnapshot {
        BankSnapshot {
            version: SnapshotVersion::V1.as_u16(),
            bank: self.config.name.clone(),
            registers: self
                .by_offset
                .values()
                .map(|&cell| (self.cells[cell].offset, self.cells[cell].raw))
                .collect(),
        }
    }

    /// Restores storage from a snapshot of the same layout, without effects.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the format version is unknown or the
    /// register count or any offset differs. The bank is left untouched in
    /// that case.
    pub fn restore(&mut self, snapshot: &BankSnapshot) -> Result<(), SnapshotError> {
        if SnapshotVersion::from_u16(snapshot.version).is_none() {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        if snapshot.registers.len() != self.cells.len() {
            return Err(SnapshotError::RegisterCount {
                expected: self.cells.len(),
                found: snapshot.registers.len(),
            });
        }
        if let Some(&(offset, _)) = snapshot
            .registers
            .iter()
            .find(|(offset, _)| !self.by_offset.contains_key(offset))
        {
            return Err(SnapshotError::LayoutMismatch { offset });
        }
        for &(offset, value) in &snapshot.registers {
            if let Some(&cell) = self.by_offset.get(&offset) {
                let cell = &mut self.cells[cell];
                cell.raw = value & cell.defined;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BankBuilder, RegisterBank};
    use crate::{
        AccessFault, AccessWidth, BankConfig, ConfigError, FieldId, FieldMode, FieldSpec,
        RegisterSpec, SnapshotError,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Act {
        Low,
        High,
        Reg,
        RegChange,
        Provide,
    }

    struct Layout {
        bank: RegisterBank<Act>,
        low: FieldId,
        high: FieldId,
        status: FieldId,
        pending: FieldId,
    }

    fn layout() -> Layout {
        let mut b = BankBuilder::new(BankConfig::named("test"));
        let ctrl = b.register(
            RegisterSpec::new(0x0)
                .reset(0x0000_0301)
                .name("CTRL")
                .on_write(Act::Reg)
                .on_change(Act::RegChange),
        );
        let low = b.field(ctrl, FieldSpec::value(0, 4, "LOW").on_write(Act::Low));
        let high = b.field(ctrl, FieldSpec::value(8, 4, "HIGH").on_change(Act::High));
        b.field(ctrl, FieldSpec::reserved(16, 4));
        let status = b.register_with(
            RegisterSpec::new(0x4).name("STATUS"),
            FieldSpec::value(0, 8, "COUNT")
                .mode(FieldMode::ReadOnly)
                .on_read(Act::Provide),
        );
        let pending = b.register_with(
            RegisterSpec::new(0x8).reset(0b1111).name("PENDING"),
            FieldSpec::value(0, 4, "BITS").mode(FieldMode::WriteOneToClear),
        );
        b.register(RegisterSpec::new(0xC).name("SCRATCH"));
        Layout {
            bank: b.build().expect("valid layout"),
            low,
            high,
            status,
            pending,
        }
    }

    #[test]
    fn build_applies_reset_values() {
        let l = layout();
        assert_eq!(l.bank.value(l.low), 1);
        assert_eq!(l.bank.value(l.high), 3);
        assert_eq!(l.bank.value(l.pending), 0b1111);
        assert_eq!(l.bank.len(), 4);
    }

    #[test]
    fn write_effects_are_ordered() {
        let mut l = layout();
        let effects = l.bank.write(0x0, 0x0000_0502);
        let actions: Vec<Act> = effects.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![Act::Low, Act::High, Act::Reg, Act::RegChange]);
        assert_eq!((effects[0].old, effects[0].new), (1, 2));
        assert_eq!((effects[1].old, effects[1].new), (3, 5));
        assert_eq!(effects[2].field, None);
        assert_eq!((effects[3].old, effects[3].new), (0x301, 0x502));
    }

    #[test]
    fn change_actions_skip_unchanged_fields() {
        let mut l = layout();
        let effects = l.bank.write(0x0, 0x0000_0301);
        let actions: Vec<Act> = effects.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![Act::Low, Act::Reg]);
    }

    #[test]
    fn reserved_write_is_counted_and_ignored() {
        let mut l = layout();
        l.bank.write(0x0, 0x000F_0301);
        assert_eq!(l.bank.peek(0x0), Some(0x301));
        assert_eq!(
            l.bank.diagnostics().last_fault,
            Some(AccessFault::ReservedBitsWrite)
        );
    }

    #[test]
    fn undefined_bits_read_zero_and_are_counted() {
        let mut l = layout();
        l.bank.write(0x0, 0xF000_0301);
        assert_eq!(l.bank.read(0x0), 0x301);
        assert_eq!(l.bank.diagnostics().fault_count_layout, 1);
    }

    #[test]
    fn read_provider_value_is_latched() {
        let mut l = layout();
        let value = l.bank.read_with(0x4, |action, stored| {
            assert_eq!(action, Act::Provide);
            Some(stored + 0x1AB)
        });
        assert_eq!(value, 0xAB);
        assert_eq!(l.bank.value(l.status), 0xAB);
        assert_eq!(l.bank.read(0x4), 0xAB);
    }

    #[test]
    fn narrow_write_only_touches_addressed_lane() {
        let mut l = layout();
        l.bank.write(0xC, 0x1122_3344);
        l.bank.write_sized(0xD, AccessWidth::Byte, 0xAA);
        assert_eq!(l.bank.peek(0xC), Some(0x1122_AA44));
        assert_eq!(l.bank.read_sized(0xE, AccessWidth::Word), 0x1122);
    }

    #[test]
    fn narrow_write_does_not_clear_other_lanes_of_w1c_register() {
        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        let pending = b.register_with(
            RegisterSpec::new(0x0).reset(0xFFFF),
            FieldSpec::value(0, 16, "PENDING").mode(FieldMode::WriteOneToClear),
        );
        let mut bank = b.build().expect("valid layout");
        bank.write_sized(0x1, AccessWidth::Byte, 0x01);
        assert_eq!(bank.value(pending), 0xFEFF);
    }

    #[test]
    fn straddling_access_is_rejected() {
        let mut l = layout();
        assert_eq!(l.bank.read_sized(0x2, AccessWidth::DoubleWord), 0);
        assert_eq!(
            l.bank.diagnostics().last_fault,
            Some(AccessFault::MisalignedAccess)
        );
        assert_eq!(l.bank.read_sized(0x0, AccessWidth::QuadWord), 0);
        assert_eq!(
            l.bank.diagnostics().last_fault,
            Some(AccessFault::UnsupportedWidth)
        );
    }

    #[test]
    fn unmapped_access_answers_configured_default() {
        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig {
            unmapped_read_value: 0xDEAD_BEEF,
            ..BankConfig::default()
        });
        b.register(RegisterSpec::new(0x0));
        let mut bank = b.build().expect("valid layout");
        assert_eq!(bank.read(0x100), 0xDEAD_BEEF);
        assert!(bank.write(0x100, 1).is_empty());
        assert_eq!(bank.diagnostics().fault_count_unmapped, 2);
        assert_eq!(bank.diagnostics().last_fault_offset, 0x100);
    }

    #[test]
    fn reset_restores_values_and_keeps_diagnostics() {
        let mut l = layout();
        l.bank.write(0x0, 0x0000_0F0F);
        l.bank.write(0x8, 0b0101);
        l.bank.read(0x40);
        l.bank.reset();
        assert_eq!(l.bank.peek(0x0), Some(0x301));
        assert_eq!(l.bank.peek(0x8), Some(0b1111));
        assert_eq!(l.bank.diagnostics().fault_count_unmapped, 1);
    }

    #[test]
    fn setters_bypass_effects_and_truncate() {
        let mut l = layout();
        l.bank.set_value(l.low, 0x1F);
        assert_eq!(l.bank.value(l.low), 0xF);
        l.bank.set_value(l.pending, 0b0110);
        assert_eq!(l.bank.read(0x8), 0b0110);
        l.bank.set_flag(l.pending, false);
        assert!(!l.bank.flag(l.pending));
        assert_eq!(l.bank.value_as::<u8>(l.high), Some(3));
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let mut l = layout();
        l.bank.write(0xC, 0xCAFE);
        let snapshot = l.bank.snapshot();
        l.bank.reset();
        l.bank.restore(&snapshot).expect("same layout");
        assert_eq!(l.bank.peek(0xC), Some(0xCAFE));

        let mut other = snapshot;
        other.registers[0].0 = 0x40;
        assert_eq!(
            l.bank.restore(&other),
            Err(SnapshotError::LayoutMismatch { offset: 0x40 })
        );
    }

    #[test]
    fn restore_rejects_unknown_snapshot_version() {
        let mut l = layout();
        l.bank.write(0xC, 0xCAFE);
        let mut snapshot = l.bank.snapshot();
        assert_eq!(snapshot.version, 1);
        snapshot.version = 2;
        l.bank.reset();
        assert_eq!(
            l.bank.restore(&snapshot),
            Err(SnapshotError::UnsupportedVersion(2))
        );
        assert_eq!(l.bank.peek(0xC), Some(0));
    }

    #[test]
    fn register_at_top_of_offset_space() {
        let top = u64::MAX - 7;
        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        b.register_with(
            RegisterSpec::new(top).reset(0x1234),
            FieldSpec::value(0, 32, "v"),
        );
        let mut bank = b.build().unwrap();
        assert_eq!(bank.read_sized(top, AccessWidth::DoubleWord), 0x1234);
        assert!(bank.accepts(top, AccessWidth::DoubleWord));
        assert!(!bank.accepts(top, AccessWidth::QuadWord));
        assert_eq!(bank.read_sized(top, AccessWidth::QuadWord), 0);
        assert_eq!(bank.diagnostics().last_fault, Some(AccessFault::UnsupportedWidth));
    }

    #[test]
    fn builder_rejects_malformed_layouts() {
        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        b.register(RegisterSpec::new(0x2));
        assert!(matches!(
            b.build(),
            Err(ConfigError::MisalignedRegister { offset: 0x2, .. })
        ));

        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        b.register(RegisterSpec::new(0x0).width(AccessWidth::QuadWord));
        b.register(RegisterSpec::new(0x4));
        assert!(matches!(
            b.build(),
            Err(ConfigError::OverlappingRegisters { offset: 0x4, other: 0x0 })
        ));

        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        let r = b.register(RegisterSpec::new(0x0));
        b.field(r, FieldSpec::value(0, 4, "A"));
        b.field(r, FieldSpec::value(3, 2, "B"));
        assert!(matches!(
            b.build(),
            Err(ConfigError::OverlappingFields { name: "B", other: "A", .. })
        ));

        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        let r = b.register(RegisterSpec::new(0x0).width(AccessWidth::Byte));
        b.field(r, FieldSpec::value(6, 4, "WIDE"));
        assert!(matches!(
            b.build(),
            Err(ConfigError::FieldOutOfRange { end: 10, width_bits: 8, .. })
        ));

        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        let r = b.register(RegisterSpec::new(0x0));
        b.field(r, FieldSpec::value(0, 0, "EMPTY"));
        assert!(matches!(b.build(), Err(ConfigError::ZeroWidthField { .. })));

        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        b.register(RegisterSpec::new(0x0));
        b.register(RegisterSpec::new(u64::MAX - 3));
        assert!(matches!(
            b.build(),
            Err(ConfigError::RegisterOutOfRange { offset, width_bytes: 4 }) if offset == u64::MAX - 3
        ));

        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        b.register(RegisterSpec::new(u64::MAX - 7));
        assert!(b.build().is_ok());

        let mut b: BankBuilder<()> = BankBuilder::new(BankConfig::default());
        b.register(RegisterSpec::new(0x0).width(AccessWidth::Byte).reset(0x100));
        assert!(matches!(b.build(), Err(ConfigError::ResetValueTooWide { .. })));
    }
}
