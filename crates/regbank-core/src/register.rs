//! Register cells: fixed-width storage that combines and dispatches fields.

use crate::access::bit_mask;
use crate::field::Field;
use crate::{AccessWidth, FieldId, FieldMode};

/// Handle to a declared register, valid for the bank it was built into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId(pub(crate) usize);

impl RegisterId {
    /// Arena index of the register.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Declaration of one register cell, consumed by [`crate::BankBuilder::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec<A> {
    pub(crate) offset: u64,
    pub(crate) width: Option<AccessWidth>,
    pub(crate) reset: u64,
    pub(crate) name: &'static str,
    pub(crate) on_write: Option<A>,
    pub(crate) on_change: Option<A>,
}

impl<A> RegisterSpec<A> {
    /// A register at `offset` using the bank's default width and a zero reset value.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self {
            offset,
            width: None,
            reset: 0,
            name: "",
            on_write: None,
            on_change: None,
        }
    }

    /// Overrides the bank's default register width.
    #[must_use]
    pub const fn width(mut self, width: AccessWidth) -> Self {
        self.width = Some(width);
        self
    }

    /// Sets the reset value.
    #[must_use]
    pub const fn reset(mut self, value: u64) -> Self {
        self.reset = value;
        self
    }

    /// Sets the register name used in logs.
    #[must_use]
    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Emits `action` with `(old raw, written)` after the field effects of every write.
    #[must_use]
    pub fn on_write(mut self, action: A) -> Self {
        self.on_write = Some(action);
        self
    }

    /// Emits `action` with `(old raw, new raw)` when a write changes the register.
    #[must_use]
    pub fn on_change(mut self, action: A) -> Self {
        self.on_change = Some(action);
        self
    }
}

/// Side effect requested by a bus write, returned to the owning peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEffect<A> {
    /// The action token declared on the field or register.
    pub action: A,
    /// Register the write landed on.
    pub register: RegisterId,
    /// Field that requested the effect, `None` for register-level callbacks.
    pub field: Option<FieldId>,
    /// Stored value before the write.
    pub old: u64,
    /// Written slice for write callbacks, stored value for change callbacks.
    pub new: u64,
}

/// One register cell inside a bank.
#[derive(Debug, Clone)]
pub(crate) struct Cell<A> {
    pub(crate) offset: u64,
    pub(crate) width: AccessWidth,
    pub(crate) reset: u64,
    pub(crate) name: &'static str,
    pub(crate) on_write: Option<A>,
    pub(crate) on_change: Option<A>,
    /// Field arena indices in ascending bit order.
    pub(crate) fields: Vec<usize>,
    pub(crate) defined: u64,
    pub(crate) raw: u64,
}

/// What a cell write touched, for the bank to log and count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WriteReport {
    pub(crate) undefined_bits: u64,
    pub(crate) reserved_violation: bool,
    pub(crate) unmodeled_touched: bool,
}

impl<A: Copy> Cell<A> {
    pub(crate) const fn end(&self) -> u64 {
        self.offset + self.width.bytes() as u64
    }

    pub(crate) const fn reset_raw(&self) -> u64 {
        self.reset & self.defined
    }

    /// Side-effect-free view of the bus-visible value.
    pub(crate) fn peek(&self, fields: &[Field<A>]) -> u64 {
        self.fields
            .iter()
            .map(|&index| &fields[index])
            .filter(|field| field.spec.mode.is_readable())
            .fold(0, |acc, field| acc | (self.raw & field.spec.mask()))
    }

    /// Reads the cell, combining field contributions in ascending bit order.
    ///
    /// Only fields intersecting `lanes` run their read side effects. Fields
    /// outside the lanes contribute their stored bits untouched.
    pub(crate) fn read<P>(&mut self, fields: &[Field<A>], lanes: u64, provider: &mut P) -> u64
    where
        P: FnMut(A, u64) -> Option<u64>,
    {
        let mut result = 0;
        for &index in &self.fields {
            let field = &fields[index];
            let mode = field.spec.mode;
            if !mode.is_readable() {
                continue;
            }
            let mut slice = field.slice(self.raw);
            if field.spec.mask() & lanes != 0 {
                if let Some(action) = field.spec.on_read {
                    if let Some(provided) = provider(action, slice) {
                        slice = provided & bit_mask(field.spec.width);
                        self.raw = field.place(self.raw, slice);
                    }
                }
                if mode == FieldMode::ReadToClear {
                    self.raw = field.place(self.raw, 0);
                }
            }
            result |= slice << field.spec.start;
        }
        result
    }

    /// Writes the cell in two phases: storage first, then effects in order.
    ///
    /// Fields not intersecting `lanes` are skipped. Intersecting fields take
    /// their in-lane bits from `value` and a mode-neutral fill elsewhere.
    pub(crate) fn write(
        &mut self,
        id: RegisterId,
        fields: &[Field<A>],
        value: u64,
        lanes: u64,
        effects: &mut Vec<WriteEffect<A>>,
    ) -> WriteReport {
        let mut report = WriteReport {
            undefined_bits: value & lanes & !self.defined,
            ..WriteReport::default()
        };
        let old_raw = self.raw;
        let mut writes = Vec::with_capacity(self.fields.len());

        for &index in &self.fields {
            let field = &fields[index];
            let mask = field.spec.mask();
            if mask & lanes == 0 {
                continue;
            }
            let mode = field.spec.mode;
            let field_mask = bit_mask(field.spec.width);
            let stored = field.slice(old_raw);
            let lane_slice = field.slice(lanes);
            let written = (field.slice(value) & lane_slice)
                | (mode.neutral(stored, field_mask) & !lane_slice & field_mask);
            match mode {
                FieldMode::Reserved if written != stored => report.reserved_violation = true,
                FieldMode::Unmodeled => report.unmodeled_touched = true,
                _ => {}
            }
            let updated = mode.apply(stored, written) & field_mask;
            self.raw = field.place(self.raw, updated);
            writes.push((index, stored, written, updated));
        }

        for &(index, stored, written, _) in &writes {
            let spec = &fields[index].spec;
            if let (true, Some(action)) = (spec.mode.is_writable(), spec.on_write) {
                effects.push(WriteEffect {
                    action,
                    register: id,
                    field: Some(FieldId(index)),
                    old: stored,
                    new: written,
                });
            }
        }
        for &(index, stored, _, updated) in &writes {
            if let (true, Some(action)) = (stored != updated, fields[index].spec.on_change) {
                effects.push(WriteEffect {
                    action,
                    register: id,
                    field: Some(FieldId(index)),
                    old: stored,
                    new: updated,
                });
            }
        }
        if let Some(action) = self.on_write {
            effects.push(WriteEffect {
                action,
                register: id,
                field: None,
                old: old_raw,
                new: value & lanes,
            });
        }
        if let (true, Some(action)) = (old_raw != self.raw, self.on_change) {
            effects.push(WriteEffect {
                action,
                register: id,
                field: None,
                old: old_raw,
                new: self.raw,
            });
        }
        report
    }
}
