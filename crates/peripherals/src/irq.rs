//! Interrupt state/enable/test triples and alert test registers.
//!
//! Each interrupt source owns one flag in `INTR_STATE` (write-one-to-clear),
//! `INTR_ENABLE` and `INTR_TEST` (write-only, sets state), plus one output
//! line driven as `state && enable`.

use regbank_core::{
    BankBuilder, FieldId, FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterSpec,
};

/// Interrupt registers declared at `base`, `base + 4` and `base + 8`.
#[derive(Debug)]
pub struct InterruptBlock {
    state: Vec<FieldId>,
    enable: Vec<FieldId>,
    lines: Vec<GpioLine>,
}

impl InterruptBlock {
    /// Declares the three registers. `update` is emitted on state and enable
    /// writes, `test` on test writes with the written bits.
    pub fn declare<A: Copy>(
        b: &mut BankBuilder<A>,
        base: u64,
        names: &[&'static str],
        update: A,
        test: A,
    ) -> Self {
        let state_reg = b.register(
            RegisterSpec::new(base)
                .name("INTR_STATE")
                .on_write(update),
        );
        let enable_reg = b.register(
            RegisterSpec::new(base + 4)
                .name("INTR_ENABLE")
                .on_write(update),
        );
        let test_reg = b.register(RegisterSpec::new(base + 8).name("INTR_TEST").on_write(test));
        let mut state = Vec::with_capacity(names.len());
        let mut enable = Vec::with_capacity(names.len());
        for (bit, &name) in (0u32..).zip(names) {
            state.push(b.field(
                state_reg,
                FieldSpec::flag(bit, name).mode(FieldMode::WriteOneToClear),
            ));
            enable.push(b.field(enable_reg, FieldSpec::flag(bit, name)));
            b.field(test_reg, FieldSpec::flag(bit, name).mode(FieldMode::WriteOnly));
        }
        Self {
            state,
            enable,
            lines: names.iter().map(|&name| GpioLine::new(name)).collect(),
        }
    }

    /// Latches interrupt `index` and refreshes the lines.
    pub fn raise<A: Copy>(&mut self, regs: &mut RegisterBank<A>, index: usize) {
        regs.set_flag(self.state[index], true);
        self.update(regs);
    }

    /// Clears interrupt `index` and refreshes the lines.
    pub fn clear<A: Copy>(&mut self, regs: &mut RegisterBank<A>, index: usize) {
        regs.set_flag(self.state[index], false);
        self.update(regs);
    }

    /// Latches every interrupt whose bit is set in `bits`.
    pub fn test<A: Copy>(&mut self, regs: &mut RegisterBank<A>, bits: u64) {
        for (index, &field) in self.state.iter().enumerate() {
            if bits & (1 << index) != 0 {
                regs.set_flag(field, true);
            }
        }
        self.update(regs);
    }

    /// Drives each line to `state && enable`.
    pub fn update<A: Copy>(&mut self, regs: &RegisterBank<A>) {
        for ((line, &state), &enable) in self.lines.iter_mut().zip(&self.state).zip(&self.enable) {
            line.set(regs.flag(state) && regs.flag(enable));
        }
    }

    /// Whether interrupt `index` is latched, regardless of enable.
    #[must_use]
    pub fn is_pending<A: Copy>(&self, regs: &RegisterBank<A>, index: usize) -> bool {
        regs.flag(self.state[index])
    }

    /// Drops every line without notifying as a rising edge.
    pub fn reset(&mut self) {
        for line in &mut self.lines {
            line.unset();
        }
    }

    /// Line by name.
    #[must_use]
    pub fn line(&self, name: &str) -> Option<&GpioLine> {
        self.lines.iter().find(|line| line.name() == name)
    }

    /// Mutable line by name, for wiring sinks.
    pub fn line_mut(&mut self, name: &str) -> Option<&mut GpioLine> {
        self.lines.iter_mut().find(|line| line.name() == name)
    }

    /// Line names in bit order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.lines.iter().map(GpioLine::name).collect()
    }
}

/// `ALERT_TEST` register whose write-only bits pulse alert lines.
#[derive(Debug)]
pub struct AlertBlock {
    lines: Vec<GpioLine>,
}

impl AlertBlock {
    /// Declares the register at `offset`. `test` is emitted with the written bits.
    pub fn declare<A: Copy>(
        b: &mut BankBuilder<A>,
        offset: u64,
        names: &[&'static str],
        test: A,
    ) -> Self {
        let reg = b.register(RegisterSpec::new(offset).name("ALERT_TEST").on_write(test));
        for (bit, &name) in (0u32..).zip(names) {
            b.field(reg, FieldSpec::flag(bit, name).mode(FieldMode::WriteOnly));
        }
        Self {
            lines: names.iter().map(|&name| GpioLine::new(name)).collect(),
        }
    }

    /// Pulses every alert whose bit is set in `bits`.
    pub fn test(&mut self, bits: u64) {
        for (index, line) in self.lines.iter_mut().enumerate() {
            if bits & (1 << index) != 0 {
                line.blink();
            }
        }
    }

    /// Pulses alert `index`.
    pub fn blink(&mut self, index: usize) {
        if let Some(line) = self.lines.get_mut(index) {
            line.blink();
        }
    }

    /// Drops every line.
    pub fn reset(&mut self) {
        for line in &mut self.lines {
            line.unset();
        }
    }

    /// Line by name.
    #[must_use]
    pub fn line(&self, name: &str) -> Option<&GpioLine> {
        self.lines.iter().find(|line| line.name() == name)
    }

    /// Line names in bit order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.lines.iter().map(GpioLine::name).collect()
    }
}
