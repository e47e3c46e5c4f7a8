//! FIFO-backed true random number generator controller.
//!
//! Enabling the controller fills a 64-entry word FIFO and raises `FULLIF`.
//! Every read from the FIFO window pops one word and tops the FIFO up again
//! while the controller stays enabled. Reading an empty FIFO logs a warning
//! and returns zero.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BoundedFifo, BusPeripheral,
    ConfigError, FieldId, FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterSpec,
    WriteEffect,
};
use tracing::{debug, warn};

use crate::multibit::UnknownEncoding;

/// Control register.
pub const RNGCTRL_CONTROL: u64 = 0x000;
/// Current FIFO level.
pub const RNGCTRL_FIFOLEVEL: u64 = 0x004;
/// FIFO threshold (unmodeled).
pub const RNGCTRL_FIFOTHRESH: u64 = 0x008;
/// FIFO depth.
pub const RNGCTRL_FIFODEPTH: u64 = 0x00C;
/// First of four conditioning key words.
pub const RNGCTRL_KEY0: u64 = 0x010;
/// Conditioning test data input.
pub const RNGCTRL_TESTDATA: u64 = 0x020;
/// Status register.
pub const RNGCTRL_STATUS: u64 = 0x030;
/// Start of the FIFO read window.
pub const RNGCTRL_FIFO: u64 = 0x1000;
/// Window length, registers plus FIFO.
pub const RNGCTRL_SIZE: u64 = 0x2000;

/// Number of words the FIFO holds.
pub const RNGCTRL_FIFO_DEPTH: usize = 64;

/// Controller state reported in `STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum RngState {
    /// Disabled or soft-reset.
    Reset = 0,
    /// Ring oscillators starting.
    Startup = 1,
    /// FIFO full, oscillators on.
    FifoFullOn = 2,
    /// FIFO full, oscillators off.
    FifoFullOff = 3,
    /// Generating.
    Running = 4,
    /// Health test failure.
    Error = 5,
}

impl TryFrom<u64> for RngState {
    type Error = UnknownEncoding;

    fn try_from(value: u64) -> Result<Self, UnknownEncoding> {
        Ok(match value {
            0 => Self::Reset,
            1 => Self::Startup,
            2 => Self::FifoFullOn,
            3 => Self::FifoFullOff,
            4 => Self::Running,
            5 => Self::Error,
            _ => {
                return Err(UnknownEncoding {
                    kind: "rng state",
                    value,
                })
            }
        })
    }
}

/// Configuration for [`RngCtrl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RngCtrlConfig {
    /// Seed of the entropy stream.
    pub seed: u64,
}

impl Default for RngCtrlConfig {
    fn default() -> Self {
        Self { seed: 0xEF32 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Enable,
    SoftReset,
    BlockCount,
    Irq,
    FifoLevel,
    State,
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    enable: FieldId,
    full_irq_enable: FieldId,
    blocks: FieldId,
    full_irq: FieldId,
}

/// FIFO-backed TRNG controller.
#[derive(Debug)]
pub struct RngCtrl {
    config: RngCtrlConfig,
    regs: RegisterBank<Action>,
    fields: Fields,
    fifo: BoundedFifo<u32>,
    state: RngState,
    source: ChaCha20Rng,
    irq: GpioLine,
}

impl RngCtrl {
    /// Creates the controller in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the register layout is rejected.
    pub fn new(config: RngCtrlConfig) -> Result<Self, ConfigError> {
        let mut b = BankBuilder::new(BankConfig::named("rngctrl"));

        let control = b.register(
            RegisterSpec::new(RNGCTRL_CONTROL)
                .name("CONTROL")
                .reset(0x0004_0000),
        );
        let enable = b.field(control, FieldSpec::flag(0, "ENABLE").on_change(Action::Enable));
        b.field(control, FieldSpec::unmodeled(1, 1, "CONTROL"));
        b.field(control, FieldSpec::flag(2, "TESTEN"));
        for (bit, name) in [
            (3, "CONDBYPASS"),
            (4, "REPCOUNTIEN"),
            (5, "APT64IEN"),
            (6, "APT4096IEN"),
        ] {
            b.field(control, FieldSpec::unmodeled(bit, 1, name));
        }
        let full_irq_enable =
            b.field(control, FieldSpec::flag(7, "FULLIEN").on_change(Action::Irq));
        b.field(
            control,
            FieldSpec::flag(8, "SOFTRESET").on_change(Action::SoftReset),
        );
        for (bit, name) in [
            (9, "PREIEN"),
            (10, "ALMIEN"),
            (11, "FORCERUN"),
            (12, "BYPNIST"),
            (13, "BYPAIS31"),
            (14, "HEALTHTESTSEL"),
            (15, "AIS31TESTSEL"),
        ] {
            b.field(control, FieldSpec::unmodeled(bit, 1, name));
        }
        let blocks = b.field(
            control,
            FieldSpec::value(16, 4, "NB128BITBLOCKS").on_write(Action::BlockCount),
        );
        b.field(control, FieldSpec::unmodeled(20, 1, "FIFOWRSTARTUP"));

        b.register_with(
            RegisterSpec::new(RNGCTRL_FIFOLEVEL).name("FIFOLEVEL"),
            FieldSpec::value(0, 32, "FIFOLEVEL")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::FifoLevel),
        );
        b.register_with(
            RegisterSpec::new(RNGCTRL_FIFOTHRESH).name("FIFOTHRESH"),
            FieldSpec::unmodeled(0, 32, "FIFOTHRESH"),
        );
        b.register_with(
            RegisterSpec::new(RNGCTRL_FIFODEPTH)
                .name("FIFODEPTH")
                .reset(RNGCTRL_FIFO_DEPTH as u64),
            FieldSpec::value(0, 32, "FIFODEPTH").mode(FieldMode::ReadOnly),
        );
        for index in 0..4 {
            b.register(RegisterSpec::new(RNGCTRL_KEY0 + index * 4).name("KEY"));
        }
        b.register_with(
            RegisterSpec::new(RNGCTRL_TESTDATA).name("TESTDATA"),
            FieldSpec::unmodeled(0, 32, "VALUE"),
        );
        for (offset, name) in [(0x024, "REPTHRESH"), (0x028, "PROPTHRESH")] {
            b.register_with(
                RegisterSpec::new(offset).name(name),
                FieldSpec::unmodeled(0, 32, name),
            );
        }

        let status = b.register(RegisterSpec::new(RNGCTRL_STATUS).name("STATUS"));
        b.field(status, FieldSpec::unmodeled(0, 1, "TESTDATABUSY"));
        b.field(
            status,
            FieldSpec::value(1, 3, "STATE")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::State),
        );
        for (bit, name) in [(4, "REPCOUNTIF"), (5, "APT64IF"), (6, "APT4096IF")] {
            b.field(status, FieldSpec::unmodeled(bit, 1, name));
        }
        let full_irq = b.field(status, FieldSpec::flag(7, "FULLIF").on_change(Action::Irq));
        for (bit, name) in [(8, "PREIF"), (9, "ALMIF"), (10, "STARTUPPASS")] {
            b.field(status, FieldSpec::unmodeled(bit, 1, name));
        }

        for (offset, name) in [
            (0x034, "INITWAITVAL"),
            (0x038, "DISABLEOSC0"),
            (0x03C, "DISABLEOSC1"),
            (0x040, "SWOFFTMR"),
            (0x044, "CLKDIV"),
            (0x048, "AIS31CONF0"),
            (0x04C, "AIS31CONF1"),
            (0x050, "AIS31CONF2"),
            (0x054, "AIS31STATUS"),
        ] {
            b.register_with(
                RegisterSpec::new(offset).name(name),
                FieldSpec::unmodeled(0, 32, name),
            );
        }

        Ok(Self {
            config,
            regs: b.build()?,
            fields: Fields {
                enable,
                full_irq_enable,
                blocks,
                full_irq,
            },
            fifo: BoundedFifo::new(RNGCTRL_FIFO_DEPTH),
            state: RngState::Reset,
            source: ChaCha20Rng::seed_from_u64(config.seed),
            irq: GpioLine::new("IRQ"),
        })
    }

    /// Current controller state.
    #[must_use]
    pub const fn state(&self) -> RngState {
        self.state
    }

    /// Words currently queued.
    #[must_use]
    pub fn fifo_level(&self) -> usize {
        self.fifo.len()
    }

    /// The `FULLIF && FULLIEN` interrupt line.
    #[must_use]
    pub const fn irq(&self) -> &GpioLine {
        &self.irq
    }

    fn update_irq(&mut self) {
        let level = self.regs.flag(self.fields.full_irq) && self.regs.flag(self.fields.full_irq_enable);
        self.irq.set(level);
    }

    fn fill(&mut self) {
        while !self.fifo.is_full() {
            let _ = self.fifo.try_push(self.source.next_u32());
        }
        self.regs.set_flag(self.fields.full_irq, true);
        self.update_irq();
    }

    fn pop(&mut self) -> u32 {
        let Some(word) = self.fifo.pop() else {
            warn!("rngctrl fifo read while empty");
            return 0;
        };
        if self.regs.flag(self.fields.enable) {
            self.fill();
        }
        word
    }

    fn soft_reset(&mut self) {
        self.state = RngState::Reset;
        self.regs.set_flag(self.fields.enable, false);
        self.fifo.clear();
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::Enable if effect.new != 0 => {
                if !self.fifo.is_empty() {
                    warn!("rngctrl fifo not empty upon enable");
                }
                self.state = RngState::Running;
                self.fill();
                self.state = RngState::FifoFullOff;
            }
            Action::Enable => self.state = RngState::Reset,
            Action::SoftReset if effect.new != 0 => self.soft_reset(),
            Action::BlockCount if effect.new == 0 => {
                debug!("zero block count ignored");
                self.regs.set_value(self.fields.blocks, effect.old);
            }
            Action::Irq => self.update_irq(),
            Action::SoftReset | Action::BlockCount | Action::FifoLevel | Action::State => {}
        }
    }
}

impl BusPeripheral for RngCtrl {
    fn size(&self) -> u64 {
        RNGCTRL_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.soft_reset();
        self.source = ChaCha20Rng::seed_from_u64(self.config.seed);
        self.irq.unset();
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        if (RNGCTRL_FIFO..RNGCTRL_SIZE).contains(&offset) {
            return u64::from(self.pop()) & width.mask();
        }
        let level = self.fifo.len() as u64;
        let state = self.state as u64;
        self.regs
            .read_sized_with(offset, width, |action, _| match action {
                Action::FifoLevel => Some(level),
                Action::State => Some(state),
                _ => None,
            })
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) {
        if (RNGCTRL_FIFO..RNGCTRL_SIZE).contains(&offset) {
            debug!("rngctrl fifo write at {offset:#x} ignored");
            return;
        }
        for effect in self.regs.write_sized(offset, width, value) {
            self.apply(effect);
        }
    }

    fn line_level(&self, name: &str) -> Option<bool> {
        (name == self.irq.name()).then(|| self.irq.is_set())
    }

    fn line_names(&self) -> Vec<&'static str> {
        vec![self.irq.name()]
    }

    fn diagnostics(&self) -> Option<BankDiagnostics> {
        Some(*self.regs.diagnostics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctrl() -> RngCtrl {
        RngCtrl::new(RngCtrlConfig::default()).unwrap()
    }

    #[test]
    fn reset_values() {
        let mut rng = ctrl();
        assert_eq!(rng.read_u32(RNGCTRL_CONTROL), 0x0004_0000);
        assert_eq!(rng.read_u32(RNGCTRL_FIFODEPTH), 64);
        assert_eq!(rng.read_u32(RNGCTRL_FIFOLEVEL), 0);
        assert_eq!(rng.state(), RngState::Reset);
    }

    #[test]
    fn enable_fills_fifo_and_raises_full_interrupt() {
        let mut rng = ctrl();
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0081);
        assert_eq!(rng.read_u32(RNGCTRL_FIFOLEVEL), 64);
        assert_eq!((rng.read_u32(RNGCTRL_STATUS) >> 1) & 0x7, RngState::FifoFullOff as u32);
        assert_eq!(rng.read_u32(RNGCTRL_STATUS) & 0x80, 0x80);
        assert!(rng.irq().is_set());

        rng.write_u32(RNGCTRL_STATUS, 0);
        assert!(!rng.irq().is_set());
    }

    #[test]
    fn fifo_reads_refill_while_enabled() {
        let mut rng = ctrl();
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0001);
        let words: Vec<u32> = (0..8).map(|_| rng.read_u32(RNGCTRL_FIFO)).collect();
        assert!(words.windows(2).any(|w| w[0] != w[1]));
        assert_eq!(rng.fifo_level(), 64);
    }

    #[test]
    fn disabled_fifo_drains_then_reads_zero() {
        let mut rng = ctrl();
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0001);
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0000);
        assert_eq!(rng.state(), RngState::Reset);
        for _ in 0..64 {
            let _ = rng.read_u32(RNGCTRL_FIFO);
        }
        assert_eq!(rng.fifo_level(), 0);
        assert_eq!(rng.read_u32(RNGCTRL_FIFO), 0);
    }

    #[test]
    fn soft_reset_clears_fifo_and_enable() {
        let mut rng = ctrl();
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0001);
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0101);
        assert_eq!(rng.fifo_level(), 0);
        assert_eq!(rng.read_u32(RNGCTRL_CONTROL) & 1, 0);
    }

    #[test]
    fn soft_reset_acts_when_the_bit_is_set() {
        let mut rng = ctrl();
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0100);
        assert_eq!(rng.read_u32(RNGCTRL_CONTROL) & 0x100, 0x100);
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0001);
        assert_eq!(rng.fifo_level(), 64);
        assert_eq!(rng.state(), RngState::FifoFullOff);
        rng.write_u32(RNGCTRL_CONTROL, 0x0004_0101);
        assert_eq!(rng.fifo_level(), 0);
        assert_eq!(rng.state(), RngState::Reset);
    }

    #[test]
    fn zero_block_count_is_ignored() {
        let mut rng = ctrl();
        rng.write_u32(RNGCTRL_CONTROL, 0x0002_0000);
        assert_eq!((rng.read_u32(RNGCTRL_CONTROL) >> 16) & 0xF, 2);
        rng.write_u32(RNGCTRL_CONTROL, 0);
        assert_eq!((rng.read_u32(RNGCTRL_CONTROL) >> 16) & 0xF, 2);
    }

    #[test]
    fn state_decodes() {
        assert_eq!(RngState::try_from(4), Ok(RngState::Running));
        assert!(RngState::try_from(7).is_err());
    }
}
