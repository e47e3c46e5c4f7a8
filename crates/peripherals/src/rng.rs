//! Minimal start/value random number generator.
//!
//! `CTRL.START` gates generation. While started, every read of `VALUE`
//! returns a fresh byte. While stopped, `VALUE` reads zero.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BusPeripheral, ConfigError, FieldId,
    FieldMode, FieldSpec, RegisterBank, RegisterSpec,
};

/// Offset of the control register.
pub const RNG_CTRL: u64 = 0x0;
/// Offset of the value register.
pub const RNG_VALUE: u64 = 0x4;
/// Window length.
pub const RNG_SIZE: u64 = 0x8;

/// Configuration for [`SimpleRng`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RngConfig {
    /// Seed of the byte stream; equal seeds give equal streams.
    pub seed: u64,
}

impl Default for RngConfig {
    fn default() -> Self {
        Self { seed: 0x5EED }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    NextByte,
}

/// Start/value random number generator.
#[derive(Debug)]
pub struct SimpleRng {
    config: RngConfig,
    regs: RegisterBank<Action>,
    start: FieldId,
    rng: ChaCha8Rng,
}

impl SimpleRng {
    /// Creates the generator in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the register layout is rejected.
    pub fn new(config: RngConfig) -> Result<Self, ConfigError> {
        let mut b = BankBuilder::new(BankConfig::named("rng"));
        let start = b.register_with(
            RegisterSpec::new(RNG_CTRL).name("CTRL"),
            FieldSpec::flag(0, "START"),
        );
        b.register_with(
            RegisterSpec::new(RNG_VALUE).name("VALUE"),
            FieldSpec::value(0, 8, "VALUE")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::NextByte),
        );
        Ok(Self {
            config,
            regs: b.build()?,
            start,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
        })
    }

    /// Whether generation is running.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.regs.flag(self.start)
    }
}

impl BusPeripheral for SimpleRng {
    fn size(&self) -> u64 {
        RNG_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.rng = ChaCha8Rng::seed_from_u64(self.config.seed);
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        let started = self.regs.flag(self.start);
        let rng = &mut self.rng;
        self.regs.read_sized_with(offset, width, |Action::NextByte, _| {
            Some(if started { u64::from(rng.gen::<u8>()) } else { 0 })
        })
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) {
        let effects = self.regs.write_sized(offset, width, value);
        debug_assert!(effects.is_empty(), "rng registers declare no write actions");
    }

    fn diagnostics(&self) -> Option<BankDiagnostics> {
        Some(*self.regs.diagnostics())
    }
}

#[cfg(test)]
mod tests {
    use super::{RngConfig, SimpleRng, RNG_CTRL, RNG_VALUE};
    use regbank_core::{AccessFault, AccessWidth, BusPeripheral};

    #[test]
    fn started_rng_yields_varied_bytes() {
        let mut rng = SimpleRng::new(RngConfig::default()).unwrap();
        rng.write_u32(RNG_CTRL, 1);
        let values: Vec<u32> = (0..64).map(|_| rng.read_u32(RNG_VALUE)).collect();
        assert!(values.iter().all(|&v| v <= 0xFF));
        assert!(values.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn stopped_rng_reads_zero() {
        let mut rng = SimpleRng::new(RngConfig::default()).unwrap();
        rng.write_u32(RNG_CTRL, 1);
        let _ = rng.read_u32(RNG_VALUE);
        rng.write_u32(RNG_CTRL, 0);
        for _ in 0..8 {
            assert_eq!(rng.read_u32(RNG_VALUE), 0);
        }
    }

    #[test]
    fn reset_replays_the_seeded_stream() {
        let mut rng = SimpleRng::new(RngConfig { seed: 7 }).unwrap();
        rng.write_u32(RNG_CTRL, 1);
        let first: Vec<u32> = (0..4).map(|_| rng.read_u32(RNG_VALUE)).collect();
        rng.reset();
        assert!(!rng.is_started());
        rng.write_u32(RNG_CTRL, 1);
        let again: Vec<u32> = (0..4).map(|_| rng.read_u32(RNG_VALUE)).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn writes_only_reach_the_control_register() {
        let mut rng = SimpleRng::new(RngConfig::default()).unwrap();
        rng.write_u32(RNG_VALUE, 0xAB);
        assert!(!rng.is_started());
        assert_eq!(rng.read_u32(RNG_VALUE), 0);

        rng.write(RNG_CTRL + 2, AccessWidth::DoubleWord, 1);
        assert!(!rng.is_started());
        let diag = rng.diagnostics().unwrap();
        assert_eq!(diag.last_fault, Some(AccessFault::MisalignedAccess));
        assert_eq!(diag.last_fault_offset, RNG_CTRL + 2);

        rng.write_u32(RNG_CTRL, 1);
        assert!(rng.is_started());
    }
}
