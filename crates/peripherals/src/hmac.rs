//! SHA-256 / HMAC-SHA256 accelerator.
//!
//! Message bytes are pushed through the FIFO window with 1, 2 or 4 byte
//! writes. `CMD.hash_process` hashes everything pushed since the last
//! `hash_start` and publishes the digest as eight big-endian words.

use ::hmac::{Hmac as HmacSha, Mac};
use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BusPeripheral, ConfigError, FieldId,
    FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterId, RegisterSpec, WriteEffect,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::irq::{AlertBlock, InterruptBlock};

/// Interrupt state register.
pub const HMAC_INTR_STATE: u64 = 0x00;
/// Interrupt enable register.
pub const HMAC_INTR_ENABLE: u64 = 0x04;
/// Interrupt test register.
pub const HMAC_INTR_TEST: u64 = 0x08;
/// Alert test register.
pub const HMAC_ALERT_TEST: u64 = 0x0C;
/// Configuration register.
pub const HMAC_CFG: u64 = 0x10;
/// Command register.
pub const HMAC_CMD: u64 = 0x14;
/// Status register.
pub const HMAC_STATUS: u64 = 0x18;
/// Error code register.
pub const HMAC_ERR_CODE: u64 = 0x1C;
/// First of eight key words.
pub const HMAC_KEY0: u64 = 0x24;
/// First of eight digest words.
pub const HMAC_DIGEST0: u64 = 0x44;
/// Low word of the message length in bits.
pub const HMAC_MSG_LENGTH_LOWER: u64 = 0x64;
/// High word of the message length in bits.
pub const HMAC_MSG_LENGTH_UPPER: u64 = 0x68;
/// Start of the message FIFO window.
pub const HMAC_FIFO: u64 = 0x800;
/// Window length.
pub const HMAC_SIZE: u64 = 0x1000;

/// Interrupt index of `hmac_done`.
pub const HMAC_IRQ_DONE: usize = 0;
/// Interrupt index of `fifo_empty`.
pub const HMAC_IRQ_FIFO_EMPTY: usize = 1;
/// Interrupt index of `hmac_err`.
pub const HMAC_IRQ_ERR: usize = 2;

const WORDS: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Irq,
    IrqTest,
    AlertTest,
    Start,
    Process,
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    hmac_en: FieldId,
    endian_swap: FieldId,
    digest_swap: FieldId,
    key: [RegisterId; 8],
    digest: [RegisterId; 8],
    length_lower: FieldId,
    length_upper: FieldId,
}

/// SHA-256 / HMAC-SHA256 accelerator.
#[derive(Debug)]
pub struct Hmac {
    regs: RegisterBank<Action>,
    fields: Fields,
    irqs: InterruptBlock,
    alerts: AlertBlock,
    message: Vec<u8>,
}

impl Hmac {
    /// Creates the accelerator in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the register layout is rejected.
    pub fn new() -> Result<Self, ConfigError> {
        let mut b = BankBuilder::new(BankConfig::named("hmac"));
        let irqs = InterruptBlock::declare(
            &mut b,
            HMAC_INTR_STATE,
            &["hmac_done", "fifo_empty", "hmac_err"],
            Action::Irq,
            Action::IrqTest,
        );
        let alerts = AlertBlock::declare(&mut b, HMAC_ALERT_TEST, &["fatal_fault"], Action::AlertTest);

        let cfg = b.register(RegisterSpec::new(HMAC_CFG).name("CFG").reset(0x4));
        let hmac_en = b.field(cfg, FieldSpec::flag(0, "hmac_en"));
        b.field(cfg, FieldSpec::flag(1, "sha_en"));
        let endian_swap = b.field(cfg, FieldSpec::flag(2, "endian_swap"));
        let digest_swap = b.field(cfg, FieldSpec::flag(3, "digest_swap"));

        let cmd = b.register(RegisterSpec::new(HMAC_CMD).name("CMD"));
        b.field(
            cmd,
            FieldSpec::flag(0, "hash_start")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::Start),
        );
        b.field(
            cmd,
            FieldSpec::flag(1, "hash_process")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::Process),
        );

        // The message is absorbed on push, so the FIFO always looks drained.
        let status = b.register(RegisterSpec::new(HMAC_STATUS).name("STATUS").reset(0x1));
        b.field(status, FieldSpec::flag(0, "fifo_empty").mode(FieldMode::ReadOnly));
        b.field(status, FieldSpec::flag(1, "fifo_full").mode(FieldMode::ReadOnly));
        b.field(status, FieldSpec::reserved(2, 2));
        b.field(
            status,
            FieldSpec::value(4, 5, "fifo_depth").mode(FieldMode::ReadOnly),
        );

        b.register_with(
            RegisterSpec::new(HMAC_ERR_CODE).name("ERR_CODE"),
            FieldSpec::unmodeled(0, 32, "err_code"),
        );
        b.register_with(
            RegisterSpec::new(0x20).name("WIPE_SECRET"),
            FieldSpec::unmodeled(0, 32, "secret"),
        );

        let key = std::array::from_fn(|index| {
            b.register(RegisterSpec::new(HMAC_KEY0 + index as u64 * 4).name("KEY"))
        });
        for &register in &key {
            b.field(register, FieldSpec::value(0, 32, "key").mode(FieldMode::WriteOnly));
        }
        let digest = std::array::from_fn(|index| {
            b.register(RegisterSpec::new(HMAC_DIGEST0 + index as u64 * 4).name("DIGEST"))
        });
        for &register in &digest {
            b.field(register, FieldSpec::value(0, 32, "digest").mode(FieldMode::ReadOnly));
        }
        let length_lower = b.register_with(
            RegisterSpec::new(HMAC_MSG_LENGTH_LOWER).name("MSG_LENGTH_LOWER"),
            FieldSpec::value(0, 32, "v").mode(FieldMode::ReadOnly),
        );
        let length_upper = b.register_with(
            RegisterSpec::new(HMAC_MSG_LENGTH_UPPER).name("MSG_LENGTH_UPPER"),
            FieldSpec::value(0, 32, "v").mode(FieldMode::ReadOnly),
        );

        Ok(Self {
            regs: b.build()?,
            fields: Fields {
                hmac_en,
                endian_swap,
                digest_swap,
                key,
                digest,
                length_lower,
                length_upper,
            },
            irqs,
            alerts,
            message: Vec::new(),
        })
    }

    /// Interrupt line by name.
    #[must_use]
    pub fn irq(&self, name: &str) -> Option<&GpioLine> {
        self.irqs.line(name)
    }

    /// Alert line by name.
    #[must_use]
    pub fn alert(&self, name: &str) -> Option<&GpioLine> {
        self.alerts.line(name)
    }

    /// Bytes absorbed since the last start or process command.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.message.len()
    }

    fn push(&mut self, width: AccessWidth, value: u64) {
        let bytes = &value.to_le_bytes()[..usize::from(width.bytes())];
        if self.regs.flag(self.fields.endian_swap) {
            self.message.extend_from_slice(bytes);
        } else {
            self.message.extend(bytes.iter().rev());
        }
        let bits = self.message.len() as u64 * 8;
        self.regs.set_value(self.fields.length_lower, bits & 0xFFFF_FFFF);
        self.regs.set_value(self.fields.length_upper, bits >> 32);
        self.irqs.raise(&mut self.regs, HMAC_IRQ_FIFO_EMPTY);
    }

    fn key(&self) -> Vec<u8> {
        self.fields
            .key
            .iter()
            .flat_map(|&register| {
                #[allow(clippy::cast_possible_truncation)]
                let word = self.regs.register_value(register) as u32;
                word.to_be_bytes()
            })
            .collect()
    }

    fn process(&mut self) {
        let message = std::mem::take(&mut self.message);
        let hash: [u8; 32] = if self.regs.flag(self.fields.hmac_en) {
            let Ok(mut mac) = HmacSha::<Sha256>::new_from_slice(&self.key()) else {
                warn!("hmac key rejected");
                self.irqs.raise(&mut self.regs, HMAC_IRQ_ERR);
                return;
            };
            mac.update(&message);
            mac.finalize().into_bytes().into()
        } else {
            Sha256::digest(&message).into()
        };
        debug!(len = message.len(), hmac = self.regs.flag(self.fields.hmac_en), "hash processed");

        let swap = self.regs.flag(self.fields.digest_swap);
        for (chunk, &register) in hash.chunks_exact(4).zip(&self.fields.digest) {
            let bytes = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let word = if swap {
                u32::from_le_bytes(bytes)
            } else {
                u32::from_be_bytes(bytes)
            };
            self.regs.set_register_value(register, u64::from(word));
        }
        self.irqs.raise(&mut self.regs, HMAC_IRQ_DONE);
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::Irq => self.irqs.update(&self.regs),
            Action::IrqTest => self.irqs.test(&mut self.regs, effect.new),
            Action::AlertTest => self.alerts.test(effect.new),
            Action::Start if effect.new != 0 => {
                self.message.clear();
                self.regs.set_value(self.fields.length_lower, 0);
                self.regs.set_value(self.fields.length_upper, 0);
            }
            Action::Process if effect.new != 0 => self.process(),
            Action::Start | Action::Process => {}
        }
    }
}

impl BusPeripheral for Hmac {
    fn size(&self) -> u64 {
        HMAC_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.message.clear();
        self.irqs.reset();
        self.alerts.reset();
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        if (HMAC_FIFO..HMAC_SIZE).contains(&offset) {
            warn!("hmac fifo window read at {offset:#x}, returning 0");
            return 0;
        }
        self.regs.read_sized(offset, width)
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) {
        if (HMAC_FIFO..HMAC_SIZE).contains(&offset) {
            if width == AccessWidth::QuadWord {
                warn!("hmac fifo push wider than a word at {offset:#x} dropped");
                return;
            }
            self.push(width, value);
            return;
        }
        for effect in self.regs.write_sized(offset, width, value) {
            self.apply(effect);
        }
    }

    fn line_level(&self, name: &str) -> Option<bool> {
        self.irqs
            .line(name)
            .or_else(|| self.alerts.line(name))
            .map(GpioLine::is_set)
    }

    fn line_names(&self) -> Vec<&'static str> {
        let mut names = self.irqs.names();
        names.extend(self.alerts.names());
        names
    }

    fn diagnostics(&self) -> Option<BankDiagnostics> {
        Some(*self.regs.diagnostics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(hmac: &mut Hmac, data: &[u8]) {
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            match chunk.len() {
                4 => hmac.write_u32(HMAC_FIFO, u32::from_le_bytes(word)),
                _ => {
                    for &byte in chunk {
                        hmac.write_u8(HMAC_FIFO, byte);
                    }
                }
            }
        }
    }

    fn digest(hmac: &mut Hmac) -> Vec<u32> {
        (0..WORDS).map(|i| hmac.read_u32(HMAC_DIGEST0 + i * 4)).collect()
    }

    #[test]
    fn sha256_of_abc() {
        let mut hmac = Hmac::new().unwrap();
        hmac.write_u32(HMAC_CMD, 0b01);
        push_str(&mut hmac, b"abc");
        assert_eq!(hmac.read_u32(HMAC_MSG_LENGTH_LOWER), 24);
        hmac.write_u32(HMAC_CMD, 0b10);
        assert_eq!(
            digest(&mut hmac),
            vec![
                0xba78_16bf, 0x8f01_cfea, 0x4141_40de, 0x5dae_2223, 0xb003_61a3, 0x9617_7a9c,
                0xb410_ff61, 0xf200_15ad
            ]
        );
        assert!(hmac.irqs.is_pending(&hmac.regs, HMAC_IRQ_DONE));
        assert_eq!(hmac.pending_len(), 0);
    }

    #[test]
    fn digest_swap_reverses_word_bytes() {
        let mut hmac = Hmac::new().unwrap();
        hmac.write_u32(HMAC_CFG, 0b1100);
        push_str(&mut hmac, b"abc");
        hmac.write_u32(HMAC_CMD, 0b10);
        assert_eq!(hmac.read_u32(HMAC_DIGEST0), 0xbf16_78ba);
    }

    #[test]
    fn key_reads_zero_and_status_reports_empty() {
        let mut hmac = Hmac::new().unwrap();
        hmac.write_u32(HMAC_KEY0, 0x4a65_6665);
        assert_eq!(hmac.read_u32(HMAC_KEY0), 0);
        assert_eq!(hmac.key()[..4], *b"Jefe");
        assert_eq!(hmac.read_u32(HMAC_STATUS), 1);
    }

    #[test]
    fn push_raises_fifo_empty_when_enabled() {
        let mut hmac = Hmac::new().unwrap();
        hmac.write_u32(HMAC_INTR_ENABLE, 0b010);
        hmac.write_u8(HMAC_FIFO, 0x61);
        assert!(hmac.irq("fifo_empty").unwrap().is_set());
        hmac.write_u32(HMAC_INTR_STATE, 0b010);
        assert!(!hmac.irq("fifo_empty").unwrap().is_set());
    }

    #[test]
    fn fifo_reads_return_zero() {
        let mut hmac = Hmac::new().unwrap();
        assert_eq!(hmac.read_u32(HMAC_FIFO + 0x10), 0);
    }
}
