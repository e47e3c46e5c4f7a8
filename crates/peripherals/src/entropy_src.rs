//! Physical entropy source with SHA3-384 conditioning.
//!
//! Raw 32-bit samples come from a seeded stream standing in for the noise
//! source. In conditioned mode every 64 samples (2048 bits) are compressed
//! into 12 words with SHA3-384. In raw mode samples pass through in blocks of
//! 12. Blocks are routed either to firmware through `ENTROPY_DATA` or to
//! hardware consumers through [`EntropyProvider`].

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BoundedFifo, BusPeripheral,
    ConfigError, FieldId, FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterSpec,
    WriteEffect,
};
use sha3::{Digest, Sha3_384};
use tracing::{debug, warn};

use crate::irq::{AlertBlock, InterruptBlock};
use crate::multibit::MultiBitBool4;

/// Interrupt state register.
pub const ES_INTR_STATE: u64 = 0x00;
/// Interrupt enable register.
pub const ES_INTR_ENABLE: u64 = 0x04;
/// Interrupt test register.
pub const ES_INTR_TEST: u64 = 0x08;
/// Alert test register.
pub const ES_ALERT_TEST: u64 = 0x0C;
/// Write enable for `MODULE_ENABLE`, cleared by writing zero.
pub const ES_ME_REGWEN: u64 = 0x10;
/// Revision register.
pub const ES_REV: u64 = 0x1C;
/// Module enable (multi-bit boolean).
pub const ES_MODULE_ENABLE: u64 = 0x20;
/// Configuration register.
pub const ES_CONF: u64 = 0x24;
/// Route and type selection.
pub const ES_ENTROPY_CONTROL: u64 = 0x28;
/// Firmware entropy read port.
pub const ES_ENTROPY_DATA: u64 = 0x2C;
/// Firmware override control.
pub const ES_FW_OV_CONTROL: u64 = 0xB0;
/// Firmware override SHA3 block start.
pub const ES_FW_OV_SHA3_START: u64 = 0xB4;
/// Firmware override write FIFO full status.
pub const ES_FW_OV_WR_FIFO_FULL: u64 = 0xB8;
/// Observe FIFO overflow status.
pub const ES_FW_OV_RD_FIFO_OVERFLOW: u64 = 0xBC;
/// Observe FIFO read port.
pub const ES_FW_OV_RD_DATA: u64 = 0xC0;
/// Firmware override write port.
pub const ES_FW_OV_WR_DATA: u64 = 0xC4;
/// Observe FIFO threshold.
pub const ES_OBSERVE_FIFO_THRESH: u64 = 0xC8;
/// Observe FIFO depth.
pub const ES_OBSERVE_FIFO_DEPTH: u64 = 0xCC;
/// Main state machine state.
pub const ES_MAIN_SM_STATE: u64 = 0xE0;
/// Window length.
pub const ES_SIZE: u64 = 0x100;

/// Interrupt index of `es_entropy_valid`.
pub const ES_IRQ_ENTROPY_VALID: usize = 0;
/// Interrupt index of `es_health_test_failed`.
pub const ES_IRQ_HEALTH_TEST_FAILED: usize = 1;
/// Interrupt index of `es_observe_fifo_ready`.
pub const ES_IRQ_OBSERVE_FIFO_READY: usize = 2;
/// Interrupt index of `es_fatal_err`.
pub const ES_IRQ_FATAL_ERR: usize = 3;

/// Words in one seed block.
pub const SEED_WORDS: usize = 12;

const OBSERVE_DEPTH: usize = 64;
const CONDITIONER_WORDS: usize = 64;
const ESFINAL_DEPTH: usize = 48;
const SM_IDLE: u64 = 0b0_1111_0101;
const SM_CONT_HT_RUNNING: u64 = 0b1_1010_0010;

/// Source of full-entropy seed blocks for deterministic generators.
pub trait EntropyProvider {
    /// Hands out one 384-bit seed, or `None` when no entropy can be delivered.
    fn request_entropy(&mut self) -> Option<[u32; SEED_WORDS]>;
}

/// Configuration for [`EntropySrc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EntropySrcConfig {
    /// Seed of the simulated noise source.
    pub seed: u64,
}

impl Default for EntropySrcConfig {
    fn default() -> Self {
        Self { seed: 0xE5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Irq,
    IrqTest,
    AlertTest,
    ModuleEnable,
    EntropyData,
    FwStart,
    ObserveData,
    FwWriteData,
    ObserveDepth,
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    me_regwen: FieldId,
    module_enable: FieldId,
    data_reg_enable: FieldId,
    route: FieldId,
    es_type: FieldId,
    fw_mode: FieldId,
    fw_insert: FieldId,
    observe_overflow: FieldId,
    observe_thresh: FieldId,
    main_sm: FieldId,
}

/// SHA3-conditioned entropy source.
#[derive(Debug)]
pub struct EntropySrc {
    config: EntropySrcConfig,
    regs: RegisterBank<Action>,
    fields: Fields,
    irqs: InterruptBlock,
    alerts: AlertBlock,
    source: ChaCha20Rng,
    packer: Vec<u32>,
    esfinal: BoundedFifo<u32>,
    unpacker: BoundedFifo<u32>,
    observe: BoundedFifo<u32>,
}

/// Compresses packed samples into one seed block with SHA3-384.
#[must_use]
pub fn condition(words: &[u32]) -> [u32; SEED_WORDS] {
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    let hash = Sha3_384::digest(&bytes);
    let mut out = [0u32; SEED_WORDS];
    for (word, chunk) in out.iter_mut().zip(hash.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

impl EntropySrc {
    /// Creates the source in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the register layout is rejected.
    pub fn new(config: EntropySrcConfig) -> Result<Self, ConfigError> {
        let mut b = BankBuilder::new(BankConfig::named("entropy_src"));
        let irqs = InterruptBlock::declare(
            &mut b,
            ES_INTR_STATE,
            &[
                "es_entropy_valid",
                "es_health_test_failed",
                "es_observe_fifo_ready",
                "es_fatal_err",
            ],
            Action::Irq,
            Action::IrqTest,
        );
        let alerts = AlertBlock::declare(
            &mut b,
            ES_ALERT_TEST,
            &["recov_alert", "fatal_alert"],
            Action::AlertTest,
        );

        let me_regwen = b.register_with(
            RegisterSpec::new(ES_ME_REGWEN).name("ME_REGWEN").reset(1),
            FieldSpec::flag(0, "ME_REGWEN").mode(FieldMode::WriteZeroToClear),
        );
        b.register_with(
            RegisterSpec::new(0x14).name("SW_REGUPD").reset(1),
            FieldSpec::unmodeled(0, 1, "SW_REGUPD"),
        );
        b.register_with(
            RegisterSpec::new(0x18).name("REGWEN").reset(1),
            FieldSpec::unmodeled(0, 1, "REGWEN"),
        );
        let rev = b.register(RegisterSpec::new(ES_REV).name("REV").reset(0x0001_0303));
        for (start, name) in [(0, "ABI_REVISION"), (8, "HW_REVISION"), (16, "CHIP_TYPE")] {
            b.field(rev, FieldSpec::value(start, 8, name).mode(FieldMode::ReadOnly));
        }
        let module_enable = b.register_with(
            RegisterSpec::new(ES_MODULE_ENABLE).name("MODULE_ENABLE").reset(0x9),
            FieldSpec::value(0, 4, "MODULE_ENABLE").on_write(Action::ModuleEnable),
        );

        let conf = b.register(RegisterSpec::new(ES_CONF).name("CONF").reset(0x0090_9099));
        b.field(conf, FieldSpec::unmodeled(0, 4, "FIPS_ENABLE"));
        let data_reg_enable = b.field(conf, FieldSpec::value(4, 4, "ENTROPY_DATA_REG_ENABLE"));
        b.field(conf, FieldSpec::unmodeled(12, 4, "THRESHOLD_SCOPE"));
        b.field(conf, FieldSpec::unmodeled(20, 4, "RNG_BIT_ENABLE"));
        b.field(conf, FieldSpec::unmodeled(24, 2, "RNG_BIT_SEL"));

        let control = b.register(
            RegisterSpec::new(ES_ENTROPY_CONTROL)
                .name("ENTROPY_CONTROL")
                .reset(0x99),
        );
        let route = b.field(control, FieldSpec::value(0, 4, "ES_ROUTE"));
        let es_type = b.field(control, FieldSpec::value(4, 4, "ES_TYPE"));

        b.register_with(
            RegisterSpec::new(ES_ENTROPY_DATA).name("ENTROPY_DATA"),
            FieldSpec::value(0, 32, "ENTROPY_DATA")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::EntropyData),
        );

        // Health test thresholds, watermarks and failure counters.
        for (offset, name, reset) in [
            (0x30, "HEALTH_TEST_WINDOWS", 0x0060_0200),
            (0x34, "REPCNT_THRESHOLDS", 0xFFFF_FFFF),
            (0x38, "REPCNTS_THRESHOLDS", 0xFFFF_FFFF),
            (0x3C, "ADAPTP_HI_THRESHOLDS", 0xFFFF_FFFF),
            (0x40, "ADAPTP_LO_THRESHOLDS", 0),
            (0x44, "BUCKET_THRESHOLDS", 0xFFFF_FFFF),
            (0x48, "MARKOV_HI_THRESHOLDS", 0xFFFF_FFFF),
            (0x4C, "MARKOV_LO_THRESHOLDS", 0),
            (0x50, "EXTHT_HI_THRESHOLDS", 0xFFFF_FFFF),
            (0x54, "EXTHT_LO_THRESHOLDS", 0),
            (0x58, "REPCNT_HI_WATERMARKS", 0),
            (0x5C, "REPCNTS_HI_WATERMARKS", 0),
            (0x60, "ADAPTP_HI_WATERMARKS", 0),
            (0x64, "ADAPTP_LO_WATERMARKS", 0xFFFF_FFFF),
            (0x68, "EXTHT_HI_WATERMARKS", 0),
            (0x6C, "EXTHT_LO_WATERMARKS", 0xFFFF_FFFF),
            (0x70, "BUCKET_HI_WATERMARKS", 0),
            (0x74, "MARKOV_HI_WATERMARKS", 0),
            (0x78, "MARKOV_LO_WATERMARKS", 0xFFFF_FFFF),
            (0x7C, "REPCNT_TOTAL_FAILS", 0),
            (0x80, "REPCNTS_TOTAL_FAILS", 0),
            (0x84, "ADAPTP_HI_TOTAL_FAILS", 0),
            (0x88, "ADAPTP_LO_TOTAL_FAILS", 0),
            (0x8C, "BUCKET_TOTAL_FAILS", 0),
            (0x90, "MARKOV_HI_TOTAL_FAILS", 0),
            (0x94, "MARKOV_LO_TOTAL_FAILS", 0),
            (0x98, "EXTHT_HI_TOTAL_FAILS", 0),
            (0x9C, "EXTHT_LO_TOTAL_FAILS", 0),
            (0xA0, "ALERT_THRESHOLD", 0xFFFD_0002),
            (0xA4, "ALERT_SUMMARY_FAIL_COUNTS", 0),
            (0xA8, "ALERT_FAIL_COUNTS", 0),
            (0xAC, "EXTHT_FAIL_COUNTS", 0),
        ] {
            b.register_with(
                RegisterSpec::new(offset).name(name).reset(reset),
                FieldSpec::unmodeled(0, 32, name),
            );
        }

        let fw_control = b.register(
            RegisterSpec::new(ES_FW_OV_CONTROL)
                .name("FW_OV_CONTROL")
                .reset(0x99),
        );
        let fw_mode = b.field(fw_control, FieldSpec::value(0, 4, "FW_OV_MODE"));
        let fw_insert = b.field(fw_control, FieldSpec::value(4, 4, "FW_OV_ENTROPY_INSERT"));
        b.register_with(
            RegisterSpec::new(ES_FW_OV_SHA3_START)
                .name("FW_OV_SHA3_START")
                .reset(0x9),
            FieldSpec::value(0, 4, "FW_OV_INSERT_START").on_write(Action::FwStart),
        );
        b.register_with(
            RegisterSpec::new(ES_FW_OV_WR_FIFO_FULL).name("FW_OV_WR_FIFO_FULL"),
            FieldSpec::flag(0, "FW_OV_WR_FIFO_FULL").mode(FieldMode::ReadOnly),
        );
        let observe_overflow = b.register_with(
            RegisterSpec::new(ES_FW_OV_RD_FIFO_OVERFLOW).name("FW_OV_RD_FIFO_OVERFLOW"),
            FieldSpec::flag(0, "FW_OV_RD_FIFO_OVERFLOW").mode(FieldMode::WriteZeroToClear),
        );
        b.register_with(
            RegisterSpec::new(ES_FW_OV_RD_DATA).name("FW_OV_RD_DATA"),
            FieldSpec::value(0, 32, "FW_OV_RD_DATA")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::ObserveData),
        );
        b.register_with(
            RegisterSpec::new(ES_FW_OV_WR_DATA).name("FW_OV_WR_DATA"),
            FieldSpec::value(0, 32, "FW_OV_WR_DATA")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::FwWriteData),
        );
        let observe_thresh = b.register_with(
            RegisterSpec::new(ES_OBSERVE_FIFO_THRESH)
                .name("OBSERVE_FIFO_THRESH")
                .reset(0x20),
            FieldSpec::value(0, 7, "OBSERVE_FIFO_THRESH"),
        );
        b.register_with(
            RegisterSpec::new(ES_OBSERVE_FIFO_DEPTH).name("OBSERVE_FIFO_DEPTH"),
            FieldSpec::value(0, 7, "OBSERVE_FIFO_DEPTH")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::ObserveDepth),
        );
        for (offset, name, reset) in [
            (0xD0, "DEBUG_STATUS", 0x0001_0000),
            (0xD4, "RECOV_ALERT_STS", 0),
            (0xD8, "ERR_CODE", 0),
            (0xDC, "ERR_CODE_TEST", 0),
        ] {
            b.register_with(
                RegisterSpec::new(offset).name(name).reset(reset),
                FieldSpec::unmodeled(0, 32, name),
            );
        }
        let main_sm = b.register_with(
            RegisterSpec::new(ES_MAIN_SM_STATE)
                .name("MAIN_SM_STATE")
                .reset(SM_IDLE),
            FieldSpec::value(0, 9, "MAIN_SM_STATE").mode(FieldMode::ReadOnly),
        );

        Ok(Self {
            config,
            regs: b.build()?,
            fields: Fields {
                me_regwen,
                module_enable,
                data_reg_enable,
                route,
                es_type,
                fw_mode,
                fw_insert,
                observe_overflow,
                observe_thresh,
                main_sm,
            },
            irqs,
            alerts,
            source: ChaCha20Rng::seed_from_u64(config.seed),
            packer: Vec::with_capacity(CONDITIONER_WORDS),
            esfinal: BoundedFifo::new(ESFINAL_DEPTH),
            unpacker: BoundedFifo::new(SEED_WORDS),
            observe: BoundedFifo::new(OBSERVE_DEPTH),
        })
    }

    fn mubi(&self, field: FieldId) -> bool {
        MultiBitBool4::from_bits(self.regs.value(field)).is_true()
    }

    /// Whether `MODULE_ENABLE` holds the true encoding.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.mubi(self.fields.module_enable)
    }

    fn firmware_route(&self) -> bool {
        self.mubi(self.fields.route)
    }

    fn raw_mode(&self) -> bool {
        self.mubi(self.fields.es_type)
    }

    fn firmware_override(&self) -> bool {
        self.mubi(self.fields.fw_mode)
    }

    fn firmware_insert(&self) -> bool {
        self.mubi(self.fields.fw_insert)
    }

    /// Interrupt line by name.
    #[must_use]
    pub fn irq(&self, name: &str) -> Option<&GpioLine> {
        self.irqs.line(name)
    }

    /// Words waiting in the observe FIFO.
    #[must_use]
    pub fn observe_level(&self) -> usize {
        self.observe.len()
    }

    fn clear_buffers(&mut self) {
        self.packer.clear();
        self.esfinal.clear();
        self.unpacker.clear();
        self.observe.clear();
    }

    /// Draws one batch of samples from the noise source through the pipeline.
    fn fill(&mut self) {
        for _ in 0..OBSERVE_DEPTH {
            let sample = self.source.next_u32();
            self.regs.set_value(self.fields.main_sm, SM_CONT_HT_RUNNING);
            self.observe_sample(sample);
            if !self.firmware_insert() {
                self.insert(sample);
            }
        }
        self.output_path();
    }

    fn observe_sample(&mut self, sample: u32) {
        if !self.firmware_override() {
            return;
        }
        if self.observe.try_push(sample).is_err() {
            warn!("observe fifo is full");
            self.regs.set_flag(self.fields.observe_overflow, true);
        }
        self.check_observe_ready();
    }

    fn check_observe_ready(&mut self) {
        let thresh = self.regs.value(self.fields.observe_thresh);
        if self.observe.len() as u64 >= thresh {
            self.irqs.raise(&mut self.regs, ES_IRQ_OBSERVE_FIFO_READY);
        }
    }

    fn insert(&mut self, word: u32) {
        self.packer.push(word);
        let block = if self.raw_mode() {
            SEED_WORDS
        } else {
            CONDITIONER_WORDS
        };
        if self.packer.len() >= block {
            self.finish_block();
        }
    }

    fn finish_block(&mut self) {
        if self.packer.is_empty() {
            return;
        }
        let packed = std::mem::take(&mut self.packer);
        let block = if self.raw_mode() {
            packed
        } else {
            condition(&packed).to_vec()
        };
        if self.esfinal.free() < block.len() {
            warn!("dropping entropy block, final fifo full");
            return;
        }
        for word in block {
            let _ = self.esfinal.try_push(word);
        }
    }

    fn output_path(&mut self) {
        if !self.firmware_route() {
            return;
        }
        if self.unpacker.is_empty() && self.esfinal.len() >= SEED_WORDS {
            while !self.unpacker.is_full() {
                let Some(word) = self.esfinal.pop() else {
                    break;
                };
                let _ = self.unpacker.try_push(word);
            }
        }
        if !self.unpacker.is_empty() {
            self.irqs.raise(&mut self.regs, ES_IRQ_ENTROPY_VALID);
        }
    }

    fn entropy_data(&mut self) -> u64 {
        if !self.mubi(self.fields.data_reg_enable) {
            warn!("entropy data register is disabled");
            return 0;
        }
        if !self.is_enabled() {
            warn!("entropy data read while module disabled");
            return 0;
        }
        if self.unpacker.is_empty() {
            debug!("entropy generated on demand");
            self.fill();
        }
        self.unpacker.pop().map_or_else(
            || {
                warn!("no entropy data available");
                0
            },
            u64::from,
        )
    }

    fn observe_data(&mut self) -> u64 {
        if !self.firmware_override() {
            warn!("observe fifo read while firmware override is disabled");
            return 0;
        }
        if self.observe.is_empty() {
            self.fill();
        }
        self.observe.pop().map_or_else(
            || {
                warn!("no data in the observe fifo");
                0
            },
            u64::from,
        )
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::Irq => {
                self.irqs.update(&self.regs);
                if !self.unpacker.is_empty() {
                    self.irqs.raise(&mut self.regs, ES_IRQ_ENTROPY_VALID);
                }
                if self.firmware_override() {
                    self.check_observe_ready();
                }
            }
            Action::IrqTest => self.irqs.test(&mut self.regs, effect.new),
            Action::AlertTest => self.alerts.test(effect.new),
            Action::ModuleEnable => {
                if !self.regs.flag(self.fields.me_regwen) {
                    warn!("module enable is locked");
                    self.regs.set_value(self.fields.module_enable, effect.old);
                } else if MultiBitBool4::from_bits(effect.new).is_true() {
                    debug!("enabling entropy source");
                    self.fill();
                } else {
                    debug!("disabling entropy source");
                    self.clear_buffers();
                    self.regs.set_value(self.fields.main_sm, SM_IDLE);
                }
            }
            Action::FwStart => match MultiBitBool4::from_bits(effect.new) {
                MultiBitBool4::True => debug!("firmware sha3 block started"),
                MultiBitBool4::False => {
                    self.finish_block();
                    self.output_path();
                }
                MultiBitBool4::Invalid(_) => {}
            },
            Action::FwWriteData => {
                if !(self.firmware_override() && self.firmware_insert()) {
                    warn!("fifo write outside firmware override insert mode");
                    return;
                }
                #[allow(clippy::cast_possible_truncation)]
                self.insert(effect.new as u32);
            }
            Action::EntropyData | Action::ObserveData | Action::ObserveDepth => {}
        }
    }
}

impl EntropyProvider for EntropySrc {
    fn request_entropy(&mut self) -> Option<[u32; SEED_WORDS]> {
        if !self.is_enabled() {
            warn!("entropy requested while module disabled");
            return None;
        }
        if self.firmware_route() {
            debug!("entropy routed to firmware, hardware request refused");
            return None;
        }
        if self.esfinal.len() < SEED_WORDS {
            self.fill();
        }
        if self.esfinal.len() < SEED_WORDS {
            return None;
        }
        let mut seed = [0u32; SEED_WORDS];
        for slot in &mut seed {
            *slot = self.esfinal.pop().unwrap_or_default();
        }
        Some(seed)
    }
}

impl BusPeripheral for EntropySrc {
    fn size(&self) -> u64 {
        ES_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.irqs.reset();
        self.alerts.reset();
        self.clear_buffers();
        self.source = ChaCha20Rng::seed_from_u64(self.config.seed);
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        let popped = match offset {
            ES_ENTROPY_DATA => Some(self.entropy_data()),
            ES_FW_OV_RD_DATA => Some(self.observe_data()),
            _ => None,
        };
        let depth = self.observe.len() as u64;
        self.regs
            .read_sized_with(offset, width, |action, _| match action {
                Action::EntropyData | Action::ObserveData => popped,
                Action::ObserveDepth => Some(depth),
                _ => None,
            })
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) {
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
