//! Keccak message authentication engine.
//!
//! Supports SHA3-224/256/384/512, SHAKE128/256, cSHAKE128/256 and
//! KMAC128/256 with fixed or extendable output. Software drives the engine
//! with a four-command sequence:
//!
//! ```text
//! Start -> Process -> (Run)* -> Done
//! ```
//!
//! Message bytes go through the FIFO window between `Start` and `Process`.
//! After `Process` the first output block is visible in the STATE window and
//! every `Run` squeezes the next block. A command issued out of sequence sets
//! `ERR_CODE`, raises `kmac_err` and is dropped.

use std::fmt;

use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BusPeripheral, ConfigError, FieldId,
    FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterId, RegisterSpec, WriteEffect,
};
use sha3::digest::{Digest, ExtendableOutput, Update, XofReader};
use sha3::{
    CShake128, CShake128Core, CShake256, CShake256Core, Sha3_224, Sha3_256, Sha3_384, Sha3_512,
    Shake128, Shake256,
};
use tracing::{debug, warn};

use crate::encode::{bytepad, decode_string, encode_string, split_right_encoded};
use crate::irq::{AlertBlock, InterruptBlock};

/// Interrupt state register.
pub const KMAC_INTR_STATE: u64 = 0x00;
/// Interrupt enable register.
pub const KMAC_INTR_ENABLE: u64 = 0x04;
/// Interrupt test register.
pub const KMAC_INTR_TEST: u64 = 0x08;
/// Alert test register.
pub const KMAC_ALERT_TEST: u64 = 0x0C;
/// Configuration write enable.
pub const KMAC_CFG_REGWEN: u64 = 0x10;
/// Configuration register.
pub const KMAC_CFG: u64 = 0x14;
/// Command register.
pub const KMAC_CMD: u64 = 0x18;
/// Status register.
pub const KMAC_STATUS: u64 = 0x1C;
/// First word of key share 0.
pub const KMAC_KEY_SHARE0: u64 = 0x40;
/// First word of key share 1.
pub const KMAC_KEY_SHARE1: u64 = 0x80;
/// Key length selector.
pub const KMAC_KEY_LEN: u64 = 0xC0;
/// First of eleven prefix words.
pub const KMAC_PREFIX0: u64 = 0xC4;
/// Error code register.
pub const KMAC_ERR_CODE: u64 = 0xF0;
/// Start of the output state window.
pub const KMAC_STATE: u64 = 0x400;
/// Start of the state mask window.
pub const KMAC_STATE_MASK: u64 = 0x500;
/// Start of the message FIFO window.
pub const KMAC_FIFO: u64 = 0x800;
/// Window length.
pub const KMAC_SIZE: u64 = 0x1000;

/// Interrupt index of `kmac_done`.
pub const KMAC_IRQ_DONE: usize = 0;
/// Interrupt index of `fifo_empty`.
pub const KMAC_IRQ_FIFO_EMPTY: usize = 1;
/// Interrupt index of `kmac_err`.
pub const KMAC_IRQ_ERR: usize = 2;

/// Keccak state size in bytes.
pub const KMAC_STATE_BYTES: usize = 200;
/// Required sideloaded key length in bytes.
pub const KMAC_SIDELOAD_KEY_BYTES: usize = 64;

const FIFO_MAX_BYTES: usize = 72;

/// Commands written to `CMD.cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum KmacCommand {
    /// Begin absorbing.
    Start = 0x1D,
    /// Finish absorbing and produce the first output block.
    Process = 0x2E,
    /// Squeeze the next output block.
    Run = 0x31,
    /// Return to idle.
    Done = 0x16,
}

impl KmacCommand {
    /// Decodes a command value. Returns `None` for unknown encodings.
    #[must_use]
    pub const fn from_bits(value: u64) -> Option<Self> {
        match value {
            0x1D => Some(Self::Start),
            0x2E => Some(Self::Process),
            0x31 => Some(Self::Run),
            0x16 => Some(Self::Done),
            _ => None,
        }
    }
}

/// Error classes reported in the top byte of `ERR_CODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum KmacError {
    /// Key missing or of a reserved length.
    KeyNotValid = 0x01,
    /// Message pushed while the engine was not absorbing.
    SwPushedMsgFifo = 0x02,
    /// Command issued while an application interface owns the engine.
    SwIssuedCmdInAppActive = 0x03,
    /// Entropy wait timer expired.
    WaitTimerExpired = 0x04,
    /// Entropy mode not usable.
    IncorrectEntropyMode = 0x05,
    /// Mode and strength combination not supported.
    UnexpectedModeStrength = 0x06,
    /// KMAC prefix does not name `KMAC`.
    IncorrectFunctionName = 0x07,
    /// Command issued out of sequence.
    SwCmdSequence = 0x08,
}

impl KmacError {
    /// `ERR_CODE` value carrying `info` in the low bits.
    #[must_use]
    pub const fn code(self, info: u64) -> u64 {
        ((self as u64) << 24) | (info & 0x00FF_FFFF)
    }
}

/// Configuration for [`Kmac`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KmacConfig {
    /// Key delivered by a key manager, used when `CFG.sideload` is set.
    pub sideload_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Irq,
    IrqTest,
    AlertTest,
    Command,
    Idle,
    Absorb,
    Squeeze,
    FifoDepth,
    FifoEmpty,
    FifoFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Absorb,
    Squeeze,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Hasher {
    Sha3 { bits: usize },
    Shake { bits: usize },
    CShake { bits: usize, name: Vec<u8>, custom: Vec<u8> },
    Kmac { bits: usize, custom: Vec<u8> },
}

impl Hasher {
    const fn bits(&self) -> usize {
        match self {
            Self::Sha3 { bits }
            | Self::Shake { bits }
            | Self::CShake { bits, .. }
            | Self::Kmac { bits, .. } => *bits,
        }
    }

    const fn rate(&self) -> usize {
        KMAC_STATE_BYTES - self.bits() / 4
    }
}

struct Squeezer {
    reader: Box<dyn XofReader>,
    remaining: Option<usize>,
    rate: usize,
}

impl fmt::Debug for Squeezer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Squeezer")
            .field("remaining", &self.remaining)
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}

impl Squeezer {
    fn next_block(&mut self) -> Vec<u8> {
        let len = self.remaining.map_or(self.rate, |left| left.min(self.rate));
        let mut block = vec![0; len];
        self.reader.read(&mut block);
        if let Some(left) = &mut self.remaining {
            *left -= len;
        }
        block
    }

    const fn is_exhausted(&self) -> bool {
        matches!(self.remaining, Some(0))
    }
}

fn absorb<H>(mut hasher: H, parts: &[&[u8]]) -> Box<dyn XofReader>
where
    H: Update + ExtendableOutput,
    H::Reader: 'static,
{
    for part in parts {
        Update::update(&mut hasher, part);
    }
    Box::new(hasher.finalize_xof())
}

fn cshake(bits: usize, name: &[u8], custom: &[u8], parts: &[&[u8]]) -> Box<dyn XofReader> {
    if bits == 128 {
        absorb(
            CShake128::from_core(CShake128Core::new_with_function_name(name, custom)),
            parts,
        )
    } else {
        absorb(
            CShake256::from_core(CShake256Core::new_with_function_name(name, custom)),
            parts,
        )
    }
}

fn sha3_digest(bits: usize, data: &[u8]) -> Vec<u8> {
    match bits {
        224 => <Sha3_224 as Digest>::digest(data).to_vec(),
        256 => <Sha3_256 as Digest>::digest(data).to_vec(),
        384 => <Sha3_384 as Digest>::digest(data).to_vec(),
        _ => <Sha3_512 as Digest>::digest(data).to_vec(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    kmac_en: FieldId,
    strength: FieldId,
    mode: FieldId,
    sideload: FieldId,
    share0: [RegisterId; 16],
    share1: [RegisterId; 16],
    key_len: FieldId,
    prefix: [RegisterId; 11],
    err_code: FieldId,
}

/// Keccak message authentication engine.
#[derive(Debug)]
pub struct Kmac {
    regs: RegisterBank<Action>,
    fields: Fields,
    irqs: InterruptBlock,
    alerts: AlertBlock,
    sideload_key: Option<Vec<u8>>,
    phase: Phase,
    previous: KmacCommand,
    hasher: Option<Hasher>,
    squeezer: Option<Squeezer>,
    fifo: Vec<u8>,
    state: Vec<u8>,
}

impl Kmac {
    /// Creates the engine in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] if a sideload key is given
    /// that is not 64 bytes long, or [`ConfigError`] if the register layout
    /// is rejected.
    pub fn new(config: KmacConfig) -> Result<Self, ConfigError> {
        let mut b = BankBuilder::new(BankConfig::named("kmac"));
        let irqs = InterruptBlock::declare(
            &mut b,
            KMAC_INTR_STATE,
            &["kmac_done", "fifo_empty", "kmac_err"],
            Action::Irq,
            Action::IrqTest,
        );
        let alerts = AlertBlock::declare(
            &mut b,
            KMAC_ALERT_TEST,
            &["recov_operation_err", "fatal_fault_err"],
            Action::AlertTest,
        );
        b.register_with(
            RegisterSpec::new(KMAC_CFG_REGWEN).name("CFG_REGWEN").reset(1),
            FieldSpec::unmodeled(0, 1, "en"),
        );

        let cfg = b.register(RegisterSpec::new(KMAC_CFG).name("CFG"));
        let kmac_en = b.field(cfg, FieldSpec::flag(0, "kmac_en"));
        let strength = b.field(cfg, FieldSpec::value(1, 3, "kstrength"));
        let mode = b.field(cfg, FieldSpec::value(4, 2, "mode"));
        b.field(cfg, FieldSpec::unmodeled(8, 1, "msg_endianness"));
        b.field(cfg, FieldSpec::unmodeled(9, 1, "state_endianness"));
        let sideload = b.field(cfg, FieldSpec::flag(12, "sideload"));
        b.field(cfg, FieldSpec::unmodeled(16, 2, "entropy_mode"));
        for (bit, name) in [
            (19, "entropy_fast_process"),
            (20, "msg_mask"),
            (24, "entropy_ready"),
            (25, "err_processed"),
            (26, "en_unsupported_modestrength"),
        ] {
            b.field(cfg, FieldSpec::unmodeled(bit, 1, name));
        }

        let cmd = b.register(RegisterSpec::new(KMAC_CMD).name("CMD"));
        b.field(
            cmd,
            FieldSpec::value(0, 6, "cmd")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::Command),
        );
        for (bit, name) in [(8, "entropy_req"), (9, "hash_cnt_clr"), (10, "err_processed")] {
            b.field(cmd, FieldSpec::unmodeled(bit, 1, name));
        }

        let status = b.register(RegisterSpec::new(KMAC_STATUS).name("STATUS").reset(0x4001));
        for (bit, name, action) in [
            (0, "sha3_idle", Action::Idle),
            (1, "sha3_absorb", Action::Absorb),
            (2, "sha3_squeeze", Action::Squeeze),
            (14, "fifo_empty", Action::FifoEmpty),
            (15, "fifo_full", Action::FifoFull),
        ] {
            b.field(
                status,
                FieldSpec::flag(bit, name)
                    .mode(FieldMode::ReadOnly)
                    .on_read(action),
            );
        }
        b.field(
            status,
            FieldSpec::value(8, 5, "fifo_depth")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::FifoDepth),
        );

        for (offset, name) in [
            (0x20, "ENTROPY_PERIOD"),
            (0x24, "ENTROPY_REFRESH_HASH_CNT"),
            (0x28, "ENTROPY_REFRESH_THRESHOLD"),
            (0x2C, "ENTROPY_SEED_0"),
            (0x30, "ENTROPY_SEED_1"),
            (0x34, "ENTROPY_SEED_2"),
            (0x38, "ENTROPY_SEED_3"),
            (0x3C, "ENTROPY_SEED_4"),
        ] {
            b.register_with(
                RegisterSpec::new(offset).name(name),
                FieldSpec::unmodeled(0, 32, name),
            );
        }

        let share0 = std::array::from_fn(|i| {
            b.register_with(
                RegisterSpec::new(KMAC_KEY_SHARE0 + i as u64 * 4).name("KEY_SHARE0"),
                FieldSpec::value(0, 32, "key").mode(FieldMode::WriteOnly),
            )
        });
        let share1 = std::array::from_fn(|i| {
            b.register_with(
                RegisterSpec::new(KMAC_KEY_SHARE1 + i as u64 * 4).name("KEY_SHARE1"),
                FieldSpec::value(0, 32, "key").mode(FieldMode::WriteOnly),
            )
        });
        let key_len = b.register_with(
            RegisterSpec::new(KMAC_KEY_LEN).name("KEY_LEN"),
            FieldSpec::value(0, 3, "len"),
        );
        let prefix = std::array::from_fn(|i| {
            b.register(RegisterSpec::new(KMAC_PREFIX0 + i as u64 * 4).name("PREFIX"))
        });
        let err_code = b.register_with(
            RegisterSpec::new(KMAC_ERR_CODE).name("ERR_CODE"),
            FieldSpec::value(0, 32, "err_code").mode(FieldMode::ReadOnly),
        );

        let regs = b.build()?;
        let fields = Fields {
            kmac_en,
            strength,
            mode,
            sideload,
            share0: share0.map(|field| regs.field_register(field)),
            share1: share1.map(|field| regs.field_register(field)),
            key_len,
            prefix,
            err_code,
        };
        let mut kmac = Self {
            regs,
            fields,
            irqs,
            alerts,
            sideload_key: None,
            phase: Phase::Idle,
            previous: KmacCommand::Done,
            hasher: None,
            squeezer: None,
            fifo: Vec::new(),
            state: vec![0; KMAC_STATE_BYTES],
        };
        if let Some(key) = config.sideload_key {
            kmac.set_sideload_key(&key)?;
        }
        Ok(kmac)
    }

    /// Installs the key used while `CFG.sideload` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] unless `key` is 64 bytes.
    pub fn set_sideload_key(&mut self, key: &[u8]) -> Result<(), ConfigError> {
        if key.len() != KMAC_SIDELOAD_KEY_BYTES {
            return Err(ConfigError::InvalidArgument {
                name: "sideload_key",
                reason: format!(
                    "expected {KMAC_SIDELOAD_KEY_BYTES} bytes, got {}",
                    key.len()
                ),
            });
        }
        self.sideload_key = Some(key.to_vec());
        Ok(())
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

    /// Current `ERR_CODE` value.
    #[must_use]
    pub fn error_code(&self) -> u64 {
        self.regs.value(self.fields.err_code)
    }

    /// Output state as currently visible in the STATE window.
    #[must_use]
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    fn fail(&mut self, error: KmacError, info: u64) {
        let code = error.code(info);
        warn!(?error, "kmac error {code:#x}");
        self.regs.set_value(self.fields.err_code, code);
        self.irqs.raise(&mut self.regs, KMAC_IRQ_ERR);
    }

    fn strength_bits(&self) -> Option<usize> {
        match self.regs.value(self.fields.strength) {
            0 => Some(128),
            1 => Some(224),
            2 => Some(256),
            3 => Some(384),
            4 => Some(512),
            _ => None,
        }
    }

    fn prefix(&self) -> Vec<u8> {
        self.fields
            .prefix
            .iter()
            .flat_map(|&register| {
                #[allow(clippy::cast_possible_truncation)]
                let word = self.regs.register_value(register) as u32;
                word.to_le_bytes()
            })
            .collect()
    }

    fn decode_prefix(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let prefix = self.prefix();
        let (name, rest) = decode_string(&prefix)?;
        let (custom, _) = decode_string(rest)?;
        Some((name.to_vec(), custom.to_vec()))
    }

    fn key(&self) -> Option<Vec<u8>> {
        let len = match self.regs.value(self.fields.key_len) {
            0 => 16,
            1 => 24,
            2 => 32,
            3 => 48,
            4 => 64,
            other => {
                warn!("key length set to reserved value {other:#x}");
                return None;
            }
        };
        if self.regs.flag(self.fields.sideload) {
            return self.sideload_key.as_ref().map(|key| key[..len].to_vec());
        }
        let share = |registers: &[RegisterId; 16]| -> Vec<u8> {
            registers
                .iter()
                .flat_map(|&register| {
                    #[allow(clippy::cast_possible_truncation)]
                    let word = self.regs.register_value(register) as u32;
                    word.to_le_bytes()
                })
                .collect()
        };
        let key = share(&self.fields.share0)
            .iter()
            .zip(share(&self.fields.share1))
            .map(|(a, b)| a ^ b)
            .take(len)
            .collect();
        Some(key)
    }

    fn publish(&mut self, block: &[u8]) {
        self.state.fill(0);
        let len = block.len().min(KMAC_STATE_BYTES);
        self.state[..len].copy_from_slice(&block[..len]);
    }

    fn sequence_ok(&self, command: KmacCommand) -> bool {
        match command {
            KmacCommand::Start => self.previous == KmacCommand::Done,
            KmacCommand::Process => self.previous == KmacCommand::Start,
            KmacCommand::Run | KmacCommand::Done => {
                matches!(self.previous, KmacCommand::Process | KmacCommand::Run)
            }
        }
    }

    fn command(&mut self, value: u64) {
        if value == 0 {
            return;
        }
        let Some(command) = KmacCommand::from_bits(value) else {
            warn!("incorrect kmac command {value:#x}");
            return;
        };
        if !self.sequence_ok(command) {
            self.fail(KmacError::SwCmdSequence, command as u64);
            return;
        }
        debug!(?command, "kmac command");
        self.previous = command;
        match command {
            KmacCommand::Start => self.start(),
            KmacCommand::Process => self.process(),
            KmacCommand::Run => self.run(),
            KmacCommand::Done => {
                self.hasher = None;
                self.squeezer = None;
                self.phase = Phase::Idle;
                self.state.fill(0);
            }
        }
    }

    fn start(&mut self) {
        self.hasher = None;
        self.squeezer = None;
        self.phase = Phase::Absorb;

        let kmac = self.regs.flag(self.fields.kmac_en);
        let mode = if kmac { 2 } else { self.regs.value(self.fields.mode) };
        let bits = match (mode, self.strength_bits()) {
            (0, Some(bits @ (224 | 256 | 384 | 512))) | (1 | 2, Some(bits @ (128 | 256))) => bits,
            _ => {
                self.fail(KmacError::UnexpectedModeStrength, 0);
                return;
            }
        };
        self.hasher = match mode {
            0 => Some(Hasher::Sha3 { bits }),
            1 => Some(Hasher::Shake { bits }),
            _ => match self.decode_prefix() {
                Some((name, custom)) if kmac && name == b"KMAC" => Some(Hasher::Kmac { bits, custom }),
                Some((name, custom)) if !kmac => Some(Hasher::CShake { bits, name, custom }),
                None if !kmac => {
                    warn!("unexpected prefix value for cSHAKE");
                    None
                }
                _ => {
                    self.fail(KmacError::IncorrectFunctionName, 0);
                    None
                }
            },
        };
    }

    fn process(&mut self) {
        let data = std::mem::take(&mut self.fifo);
        self.phase = Phase::Squeeze;
        let block = match self.hasher.clone() {
            Some(hasher) => self.first_block(hasher, &data),
            None => {
                warn!("process issued after failed initialization");
                Vec::new()
            }
        };
        self.publish(&block);
        self.irqs.raise(&mut self.regs, KMAC_IRQ_DONE);
    }

    fn first_block(&mut self, hasher: Hasher, data: &[u8]) -> Vec<u8> {
        let rate = hasher.rate();
        match hasher {
            Hasher::Sha3 { bits } => sha3_digest(bits, data),
            Hasher::Shake { bits: 128 } => {
                self.squeeze_first(absorb(Shake128::default(), &[data]), None, rate)
            }
            Hasher::Shake { .. } => {
                self.squeeze_first(absorb(Shake256::default(), &[data]), None, rate)
            }
            Hasher::CShake { bits, name, custom } => {
                self.squeeze_first(cshake(bits, &name, &custom, &[data]), None, rate)
            }
            Hasher::Kmac { bits, custom } => self.kmac_first(bits, &custom, rate, data),
        }
    }

    fn kmac_first(&mut self, bits: usize, custom: &[u8], rate: usize, data: &[u8]) -> Vec<u8> {
        let Some((_, output_bits)) = split_right_encoded(data) else {
            warn!("kmac message lacks an output length trailer");
            return Vec::new();
        };
        let Some(key) = self.key() else {
            self.fail(KmacError::KeyNotValid, 0);
            return Vec::new();
        };
        let header = bytepad(&encode_string(&key), rate);
        let reader = cshake(bits, b"KMAC", custom, &[&header, data]);
        let remaining =
            (output_bits != 0).then(|| usize::try_from(output_bits / 8).unwrap_or(usize::MAX));
        self.squeeze_first(reader, remaining, rate)
    }

    fn squeeze_first(
        &mut self,
        reader: Box<dyn XofReader>,
        remaining: Option<usize>,
        rate: usize,
    ) -> Vec<u8> {
        let mut squeezer = Squeezer {
            reader,
            remaining,
            rate,
        };
        let block = squeezer.next_block();
        self.squeezer = Some(squeezer);
        block
    }

    fn run(&mut self) {
        if matches!(self.hasher, Some(Hasher::Sha3 { .. })) {
            self.fail(KmacError::SwCmdSequence, KmacCommand::Run as u64);
            return;
        }
        let block = match &mut self.squeezer {
            Some(squeezer) if !squeezer.is_exhausted() => squeezer.next_block(),
            _ => {
                warn!("no output available for run command");
                Vec::new()
            }
        };
        self.publish(&block);
    }

    fn push(&mut self, width: AccessWidth, value: u64) {
        let mut bytes = &value.to_le_bytes()[..usize::from(width.bytes())];
        if self.phase != Phase::Absorb {
            let room = FIFO_MAX_BYTES.saturating_sub(self.fifo.len());
            if bytes.len() > room {
                warn!("kmac fifo full, dropping {} bytes", bytes.len() - room);
                bytes = &bytes[..room];
            }
        }
        self.fifo.extend_from_slice(bytes);
    }

    fn read_state(&self, offset: u64, width: AccessWidth) -> u64 {
        if offset >= KMAC_STATE_MASK {
            return 0;
        }
        let start = usize::try_from(offset - KMAC_STATE).unwrap_or(usize::MAX);
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().take(usize::from(width.bytes())).enumerate() {
            *byte = self.state.get(start + i).copied().unwrap_or(0);
        }
        u64::from_le_bytes(bytes)
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::Irq => self.irqs.update(&self.regs),
            Action::IrqTest => self.irqs.test(&mut self.regs, effect.new),
            Action::AlertTest => self.alerts.test(effect.new),
            Action::Command => self.command(effect.new),
            _ => {}
        }
    }
}

impl BusPeripheral for Kmac {
    fn size(&self) -> u64 {
        KMAC_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.irqs.reset();
        self.alerts.reset();
        self.phase = Phase::Idle;
        self.previous = KmacCommand::Done;
        self.hasher = None;
        self.squeezer = None;
        self.fifo.clear();
        self.state.fill(0);
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        if (KMAC_STATE..KMAC_STATE_MASK + 0x100).contains(&offset) {
            return self.read_state(offset, width);
        }
        if (KMAC_FIFO..KMAC_SIZE).contains(&offset) {
            warn!("kmac fifo window read at {offset:#x}, returning 0");
            return 0;
        }
        let phase = self.phase;
        let len = self.fifo.len() as u64;
        self.regs.read_sized_with(offset, width, |action, _| {
            let absorbing = phase == Phase::Absorb;
            Some(match action {
                Action::Idle => u64::from(phase == Phase::Idle),
                Action::Absorb => u64::from(absorbing),
                Action::Squeeze => u64::from(phase == Phase::Squeeze),
                Action::FifoDepth if absorbing => 0,
                Action::FifoDepth => len / 8,
                Action::FifoEmpty => u64::from(len == 0 || absorbing),
                Action::FifoFull => u64::from(len >= FIFO_MAX_BYTES as u64),
                _ => return None,
            })
        })
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) {
        if (KMAC_STATE..KMAC_STATE_MASK + 0x100).contains(&offset) {
            debug!("kmac state window write at {offset:#x} ignored");
            return;
        }
        if (KMAC_FIFO..KMAC_SIZE).contains(&offset) {
            if width == AccessWidth::QuadWord {
                warn!("kmac fifo push wider than a word at {offset:#x} dropped");
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

    const SHA3: u32 = 0;
    const SHAKE: u32 = 1 << 4;

    fn kmac() -> Kmac {
        Kmac::new(KmacConfig::default()).unwrap()
    }

    fn cmd(kmac: &mut Kmac, command: KmacCommand) {
        kmac.write_u32(KMAC_CMD, command as u32);
    }

    #[test]
    fn sha3_256_of_abc() {
        let mut k = kmac();
        k.write_u32(KMAC_CFG, SHA3 | (2 << 1));
        cmd(&mut k, KmacCommand::Start);
        assert_eq!(k.read_u32(KMAC_STATUS) & 0b111, 0b010);
        for &byte in b"abc" {
            k.write_u8(KMAC_FIFO, byte);
        }
        cmd(&mut k, KmacCommand::Process);
        assert_eq!(k.read_u32(KMAC_STATE), 0xa75d_983a);
        assert_eq!(k.read_u32(KMAC_STATE + 28), 0x3215_4311);
        assert_eq!(k.read_u32(KMAC_STATE + 32), 0);
        assert_eq!(k.read_u32(KMAC_STATUS) & 0b111, 0b100);
        assert_eq!(k.error_code(), 0);
    }

    #[test]
    fn start_requires_previous_done() {
        let mut k = kmac();
        k.write_u32(KMAC_CFG, SHA3 | (2 << 1));
        cmd(&mut k, KmacCommand::Start);
        cmd(&mut k, KmacCommand::Start);
        assert_eq!(k.error_code(), 0x0800_001D);
        assert!(k.irqs.is_pending(&k.regs, KMAC_IRQ_ERR));
        cmd(&mut k, KmacCommand::Process);
        assert_eq!(k.read_u32(KMAC_STATUS) & 0b111, 0b100);
    }

    #[test]
    fn run_in_sha3_mode_is_an_error() {
        let mut k = kmac();
        k.write_u32(KMAC_CFG, SHA3 | (2 << 1));
        cmd(&mut k, KmacCommand::Start);
        cmd(&mut k, KmacCommand::Process);
        cmd(&mut k, KmacCommand::Run);
        assert_eq!(k.error_code(), 0x0800_0031);
    }

    #[test]
    fn run_before_start_sets_sticky_error_and_line() {
        let mut k = kmac();
        k.write_u32(KMAC_INTR_ENABLE, 0b111);
        cmd(&mut k, KmacCommand::Run);
        assert_eq!(k.read_u32(KMAC_ERR_CODE), 0x0800_0031);
        assert_eq!(k.line_level("kmac_err"), Some(true));
        cmd(&mut k, KmacCommand::Done);
        assert_eq!(k.read_u32(KMAC_ERR_CODE), 0x0800_0016);
        assert_eq!(k.line_level("kmac_err"), Some(true));
    }

    #[test]
    fn ordered_shake_commands_raise_no_error() {
        let mut k = kmac();
        k.write_u32(KMAC_INTR_ENABLE, 0b111);
        k.write_u32(KMAC_CFG, SHAKE);
        cmd(&mut k, KmacCommand::Start);
        cmd(&mut k, KmacCommand::Process);
        cmd(&mut k, KmacCommand::Run);
        assert_eq!(k.read_u32(KMAC_ERR_CODE), 0);
        assert_eq!(k.line_level("kmac_err"), Some(false));
        assert_eq!(k.line_level("kmac_done"), Some(true));
    }

    #[test]
    fn shake_squeezes_fresh_blocks() {
        let mut k = kmac();
        k.write_u32(KMAC_CFG, SHAKE);
        cmd(&mut k, KmacCommand::Start);
        cmd(&mut k, KmacCommand::Process);
        // SHAKE128("") begins 7f9c2ba4
        assert_eq!(k.read_u32(KMAC_STATE), 0xa42b_9c7f);
        let first = k.state().to_vec();
        cmd(&mut k, KmacCommand::Run);
        assert_ne!(first, k.state());
        assert_eq!(k.state()[168..], [0u8; 32]);
    }

    #[test]
    fn unsupported_strength_sets_error_but_absorbs() {
        let mut k = kmac();
        k.write_u32(KMAC_CFG, SHA3);
        cmd(&mut k, KmacCommand::Start);
        assert_eq!(k.error_code() >> 24, KmacError::UnexpectedModeStrength as u64);
        assert_eq!(k.read_u32(KMAC_STATUS) & 0b111, 0b010);
    }

    #[test]
    fn fifo_is_capped_outside_absorb() {
        let mut k = kmac();
        for _ in 0..20 {
            k.write_u32(KMAC_FIFO, 0xFFFF_FFFF);
        }
        assert_eq!(k.fifo.len(), 72);
        assert_eq!((k.read_u32(KMAC_STATUS) >> 15) & 1, 1);
        assert_eq!((k.read_u32(KMAC_STATUS) >> 8) & 0x1F, 9);
    }

    #[test]
    fn fifo_takes_the_bytes_that_fit() {
        let mut k = kmac();
        for byte in 0..71u8 {
            k.write_u8(KMAC_FIFO, byte);
        }
        k.write_u32(KMAC_FIFO, 0xDDCC_BBAA);
        assert_eq!(k.fifo.len(), 72);
        assert_eq!(k.fifo[70..], [70, 0xAA]);
    }

    #[test]
    fn sideload_key_length_is_checked() {
        let err = Kmac::new(KmacConfig {
            sideload_key: Some(vec![0; 32]),
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArgument { name: "sideload_key", .. }));
        assert!(Kmac::new(KmacConfig {
            sideload_key: Some(vec![0; 64]),
        })
        .is_ok());
    }

    #[test]
    fn command_decoding() {
        assert_eq!(KmacCommand::from_bits(0x2E), Some(KmacCommand::Process));
        assert_eq!(KmacCommand::from_bits(0x3F), None);
        assert_eq!(KmacError::SwCmdSequence.code(0x31), 0x0800_0031);
    }
}
