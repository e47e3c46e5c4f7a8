//! Cryptographically secure random number generator with a command interface.
//!
//! Software drives the generator through `CMD_REQ`: a command header followed
//! by `clen` words of additional data. Generated words are read one at a time
//! from `GENBITS`. A second, hardware-facing instance serves the entropy
//! distribution network through [`Csrng::submit_command`] and
//! [`Csrng::request_data`].

use std::fmt;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BoundedFifo, BusPeripheral,
    Collaborator, ConfigError, FieldId, FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterId,
    RegisterSpec, WriteEffect,
};
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::entropy_src::{EntropyProvider, SEED_WORDS};
use crate::irq::{AlertBlock, InterruptBlock};
use crate::multibit::{MultiBitBool4, UnknownEncoding};

/// Interrupt state register.
pub const CSRNG_INTR_STATE: u64 = 0x00;
/// Interrupt enable register.
pub const CSRNG_INTR_ENABLE: u64 = 0x04;
/// Interrupt test register.
pub const CSRNG_INTR_TEST: u64 = 0x08;
/// Alert test register.
pub const CSRNG_ALERT_TEST: u64 = 0x0C;
/// Register write enable.
pub const CSRNG_REGWEN: u64 = 0x10;
/// Control register.
pub const CSRNG_CTRL: u64 = 0x14;
/// Command request port.
pub const CSRNG_CMD_REQ: u64 = 0x18;
/// Command status.
pub const CSRNG_CMD_STS: u64 = 0x1C;
/// Generated bits valid.
pub const CSRNG_GENBITS_VLD: u64 = 0x20;
/// Generated bits read port.
pub const CSRNG_GENBITS: u64 = 0x24;
/// Hardware instance exception status.
pub const CSRNG_HW_EXC_STS: u64 = 0x30;
/// Error code.
pub const CSRNG_ERR_CODE: u64 = 0x38;
/// Error code test.
pub const CSRNG_ERR_CODE_TEST: u64 = 0x3C;
/// Window length.
pub const CSRNG_SIZE: u64 = 0x1000;

/// Interrupt index of `cs_cmd_req_done`.
pub const CSRNG_IRQ_CMD_REQ_DONE: usize = 0;
/// Interrupt index of `cs_entropy_req`.
pub const CSRNG_IRQ_ENTROPY_REQ: usize = 1;
/// Interrupt index of `cs_hw_inst_exc`.
pub const CSRNG_IRQ_HW_INST_EXC: usize = 2;
/// Interrupt index of `cs_fatal_err`.
pub const CSRNG_IRQ_FATAL_ERR: usize = 3;

/// Words produced per generate unit (128 bits).
pub const WORDS_PER_UNIT: usize = 4;

const OUTPUT_DEPTH: usize = 0x1FFF * WORDS_PER_UNIT;

/// Application commands carried in bits 0..4 of a command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum CsrngCommand {
    /// Seed a fresh DRBG instance.
    Instantiate = 1,
    /// Reseed an existing instance.
    Reseed = 2,
    /// Produce `glen` units of output.
    Generate = 3,
    /// Mix additional data into the instance.
    Update = 4,
    /// Destroy the instance.
    Uninstantiate = 5,
}

impl TryFrom<u64> for CsrngCommand {
    type Error = UnknownEncoding;

    fn try_from(value: u64) -> Result<Self, UnknownEncoding> {
        Ok(match value {
            1 => Self::Instantiate,
            2 => Self::Reseed,
            3 => Self::Generate,
            4 => Self::Update,
            5 => Self::Uninstantiate,
            _ => {
                return Err(UnknownEncoding {
                    kind: "csrng command",
                    value,
                })
            }
        })
    }
}

/// Decoded command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Application command.
    pub command: CsrngCommand,
    /// Number of additional data words that follow the header.
    pub clen: usize,
    /// Command flags; flag 0 skips the entropy source.
    pub flags: u8,
    /// Generate length in 128-bit units.
    pub glen: usize,
}

impl CommandHeader {
    /// Decodes `acmd[3:0] clen[7:4] flags[11:8] glen[24:12]`.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownEncoding`] for an unknown application command.
    pub fn decode(word: u32) -> Result<Self, UnknownEncoding> {
        let command = CsrngCommand::try_from(u64::from(word & 0xF))?;
        #[allow(clippy::cast_possible_truncation)]
        let flags = ((word >> 8) & 0xF) as u8;
        Ok(Self {
            command,
            clen: ((word >> 4) & 0xF) as usize,
            flags,
            glen: ((word >> 12) & 0x1FFF) as usize,
        })
    }

    /// Encodes the header back into a command word.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn encode(&self) -> u32 {
        (self.command as u32)
            | ((self.clen as u32 & 0xF) << 4)
            | ((self.flags as u32 & 0xF) << 8)
            | ((self.glen as u32 & 0x1FFF) << 12)
    }

    const fn skips_entropy(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// How generated words are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum CsrngMode {
    /// DRBG seeded from the entropy provider and additional data.
    #[default]
    PseudoRandom,
    /// DRBG seeded from the configured seed only; output repeats across runs.
    FixedSeed,
    /// Output is the configured word list, repeated.
    FixedData,
}

/// Configuration for [`Csrng`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CsrngConfig {
    /// Output mode.
    pub mode: CsrngMode,
    /// Seed for `FixedSeed` mode and for the fallback noise stream.
    pub seed: u64,
    /// Words returned in `FixedData` mode.
    pub fixed_data: Vec<u32>,
}

impl Default for CsrngConfig {
    fn default() -> Self {
        Self {
            mode: CsrngMode::PseudoRandom,
            seed: 0xC5,
            fixed_data: Vec::new(),
        }
    }
}

/// Result of handing one word to a command port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Header accepted, additional data still expected.
    Pending,
    /// Command executed.
    Completed,
    /// Command decoded but violated the instance life cycle.
    Failed,
    /// Generator disabled or header not decodable.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum App {
    Software,
    Hardware,
}

#[derive(Debug)]
struct Pending {
    header: CommandHeader,
    data: Vec<u32>,
}

struct Instance {
    drbg: Option<ChaCha20Rng>,
    output: BoundedFifo<u32>,
    pending: Option<Pending>,
    cursor: usize,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("instantiated", &self.drbg.is_some())
            .field("output", &self.output.len())
            .field("pending", &self.pending)
            .finish()
    }
}

impl Instance {
    fn new() -> Self {
        Self {
            drbg: None,
            output: BoundedFifo::new(OUTPUT_DEPTH),
            pending: None,
            cursor: 0,
        }
    }

    fn clear(&mut self) {
        self.drbg = None;
        self.output.clear();
        self.pending = None;
        self.cursor = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Irq,
    IrqTest,
    AlertTest,
    Ctrl,
    CmdReq,
    GenbitsValid,
    GenbitsFips,
    Genbits,
    ErrCodeTest,
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    regwen: FieldId,
    ctrl: RegisterId,
    enable: FieldId,
    sw_app_enable: FieldId,
    cmd_sts: FieldId,
    hw_exc: FieldId,
    cmd_err: FieldId,
    err_code: RegisterId,
}

/// Command-driven DRBG with a software and a hardware instance.
#[derive(Debug)]
pub struct Csrng {
    config: CsrngConfig,
    regs: RegisterBank<Action>,
    fields: Fields,
    irqs: InterruptBlock,
    alerts: AlertBlock,
    entropy: Collaborator<dyn EntropyProvider>,
    noise: ChaCha20Rng,
    software: Instance,
    hardware: Instance,
}

impl Csrng {
    /// Creates the generator in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] when fixed-data mode has no
    /// data, or [`ConfigError`] if the register layout is rejected.
    pub fn new(config: CsrngConfig) -> Result<Self, ConfigError> {
        if config.mode == CsrngMode::FixedData && config.fixed_data.is_empty() {
            return Err(ConfigError::InvalidArgument {
                name: "fixed_data",
                reason: String::from("fixed-data mode needs at least one word"),
            });
        }
        let mut b = BankBuilder::new(BankConfig::named("csrng"));
        let irqs = InterruptBlock::declare(
            &mut b,
            CSRNG_INTR_STATE,
            &[
                "cs_cmd_req_done",
                "cs_entropy_req",
                "cs_hw_inst_exc",
                "cs_fatal_err",
            ],
            Action::Irq,
            Action::IrqTest,
        );
        let alerts = AlertBlock::declare(
            &mut b,
            CSRNG_ALERT_TEST,
            &["recov_alert", "fatal_alert"],
            Action::AlertTest,
        );

        let regwen = b.register_with(
            RegisterSpec::new(CSRNG_REGWEN).name("REGWEN").reset(1),
            FieldSpec::flag(0, "REGWEN").mode(FieldMode::WriteZeroToClear),
        );
        let ctrl = b.register(
            RegisterSpec::new(CSRNG_CTRL)
                .name("CTRL")
                .reset(0x999)
                .on_write(Action::Ctrl),
        );
        let enable = b.field(ctrl, FieldSpec::value(0, 4, "ENABLE"));
        let sw_app_enable = b.field(ctrl, FieldSpec::value(4, 4, "SW_APP_ENABLE"));
        b.field(ctrl, FieldSpec::unmodeled(8, 4, "READ_INT_STATE"));

        b.register_with(
            RegisterSpec::new(CSRNG_CMD_REQ).name("CMD_REQ"),
            FieldSpec::value(0, 32, "CMD_REQ")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::CmdReq),
        );
        let sts = b.register(RegisterSpec::new(CSRNG_CMD_STS).name("CMD_STS").reset(1));
        b.field(sts, FieldSpec::flag(0, "CMD_RDY").mode(FieldMode::ReadOnly));
        let cmd_sts = b.field(sts, FieldSpec::flag(1, "CMD_STS").mode(FieldMode::ReadOnly));

        let vld = b.register(RegisterSpec::new(CSRNG_GENBITS_VLD).name("GENBITS_VLD"));
        b.field(
            vld,
            FieldSpec::flag(0, "GENBITS_VLD")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::GenbitsValid),
        );
        b.field(
            vld,
            FieldSpec::flag(1, "GENBITS_FIPS")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::GenbitsFips),
        );
        b.register_with(
            RegisterSpec::new(CSRNG_GENBITS).name("GENBITS"),
            FieldSpec::value(0, 32, "GENBITS")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::Genbits),
        );
        for (offset, name) in [
            (0x28, "INT_STATE_NUM"),
            (0x2C, "INT_STATE_VAL"),
        ] {
            b.register_with(
                RegisterSpec::new(offset).name(name),
                FieldSpec::unmodeled(0, 32, name),
            );
        }
        let hw_exc = b.register_with(
            RegisterSpec::new(CSRNG_HW_EXC_STS).name("HW_EXC_STS"),
            FieldSpec::value(0, 16, "HW_EXC_STS").mode(FieldMode::WriteZeroToClear),
        );
        b.register_with(
            RegisterSpec::new(0x34).name("RECOV_ALERT_STS"),
            FieldSpec::unmodeled(0, 16, "RECOV_ALERT_STS"),
        );
        let err_code = b.register(RegisterSpec::new(CSRNG_ERR_CODE).name("ERR_CODE"));
        let cmd_err = b.field(
            err_code,
            FieldSpec::flag(0, "SFIFO_CMD_ERR").mode(FieldMode::ReadOnly),
        );
        b.field(
            err_code,
            FieldSpec::value(1, 31, "ERR_CODE_OTHER").mode(FieldMode::ReadOnly),
        );
        b.register_with(
            RegisterSpec::new(CSRNG_ERR_CODE_TEST).name("ERR_CODE_TEST"),
            FieldSpec::value(0, 5, "ERR_CODE_TEST").on_write(Action::ErrCodeTest),
        );
        for (offset, name) in [(0x40, "SEL_TRACKING_SM"), (0x44, "TRACKING_SM_OBS")] {
            b.register_with(
                RegisterSpec::new(offset).name(name),
                FieldSpec::unmodeled(0, 32, name),
            );
        }

        Ok(Self {
            noise: ChaCha20Rng::seed_from_u64(config.seed),
            config,
            regs: b.build()?,
            fields: Fields {
                regwen,
                ctrl,
                enable,
                sw_app_enable,
                cmd_sts,
                hw_exc,
                cmd_err,
                err_code,
            },
            irqs,
            alerts,
            entropy: Collaborator::detached(),
            software: Instance::new(),
            hardware: Instance::new(),
        })
    }

    /// Wires the entropy source used by `Instantiate` and `Reseed`.
    pub fn set_entropy_source(&mut self, source: Collaborator<dyn EntropyProvider>) {
        self.entropy = source;
    }

    fn mubi(&self, field: FieldId) -> bool {
        MultiBitBool4::from_bits(self.regs.value(field)).is_true()
    }

    /// Whether `CTRL.ENABLE` holds the true encoding.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.mubi(self.fields.enable)
    }

    /// Whether the software instance has been instantiated.
    #[must_use]
    pub fn is_instantiated(&self) -> bool {
        self.software.drbg.is_some()
    }

    /// Words waiting in the software output buffer.
    #[must_use]
    pub fn available(&self) -> usize {
        self.software.output.len()
    }

    /// Interrupt line by name.
    #[must_use]
    pub fn irq(&self, name: &str) -> Option<&GpioLine> {
        self.irqs.line(name)
    }

    /// Hands one command word to the hardware instance.
    pub fn submit_command(&mut self, word: u32) -> CommandStatus {
        let status = self.command_word(App::Hardware, word);
        if status == CommandStatus::Failed {
            let bits = self.regs.value(self.fields.hw_exc);
            self.regs.set_value(self.fields.hw_exc, bits | 1);
            self.irqs.raise(&mut self.regs, CSRNG_IRQ_HW_INST_EXC);
        }
        status
    }

    /// Pops one generated word for the hardware instance along with the
    /// number of words still buffered.
    pub fn request_data(&mut self) -> Option<(u32, usize)> {
        if !self.is_enabled() {
            warn!("hardware data requested while disabled");
            return None;
        }
        let word = self.hardware.output.pop()?;
        Some((word, self.hardware.output.len()))
    }

    fn instance(&mut self, app: App) -> &mut Instance {
        match app {
            App::Software => &mut self.software,
            App::Hardware => &mut self.hardware,
        }
    }

    fn command_word(&mut self, app: App, word: u32) -> CommandStatus {
        if !self.is_enabled() {
            error!("csrng disabled, command {word:#x} ignored");
            return CommandStatus::Rejected;
        }
        let instance = self.instance(app);
        if let Some(mut pending) = instance.pending.take() {
            pending.data.push(word);
            if pending.data.len() < pending.header.clen {
                instance.pending = Some(pending);
                return CommandStatus::Pending;
            }
            return self.execute(app, pending.header, &pending.data);
        }
        let header = match CommandHeader::decode(word) {
            Ok(header) => header,
            Err(err) => {
                error!("{err}");
                self.regs.set_flag(self.fields.cmd_err, true);
                self.irqs.raise(&mut self.regs, CSRNG_IRQ_FATAL_ERR);
                return CommandStatus::Rejected;
            }
        };
        debug!(?app, ?header, "command");
        if header.clen > 0 {
            self.instance(app).pending = Some(Pending {
                header,
                data: Vec::with_capacity(header.clen),
            });
            return CommandStatus::Pending;
        }
        self.execute(app, header, &[])
    }

    fn execute(&mut self, app: App, header: CommandHeader, data: &[u32]) -> CommandStatus {
        let instantiated = self.instance(app).drbg.is_some();
        let ok = match header.command {
            CsrngCommand::Instantiate if instantiated => {
                warn!(?app, "instance already instantiated");
                false
            }
            CsrngCommand::Instantiate => {
                let seed = self.seed_material(header, data, None);
                let instance = self.instance(app);
                instance.drbg = Some(ChaCha20Rng::from_seed(seed));
                instance.cursor = 0;
                true
            }
            CsrngCommand::Reseed | CsrngCommand::Generate | CsrngCommand::Update
                if !instantiated =>
            {
                warn!(?app, command = ?header.command, "instance not instantiated");
                false
            }
            CsrngCommand::Reseed => {
                let state = self.drbg_state(app);
                let seed = self.seed_material(header, data, Some(state));
                self.instance(app).drbg = Some(ChaCha20Rng::from_seed(seed));
                true
            }
            CsrngCommand::Update => {
                let state = self.drbg_state(app);
                let mut hasher = Sha256::new();
                hasher.update(state);
                for word in data {
                    hasher.update(word.to_le_bytes());
                }
                self.instance(app).drbg = Some(ChaCha20Rng::from_seed(hasher.finalize().into()));
                true
            }
            CsrngCommand::Generate => {
                self.generate(app, header.glen * WORDS_PER_UNIT);
                true
            }
            CsrngCommand::Uninstantiate => {
                self.instance(app).clear();
                true
            }
        };
        if app == App::Software {
            self.regs.set_flag(self.fields.cmd_sts, !ok);
            self.irqs.raise(&mut self.regs, CSRNG_IRQ_CMD_REQ_DONE);
        }
        if ok {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        }
    }

    fn drbg_state(&mut self, app: App) -> [u8; 32] {
        let mut state = [0u8; 32];
        if let Some(drbg) = self.instance(app).drbg.as_mut() {
            drbg.fill_bytes(&mut state);
        }
        state
    }

    fn seed_material(
        &mut self,
        header: CommandHeader,
        data: &[u32],
        state: Option<[u8; 32]>,
    ) -> [u8; 32] {
        let mut hasher = Sha256::new();
        if let Some(state) = state {
            hasher.update(state);
        }
        match self.config.mode {
            CsrngMode::FixedSeed => hasher.update(self.config.seed.to_le_bytes()),
            CsrngMode::PseudoRandom | CsrngMode::FixedData if !header.skips_entropy() => {
                for word in self.entropy_seed() {
                    hasher.update(word.to_le_bytes());
                }
            }
            CsrngMode::PseudoRandom | CsrngMode::FixedData => {}
        }
        for word in data {
            hasher.update(word.to_le_bytes());
        }
        hasher.finalize().into()
    }

    fn entropy_seed(&mut self) -> [u32; SEED_WORDS] {
        self.irqs.raise(&mut self.regs, CSRNG_IRQ_ENTROPY_REQ);
        match self.entropy.call(|source| source.request_entropy()) {
            Ok(Some(seed)) => return seed,
            Ok(None) => warn!("entropy source returned no seed, using internal noise"),
            Err(err) => debug!("{err}, using internal noise"),
        }
        let mut seed = [0u32; SEED_WORDS];
        for word in &mut seed {
            *word = self.noise.next_u32();
        }
        seed
    }

    fn generate(&mut self, app: App, words: usize) {
        let fixed = (self.config.mode == CsrngMode::FixedData).then(|| self.config.fixed_data.clone());
        let instance = self.instance(app);
        for _ in 0..words {
            let word = match (&fixed, instance.drbg.as_mut()) {
                (Some(data), _) => {
                    let word = data[instance.cursor % data.len()];
                    instance.cursor = (instance.cursor + 1) % data.len();
                    word
                }
                (None, Some(drbg)) => drbg.next_u32(),
                (None, None) => 0,
            };
            if instance.output.try_push(word).is_err() {
                warn!(?app, "output buffer full, dropping generated words");
                break;
            }
        }
    }

    fn genbits(&mut self) -> u64 {
        if !self.mubi(self.fields.sw_app_enable) {
            error!("software application interface disabled");
            return 0;
        }
        self.software.output.pop().map_or_else(
            || {
                error!("no generated bits available, generate length mismatch?");
                0
            },
            u64::from,
        )
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::Irq => self.irqs.update(&self.regs),
            Action::IrqTest => self.irqs.test(&mut self.regs, effect.new),
            Action::AlertTest => self.alerts.test(effect.new),
            Action::Ctrl => {
                if !self.regs.flag(self.fields.regwen) {
                    warn!("CTRL is locked");
                    self.regs.set_register_value(self.fields.ctrl, effect.old);
                } else if !self.is_enabled() {
                    debug!("csrng disabled, dropping instances");
                    self.software.clear();
                    self.hardware.clear();
                }
            }
            Action::CmdReq => {
                #[allow(clippy::cast_possible_truncation)]
                let _ = self.command_word(App::Software, effect.new as u32);
            }
            Action::ErrCodeTest => {
                let raw = self.regs.register_value(self.fields.err_code);
                self.regs
                    .set_register_value(self.fields.err_code, raw | (1 << effect.new));
                self.irqs.raise(&mut self.regs, CSRNG_IRQ_FATAL_ERR);
            }
            Action::GenbitsValid | Action::GenbitsFips | Action::Genbits => {}
        }
    }
}

impl BusPeripheral for Csrng {
    fn size(&self) -> u64 {
        CSRNG_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.irqs.reset();
        self.alerts.reset();
        self.software.clear();
        self.hardware.clear();
        self.noise = ChaCha20Rng::seed_from_u64(self.config.seed);
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        let popped = (offset == CSRNG_GENBITS && self.regs.accepts(offset, width))
            .then(|| self.genbits());
        let valid = !self.software.output.is_empty();
        self.regs.read_sized_with(offset, width, |action, _| match action {
            Action::Genbits => popped,
            Action::GenbitsValid => Some(u64::from(valid)),
            Action::GenbitsFips => Some(1),
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

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use rstest::rstest;

    use super::*;
    use crate::entropy_src::{EntropySrc, EntropySrcConfig, ES_MODULE_ENABLE};

    const ENABLED: u32 = 0x966;

    fn header(command: CsrngCommand, clen: usize, flags: u8, glen: usize) -> u32 {
        CommandHeader {
            command,
            clen,
            flags,
            glen,
        }
        .encode()
    }

    fn enabled(config: CsrngConfig) -> Csrng {
        let mut csrng = Csrng::new(config).unwrap();
        csrng.write_u32(CSRNG_INTR_ENABLE, 0xF);
        csrng.write_u32(CSRNG_CTRL, ENABLED);
        csrng
    }

    #[rstest]
    #[case(0x0000_3001, CsrngCommand::Instantiate, 0, 0, 3)]
    #[case(0x0000_0113, CsrngCommand::Generate, 1, 1, 0)]
    #[case(0x01FF_F005, CsrngCommand::Uninstantiate, 0, 0, 0x1FFF)]
    fn header_decode(
        #[case] word: u32,
        #[case] command: CsrngCommand,
        #[case] clen: usize,
        #[case] flags: u8,
        #[case] glen: usize,
    ) {
        let decoded = CommandHeader::decode(word).unwrap();
        assert_eq!(decoded.command, command);
        assert_eq!(decoded.clen, clen);
        assert_eq!(decoded.flags, flags);
        assert_eq!(decoded.glen, glen);
        assert_eq!(decoded.encode(), word);
    }

    #[test]
    fn fixed_data_mode_repeats_words() {
        let mut csrng = enabled(CsrngConfig {
            mode: CsrngMode::FixedData,
            fixed_data: vec![1, 2, 3],
            ..CsrngConfig::default()
        });
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 0, 1, 0));
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Generate, 0, 0, 1));
        assert_eq!(csrng.read_u32(CSRNG_GENBITS_VLD), 0b11);
        let words: Vec<u32> = (0..4).map(|_| csrng.read_u32(CSRNG_GENBITS)).collect();
        assert_eq!(words, [1, 2, 3, 1]);
        assert_eq!(csrng.read_u32(CSRNG_GENBITS_VLD), 0b10);
        assert_eq!(csrng.read_u32(CSRNG_GENBITS), 0);
    }

    #[test]
    fn faulted_genbits_read_keeps_the_word() {
        let mut csrng = enabled(CsrngConfig {
            mode: CsrngMode::FixedData,
            fixed_data: vec![1, 2, 3, 4],
            ..CsrngConfig::default()
        });
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 0, 1, 0));
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Generate, 0, 0, 1));
        assert_eq!(csrng.read(CSRNG_GENBITS, AccessWidth::QuadWord), 0);
        assert_eq!(csrng.read(CSRNG_GENBITS + 2, AccessWidth::DoubleWord), 0);
        assert_eq!(csrng.read_u32(CSRNG_GENBITS_VLD), 0b11);
        let words: Vec<u32> = (0..4).map(|_| csrng.read_u32(CSRNG_GENBITS)).collect();
        assert_eq!(words, [1, 2, 3, 4]);
    }

    #[test]
    fn fixed_data_mode_needs_data() {
        let config = CsrngConfig {
            mode: CsrngMode::FixedData,
            ..CsrngConfig::default()
        };
        assert!(matches!(
            Csrng::new(config),
            Err(ConfigError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let run = || {
            let mut csrng = enabled(CsrngConfig {
                mode: CsrngMode::FixedSeed,
                ..CsrngConfig::default()
            });
            csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 0, 0, 0));
            csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Generate, 0, 0, 2));
            (0..8).map(|_| csrng.read_u32(CSRNG_GENBITS)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn generate_before_instantiate_fails() {
        let mut csrng = enabled(CsrngConfig::default());
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Generate, 0, 0, 1));
        assert_eq!(csrng.read_u32(CSRNG_CMD_STS), 0b11);
        assert!(csrng.irq("cs_cmd_req_done").unwrap().is_set());
        assert_eq!(csrng.available(), 0);
    }

    #[test]
    fn double_instantiate_fails() {
        let mut csrng = enabled(CsrngConfig::default());
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 0, 0, 0));
        assert_eq!(csrng.read_u32(CSRNG_CMD_STS), 0b01);
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 0, 0, 0));
        assert_eq!(csrng.read_u32(CSRNG_CMD_STS), 0b11);
    }

    #[test]
    fn unknown_command_is_fatal() {
        let mut csrng = enabled(CsrngConfig::default());
        csrng.write_u32(CSRNG_CMD_REQ, 0xF);
        assert_eq!(csrng.read_u32(CSRNG_ERR_CODE) & 1, 1);
        assert!(csrng.irq("cs_fatal_err").unwrap().is_set());
    }

    #[test]
    fn additional_data_is_consumed_before_execution() {
        let mut csrng = enabled(CsrngConfig::default());
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 2, 1, 0));
        assert!(!csrng.is_instantiated());
        csrng.write_u32(CSRNG_CMD_REQ, 0xAAAA_AAAA);
        assert!(!csrng.is_instantiated());
        csrng.write_u32(CSRNG_CMD_REQ, 0x5555_5555);
        assert!(csrng.is_instantiated());
    }

    #[test]
    fn disabled_generator_ignores_commands() {
        let mut csrng = Csrng::new(CsrngConfig::default()).unwrap();
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 0, 0, 0));
        assert!(!csrng.is_instantiated());
    }

    #[test]
    fn genbits_need_software_app_enable() {
        let mut csrng = enabled(CsrngConfig::default());
        csrng.write_u32(CSRNG_CTRL, 0x996);
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 0, 0, 0));
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Generate, 0, 0, 1));
        assert_eq!(csrng.read_u32(CSRNG_GENBITS), 0);
        assert_eq!(csrng.available(), 4);
    }

    #[test]
    fn seeds_from_linked_entropy_source() {
        let source = Rc::new(RefCell::new(EntropySrc::new(EntropySrcConfig::default()).unwrap()));
        source.borrow_mut().write_u32(ES_MODULE_ENABLE, 0x6);
        let link: Rc<RefCell<dyn EntropyProvider>> = source;
        let mut csrng = enabled(CsrngConfig::default());
        csrng.set_entropy_source(Collaborator::new(&link));
        csrng.write_u32(CSRNG_CMD_REQ, header(CsrngCommand::Instantiate, 0, 0, 0));
        assert!(csrng.is_instantiated());
        assert!(csrng.irq("cs_entropy_req").unwrap().is_set());
    }

    #[test]
    fn hardware_instance_is_separate() {
        let mut csrng = enabled(CsrngConfig::default());
        assert_eq!(
            csrng.submit_command(header(CsrngCommand::Generate, 0, 0, 1)),
            CommandStatus::Failed
        );
        assert!(csrng.irq("cs_hw_inst_exc").unwrap().is_set());
        assert_eq!(
            csrng.submit_command(header(CsrngCommand::Instantiate, 0, 0, 0)),
            CommandStatus::Completed
        );
        assert!(!csrng.is_instantiated());
        csrng.submit_command(header(CsrngCommand::Generate, 0, 0, 1));
        assert_eq!(csrng.request_data().map(|(_, left)| left), Some(3));
    }
}
