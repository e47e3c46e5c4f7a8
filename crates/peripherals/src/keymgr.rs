//! Key manager: a one-way chain of working states, each holding a key.
//!
//! `CONTROL.START` runs the operation selected in `CONTROL.OPERATION`.
//! `Advance` steps the working state and replaces the internal key with a
//! one-way function of the old key, the revision seed and the sealing
//! binding. Generate operations derive a 256-bit output from the current
//! key and hand it out either as two XOR shares readable by software or as
//! a sideload key for a hardware consumer.
//!
//! In `Reset` only `Advance` is accepted; anything else is ignored. An
//! operation that is not legal in the current state sets
//! `ERR_CODE.INVALID_OP`, reports `DoneError` and pulses the recoverable
//! alert. Every completed operation raises `op_done`.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BusPeripheral, ConfigError, FieldId,
    FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterId, RegisterSpec, WriteEffect,
};
use sha3::{Digest, Sha3_256};
use tracing::{debug, warn};

use crate::irq::{AlertBlock, InterruptBlock};
use crate::multibit::UnknownEncoding;

/// Interrupt state register.
pub const KEYMGR_INTR_STATE: u64 = 0x00;
/// Interrupt enable register.
pub const KEYMGR_INTR_ENABLE: u64 = 0x04;
/// Interrupt test register.
pub const KEYMGR_INTR_TEST: u64 = 0x08;
/// Alert test register.
pub const KEYMGR_ALERT_TEST: u64 = 0x0C;
/// Configuration write enable.
pub const KEYMGR_CFG_REGWEN: u64 = 0x10;
/// Operation control register.
pub const KEYMGR_CONTROL: u64 = 0x14;
/// Sideload key clear selector.
pub const KEYMGR_SIDELOAD_CLEAR: u64 = 0x18;
/// Write enable for `RESEED_INTERVAL`, cleared by writing zero.
pub const KEYMGR_RESEED_INTERVAL_REGWEN: u64 = 0x1C;
/// Entropy reseed interval.
pub const KEYMGR_RESEED_INTERVAL: u64 = 0x20;
/// Write enable for the software bindings, cleared by writing zero.
pub const KEYMGR_SW_BINDING_REGWEN: u64 = 0x24;
/// First of eight sealing binding words.
pub const KEYMGR_SEALING_SW_BINDING0: u64 = 0x28;
/// First of eight attestation binding words.
pub const KEYMGR_ATTEST_SW_BINDING0: u64 = 0x48;
/// First of eight salt words.
pub const KEYMGR_SALT0: u64 = 0x68;
/// Key version used by generate operations.
pub const KEYMGR_KEY_VERSION: u64 = 0x88;
/// Write enable for `MAX_CREATOR_KEY_VER`.
pub const KEYMGR_MAX_CREATOR_KEY_VER_REGWEN: u64 = 0x8C;
/// Highest key version accepted in `CreatorRootKey`.
pub const KEYMGR_MAX_CREATOR_KEY_VER: u64 = 0x90;
/// Write enable for `MAX_OWNER_INT_KEY_VER`.
pub const KEYMGR_MAX_OWNER_INT_KEY_VER_REGWEN: u64 = 0x94;
/// Highest key version accepted in `OwnerIntermediateKey`.
pub const KEYMGR_MAX_OWNER_INT_KEY_VER: u64 = 0x98;
/// Write enable for `MAX_OWNER_KEY_VER`.
pub const KEYMGR_MAX_OWNER_KEY_VER_REGWEN: u64 = 0x9C;
/// Highest key version accepted in `OwnerKey`.
pub const KEYMGR_MAX_OWNER_KEY_VER: u64 = 0xA0;
/// First of eight words of software output share 0 (read-to-clear).
pub const KEYMGR_SW_SHARE0_OUTPUT0: u64 = 0xA4;
/// First of eight words of software output share 1 (read-to-clear).
pub const KEYMGR_SW_SHARE1_OUTPUT0: u64 = 0xC4;
/// Current working state.
pub const KEYMGR_WORKING_STATE: u64 = 0xE4;
/// Operation status.
pub const KEYMGR_OP_STATUS: u64 = 0xE8;
/// Error code.
pub const KEYMGR_ERR_CODE: u64 = 0xEC;
/// Fatal fault status.
pub const KEYMGR_FAULT_STATUS: u64 = 0xF0;
/// Window length.
pub const KEYMGR_SIZE: u64 = 0x1000;

/// Interrupt index of `op_done`.
pub const KEYMGR_IRQ_OP_DONE: usize = 0;

/// Bytes in the internal key, the revision seed and every derived output.
pub const KEYMGR_KEY_BYTES: usize = 32;

const ALERT_RECOV_OPERATION: usize = 1;
const WORDS: usize = KEYMGR_KEY_BYTES / 4;

/// Working states of the key chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkingState {
    /// Out of reset, no key loaded.
    Reset = 0,
    /// Root key loaded.
    Init = 1,
    /// Creator root key derived.
    CreatorRootKey = 2,
    /// Owner intermediate key derived.
    OwnerIntermediateKey = 3,
    /// Owner key derived.
    OwnerKey = 4,
    /// Chain terminated, key wiped.
    Disabled = 5,
    /// Fatal fault.
    Invalid = 6,
}

impl TryFrom<u64> for WorkingState {
    type Error = UnknownEncoding;

    fn try_from(value: u64) -> Result<Self, UnknownEncoding> {
        Ok(match value {
            0 => Self::Reset,
            1 => Self::Init,
            2 => Self::CreatorRootKey,
            3 => Self::OwnerIntermediateKey,
            4 => Self::OwnerKey,
            5 => Self::Disabled,
            6 => Self::Invalid,
            _ => {
                return Err(UnknownEncoding {
                    kind: "keymgr working state",
                    value,
                })
            }
        })
    }
}

impl WorkingState {
    const fn next(self) -> Self {
        match self {
            Self::Reset => Self::Init,
            Self::Init => Self::CreatorRootKey,
            Self::CreatorRootKey => Self::OwnerIntermediateKey,
            Self::OwnerIntermediateKey => Self::OwnerKey,
            Self::OwnerKey | Self::Disabled => Self::Disabled,
            Self::Invalid => Self::Invalid,
        }
    }

    // Index of the MAX_*_KEY_VER register bounding generate operations.
    const fn max_version_index(self) -> Option<usize> {
        match self {
            Self::CreatorRootKey => Some(0),
            Self::OwnerIntermediateKey => Some(1),
            Self::OwnerKey => Some(2),
            _ => None,
        }
    }
}

/// Operations selected by `CONTROL.OPERATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeymgrOperation {
    /// Step to the next working state.
    Advance = 0,
    /// Derive an identity value into the software shares.
    GenerateId = 1,
    /// Derive a key into the software shares.
    GenerateSwOutput = 2,
    /// Derive a key into the sideload slot of `CONTROL.DEST_SEL`.
    GenerateHwOutput = 3,
    /// Terminate the chain.
    Disable = 4,
}

impl TryFrom<u64> for KeymgrOperation {
    type Error = UnknownEncoding;

    fn try_from(value: u64) -> Result<Self, UnknownEncoding> {
        Ok(match value {
            0 => Self::Advance,
            1 => Self::GenerateId,
            2 => Self::GenerateSwOutput,
            3 => Self::GenerateHwOutput,
            4 => Self::Disable,
            _ => {
                return Err(UnknownEncoding {
                    kind: "keymgr operation",
                    value,
                })
            }
        })
    }
}

impl KeymgrOperation {
    const fn is_legal_in(self, state: WorkingState) -> bool {
        use WorkingState::{Disabled, Init, Invalid};
        match self {
            Self::Advance | Self::Disable => !matches!(state, Invalid | Disabled),
            Self::GenerateId | Self::GenerateSwOutput | Self::GenerateHwOutput => {
                !matches!(state, Invalid | Disabled | Init)
            }
        }
    }

    const fn label(self) -> &'static [u8] {
        match self {
            Self::GenerateId => b"keymgr-id",
            Self::GenerateHwOutput => b"keymgr-hw",
            Self::GenerateSwOutput | Self::Advance | Self::Disable => b"keymgr-sw",
        }
    }
}

/// `OP_STATUS` encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationStatus {
    /// No operation since the last clear.
    Idle = 0,
    /// Operation in progress.
    Busy = 1,
    /// Last operation succeeded.
    DoneSuccess = 2,
    /// Last operation failed.
    DoneError = 3,
}

impl TryFrom<u64> for OperationStatus {
    type Error = UnknownEncoding;

    fn try_from(value: u64) -> Result<Self, UnknownEncoding> {
        Ok(match value {
            0 => Self::Idle,
            1 => Self::Busy,
            2 => Self::DoneSuccess,
            3 => Self::DoneError,
            _ => {
                return Err(UnknownEncoding {
                    kind: "keymgr operation status",
                    value,
                })
            }
        })
    }
}

/// Hardware consumers of sideload keys, as encoded in `CONTROL.DEST_SEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyDestination {
    /// AES engine.
    Aes = 1,
    /// KMAC engine.
    Kmac = 2,
    /// Big-number accelerator.
    Otbn = 3,
}

impl KeyDestination {
    const fn from_bits(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Aes),
            2 => Some(Self::Kmac),
            3 => Some(Self::Otbn),
            _ => None,
        }
    }

    const fn slot(self) -> usize {
        self as usize - 1
    }
}

/// Configuration for [`Keymgr`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KeymgrConfig {
    /// Device revision seed mixed into every advance, 32 bytes.
    pub revision_seed: Vec<u8>,
    /// Seed of the root key and share masks.
    pub seed: u64,
}

impl Default for KeymgrConfig {
    fn default() -> Self {
        Self {
            revision_seed: (0..32).collect(),
            seed: 0x5EED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Irq,
    IrqTest,
    AlertTest,
    Start,
    SideloadClear,
    ReseedInterval,
    Binding,
    MaxVersion(usize),
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    operation: FieldId,
    cdi_sel: FieldId,
    dest_sel: FieldId,
    reseed_regwen: FieldId,
    reseed_interval: FieldId,
    binding_regwen: FieldId,
    sealing: [RegisterId; WORDS],
    attestation: [RegisterId; WORDS],
    salt: [RegisterId; WORDS],
    key_version: FieldId,
    max_version_regwen: [FieldId; 3],
    max_version: [FieldId; 3],
    share0: [RegisterId; WORDS],
    share1: [RegisterId; WORDS],
    working_state: FieldId,
    op_status: FieldId,
    invalid_op: FieldId,
    invalid_kmac_input: FieldId,
}

fn word_block(
    b: &mut BankBuilder<Action>,
    base: u64,
    name: &'static str,
    mode: FieldMode,
    action: Option<Action>,
) -> [RegisterId; WORDS] {
    std::array::from_fn(|index| {
        let spec = RegisterSpec::new(base + index as u64 * 4).name(name);
        let register = b.register(match action {
            Some(action) => spec.on_write(action),
            None => spec,
        });
        b.field(register, FieldSpec::value(0, 32, "val").mode(mode));
        register
    })
}

/// Key manager.
#[derive(Debug)]
pub struct Keymgr {
    config: KeymgrConfig,
    regs: RegisterBank<Action>,
    fields: Fields,
    irqs: InterruptBlock,
    alerts: AlertBlock,
    key: [u8; KEYMGR_KEY_BYTES],
    sideload: [Option<[u8; KEYMGR_KEY_BYTES]>; 3],
    rng: ChaCha20Rng,
}

impl Keymgr {
    /// Creates the key manager in `Reset`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] when the revision seed is
    /// not 32 bytes long, or [`ConfigError`] if the register layout is
    /// rejected.
    pub fn new(config: KeymgrConfig) -> Result<Self, ConfigError> {
        if config.revision_seed.len() != KEYMGR_KEY_BYTES {
            return Err(ConfigError::InvalidArgument {
                name: "revision_seed",
                reason: format!(
                    "expected {KEYMGR_KEY_BYTES} bytes, got {}",
                    config.revision_seed.len()
                ),
            });
        }

        let mut b = BankBuilder::new(BankConfig::named("keymgr"));
        let irqs = InterruptBlock::declare(
            &mut b,
            KEYMGR_INTR_STATE,
            &["op_done"],
            Action::Irq,
            Action::IrqTest,
        );
        let alerts = AlertBlock::declare(
            &mut b,
            KEYMGR_ALERT_TEST,
            &["fatal_fault_err", "recov_operation_err"],
            Action::AlertTest,
        );

        // Operations finish within the START write, so the gate never closes.
        b.register_with(
            RegisterSpec::new(KEYMGR_CFG_REGWEN).name("CFG_REGWEN").reset(1),
            FieldSpec::flag(0, "EN").mode(FieldMode::ReadOnly),
        );

        let control = b.register(RegisterSpec::new(KEYMGR_CONTROL).name("CONTROL"));
        b.field(
            control,
            FieldSpec::flag(0, "START")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::Start),
        );
        b.field(control, FieldSpec::reserved(1, 3));
        let operation = b.field(control, FieldSpec::value(4, 3, "OPERATION"));
        let cdi_sel = b.field(control, FieldSpec::flag(7, "CDI_SEL"));
        b.field(control, FieldSpec::reserved(8, 4));
        let dest_sel = b.field(control, FieldSpec::value(12, 3, "DEST_SEL"));

        b.register_with(
            RegisterSpec::new(KEYMGR_SIDELOAD_CLEAR).name("SIDELOAD_CLEAR"),
            FieldSpec::value(0, 3, "VAL").on_write(Action::SideloadClear),
        );

        let reseed_regwen = b.register_with(
            RegisterSpec::new(KEYMGR_RESEED_INTERVAL_REGWEN)
                .name("RESEED_INTERVAL_REGWEN")
                .reset(1),
            FieldSpec::flag(0, "EN").mode(FieldMode::WriteZeroToClear),
        );
        let reseed_interval = b.register_with(
            RegisterSpec::new(KEYMGR_RESEED_INTERVAL)
                .name("RESEED_INTERVAL")
                .reset(0x100)
                .on_write(Action::ReseedInterval),
            FieldSpec::value(0, 32, "VAL"),
        );

        let binding_regwen = b.register_with(
            RegisterSpec::new(KEYMGR_SW_BINDING_REGWEN)
                .name("SW_BINDING_REGWEN")
                .reset(1),
            FieldSpec::flag(0, "EN").mode(FieldMode::WriteZeroToClear),
        );
        let sealing = word_block(
            &mut b,
            KEYMGR_SEALING_SW_BINDING0,
            "SEALING_SW_BINDING",
            FieldMode::ReadWrite,
            Some(Action::Binding),
        );
        let attestation = word_block(
            &mut b,
            KEYMGR_ATTEST_SW_BINDING0,
            "ATTEST_SW_BINDING",
            FieldMode::ReadWrite,
            Some(Action::Binding),
        );
        let salt = word_block(&mut b, KEYMGR_SALT0, "SALT", FieldMode::ReadWrite, None);

        let key_version = b.register_with(
            RegisterSpec::new(KEYMGR_KEY_VERSION).name("KEY_VERSION"),
            FieldSpec::value(0, 32, "VAL"),
        );
        let max_versions = [
            (KEYMGR_MAX_CREATOR_KEY_VER_REGWEN, "MAX_CREATOR_KEY_VER"),
            (KEYMGR_MAX_OWNER_INT_KEY_VER_REGWEN, "MAX_OWNER_INT_KEY_VER"),
            (KEYMGR_MAX_OWNER_KEY_VER_REGWEN, "MAX_OWNER_KEY_VER"),
        ];
        let max_version: [(FieldId, FieldId); 3] = std::array::from_fn(|index| {
            let (offset, name) = max_versions[index];
            let regwen = b.register_with(
                RegisterSpec::new(offset).name("MAX_KEY_VER_REGWEN").reset(1),
                FieldSpec::flag(0, "EN").mode(FieldMode::WriteZeroToClear),
            );
            let value = b.register_with(
                RegisterSpec::new(offset + 4)
                    .name(name)
                    .on_write(Action::MaxVersion(index)),
                FieldSpec::value(0, 32, "VAL"),
            );
            (regwen, value)
        });

        let share0 = word_block(
            &mut b,
            KEYMGR_SW_SHARE0_OUTPUT0,
            "SW_SHARE0_OUTPUT",
            FieldMode::ReadToClear,
            None,
        );
        let share1 = word_block(
            &mut b,
            KEYMGR_SW_SHARE1_OUTPUT0,
            "SW_SHARE1_OUTPUT",
            FieldMode::ReadToClear,
            None,
        );

        let working_state = b.register_with(
            RegisterSpec::new(KEYMGR_WORKING_STATE).name("WORKING_STATE"),
            FieldSpec::value(0, 3, "STATE").mode(FieldMode::ReadOnly),
        );
        let op_status = b.register_with(
            RegisterSpec::new(KEYMGR_OP_STATUS).name("OP_STATUS"),
            FieldSpec::value(0, 2, "STATUS").mode(FieldMode::WriteOneToClear),
        );
        let err_code = b.register(RegisterSpec::new(KEYMGR_ERR_CODE).name("ERR_CODE"));
        let invalid_op = b.field(
            err_code,
            FieldSpec::flag(0, "INVALID_OP").mode(FieldMode::WriteOneToClear),
        );
        let invalid_kmac_input = b.field(
            err_code,
            FieldSpec::flag(1, "INVALID_KMAC_INPUT").mode(FieldMode::WriteOneToClear),
        );
        b.field(
            err_code,
            FieldSpec::flag(2, "INVALID_SHADOW_UPDATE").mode(FieldMode::WriteOneToClear),
        );
        b.register_with(
            RegisterSpec::new(KEYMGR_FAULT_STATUS).name("FAULT_STATUS"),
            FieldSpec::unmodeled(0, 10, "FAULTS"),
        );

        Ok(Self {
            rng: ChaCha20Rng::seed_from_u64(config.seed),
            config,
            regs: b.build()?,
            fields: Fields {
                operation,
                cdi_sel,
                dest_sel,
                reseed_regwen,
                reseed_interval,
                binding_regwen,
                sealing,
                attestation,
                salt,
                key_version,
                max_version_regwen: max_version.map(|(regwen, _)| regwen),
                max_version: max_version.map(|(_, value)| value),
                share0,
                share1,
                working_state,
                op_status,
                invalid_op,
                invalid_kmac_input,
            },
            irqs,
            alerts,
            key: [0; KEYMGR_KEY_BYTES],
            sideload: [None; 3],
        })
    }

    /// Current working state.
    #[must_use]
    pub fn state(&self) -> WorkingState {
        self.regs
            .value_as(self.fields.working_state)
            .unwrap_or(WorkingState::Invalid)
    }

    /// Status of the last operation.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.regs
            .value_as(self.fields.op_status)
            .unwrap_or(OperationStatus::Idle)
    }

    /// Key of the current working state.
    #[must_use]
    pub const fn internal_key(&self) -> &[u8; KEYMGR_KEY_BYTES] {
        &self.key
    }

    /// Key most recently generated for `destination`, if not cleared.
    #[must_use]
    pub const fn sideload_key(
        &self,
        destination: KeyDestination,
    ) -> Option<&[u8; KEYMGR_KEY_BYTES]> {
        self.sideload[destination.slot()].as_ref()
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

    fn bytes_of(&self, registers: &[RegisterId; WORDS]) -> [u8; KEYMGR_KEY_BYTES] {
        let mut bytes = [0u8; KEYMGR_KEY_BYTES];
        for (chunk, &register) in bytes.chunks_exact_mut(4).zip(registers) {
            #[allow(clippy::cast_possible_truncation)]
            let word = self.regs.register_value(register) as u32;
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    // Random fill: the root key on entering `Init`, scrap on entering `Disabled`.
    fn randomize_key(&mut self) {
        self.rng.fill_bytes(&mut self.key);
    }

    fn finish(&mut self, status: OperationStatus) {
        self.regs.set_value(self.fields.op_status, status as u64);
        self.irqs.raise(&mut self.regs, KEYMGR_IRQ_OP_DONE);
    }

    fn fail(&mut self, error: FieldId) {
        self.regs.set_flag(error, true);
        self.alerts.blink(ALERT_RECOV_OPERATION);
        self.finish(OperationStatus::DoneError);
    }

    fn start(&mut self) {
        let state = self.state();
        let operation = self.regs.value_as::<KeymgrOperation>(self.fields.operation);
        if state == WorkingState::Reset && operation != Some(KeymgrOperation::Advance) {
            warn!(?operation, "ignoring operation in the reset state");
            return;
        }
        let Some(operation) = operation else {
            warn!(raw = self.regs.value(self.fields.operation), "unsupported keymgr operation");
            self.fail(self.fields.invalid_op);
            return;
        };
        debug!(?operation, ?state, "keymgr operation");
        if !operation.is_legal_in(state) {
            warn!(?operation, ?state, "illegal keymgr operation");
            self.fail(self.fields.invalid_op);
            return;
        }
        match operation {
            KeymgrOperation::Advance => self.advance(state),
            KeymgrOperation::Disable => {
                self.randomize_key();
                self.enter(WorkingState::Disabled);
                self.finish(OperationStatus::DoneSuccess);
            }
            KeymgrOperation::GenerateId
            | KeymgrOperation::GenerateSwOutput
            | KeymgrOperation::GenerateHwOutput => self.generate(state, operation),
        }
    }

    fn enter(&mut self, next: WorkingState) {
        self.regs.set_value(self.fields.working_state, next as u64);
        debug!(state = ?next, "keymgr working state");
    }

    fn advance(&mut self, state: WorkingState) {
        let next = state.next();
        match next {
            WorkingState::Init | WorkingState::Disabled | WorkingState::Invalid => {
                self.randomize_key();
            }
            _ => {
                let mut hasher = Sha3_256::new();
                hasher.update(self.key);
                hasher.update(&self.config.revision_seed);
                hasher.update(self.bytes_of(&self.fields.sealing));
                self.key = hasher.finalize().into();
            }
        }
        self.enter(next);
        self.regs.set_flag(self.fields.binding_regwen, true);
        self.finish(OperationStatus::DoneSuccess);
    }

    fn generate(&mut self, state: WorkingState, operation: KeymgrOperation) {
        let version = self.regs.value(self.fields.key_version);
        if operation != KeymgrOperation::GenerateId {
            let max = state
                .max_version_index()
                .map_or(0, |index| self.regs.value(self.fields.max_version[index]));
            if version > max {
                warn!(version, max, "key version above the permitted maximum");
                self.fail(self.fields.invalid_kmac_input);
                return;
            }
        }

        let binding = if self.regs.flag(self.fields.cdi_sel) {
            self.fields.attestation
        } else {
            self.fields.sealing
        };
        let mut hasher = Sha3_256::new();
        hasher.update(self.key);
        hasher.update(operation.label());
        if operation != KeymgrOperation::GenerateId {
            hasher.update(self.bytes_of(&binding));
            hasher.update(self.bytes_of(&self.fields.salt));
            hasher.update(version.to_le_bytes());
        }
        let output: [u8; KEYMGR_KEY_BYTES] = hasher.finalize().into();

        if operation == KeymgrOperation::GenerateHwOutput {
            let dest = self.regs.value(self.fields.dest_sel);
            match KeyDestination::from_bits(dest) {
                Some(destination) => {
                    debug!(?destination, "sideload key generated");
                    self.sideload[destination.slot()] = Some(output);
                }
                None => warn!(dest, "hardware output without a destination discarded"),
            }
        } else {
            let mut mask = [0u8; KEYMGR_KEY_BYTES];
            self.rng.fill_bytes(&mut mask);
            let masked: Vec<u8> = output.iter().zip(&mask).map(|(o, m)| o ^ m).collect();
            self.publish(self.fields.share0, &masked);
            self.publish(self.fields.share1, &mask);
        }
        self.finish(OperationStatus::DoneSuccess);
    }

    fn publish(&mut self, registers: [RegisterId; WORDS], bytes: &[u8]) {
        for (chunk, register) in bytes.chunks_exact(4).zip(registers) {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.regs.set_register_value(register, u64::from(word));
        }
    }

    // Restores `effect.old` when the write enable guarding the register is clear.
    fn guard(&mut self, effect: &WriteEffect<Action>, regwen: FieldId, what: &str) {
        if !self.regs.flag(regwen) {
            warn!("{what} is locked");
            self.regs.set_register_value(effect.register, effect.old);
        }
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::Irq => self.irqs.update(&self.regs),
            Action::IrqTest => self.irqs.test(&mut self.regs, effect.new),
            Action::AlertTest => self.alerts.test(effect.new),
            Action::Start if effect.new != 0 => self.start(),
            Action::Start => {}
            Action::SideloadClear => {
                if let Some(destination) = KeyDestination::from_bits(effect.new) {
                    debug!(?destination, "sideload key cleared");
                    self.sideload[destination.slot()] = None;
                }
            }
            Action::ReseedInterval => {
                self.guard(&effect, self.fields.reseed_regwen, "RESEED_INTERVAL");
                debug!(
                    interval = self.regs.value(self.fields.reseed_interval),
                    "reseed interval"
                );
            }
            Action::Binding => self.guard(&effect, self.fields.binding_regwen, "software binding"),
            Action::MaxVersion(index) => {
                self.guard(&effect, self.fields.max_version_regwen[index], "maximum key version");
            }
        }
    }
}

impl BusPeripheral for Keymgr {
    fn size(&self) -> u64 {
        KEYMGR_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.irqs.reset();
        self.alerts.reset();
        self.key = [0; KEYMGR_KEY_BYTES];
        self.sideload = [None; 3];
        self.rng = ChaCha20Rng::seed_from_u64(self.config.seed);
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        self.regs.read_sized(offset, width)
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
    use rstest::rstest;

    use super::*;

    const START: u32 = 1;
    const CDI_ATTESTATION: u32 = 1 << 7;

    fn keymgr() -> Keymgr {
        let mut k = Keymgr::new(KeymgrConfig::default()).unwrap();
        k.write_u32(KEYMGR_INTR_ENABLE, 1);
        k
    }

    fn run(k: &mut Keymgr, operation: KeymgrOperation, extra: u32) {
        k.write_u32(KEYMGR_CONTROL, START | ((operation as u32) << 4) | extra);
    }

    fn advance_to(k: &mut Keymgr, state: WorkingState) {
        while k.state() < state {
            run(k, KeymgrOperation::Advance, 0);
        }
        k.write_u32(KEYMGR_OP_STATUS, 0b11);
        k.write_u32(KEYMGR_INTR_STATE, 1);
    }

    fn shares(k: &mut Keymgr) -> (Vec<u32>, Vec<u32>) {
        let read = |k: &mut Keymgr, base: u64| -> Vec<u32> {
            (0..8).map(|i| k.read_u32(base + i * 4)).collect()
        };
        let share0 = read(k, KEYMGR_SW_SHARE0_OUTPUT0);
        let share1 = read(k, KEYMGR_SW_SHARE1_OUTPUT0);
        (share0, share1)
    }

    fn unmasked(k: &mut Keymgr) -> Vec<u32> {
        let (share0, share1) = shares(k);
        share0.iter().zip(&share1).map(|(a, b)| a ^ b).collect()
    }

    #[test]
    fn reset_values() {
        let mut k = keymgr();
        assert_eq!(k.read_u32(KEYMGR_WORKING_STATE), 0);
        assert_eq!(k.read_u32(KEYMGR_OP_STATUS), 0);
        assert_eq!(k.read_u32(KEYMGR_CFG_REGWEN), 1);
        assert_eq!(k.read_u32(KEYMGR_SW_BINDING_REGWEN), 1);
        assert_eq!(k.read_u32(KEYMGR_RESEED_INTERVAL), 0x100);
        assert_eq!(k.read_u32(KEYMGR_CONTROL), 0);
        assert_eq!(k.internal_key(), &[0; KEYMGR_KEY_BYTES]);
        assert_eq!(
            k.line_names(),
            ["op_done", "fatal_fault_err", "recov_operation_err"]
        );
    }

    #[test]
    fn advance_walks_the_chain_and_changes_the_key() {
        let mut k = keymgr();
        let mut keys = vec![*k.internal_key()];
        for expected in [
            WorkingState::Init,
            WorkingState::CreatorRootKey,
            WorkingState::OwnerIntermediateKey,
            WorkingState::OwnerKey,
            WorkingState::Disabled,
        ] {
            run(&mut k, KeymgrOperation::Advance, 0);
            assert_eq!(k.state(), expected);
            assert_eq!(k.status(), OperationStatus::DoneSuccess);
            assert_eq!(k.line_level("op_done"), Some(true));
            assert!(!keys.contains(k.internal_key()));
            keys.push(*k.internal_key());
            k.write_u32(KEYMGR_INTR_STATE, 1);
            assert_eq!(k.line_level("op_done"), Some(false));
        }
        assert_eq!(k.read_u32(KEYMGR_WORKING_STATE), 5);
    }

    #[test]
    fn equal_inputs_derive_equal_keys() {
        let mut a = keymgr();
        let mut b = keymgr();
        advance_to(&mut a, WorkingState::OwnerKey);
        advance_to(&mut b, WorkingState::OwnerKey);
        assert_eq!(a.internal_key(), b.internal_key());

        let mut c = keymgr();
        advance_to(&mut c, WorkingState::Init);
        c.write_u32(KEYMGR_SEALING_SW_BINDING0, 0xC0FFEE);
        advance_to(&mut c, WorkingState::OwnerKey);
        assert_ne!(a.internal_key(), c.internal_key());
    }

    #[test]
    fn only_advance_runs_in_reset() {
        let mut k = keymgr();
        run(&mut k, KeymgrOperation::GenerateSwOutput, 0);
        run(&mut k, KeymgrOperation::Disable, 0);
        assert_eq!(k.state(), WorkingState::Reset);
        assert_eq!(k.status(), OperationStatus::Idle);
        assert_eq!(k.read_u32(KEYMGR_ERR_CODE), 0);
        assert_eq!(k.line_level("op_done"), Some(false));
    }

    #[rstest]
    #[case(WorkingState::Init, KeymgrOperation::GenerateId)]
    #[case(WorkingState::Init, KeymgrOperation::GenerateHwOutput)]
    #[case(WorkingState::Disabled, KeymgrOperation::Advance)]
    #[case(WorkingState::Disabled, KeymgrOperation::Disable)]
    #[case(WorkingState::Disabled, KeymgrOperation::GenerateSwOutput)]
    fn illegal_operations_report_an_error(
        #[case] state: WorkingState,
        #[case] operation: KeymgrOperation,
    ) {
        let mut k = keymgr();
        advance_to(&mut k, state);
        let key = *k.internal_key();
        run(&mut k, operation, 0);
        assert_eq!(k.state(), state);
        assert_eq!(k.internal_key(), &key);
        assert_eq!(k.read_u32(KEYMGR_ERR_CODE), 0b001);
        assert_eq!(k.status(), OperationStatus::DoneError);
        assert_eq!(k.line_level("op_done"), Some(true));
        assert_eq!(k.alert("recov_operation_err").unwrap().rising_edges(), 1);

        k.write_u32(KEYMGR_ERR_CODE, 0b001);
        k.write_u32(KEYMGR_OP_STATUS, 0b11);
        assert_eq!(k.read_u32(KEYMGR_ERR_CODE), 0);
        assert_eq!(k.status(), OperationStatus::Idle);
    }

    #[test]
    fn unknown_operation_is_invalid() {
        let mut k = keymgr();
        advance_to(&mut k, WorkingState::Init);
        k.write_u32(KEYMGR_CONTROL, START | (7 << 4));
        assert_eq!(k.read_u32(KEYMGR_ERR_CODE), 0b001);
        assert_eq!(k.status(), OperationStatus::DoneError);
        assert_eq!(k.state(), WorkingState::Init);
    }

    #[test]
    fn software_output_is_split_into_shares() {
        let mut k = keymgr();
        advance_to(&mut k, WorkingState::CreatorRootKey);
        run(&mut k, KeymgrOperation::GenerateSwOutput, 0);
        assert_eq!(k.status(), OperationStatus::DoneSuccess);
        let (share0, share1) = shares(&mut k);
        assert_ne!(share0, share1);
        let first: Vec<u32> = share0.iter().zip(&share1).map(|(a, b)| a ^ b).collect();
        assert!(first.iter().any(|&w| w != 0));

        let (share0, share1) = shares(&mut k);
        assert!(share0.iter().chain(&share1).all(|&w| w == 0));

        run(&mut k, KeymgrOperation::GenerateSwOutput, 0);
        assert_eq!(unmasked(&mut k), first);
    }

    #[test]
    fn outputs_depend_on_cdi_salt_and_operation() {
        let mut k = keymgr();
        advance_to(&mut k, WorkingState::Init);
        k.write_u32(KEYMGR_ATTEST_SW_BINDING0, 0xA77E_57ED);
        advance_to(&mut k, WorkingState::OwnerKey);

        run(&mut k, KeymgrOperation::GenerateSwOutput, 0);
        let sealing = unmasked(&mut k);
        run(&mut k, KeymgrOperation::GenerateSwOutput, CDI_ATTESTATION);
        let attestation = unmasked(&mut k);
        assert_ne!(sealing, attestation);

        run(&mut k, KeymgrOperation::GenerateId, 0);
        let id = unmasked(&mut k);
        assert_ne!(id, sealing);

        k.write_u32(KEYMGR_SALT0 + 4, 1);
        run(&mut k, KeymgrOperation::GenerateSwOutput, 0);
        assert_ne!(unmasked(&mut k), sealing);
        run(&mut k, KeymgrOperation::GenerateId, 0);
        assert_eq!(unmasked(&mut k), id);
    }

    #[test]
    fn hardware_output_goes_to_the_sideload_slot() {
        let mut k = keymgr();
        advance_to(&mut k, WorkingState::CreatorRootKey);
        run(&mut k, KeymgrOperation::GenerateHwOutput, 2 << 12);
        assert_eq!(k.status(), OperationStatus::DoneSuccess);
        let key = *k.sideload_key(KeyDestination::Kmac).unwrap();
        assert!(k.sideload_key(KeyDestination::Aes).is_none());
        let (share0, _) = shares(&mut k);
        assert!(share0.iter().all(|&w| w == 0));

        run(&mut k, KeymgrOperation::GenerateHwOutput, 1 << 12);
        assert_eq!(k.sideload_key(KeyDestination::Aes), Some(&key));

        k.write_u32(KEYMGR_SIDELOAD_CLEAR, 2);
        assert!(k.sideload_key(KeyDestination::Kmac).is_none());
        assert!(k.sideload_key(KeyDestination::Aes).is_some());
    }

    #[test]
    fn key_version_is_bounded_per_state() {
        let mut k = keymgr();
        advance_to(&mut k, WorkingState::CreatorRootKey);
        k.write_u32(KEYMGR_KEY_VERSION, 3);
        run(&mut k, KeymgrOperation::GenerateSwOutput, 0);
        assert_eq!(k.read_u32(KEYMGR_ERR_CODE), 0b010);
        assert_eq!(k.status(), OperationStatus::DoneError);

        k.write_u32(KEYMGR_ERR_CODE, 0b010);
        k.write_u32(KEYMGR_MAX_CREATOR_KEY_VER, 3);
        run(&mut k, KeymgrOperation::GenerateSwOutput, 0);
        assert_eq!(k.read_u32(KEYMGR_ERR_CODE), 0);
        assert_eq!(k.status(), OperationStatus::DoneSuccess);

        run(&mut k, KeymgrOperation::GenerateId, 0);
        assert_eq!(k.status(), OperationStatus::DoneSuccess);
    }

    #[rstest]
    #[case(KEYMGR_SW_BINDING_REGWEN, KEYMGR_SEALING_SW_BINDING0)]
    #[case(KEYMGR_SW_BINDING_REGWEN, KEYMGR_ATTEST_SW_BINDING0 + 0x1C)]
    #[case(KEYMGR_RESEED_INTERVAL_REGWEN, KEYMGR_RESEED_INTERVAL)]
    #[case(KEYMGR_MAX_OWNER_KEY_VER_REGWEN, KEYMGR_MAX_OWNER_KEY_VER)]
    fn cleared_write_enable_locks_the_register(#[case] regwen: u64, #[case] offset: u64) {
        let mut k = keymgr();
        k.write_u32(offset, 0x11);
        let before = k.read_u32(offset);
        assert_eq!(before, 0x11);
        k.write_u32(regwen, 0);
        assert_eq!(k.read_u32(regwen), 0);
        k.write_u32(regwen, 1);
        assert_eq!(k.read_u32(regwen), 0);
        k.write_u32(offset, 0x22);
        assert_eq!(k.read_u32(offset), before);
    }

    #[test]
    fn advance_reopens_the_binding_registers() {
        let mut k = keymgr();
        k.write_u32(KEYMGR_SW_BINDING_REGWEN, 0);
        k.write_u32(KEYMGR_SEALING_SW_BINDING0, 5);
        assert_eq!(k.read_u32(KEYMGR_SEALING_SW_BINDING0), 0);
        run(&mut k, KeymgrOperation::Advance, 0);
        assert_eq!(k.read_u32(KEYMGR_SW_BINDING_REGWEN), 1);
        k.write_u32(KEYMGR_SEALING_SW_BINDING0, 5);
        assert_eq!(k.read_u32(KEYMGR_SEALING_SW_BINDING0), 5);
    }

    #[test]
    fn disable_wipes_the_key() {
        let mut k = keymgr();
        advance_to(&mut k, WorkingState::OwnerIntermediateKey);
        let key = *k.internal_key();
        run(&mut k, KeymgrOperation::Disable, 0);
        assert_eq!(k.state(), WorkingState::Disabled);
        assert_eq!(k.status(), OperationStatus::DoneSuccess);
        assert_ne!(k.internal_key(), &key);
    }

    #[test]
    fn reset_returns_to_the_start_of_the_chain() {
        let mut k = keymgr();
        advance_to(&mut k, WorkingState::CreatorRootKey);
        run(&mut k, KeymgrOperation::GenerateHwOutput, 3 << 12);
        k.reset();
        assert_eq!(k.state(), WorkingState::Reset);
        assert_eq!(k.internal_key(), &[0; KEYMGR_KEY_BYTES]);
        assert!(k.sideload_key(KeyDestination::Otbn).is_none());
        assert_eq!(k.line_level("op_done"), Some(false));
    }

    #[test]
    fn revision_seed_length_is_checked() {
        let err = Keymgr::new(KeymgrConfig {
            revision_seed: vec![0; 16],
            ..KeymgrConfig::default()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidArgument {
                name: "revision_seed",
                ..
            }
        ));
    }
}
