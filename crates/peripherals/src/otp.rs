//! One-time-programmable memory controller.
//!
//! The fuse array is a 2 KiB byte buffer shared through [`OtpMemory`] so a
//! life-cycle controller or a loader can hold a handle to the same contents.
//! Software reads it through the direct access interface (`DAI_*`) or the
//! memory-mapped software configuration window at `0x1000`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BusPeripheral, ConfigError, FieldId,
    FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterSpec, WriteEffect,
};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::irq::{AlertBlock, InterruptBlock};

/// Interrupt state register.
pub const OTP_INTR_STATE: u64 = 0x00;
/// Interrupt enable register.
pub const OTP_INTR_ENABLE: u64 = 0x04;
/// Alert test register.
pub const OTP_ALERT_TEST: u64 = 0x0C;
/// Controller status.
pub const OTP_STATUS: u64 = 0x10;
/// Per-partition error codes.
pub const OTP_ERR_CODE: u64 = 0x14;
/// Direct access write enable.
pub const OTP_DAI_REGWEN: u64 = 0x18;
/// Direct access command.
pub const OTP_DAI_CMD: u64 = 0x1C;
/// Direct access address.
pub const OTP_DAI_ADDRESS: u64 = 0x20;
/// Direct access read data, low word.
pub const OTP_DAI_RDATA_0: u64 = 0x2C;
/// Direct access read data, high word.
pub const OTP_DAI_RDATA_1: u64 = 0x30;
/// Vendor test partition read lock.
pub const OTP_VENDOR_TEST_READ_LOCK: u64 = 0x4C;
/// Creator software config partition read lock.
pub const OTP_CREATOR_SW_CFG_READ_LOCK: u64 = 0x50;
/// Owner software config partition read lock.
pub const OTP_OWNER_SW_CFG_READ_LOCK: u64 = 0x54;
/// First partition digest register.
pub const OTP_DIGEST_BASE: u64 = 0x58;
/// Software configuration window.
pub const OTP_SW_CFG_WINDOW: u64 = 0x1000;
/// Window length.
pub const OTP_SIZE: u64 = 0x1800;

/// Bytes in the fuse array.
pub const OTP_BYTES: usize = 0x800;
/// Most life-cycle transitions the counter can record.
pub const MAX_TRANSITIONS: u16 = 24;

const STATE_WORDS: usize = 20;
const COUNT_WORDS: usize = 24;
const ERR_ACCESS: u64 = 0x5;
const DAI_INDEX: usize = 8;
const STATUS_DAI_IDLE: u32 = 15;

/// One named item of the fuse map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpItem {
    /// Item name.
    pub name: &'static str,
    /// Byte offset in the fuse array.
    pub offset: usize,
    /// Length in bytes.
    pub size: usize,
    /// Whether direct reads return two words.
    pub is_64bit: bool,
}

const fn item(name: &'static str, offset: usize, size: usize, is_64bit: bool) -> OtpItem {
    OtpItem {
        name,
        offset,
        size,
        is_64bit,
    }
}

/// Fuse map in ascending offset order.
pub const OTP_ITEMS: &[OtpItem] = &[
    item("SCRATCH", 0x000, 56, false),
    item("VENDOR_TEST_DIGEST", 0x038, 8, true),
    item("CREATOR_SW_CFG_AST_CFG", 0x040, 156, false),
    item("CREATOR_SW_CFG_AST_INIT_EN", 0x0DC, 4, false),
    item("CREATOR_SW_CFG_ROM_EXT_SKU", 0x0E0, 4, false),
    item("CREATOR_SW_CFG_USE_SW_RSA_VERIFY", 0x0E4, 4, false),
    item("CREATOR_SW_CFG_KEY_IS_VALID", 0x0E8, 8, false),
    item("CREATOR_SW_CFG_FLASH_DATA_DEFAULT_CFG", 0x0F0, 4, false),
    item("CREATOR_SW_CFG_FLASH_INFO_BOOT_DATA_CFG", 0x0F4, 4, false),
    item("CREATOR_SW_CFG_RNG_EN", 0x0F8, 4, false),
    item("CREATOR_SW_CFG_JITTER_EN", 0x0FC, 4, false),
    item("CREATOR_SW_CFG_RET_RAM_RESET_MASK", 0x100, 4, false),
    item("CREATOR_SW_CFG_DIGEST", 0x358, 8, true),
    item("ROM_ERROR_REPORTING", 0x360, 4, false),
    item("ROM_BOOTSTRAP_EN", 0x364, 4, false),
    item("ROM_FAULT_RESPONSE", 0x368, 4, false),
    item("ROM_ALERT_CLASS_EN", 0x36C, 4, false),
    item("ROM_ALERT_ESCALATION", 0x370, 4, false),
    item("ROM_ALERT_CLASSIFICATION", 0x374, 320, false),
    item("ROM_LOCAL_ALERT_CLASSIFICATION", 0x4B4, 64, false),
    item("ROM_ALERT_ACCUM_THRESH", 0x4F4, 16, false),
    item("ROM_ALERT_TIMEOUT_CYCLES", 0x504, 16, false),
    item("ROM_ALERT_PHASE_CYCLES", 0x514, 64, false),
    item("ROM_WATCHDOG_BITE_THRESHOLD_CYCLES", 0x554, 4, false),
    item("OWNER_SW_CFG_DIGEST", 0x678, 8, true),
    item("DEVICE_ID", 0x680, 32, false),
    item("MANUF_STATE", 0x6A0, 32, false),
    item("EN_SRAM_IFETCH", 0x6C0, 1, false),
    item("EN_CSRNG_SW_APP_READ", 0x6C1, 1, false),
    item("EN_ENTROPY_SRC_FW_READ", 0x6C2, 1, false),
    item("EN_ENTROPY_SRC_FW_OVER", 0x6C3, 1, false),
    item("HW_CFG_DIGEST", 0x6C8, 8, true),
    item("TEST_UNLOCK_TOKEN", 0x6D0, 16, true),
    item("TEST_EXIT_TOKEN", 0x6E0, 16, true),
    item("SECRET0_DIGEST", 0x6F0, 8, true),
    item("FLASH_ADDR_KEY_SEED", 0x6F8, 32, true),
    item("FLASH_DATA_KEY_SEED", 0x718, 32, true),
    item("SRAM_DATA_KEY_SEED", 0x738, 16, true),
    item("SECRET1_DIGEST", 0x748, 8, true),
    item("RMA_TOKEN", 0x750, 16, true),
    item("CREATOR_ROOT_KEY_SHARE0", 0x760, 32, true),
    item("CREATOR_ROOT_KEY_SHARE1", 0x780, 32, true),
    item("SECRET2_DIGEST", 0x7A0, 8, true),
    item("LC_TRANSITION_CNT", 0x7A8, 48, false),
    item("LC_STATE", 0x7D8, 40, false),
];

/// Looks an item up by name.
#[must_use]
pub fn find_item(name: &str) -> Option<&'static OtpItem> {
    OTP_ITEMS.iter().find(|item| item.name == name)
}

fn item_at(address: usize) -> Option<&'static OtpItem> {
    OTP_ITEMS.iter().rev().find(|item| item.offset <= address)
}

/// Fuse array partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Vendor test area.
    VendorTest,
    /// Creator software configuration.
    CreatorSwCfg,
    /// Owner software configuration.
    OwnerSwCfg,
    /// Hardware configuration.
    HwCfg,
    /// Test tokens.
    Secret0,
    /// Flash and SRAM key seeds.
    Secret1,
    /// RMA token and root key shares.
    Secret2,
    /// Life-cycle counter and state.
    LifeCycle,
}

impl Partition {
    const ALL: [Self; 8] = [
        Self::VendorTest,
        Self::CreatorSwCfg,
        Self::OwnerSwCfg,
        Self::HwCfg,
        Self::Secret0,
        Self::Secret1,
        Self::Secret2,
        Self::LifeCycle,
    ];

    /// First byte of the partition.
    #[must_use]
    pub const fn start(self) -> usize {
        match self {
            Self::VendorTest => 0x000,
            Self::CreatorSwCfg => 0x040,
            Self::OwnerSwCfg => 0x360,
            Self::HwCfg => 0x680,
            Self::Secret0 => 0x6D0,
            Self::Secret1 => 0x6F8,
            Self::Secret2 => 0x750,
            Self::LifeCycle => 0x7A8,
        }
    }

    /// Partition holding byte `address`.
    #[must_use]
    pub fn containing(address: usize) -> Option<Self> {
        if address >= OTP_BYTES {
            return None;
        }
        Self::ALL
            .into_iter()
            .rev()
            .find(|partition| partition.start() <= address)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Life-cycle states encoded in the `LC_STATE` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[allow(missing_docs)]
pub enum LifeCycleState {
    Raw,
    TestUnlocked0,
    TestLocked0,
    TestUnlocked1,
    TestLocked1,
    TestUnlocked2,
    TestLocked2,
    TestUnlocked3,
    TestLocked3,
    TestUnlocked4,
    TestLocked4,
    TestUnlocked5,
    TestLocked5,
    TestUnlocked6,
    TestLocked6,
    TestUnlocked7,
    Dev,
    Prod,
    ProdEnd,
    Rma,
    Scrap,
}

// Consumed-position map of each state, first word in the most significant bit.
const STATE_POSITIONS: [(LifeCycleState, u32); 20] = [
    (LifeCycleState::TestUnlocked0, 0x80000),
    (LifeCycleState::TestLocked0, 0xC0000),
    (LifeCycleState::TestUnlocked1, 0xE0000),
    (LifeCycleState::TestLocked1, 0xF0000),
    (LifeCycleState::TestUnlocked2, 0xF8000),
    (LifeCycleState::TestLocked2, 0xFC000),
    (LifeCycleState::TestUnlocked3, 0xFE000),
    (LifeCycleState::TestLocked3, 0xFF000),
    (LifeCycleState::TestUnlocked4, 0xFF800),
    (LifeCycleState::TestLocked4, 0xFFC00),
    (LifeCycleState::TestUnlocked5, 0xFFE00),
    (LifeCycleState::TestLocked5, 0xFFF00),
    (LifeCycleState::TestUnlocked6, 0xFFF80),
    (LifeCycleState::TestLocked6, 0xFFFC0),
    (LifeCycleState::TestUnlocked7, 0xFFFE0),
    (LifeCycleState::Dev, 0xFFFF0),
    (LifeCycleState::Prod, 0xFFFE8),
    (LifeCycleState::ProdEnd, 0xFFFE4),
    (LifeCycleState::Rma, 0xFFFFB),
    (LifeCycleState::Scrap, 0xFFFFF),
];

/// Errors decoding life-cycle items or loading fuse images.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtpError {
    /// A word matches neither its unconsumed nor its consumed value.
    #[error("{item} word {index} holds {value:#06x}, not a valid encoding")]
    InvalidWord {
        /// Item being decoded.
        item: &'static str,
        /// Word index inside the item.
        index: usize,
        /// Stored word.
        value: u16,
    },
    /// The consumed positions do not name a life-cycle state.
    #[error("consumed positions {0:#07x} do not map onto a life-cycle state")]
    UnknownState(u32),
    /// The counter already recorded every allowed transition.
    #[error("transition counter reached its limit of {MAX_TRANSITIONS}")]
    CounterExhausted,
    /// A memory image line could not be parsed.
    #[error("vmem line {line}: {reason}")]
    Vmem {
        /// One-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
}

/// Shared handle to the fuse array.
#[derive(Debug, Clone)]
pub struct OtpMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Default for OtpMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl OtpMemory {
    /// A blank array.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; OTP_BYTES])),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copies `len` bytes from `offset`; bytes past the end read as zero.
    #[must_use]
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let bytes = self.lock();
        (offset..offset + len)
            .map(|index| bytes.get(index).copied().unwrap_or(0))
            .collect()
    }

    /// Little-endian word at `offset`.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let bytes = self.read(offset, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Stores `data` at `offset`, dropping bytes past the end.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.lock();
        for (index, &byte) in (offset..).zip(data) {
            if let Some(slot) = bytes.get_mut(index) {
                *slot = byte;
            }
        }
    }

    /// Runs `f` with exclusive access to the whole array.
    pub fn with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.lock())
    }

    /// Loads a `.vmem` image and returns the number of words stored.
    ///
    /// Each line is `@<word address> <word> <word> ...` in hex. Words carry
    /// ECC bits above bit 16; only the low 16 data bits are stored.
    ///
    /// # Errors
    ///
    /// Returns [`OtpError::Vmem`] for malformed lines or addresses outside
    /// the array.
    pub fn load_vmem(&self, text: &str) -> Result<usize, OtpError> {
        let mut writes = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.split("//").next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let vmem_err = |reason: String| OtpError::Vmem {
                line: number + 1,
                reason,
            };
            let mut tokens = line.split_whitespace();
            let address = tokens
                .next()
                .and_then(|token| token.strip_prefix('@'))
                .ok_or_else(|| vmem_err(String::from("missing @address")))?;
            let mut index = usize::from_str_radix(address, 16)
                .map_err(|err| vmem_err(format!("bad address `{address}`: {err}")))?;
            for token in tokens {
                let word = u32::from_str_radix(token, 16)
                    .map_err(|err| vmem_err(format!("bad word `{token}`: {err}")))?;
                let offset = index * 2;
                if offset + 2 > OTP_BYTES {
                    return Err(vmem_err(format!("address {offset:#x} outside the array")));
                }
                #[allow(clippy::cast_possible_truncation)]
                writes.push((offset, word as u16));
                index += 1;
            }
        }
        let mut bytes = self.lock();
        for &(offset, word) in &writes {
            bytes[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
        }
        Ok(writes.len())
    }
}

/// Encoding chains of the life-cycle items.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OtpConfig {
    /// Unconsumed `LC_STATE` words (20).
    pub state_unconsumed: Vec<u16>,
    /// Consumed `LC_STATE` words (20).
    pub state_consumed: Vec<u16>,
    /// Unconsumed `LC_TRANSITION_CNT` words (24).
    pub count_unconsumed: Vec<u16>,
    /// Consumed `LC_TRANSITION_CNT` words (24).
    pub count_consumed: Vec<u16>,
}

impl Default for OtpConfig {
    fn default() -> Self {
        let chain = |base: u16, len: usize| (0u16..).take(len).map(|i| base | i).collect();
        Self {
            state_unconsumed: vec![0; STATE_WORDS],
            state_consumed: chain(0xB000, STATE_WORDS),
            count_unconsumed: vec![0; COUNT_WORDS],
            count_consumed: chain(0xD000, COUNT_WORDS),
        }
    }
}

impl OtpConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, chain, len) in [
            ("state_unconsumed", &self.state_unconsumed, STATE_WORDS),
            ("state_consumed", &self.state_consumed, STATE_WORDS),
            ("count_unconsumed", &self.count_unconsumed, COUNT_WORDS),
            ("count_consumed", &self.count_consumed, COUNT_WORDS),
        ] {
            if chain.len() != len {
                return Err(ConfigError::InvalidArgument {
                    name,
                    reason: format!("expected {len} words, got {}", chain.len()),
                });
            }
        }
        Ok(())
    }
}

// Bit per word, first word most significant, set where the consumed value is stored.
fn consumed_positions(
    item: &'static str,
    words: &[u8],
    unconsumed: &[u16],
    consumed: &[u16],
) -> Result<u32, OtpError> {
    let mut map = 0u32;
    for (index, chunk) in words.chunks_exact(2).enumerate() {
        let value = u16::from_le_bytes([chunk[0], chunk[1]]);
        map <<= 1;
        if value == consumed[index] {
            map |= 1;
        } else if value != unconsumed[index] {
            return Err(OtpError::InvalidWord { item, index, value });
        }
    }
    Ok(map)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Irq,
    IrqTest,
    AlertTest,
    DaiRead,
    Digest(usize),
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    status: [FieldId; 9],
    dai_idle: FieldId,
    err: [FieldId; 9],
    address: FieldId,
    rdata0: FieldId,
    rdata1: FieldId,
    read_lock: [FieldId; 3],
}

// Digest item offsets in digest register order.
const DIGEST_ITEMS: [usize; 7] = [0x038, 0x358, 0x678, 0x6C8, 0x6F0, 0x748, 0x7A0];

/// OTP controller.
#[derive(Debug)]
pub struct Otp {
    config: OtpConfig,
    regs: RegisterBank<Action>,
    fields: Fields,
    irqs: InterruptBlock,
    alerts: AlertBlock,
    memory: OtpMemory,
}

impl Otp {
    /// Creates a controller over a blank fuse array.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] for encoding chains of the
    /// wrong length, or [`ConfigError`] if the register layout is rejected.
    pub fn new(config: OtpConfig) -> Result<Self, ConfigError> {
        Self::with_memory(config, OtpMemory::new())
    }

    /// Creates a controller over an existing fuse array.
    ///
    /// # Errors
    ///
    /// See [`Otp::new`].
    pub fn with_memory(config: OtpConfig, memory: OtpMemory) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut b = BankBuilder::new(BankConfig::named("otp_ctrl"));
        let irqs = InterruptBlock::declare(
            &mut b,
            OTP_INTR_STATE,
            &["otp_operation_done", "otp_error"],
            Action::Irq,
            Action::IrqTest,
        );
        let alerts = AlertBlock::declare(
            &mut b,
            OTP_ALERT_TEST,
            &["fatal_macro_error", "fatal_check_error", "fatal_bus_integ_error"],
            Action::AlertTest,
        );

        let status_reg = b.register(
            RegisterSpec::new(OTP_STATUS)
                .name("STATUS")
                .reset(1 << STATUS_DAI_IDLE),
        );
        let status = [
            "VENDOR_TEST_ERROR",
            "CREATOR_SW_CFG_ERROR",
            "OWNER_SW_CFG_ERROR",
            "HW_CFG_ERROR",
            "SECRET0_ERROR",
            "SECRET1_ERROR",
            "SECRET2_ERROR",
            "LIFE_CYCLE_ERROR",
            "DAI_ERROR",
        ];
        let status = std::array::from_fn(|bit| {
            #[allow(clippy::cast_possible_truncation)]
            let spec = FieldSpec::flag(bit as u32, status[bit]).mode(FieldMode::ReadOnly);
            b.field(status_reg, spec)
        });
        b.field(status_reg, FieldSpec::unmodeled(9, 6, "FSM_ERRORS"));
        let dai_idle = b.field(
            status_reg,
            FieldSpec::flag(STATUS_DAI_IDLE, "DAI_IDLE").mode(FieldMode::ReadOnly),
        );
        b.field(status_reg, FieldSpec::unmodeled(16, 1, "CHECK_PENDING"));

        let err_reg = b.register(RegisterSpec::new(OTP_ERR_CODE).name("ERR_CODE"));
        let err_names = [
            "ERR_CODE_0",
            "ERR_CODE_1",
            "ERR_CODE_2",
            "ERR_CODE_3",
            "ERR_CODE_4",
            "ERR_CODE_5",
            "ERR_CODE_6",
            "ERR_CODE_7",
            "ERR_CODE_8",
        ];
        let err = std::array::from_fn(|index| {
            #[allow(clippy::cast_possible_truncation)]
            let spec = FieldSpec::value(index as u32 * 3, 3, err_names[index]).mode(FieldMode::ReadOnly);
            b.field(err_reg, spec)
        });
        b.field(err_reg, FieldSpec::unmodeled(27, 3, "ERR_CODE_9"));

        b.register_with(
            RegisterSpec::new(OTP_DAI_REGWEN).name("DIRECT_ACCESS_REGWEN").reset(1),
            FieldSpec::flag(0, "DIRECT_ACCESS_REGWEN").mode(FieldMode::ReadOnly),
        );
        let cmd = b.register(RegisterSpec::new(OTP_DAI_CMD).name("DIRECT_ACCESS_CMD"));
        b.field(
            cmd,
            FieldSpec::flag(0, "RD")
                .mode(FieldMode::WriteOneToClear)
                .on_write(Action::DaiRead),
        );
        b.field(cmd, FieldSpec::unmodeled(1, 1, "WR"));
        b.field(cmd, FieldSpec::unmodeled(2, 1, "DIGEST"));
        let address = b.register_with(
            RegisterSpec::new(OTP_DAI_ADDRESS).name("DIRECT_ACCESS_ADDRESS"),
            FieldSpec::value(0, 11, "DIRECT_ACCESS_ADDRESS"),
        );
        for (offset, name) in [(0x24, "DIRECT_ACCESS_WDATA_0"), (0x28, "DIRECT_ACCESS_WDATA_1")] {
            b.register_with(
                RegisterSpec::new(offset).name(name),
                FieldSpec::unmodeled(0, 32, name),
            );
        }
        let rdata0 = b.register_with(
            RegisterSpec::new(OTP_DAI_RDATA_0).name("DIRECT_ACCESS_RDATA_0"),
            FieldSpec::value(0, 32, "DIRECT_ACCESS_RDATA_0").mode(FieldMode::ReadOnly),
        );
        let rdata1 = b.register_with(
            RegisterSpec::new(OTP_DAI_RDATA_1).name("DIRECT_ACCESS_RDATA_1"),
            FieldSpec::value(0, 32, "DIRECT_ACCESS_RDATA_1").mode(FieldMode::ReadOnly),
        );
        for (offset, name) in [(0x34, "CHECK_TRIGGER_REGWEN"), (0x38, "CHECK_TRIGGER")] {
            b.register_with(
                RegisterSpec::new(offset).name(name),
                FieldSpec::unmodeled(0, 2, name),
            );
        }
        b.register_with(
            RegisterSpec::new(0x3C).name("CHECK_REGWEN").reset(1),
            FieldSpec::flag(0, "CHECK_REGWEN").mode(FieldMode::WriteZeroToClear),
        );
        for (offset, name) in [
            (0x40, "CHECK_TIMEOUT"),
            (0x44, "INTEGRITY_CHECK_PERIOD"),
            (0x48, "CONSISTENCY_CHECK_PERIOD"),
        ] {
            b.register_with(
                RegisterSpec::new(offset).name(name),
                FieldSpec::unmodeled(0, 32, name),
            );
        }
        let read_lock = [
            (OTP_VENDOR_TEST_READ_LOCK, "VENDOR_TEST_READ_LOCK"),
            (OTP_CREATOR_SW_CFG_READ_LOCK, "CREATOR_SW_CFG_READ_LOCK"),
            (OTP_OWNER_SW_CFG_READ_LOCK, "OWNER_SW_CFG_READ_LOCK"),
        ]
        .map(|(offset, name)| {
            b.register_with(
                RegisterSpec::new(offset).name(name).reset(1),
                FieldSpec::flag(0, name).mode(FieldMode::WriteZeroToClear),
            )
        });
        let digest_names = [
            ("VENDOR_TEST_DIGEST_0", "VENDOR_TEST_DIGEST_1"),
            ("CREATOR_SW_CFG_DIGEST_0", "CREATOR_SW_CFG_DIGEST_1"),
            ("OWNER_SW_CFG_DIGEST_0", "OWNER_SW_CFG_DIGEST_1"),
            ("HW_CFG_DIGEST_0", "HW_CFG_DIGEST_1"),
            ("SECRET0_DIGEST_0", "SECRET0_DIGEST_1"),
            ("SECRET1_DIGEST_0", "SECRET1_DIGEST_1"),
            ("SECRET2_DIGEST_0", "SECRET2_DIGEST_1"),
        ];
        for (pair, (low, high)) in (0u64..).zip(digest_names) {
            for (half, name) in (0u64..).zip([low, high]) {
                let word = pair * 2 + half;
                #[allow(clippy::cast_possible_truncation)]
                let action = Action::Digest(word as usize);
                b.register_with(
                    RegisterSpec::new(OTP_DIGEST_BASE + word * 4).name(name),
                    FieldSpec::value(0, 32, name)
                        .mode(FieldMode::ReadOnly)
                        .on_read(action),
                );
            }
        }

        Ok(Self {
            config,
            regs: b.build()?,
            fields: Fields {
                status,
                dai_idle,
                err,
                address,
                rdata0,
                rdata1,
                read_lock,
            },
            irqs,
            alerts,
            memory,
        })
    }

    /// Handle to the fuse array.
    #[must_use]
    pub fn memory(&self) -> OtpMemory {
        self.memory.clone()
    }

    /// Raw bytes of a named fuse item.
    #[must_use]
    pub fn item_bytes(&self, name: &str) -> Option<Vec<u8>> {
        find_item(name).map(|item| self.memory.read(item.offset, item.size))
    }

    /// Interrupt line by name.
    #[must_use]
    pub fn irq(&self, name: &str) -> Option<&GpioLine> {
        self.irqs.line(name)
    }

    /// Whether software may read `partition`.
    #[must_use]
    pub fn is_readable(&self, partition: Partition) -> bool {
        match partition {
            Partition::VendorTest => self.regs.flag(self.fields.read_lock[0]),
            Partition::CreatorSwCfg => self.regs.flag(self.fields.read_lock[1]),
            Partition::OwnerSwCfg => self.regs.flag(self.fields.read_lock[2]),
            _ => true,
        }
    }

    /// Decodes the number of recorded life-cycle transitions.
    ///
    /// # Errors
    ///
    /// Returns [`OtpError::InvalidWord`] when the counter item is corrupt.
    pub fn transition_count(&self) -> Result<u16, OtpError> {
        let words = self.memory.read(0x7A8, COUNT_WORDS * 2);
        self.decode_count(&words)
    }

    fn decode_count(&self, words: &[u8]) -> Result<u16, OtpError> {
        if words.iter().all(|&byte| byte == 0) {
            return Ok(0);
        }
        let map = consumed_positions(
            "LC_TRANSITION_CNT",
            words,
            &self.config.count_unconsumed,
            &self.config.count_consumed,
        )?;
        if map == 0 {
            return Ok(0);
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(MAX_TRANSITIONS - map.trailing_zeros() as u16)
    }

    /// Records one more life-cycle transition and returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`OtpError::CounterExhausted`] after 24 transitions, or
    /// [`OtpError::InvalidWord`] when the counter item is corrupt.
    pub fn increment_transition_count(&self) -> Result<u16, OtpError> {
        let consumed = &self.config.count_consumed;
        self.memory.with(|bytes| {
            let item = &mut bytes[0x7A8..0x7A8 + COUNT_WORDS * 2];
            let count = self.decode_count(item)?;
            if count >= MAX_TRANSITIONS {
                warn!("transition counter already at its limit of {MAX_TRANSITIONS}");
                return Err(OtpError::CounterExhausted);
            }
            let index = usize::from(count);
            item[index * 2..index * 2 + 2].copy_from_slice(&consumed[index].to_le_bytes());
            debug!(count = count + 1, "life-cycle transition recorded");
            Ok(count + 1)
        })
    }

    /// Decodes the life-cycle state.
    ///
    /// # Errors
    ///
    /// Returns [`OtpError`] when the state item holds no valid encoding.
    pub fn life_cycle_state(&self) -> Result<LifeCycleState, OtpError> {
        let words = self.memory.read(0x7D8, STATE_WORDS * 2);
        if words.iter().all(|&byte| byte == 0) {
            return Ok(LifeCycleState::Raw);
        }
        let map = consumed_positions(
            "LC_STATE",
            &words,
            &self.config.state_unconsumed,
            &self.config.state_consumed,
        )?;
        STATE_POSITIONS
            .iter()
            .find(|(_, positions)| *positions == map)
            .map(|&(state, _)| state)
            .ok_or(OtpError::UnknownState(map))
    }

    /// Encodes `state` into the state item.
    pub fn set_life_cycle_state(&self, state: LifeCycleState) {
        let map = STATE_POSITIONS
            .iter()
            .find(|(candidate, _)| *candidate == state)
            .map_or(0, |&(_, positions)| positions);
        let words: Vec<u8> = (0..STATE_WORDS)
            .flat_map(|index| {
                let consumed = map & (1 << (STATE_WORDS - 1 - index)) != 0;
                let word = if state == LifeCycleState::Raw {
                    0
                } else if consumed {
                    self.config.state_consumed[index]
                } else {
                    self.config.state_unconsumed[index]
                };
                word.to_le_bytes()
            })
            .collect();
        self.memory.write(0x7D8, &words);
    }

    fn direct_read(&mut self) {
        #[allow(clippy::cast_possible_truncation)]
        let address = self.regs.value(self.fields.address) as usize;
        let (Some(partition), Some(item)) = (Partition::containing(address), item_at(address))
        else {
            error!("no OTP partition or item at {address:#x}");
            return;
        };
        if !self.is_readable(partition) {
            warn!(?partition, "direct read of a locked partition");
            self.regs.set_value(self.fields.err[partition.index()], ERR_ACCESS);
            self.regs.set_flag(self.fields.status[partition.index()], true);
            self.regs.set_value(self.fields.err[DAI_INDEX], ERR_ACCESS);
            self.regs.set_flag(self.fields.status[DAI_INDEX], true);
            self.irqs.raise(&mut self.regs, 1);
            return;
        }
        trace!(item = item.name, ?partition, "direct read at {address:#x}");
        let base = if item.is_64bit { address & !7 } else { address & !3 };
        self.regs
            .set_value(self.fields.rdata0, u64::from(self.memory.read_u32(base)));
        if item.is_64bit {
            self.regs
                .set_value(self.fields.rdata1, u64::from(self.memory.read_u32(base + 4)));
        }
        self.regs.set_flag(self.fields.dai_idle, true);
        self.irqs.raise(&mut self.regs, 0);
    }

    fn window_read(&self, offset: u64, width: AccessWidth) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let address = (offset - OTP_SW_CFG_WINDOW) as usize;
        match Partition::containing(address) {
            Some(partition) if self.is_readable(partition) => {
                let bytes = self.memory.read(address, usize::from(width.bytes()));
                bytes
                    .iter()
                    .rev()
                    .fold(0, |acc, &byte| (acc << 8) | u64::from(byte))
            }
            Some(partition) => {
                warn!(?partition, "window read of a locked partition");
                0
            }
            None => 0,
        }
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::Irq => self.irqs.update(&self.regs),
            Action::IrqTest => self.irqs.test(&mut self.regs, effect.new),
            Action::AlertTest => self.alerts.test(effect.new),
            Action::DaiRead => {
                if effect.new != 0 {
                    self.direct_read();
                }
            }
            Action::Digest(_) => {}
        }
    }
}

impl BusPeripheral for Otp {
    fn size(&self) -> u64 {
        OTP_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.irqs.reset();
        self.alerts.reset();
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        if offset >= OTP_SW_CFG_WINDOW {
            return self.window_read(offset, width);
        }
        let memory = &self.memory;
        self.regs.read_sized_with(offset, width, |action, _| match action {
            Action::Digest(word) => {
                let base = DIGEST_ITEMS[word / 2] + (word % 2) * 4;
                Some(u64::from(memory.read_u32(base)))
            }
            _ => None,
        })
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) {
        if offset >= OTP_SW_CFG_WINDOW {
            warn!("write to the read-only software config window at {offset:#x}");
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
    use rstest::rstest;

    use super::*;

    fn otp() -> Otp {
        Otp::new(OtpConfig::default()).unwrap()
    }

    #[test]
    fn direct_read_returns_item_words() {
        let mut otp = otp();
        otp.memory().write(0x680, &[0x11, 0x22, 0x33, 0x44]);
        otp.write_u32(OTP_INTR_ENABLE, 0b11);
        otp.write_u32(OTP_DAI_ADDRESS, 0x680);
        otp.write_u32(OTP_DAI_CMD, 1);
        assert_eq!(otp.read_u32(OTP_DAI_RDATA_0), 0x4433_2211);
        assert!(otp.irq("otp_operation_done").unwrap().is_set());
    }

    #[test]
    fn sixty_four_bit_items_fill_both_words() {
        let mut otp = otp();
        otp.memory().write(0x750, &[1, 0, 0, 0, 2, 0, 0, 0]);
        otp.write_u32(OTP_DAI_ADDRESS, 0x750);
        otp.write_u32(OTP_DAI_CMD, 1);
        assert_eq!(otp.read_u32(OTP_DAI_RDATA_0), 1);
        assert_eq!(otp.read_u32(OTP_DAI_RDATA_1), 2);
    }

    #[test]
    fn locked_partition_read_sets_dai_error() {
        let mut otp = otp();
        otp.memory().write(0x0F8, &[0xAA; 4]);
        otp.write_u32(OTP_DAI_ADDRESS, 0x0F8);
        otp.write_u32(OTP_DAI_CMD, 1);
        assert_eq!(otp.read_u32(OTP_DAI_RDATA_0), 0xAAAA_AAAA);

        otp.memory().write(0x0F8, &[0x55; 4]);
        otp.write_u32(OTP_CREATOR_SW_CFG_READ_LOCK, 0);
        otp.write_u32(OTP_DAI_CMD, 1);
        assert_eq!(otp.read_u32(OTP_DAI_RDATA_0), 0xAAAA_AAAA);
        let status = otp.read_u32(OTP_STATUS);
        assert_ne!(status & (1 << 8), 0);
        assert_ne!(status & (1 << 1), 0);
        assert_eq!((otp.read_u32(OTP_ERR_CODE) >> 24) & 0x7, 5);
        assert_eq!((otp.read_u32(OTP_ERR_CODE) >> 3) & 0x7, 5);
    }

    #[test]
    fn read_lock_cannot_be_reopened() {
        let mut otp = otp();
        otp.write_u32(OTP_VENDOR_TEST_READ_LOCK, 0);
        otp.write_u32(OTP_VENDOR_TEST_READ_LOCK, 1);
        assert!(!otp.is_readable(Partition::VendorTest));
    }

    #[test]
    fn window_reads_follow_locks() {
        let mut otp = otp();
        otp.memory().write(0x360, &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(otp.read_u32(OTP_SW_CFG_WINDOW + 0x360), 0x1234_5678);
        assert_eq!(otp.read_u16(OTP_SW_CFG_WINDOW + 0x362), 0x1234);
        otp.write_u32(OTP_OWNER_SW_CFG_READ_LOCK, 0);
        assert_eq!(otp.read_u32(OTP_SW_CFG_WINDOW + 0x360), 0);
    }

    #[test]
    fn digest_registers_mirror_memory() {
        let mut otp = otp();
        otp.memory().write(0x6C8, &[1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(otp.read_u32(OTP_DIGEST_BASE + 0x18), 1);
        assert_eq!(otp.read_u32(OTP_DIGEST_BASE + 0x1C), 2);
    }

    #[test]
    fn transition_counter_stops_at_limit() {
        let otp = otp();
        assert_eq!(otp.transition_count(), Ok(0));
        for expected in 1..=MAX_TRANSITIONS {
            assert_eq!(otp.increment_transition_count(), Ok(expected));
        }
        assert_eq!(otp.transition_count(), Ok(MAX_TRANSITIONS));
        assert_eq!(
            otp.increment_transition_count(),
            Err(OtpError::CounterExhausted)
        );
    }

    #[rstest]
    #[case(LifeCycleState::Raw)]
    #[case(LifeCycleState::TestUnlocked0)]
    #[case(LifeCycleState::Dev)]
    #[case(LifeCycleState::ProdEnd)]
    #[case(LifeCycleState::Scrap)]
    fn life_cycle_state_encoding(#[case] state: LifeCycleState) {
        let otp = otp();
        otp.set_life_cycle_state(state);
        assert_eq!(otp.life_cycle_state(), Ok(state));
    }

    #[test]
    fn corrupt_state_word_is_reported() {
        let otp = otp();
        otp.memory().write(0x7D8, &[0x34, 0x12]);
        assert_eq!(
            otp.life_cycle_state(),
            Err(OtpError::InvalidWord {
                item: "LC_STATE",
                index: 0,
                value: 0x1234
            })
        );
    }

    #[test]
    fn vmem_image_loads_low_halfwords() {
        let otp = otp();
        let stored = otp
            .memory()
            .load_vmem("// image\n@000340 0001BEEF 0002CAFE\n")
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(otp.memory().read_u32(0x680), 0xCAFE_BEEF);
        assert!(matches!(
            otp.memory().load_vmem("@zz 1"),
            Err(OtpError::Vmem { line: 1, .. })
        ));
    }

    #[test]
    fn short_encoding_chain_is_rejected() {
        let config = OtpConfig {
            state_consumed: vec![1, 2, 3],
            ..OtpConfig::default()
        };
        assert!(matches!(
            Otp::new(config),
            Err(ConfigError::InvalidArgument {
                name: "state_consumed",
                ..
            })
        ));
    }
}
