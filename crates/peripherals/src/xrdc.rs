//! Extended resource domain controller.
//!
//! Bus masters are assigned to domains. Memory region descriptors and
//! peripheral access descriptors hold a 3-bit access policy per domain, an
//! optional semaphore that gates writes, a lock state and a valid flag.
//! [`Xrdc::check_access`] evaluates a transaction against them.
//!
//! The controller does not see the system bus, so the address windows it
//! protects are declared up front: memories per region controller and
//! peripherals per slot.

use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BusPeripheral, ConfigError, FieldId,
    FieldMode, FieldSpec, RegisterBank, RegisterId, RegisterSpec, WriteEffect,
};
use tracing::{debug, error, warn};

/// Control register.
pub const XRDC_CR: u64 = 0x000;
/// Hardware configuration 0.
pub const XRDC_HWCFG0: u64 = 0x0F0;
/// Hardware configuration 1, the requesting master's domain.
pub const XRDC_HWCFG1: u64 = 0x0F4;
/// Hardware configuration 2.
pub const XRDC_HWCFG2: u64 = 0x0F8;
/// Master domain assignment configuration, one word per four masters.
pub const XRDC_MDACFG: u64 = 0x100;
/// Memory region configuration, one word per four region controllers.
pub const XRDC_MRCFG: u64 = 0x140;
/// Domain error location registers.
pub const XRDC_DERRLOC: u64 = 0x200;
/// Domain error words.
pub const XRDC_DERR: u64 = 0x400;
/// Process identifiers of core masters.
pub const XRDC_PID: u64 = 0x700;
/// Master domain assignment, `0x20` per master.
pub const XRDC_MDA: u64 = 0x800;
/// Peripheral domain access control, two words per slot.
pub const XRDC_PDAC: u64 = 0x1000;
/// Memory region descriptors, `0x200` per controller and `0x20` per descriptor.
pub const XRDC_MRGD: u64 = 0x2000;
/// Window length.
pub const XRDC_SIZE: u64 = 0x3000;

/// Peripheral slots shared by all peripheral access controllers.
pub const XRDC_SLOTS: usize = 512;
/// Hardware semaphores.
pub const XRDC_SEMAPHORES: usize = 16;
/// Upper bound on domains.
pub const XRDC_MAX_DOMAINS: u8 = 5;

const MAX_MASTERS: usize = 64;
const MAX_REGION_CONTROLLERS: usize = 8;
const MAX_REGION_DESCRIPTORS: u8 = 16;
const MAX_PERIPHERAL_CONTROLLERS: u8 = 16;
const LOCK_SHIFT: u32 = 29;
const MDA_LK1: u64 = 1 << 30;
// Region bounds are stored in 32-byte granules.
const GRANULE_SHIFT: u32 = 5;

const ACP_NAMES: [&str; XRDC_MAX_DOMAINS as usize] = ["D0ACP", "D1ACP", "D2ACP", "D3ACP", "D4ACP"];

/// Direction of a checked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessKind {
    /// Data read or instruction fetch.
    Read,
    /// Data write.
    Write,
}

/// Per-domain access control policy, the 3-bit `DxACP` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessPolicy {
    /// Nothing allowed.
    AllNotAllowed = 0b000,
    /// Secure reads only.
    SecureReadAllowed = 0b001,
    /// Secure privileged accesses only.
    SecurePrivilegedAllowed = 0b010,
    /// Secure accesses only.
    SecureAllowed = 0b011,
    /// Secure accesses and non-secure privileged reads.
    SecureAndNonsecurePrivilegedRead = 0b100,
    /// Everything except non-secure writes.
    NonsecureWritesNotAllowed = 0b101,
    /// Everything except non-secure unprivileged accesses.
    NonsecureUnprivilegedNotAllowed = 0b110,
    /// Everything allowed.
    AllAllowed = 0b111,
}

impl AccessPolicy {
    /// Decodes the low three bits.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        match bits & 0b111 {
            0b000 => Self::AllNotAllowed,
            0b001 => Self::SecureReadAllowed,
            0b010 => Self::SecurePrivilegedAllowed,
            0b011 => Self::SecureAllowed,
            0b100 => Self::SecureAndNonsecurePrivilegedRead,
            0b101 => Self::NonsecureWritesNotAllowed,
            0b110 => Self::NonsecureUnprivilegedNotAllowed,
            _ => Self::AllAllowed,
        }
    }

    /// Whether a transaction with these attributes passes the policy.
    #[must_use]
    pub fn allows(self, access: AccessKind, secure: bool, privileged: bool) -> bool {
        let read = access == AccessKind::Read;
        match self {
            Self::AllAllowed => true,
            Self::NonsecureUnprivilegedNotAllowed => secure || privileged,
            Self::NonsecureWritesNotAllowed => read || secure,
            Self::SecureAndNonsecurePrivilegedRead => secure || (read && privileged),
            Self::SecureAllowed => secure,
            Self::SecurePrivilegedAllowed => secure && privileged,
            Self::SecureReadAllowed => read && secure,
            Self::AllNotAllowed => false,
        }
    }
}

/// Verdict for transactions no valid descriptor covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum UnresolvedPolicy {
    /// Reject the transaction.
    #[default]
    Deny,
    /// Let the transaction through.
    Allow,
}

/// Kind of bus master, which selects the `MDA` register format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MasterKind {
    /// Processor core.
    #[default]
    Core,
    /// DMA engine or other non-core master.
    Noncore,
}

/// Memory owned by a region controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MemoryWindow {
    /// Region controller index.
    pub controller: u8,
    /// First byte address.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
}

/// Peripheral owned by an access control slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct PeripheralWindow {
    /// Peripheral access controller index.
    pub controller: u8,
    /// Slot whose descriptor governs the peripheral.
    pub slot: u16,
    /// First byte address.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
}

/// Construction parameters of an [`Xrdc`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct XrdcConfig {
    /// Number of domains, 1 to 5.
    pub domains: u8,
    /// Bus masters in `MDA` order.
    pub masters: Vec<MasterKind>,
    /// Descriptor count of each memory region controller.
    pub region_descriptors: Vec<u8>,
    /// Number of peripheral access controllers.
    pub peripheral_controllers: u8,
    /// Protected memories.
    pub memories: Vec<MemoryWindow>,
    /// Protected peripherals.
    pub peripherals: Vec<PeripheralWindow>,
    /// Verdict when no valid descriptor covers a target.
    pub unresolved: UnresolvedPolicy,
}

impl Default for XrdcConfig {
    fn default() -> Self {
        Self {
            domains: XRDC_MAX_DOMAINS,
            masters: vec![MasterKind::Core, MasterKind::Noncore],
            region_descriptors: vec![8],
            peripheral_controllers: 3,
            memories: Vec::new(),
            peripherals: Vec::new(),
            unresolved: UnresolvedPolicy::Deny,
        }
    }
}

impl XrdcConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name, reason: String| Err(ConfigError::InvalidArgument { name, reason });
        if self.domains == 0 || self.domains > XRDC_MAX_DOMAINS {
            return invalid(
                "domains",
                format!("{} not in 1..={XRDC_MAX_DOMAINS}", self.domains),
            );
        }
        if self.masters.len() > MAX_MASTERS {
            return invalid("masters", format!("at most {MAX_MASTERS} masters"));
        }
        if self.region_descriptors.len() > MAX_REGION_CONTROLLERS {
            return invalid(
                "region_descriptors",
                format!("at most {MAX_REGION_CONTROLLERS} region controllers"),
            );
        }
        if let Some(count) = self
            .region_descriptors
            .iter()
            .find(|&&count| count > MAX_REGION_DESCRIPTORS)
        {
            return invalid(
                "region_descriptors",
                format!("{count} descriptors, at most {MAX_REGION_DESCRIPTORS}"),
            );
        }
        if self.peripheral_controllers > MAX_PERIPHERAL_CONTROLLERS {
            return invalid(
                "peripheral_controllers",
                format!("at most {MAX_PERIPHERAL_CONTROLLERS} controllers"),
            );
        }
        Ok(())
    }
}

/// `LK2` lock states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lock {
    Unlocked,
    // Unlocked for peripheral descriptors, reserved for memory regions.
    Alternate,
    OwnerPolicyOnly,
    Locked,
}

impl Lock {
    const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Self::Unlocked,
            0b01 => Self::Alternate,
            0b10 => Self::OwnerPolicyOnly,
            _ => Self::Locked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorKind {
    Peripheral,
    Region,
}

impl DescriptorKind {
    fn is_open(self, lock: Lock) -> bool {
        lock == Lock::Unlocked || (self == Self::Peripheral && lock == Lock::Alternate)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    start: FieldId,
    end: FieldId,
}

#[derive(Debug, Clone)]
struct Descriptor {
    kind: DescriptorKind,
    policy_reg: RegisterId,
    control_reg: RegisterId,
    policies: Vec<FieldId>,
    semaphore: FieldId,
    semaphore_enable: FieldId,
    lock: FieldId,
    valid: FieldId,
    bounds: Option<Bounds>,
}

impl Descriptor {
    fn declare(
        b: &mut BankBuilder<Action>,
        kind: DescriptorKind,
        base: u64,
        domains: u8,
        policy_action: Action,
        control_action: Action,
    ) -> Self {
        let policy_reg = b.register(
            RegisterSpec::new(base)
                .name("DAC_W0")
                .on_write(policy_action),
        );
        let policies = ACP_NAMES[..usize::from(domains)]
            .iter()
            .zip((0u32..).step_by(3))
            .map(|(&name, start)| b.field(policy_reg, FieldSpec::value(start, 3, name)))
            .collect();
        let used = 3 * u32::from(domains);
        if used < 24 {
            b.field(policy_reg, FieldSpec::unmodeled(used, 24 - used, "RESERVED"));
        }
        let semaphore = b.field(policy_reg, FieldSpec::value(24, 4, "SNUM"));
        b.field(policy_reg, FieldSpec::reserved(28, 2));
        let semaphore_enable = b.field(policy_reg, FieldSpec::flag(30, "SE"));
        b.field(policy_reg, FieldSpec::reserved(31, 1));

        let control_reg = b.register(
            RegisterSpec::new(base + 4)
                .name("DAC_W1")
                .on_write(control_action),
        );
        b.field(control_reg, FieldSpec::reserved(0, LOCK_SHIFT));
        let lock = b.field(control_reg, FieldSpec::value(LOCK_SHIFT, 2, "LK2"));
        let valid = b.field(control_reg, FieldSpec::flag(31, "VLD"));
        Self {
            kind,
            policy_reg,
            control_reg,
            policies,
            semaphore,
            semaphore_enable,
            lock,
            valid,
            bounds: None,
        }
    }

    fn lock(&self, regs: &RegisterBank<Action>) -> Lock {
        Lock::from_bits(regs.value(self.lock))
    }

    fn contains(&self, regs: &RegisterBank<Action>, address: u64) -> bool {
        self.bounds.is_some_and(|bounds| {
            let granule = address >> GRANULE_SHIFT;
            regs.value(bounds.start) <= granule && granule <= regs.value(bounds.end)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    CurrentDomain,
    MasterAssignment(usize),
    PeripheralPolicy(usize),
    PeripheralControl(usize),
    RegionBounds(usize, usize),
    RegionPolicy(usize, usize),
    RegionControl(usize, usize),
}

#[derive(Debug, Clone, Copy)]
struct Master {
    kind: MasterKind,
    domain: FieldId,
}

/// Restores `register` to `old` except for the `allowed` fields, which keep
/// their freshly written values. Returns whether anything was reverted.
fn keep_only(
    regs: &mut RegisterBank<Action>,
    register: RegisterId,
    old: u64,
    allowed: &[FieldId],
) -> bool {
    let written: Vec<(FieldId, u64)> = allowed.iter().map(|&f| (f, regs.value(f))).collect();
    let now = regs.register_value(register);
    regs.set_register_value(register, old);
    for (field, value) in written {
        regs.set_value(field, value);
    }
    regs.register_value(register) != now
}

/// Domain access controller.
#[derive(Debug)]
pub struct Xrdc {
    regs: RegisterBank<Action>,
    global_valid: FieldId,
    domains: u8,
    masters: Vec<Master>,
    peripherals: Vec<Descriptor>,
    regions: Vec<Vec<Descriptor>>,
    peripheral_controllers: u8,
    memory_windows: Vec<MemoryWindow>,
    peripheral_windows: Vec<PeripheralWindow>,
    semaphores: [Option<u8>; XRDC_SEMAPHORES],
    current_master: Option<usize>,
    unresolved: UnresolvedPolicy,
}

impl Xrdc {
    /// Creates the controller and maps the configured windows.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] for out-of-range counts or
    /// windows, or [`ConfigError`] if the register layout is rejected.
    pub fn new(config: XrdcConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let domains = config.domains;
        let mut b = BankBuilder::new(BankConfig::named("xrdc"));

        let cr = b.register(
            RegisterSpec::new(XRDC_CR)
                .name("CR")
                .reset(0x8A),
        );
        let global_valid = b.field(cr, FieldSpec::flag(0, "GVLD"));
        b.field(cr, FieldSpec::unmodeled(1, 4, "HRL"));
        b.field(cr, FieldSpec::reserved(5, 2));
        b.field(cr, FieldSpec::unmodeled(7, 1, "MRF"));
        b.field(cr, FieldSpec::unmodeled(8, 1, "VAW"));
        b.field(cr, FieldSpec::reserved(9, 21));
        b.field(cr, FieldSpec::unmodeled(30, 1, "LK1"));
        b.field(cr, FieldSpec::reserved(31, 1));

        let count_minus_one = |count: usize| u64::try_from(count.saturating_sub(1)).unwrap_or(0);
        let hwcfg0_reset = count_minus_one(usize::from(domains))
            | count_minus_one(config.masters.len()) << 8
            | count_minus_one(config.region_descriptors.len()) << 16
            | count_minus_one(usize::from(config.peripheral_controllers)) << 24
            | 1 << 28;
        let hwcfg0 = b.register(
            RegisterSpec::new(XRDC_HWCFG0)
                .name("HWCFG0")
                .reset(hwcfg0_reset),
        );
        for (start, width, name) in [
            (0, 8, "NDID"),
            (8, 8, "NMSTR"),
            (16, 8, "NMRC"),
            (24, 4, "NPAC"),
            (28, 4, "MID"),
        ] {
            b.field(hwcfg0, FieldSpec::value(start, width, name).mode(FieldMode::ReadOnly));
        }
        b.register_with(
            RegisterSpec::new(XRDC_HWCFG1).name("HWCFG1"),
            FieldSpec::value(0, 4, "DID")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::CurrentDomain),
        );
        b.register_with(
            RegisterSpec::new(XRDC_HWCFG2).name("HWCFG2"),
            FieldSpec::value(0, 31, "PIDP").mode(FieldMode::ReadOnly),
        );

        for (group, masters) in (0u64..).zip(config.masters.chunks(4)) {
            let mut reset = 0;
            for (lane, &kind) in (0u64..).zip(masters) {
                reset |= (1 | u64::from(kind == MasterKind::Noncore) << 7) << (8 * lane);
            }
            let reg = b.register(
                RegisterSpec::new(XRDC_MDACFG + 4 * group)
                    .name("MDACFG")
                    .reset(reset),
            );
            for lane in (0u32..).take(masters.len()) {
                b.field(
                    reg,
                    FieldSpec::value(8 * lane, 4, "NMDAR").mode(FieldMode::ReadOnly),
                );
                b.field(reg, FieldSpec::flag(8 * lane + 7, "NCM").mode(FieldMode::ReadOnly));
            }
        }
        for (group, counts) in (0u64..).zip(config.region_descriptors.chunks(4)) {
            let mut reset = 0;
            for (lane, &count) in (0u64..).zip(counts) {
                reset |= u64::from(count) << (8 * lane);
            }
            let reg = b.register(
                RegisterSpec::new(XRDC_MRCFG + 4 * group)
                    .name("MRCFG")
                    .reset(reset),
            );
            for lane in (0u32..).take(counts.len()) {
                b.field(
                    reg,
                    FieldSpec::value(8 * lane, 5, "NMRGD").mode(FieldMode::ReadOnly),
                );
            }
        }
        for index in 0..u64::from(XRDC_MAX_DOMAINS) {
            let reg = b.register(RegisterSpec::new(XRDC_DERRLOC + 4 * index).name("DERRLOC"));
            b.field(reg, FieldSpec::unmodeled(0, 16, "MRCINST"));
            b.field(reg, FieldSpec::unmodeled(16, 4, "PACINST"));
        }
        let error_words = (0u64..)
            .take(config.region_descriptors.len())
            .map(|index| XRDC_DERR + 0x10 * index)
            .chain(
                (0u64..)
                    .take(usize::from(config.peripheral_controllers))
                    .map(|index| XRDC_DERR + 0x100 + 0x10 * index),
            );
        for base in error_words {
            b.register_with(
                RegisterSpec::new(base).name("DERR_W0"),
                FieldSpec::unmodeled(0, 32, "EADDR"),
            );
            b.register_with(
                RegisterSpec::new(base + 4).name("DERR_W1"),
                FieldSpec::unmodeled(0, 32, "EDID_EATR_ERW_EPORT_EST"),
            );
        }

        let mut masters = Vec::with_capacity(config.masters.len());
        for (index, &kind) in config.masters.iter().enumerate() {
            let position = u64::try_from(index).unwrap_or(0);
            if kind == MasterKind::Core {
                let pid = b.register(RegisterSpec::new(XRDC_PID + 4 * position).name("PID"));
                b.field(pid, FieldSpec::unmodeled(0, 6, "PID"));
                b.field(pid, FieldSpec::unmodeled(28, 1, "TSM"));
                b.field(pid, FieldSpec::unmodeled(29, 2, "LK2"));
            }
            let noncore = kind == MasterKind::Noncore;
            let register = b.register(
                RegisterSpec::new(XRDC_MDA + 0x20 * position)
                    .name("MDA")
                    .reset(u64::from(noncore) << 29)
                    .on_write(Action::MasterAssignment(index)),
            );
            let domain = b.field(register, FieldSpec::value(0, 3, "DID"));
            if noncore {
                b.field(register, FieldSpec::value(4, 2, "PA"));
                b.field(register, FieldSpec::value(6, 2, "SA"));
                b.field(register, FieldSpec::flag(8, "DIDB"));
            } else {
                b.field(register, FieldSpec::value(4, 2, "DIDS"));
                b.field(register, FieldSpec::value(6, 2, "PE"));
                b.field(register, FieldSpec::value(8, 6, "PIDM"));
                b.field(register, FieldSpec::value(16, 6, "PID"));
            }
            b.field(register, FieldSpec::flag(29, "DFMT").mode(FieldMode::ReadOnly));
            b.field(register, FieldSpec::flag(30, "LK1"));
            b.field(register, FieldSpec::flag(31, "VLD"));
            masters.push(Master { kind, domain });
        }

        let peripherals = (0..XRDC_SLOTS)
            .zip((XRDC_PDAC..).step_by(8))
            .map(|(slot, base)| {
                Descriptor::declare(
                    &mut b,
                    DescriptorKind::Peripheral,
                    base,
                    domains,
                    Action::PeripheralPolicy(slot),
                    Action::PeripheralControl(slot),
                )
            })
            .collect();

        let mut regions = Vec::with_capacity(config.region_descriptors.len());
        for (controller, (&count, controller_base)) in config
            .region_descriptors
            .iter()
            .zip((XRDC_MRGD..).step_by(0x200))
            .enumerate()
        {
            let mut descriptors = Vec::with_capacity(usize::from(count));
            for (index, base) in (0..usize::from(count)).zip((controller_base..).step_by(0x20)) {
                let start_reg = b.register(
                    RegisterSpec::new(base)
                        .name("MRGD_W0")
                        .on_write(Action::RegionBounds(controller, index)),
                );
                b.field(start_reg, FieldSpec::reserved(0, GRANULE_SHIFT));
                let start = b.field(start_reg, FieldSpec::value(GRANULE_SHIFT, 27, "SRTADDR"));
                let end_reg = b.register(
                    RegisterSpec::new(base + 4)
                        .name("MRGD_W1")
                        .reset(0x1F)
                        .on_write(Action::RegionBounds(controller, index)),
                );
                b.field(end_reg, FieldSpec::reserved(0, GRANULE_SHIFT));
                let end = b.field(end_reg, FieldSpec::value(GRANULE_SHIFT, 27, "ENDADDR"));
                let mut descriptor = Descriptor::declare(
                    &mut b,
                    DescriptorKind::Region,
                    base + 8,
                    domains,
                    Action::RegionPolicy(controller, index),
                    Action::RegionControl(controller, index),
                );
                descriptor.bounds = Some(Bounds { start, end });
                descriptors.push(descriptor);
            }
            regions.push(descriptors);
        }

        let mut xrdc = Self {
            regs: b.build()?,
            global_valid,
            domains,
            masters,
            peripherals,
            regions,
            peripheral_controllers: config.peripheral_controllers,
            memory_windows: Vec::new(),
            peripheral_windows: Vec::new(),
            semaphores: [None; XRDC_SEMAPHORES],
            current_master: None,
            unresolved: config.unresolved,
        };
        for window in config.memories {
            xrdc.map_memory(window)?;
        }
        for window in config.peripherals {
            xrdc.map_peripheral(window)?;
        }
        Ok(xrdc)
    }

    /// Places a memory under a region controller.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] for an unknown controller.
    pub fn map_memory(&mut self, window: MemoryWindow) -> Result<(), ConfigError> {
        if usize::from(window.controller) >= self.regions.len() {
            return Err(ConfigError::InvalidArgument {
                name: "controller",
                reason: format!("region controller {} does not exist", window.controller),
            });
        }
        self.memory_windows.push(window);
        Ok(())
    }

    /// Places a peripheral under an access control slot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidArgument`] for an unknown controller, a
    /// slot out of range or a slot that is already taken.
    pub fn map_peripheral(&mut self, window: PeripheralWindow) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::InvalidArgument { name: "slot", reason });
        if window.controller >= self.peripheral_controllers {
            return invalid(format!(
                "peripheral controller {} does not exist",
                window.controller
            ));
        }
        if usize::from(window.slot) >= XRDC_SLOTS {
            return invalid(format!("slot {} not below {XRDC_SLOTS}", window.slot));
        }
        if self.peripheral_windows.iter().any(|w| w.slot == window.slot) {
            return invalid(format!("slot {} already registered", window.slot));
        }
        self.peripheral_windows.push(window);
        Ok(())
    }

    /// Whether `CR.GVLD` enables checking.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.regs.flag(self.global_valid)
    }

    /// Marks which master issues the following register accesses.
    ///
    /// Lock state `OwnerPolicyOnly` lets only this master's domain rewrite
    /// its own policy, and `HWCFG1.DID` reports it.
    pub fn set_current_master(&mut self, master: Option<usize>) {
        self.current_master = master;
    }

    /// Domain assigned to `master` by its `MDA` register.
    #[must_use]
    pub fn domain_of(&self, master: usize) -> Option<u8> {
        self.masters
            .get(master)
            .and_then(|m| u8::try_from(self.regs.value(m.domain)).ok())
    }

    /// Kind of `master`.
    #[must_use]
    pub fn master_kind(&self, master: usize) -> Option<MasterKind> {
        self.masters.get(master).map(|m| m.kind)
    }

    fn current_domain(&self) -> Option<u8> {
        self.current_master.and_then(|master| self.domain_of(master))
    }

    /// Assigns semaphore `index` to `owner`, or frees it.
    pub fn set_semaphore(&mut self, index: usize, owner: Option<u8>) {
        if index >= XRDC_SEMAPHORES {
            warn!("semaphore {index} does not exist");
            return;
        }
        if owner.is_some_and(|domain| domain >= self.domains) {
            warn!(?owner, "semaphore {index} assigned to a missing domain");
            return;
        }
        self.semaphores[index] = owner;
    }

    /// Current owner of semaphore `index`.
    #[must_use]
    pub fn semaphore(&self, index: usize) -> Option<u8> {
        self.semaphores.get(index).copied().flatten()
    }

    /// Checks a transaction issued by `master`.
    ///
    /// Unknown masters are rejected.
    #[must_use]
    pub fn check_access_for_master(
        &self,
        master: usize,
        address: u64,
        access: AccessKind,
        secure: bool,
        privileged: bool,
    ) -> bool {
        let Some(domain) = self.domain_of(master) else {
            error!("transaction from unknown master {master}");
            return false;
        };
        self.check_access(domain, address, access, secure, privileged)
    }

    /// Checks a transaction issued from `domain`.
    ///
    /// Everything passes while `CR.GVLD` is clear. Otherwise every valid
    /// descriptor covering `address` is consulted: a locked semaphore decides
    /// writes outright, and any policy that allows the access lets it
    /// through. When valid descriptors exist but none allows the access it
    /// is rejected. When none exists the configured [`UnresolvedPolicy`]
    /// decides.
    #[must_use]
    pub fn check_access(
        &self,
        domain: u8,
        address: u64,
        access: AccessKind,
        secure: bool,
        privileged: bool,
    ) -> bool {
        if !self.is_enabled() {
            debug!("global valid flag not set");
            return true;
        }
        if domain >= self.domains {
            warn!(domain, "transaction from a missing domain");
            return false;
        }
        let mut matched = false;
        for descriptor in self.target_descriptors(address) {
            if !self.regs.flag(descriptor.valid) {
                continue;
            }
            matched = true;
            if access == AccessKind::Write && self.regs.flag(descriptor.semaphore_enable) {
                let number = usize::try_from(self.regs.value(descriptor.semaphore)).unwrap_or(0);
                if let Some(owner) = self.semaphore(number) {
                    debug!(owner, domain, "semaphore {number} locked");
                    return owner == domain;
                }
            }
            let policy = AccessPolicy::from_bits(
                self.regs
                    .value(descriptor.policies[usize::from(domain)]),
            );
            if policy.allows(access, secure, privileged) {
                debug!(?policy, ?access, secure, privileged, "access allowed");
                return true;
            }
        }
        if matched {
            debug!(address, "no policy allows the access");
            return false;
        }
        debug!(address, policy = ?self.unresolved, "target access control policy not found");
        self.unresolved == UnresolvedPolicy::Allow
    }

    fn target_descriptors(&self, address: u64) -> Vec<&Descriptor> {
        let inside = |base: u64, size: u64| address >= base && address - base < size;
        if let Some(window) = self
            .memory_windows
            .iter()
            .find(|w| inside(w.base, w.size))
        {
            return self.regions[usize::from(window.controller)]
                .iter()
                .filter(|d| d.contains(&self.regs, address))
                .collect();
        }
        self.peripheral_windows
            .iter()
            .find(|w| inside(w.base, w.size))
            .map(|w| &self.peripherals[usize::from(w.slot)])
            .into_iter()
            .collect()
    }

    fn descriptor(&self, action: Action) -> Option<&Descriptor> {
        match action {
            Action::PeripheralPolicy(slot) | Action::PeripheralControl(slot) => {
                self.peripherals.get(slot)
            }
            Action::RegionBounds(c, i) | Action::RegionPolicy(c, i) | Action::RegionControl(c, i) => {
                self.regions.get(c).and_then(|regions| regions.get(i))
            }
            _ => None,
        }
    }

    fn guard_policy(&mut self, action: Action, old: u64) {
        let current = self.current_domain();
        let Some(descriptor) = self.descriptor(action) else {
            return;
        };
        let lock = descriptor.lock(&self.regs);
        let open = descriptor.kind.is_open(lock);
        let mut allowed: Vec<FieldId> = (0u8..)
            .zip(&descriptor.policies)
            .filter(|&(domain, _)| {
                open || (lock == Lock::OwnerPolicyOnly && current == Some(domain))
            })
            .map(|(_, &field)| field)
            .collect();
        if open {
            allowed.push(descriptor.semaphore);
            allowed.push(descriptor.semaphore_enable);
        }
        let register = descriptor.policy_reg;
        if keep_only(&mut self.regs, register, old, &allowed) {
            warn!(?lock, "descriptor is locked, write partially dropped");
        }
    }

    fn guard_control(&mut self, action: Action, old: u64) {
        let Some(descriptor) = self.descriptor(action) else {
            return;
        };
        let old_lock = Lock::from_bits(old >> LOCK_SHIFT);
        let new_lock = descriptor.lock(&self.regs);
        let mut allowed = Vec::with_capacity(2);
        if descriptor.kind.is_open(old_lock) {
            allowed.push(descriptor.valid);
            if !(descriptor.kind == DescriptorKind::Region && new_lock == Lock::Alternate) {
                allowed.push(descriptor.lock);
            }
        }
        let register = descriptor.control_reg;
        if keep_only(&mut self.regs, register, old, &allowed) {
            warn!(lock = ?old_lock, "descriptor control write dropped");
        }
    }

    fn guard_bounds(&mut self, action: Action, register: RegisterId, old: u64) {
        let Some(descriptor) = self.descriptor(action) else {
            return;
        };
        let lock = descriptor.lock(&self.regs);
        if descriptor.kind.is_open(lock) {
            return;
        }
        warn!(?lock, "region bounds are locked");
        self.regs.set_register_value(register, old);
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::CurrentDomain => {}
            Action::MasterAssignment(master) => {
                if effect.old & MDA_LK1 != 0 {
                    warn!(master, "domain assignment is locked");
                    self.regs.set_register_value(effect.register, effect.old);
                }
            }
            Action::PeripheralPolicy(_) | Action::RegionPolicy(..) => {
                self.guard_policy(effect.action, effect.old);
            }
            Action::PeripheralControl(_) | Action::RegionControl(..) => {
                self.guard_control(effect.action, effect.old);
            }
            Action::RegionBounds(..) => {
                self.guard_bounds(effect.action, effect.register, effect.old);
            }
        }
    }
}

impl BusPeripheral for Xrdc {
    fn size(&self) -> u64 {
        XRDC_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.semaphores = [None; XRDC_SEMAPHORES];
    }

    fn read(&mut self, offset: u64, width: AccessWidth) -> u64 {
        let current = self.current_domain();
        self.regs
            .read_sized_with(offset, width, |action, _| match action {
                Action::CurrentDomain => Some(current.map_or_else(
                    || {
                        warn!("requesting master unknown, returning DID 0");
                        0
                    },
                    u64::from,
                )),
                _ => None,
            })
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) {
        for effect in self.regs.write_sized(offset, width, value) {
            self.apply(effect);
        }
    }

    fn diagnostics(&self) -> Option<BankDiagnostics> {
        Some(*self.regs.diagnostics())
    }
}
