//! Entropy distribution network in front of a [`Csrng`].
//!
//! Consumers call [`Edn::request_data`] for one word at a time. When the
//! CSRNG runs dry the network re-issues commands on its own: the boot
//! generate command in boot mode, or queued generate/reseed commands in
//! auto mode.

use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, BankDiagnostics, BoundedFifo, BusPeripheral,
    Collaborator, ConfigError, FieldId, FieldMode, FieldSpec, GpioLine, RegisterBank, RegisterId,
    RegisterSpec, WriteEffect,
};
use tracing::{debug, warn};

use crate::csrng::{CommandStatus, Csrng};
use crate::irq::{AlertBlock, InterruptBlock};
use crate::multibit::MultiBitBool4;

/// Interrupt state register.
pub const EDN_INTR_STATE: u64 = 0x00;
/// Interrupt enable register.
pub const EDN_INTR_ENABLE: u64 = 0x04;
/// Interrupt test register.
pub const EDN_INTR_TEST: u64 = 0x08;
/// Alert test register.
pub const EDN_ALERT_TEST: u64 = 0x0C;
/// Write enable for `CTRL`, cleared by writing zero.
pub const EDN_REGWEN: u64 = 0x10;
/// Control register.
pub const EDN_CTRL: u64 = 0x14;
/// Boot-time instantiate command.
pub const EDN_BOOT_INS_CMD: u64 = 0x18;
/// Boot-time generate command.
pub const EDN_BOOT_GEN_CMD: u64 = 0x1C;
/// Software command port.
pub const EDN_SW_CMD_REQ: u64 = 0x20;
/// Software command status.
pub const EDN_SW_CMD_STS: u64 = 0x24;
/// Reseed command FIFO.
pub const EDN_RESEED_CMD: u64 = 0x28;
/// Generate command FIFO.
pub const EDN_GENERATE_CMD: u64 = 0x2C;
/// Requests between automatic reseeds.
pub const EDN_MAX_NUM_REQS_BETWEEN_RESEEDS: u64 = 0x30;
/// Recoverable alert status.
pub const EDN_RECOV_ALERT_STS: u64 = 0x34;
/// Error code.
pub const EDN_ERR_CODE: u64 = 0x38;
/// Error code test.
pub const EDN_ERR_CODE_TEST: u64 = 0x3C;
/// Main state machine state.
pub const EDN_MAIN_SM_STATE: u64 = 0x40;
/// Window length.
pub const EDN_SIZE: u64 = 0x1000;

/// Interrupt index of `edn_cmd_req_done`.
pub const EDN_IRQ_CMD_REQ_DONE: usize = 0;
/// Interrupt index of `edn_fatal_err`.
pub const EDN_IRQ_FATAL_ERR: usize = 1;

/// Depth of the reseed and generate command FIFOs.
pub const EDN_COMMAND_FIFO_DEPTH: usize = 13;

const ALERT_RECOV: usize = 0;
const ALERT_FATAL: usize = 1;

const ERR_RESEED_FIFO: u64 = 0;
const ERR_GENERATE_FIFO: u64 = 1;
const ERR_FIFO_WRITE: u64 = 28;
// ERR_CODE bits that ERR_CODE_TEST may set, and whether each is fatal.
const ERR_TESTABLE: [(u64, bool); 9] = [
    (0, true),
    (1, true),
    (2, true),
    (20, true),
    (21, true),
    (22, true),
    (28, false),
    (29, false),
    (30, false),
];

/// Main state machine encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum EdnState {
    /// Waiting for enable.
    Idle = 0b1_1000_0101,
    /// Boot sequence finished.
    BootDone = 0b0_1101_1111,
    /// Auto mode dispatching commands.
    AutoDispatch = 0b1_1010_1110,
    /// Software port mode.
    SwPortMode = 0b1_0011_1001,
}

#[allow(clippy::cast_possible_truncation)]
const fn low_word(value: u64) -> u32 {
    value as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Irq,
    IrqTest,
    AlertTest,
    Ctrl,
    BootCommand,
    SwCommand,
    ReseedCommand,
    GenerateCommand,
    MaxRequests,
    ErrCodeTest,
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    regwen: FieldId,
    ctrl: RegisterId,
    enable: FieldId,
    boot_mode: FieldId,
    auto_mode: FieldId,
    fifo_reset: FieldId,
    boot_gen: FieldId,
    cmd_sts: FieldId,
    requests_left: FieldId,
    recov: [FieldId; 4],
    err_code: RegisterId,
    main_sm: FieldId,
}

/// Entropy distribution network.
#[derive(Debug)]
pub struct Edn {
    regs: RegisterBank<Action>,
    fields: Fields,
    irqs: InterruptBlock,
    alerts: AlertBlock,
    csrng: Collaborator<Csrng>,
    reseed: BoundedFifo<u32>,
    generate: BoundedFifo<u32>,
    auto_on: bool,
    max_requests: u64,
}

impl Edn {
    /// Creates the network with no CSRNG attached.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the register layout is rejected.
    pub fn new() -> Result<Self, ConfigError> {
        let mut b = BankBuilder::new(BankConfig::named("edn"));
        let irqs = InterruptBlock::declare(
            &mut b,
            EDN_INTR_STATE,
            &["edn_cmd_req_done", "edn_fatal_err"],
            Action::Irq,
            Action::IrqTest,
        );
        let alerts = AlertBlock::declare(
            &mut b,
            EDN_ALERT_TEST,
            &["recov_alert", "fatal_alert"],
            Action::AlertTest,
        );
        let regwen = b.register_with(
            RegisterSpec::new(EDN_REGWEN).name("REGWEN").reset(1),
            FieldSpec::flag(0, "REGWEN").mode(FieldMode::WriteZeroToClear),
        );
        let ctrl = b.register(
            RegisterSpec::new(EDN_CTRL)
                .name("CTRL")
                .reset(0x9999)
                .on_write(Action::Ctrl),
        );
        let enable = b.field(ctrl, FieldSpec::value(0, 4, "EDN_ENABLE"));
        let boot_mode = b.field(ctrl, FieldSpec::value(4, 4, "BOOT_REQ_MODE"));
        let auto_mode = b.field(ctrl, FieldSpec::value(8, 4, "AUTO_REQ_MODE"));
        let fifo_reset = b.field(ctrl, FieldSpec::value(12, 4, "CMD_FIFO_RST"));

        b.register_with(
            RegisterSpec::new(EDN_BOOT_INS_CMD)
                .name("BOOT_INS_CMD")
                .reset(0x901),
            FieldSpec::value(0, 32, "BOOT_INS_CMD").on_write(Action::BootCommand),
        );
        let boot_gen = b.register_with(
            RegisterSpec::new(EDN_BOOT_GEN_CMD)
                .name("BOOT_GEN_CMD")
                .reset(0x00FF_F003),
            FieldSpec::value(0, 32, "BOOT_GEN_CMD").on_write(Action::BootCommand),
        );
        b.register_with(
            RegisterSpec::new(EDN_SW_CMD_REQ).name("SW_CMD_REQ"),
            FieldSpec::value(0, 32, "SW_CMD_REQ")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::SwCommand),
        );
        let sts = b.register(RegisterSpec::new(EDN_SW_CMD_STS).name("SW_CMD_STS").reset(1));
        b.field(sts, FieldSpec::flag(0, "CMD_RDY").mode(FieldMode::ReadOnly));
        let cmd_sts = b.field(sts, FieldSpec::flag(1, "CMD_STS").mode(FieldMode::ReadOnly));
        b.register_with(
            RegisterSpec::new(EDN_RESEED_CMD).name("RESEED_CMD"),
            FieldSpec::value(0, 32, "RESEED_CMD")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::ReseedCommand),
        );
        b.register_with(
            RegisterSpec::new(EDN_GENERATE_CMD).name("GENERATE_CMD"),
            FieldSpec::value(0, 32, "GENERATE_CMD")
                .mode(FieldMode::WriteOnly)
                .on_write(Action::GenerateCommand),
        );
        let requests_left = b.register_with(
            RegisterSpec::new(EDN_MAX_NUM_REQS_BETWEEN_RESEEDS).name("MAX_NUM_REQS_BETWEEN_RESEEDS"),
            FieldSpec::value(0, 32, "MAX_NUM_REQS_BETWEEN_RESEEDS").on_write(Action::MaxRequests),
        );

        let recov_reg = b.register(RegisterSpec::new(EDN_RECOV_ALERT_STS).name("RECOV_ALERT_STS"));
        let recov = [
            (0, "EDN_ENABLE_FIELD_ALERT"),
            (1, "BOOT_REQ_MODE_FIELD_ALERT"),
            (2, "AUTO_REQ_MODE_FIELD_ALERT"),
            (3, "CMD_FIFO_RST_FIELD_ALERT"),
        ]
        .map(|(bit, name)| {
            b.field(
                recov_reg,
                FieldSpec::flag(bit, name).mode(FieldMode::WriteZeroToClear),
            )
        });
        b.field(recov_reg, FieldSpec::unmodeled(12, 1, "EDN_BUS_CMP_ALERT"));

        let err_code = b.register(RegisterSpec::new(EDN_ERR_CODE).name("ERR_CODE"));
        for (bit, name) in [
            (0, "SFIFO_RESCMD_ERR"),
            (1, "SFIFO_GENCMD_ERR"),
            (2, "SFIFO_OUTPUT_ERR"),
            (20, "EDN_ACK_SM_ERR"),
            (21, "EDN_MAIN_SM_ERR"),
            (22, "EDN_CNTR_ERR"),
            (28, "FIFO_WRITE_ERR"),
            (29, "FIFO_READ_ERR"),
            (30, "FIFO_STATE_ERR"),
        ] {
            b.field(err_code, FieldSpec::flag(bit, name).mode(FieldMode::ReadOnly));
        }
        b.register_with(
            RegisterSpec::new(EDN_ERR_CODE_TEST).name("ERR_CODE_TEST"),
            FieldSpec::value(0, 5, "ERR_CODE_TEST").on_write(Action::ErrCodeTest),
        );
        let main_sm = b.register_with(
            RegisterSpec::new(EDN_MAIN_SM_STATE)
                .name("MAIN_SM_STATE")
                .reset(EdnState::Idle as u64),
            FieldSpec::value(0, 9, "MAIN_SM_STATE").mode(FieldMode::ReadOnly),
        );

        Ok(Self {
            regs: b.build()?,
            fields: Fields {
                regwen,
                ctrl,
                enable,
                boot_mode,
                auto_mode,
                fifo_reset,
                boot_gen,
                cmd_sts,
                requests_left,
                recov,
                err_code,
                main_sm,
            },
            irqs,
            alerts,
            csrng: Collaborator::detached(),
            reseed: BoundedFifo::new(EDN_COMMAND_FIFO_DEPTH),
            generate: BoundedFifo::new(EDN_COMMAND_FIFO_DEPTH),
            auto_on: false,
            max_requests: 0,
        })
    }

    /// Wires the CSRNG that executes commands and supplies data.
    pub fn set_csrng(&mut self, csrng: Collaborator<Csrng>) {
        self.csrng = csrng;
    }

    fn mubi(&self, field: FieldId) -> bool {
        MultiBitBool4::from_bits(self.regs.value(field)).is_true()
    }

    /// Whether `CTRL.EDN_ENABLE` holds the true encoding.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.mubi(self.fields.enable)
    }

    /// Whether auto request mode has been armed by a software command.
    #[must_use]
    pub const fn auto_mode_active(&self) -> bool {
        self.auto_on
    }

    /// Commands waiting in the reseed and generate FIFOs.
    #[must_use]
    pub fn queued_commands(&self) -> (usize, usize) {
        (self.reseed.len(), self.generate.len())
    }

    /// Current main state machine encoding.
    #[must_use]
    pub fn state(&self) -> u64 {
        self.regs.value(self.fields.main_sm)
    }

    /// Interrupt line by name.
    #[must_use]
    pub fn irq(&self, name: &str) -> Option<&GpioLine> {
        self.irqs.line(name)
    }

    /// Hands one word of CSRNG output to a consumer.
    ///
    /// Returns 0 when the network is disabled or no data is available. When
    /// the CSRNG buffer drains the next command is issued automatically.
    pub fn request_data(&mut self) -> u32 {
        if !self.is_enabled() {
            warn!("EDN is disabled, returning 0");
            return 0;
        }
        let (word, data_left) = match self.csrng.call(Csrng::request_data) {
            Ok(Some((word, left))) => (word, left > 0),
            Ok(None) => (0, false),
            Err(err) => {
                warn!("csrng unreachable: {err}");
                return 0;
            }
        };
        if !data_left && self.mubi(self.fields.boot_mode) {
            debug!("boot request mode, issuing boot generate command");
            let command = low_word(self.regs.value(self.fields.boot_gen));
            self.send_command(command);
        }
        if !data_left && self.auto_on {
            debug!("auto request mode, issuing generate command");
            match self.generate.pop() {
                Some(command) => self.send_command(command),
                None => warn!("generate command fifo is empty"),
            }
            let left = self.regs.value(self.fields.requests_left).saturating_sub(1);
            self.regs.set_value(self.fields.requests_left, left);
            if left == 0 {
                match self.reseed.pop() {
                    Some(command) => self.send_command(command),
                    None => warn!("reseed command fifo is empty"),
                }
                self.regs
                    .set_value(self.fields.requests_left, self.max_requests);
            }
        }
        word
    }

    fn send_command(&mut self, word: u32) {
        match self.csrng.call(|csrng| csrng.submit_command(word)) {
            Ok(status) => {
                let failed = matches!(status, CommandStatus::Failed | CommandStatus::Rejected);
                self.regs.set_flag(self.fields.cmd_sts, failed);
            }
            Err(err) => {
                warn!("command {word:#x} not delivered: {err}");
                self.regs.set_flag(self.fields.cmd_sts, true);
            }
        }
        self.irqs.raise(&mut self.regs, EDN_IRQ_CMD_REQ_DONE);
    }

    fn push_command(&mut self, reseed: bool, word: u32) {
        let (fifo, err_bit) = if reseed {
            (&mut self.reseed, ERR_RESEED_FIFO)
        } else {
            (&mut self.generate, ERR_GENERATE_FIFO)
        };
        if fifo.try_push(word).is_ok() {
            return;
        }
        warn!(reseed, "command fifo is full");
        let raw = self.regs.register_value(self.fields.err_code);
        self.regs.set_register_value(
            self.fields.err_code,
            raw | (1 << err_bit) | (1 << ERR_FIFO_WRITE),
        );
        self.alerts.blink(ALERT_FATAL);
        self.irqs.raise(&mut self.regs, EDN_IRQ_FATAL_ERR);
    }

    fn set_state(&mut self, state: EdnState) {
        self.regs.set_value(self.fields.main_sm, state as u64);
    }

    fn control(&mut self, old: u64) {
        if !self.regs.flag(self.fields.regwen) {
            warn!("CTRL write is disabled");
            self.regs.set_register_value(self.fields.ctrl, old);
            return;
        }
        let fields = [
            self.fields.enable,
            self.fields.boot_mode,
            self.fields.auto_mode,
            self.fields.fifo_reset,
        ];
        for (index, field) in fields.into_iter().enumerate() {
            if !MultiBitBool4::from_bits(self.regs.value(field)).is_valid() {
                warn!(field = self.regs.field_name(field), "invalid multi-bit value");
                self.regs.set_flag(self.fields.recov[index], true);
                self.alerts.blink(ALERT_RECOV);
            }
        }
        if matches!(
            MultiBitBool4::from_bits(self.regs.value(self.fields.auto_mode)),
            MultiBitBool4::False
        ) {
            self.auto_on = false;
        }
        if self.mubi(self.fields.fifo_reset) {
            debug!("clearing command fifos");
            self.reseed.clear();
            self.generate.clear();
        }
        if !self.is_enabled() {
            self.auto_on = false;
            self.set_state(EdnState::Idle);
        }
    }

    fn apply(&mut self, effect: WriteEffect<Action>) {
        match effect.action {
            Action::Irq => self.irqs.update(&self.regs),
            Action::IrqTest => self.irqs.test(&mut self.regs, effect.new),
            Action::AlertTest => self.alerts.test(effect.new),
            Action::Ctrl => self.control(effect.old),
            Action::BootCommand => {
                if !self.mubi(self.fields.boot_mode) {
                    warn!("boot request mode disabled, boot command has no effect");
                    return;
                }
                self.send_command(low_word(effect.new));
                self.set_state(EdnState::BootDone);
            }
            Action::SwCommand => {
                if self.auto_on {
                    warn!("auto request mode enabled, SW_CMD_REQ has no effect");
                    return;
                }
                if self.mubi(self.fields.auto_mode) {
                    self.auto_on = true;
                    self.set_state(EdnState::AutoDispatch);
                } else {
                    self.set_state(EdnState::SwPortMode);
                }
                self.send_command(low_word(effect.new));
            }
            Action::ReseedCommand => self.push_command(true, low_word(effect.new)),
            Action::GenerateCommand => self.push_command(false, low_word(effect.new)),
            Action::MaxRequests => self.max_requests = effect.new,
            Action::ErrCodeTest => {
                let Some(&(bit, fatal)) = ERR_TESTABLE.iter().find(|(bit, _)| *bit == effect.new)
                else {
                    debug!("ERR_CODE_TEST bit {} is not testable", effect.new);
                    return;
                };
                let raw = self.regs.register_value(self.fields.err_code);
                self.regs
                    .set_register_value(self.fields.err_code, raw | (1 << bit));
                if fatal {
                    self.irqs.raise(&mut self.regs, EDN_IRQ_FATAL_ERR);
                }
            }
        }
    }
}

impl BusPeripheral for Edn {
    fn size(&self) -> u64 {
        EDN_SIZE
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.irqs.reset();
        self.alerts.reset();
        self.reseed.clear();
        self.generate.clear();
        self.auto_on = false;
        self.max_requests = 0;
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
