//! Peripheral models for the register-bank engine.
//!
//! Every model owns a [`regbank_core::RegisterBank`], dispatches the write
//! effects it returns and implements [`regbank_core::BusPeripheral`]. The
//! [`SystemBus`] places several models into one address space.

/// Four-bit multi-bit booleans.
pub mod multibit;
pub use multibit::{MultiBitBool4, UnknownEncoding};

/// Interrupt and alert register blocks.
pub mod irq;
pub use irq::{AlertBlock, InterruptBlock};

/// NIST SP 800-185 string encodings.
pub mod encode;

/// Minimal start/value random number generator.
pub mod rng;
pub use rng::{RngConfig, SimpleRng};

/// FIFO-backed true random number generator controller.
pub mod rngctrl;
pub use rngctrl::{RngCtrl, RngCtrlConfig, RngState};

/// SHA-256 and HMAC-SHA256 accelerator.
pub mod hmac;
pub use hmac::Hmac;

/// SHA-3, SHAKE, cSHAKE and KMAC accelerator.
pub mod kmac;
pub use kmac::{Kmac, KmacCommand, KmacConfig, KmacError};

/// Entropy source with conditioned and raw output.
pub mod entropy_src;
pub use entropy_src::{EntropyProvider, EntropySrc, EntropySrcConfig};

/// Cryptographically secure random number generator.
pub mod csrng;
pub use csrng::{CommandHeader, CommandStatus, Csrng, CsrngCommand, CsrngConfig, CsrngMode};

/// Entropy distribution network.
pub mod edn;
pub use edn::{Edn, EdnState};

/// Key manager with a one-way working-state chain.
pub mod keymgr;
pub use keymgr::{
    KeyDestination, Keymgr, KeymgrConfig, KeymgrOperation, OperationStatus, WorkingState,
};

/// One-time programmable memory controller.
pub mod otp;
pub use otp::{LifeCycleState, Otp, OtpConfig, OtpError, OtpItem, OtpMemory, Partition};

/// Domain-based access controller.
pub mod xrdc;
pub use xrdc::{
    AccessKind, AccessPolicy, MasterKind, MemoryWindow, PeripheralWindow, UnresolvedPolicy, Xrdc,
    XrdcConfig,
};

/// Address decoding across mapped peripherals.
pub mod bus;
pub use bus::{BusWindow, SystemBus};

