//! Register-bank engine for emulated peripheral models.

/// Access widths and width/alignment policy helpers.
pub mod access;
pub use access::{bit_mask, validate_access_width, validate_alignment, AccessWidth};

/// Fault taxonomy for invalid bus traffic and construction errors.
pub mod fault;
pub use fault::{AccessClass, AccessFault, ConfigError};

/// Per-bank access diagnostics.
pub mod diag;
pub use diag::BankDiagnostics;

/// Bit-field descriptors and access modes.
pub mod field;
pub use field::{FieldId, FieldMode, FieldSpec};

/// Register cell declarations and write effects.
pub mod register;
pub use register::{RegisterId, RegisterSpec, WriteEffect};

/// Offset-addressed register bank and its builder.
pub mod bank;
pub use bank::{BankBuilder, RegisterBank};

/// Bus-facing peripheral contract, bank configuration and snapshots.
pub mod api;
pub use api::{BankConfig, BankSnapshot, BusPeripheral, SnapshotError, SnapshotVersion};

/// Interrupt and alert output lines.
pub mod signal;
pub use signal::GpioLine;

/// Capacity-bounded hardware FIFO.
pub mod fifo;
pub use fifo::{BoundedFifo, FifoFull};

/// Weak links to collaborating peripherals with a reentry guard.
pub mod link;
pub use link::{Collaborator, LinkError};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use tracing_subscriber as _;
