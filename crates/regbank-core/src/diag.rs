//! Per-bank access diagnostics.

use crate::{AccessClass, AccessFault};

/// Saturating counters describing invalid traffic seen by one bank.
///
/// Diagnostics survive [`crate::RegisterBank::reset`]; only [`Self::reset`]
/// clears them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct BankDiagnostics {
    /// The last access fault recorded, if any.
    pub last_fault: Option<AccessFault>,
    /// Offset of the last recorded fault.
    pub last_fault_offset: u64,
    /// Saturating counter for unmapped-class faults.
    pub fault_count_unmapped: u32,
    /// Saturating counter for width-class faults.
    pub fault_count_width: u32,
    /// Saturating counter for layout-class faults.
    pub fault_count_layout: u32,
    /// Saturating counter for writes that reached unmodeled fields.
    pub unmodeled_write_count: u32,
}

impl BankDiagnostics {
    /// Creates an empty set of counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fault and bumps its class counter.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record(&mut self, fault: AccessFault, offset: u64) {
        self.last_fault = Some(fault);
        self.last_fault_offset = offset;
        match fault.class() {
            AccessClass::Unmapped => {
                self.fault_count_unmapped = self.fault_count_unmapped.saturating_add(1);
            }
            AccessClass::Width => {
                self.fault_count_width = self.fault_count_width.saturating_add(1);
            }
            AccessClass::Layout => {
                self.fault_count_layout = self.fault_count_layout.saturating_add(1);
            }
        }
    }

    /// Counts a write that landed on an unmodeled field.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_unmodeled_write(&mut self) {
        self.unmodeled_write_count = self.unmodeled_write_count.saturating_add(1);
    }

    /// Total number of faults across all classes.
    #[must_use]
    pub const fn total_faults(&self) -> u32 {
        self.fault_count_unmapped
            .saturating_add(self.fault_count_width)
            .saturating_add(self.fault_count_layout)
    }

    /// Clears every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::BankDiagnostics;
    use crate::AccessFault;

    #[test]
    fn record_tracks_last_fault_and_class() {
        let mut diag = BankDiagnostics::new();
        diag.record(AccessFault::UnmappedRead, 0x40);
        diag.record(AccessFault::MisalignedAccess, 0x13);

        assert_eq!(diag.last_fault, Some(AccessFault::MisalignedAccess));
        assert_eq!(diag.last_fault_offset, 0x13);
        assert_eq!(diag.fault_count_unmapped, 1);
        assert_eq!(diag.fault_count_width, 1);
        assert_eq!(diag.fault_count_layout, 0);
        assert_eq!(diag.total_faults(), 2);
    }

    #[test]
    fn counters_saturate() {
        let mut diag = BankDiagnostics {
            fault_count_layout: u32::MAX,
            ..BankDiagnostics::default()
        };
        diag.record(AccessFault::UndefinedBitsWrite, 0);
        assert_eq!(diag.fault_count_layout, u32::MAX);
    }

    #[test]
    fn reset_clears_everything() {
        let mut diag = BankDiagnostics::new();
        diag.record(AccessFault::UnmappedWrite, 4);
        diag.record_unmodeled_write();
        diag.reset();
        assert_eq!(diag, BankDiagnostics::default());
    }
}
