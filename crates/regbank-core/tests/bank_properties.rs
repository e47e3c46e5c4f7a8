//! Property coverage for the register-bank access rules.
//!
//! Round-trip masking, write-one-to-clear, reset and unmapped-access behavior
//! over arbitrary values and layouts.

#![allow(clippy::pedantic, clippy::nursery)]

use proptest::prelude::*;
use regbank_core::{
    bit_mask, AccessWidth, BankBuilder, BankConfig, FieldId, FieldMode, FieldSpec, RegisterBank,
    RegisterSpec,
};
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Act {
    Pending,
    Level,
}

fn single_field_bank(start: u32, width: u32, mode: FieldMode) -> (RegisterBank<Act>, FieldId) {
    let mut b = BankBuilder::new(BankConfig::named("prop"));
    let field = b.register_with(
        RegisterSpec::new(0x10),
        FieldSpec::value(start, width, "F")
            .mode(mode)
            .on_change(Act::Level),
    );
    (b.build().expect("valid layout"), field)
}

fn irq_bank() -> (RegisterBank<Act>, FieldId, FieldId) {
    let mut b = BankBuilder::new(BankConfig::named("irq"));
    let state = b.register_with(
        RegisterSpec::new(0x0).reset(0xA5),
        FieldSpec::value(0, 8, "INTR_STATE")
            .mode(FieldMode::WriteOneToClear)
            .on_write(Act::Pending),
    );
    let enable = b.register_with(
        RegisterSpec::new(0x4).reset(0x3C),
        FieldSpec::value(0, 8, "INTR_ENABLE").on_change(Act::Level),
    );
    (b.build().expect("valid layout"), state, enable)
}

fn field_layout() -> impl Strategy<Value = (u32, u32)> {
    (0u32..32).prop_flat_map(|start| (Just(start), 1u32..=(32 - start)))
}

proptest! {
    #[test]
    fn written_value_reads_back_masked((start, width) in field_layout(), value in any::<u64>()) {
        let (mut bank, field) = single_field_bank(start, width, FieldMode::ReadWrite);
        bank.write(0x10, (value << start) & 0xFFFF_FFFF);
        let expected = value & bit_mask(width);
        prop_assert_eq!(bank.value(field), expected & (0xFFFF_FFFF >> start));
        prop_assert_eq!(bank.read(0x10), (expected << start) & 0xFFFF_FFFF);
    }

    #[test]
    fn write_one_to_clear_only_clears_written_ones(stored in any::<u8>(), written in any::<u8>()) {
        let (mut bank, state, _) = irq_bank();
        bank.set_value(state, u64::from(stored));
        bank.write(0x0, u64::from(written));
        prop_assert_eq!(bank.value(state), u64::from(stored & !written));
    }

    #[test]
    fn reset_restores_every_register(a in any::<u32>(), b in any::<u32>()) {
        let (mut bank, state, enable) = irq_bank();
        bank.write(0x0, u64::from(a));
        bank.write(0x4, u64::from(b));
        bank.reset();
        prop_assert_eq!(bank.value(state), 0xA5);
        prop_assert_eq!(bank.value(enable), 0x3C);
        prop_assert_eq!(bank.read(0x0), 0xA5);
    }

    #[test]
    fn unmapped_offsets_never_fault(offset in 0x100u64..0x1_0000, value in any::<u64>()) {
        let (mut bank, _, _) = irq_bank();
        prop_assert_eq!(bank.read(offset), 0);
        prop_assert!(bank.write(offset, value).is_empty());
        prop_assert_eq!(bank.diagnostics().fault_count_unmapped, 2);
        prop_assert_eq!(bank.peek(0x0), Some(0xA5));
    }

    #[test]
    fn byte_lanes_compose_into_the_full_register(bytes in any::<[u8; 4]>()) {
        let (mut bank, _) = single_field_bank(0, 32, FieldMode::ReadWrite);
        for (lane, byte) in bytes.iter().enumerate() {
            bank.write_sized(0x10 + lane as u64, AccessWidth::Byte, u64::from(*byte));
        }
        prop_assert_eq!(bank.read(0x10), u64::from(u32::from_le_bytes(bytes)));
    }
}

#[test]
fn write_one_to_already_clear_bit_is_a_no_op() {
    let (mut bank, state, _) = irq_bank();
    bank.write(0x0, 0x01);
    assert_eq!(bank.value(state), 0xA4);
    bank.write(0x0, 0x01);
    assert_eq!(bank.value(state), 0xA4);
    bank.write(0x0, 0x00);
    assert_eq!(bank.value(state), 0xA4);
}

#[test]
fn reset_emits_no_effects_and_next_write_sees_reset_values() {
    let (mut bank, _, _) = irq_bank();
    bank.write(0x4, 0xFF);
    bank.reset();
    let effects = bank.write(0x4, 0x3C);
    assert!(effects.is_empty(), "unchanged enable must not report a change");
}

#[test]
fn write_only_fields_store_but_read_zero() {
    let (mut bank, field) = single_field_bank(4, 8, FieldMode::WriteOnly);
    bank.write(0x10, 0xAB0);
    assert_eq!(bank.value(field), 0xAB);
    assert_eq!(bank.read(0x10), 0);
}

#[test]
fn read_to_clear_returns_then_clears() {
    let (mut bank, field) = single_field_bank(0, 8, FieldMode::ReadToClear);
    bank.set_value(field, 0x42);
    assert_eq!(bank.read(0x10), 0x42);
    assert_eq!(bank.read(0x10), 0);
}

#[test]
fn unmodeled_bits_store_and_are_counted() {
    let (mut bank, field) = single_field_bank(0, 8, FieldMode::Unmodeled);
    let effects = bank.write(0x10, 0x5A);
    assert_eq!(bank.read(0x10), 0x5A);
    assert_eq!(bank.value(field), 0x5A);
    assert_eq!(effects.len(), 1);
    assert_eq!(bank.diagnostics().unmodeled_write_count, 1);
}

#[test]
fn toggle_and_set_modes() {
    let (mut bank, field) = single_field_bank(0, 4, FieldMode::Toggle);
    bank.write(0x10, 0b0101);
    bank.write(0x10, 0b0110);
    assert_eq!(bank.value(field), 0b0011);

    let (mut bank, field) = single_field_bank(0, 4, FieldMode::WriteOneToSet);
    bank.write(0x10, 0b0001);
    bank.write(0x10, 0b1000);
    assert_eq!(bank.value(field), 0b1001);
}
