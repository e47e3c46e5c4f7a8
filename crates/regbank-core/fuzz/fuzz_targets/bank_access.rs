#![no_main]

use libfuzzer_sys::fuzz_target;
use regbank_core::{
    validate_access_width, validate_alignment, AccessWidth, BankBuilder, BankConfig, FieldMode,
    FieldSpec, RegisterSpec,
};

const MODES: [FieldMode; 10] = [
    FieldMode::ReadWrite,
    FieldMode::ReadOnly,
    FieldMode::WriteOnly,
    FieldMode::WriteOneToClear,
    FieldMode::WriteZeroToClear,
    FieldMode::WriteOneToSet,
    FieldMode::Toggle,
    FieldMode::ReadToClear,
    FieldMode::Reserved,
    FieldMode::Unmodeled,
];

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    let (layout, traffic) = data.split_at(8);

    let mut builder: BankBuilder<u8> = BankBuilder::new(BankConfig::named("fuzz"));
    for (index, pair) in layout.chunks_exact(2).enumerate() {
        let register = builder.register(
            RegisterSpec::new(index as u64 * 4).reset(u64::from(pair[0])),
        );
        let start = u32::from(pair[0] % 32);
        let width = u32::from(pair[1] % 33);
        let mode = MODES[usize::from(pair[1]) % MODES.len()];
        builder.field(
            register,
            FieldSpec::value(start, width, "F")
                .mode(mode)
                .on_write(pair[0])
                .on_read(pair[1]),
        );
    }
    let Ok(mut bank) = builder.build() else {
        return;
    };

    for op in traffic.chunks_exact(6) {
        let offset = u64::from(op[0] % 24);
        let Ok(width) = validate_access_width(1 << (op[1] % 4)) else {
            continue;
        };
        let _ = validate_alignment(offset, width);
        let value = u64::from(u32::from_le_bytes([op[2], op[3], op[4], op[5]]));
        if op[1] & 0x80 == 0 {
            let _ = bank.write_sized(offset, width, value);
        } else {
            let _ = bank.read_sized_with(offset, width, |action, stored| {
                (action & 1 == 0).then_some(stored ^ value)
            });
        }
    }
    let snapshot = bank.snapshot();
    bank.reset();
    let _ = bank.restore(&snapshot);
    let _ = bank.read_sized(0, AccessWidth::DoubleWord);
});
