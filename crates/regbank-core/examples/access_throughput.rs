//! Throughput harness for the register-bank access paths.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p regbank-core --release --example access_throughput
//! ```
//!
//! ## Metrics
//!
//! - Full-width writes per second through a bank with mixed field modes
//! - Full-width reads per second with a read provider attached
//! - Byte-lane writes per second

#![allow(clippy::pedantic)]

use proptest as _;
use regbank_core::{
    AccessWidth, BankBuilder, BankConfig, FieldMode, FieldSpec, RegisterBank, RegisterSpec,
};
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

use std::hint::black_box;
use std::time::{Duration, Instant};

const REGISTERS: u64 = 64;
const RUN_FOR: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
enum Action {
    Irq,
    Status,
}

fn build_bank() -> RegisterBank<Action> {
    let mut b = BankBuilder::new(BankConfig::named("bench"));
    for index in 0..REGISTERS {
        let register = b.register(RegisterSpec::new(index * 4).reset(0x5A));
        b.field(register, FieldSpec::value(0, 8, "DATA"));
        b.field(
            register,
            FieldSpec::value(8, 8, "PENDING")
                .mode(FieldMode::WriteOneToClear)
                .on_write(Action::Irq),
        );
        b.field(
            register,
            FieldSpec::value(16, 8, "STATUS")
                .mode(FieldMode::ReadOnly)
                .on_read(Action::Status),
        );
        b.field(register, FieldSpec::unmodeled(24, 8, "TAG"));
    }
    match b.build() {
        Ok(bank) => bank,
        Err(err) => panic!("benchmark layout rejected: {err}"),
    }
}

fn measure(name: &str, mut op: impl FnMut(u64)) {
    let start = Instant::now();
    let mut count = 0u64;
    while start.elapsed() < RUN_FOR {
        for _ in 0..1024 {
            op(count);
            count += 1;
        }
    }
    let per_second = count as f64 / start.elapsed().as_secs_f64();
    println!("{name:<16} {per_second:>14.0} accesses/s");
}

fn main() {
    let mut bank = build_bank();
    measure("write", |n| {
        let effects = bank.write((n % REGISTERS) * 4, n);
        black_box(effects);
    });

    let mut bank = build_bank();
    measure("read_with", |n| {
        let value = bank.read_with((n % REGISTERS) * 4, |action, stored| match action {
            Action::Status => Some(stored.wrapping_add(1)),
            Action::Irq => None,
        });
        black_box(value);
    });

    let mut bank = build_bank();
    measure("write_byte", |n| {
        let effects = bank.write_sized(n % (REGISTERS * 4), AccessWidth::Byte, n);
        black_box(effects);
    });
}
