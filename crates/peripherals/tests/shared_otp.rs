//! OTP controllers on several simulated cores sharing one fuse array.

#![allow(clippy::pedantic, clippy::nursery)]

use std::thread;

use hmac as _;
use peripherals::otp::{OTP_DAI_ADDRESS, OTP_DAI_CMD, OTP_DAI_RDATA_0};
use peripherals::{LifeCycleState, Otp, OtpConfig, OtpMemory};
use proptest as _;
use rand as _;
use rand_chacha as _;
use regbank_core::BusPeripheral;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use sha2 as _;
use sha3 as _;
use thiserror as _;
use tracing as _;

#[test]
fn transition_counter_increments_are_serialized() {
    let memory = OtpMemory::new();
    thread::scope(|scope| {
        for _ in 0..2 {
            let memory = memory.clone();
            scope.spawn(move || {
                let otp = Otp::with_memory(OtpConfig::default(), memory).unwrap();
                for _ in 0..6 {
                    otp.increment_transition_count().unwrap();
                }
            });
        }
    });
    let otp = Otp::with_memory(OtpConfig::default(), memory).unwrap();
    assert_eq!(otp.transition_count().unwrap(), 12);
}

#[test]
fn writes_from_one_controller_are_read_by_another() {
    let memory = OtpMemory::new();
    let writer = Otp::with_memory(OtpConfig::default(), memory.clone()).unwrap();
    let mut reader = Otp::with_memory(OtpConfig::default(), memory).unwrap();
    writer.set_life_cycle_state(LifeCycleState::Dev);
    assert_eq!(reader.life_cycle_state().unwrap(), LifeCycleState::Dev);

    writer.memory().write(0x40, &0xCAFE_F00Du32.to_le_bytes());
    reader.write_u32(OTP_DAI_ADDRESS, 0x40);
    reader.write_u32(OTP_DAI_CMD, 1);
    assert_eq!(reader.read_u32(OTP_DAI_RDATA_0), 0xCAFE_F00D);
}
