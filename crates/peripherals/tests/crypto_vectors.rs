//! Published test vectors driven through the accelerators' register maps.
//!
//! HMAC-SHA256 against RFC 4231, SHA3 and KMAC128 against the NIST samples.

#![allow(clippy::pedantic, clippy::nursery)]

use hmac as _;
use peripherals::hmac::{HMAC_CFG, HMAC_CMD, HMAC_DIGEST0, HMAC_FIFO, HMAC_KEY0};
use peripherals::kmac::{
    KMAC_CFG, KMAC_CMD, KMAC_FIFO, KMAC_INTR_STATE, KMAC_KEY_LEN, KMAC_KEY_SHARE0, KMAC_PREFIX0,
    KMAC_STATE, KMAC_STATUS,
};
use peripherals::{Hmac, Kmac, KmacCommand, KmacConfig};
use proptest as _;
use rand as _;
use rand_chacha as _;
use regbank_core::BusPeripheral;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use sha2 as _;
use sha3 as _;
use thiserror as _;
use tracing as _;

fn hex(text: &str) -> Vec<u8> {
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).unwrap())
        .collect()
}

fn kmac_output(kmac: &mut Kmac, len: usize) -> Vec<u8> {
    (0..len as u64)
        .step_by(4)
        .flat_map(|i| kmac.read_u32(KMAC_STATE + i).to_le_bytes())
        .take(len)
        .collect()
}

fn command(kmac: &mut Kmac, command: KmacCommand) {
    kmac.write_u32(KMAC_CMD, command as u32);
}

#[test]
fn hmac_sha256_rfc4231_case_2() {
    let mut hmac = Hmac::new().unwrap();
    hmac.write_u32(HMAC_CFG, 0b11);
    hmac.write_u32(HMAC_KEY0, 0x4a65_6665);
    hmac.write_u32(HMAC_CMD, 0b01);
    for &byte in b"what do ya want for nothing?" {
        hmac.write_u8(HMAC_FIFO, byte);
    }
    hmac.write_u32(HMAC_CMD, 0b10);
    let digest: Vec<u8> = (0..8)
        .flat_map(|i| hmac.read_u32(HMAC_DIGEST0 + 4 * i).to_be_bytes())
        .collect();
    assert_eq!(
        digest,
        hex("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
    );
}

#[rstest]
#[case(1, "e642824c3f8cf24ad09234ee7d3c766fc9a3a5168d0c94ad73b46fdf")]
#[case(2, "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532")]
fn sha3_of_abc(#[case] strength: u32, #[case] expected: &str) {
    let mut kmac = Kmac::new(KmacConfig::default()).unwrap();
    kmac.write_u32(KMAC_CFG, strength << 1);
    command(&mut kmac, KmacCommand::Start);
    for &byte in b"abc" {
        kmac.write_u8(KMAC_FIFO, byte);
    }
    command(&mut kmac, KmacCommand::Process);
    let expected = hex(expected);
    assert_eq!(kmac_output(&mut kmac, expected.len()), expected);
    command(&mut kmac, KmacCommand::Done);
    assert_eq!(kmac.read_u32(KMAC_STATUS) & 1, 1);
}

#[test]
fn kmac128_nist_sample_1() {
    let mut kmac = Kmac::new(KmacConfig::default()).unwrap();
    let key: Vec<u8> = (0x40..=0x5F).collect();
    for (i, word) in (0u64..).zip(key.chunks(4)) {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        kmac.write_u32(KMAC_KEY_SHARE0 + 4 * i, word);
    }
    kmac.write_u32(KMAC_KEY_LEN, 2);
    // encode_string("KMAC") || encode_string("")
    kmac.write_u32(KMAC_PREFIX0, 0x4D4B_2001);
    kmac.write_u32(KMAC_PREFIX0 + 4, 0x0001_4341);
    kmac.write_u32(KMAC_CFG, 0x21);
    command(&mut kmac, KmacCommand::Start);
    // Message followed by right_encode(256).
    for &byte in &[0x00, 0x01, 0x02, 0x03, 0x01, 0x00, 0x02] {
        kmac.write_u8(KMAC_FIFO, byte);
    }
    command(&mut kmac, KmacCommand::Process);
    assert_eq!(kmac.error_code(), 0);
    assert_eq!(
        kmac_output(&mut kmac, 32),
        hex("e5780b0d3ea6f7d3a429c5706aa43a00fadbd7d49628839e3187243f456ee14e")
    );
    assert_eq!(kmac.read_u32(KMAC_INTR_STATE) & 1, 1);
}
