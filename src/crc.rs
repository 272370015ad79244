//! Checksums used on the wire.

use crc16::{State, MODBUS};

/// Compute the MODBUS CRC of the given bytes, low byte first as it appears on the wire.
///
/// Polynomial 0xA001 (reflected 0x8005), initial value 0xFFFF.
pub fn crc16_modbus(data: &[u8]) -> [u8; 2] {
    State::<MODBUS>::calculate(data).to_le_bytes()
}

/// Check that the last two bytes of `frame` are the MODBUS CRC of everything before them.
pub fn crc16_matches(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16_modbus(body) == tail
}

/// The vendor BMS checksum: two's complement of the byte sum, big endian.
pub fn vendor_checksum(data: &[u8]) -> [u8; 2] {
    let sum = data
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    sum.wrapping_neg().to_be_bytes()
}

#[test]
fn test_checksum() {
    let payload = [
        0x01, 0x03, 0x18, 0x24, 0x0c, 0x00, 0x00, 0x02, 0xa7, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    assert_eq!(crc16_modbus(&payload), [0xbc, 0x90]);
}

#[test]
fn test_crc_reference_vectors() {
    // standard CRC-16/MODBUS check value
    assert_eq!(crc16_modbus(b"123456789"), 0x4b37u16.to_le_bytes());
    assert_eq!(crc16_modbus(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), [0x84, 0x0a]);
    assert_eq!(crc16_modbus(&[0x01, 0x03, 0xd0, 0x26, 0x00, 0x19]), [0x5d, 0x0b]);
    assert_eq!(crc16_modbus(&[0x01, 0x03, 0xd0, 0x00, 0x00, 0x26]), [0xfc, 0xd0]);
    assert_eq!(crc16_modbus(&[]), [0xff, 0xff]);
}

#[test]
fn test_crc_deterministic() {
    let data = hex::decode("ff0313880008").unwrap();
    assert_eq!(crc16_modbus(&data), crc16_modbus(&data));
}

#[test]
fn test_crc_matches() {
    assert!(crc16_matches(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0a]));
    assert!(!crc16_matches(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0b]));
    assert!(!crc16_matches(&[0x01]));
}

#[test]
fn test_vendor_checksum() {
    assert_eq!(vendor_checksum(&[0x03, 0x00]), [0xff, 0xfd]);
    assert_eq!(vendor_checksum(&[0x04, 0x00]), [0xff, 0xfc]);
    assert_eq!(vendor_checksum(&[]), [0x00, 0x00]);
}
