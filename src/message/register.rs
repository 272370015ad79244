//! Modbus-style register reads.
//!
//! A request is 8 bytes:
//!
//! Start Byte | End Byte     | Meaning
//! 0          | 0            | Device id
//! 1          | 1            | Function code, always 3 (read holding registers)
//! 2          | 3            | Register address, big endian
//! 4          | 5            | Number of 16 bit words to read, big endian
//! 6          | 7            | A MODBUS CRC over bytes 0-5, low byte first
//!
//! The response is:
//!
//! Start Byte | End Byte     | Meaning
//! 0          | 0            | Device id
//! 1          | 1            | Operation, 3 on success or 131 on a device error
//! 2          | 2            | Byte count of the payload
//! 3          | x            | The payload, `words * 2` bytes
//! x+1        | x+2          | A MODBUS CRC over bytes 0-x

use crate::crc::{crc16_matches, crc16_modbus};
use crate::error::{Error, Result};

/// Function code for "read holding registers"
pub const FUNCTION_READ: u8 = 3;
/// Operation byte of a successful read response
pub const READ_SUCCESS: u8 = 3;
/// Operation byte of a device-reported error
pub const READ_ERROR: u8 = 131;
/// Most words a single read may ask for
pub const MAX_WORDS: u16 = 125;

const REQUEST_LEN: usize = 8;
/// Device id, operation, byte count and the two CRC bytes
const RESPONSE_OVERHEAD: usize = 5;

/// An immutable read request for one register range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub device_id: u8,
    pub function: u8,
    pub register: u16,
    pub words: u16,
}

impl ReadRequest {
    /// Build a request. Fails if the word count cannot be read in one request.
    pub fn new(device_id: u8, function: u8, register: u16, words: u16) -> Result<Self> {
        if words == 0 {
            return Err(Error::InvalidRequest("word count must be at least 1"));
        }
        if words > MAX_WORDS {
            return Err(Error::InvalidRequest("word count exceeds 125"));
        }
        Ok(Self {
            device_id,
            function,
            register,
            words,
        })
    }

    /// The request as sent on the wire, CRC included
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let [addr_hi, addr_lo] = self.register.to_be_bytes();
        let [words_hi, words_lo] = self.words.to_be_bytes();
        let body = [
            self.device_id,
            self.function,
            addr_hi,
            addr_lo,
            words_hi,
            words_lo,
        ];
        let [crc_lo, crc_hi] = crc16_modbus(&body);
        [
            body[0], body[1], body[2], body[3], body[4], body[5], crc_lo, crc_hi,
        ]
    }

    /// Recover a request from its wire form. `None` if the length or CRC is wrong.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() != REQUEST_LEN || !crc16_matches(frame) {
            return None;
        }
        Some(Self {
            device_id: frame[0],
            function: frame[1],
            register: u16::from_be_bytes([frame[2], frame[3]]),
            words: u16::from_be_bytes([frame[4], frame[5]]),
        })
    }
}

/// Classification of a received register frame
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterResponse<'a> {
    /// The register payload, header and CRC stripped
    Data(&'a [u8]),
    /// The device rejected the request with the given code
    DeviceError(u8),
    /// The frame cannot be trusted and was not parsed further
    Malformed(&'static str),
}

/// Decode a response to a read of `expected_words` registers.
pub fn decode_response(frame: &[u8], expected_words: u16) -> RegisterResponse<'_> {
    if frame.len() < 2 {
        return RegisterResponse::Malformed("Too short");
    }

    match frame[1] {
        READ_ERROR => RegisterResponse::DeviceError(frame.get(2).copied().unwrap_or(0)),
        READ_SUCCESS => {
            let expected_len = expected_words as usize * 2 + RESPONSE_OVERHEAD;
            if frame.len() != expected_len {
                return RegisterResponse::Malformed("Unexpected length");
            }
            if !crc16_matches(frame) {
                return RegisterResponse::Malformed("CRC check failed");
            }
            RegisterResponse::Data(&frame[3..frame.len() - 2])
        }
        _ => RegisterResponse::Malformed("Unexpected operation"),
    }
}

/// Build a well formed success response carrying `payload`. Used by tests and simulators.
pub fn encode_response(device_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + RESPONSE_OVERHEAD);
    frame.push(device_id);
    frame.push(READ_SUCCESS);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc);
    frame
}

#[test]
fn test_build_request_layout() {
    let request = ReadRequest::new(255, FUNCTION_READ, 5000, 8).unwrap();
    let bytes = request.encode();
    assert_eq!(&bytes[..6], &[0xff, 0x03, 0x13, 0x88, 0x00, 0x08]);
    assert_eq!(&bytes[6..], &crc16_modbus(&bytes[..6]));
}

#[test]
fn test_build_request_matches_known_frame() {
    let request = ReadRequest::new(0x01, FUNCTION_READ, 0xd026, 0x19).unwrap();
    assert_eq!(
        request.encode(),
        [0x01, 0x03, 0xd0, 0x26, 0x00, 0x19, 0x5d, 0x0b]
    );
}

#[test]
fn test_parse_recovers_request() {
    let request = ReadRequest::new(17, FUNCTION_READ, 5042, 1).unwrap();
    assert_eq!(ReadRequest::parse(&request.encode()), Some(request));
}

#[test]
fn test_parse_rejects_bad_crc() {
    let mut bytes = ReadRequest::new(17, FUNCTION_READ, 5042, 1).unwrap().encode();
    bytes[7] ^= 0xff;
    assert_eq!(ReadRequest::parse(&bytes), None);
}

#[test]
fn test_request_rejects_bad_word_count() {
    assert!(ReadRequest::new(1, FUNCTION_READ, 0, 0).is_err());
    assert!(ReadRequest::new(1, FUNCTION_READ, 0, 126).is_err());
}

#[test]
fn test_decode_response_happy() {
    let message =
        hex::decode("010318240c000002a7000000000000000000000000000000000000bc90").unwrap();
    let payload = hex::decode("240c000002a7000000000000000000000000000000000000").unwrap();
    assert_eq!(
        decode_response(&message, 12),
        RegisterResponse::Data(&payload[..])
    );
}

#[test]
fn test_decode_response_bad_crc() {
    let message =
        hex::decode("010318240c000002a7000000000000000000000000000000000000bc91").unwrap();
    assert_eq!(
        decode_response(&message, 12),
        RegisterResponse::Malformed("CRC check failed")
    );
}

#[test]
fn test_decode_response_length_mismatch() {
    let message = encode_response(1, &[0x00, 0x01, 0x00, 0x02]);
    assert_eq!(
        decode_response(&message, 1),
        RegisterResponse::Malformed("Unexpected length")
    );
}

#[test]
fn test_decode_response_device_error_regardless_of_length() {
    assert_eq!(
        decode_response(&[0x01, 0x83, 0x02, 0xc0, 0xf1], 8),
        RegisterResponse::DeviceError(0x02)
    );
    assert_eq!(
        decode_response(&[0x01, 0x83], 8),
        RegisterResponse::DeviceError(0x00)
    );
}

#[test]
fn test_decode_response_unknown_operation() {
    let mut message = encode_response(1, &[0x00, 0x01]);
    message[1] = 0x04;
    assert_eq!(
        decode_response(&message, 1),
        RegisterResponse::Malformed("Unexpected operation")
    );
}
