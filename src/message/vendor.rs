//! The vendor BMS frame protocol.
//!
//! Start Byte | End Byte     | Meaning
//! 0          | 0            | Header marker 0xDD
//! 1          | 1            | Operation
//! 2          | 2            | Status, 0 on success
//! 3          | 3            | Declared payload length
//! 4          | x            | The payload
//! x+1        | x+2          | Checksum over bytes 2-x, big endian
//! x+3        | x+3          | End marker 0x77
//!
//! A response is delivered over one or more notifications. Only the first
//! carries the header marker, the last one ends with the end marker.

use tracing::{debug, warn};

use crate::crc::vendor_checksum;
use crate::error::{DecodeError, Error, Result};
use crate::message::Payload;
use crate::reading::Fields;

pub const HEADER_MARKER: u8 = 0xdd;
pub const END_MARKER: u8 = 0x77;
pub const STATUS_SUCCESS: u8 = 0x00;

pub const OPERATION_BASIC_INFO: u8 = 0x03;
pub const OPERATION_CELL_VOLTAGES: u8 = 0x04;

/// A verbatim message to send which requests voltage, current, capacity and temperature
pub const REQUEST_BASIC_INFO: [u8; 7] = [0xdd, 0xa5, 0x03, 0x00, 0xff, 0xfd, 0x77];
/// A verbatim message to send which requests the voltage of each cell
pub const REQUEST_CELL_VOLTAGES: [u8; 7] = [0xdd, 0xa5, 0x04, 0x00, 0xff, 0xfc, 0x77];

/// Header marker, operation, status and declared length
const HEADER_LEN: usize = 4;
/// Two checksum bytes and the end marker
const TRAILER_LEN: usize = 3;

const KELVIN_TENTHS_OFFSET: f64 = 273.1;

/// One reassembled vendor frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorFrame {
    pub operation: u8,
    pub status: u8,
    pub declared_len: usize,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
enum AssemblerState {
    #[default]
    Idle,
    Accumulating(Vec<u8>),
}

/// Rebuilds vendor frames from notification fragments.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    state: AssemblerState,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, AssemblerState::Idle)
    }

    /// Drop any partially received frame
    pub fn reset(&mut self) {
        self.state = AssemblerState::Idle;
    }

    /// Feed one notification.
    ///
    /// Returns `None` while a frame is still incomplete (or the delivery was
    /// dropped), otherwise the completed frame or the reason it is malformed.
    pub fn push(&mut self, delivery: &[u8]) -> Option<Result<VendorFrame>> {
        let (&first, &last) = (delivery.first()?, delivery.last()?);

        if first == HEADER_MARKER {
            if let AssemblerState::Accumulating(stale) = &self.state {
                warn!(
                    "Abandoning incomplete frame of {} bytes: {}",
                    stale.len(),
                    hex::encode(stale)
                );
            }
            debug!("New frame: {}", hex::encode(delivery));
            self.state = AssemblerState::Accumulating(delivery.to_vec());
        } else if let AssemblerState::Accumulating(buffer) = &mut self.state {
            debug!("Adding {} bytes to frame: {}", delivery.len(), hex::encode(delivery));
            buffer.extend_from_slice(delivery);
        } else {
            warn!(
                "Dropping continuation with no frame in progress: {}",
                hex::encode(delivery)
            );
            return None;
        }

        if last != END_MARKER {
            debug!("Still waiting for frame end");
            return None;
        }

        match std::mem::take(&mut self.state) {
            AssemblerState::Accumulating(frame) => Some(Self::parse(&frame)),
            AssemblerState::Idle => None,
        }
    }

    fn parse(frame: &[u8]) -> Result<VendorFrame> {
        if frame.len() < HEADER_LEN + TRAILER_LEN {
            return Err(Error::malformed("Too short", frame));
        }

        let operation = frame[1];
        let status = frame[2];
        let declared_len = frame[3] as usize;
        let checked = &frame[2..frame.len() - TRAILER_LEN];
        let checksum = &frame[frame.len() - TRAILER_LEN..frame.len() - 1];
        if vendor_checksum(checked) != checksum {
            return Err(Error::malformed("Checksum check failed", frame));
        }

        let payload = frame[HEADER_LEN..frame.len() - TRAILER_LEN].to_vec();
        if payload.len() != declared_len {
            return Err(Error::malformed("Payload length differs from declared length", frame));
        }

        Ok(VendorFrame {
            operation,
            status,
            declared_len,
            payload,
        })
    }
}

/// Decode the basic info payload: pack voltage, current, capacity and temperature.
pub fn decode_basic_info(payload: &[u8]) -> std::result::Result<Fields, DecodeError> {
    let payload = Payload::new(payload);
    let voltage = payload.scaled_u16("voltage", 0, 0.01)?;
    let current = payload.scaled_i16("current", 2, 0.01)?;
    let capacity_remaining = payload.scaled_u16("capacity_remaining", 4, 0.01)?;
    let capacity = payload.scaled_u16("capacity", 6, 0.01)?;
    let temperature = payload.scaled_u16("temperature", 23, 0.1)? - KELVIN_TENTHS_OFFSET;
    let percentage = if capacity == 0.0 {
        0.0
    } else {
        100.0 * capacity_remaining / capacity
    };

    let mut fields = Fields::new();
    fields.insert("voltage".into(), voltage.into());
    fields.insert("current".into(), current.into());
    fields.insert("capacity_remaining".into(), capacity_remaining.into());
    fields.insert("capacity".into(), capacity.into());
    fields.insert("temperature".into(), temperature.into());
    fields.insert("power".into(), (voltage * current).into());
    fields.insert("percentage".into(), percentage.into());
    Ok(fields)
}

/// Decode `declared_len / 2` cell voltages in volts.
pub fn decode_cell_voltages(
    payload: &[u8],
    declared_len: usize,
) -> std::result::Result<Fields, DecodeError> {
    let payload = Payload::new(payload);
    let mut fields = Fields::new();
    for cell in 0..declared_len / 2 {
        let name = format!("voltage_cell{}", cell + 1);
        let volts = payload.scaled_u16(&name, cell * 2, 0.001)?;
        fields.insert(name, volts.into());
    }
    Ok(fields)
}

/// Build a complete response frame with a valid checksum. Used by tests and simulators.
pub fn encode_frame(operation: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + HEADER_LEN + TRAILER_LEN);
    frame.extend_from_slice(&[HEADER_MARKER, operation, status, payload.len() as u8]);
    frame.extend_from_slice(payload);
    let checksum = vendor_checksum(&frame[2..]);
    frame.extend_from_slice(&checksum);
    frame.push(END_MARKER);
    frame
}

#[cfg(test)]
fn basic_info_payload(voltage: u16, current: i16, remaining: u16, total: u16, temp: u16) -> Vec<u8> {
    let mut payload = vec![0u8; 27];
    payload[0..2].copy_from_slice(&voltage.to_be_bytes());
    payload[2..4].copy_from_slice(&current.to_be_bytes());
    payload[4..6].copy_from_slice(&remaining.to_be_bytes());
    payload[6..8].copy_from_slice(&total.to_be_bytes());
    payload[23..25].copy_from_slice(&temp.to_be_bytes());
    payload
}

#[test]
fn test_command_literals_carry_valid_checksums() {
    for command in [REQUEST_BASIC_INFO, REQUEST_CELL_VOLTAGES] {
        assert_eq!(vendor_checksum(&command[2..4]), command[4..6]);
        assert_eq!(command[0], HEADER_MARKER);
        assert_eq!(command[6], END_MARKER);
    }
}

#[test]
fn test_single_delivery_frame() {
    let frame = encode_frame(OPERATION_CELL_VOLTAGES, 0, &[0x0c, 0xe4, 0x0c, 0xe5]);
    let mut assembler = FrameAssembler::new();
    let decoded = assembler.push(&frame).unwrap().unwrap();
    assert_eq!(decoded.operation, OPERATION_CELL_VOLTAGES);
    assert_eq!(decoded.declared_len, 4);
    assert_eq!(decoded.payload, vec![0x0c, 0xe4, 0x0c, 0xe5]);
    assert!(assembler.is_idle());
}

#[test]
fn test_fragmented_frame_matches_single_delivery() {
    let payload = basic_info_payload(1260, -50, 5000, 10000, 2981);
    let frame = encode_frame(OPERATION_BASIC_INFO, 0, &payload);

    let mut single = FrameAssembler::new();
    let whole = single.push(&frame).unwrap().unwrap();

    let mut fragmented = FrameAssembler::new();
    assert!(fragmented.push(&frame[..10]).is_none());
    assert!(fragmented.push(&frame[10..20]).is_none());
    let joined = fragmented.push(&frame[20..]).unwrap().unwrap();

    assert_eq!(whole, joined);
}

#[test]
fn test_fresh_header_abandons_stalled_frame() {
    let frame = encode_frame(OPERATION_CELL_VOLTAGES, 0, &[0x0c, 0xe4]);
    let mut assembler = FrameAssembler::new();
    assert!(assembler.push(&[HEADER_MARKER, 0x03, 0x00, 0x1b, 0x01]).is_none());
    let decoded = assembler.push(&frame).unwrap().unwrap();
    assert_eq!(decoded.operation, OPERATION_CELL_VOLTAGES);
}

#[test]
fn test_continuation_without_frame_is_dropped() {
    let mut assembler = FrameAssembler::new();
    assert!(assembler.push(&[0x01, 0x02, END_MARKER]).is_none());
    assert!(assembler.is_idle());
    assert!(assembler.push(&[]).is_none());
}

#[test]
fn test_bad_checksum_is_malformed() {
    let mut frame = encode_frame(OPERATION_CELL_VOLTAGES, 0, &[0x0c, 0xe4]);
    frame[4] ^= 0x01;
    let mut assembler = FrameAssembler::new();
    let err = assembler.push(&frame).unwrap().unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { reason: "Checksum check failed", .. }));
    assert!(assembler.is_idle());
}

#[test]
fn test_declared_length_mismatch_is_malformed() {
    let mut frame = encode_frame(OPERATION_CELL_VOLTAGES, 0, &[0x0c, 0xe4]);
    // claim 4 payload bytes and fix the checksum so only the length is wrong
    frame[3] = 4;
    let checksum = vendor_checksum(&frame[2..frame.len() - 3]);
    let at = frame.len() - 3;
    frame[at..at + 2].copy_from_slice(&checksum);
    let mut assembler = FrameAssembler::new();
    let err = assembler.push(&frame).unwrap().unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { .. }));
}

#[test]
fn test_basic_info_decodes_scaled_fields() {
    let fields = decode_basic_info(&basic_info_payload(1260, -50, 5000, 10000, 2981)).unwrap();
    let get = |name: &str| fields[name].as_f64().unwrap();
    assert!((get("voltage") - 12.60).abs() < 1e-9);
    assert!((get("current") + 0.50).abs() < 1e-9);
    assert!((get("power") + 6.30).abs() < 1e-9);
    assert!((get("percentage") - 50.0).abs() < 1e-9);
    assert!((get("temperature") - 25.0).abs() < 1e-9);
}

#[test]
fn test_zero_total_capacity_gives_zero_percentage() {
    let fields = decode_basic_info(&basic_info_payload(1260, 0, 5000, 0, 2731)).unwrap();
    assert_eq!(fields["percentage"].as_f64(), Some(0.0));
}

#[test]
fn test_short_basic_info_is_decode_error() {
    let err = decode_basic_info(&[0x04, 0xec, 0xff, 0xce, 0, 0, 0, 0]).unwrap_err();
    assert_eq!(err.field, "temperature");
}

#[test]
fn test_cell_voltages_follow_declared_length() {
    let fields = decode_cell_voltages(&[0x0c, 0xe4, 0x0c, 0xe5, 0x0c, 0xe6], 6).unwrap();
    assert_eq!(fields.len(), 3);
    assert!((fields["voltage_cell1"].as_f64().unwrap() - 3.300).abs() < 1e-9);
    assert!((fields["voltage_cell3"].as_f64().unwrap() - 3.302).abs() < 1e-9);
}
