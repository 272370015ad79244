//! Wire formats spoken over the GATT write/notify characteristics.

pub mod register;
pub mod vendor;

use crate::error::DecodeError;

/// Big-endian field reader over a response payload.
///
/// Every accessor is bounds checked so a short payload turns into a
/// [`DecodeError`] instead of a panic.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a>(&'a [u8]);

impl<'a> Payload<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self(data)
    }

    fn bytes<const N: usize>(&self, field: &str, offset: usize) -> Result<[u8; N], DecodeError> {
        self.0
            .get(offset..offset + N)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DecodeError {
                field: field.to_string(),
                offset,
                needed: N,
                available: self.0.len(),
            })
    }

    pub fn u16(&self, field: &str, offset: usize) -> Result<u16, DecodeError> {
        self.bytes::<2>(field, offset).map(u16::from_be_bytes)
    }

    pub fn i16(&self, field: &str, offset: usize) -> Result<i16, DecodeError> {
        self.bytes::<2>(field, offset).map(i16::from_be_bytes)
    }

    pub fn i32(&self, field: &str, offset: usize) -> Result<i32, DecodeError> {
        self.bytes::<4>(field, offset).map(i32::from_be_bytes)
    }

    pub fn u32(&self, field: &str, offset: usize) -> Result<u32, DecodeError> {
        self.bytes::<4>(field, offset).map(u32::from_be_bytes)
    }

    /// Unsigned 16 bit value multiplied by `scale`
    pub fn scaled_u16(&self, field: &str, offset: usize, scale: f64) -> Result<f64, DecodeError> {
        self.u16(field, offset).map(|v| v as f64 * scale)
    }

    /// Signed 16 bit value multiplied by `scale`
    pub fn scaled_i16(&self, field: &str, offset: usize, scale: f64) -> Result<f64, DecodeError> {
        self.i16(field, offset).map(|v| v as f64 * scale)
    }
}

#[test]
fn test_payload_reads_big_endian() {
    let payload = Payload::new(&[0x04, 0xec, 0xff, 0xce, 0x00, 0x00, 0x01, 0x00]);
    assert_eq!(payload.u16("voltage", 0), Ok(1260));
    assert_eq!(payload.i16("current", 2), Ok(-50));
    assert_eq!(payload.u32("counter", 4), Ok(256));
    assert_eq!(payload.scaled_i16("current", 2, 0.5), Ok(-25.0));
}

#[test]
fn test_payload_short_read_is_decode_error() {
    let payload = Payload::new(&[0x04]);
    let err = payload.u16("voltage", 0).unwrap_err();
    assert_eq!(err.field, "voltage");
    assert_eq!(err.needed, 2);
    assert_eq!(err.available, 1);
    assert!(payload.i32("lat", 10).is_err());
}
