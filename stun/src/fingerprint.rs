#[cfg(test)]
mod fingerprint_test;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::attributes::*;
use crate::checks::*;
use crate::error::*;
use crate::message::*;

/// FingerprintAttr represents the FINGERPRINT attribute.
///
/// RFC 5389 Section 15.5
pub struct FingerprintAttr;

/// FINGERPRINT is shorthand for FingerprintAttr.
pub const FINGERPRINT: FingerprintAttr = FingerprintAttr {};

pub const FINGERPRINT_XOR_VALUE: u32 = 0x5354554e;
pub const FINGERPRINT_SIZE: usize = 4; // 32 bit

/// Returns the CRC-32 of b XOR-ed with 0x5354554e. The XOR helps in cases
/// where an application packet is also using CRC-32.
pub fn fingerprint_value(b: &[u8]) -> u32 {
    let checksum = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(b);
    checksum ^ FINGERPRINT_XOR_VALUE
}

impl Setter for FingerprintAttr {
    /// Adds a fingerprint over the message so far. Must be the last
    /// attribute added.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let l = m.length;
        // Length in the header covers the fingerprint attribute itself.
        m.length += (FINGERPRINT_SIZE + ATTRIBUTE_HEADER_SIZE) as u32;
        m.write_length();
        let val = fingerprint_value(&m.raw);
        m.length = l;
        m.add(ATTR_FINGERPRINT, &val.to_be_bytes());
        Ok(())
    }
}

impl FingerprintAttr {
    /// Reads the fingerprint value from m and checks it against the CRC of
    /// everything preceding the attribute.
    pub fn check(&self, m: &Message) -> Result<()> {
        let b = m.get(ATTR_FINGERPRINT)?;
        check_size(ATTR_FINGERPRINT, b.len(), FINGERPRINT_SIZE)?;
        let val = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let attr_start = m.raw.len() - (FINGERPRINT_SIZE + ATTRIBUTE_HEADER_SIZE);
        let expected = fingerprint_value(&m.raw[..attr_start]);
        check_fingerprint(val, expected)
    }
}
