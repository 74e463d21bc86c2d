#[cfg(test)]
mod integrity_test;

use std::fmt;

use ring::hmac;

use crate::attributes::*;
use crate::checks::*;
use crate::error::*;
use crate::message::*;

/// MessageIntegrity represents the MESSAGE-INTEGRITY attribute: an HMAC-SHA1
/// over the message up to (but not including) the attribute itself, keyed
/// with short-term credentials (the raw password).
///
/// RFC 5389 Section 15.4
#[derive(Default, Clone)]
pub struct MessageIntegrity(pub Vec<u8>);

fn new_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mac = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    hmac::sign(&mac, message).as_ref().to_vec()
}

impl fmt::Display for MessageIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KEY: 0x{:x?}", self.0)
    }
}

pub(crate) const MESSAGE_INTEGRITY_SIZE: usize = 20;

impl Setter for MessageIntegrity {
    /// Adds a MESSAGE-INTEGRITY attribute to the message. The header length
    /// is fixed up to cover the attribute-to-be before the HMAC is computed,
    /// per RFC 5389 section 15.4.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        // FINGERPRINT must come after MESSAGE-INTEGRITY.
        for a in &m.attributes.0 {
            if a.typ == ATTR_FINGERPRINT {
                return Err(Error::ErrFingerprintBeforeIntegrity);
            }
        }

        let length = m.length;
        m.length += (MESSAGE_INTEGRITY_SIZE + ATTRIBUTE_HEADER_SIZE) as u32;
        m.write_length();
        let v = new_hmac(&self.0, &m.raw);
        m.length = length;

        m.add(ATTR_MESSAGE_INTEGRITY, &v);

        Ok(())
    }
}

impl MessageIntegrity {
    /// Returns a MessageIntegrity key for short-term credentials.
    /// Password must be SASL-prepared.
    pub fn new_short_term_integrity(password: String) -> Self {
        MessageIntegrity(password.as_bytes().to_vec())
    }

    /// Checks the MESSAGE-INTEGRITY attribute, tolerating attributes (such
    /// as FINGERPRINT) that follow it by shrinking the length field to what
    /// it was when the HMAC was computed.
    pub fn check(&self, m: &mut Message) -> Result<()> {
        let v = m.get(ATTR_MESSAGE_INTEGRITY)?;

        let length = m.length as usize;
        let mut after_integrity = false;
        let mut size_reduced = 0;

        for a in &m.attributes.0 {
            if after_integrity {
                size_reduced += nearest_padded_value_length(a.length as usize);
                size_reduced += ATTRIBUTE_HEADER_SIZE;
            }
            if a.typ == ATTR_MESSAGE_INTEGRITY {
                after_integrity = true;
            }
        }
        m.length -= size_reduced as u32;
        m.write_length();
        // start_of_hmac is the first byte of the integrity attribute itself.
        let start_of_hmac = MESSAGE_HEADER_SIZE + m.length as usize
            - (ATTRIBUTE_HEADER_SIZE + MESSAGE_INTEGRITY_SIZE);
        let b = &m.raw[..start_of_hmac];
        let expected = new_hmac(&self.0, b);
        m.length = length as u32;
        m.write_length();
        check_hmac(&v, &expected)
    }
}
