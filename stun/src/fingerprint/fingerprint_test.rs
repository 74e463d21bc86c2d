use super::*;
use crate::textattrs::TextAttribute;

#[test]
fn test_fingerprint_uses_crc_32_iso_hdlc() {
    let b = b"\x00\x01\x00\x00\x21\x12\xa4\x42";
    let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(b);
    assert_eq!(fingerprint_value(b), crc ^ FINGERPRINT_XOR_VALUE);
}

#[test]
fn test_fingerprint_check() -> Result<()> {
    let mut m = Message::new();
    m.set_type(BINDING_REQUEST);
    m.new_transaction_id()?;
    TextAttribute::new(ATTR_SOFTWARE, "software".to_owned()).add_to(&mut m)?;
    FINGERPRINT.add_to(&mut m)?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;
    FINGERPRINT.check(&decoded)?;

    // Corrupt one byte of the message body.
    let mut raw = m.raw.clone();
    raw[MESSAGE_HEADER_SIZE + 1] ^= 0xff;
    let mut bad = Message::new();
    bad.write(&raw)?;
    assert_eq!(
        FINGERPRINT.check(&bad).expect_err("should fail"),
        Error::ErrFingerprintMismatch
    );

    Ok(())
}

#[test]
fn test_fingerprint_check_missing() -> Result<()> {
    let mut m = Message::new();
    m.set_type(BINDING_REQUEST);
    m.new_transaction_id()?;
    assert_eq!(
        FINGERPRINT.check(&m).expect_err("should fail"),
        Error::ErrAttributeNotFound
    );
    Ok(())
}
