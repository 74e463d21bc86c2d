use super::*;
use crate::fingerprint::FINGERPRINT;
use crate::textattrs::TextAttribute;

#[test]
fn test_message_integrity_add_and_check() -> Result<()> {
    let integrity = MessageIntegrity::new_short_term_integrity("password".to_owned());

    let mut m = Message::new();
    m.set_type(BINDING_REQUEST);
    m.new_transaction_id()?;
    TextAttribute::new(ATTR_USERNAME, "user".to_owned()).add_to(&mut m)?;
    integrity.add_to(&mut m)?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;
    integrity.check(&mut decoded)?;

    Ok(())
}

#[test]
fn test_message_integrity_with_fingerprint() -> Result<()> {
    // The integrity check must ignore attributes after MESSAGE-INTEGRITY.
    let integrity = MessageIntegrity::new_short_term_integrity("password".to_owned());

    let mut m = Message::new();
    m.set_type(BINDING_REQUEST);
    m.new_transaction_id()?;
    TextAttribute::new(ATTR_SOFTWARE, "software".to_owned()).add_to(&mut m)?;
    integrity.add_to(&mut m)?;
    FINGERPRINT.add_to(&mut m)?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;
    integrity.check(&mut decoded)?;

    let wrong = MessageIntegrity::new_short_term_integrity("wrongpassword".to_owned());
    assert_eq!(
        wrong.check(&mut decoded).expect_err("should fail"),
        Error::ErrIntegrityMismatch
    );

    Ok(())
}

#[test]
fn test_message_integrity_bit_flip() -> Result<()> {
    let integrity = MessageIntegrity::new_short_term_integrity("password".to_owned());

    let mut m = Message::new();
    m.set_type(BINDING_REQUEST);
    m.new_transaction_id()?;
    TextAttribute::new(ATTR_USERNAME, "user".to_owned()).add_to(&mut m)?;
    integrity.add_to(&mut m)?;

    // Flip a single bit inside the USERNAME value.
    let mut raw = m.raw.clone();
    raw[MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE] ^= 0x01;

    let mut decoded = Message::new();
    decoded.write(&raw)?;
    assert!(
        decoded.contains(ATTR_MESSAGE_INTEGRITY),
        "attribute survives the flip"
    );
    assert_eq!(
        integrity.check(&mut decoded).expect_err("should fail"),
        Error::ErrIntegrityMismatch
    );

    Ok(())
}

#[test]
fn test_fingerprint_before_integrity_rejected() -> Result<()> {
    let mut m = Message::new();
    m.set_type(BINDING_REQUEST);
    m.new_transaction_id()?;
    FINGERPRINT.add_to(&mut m)?;

    let integrity = MessageIntegrity::new_short_term_integrity("password".to_owned());
    assert_eq!(
        integrity.add_to(&mut m).expect_err("should fail"),
        Error::ErrFingerprintBeforeIntegrity
    );

    Ok(())
}
