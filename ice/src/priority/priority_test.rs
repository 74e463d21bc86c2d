use super::*;

#[test]
fn test_priority_round_trip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let p = PriorityAttr(0x6e_7f1eff);
    p.add_to(&mut m)?;

    let mut got = PriorityAttr::default();
    got.get_from(&m)?;
    assert_eq!(got, p);

    Ok(())
}

#[test]
fn test_priority_missing_and_bad_size() {
    let m = Message::new();
    let mut p = PriorityAttr::default();
    assert_eq!(
        p.get_from(&m).expect_err("should be missing"),
        stun::Error::ErrAttributeNotFound
    );

    let mut m = Message::new();
    m.add(ATTR_PRIORITY, &[1, 2]);
    assert_eq!(
        p.get_from(&m).expect_err("should fail"),
        stun::Error::ErrAttributeSizeInvalid
    );
}
