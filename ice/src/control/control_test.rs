use super::*;

#[test]
fn test_controlled_round_trip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let c = AttrControlled(4321);
    c.add_to(&mut m)?;

    let mut got = AttrControlled::default();
    got.get_from(&m)?;
    assert_eq!(got, c);

    let mut missing = AttrControlling::default();
    assert_eq!(
        missing.get_from(&m).expect_err("should be missing"),
        stun::Error::ErrAttributeNotFound
    );

    Ok(())
}

#[test]
fn test_controlling_round_trip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let c = AttrControlling(u64::MAX);
    c.add_to(&mut m)?;

    let mut got = AttrControlling::default();
    got.get_from(&m)?;
    assert_eq!(got, c);

    Ok(())
}

#[test]
fn test_control_either_direction() -> Result<(), stun::Error> {
    let mut m = Message::new();
    AttrControlling(77).add_to(&mut m)?;

    let mut got = AttrControl::default();
    got.get_from(&m)?;
    assert_eq!(got.role, Role::Controlling);
    assert_eq!(got.tie_breaker, TieBreaker(77));

    let mut m = Message::new();
    AttrControlled(78).add_to(&mut m)?;

    let mut got = AttrControl::default();
    got.get_from(&m)?;
    assert_eq!(got.role, Role::Controlled);
    assert_eq!(got.tie_breaker, TieBreaker(78));

    let m = Message::new();
    let mut got = AttrControl::default();
    assert_eq!(
        got.get_from(&m).expect_err("should be missing"),
        stun::Error::ErrAttributeNotFound
    );

    Ok(())
}

#[test]
fn test_tie_breaker_bad_size() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.add(ATTR_ICE_CONTROLLING, &[1, 2, 3]);

    let mut t = TieBreaker::default();
    assert_eq!(
        t.get_from_as(&m, ATTR_ICE_CONTROLLING)
            .expect_err("should fail"),
        stun::Error::ErrAttributeSizeInvalid
    );
    Ok(())
}

#[test]
fn test_role_flip() {
    assert_eq!(Role::Controlling.flipped(), Role::Controlled);
    assert_eq!(Role::Controlled.flipped(), Role::Controlling);
    assert_eq!(Role::Unspecified.flipped(), Role::Unspecified);
    assert_eq!(Role::from("controlling"), Role::Controlling);
    assert_eq!(Role::from("nonsense"), Role::Unspecified);
}
