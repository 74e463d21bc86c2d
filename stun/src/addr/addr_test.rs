use super::*;

#[test]
fn test_mapped_address_round_trip() -> Result<()> {
    let mut m = Message::new();
    let addr = MappedAddress {
        ip: "122.12.34.5".parse().unwrap(),
        port: 5412,
    };
    addr.add_to(&mut m)?;

    let mut got = MappedAddress::default();
    got.get_from(&m)?;
    assert_eq!(got.ip, addr.ip);
    assert_eq!(got.port, addr.port);

    Ok(())
}

#[test]
fn test_xor_mapped_address_v4_round_trip() -> Result<()> {
    let mut m = Message::new();
    m.new_transaction_id()?;
    let addr = XorMappedAddress {
        ip: "192.168.1.32".parse().unwrap(),
        port: 5412,
    };
    addr.add_to(&mut m)?;

    // The stored bytes must not equal the plain address.
    let v = m.get(ATTR_XORMAPPED_ADDRESS)?;
    assert_ne!(&v[4..8], &[192, 168, 1, 32], "address must be XOR-ed");

    let mut got = XorMappedAddress::default();
    got.get_from(&m)?;
    assert_eq!(got.ip, addr.ip);
    assert_eq!(got.port, addr.port);

    Ok(())
}

#[test]
fn test_xor_mapped_address_v6_round_trip() -> Result<()> {
    let mut m = Message::new();
    m.new_transaction_id()?;
    let addr = XorMappedAddress {
        ip: "fe80::dead:beef".parse().unwrap(),
        port: 21254,
    };
    addr.add_to(&mut m)?;

    let mut got = XorMappedAddress::default();
    got.get_from(&m)?;
    assert_eq!(got.ip, addr.ip);
    assert_eq!(got.port, addr.port);

    Ok(())
}

#[test]
fn test_xor_mapped_address_bad_family() -> Result<()> {
    let mut m = Message::new();
    m.new_transaction_id()?;
    m.add(ATTR_XORMAPPED_ADDRESS, &[0x00, 0x07, 0, 0, 1, 2, 3, 4]);

    let mut got = XorMappedAddress::default();
    assert!(got.get_from(&m).is_err(), "family 7 must not decode");
    Ok(())
}

#[test]
fn test_xor_mapped_address_truncated() -> Result<()> {
    let mut m = Message::new();
    m.new_transaction_id()?;
    m.add(ATTR_XORMAPPED_ADDRESS, &[0x00, 0x01, 0x02]);

    let mut got = XorMappedAddress::default();
    assert_eq!(
        got.get_from(&m).expect_err("should fail"),
        Error::ErrUnexpectedEof
    );
    Ok(())
}
