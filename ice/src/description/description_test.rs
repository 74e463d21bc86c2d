use super::*;
use crate::rand::{generate_pwd, generate_ufrag};

#[test]
fn test_transport_description_modes() -> Result<()> {
    let d = TransportDescription::new(IceMode::Rfc5245, generate_ufrag(), generate_pwd());
    assert_eq!(d.mode()?, IceMode::Rfc5245);
    d.validate()?;

    let d = TransportDescription::new(IceMode::Google, "u".to_owned(), "p".to_owned());
    assert_eq!(d.mode()?, IceMode::Google);
    // Legacy mode does not enforce credential lengths.
    d.validate()?;

    let d = TransportDescription {
        transport_type: "urn:example:unknown".to_owned(),
        ice_ufrag: generate_ufrag(),
        ice_pwd: generate_pwd(),
    };
    assert_eq!(
        d.mode().expect_err("should fail"),
        Error::ErrUnknownTransportType
    );

    Ok(())
}

#[test]
fn test_transport_description_credential_rules() {
    let d = TransportDescription::new(IceMode::Rfc5245, "abc".to_owned(), generate_pwd());
    assert_eq!(d.validate().expect_err("should fail"), Error::ErrUfragTooShort);

    let d = TransportDescription::new(IceMode::Rfc5245, generate_ufrag(), "short".to_owned());
    assert_eq!(d.validate().expect_err("should fail"), Error::ErrPwdTooShort);
}

#[test]
fn test_candidate_description_round_trip() -> Result<()> {
    let c = unmarshal_candidate(
        "candidate:99 1 udp 2130706432 192.168.7.1 5000 typ srflx raddr 10.0.0.1 rport 5001 generation 2",
    )?;

    let desc = CandidateDescription::from_candidate("audio_rtp", IceMode::Rfc5245, &c);
    assert_eq!(desc.name, "audio_rtp");
    assert_eq!(desc.xmlns, NS_JINGLE_ICE_UDP);

    let json = desc.marshal()?;
    let parsed = CandidateDescription::unmarshal(&json)?;
    assert_eq!(parsed, desc);

    let again = parsed.to_candidate()?;
    assert!(again.equivalent(&c));
    assert_eq!(again.related_address, c.related_address);

    Ok(())
}

#[test]
fn test_candidate_description_legacy_namespace() -> Result<()> {
    let c = unmarshal_candidate("candidate:1 2 udp 2130706430 10.1.1.1 9999 typ host")?;
    let desc = CandidateDescription::from_candidate("video_rtcp", IceMode::Google, &c);
    assert_eq!(desc.xmlns, NS_GINGLE_P2P);
    assert_eq!(desc.component, 2);
    Ok(())
}

#[test]
fn test_candidate_description_bad_fields() {
    let desc = CandidateDescription {
        name: "audio_rtp".to_owned(),
        xmlns: NS_JINGLE_ICE_UDP.to_owned(),
        foundation: "1".to_owned(),
        component: 1,
        protocol: "udp".to_owned(),
        priority: 1,
        address: "not-an-ip".to_owned(),
        port: 1,
        typ: "host".to_owned(),
        username: String::new(),
        password: String::new(),
        generation: 0,
        rel_addr: None,
        rel_port: None,
        network: String::new(),
    };
    assert!(desc.to_candidate().is_err());

    let mut desc2 = desc.clone();
    desc2.address = "1.2.3.4".to_owned();
    desc2.typ = "bogus".to_owned();
    assert!(desc2.to_candidate().is_err());
}
