use super::*;
use crate::connection::ReadState;

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

// A socket stub that records every outbound datagram.
struct CapturingConn {
    sent: Arc<SyncMutex<Vec<(Vec<u8>, SocketAddr)>>>,
}

impl CapturingConn {
    fn new() -> (Self, Arc<SyncMutex<Vec<(Vec<u8>, SocketAddr)>>>) {
        let sent = Arc::new(SyncMutex::new(vec![]));
        (
            CapturingConn {
                sent: Arc::clone(&sent),
            },
            sent,
        )
    }
}

#[async_trait]
impl Conn for CapturingConn {
    async fn connect(&self, _addr: SocketAddr) -> std::result::Result<(), util::Error> {
        Ok(())
    }
    async fn recv(&self, _buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        Ok(0)
    }
    async fn recv_from(
        &self,
        _buf: &mut [u8],
    ) -> std::result::Result<(usize, SocketAddr), util::Error> {
        Ok((0, SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 0)))
    }
    async fn send(&self, buf: &[u8]) -> std::result::Result<usize, util::Error> {
        Ok(buf.len())
    }
    async fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> std::result::Result<usize, util::Error> {
        self.sent.lock().push((buf.to_vec(), target));
        Ok(buf.len())
    }
    async fn local_addr(&self) -> std::result::Result<SocketAddr, util::Error> {
        Ok(SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 7100))
    }
    async fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
    async fn close(&self) -> std::result::Result<(), util::Error> {
        Ok(())
    }
}

const PWD: &str = "localpasswordlocalpassword";

struct TestPort {
    port: Arc<Port>,
    sent: Arc<SyncMutex<Vec<(Vec<u8>, SocketAddr)>>>,
    rx: UnboundedReceiver<PortEvent>,
}

async fn build_port(mode: IceMode, role: Role, tiebreaker: u64, component: u16) -> TestPort {
    let (events, mut rx) = unbounded_channel();
    let (conn, sent) = CapturingConn::new();
    let port = Port::new(PortConfig {
        kind: PortKind::Host,
        component,
        mode,
        conn: Arc::new(conn),
        ufrag: "LFRG".to_owned(),
        pwd: PWD.to_owned(),
        role,
        tiebreaker,
        generation: 0,
        network_name: String::new(),
        timeout_delay: 0,
        events,
    });
    port.prepare_address().await;
    while rx.try_recv().is_ok() {}
    TestPort { port, sent, rx }
}

fn remote_candidate(addr: &str) -> Candidate {
    Candidate {
        component: COMPONENT_RTP,
        address: addr.parse().unwrap(),
        priority: 100,
        username: "RFRG".to_owned(),
        password: "remotepasswordremotepassword".to_owned(),
        typ: CandidateType::Host,
        foundation: "1".to_owned(),
        ..Default::default()
    }
}

fn build_request(username: &str, pwd: Option<&str>, control: Option<AttrControl>) -> Message {
    let mut msg = Message::new();
    let mut setters: Vec<Box<dyn stun::message::Setter>> = vec![
        Box::new(BINDING_REQUEST),
        Box::new(stun::message::TransactionId::new()),
        Box::new(TextAttribute::new(ATTR_USERNAME, username.to_owned())),
    ];
    if let Some(control) = control {
        setters.push(Box::new(control));
    }
    if let Some(pwd) = pwd {
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            pwd.to_owned(),
        )));
        setters.push(Box::new(FINGERPRINT));
    }
    msg.build(&setters).unwrap();
    msg
}

fn last_sent_error_code(sent: &Arc<SyncMutex<Vec<(Vec<u8>, SocketAddr)>>>) -> Option<u16> {
    let sent = sent.lock();
    let (raw, _) = sent.last()?;
    let mut msg = Message::new();
    msg.write(raw).ok()?;
    if msg.typ != BINDING_ERROR {
        return None;
    }
    let mut attr = ErrorCodeAttribute::default();
    attr.get_from(&msg).ok()?;
    Some(attr.code().0)
}

#[tokio::test]
async fn test_prepare_address_produces_host_candidate() {
    let test = build_port(IceMode::Rfc5245, Role::Controlling, 1, COMPONENT_RTP).await;
    let candidates = test.port.candidates();
    assert_eq!(candidates.len(), 1);
    let c = &candidates[0];
    assert_eq!(c.typ, CandidateType::Host);
    assert_eq!(c.address, "127.0.0.1:7100".parse().unwrap());
    assert_eq!(c.username, "LFRG");
    assert!(c.priority > 0);
    assert!(!c.foundation.is_empty());
}

#[tokio::test]
async fn test_create_connection_rejects_duplicate_address() {
    let test = build_port(IceMode::Rfc5245, Role::Controlling, 1, COMPONENT_RTP).await;
    test.port
        .create_connection(0, remote_candidate("10.0.0.2:4000"))
        .unwrap();
    assert_eq!(
        test.port
            .create_connection(0, remote_candidate("10.0.0.2:4000"))
            .expect_err("should fail"),
        Error::ErrConnectionAddrAlreadyExist
    );
}

#[tokio::test]
async fn test_parse_stun_username_modes() {
    let test = build_port(IceMode::Rfc5245, Role::Controlling, 1, COMPONENT_RTP).await;
    let msg = build_request("LFRG:RFRG", Some(PWD), None);
    assert_eq!(
        test.port.parse_stun_username(&msg),
        Some(("LFRG".to_owned(), "RFRG".to_owned()))
    );

    // Without a colon the username is not valid in standards-track mode.
    let msg = build_request("LFRGRFRG", Some(PWD), None);
    assert_eq!(test.port.parse_stun_username(&msg), None);

    let test = build_port(IceMode::Google, Role::Controlling, 1, COMPONENT_RTP).await;
    let msg = build_request("LFRGRFRG", None, None);
    assert_eq!(
        test.port.parse_stun_username(&msg),
        Some(("LFRG".to_owned(), "RFRG".to_owned()))
    );
}

#[tokio::test]
async fn test_create_stun_username_modes() {
    let test = build_port(IceMode::Rfc5245, Role::Controlling, 1, COMPONENT_RTP).await;
    assert_eq!(test.port.create_stun_username("RFRG"), "RFRG:LFRG");

    let test = build_port(IceMode::Google, Role::Controlling, 1, COMPONENT_RTP).await;
    assert_eq!(test.port.create_stun_username("RFRG"), "RFRGLFRG");
}

#[tokio::test]
async fn test_legacy_rtcp_ufrag_derived() {
    let test = build_port(IceMode::Google, Role::Controlling, 1, COMPONENT_RTCP).await;
    assert_ne!(test.port.username_fragment(), "LFRG");

    let test = build_port(IceMode::Rfc5245, Role::Controlling, 1, COMPONENT_RTCP).await;
    assert_eq!(test.port.username_fragment(), "LFRG");
}

#[tokio::test]
async fn test_get_stun_message_accepts_valid_request() {
    let test = build_port(IceMode::Rfc5245, Role::Controlled, 1, COMPONENT_RTP).await;
    let msg = build_request("LFRG:RFRG", Some(PWD), None);

    let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let parsed = test.port.get_stun_message(&msg.raw, addr).await.unwrap();
    let (parsed, remote_ufrag) = parsed.expect("request should validate");
    assert_eq!(parsed.typ, BINDING_REQUEST);
    assert_eq!(remote_ufrag, "RFRG");
}

#[tokio::test]
async fn test_get_stun_message_rejects_bad_local_username() {
    // Scenario: the peer sends a binding request with the wrong ufrag. We
    // reply 401 and never create a connection.
    let test = build_port(IceMode::Rfc5245, Role::Controlled, 1, COMPONENT_RTP).await;
    let msg = build_request("WRNG:RFRG", Some(PWD), None);

    let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let parsed = test.port.get_stun_message(&msg.raw, addr).await.unwrap();
    assert!(parsed.is_none(), "must be answered internally");
    assert_eq!(last_sent_error_code(&test.sent), Some(401));
    assert!(test.port.connections().is_empty());
}

#[tokio::test]
async fn test_get_stun_message_rejects_bad_integrity() {
    let test = build_port(IceMode::Rfc5245, Role::Controlled, 1, COMPONENT_RTP).await;
    let msg = build_request("LFRG:RFRG", Some("thewrongpasswordentirely"), None);

    let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let parsed = test.port.get_stun_message(&msg.raw, addr).await.unwrap();
    assert!(parsed.is_none());
    assert_eq!(last_sent_error_code(&test.sent), Some(401));
}

#[tokio::test]
async fn test_get_stun_message_requires_username_and_integrity() {
    let test = build_port(IceMode::Rfc5245, Role::Controlled, 1, COMPONENT_RTP).await;

    // No username at all.
    let mut msg = Message::new();
    msg.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(stun::message::TransactionId::new()),
        Box::new(MessageIntegrity::new_short_term_integrity(PWD.to_owned())),
        Box::new(FINGERPRINT),
    ])
    .unwrap();

    let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let parsed = test.port.get_stun_message(&msg.raw, addr).await.unwrap();
    assert!(parsed.is_none());
    assert_eq!(last_sent_error_code(&test.sent), Some(400));
}

#[tokio::test]
async fn test_get_stun_message_rejects_non_stun_and_bad_fingerprint() {
    let test = build_port(IceMode::Rfc5245, Role::Controlled, 1, COMPONENT_RTP).await;
    let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();

    assert!(test
        .port
        .get_stun_message(b"definitely not stun", addr)
        .await
        .is_err());

    // A request without FINGERPRINT is rejected early in standards mode.
    let msg = build_request("LFRG:RFRG", None, None);
    assert!(test.port.get_stun_message(&msg.raw, addr).await.is_err());
}

#[tokio::test]
async fn test_role_conflict_arbitration() {
    // Both sides controlling. The larger tiebreaker stays; the smaller is
    // told to switch with a 487.
    let test = build_port(IceMode::Rfc5245, Role::Controlling, 100, COMPONENT_RTP).await;
    let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();

    // Peer has the smaller tiebreaker: we win and answer 487.
    let msg = build_request(
        "LFRG:RFRG",
        Some(PWD),
        Some(AttrControl {
            role: Role::Controlling,
            tie_breaker: crate::control::TieBreaker(50),
        }),
    );
    let proceed = test.port.maybe_ice_role_conflict(addr, &msg).await;
    assert!(!proceed, "request from the losing side is dropped");
    assert_eq!(last_sent_error_code(&test.sent), Some(487));

    // Peer has the bigger tiebreaker: we lose and must switch.
    let mut test = build_port(IceMode::Rfc5245, Role::Controlling, 100, COMPONENT_RTP).await;
    let msg = build_request(
        "LFRG:RFRG",
        Some(PWD),
        Some(AttrControl {
            role: Role::Controlling,
            tie_breaker: crate::control::TieBreaker(200),
        }),
    );
    let proceed = test.port.maybe_ice_role_conflict(addr, &msg).await;
    assert!(proceed, "the request itself is still processed");
    let mut saw_conflict = false;
    while let Ok(ev) = test.rx.try_recv() {
        if matches!(ev, PortEvent::RoleConflict { was: Role::Controlling }) {
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);

    // Different roles never conflict.
    let test = build_port(IceMode::Rfc5245, Role::Controlled, 100, COMPONENT_RTP).await;
    let msg = build_request(
        "LFRG:RFRG",
        Some(PWD),
        Some(AttrControl {
            role: Role::Controlling,
            tie_breaker: crate::control::TieBreaker(50),
        }),
    );
    assert!(test.port.maybe_ice_role_conflict(addr, &msg).await);
}

#[tokio::test]
async fn test_unknown_address_signal() {
    let mut test = build_port(IceMode::Rfc5245, Role::Controlled, 1, COMPONENT_RTP).await;
    let addr: SocketAddr = "10.0.0.9:4100".parse().unwrap();
    let msg = build_request("LFRG:RFRG", Some(PWD), None);

    test.port.on_read(&msg.raw, addr).await;

    let mut saw_unknown = false;
    while let Ok(ev) = test.rx.try_recv() {
        if let PortEvent::UnknownAddress {
            addr: ev_addr,
            remote_ufrag,
            ..
        } = ev
        {
            assert_eq!(ev_addr, addr);
            assert_eq!(remote_ufrag, "RFRG");
            saw_unknown = true;
        }
    }
    assert!(saw_unknown, "authenticated unknown request must be signalled");
}

#[tokio::test]
async fn test_binding_response_shape_per_mode() {
    // Standards mode: XOR-MAPPED-ADDRESS, MESSAGE-INTEGRITY, FINGERPRINT.
    let test = build_port(IceMode::Rfc5245, Role::Controlled, 1, COMPONENT_RTP).await;
    let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let request = build_request("LFRG:RFRG", Some(PWD), None);
    test.port.send_binding_response(&request, addr).await;

    {
        let sent = test.sent.lock();
        let (raw, _) = sent.last().unwrap();
        let mut response = Message::new();
        response.write(raw).unwrap();
        assert_eq!(response.typ, BINDING_SUCCESS);
        assert_eq!(response.transaction_id, request.transaction_id);
        assert!(response.contains(stun::attributes::ATTR_XORMAPPED_ADDRESS));
        assert!(response.contains(stun::attributes::ATTR_MESSAGE_INTEGRITY));
        assert!(response.contains(stun::attributes::ATTR_FINGERPRINT));

        let mut xor_addr = XorMappedAddress::default();
        stun::message::Getter::get_from(&mut xor_addr, &response).unwrap();
        assert_eq!(xor_addr.ip, addr.ip());
        assert_eq!(xor_addr.port, addr.port());
    }

    // Legacy mode: MAPPED-ADDRESS and the USERNAME echoed back.
    let test = build_port(IceMode::Google, Role::Controlled, 1, COMPONENT_RTP).await;
    let request = build_request("LFRGRFRG", None, None);
    test.port.send_binding_response(&request, addr).await;

    let sent = test.sent.lock();
    let (raw, _) = sent.last().unwrap();
    let mut response = Message::new();
    response.write(raw).unwrap();
    assert_eq!(response.typ, BINDING_SUCCESS);
    assert!(response.contains(stun::attributes::ATTR_MAPPED_ADDRESS));
    assert!(response.contains(ATTR_USERNAME));
    assert!(!response.contains(stun::attributes::ATTR_FINGERPRINT));
}

#[tokio::test]
async fn test_legacy_error_response_munges_code() {
    let test = build_port(IceMode::Google, Role::Controlled, 1, COMPONENT_RTP).await;
    let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let request = build_request("LFRGRFRG", None, None);

    test.port
        .send_binding_error_response(&request, addr, CODE_ROLE_CONFLICT, "Role Conflict")
        .await;

    let sent = test.sent.lock();
    let (raw, _) = sent.last().unwrap();
    let mut response = Message::new();
    response.write(raw).unwrap();
    let mut attr = ErrorCodeAttribute::default();
    attr.get_from(&response).unwrap();
    // class * 256 + number reassembles the code in legacy arithmetic.
    assert_eq!(attr.legacy_code(), CODE_ROLE_CONFLICT);
    assert_ne!(attr.code(), CODE_ROLE_CONFLICT);
}

#[tokio::test]
async fn test_port_destroys_when_empty_after_grace() {
    // Scenario: a port with no connections outlives its grace period.
    let (events, mut rx) = unbounded_channel();
    let (conn, _sent) = CapturingConn::new();
    let port = Port::new(PortConfig {
        kind: PortKind::Host,
        component: COMPONENT_RTP,
        mode: IceMode::Rfc5245,
        conn: Arc::new(conn),
        ufrag: "LFRG".to_owned(),
        pwd: PWD.to_owned(),
        role: Role::Controlled,
        tiebreaker: 1,
        generation: 0,
        network_name: String::new(),
        timeout_delay: 100,
        events,
    });
    port.prepare_address().await;
    port.start();

    tokio::time::sleep(tokio::time::Duration::from_millis(400)).await;
    let mut destroyed = false;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, PortEvent::PortDestroyed(_)) {
            destroyed = true;
        }
    }
    assert!(destroyed);
}

#[tokio::test]
async fn test_port_survives_while_it_has_connections() {
    let (events, mut rx) = unbounded_channel();
    let (conn, _sent) = CapturingConn::new();
    let port = Port::new(PortConfig {
        kind: PortKind::Host,
        component: COMPONENT_RTP,
        mode: IceMode::Rfc5245,
        conn: Arc::new(conn),
        ufrag: "LFRG".to_owned(),
        pwd: PWD.to_owned(),
        role: Role::Controlled,
        tiebreaker: 1,
        generation: 0,
        network_name: String::new(),
        timeout_delay: 100,
        events,
    });
    port.prepare_address().await;
    let connection = port
        .create_connection(0, remote_candidate("10.0.0.2:4000"))
        .unwrap();
    port.start();

    // The grace period fires while the connection exists: no destruction.
    tokio::time::sleep(tokio::time::Duration::from_millis(400)).await;
    let mut destroyed = false;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, PortEvent::PortDestroyed(_)) {
            destroyed = true;
        }
    }
    assert!(!destroyed, "port with a connection must survive");
    assert_eq!(connection.read_state(), ReadState::ReadInit);

    // The moment the last connection goes away, the port follows.
    port.on_connection_destroyed(&connection);
    let mut destroyed = false;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, PortEvent::PortDestroyed(_)) {
            destroyed = true;
        }
    }
    assert!(destroyed);
}
