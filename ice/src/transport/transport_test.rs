use super::*;
use crate::allocator::UdpHostAllocator;
use crate::candidate::{COMPONENT_RTCP, COMPONENT_RTP};
use crate::description::NS_JINGLE_ICE_UDP;

use std::sync::atomic::AtomicUsize;

use tokio::time::{sleep, Duration};

fn new_transport(name: &str, role: Role) -> Arc<Transport> {
    Transport::new(TransportConfig {
        name: name.to_owned(),
        mode: IceMode::Rfc5245,
        role,
        allocator: Arc::new(UdpHostAllocator::new("127.0.0.1".parse().unwrap())),
        port_timeout_delay: 0,
    })
}

// Ships candidates from `from` to `to`, like a signalling layer would.
fn wire_candidates(from: &Arc<Transport>, to: &Arc<Transport>) {
    let to = Arc::clone(to);
    from.on_candidate(Box::new(move |name, candidate| {
        let to = Arc::clone(&to);
        Box::pin(async move {
            let _ = to.on_remote_candidate(&name, candidate);
        })
    }));
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_two_udp_hosts_connect() {
    // Two peers on loopback, no NAT: both transports must come up readable
    // and writable, with one route change per channel.
    let t1 = new_transport("audio", Role::Controlling);
    let t2 = new_transport("audio", Role::Controlled);
    t1.set_tiebreaker(100);
    t2.set_tiebreaker(50);

    let routes1 = Arc::new(AtomicUsize::new(0));
    let routes2 = Arc::new(AtomicUsize::new(0));
    let routes = Arc::clone(&routes1);
    t1.on_route_change(Box::new(move |_, _| {
        let routes = Arc::clone(&routes);
        Box::pin(async move {
            routes.fetch_add(1, Ordering::SeqCst);
        })
    }));
    let routes = Arc::clone(&routes2);
    t2.on_route_change(Box::new(move |_, _| {
        let routes = Arc::clone(&routes);
        Box::pin(async move {
            routes.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let p1_rtp = t1.create_channel("audio_rtp", COMPONENT_RTP).unwrap();
    let _p1_rtcp = t1.create_channel("audio_rtcp", COMPONENT_RTCP).unwrap();
    let _p2_rtp = t2.create_channel("audio_rtp", COMPONENT_RTP).unwrap();
    let _p2_rtcp = t2.create_channel("audio_rtcp", COMPONENT_RTCP).unwrap();

    t1.set_remote_description(&t2.local_description()).unwrap();
    t2.set_remote_description(&t1.local_description()).unwrap();

    wire_candidates(&t1, &t2);
    wire_candidates(&t2, &t1);
    t1.on_signalling_ready().await;
    t2.on_signalling_ready().await;

    t1.connect_channels().await;
    t2.connect_channels().await;

    {
        let (t1, t2) = (Arc::clone(&t1), Arc::clone(&t2));
        wait_for(
            move || t1.readable() && t1.writable() && t2.readable() && t2.writable(),
            "both transports readable and writable",
        )
        .await;
    }

    // Let the nomination settle, then the routes must be stable: one per
    // channel.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(routes1.load(Ordering::SeqCst), 2);
    assert_eq!(routes2.load(Ordering::SeqCst), 2);

    // Data flows over the selected pair.
    let received = Arc::new(tokio::sync::Mutex::new(Vec::<u8>::new()));
    let sink = Arc::clone(&received);
    let p2_rtp = t2.get_channel("audio_rtp").unwrap();
    p2_rtp.on_read_packet(Box::new(move |data| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().await.extend_from_slice(&data);
        })
    }));

    p1_rtp.send_packet(b"media payload").await.unwrap();
    {
        let received = Arc::clone(&received);
        wait_for(
            move || received.try_lock().map(|g| !g.is_empty()).unwrap_or(false),
            "payload delivery",
        )
        .await;
    }
    assert_eq!(&*received.lock().await, b"media payload");

    t1.destroy_all_channels().await;
    t2.destroy_all_channels().await;
    assert!(t1.destroyed());
    assert!(t2.destroyed());
}

#[tokio::test]
async fn test_role_conflict_resolves_by_tiebreaker() {
    // Both peers start controlling; the one with the smaller tiebreaker
    // must end up controlled, and connectivity must still come up.
    let t_small = new_transport("data", Role::Controlling);
    let t_big = new_transport("data", Role::Controlling);
    t_small.set_tiebreaker(7);
    t_big.set_tiebreaker(9);

    let conflicts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&conflicts);
    t_small.on_role_conflict(Box::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let _c1 = t_small.create_channel("data_rtp", COMPONENT_RTP).unwrap();
    let _c2 = t_big.create_channel("data_rtp", COMPONENT_RTP).unwrap();

    t_small
        .set_remote_description(&t_big.local_description())
        .unwrap();
    t_big
        .set_remote_description(&t_small.local_description())
        .unwrap();

    wire_candidates(&t_small, &t_big);
    wire_candidates(&t_big, &t_small);
    t_small.on_signalling_ready().await;
    t_big.on_signalling_ready().await;

    t_small.connect_channels().await;
    t_big.connect_channels().await;

    {
        let (a, b) = (Arc::clone(&t_small), Arc::clone(&t_big));
        wait_for(
            move || {
                a.role() == Role::Controlled
                    && b.role() == Role::Controlling
                    && a.writable()
                    && b.writable()
            },
            "role conflict resolution",
        )
        .await;
    }

    // The flip happened exactly once.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(t_small.role(), Role::Controlled);
    assert_eq!(t_big.role(), Role::Controlling);
    assert_eq!(conflicts.load(Ordering::SeqCst), 1);

    t_small.destroy_all_channels().await;
    t_big.destroy_all_channels().await;
}

#[tokio::test]
async fn test_wrong_ufrag_creates_no_connection() {
    // The peer checks against us with a bad local ufrag: we answer 401 and
    // never build a connection for it.
    let t1 = new_transport("audio", Role::Controlling);
    let t2 = new_transport("audio", Role::Controlled);

    let _c1 = t1.create_channel("audio_rtp", COMPONENT_RTP).unwrap();
    let _c2 = t2.create_channel("audio_rtp", COMPONENT_RTP).unwrap();

    // t2 believes t1's ufrag is something else entirely.
    t2.set_remote_description(&TransportDescription {
        transport_type: NS_JINGLE_ICE_UDP.to_owned(),
        ice_ufrag: "WRNG".to_owned(),
        ice_pwd: "wrongpasswordwrongpassword".to_owned(),
    })
    .unwrap();
    t1.set_remote_description(&t2.local_description()).unwrap();

    // Only t2 learns candidates, so all checks originate there.
    wire_candidates(&t1, &t2);
    t1.on_signalling_ready().await;
    t2.on_signalling_ready().await;

    t1.connect_channels().await;
    t2.connect_channels().await;

    sleep(Duration::from_millis(1500)).await;

    assert!(!t1.writable());
    assert!(!t2.writable());
    let impl1 = t1.get_channel("audio_rtp").unwrap().implementation().unwrap();
    assert!(
        impl1.connections().is_empty(),
        "unauthenticated checks must not create connections"
    );

    t1.destroy_all_channels().await;
    t2.destroy_all_channels().await;
}

#[tokio::test]
async fn test_candidates_buffer_until_signalling_ready() {
    let t1 = new_transport("audio", Role::Controlling);

    let requests = Arc::new(AtomicUsize::new(0));
    let candidates = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);
    t1.on_request_signalling(Box::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));
    let counter = Arc::clone(&candidates);
    t1.on_candidate(Box::new(move |_, _| {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let _c1 = t1.create_channel("audio_rtp", COMPONENT_RTP).unwrap();
    t1.connect_channels().await;

    // Candidates are gathered but held back: signalling is not ready.
    {
        let requests = Arc::clone(&requests);
        wait_for(
            move || requests.load(Ordering::SeqCst) == 1,
            "request_signalling",
        )
        .await;
    }
    assert_eq!(candidates.load(Ordering::SeqCst), 0);

    // The flush delivers the buffered candidate messages.
    t1.on_signalling_ready().await;
    assert!(candidates.load(Ordering::SeqCst) >= 1);

    t1.destroy_all_channels().await;
}

#[tokio::test]
async fn test_allocation_done_fires_once_across_channels() {
    let t1 = new_transport("audio", Role::Controlling);

    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);
    t1.on_candidates_allocation_done(Box::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let _c1 = t1.create_channel("audio_rtp", COMPONENT_RTP).unwrap();
    let _c2 = t1.create_channel("audio_rtcp", COMPONENT_RTCP).unwrap();
    t1.connect_channels().await;

    {
        let done = Arc::clone(&done);
        wait_for(move || done.load(Ordering::SeqCst) > 0, "allocation done").await;
    }
    sleep(Duration::from_millis(300)).await;
    assert_eq!(done.load(Ordering::SeqCst), 1);

    t1.destroy_all_channels().await;
}

#[tokio::test]
async fn test_duplicate_channel_name_rejected() {
    let t1 = new_transport("audio", Role::Controlling);
    let _c1 = t1.create_channel("audio_rtp", COMPONENT_RTP).unwrap();
    assert_eq!(
        t1.create_channel("audio_rtp", COMPONENT_RTP)
            .expect_err("should fail"),
        Error::ErrChannelAlreadyExists
    );
    t1.destroy_all_channels().await;
}

#[tokio::test]
async fn test_remote_candidate_for_unknown_channel() {
    let t1 = new_transport("audio", Role::Controlling);
    let candidate = crate::candidate::unmarshal_candidate(
        "candidate:1 1 udp 2130706432 127.0.0.1 1234 typ host generation 0",
    )
    .unwrap();
    assert_eq!(
        t1.on_remote_candidate("video_rtp", candidate)
            .expect_err("should fail"),
        Error::ErrChannelNotFound
    );
}

#[tokio::test]
async fn test_description_exchange_rules() {
    let t1 = new_transport("audio", Role::Controlling);

    let desc = t1.local_description();
    assert_eq!(desc.transport_type, NS_JINGLE_ICE_UDP);
    desc.validate().unwrap();

    // A short pwd is rejected before any state changes.
    assert_eq!(
        t1.set_remote_description(&TransportDescription {
            transport_type: NS_JINGLE_ICE_UDP.to_owned(),
            ice_ufrag: "abcd".to_owned(),
            ice_pwd: "short".to_owned(),
        })
        .expect_err("should fail"),
        Error::ErrPwdTooShort
    );
}
