use super::proxy::TransportChannelProxy;
use super::*;
use crate::allocator::UdpHostAllocator;
use crate::candidate::{CandidateType, COMPONENT_RTP};

use tokio::time::{sleep, timeout};

fn test_channel(
    name: &str,
) -> (
    Arc<TransportChannelImpl>,
    mpsc::UnboundedReceiver<(String, ChannelEvent)>,
) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let chan = TransportChannelImpl::new(ChannelConfig {
        name: name.to_owned(),
        component: COMPONENT_RTP,
        mode: IceMode::Rfc5245,
        role: Role::Controlling,
        tiebreaker: 7,
        local_ufrag: "abcd".to_owned(),
        local_pwd: "passwordpasswordpassword".to_owned(),
        allocator: Arc::new(UdpHostAllocator::new("127.0.0.1".parse().unwrap())),
        events,
        port_timeout_delay: 0,
    });
    (chan, events_rx)
}

#[tokio::test]
async fn test_channel_gathers_host_candidates() {
    let (chan, mut events_rx) = test_channel("audio_rtp");
    chan.connect();

    let mut got_candidate = false;
    let mut got_done = false;
    let wait = timeout(Duration::from_secs(3), async {
        while let Some((name, ev)) = events_rx.recv().await {
            assert_eq!(name, "audio_rtp");
            match ev {
                ChannelEvent::CandidateReady(c) => {
                    assert_eq!(c.typ, CandidateType::Host);
                    assert!(c.address.ip().is_loopback());
                    got_candidate = true;
                }
                ChannelEvent::CandidatesAllocationDone => {
                    got_done = true;
                    break;
                }
                _ => {}
            }
        }
    })
    .await;

    assert!(wait.is_ok(), "gathering timed out");
    assert!(got_candidate && got_done);

    chan.destroy().await;
}

#[tokio::test]
async fn test_channel_connect_is_idempotent() {
    let (chan, mut events_rx) = test_channel("audio_rtp");
    chan.connect();
    chan.connect();

    sleep(Duration::from_millis(300)).await;
    let mut done_count = 0;
    while let Ok((_, ev)) = events_rx.try_recv() {
        if matches!(ev, ChannelEvent::CandidatesAllocationDone) {
            done_count += 1;
        }
    }
    assert_eq!(done_count, 1, "allocation must run once");
    assert_eq!(chan.ports().len(), 1);

    chan.destroy().await;
}

#[tokio::test]
async fn test_send_packet_would_block_without_selection() {
    let (chan, _events_rx) = test_channel("audio_rtp");
    assert_eq!(
        chan.send_packet(b"data").await.expect_err("should block"),
        Error::ErrSendPacket
    );
    assert_eq!(chan.get_error(), EWOULDBLOCK);
    chan.destroy().await;
}

#[tokio::test]
async fn test_remote_candidate_creates_connections() {
    let (chan, _events_rx) = test_channel("audio_rtp");
    chan.set_remote_credentials("rfrg".to_owned(), "remotepasswordremotepass".to_owned());
    chan.connect();
    sleep(Duration::from_millis(200)).await;

    let mut remote = crate::candidate::unmarshal_candidate(
        "candidate:1 1 udp 2130706432 127.0.0.1 60123 typ host generation 0",
    )
    .unwrap();
    remote.username = String::new();
    chan.add_remote_candidate(remote);
    sleep(Duration::from_millis(200)).await;

    let connections = chan.connections();
    assert_eq!(connections.len(), 1);
    // Credentials fill in from the remote description.
    assert_eq!(connections[0].remote_candidate().username, "rfrg");

    // The same candidate again is deduped.
    let remote = crate::candidate::unmarshal_candidate(
        "candidate:1 1 udp 2130706432 127.0.0.1 60123 typ host generation 0",
    )
    .unwrap();
    chan.add_remote_candidate(remote);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(chan.connections().len(), 1);

    chan.destroy().await;
}

#[tokio::test]
async fn test_proxy_buffers_configuration_until_bound() {
    let proxy = TransportChannelProxy::new("audio_rtp".to_owned(), COMPONENT_RTP);

    // Unbound: data operations fail gracefully, configuration buffers.
    assert!(!proxy.readable());
    assert!(!proxy.writable());
    assert_eq!(
        proxy.send_packet(b"x").await.expect_err("should fail"),
        Error::ErrSendPacket
    );
    proxy.set_srtp_ciphers(vec!["AES_CM_128_HMAC_SHA1_80".to_owned()]);
    proxy.set_option("dscp".to_owned(), 46);

    let (chan, _events_rx) = test_channel("audio_rtp");
    proxy.set_implementation(Arc::clone(&chan));

    assert_eq!(
        chan.srtp_ciphers(),
        vec!["AES_CM_128_HMAC_SHA1_80".to_owned()],
        "buffered ciphers replay on bind"
    );
    assert_eq!(chan.get_option("dscp"), Some(46));

    // Bound: configuration forwards directly.
    proxy.set_option("rto".to_owned(), 3);
    assert_eq!(chan.get_option("rto"), Some(3));

    chan.destroy().await;
}
