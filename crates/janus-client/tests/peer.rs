mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use janus_client::{
    run_peer, IceCandidate, JanusError, LocalSignalingChannel, NegotiationStage, PeerOutcome,
    PeerRegistry, Role, RtcEngine, SdpKind, SessionDescription, SignalMessage, SignalingChannel,
};
use support::{init_tracing, FakeEngine};

const STEP: Duration = Duration::from_secs(5);

fn spawn_peer(
    engine: Arc<FakeEngine>,
    channel: LocalSignalingChannel,
    initiator: bool,
) -> tokio::task::JoinHandle<Result<PeerOutcome, JanusError>> {
    tokio::spawn(async move { run_peer(&*engine, &channel, initiator).await })
}

#[tokio::test]
async fn answering_peer_consumes_until_bye() {
    init_tracing();
    let engine = Arc::new(FakeEngine::new());
    let (local, remote) = LocalSignalingChannel::pair();
    let peer = spawn_peer(Arc::clone(&engine), local, false);

    remote
        .send(SignalMessage::SessionDescription(SessionDescription::offer(
            "v=0\r\no=remote-offer\r\n",
        )))
        .await
        .expect("send offer");
    let answer = timeout(STEP, remote.receive())
        .await
        .expect("answer arrived")
        .expect("receive")
        .expect("channel open");
    match answer {
        SignalMessage::SessionDescription(answer) => {
            assert_eq!(answer.kind, SdpKind::Answer);
            assert_eq!(answer.sdp, "v=0\r\no=fake-answer\r\n");
        }
        other => panic!("unexpected {other:?}"),
    }

    remote
        .send(SignalMessage::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.3 40000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }))
        .await
        .expect("send candidate");
    remote.send(SignalMessage::Bye).await.expect("send bye");

    let outcome = timeout(STEP, peer).await.expect("peer exited").expect("join");
    assert_eq!(outcome.expect("run_peer"), PeerOutcome::Bye);
    assert_eq!(
        engine.remote_descriptions(),
        vec![SessionDescription::offer("v=0\r\no=remote-offer\r\n")]
    );
    assert_eq!(engine.candidates.lock().len(), 1);
}

#[tokio::test]
async fn initiator_offers_first_and_stops_when_channel_closes() {
    init_tracing();
    let engine = Arc::new(FakeEngine::new());
    let (local, remote) = LocalSignalingChannel::pair();
    let peer = spawn_peer(Arc::clone(&engine), local, true);

    let offer = timeout(STEP, remote.receive())
        .await
        .expect("offer arrived")
        .expect("receive")
        .expect("channel open");
    assert_eq!(
        offer,
        SignalMessage::SessionDescription(SessionDescription::offer("v=0\r\no=fake-offer\r\n"))
    );

    remote
        .send(SignalMessage::SessionDescription(SessionDescription::answer(
            "v=0\r\no=remote-answer\r\n",
        )))
        .await
        .expect("send answer");
    // Give the peer a chance to apply the answer before hanging up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(remote);

    let outcome = timeout(STEP, peer).await.expect("peer exited").expect("join");
    assert_eq!(outcome.expect("run_peer"), PeerOutcome::ChannelClosed);
    assert_eq!(
        engine.calls(),
        vec!["create_offer", "set_local_description", "set_remote_description"]
    );
}

#[tokio::test]
async fn engine_failure_is_a_peer_negotiation_error() {
    init_tracing();
    let engine = Arc::new(FakeEngine::failing_on("set_remote_description"));
    let (local, remote) = LocalSignalingChannel::pair();
    let peer = spawn_peer(Arc::clone(&engine), local, false);

    remote
        .send(SignalMessage::SessionDescription(SessionDescription::offer("v=0")))
        .await
        .expect("send offer");

    let err = timeout(STEP, peer)
        .await
        .expect("peer exited")
        .expect("join")
        .unwrap_err();
    let negotiation = err.negotiation().expect("negotiation error");
    assert_eq!(negotiation.role, Role::Peer);
    assert_eq!(negotiation.stage, NegotiationStage::Idle);
}

#[tokio::test]
async fn registry_closes_peers_on_shutdown() {
    let registry = PeerRegistry::new();
    let publisher = Arc::new(FakeEngine::new());
    let subscriber = Arc::new(FakeEngine::new());
    registry.register("publisher", Arc::clone(&publisher) as Arc<dyn RtcEngine>);
    registry.register("subscriber", Arc::clone(&subscriber) as Arc<dyn RtcEngine>);

    assert_eq!(registry.close_all().await, 2);
    assert_eq!(publisher.calls(), vec!["close"]);
    assert_eq!(subscriber.calls(), vec!["close"]);
    assert!(registry.is_empty());
}
