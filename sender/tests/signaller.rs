// SPDX-License-Identifier: MPL-2.0

use async_tungstenite::tungstenite::Message as WsMessage;
use futures::prelude::*;
use pi_webrtc_protocol::{Envelope, IceCandidate};
use pi_webrtc_sender::signaller::Signaller;
use pi_webrtc_signalling::handlers::Handler;
use pi_webrtc_signalling::server::Server;
use std::time::Duration;
use tokio::net::TcpListener;

async fn start_relay() -> std::net::SocketAddr {
    let server = Server::spawn(Handler::new);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut server = server.clone();
            tokio::spawn(async move { server.accept_async(stream).await });
        }
    });

    addr
}

#[tokio::test]
async fn test_send_and_receive_through_the_relay() {
    let addr = start_relay().await;

    let mut signaller = Signaller::connect(&format!("ws://{addr}"), None)
        .await
        .unwrap();
    let mut incoming = signaller.take_incoming().unwrap();

    let (mut peer, _) = async_tungstenite::tokio::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // outgoing: an offer sent through the signaller reaches the peer
    let offer = Envelope::Offer("v=0\r\n".to_string());
    signaller.sender().send(offer.clone()).await.unwrap();

    let relayed = tokio::time::timeout(Duration::from_secs(5), peer.next())
        .await
        .expect("timed out")
        .unwrap()
        .unwrap();
    let WsMessage::Text(text) = relayed else {
        panic!("expected a text frame, got {relayed:?}");
    };
    assert_eq!(serde_json::from_str::<Envelope>(&text).unwrap(), offer);

    // incoming: an answer from the peer surfaces on the incoming stream
    let answer = Envelope::Answer("v=0\r\n".to_string());
    peer.send(WsMessage::text(serde_json::to_string(&answer).unwrap()))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), incoming.next())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(received, answer);

    signaller.close().await;
}

#[tokio::test]
async fn test_unparseable_server_traffic_is_skipped() {
    let addr = start_relay().await;

    let mut signaller = Signaller::connect(&format!("ws://{addr}"), None)
        .await
        .unwrap();
    let mut incoming = signaller.take_incoming().unwrap();

    let (mut peer, _) = async_tungstenite::tokio::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the relay validates envelopes, so exercise the signaller's own
    // parse path with a well-formed envelope wrapping a bogus candidate
    let bogus = Envelope::Ice("{not json".to_string());
    peer.send(WsMessage::text(serde_json::to_string(&bogus).unwrap()))
        .await
        .unwrap();

    let ice = Envelope::from_candidate(&IceCandidate {
        candidate: "candidate:1 1 UDP 2015363327 192.168.4.2 44323 typ host".to_string(),
        sdp_m_line_index: 0,
    })
    .unwrap();
    peer.send(WsMessage::text(serde_json::to_string(&ice).unwrap()))
        .await
        .unwrap();

    // both arrive as envelopes; the malformed candidate payload is the
    // application's concern and must not break the stream
    let first = tokio::time::timeout(Duration::from_secs(5), incoming.next())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(first, bogus);
    assert!(first.candidate().unwrap().is_err());

    let second = tokio::time::timeout(Duration::from_secs(5), incoming.next())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(second, ice);
    assert!(second.candidate().unwrap().is_ok());

    signaller.close().await;
}

#[tokio::test]
async fn test_binary_frames_from_the_server_are_ignored() {
    // the relay never forwards binary frames, so speak to the client
    // over a bare websocket to exercise its ignore path
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let offer = Envelope::Offer("v=0\r\n".to_string());
    let offer_clone = offer.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = async_tungstenite::tokio::accept_async(stream).await.unwrap();

        ws.send(WsMessage::Binary(vec![0xde, 0xad].into()))
            .await
            .unwrap();
        ws.send(WsMessage::text(serde_json::to_string(&offer_clone).unwrap()))
            .await
            .unwrap();

        // keep the connection open until the client hangs up
        while ws.next().await.is_some() {}
    });

    let mut signaller = Signaller::connect(&format!("ws://{addr}"), None)
        .await
        .unwrap();
    let mut incoming = signaller.take_incoming().unwrap();

    // the binary frame is skipped and the following envelope arrives
    let received = tokio::time::timeout(Duration::from_secs(5), incoming.next())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(received, offer);

    signaller.close().await;
}

#[tokio::test]
async fn test_incoming_stream_ends_on_close() {
    let addr = start_relay().await;

    let mut signaller = Signaller::connect(&format!("ws://{addr}"), None)
        .await
        .unwrap();
    let mut incoming = signaller.take_incoming().unwrap();

    // closing runs the close handshake; the incoming stream must
    // terminate instead of hanging
    signaller.close().await;
    let end = tokio::time::timeout(Duration::from_secs(5), incoming.next())
        .await
        .expect("timed out waiting for the stream to end");
    assert!(end.is_none());
}
