//! Backpressure: a slow sub-protocol stalls the read loop without dropping
//! messages.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use shardnet_crypto::Identity;
use shardnet_node::{Protocol, ProtocolRw};
use shardnet_protocol::{Message, BASE_PROTO_CODE};

use crate::harness::{RawClient, TestNode};

/// A protocol whose handler parks: it hands its wrapper to the test and
/// returns, so the test controls when (and whether) the queue drains.
fn parked_protocol(rw_tx: mpsc::Sender<Arc<ProtocolRw>>) -> Protocol {
    let mut proto = Protocol::new("lag", 1, 4);
    proto.add_peer = Some(Arc::new(move |_peer, rw| {
        let rw_tx = rw_tx.clone();
        Box::pin(async move {
            let _ = rw_tx.send(rw).await;
        })
    }));
    proto
}

#[tokio::test]
async fn slow_sub_protocol_stalls_without_loss() {
    let (rw_tx, mut rw_rx) = mpsc::channel(1);
    let server = TestNode::start(1, vec![parked_protocol(rw_tx)]).await.unwrap();

    let identity = Arc::new(Identity::generate());
    server
        .learn(RawClient::node_record(&identity, 1))
        .await
        .unwrap();
    let client = RawClient::connect(identity, &server).await.unwrap();
    server.wait_peer_count(1, Duration::from_secs(5)).await.unwrap();

    let rw = rw_rx.recv().await.expect("wrapper not delivered");

    // one message fits the queue; the rest back up in the read loop and
    // the socket while nothing drains
    for i in 0..3u8 {
        client
            .conn
            .write_message(&Message::new(BASE_PROTO_CODE + 1, vec![i]))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the session survives the stall
    assert_eq!(server.server.peer_count().await, 1);

    // draining yields every message, in wire order, de-offset
    for i in 0..3u8 {
        let msg = tokio::time::timeout(Duration::from_secs(5), rw.read_message())
            .await
            .expect("message lost under backpressure")
            .unwrap();
        assert_eq!(msg.code, 1);
        assert_eq!(msg.payload, vec![i]);
    }

    server.shutdown().await;
}

/// Writes through the wrapper land on the wire with the window offset; the
/// remote sees the session code, the local protocol its own numbering.
#[tokio::test]
async fn wrapper_round_trip_over_real_session() {
    let (rw_tx, mut rw_rx) = mpsc::channel(1);
    let server = TestNode::start(1, vec![parked_protocol(rw_tx)]).await.unwrap();

    let identity = Arc::new(Identity::generate());
    server
        .learn(RawClient::node_record(&identity, 1))
        .await
        .unwrap();
    let client = RawClient::connect(identity, &server).await.unwrap();

    let rw = rw_rx.recv().await.expect("wrapper not delivered");

    rw.write_message(Message::new(2, b"pong-data".to_vec()))
        .await
        .unwrap();
    let on_wire = client.conn.read_message().await.unwrap();
    assert_eq!(on_wire.code, BASE_PROTO_CODE + 2);
    assert_eq!(on_wire.payload, b"pong-data");

    server.shutdown().await;
}
