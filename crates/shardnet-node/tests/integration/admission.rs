//! Peer-table admission scenarios: duplicate connects and shutdown.

use std::sync::Arc;
use std::time::Duration;

use shardnet_crypto::Identity;
use shardnet_node::Protocol;
use shardnet_protocol::{CTL_MSG_DISC, CTL_MSG_PING, CTL_MSG_PONG, DISC_ALREADY_CONNECTED};
use shardnet_protocol::Message;

use crate::harness::{RawClient, TestNode};

/// A second handshake from an already-connected address replaces the old
/// peer, which is told why.
#[tokio::test]
async fn duplicate_connect_replaces_and_notifies_old_peer() {
    let server = TestNode::start(1, Vec::new()).await.unwrap();

    let identity = Arc::new(Identity::generate());
    server
        .learn(RawClient::node_record(&identity, 2))
        .await
        .unwrap();

    let first = RawClient::connect(identity.clone(), &server).await.unwrap();
    server.wait_peer_count(1, Duration::from_secs(5)).await.unwrap();

    let _second = RawClient::connect(identity.clone(), &server).await.unwrap();

    // the displaced connection receives a Disc frame with the reason
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, first.conn.read_message())
            .await
            .expect("expected a Disc frame on the old connection")
            .unwrap();
        if msg.code == CTL_MSG_PING {
            continue; // keepalive racing the replacement
        }
        assert_eq!(msg.code, CTL_MSG_DISC);
        assert_eq!(msg.payload, vec![DISC_ALREADY_CONNECTED]);
        break;
    }

    // exactly one peer remains, in one shard bucket
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.server.peer_count().await, 1);
    assert_eq!(server.server.shard_peer_count(2).await, 1);

    server.shutdown().await;
}

/// Stopping a server disconnects every peer on both ends within bounded time.
#[tokio::test]
async fn server_shutdown_clears_all_peers() {
    let hub = TestNode::start(1, vec![Protocol::new("chain", 1, 4)])
        .await
        .unwrap();
    let spoke_a = TestNode::start(2, vec![Protocol::new("chain", 1, 4)])
        .await
        .unwrap();
    let spoke_b = TestNode::start(3, vec![Protocol::new("chain", 1, 4)])
        .await
        .unwrap();

    hub.learn(spoke_a.node.clone()).await.unwrap();
    hub.learn(spoke_b.node.clone()).await.unwrap();
    spoke_a.connect_to(&hub).await.unwrap();
    spoke_b.connect_to(&hub).await.unwrap();

    hub.wait_peer_count(2, Duration::from_secs(10)).await.unwrap();
    spoke_a.wait_peer_count(1, Duration::from_secs(10)).await.unwrap();
    spoke_b.wait_peer_count(1, Duration::from_secs(10)).await.unwrap();

    hub.shutdown().await;
    assert_eq!(hub.server.peer_count().await, 0);

    // the spokes see the disconnect and drop their hub peer
    spoke_a.wait_peer_count(0, Duration::from_secs(10)).await.unwrap();
    spoke_b.wait_peer_count(0, Duration::from_secs(10)).await.unwrap();

    spoke_a.shutdown().await;
    spoke_b.shutdown().await;
}

/// Stop is idempotent.
#[tokio::test]
async fn stop_twice_is_safe() {
    let server = TestNode::start(1, Vec::new()).await.unwrap();
    server.shutdown().await;
    server.shutdown().await;
    assert_eq!(server.server.peer_count().await, 0);
}

/// A ping written to an established session elicits exactly one pong.
#[tokio::test]
async fn ping_elicits_pong() {
    let server = TestNode::start(1, Vec::new()).await.unwrap();
    let identity = Arc::new(Identity::generate());
    server
        .learn(RawClient::node_record(&identity, 1))
        .await
        .unwrap();
    let client = RawClient::connect(identity, &server).await.unwrap();
    server.wait_peer_count(1, Duration::from_secs(5)).await.unwrap();

    client
        .conn
        .write_message(&Message::control(CTL_MSG_PING))
        .await
        .unwrap();

    let reply = client.conn.read_message().await.unwrap();
    assert_eq!(reply.code, CTL_MSG_PONG);

    server.shutdown().await;
}
