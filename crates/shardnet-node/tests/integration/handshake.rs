//! Handshake scenarios over real connections.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use shardnet_crypto::Identity;
use shardnet_node::{Connection, Handshake, Protocol};
use shardnet_protocol::{Cap, ProtoHandShake};

use crate::harness::{RawClient, TestNode};

/// Two servers authenticate each other and register exactly one peer each.
#[tokio::test]
async fn mutual_authentication_registers_both_sides() {
    let alice = TestNode::start(1, vec![Protocol::new("chain", 1, 8)])
        .await
        .unwrap();
    let bob = TestNode::start(2, vec![Protocol::new("chain", 1, 8)])
        .await
        .unwrap();

    // bob must be able to resolve alice's claimed identity on accept
    bob.learn(alice.node.clone()).await.unwrap();
    alice.connect_to(&bob).await.unwrap();

    alice.wait_peer_count(1, Duration::from_secs(10)).await.unwrap();
    bob.wait_peer_count(1, Duration::from_secs(10)).await.unwrap();

    let seen_by_alice = alice.server.peers_info().await;
    assert_eq!(seen_by_alice.len(), 1);
    assert_eq!(seen_by_alice[0].id, bob.node.id.to_hex());
    assert_eq!(seen_by_alice[0].caps, vec!["chain/1"]);

    let seen_by_bob = bob.server.peers_info().await;
    assert_eq!(seen_by_bob[0].id, alice.node.id.to_hex());

    // peer landed in the right shard bucket on each side
    assert_eq!(bob.server.shard_peer_count(1).await, 1);
    assert_eq!(alice.server.shard_peer_count(2).await, 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

/// A connection claiming an identity the signature cannot back is rejected.
#[tokio::test]
async fn forged_identity_is_rejected() {
    let bob = TestNode::start(1, Vec::new()).await.unwrap();

    let alice = Identity::generate();
    let mallory = Identity::generate();
    bob.learn(RawClient::node_record(&mallory, 1)).await.unwrap();

    // alice signs the wrap but claims mallory's node id
    let stream = TcpStream::connect(bob.node.tcp_addr()).await.unwrap();
    let conn = Connection::new(stream).unwrap();
    let engine = Handshake::new(Arc::new(alice));
    let forged = ProtoHandShake::new(mallory.node_id(), vec![Cap::new("chain", 1)]);
    let wrapped = engine.pack(&forged, &bob.node.id, 7, 0).unwrap();
    conn.write_message(&wrapped).await.unwrap();

    // no reply, no registration
    assert!(conn.read_message().await.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.server.peer_count().await, 0);

    bob.shutdown().await;
}

/// An authenticated node absent from discovery is dropped after the
/// exchange completes.
#[tokio::test]
async fn unknown_peer_is_rejected() {
    let bob = TestNode::start(1, Vec::new()).await.unwrap();

    // identity never made known to bob's discovery
    let stranger = Arc::new(Identity::generate());
    let result = RawClient::connect(stranger.clone(), &bob).await;

    match result {
        Ok(client) => {
            // the reply arrived before the server dropped us; the
            // connection must close without a registration
            assert!(client.conn.read_message().await.is_err());
        }
        Err(_) => {} // server closed mid-exchange
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.server.peer_count().await, 0);

    bob.shutdown().await;
}

/// A known identity completes the raw handshake and is registered.
#[tokio::test]
async fn raw_client_handshake_happy_path() {
    let bob = TestNode::start(1, Vec::new()).await.unwrap();

    let client_identity = Arc::new(Identity::generate());
    bob.learn(RawClient::node_record(&client_identity, 2))
        .await
        .unwrap();

    let _client = RawClient::connect(client_identity.clone(), &bob)
        .await
        .unwrap();

    bob.wait_peer_count(1, Duration::from_secs(5)).await.unwrap();
    assert_eq!(bob.server.shard_peer_count(2).await, 1);

    bob.shutdown().await;
}
