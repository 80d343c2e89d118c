//! Test harness for in-process shardnet integration tests.
//!
//! `TestNode` runs a full server on a random localhost port. `RawClient`
//! drives the handshake engine directly over a plain TCP connection, which
//! is how the tests impersonate identities and observe raw frames.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use shardnet_crypto::Identity;
use shardnet_node::{
    Config, Connection, Database, Direction, Handshake, Node, Protocol, Server, ShardId,
};

pub struct TestNode {
    pub server: Arc<Server>,
    pub node: Node,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn start(shard: ShardId, protocols: Vec<Protocol>) -> anyhow::Result<Self> {
        let config = Config {
            listen_addr: "127.0.0.1:0".into(),
            private_key: Some(Identity::generate().to_hex()),
            ..Config::default()
        };
        let server = Server::new(config, protocols)?;
        server.start(shard).await?;
        let node = server
            .self_node()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("self node missing after start"))?;
        Ok(Self { server, node })
    }

    fn db(&self) -> anyhow::Result<&Arc<Database>> {
        self.server
            .discovery_db()
            .ok_or_else(|| anyhow::anyhow!("discovery not started"))
    }

    /// Make a node record known to discovery without triggering a dial.
    pub async fn learn(&self, node: Node) -> anyhow::Result<()> {
        self.db()?.seed(node).await;
        Ok(())
    }

    /// Feed a discovery event for `other`, which triggers a dial.
    pub async fn connect_to(&self, other: &TestNode) -> anyhow::Result<()> {
        self.db()?.add_node(other.node.clone()).await;
        Ok(())
    }

    /// Poll until the peer count equals `n`, or fail at the deadline.
    pub async fn wait_peer_count(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.server.peer_count().await == n {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "timeout waiting for {} peers (have {})",
                    n,
                    self.server.peer_count().await
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn shutdown(&self) {
        self.server.stop().await;
    }
}

/// A handshake-capable client speaking the raw wire protocol.
pub struct RawClient {
    pub identity: Arc<Identity>,
    pub conn: Connection,
}

#[allow(dead_code)]
impl RawClient {
    /// Dial `target` and complete the handshake as `identity`.
    pub async fn connect(identity: Arc<Identity>, target: &TestNode) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(target.node.tcp_addr()).await?;
        let conn = Connection::new(stream)?;
        let engine = Handshake::new(identity.clone());
        engine
            .execute(&conn, Vec::new(), Direction::Outbound, Some(&target.node))
            .await?;
        Ok(Self { identity, conn })
    }

    /// The node record the target should learn before this client dials.
    pub fn node_record(identity: &Identity, shard: ShardId) -> Node {
        Node::new(identity.node_id(), "127.0.0.1:1".parse().unwrap(), shard)
    }
}
