//! Discovery interface consumed by the server.
//!
//! The Kademlia-style discovery protocol itself lives outside this crate;
//! the server only needs node records, a lookup by node id, and a hook fired
//! when a new node becomes known. `Database` is that surface, seeded with
//! static nodes and driven by `add_node` events.

use serde::{Deserialize, Serialize};
use shardnet_crypto::{Address, NodeId};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shard number. `1..=SHARD_COUNT` are valid assignments.
pub type ShardId = u16;

/// Sentinel for nodes with no shard assignment; such nodes are never dialed.
pub const UNDEFINED_SHARD: ShardId = 0;

/// Number of shards the peer table is partitioned into.
pub const SHARD_COUNT: ShardId = 4;

/// A reachable node record.
///
/// Discovery speaks UDP; the data connection is TCP. Records coming from
/// discovery often only know the UDP port, so `tcp_port` defaults to it
/// when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub ip: IpAddr,
    pub udp_port: u16,
    #[serde(default)]
    pub tcp_port: u16,
    #[serde(default)]
    pub shard: ShardId,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr, shard: ShardId) -> Self {
        Self {
            id,
            ip: addr.ip(),
            udp_port: addr.port(),
            tcp_port: addr.port(),
            shard,
        }
    }

    /// Peer-table key.
    pub fn address(&self) -> Address {
        self.id.address()
    }

    /// Dial target for the data connection.
    pub fn tcp_addr(&self) -> SocketAddr {
        let port = if self.tcp_port != 0 {
            self.tcp_port
        } else {
            self.udp_port
        };
        SocketAddr::new(self.ip, port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn has_shard(&self) -> bool {
        self.shard != UNDEFINED_SHARD
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} (shard {})",
            &self.id.to_hex()[..8],
            self.tcp_addr(),
            self.shard
        )
    }
}

/// Callback invoked for every newly known node.
pub type NewNodeHook = Arc<dyn Fn(Node) + Send + Sync>;

/// In-memory view of the discovery database.
pub struct Database {
    nodes: RwLock<HashMap<NodeId, Node>>,
    hook: RwLock<Option<NewNodeHook>>,
}

impl Database {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            hook: RwLock::new(None),
        })
    }

    /// Register the new-node hook. Nodes already known (static seeds) are
    /// replayed into it, which is what gets them dialed at start.
    pub async fn set_hook_for_new_node(&self, hook: NewNodeHook) {
        let known: Vec<Node> = {
            let mut guard = self.hook.write().await;
            *guard = Some(hook.clone());
            self.nodes.read().await.values().cloned().collect()
        };
        for node in known {
            hook(node);
        }
    }

    pub async fn find_by_node_id(&self, id: &NodeId) -> Option<Node> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Seed a node without firing the hook (static-node bootstrap).
    pub async fn seed(&self, node: Node) {
        self.nodes.write().await.insert(node.id, node);
    }

    /// Record a discovery event: insert the node and, if it was not already
    /// known, fire the new-node hook.
    pub async fn add_node(&self, node: Node) {
        let is_new = self
            .nodes
            .write()
            .await
            .insert(node.id, node.clone())
            .is_none();
        if !is_new {
            return;
        }
        let hook = self.hook.read().await.clone();
        if let Some(hook) = hook {
            hook(node);
        }
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }
}

/// Start the discovery service and return its database.
///
/// The wire protocol (UDP pings, k-buckets) is out of scope here; this
/// seeds the database with the static nodes and leaves further `add_node`
/// events to the caller.
pub async fn start_service(
    self_node: Node,
    static_nodes: Vec<Node>,
    shard: ShardId,
) -> Arc<Database> {
    let db = Database::new();
    for node in static_nodes {
        db.seed(node).await;
    }
    let seeded = db.len().await;
    tracing::info!(self_node = %self_node, shard, seeded, "discovery database ready");
    db
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardnet_crypto::Identity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_node(shard: ShardId) -> Node {
        Node::new(
            Identity::generate().node_id(),
            "127.0.0.1:30303".parse().unwrap(),
            shard,
        )
    }

    #[test]
    fn tcp_port_falls_back_to_udp_port() {
        let mut node = test_node(1);
        node.tcp_port = 0;
        assert_eq!(node.tcp_addr().port(), node.udp_port);
        node.tcp_port = 30400;
        assert_eq!(node.tcp_addr().port(), 30400);
    }

    #[tokio::test]
    async fn add_node_fires_hook_once() {
        let db = Database::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        db.set_hook_for_new_node(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

        let node = test_node(2);
        db.add_node(node.clone()).await;
        db.add_node(node.clone()).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(db.find_by_node_id(&node.id).await, Some(node));
    }

    #[tokio::test]
    async fn hook_registration_replays_seeded_nodes() {
        let seeded = test_node(1);
        let db = start_service(test_node(1), vec![seeded.clone()], 1).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        db.set_hook_for_new_node(Arc::new(move |node| {
            assert_eq!(node.shard, 1);
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(db.find_by_node_id(&seeded.id).await, Some(seeded));
    }
}
