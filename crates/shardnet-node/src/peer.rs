//! Peer lifecycle: read loop, keepalive, sub-protocol demux, shutdown.
//!
//! Each live connection gets one `Peer`. The read loop is the sole demux
//! source; every sub-protocol gets a `ProtocolRw` wrapper owning a window of
//! the code space and a capacity-1 inbound queue. A slow sub-protocol stalls
//! the read loop, and through it the TCP receive buffer -- stalling one peer
//! is preferred over buffering without bound.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shardnet_protocol::{
    Message, BASE_PROTO_CODE, CTL_MSG_DISC, CTL_MSG_PING, CTL_MSG_PONG,
};

use crate::conn::Connection;
use crate::discovery::{Node, ShardId, UNDEFINED_SHARD};
use crate::error::NetError;
use crate::subprotocol::Protocol;

/// Keepalive probe interval for the peer TCP connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Per-sub-protocol read/write wrapper.
///
/// Owns the code window `[offset, offset + proto.length)` within the peer
/// session. Reads come from the peer's demux queue with the offset stripped;
/// writes are range-checked, offset, and forwarded to the shared connection.
pub struct ProtocolRw {
    pub(crate) proto: Protocol,
    pub(crate) offset: u16,
    conn: Arc<Connection>,
    closed: CancellationToken,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: Mutex<mpsc::Receiver<Message>>,
}

impl ProtocolRw {
    pub fn cap(&self) -> shardnet_protocol::Cap {
        self.proto.cap()
    }

    /// Write a message using the sub-protocol's local code numbering.
    pub async fn write_message(&self, mut msg: Message) -> Result<(), NetError> {
        if msg.code >= self.proto.length {
            return Err(NetError::InvalidCode(msg.code));
        }
        msg.code += self.offset;
        self.conn.write_message(&msg).await
    }

    /// Read the next inbound message, de-offset to local numbering.
    /// Returns `PeerClosed` once the peer has shut down.
    pub async fn read_message(&self) -> Result<Message, NetError> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(mut msg) => {
                    msg.code -= self.offset;
                    Ok(msg)
                }
                None => Err(NetError::PeerClosed),
            },
            _ = self.closed.cancelled() => Err(NetError::PeerClosed),
        }
    }
}

/// A connected remote node.
pub struct Peer {
    node: RwLock<Option<Node>>,
    conn: Arc<Connection>,
    protocols: HashMap<String, Arc<ProtocolRw>>,
    closed: CancellationToken,
    disconnection_tx: mpsc::Sender<u8>,
    protocol_err_tx: mpsc::Sender<NetError>,
    receivers: Mutex<Option<(mpsc::Receiver<u8>, mpsc::Receiver<NetError>)>>,
    ping_interval: Duration,
}

impl Peer {
    /// Build a peer over `conn`, allocating one wrapper per sub-protocol.
    /// Code windows are assigned contiguously from [`BASE_PROTO_CODE`] in
    /// declaration order. `node` is `None` for inbound connections until the
    /// handshake resolves the remote identity.
    pub fn new(conn: Arc<Connection>, protocols: &[Protocol], node: Option<Node>) -> Arc<Self> {
        Self::with_ping_interval(conn, protocols, node, PING_INTERVAL)
    }

    pub fn with_ping_interval(
        conn: Arc<Connection>,
        protocols: &[Protocol],
        node: Option<Node>,
        ping_interval: Duration,
    ) -> Arc<Self> {
        let closed = CancellationToken::new();
        let mut offset = BASE_PROTO_CODE;
        let mut protocol_map = HashMap::new();
        for proto in protocols {
            let (inbound_tx, inbound_rx) = mpsc::channel(1);
            let rw = Arc::new(ProtocolRw {
                proto: proto.clone(),
                offset,
                conn: conn.clone(),
                closed: closed.clone(),
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
            });
            tracing::debug!(cap = %proto.cap(), offset, length = proto.length, "wrapper installed");
            protocol_map.insert(proto.cap().to_string(), rw);
            offset += proto.length;
        }

        let (disconnection_tx, disconnection_rx) = mpsc::channel(1);
        let (protocol_err_tx, protocol_err_rx) = mpsc::channel(1);

        Arc::new(Self {
            node: RwLock::new(node),
            conn,
            protocols: protocol_map,
            closed,
            disconnection_tx,
            protocol_err_tx,
            receivers: Mutex::new(Some((disconnection_rx, protocol_err_rx))),
            ping_interval,
        })
    }

    /// Drive the peer: read loop, ping loop, and one task per sub-protocol
    /// `add_peer`. Returns the fault that terminated the session after all
    /// tasks have been joined.
    pub async fn run(self: Arc<Self>) -> NetError {
        let Some((mut disconnection_rx, mut protocol_err_rx)) =
            self.receivers.lock().await.take()
        else {
            return NetError::PeerClosed;
        };

        let (read_err_tx, mut read_err_rx) = mpsc::channel::<NetError>(1);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(self.clone().read_loop(read_err_tx)));
        tasks.push(tokio::spawn(self.clone().ping_loop()));
        self.notify_protocols(&mut tasks);

        let err = tokio::select! {
            Some(err) = read_err_rx.recv() => {
                tracing::warn!(error = %err, "peer read loop faulted");
                err
            }
            Some(reason) = disconnection_rx.recv() => {
                tracing::info!(reason, "peer got disconnection request");
                // best-effort: tell the remote why before tearing down
                let _ = self.conn.write_message(&Message::disc(reason)).await;
                NetError::DisconnectRequested(reason)
            }
            Some(err) = protocol_err_rx.recv() => {
                tracing::warn!(error = %err, "peer got protocol error");
                err
            }
            else => NetError::PeerClosed,
        };

        // Cancel first so every loop can observe the signal, then join.
        self.close();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(error = %err, "peer run quit");
        err
    }

    /// Fire the one-shot closed signal. Idempotent; the disconnection
    /// channel is deliberately left alone so a racing `disconnect` can
    /// never hit a torn-down channel.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Request disconnection with a reason. Never blocks; safe to call any
    /// number of times, before or after shutdown.
    pub fn disconnect(&self, reason: u8) {
        if self.disconnection_tx.try_send(reason).is_err() {
            tracing::debug!(reason, "disconnect request already pending or peer closing");
        }
    }

    /// Surface a sub-protocol failure; fatal for the peer.
    pub async fn protocol_error(&self, err: NetError) {
        tokio::select! {
            _ = self.protocol_err_tx.send(err) => {}
            _ = self.closed.cancelled() => {}
        }
    }

    async fn read_loop(self: Arc<Self>, read_err_tx: mpsc::Sender<NetError>) {
        loop {
            let msg = tokio::select! {
                _ = self.closed.cancelled() => return,
                res = self.conn.read_message() => match res {
                    Ok(msg) => msg,
                    Err(err) => {
                        let _ = read_err_tx.send(err).await;
                        return;
                    }
                },
            };

            if let Err(err) = self.handle(msg).await {
                let _ = read_err_tx.send(err).await;
                return;
            }
        }
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ping_interval);
        // a restartable timer rather than a fresh sleep per tick; the first
        // tick fires immediately and is not a probe
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.conn.write_message(&Message::control(CTL_MSG_PING)).await {
                        tracing::debug!(error = %err, "ping write failed");
                    }
                }
            }
        }
    }

    fn notify_protocols(self: &Arc<Self>, tasks: &mut Vec<JoinHandle<()>>) {
        for rw in self.protocols.values() {
            let Some(add_peer) = rw.proto.add_peer.clone() else {
                continue;
            };
            tracing::debug!(cap = %rw.cap(), "notifying sub-protocol of new peer");
            let peer = self.clone();
            let rw = rw.clone();
            tasks.push(tokio::spawn(async move {
                add_peer(peer, rw).await;
            }));
        }
    }

    /// Dispatch one inbound message: control codes first, then the unique
    /// wrapper whose window covers the code.
    async fn handle(&self, msg: Message) -> Result<(), NetError> {
        if msg.is_control() {
            match msg.code {
                CTL_MSG_PING => {
                    // reply off the read loop; a stalled writer must not
                    // stop us consuming from the socket
                    let conn = self.conn.clone();
                    tokio::spawn(async move {
                        if let Err(err) = conn.write_message(&Message::control(CTL_MSG_PONG)).await
                        {
                            tracing::debug!(error = %err, "pong write failed");
                        }
                    });
                }
                CTL_MSG_PONG => {}
                CTL_MSG_DISC => {
                    let reason = msg.payload.first().copied().unwrap_or(0);
                    return Err(NetError::DiscReceived(reason));
                }
                _ => {} // reserved control codes
            }
            return Ok(());
        }

        let target = self
            .protocols
            .values()
            .find(|rw| msg.code >= rw.offset && msg.code - rw.offset < rw.proto.length);
        let Some(target) = target else {
            return Err(NetError::UnknownCode(msg.code));
        };

        // Capacity-1 queue: blocking here is the backpressure policy.
        tokio::select! {
            res = target.inbound_tx.send(msg) => res.map_err(|_| NetError::PeerClosed),
            _ = self.closed.cancelled() => Err(NetError::PeerClosed),
        }
    }

    pub async fn node(&self) -> Option<Node> {
        self.node.read().await.clone()
    }

    pub(crate) async fn set_node(&self, node: Node) {
        *self.node.write().await = Some(node);
    }

    pub async fn shard(&self) -> ShardId {
        self.node
            .read()
            .await
            .as_ref()
            .map(|n| n.shard)
            .unwrap_or(UNDEFINED_SHARD)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub(crate) fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Capability string to wrapper map.
    pub fn protocol_map(&self) -> &HashMap<String, Arc<ProtocolRw>> {
        &self.protocols
    }

    /// Short summary of the connected peer.
    pub async fn info(&self) -> PeerInfo {
        let node = self.node.read().await.clone();

        let mut caps: Vec<String> = self.protocols.keys().cloned().collect();
        caps.sort();

        let mut protocols = BTreeMap::new();
        for rw in self.protocols.values() {
            let metadata = match (&rw.proto.get_peer, &node) {
                (Some(query), Some(node)) => {
                    query(&node.id).unwrap_or_else(|| Value::from("handshake"))
                }
                (Some(_), None) => Value::from("handshake"),
                (None, _) => Value::from("unknown"),
            };
            protocols.insert(rw.proto.name.clone(), metadata);
        }

        PeerInfo {
            id: node.map(|n| n.id.to_hex()).unwrap_or_default(),
            caps,
            network: NetworkInfo {
                local_address: self.local_addr().to_string(),
                remote_address: self.remote_addr().to_string(),
            },
            protocols,
        }
    }
}

/// Short summary of a connected peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub caps: Vec<String>,
    pub network: NetworkInfo,
    pub protocols: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub local_address: String,
    pub remote_address: String,
}
