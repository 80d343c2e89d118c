//! Server: listener, dial orchestration, handshake admission, peer tables.
//!
//! Both peer tables (primary and per-shard) are mutated only from the `run`
//! loop, fed by the add/del channels. Reads elsewhere see a consistent
//! snapshot that may trail the latest update.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shardnet_crypto::{Address, Identity, NodeId};
use shardnet_protocol::{Cap, DISC_ALREADY_CONNECTED, DISC_SERVER_QUIT};

use crate::config::Config;
use crate::conn::Connection;
use crate::discovery::{self, Database, Node, ShardId, SHARD_COUNT};
use crate::error::NetError;
use crate::handshake::{Direction, Handshake};
use crate::peer::{Peer, PeerInfo};
use crate::subprotocol::Protocol;

/// Maximum number of concurrently handshaking inbound connections when
/// `max_pending_peers` is left at zero.
pub const MAX_ACCEPT_CONNS: usize = 50;

/// Dial timeout for outbound connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Default)]
struct Tables {
    primary: HashMap<Address, Arc<Peer>>,
    by_shard: HashMap<ShardId, HashMap<Address, Arc<Peer>>>,
}

/// The two mutually consistent views of the connected peer set.
/// Write methods are only called from the server's `run` loop.
pub(crate) struct PeerTable {
    inner: RwLock<Tables>,
}

impl PeerTable {
    fn new() -> Self {
        let mut tables = Tables::default();
        for shard in 1..=SHARD_COUNT {
            tables.by_shard.insert(shard, HashMap::new());
        }
        Self {
            inner: RwLock::new(tables),
        }
    }

    pub(crate) async fn get(&self, addr: &Address) -> Option<Arc<Peer>> {
        self.inner.read().await.primary.get(addr).cloned()
    }

    pub(crate) async fn contains(&self, addr: &Address) -> bool {
        self.inner.read().await.primary.contains_key(addr)
    }

    pub(crate) async fn count(&self) -> usize {
        self.inner.read().await.primary.len()
    }

    pub(crate) async fn shard_count(&self, shard: ShardId) -> usize {
        self.inner
            .read()
            .await
            .by_shard
            .get(&shard)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    pub(crate) async fn all(&self) -> Vec<Arc<Peer>> {
        self.inner.read().await.primary.values().cloned().collect()
    }

    /// Install a peer in both views, overwriting the primary entry.
    async fn insert(&self, addr: Address, shard: ShardId, peer: Arc<Peer>) {
        let mut tables = self.inner.write().await;
        tables
            .by_shard
            .entry(shard)
            .or_default()
            .insert(addr, peer.clone());
        tables.primary.insert(addr, peer);
    }

    /// Drop a displaced peer from its shard bucket only. The primary entry
    /// is overwritten by the replacement; the displaced peer's eventual
    /// delete is identity-guarded and becomes a no-op.
    async fn remove_from_shard(&self, addr: &Address, shard: ShardId) {
        if let Some(bucket) = self.inner.write().await.by_shard.get_mut(&shard) {
            bucket.remove(addr);
        }
    }

    /// Remove `peer` from both views, but only while it is still the
    /// current entry for `addr`.
    async fn remove_if_current(&self, addr: &Address, shard: ShardId, peer: &Arc<Peer>) -> bool {
        let mut tables = self.inner.write().await;
        let is_current = tables
            .primary
            .get(addr)
            .map(|current| Arc::ptr_eq(current, peer))
            .unwrap_or(false);
        if !is_current {
            return false;
        }
        tables.primary.remove(addr);
        if let Some(bucket) = tables.by_shard.get_mut(&shard) {
            bucket.remove(addr);
        }
        true
    }
}

/// Manages all p2p peer connections.
pub struct Server {
    config: Config,
    protocols: Vec<Protocol>,
    identity: Arc<Identity>,
    handshake: Handshake,
    peers: PeerTable,
    running: Mutex<bool>,
    quit: CancellationToken,
    kad_db: OnceLock<Arc<Database>>,
    self_node: OnceLock<Node>,
    add_peer_tx: mpsc::Sender<Arc<Peer>>,
    del_peer_tx: mpsc::Sender<Arc<Peer>>,
    loop_rx: Mutex<Option<(mpsc::Receiver<Arc<Peer>>, mpsc::Receiver<Arc<Peer>>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Build a server. The protocol order fixes the code-range assignment
    /// for every session, so it is part of the wire contract.
    pub fn new(config: Config, protocols: Vec<Protocol>) -> Result<Arc<Self>, NetError> {
        let key_hex = config
            .private_key
            .as_deref()
            .ok_or_else(|| NetError::Config("private_key is mandatory".into()))?;
        let identity = Arc::new(
            Identity::from_hex(key_hex)
                .map_err(|e| NetError::Config(format!("bad private_key: {e}")))?,
        );

        let (add_peer_tx, add_peer_rx) = mpsc::channel(1);
        let (del_peer_tx, del_peer_rx) = mpsc::channel(1);

        Ok(Arc::new(Self {
            config,
            protocols,
            handshake: Handshake::new(identity.clone()),
            identity,
            peers: PeerTable::new(),
            running: Mutex::new(false),
            quit: CancellationToken::new(),
            kad_db: OnceLock::new(),
            self_node: OnceLock::new(),
            add_peer_tx,
            del_peer_tx,
            loop_rx: Mutex::new(Some((add_peer_rx, del_peer_rx))),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start listening and dialing on `shard`. Guarded against double-start.
    pub async fn start(self: &Arc<Self>, shard: ShardId) -> Result<(), NetError> {
        let mut running = self.running.lock().await;
        if *running {
            return Err(NetError::AlreadyRunning);
        }

        tracing::info!("starting p2p networking");
        let listen_addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| NetError::Config(format!("bad listen_addr: {e}")))?;

        // bind before building the self node so it carries the actual port
        let listener = TcpListener::bind(listen_addr).await?;
        let bound = listener.local_addr()?;
        let self_node = Node::new(self.identity.node_id(), bound, shard);
        tracing::info!(node = %self_node, "p2p server identity");
        let _ = self.self_node.set(self_node.clone());

        let db =
            discovery::start_service(self_node, self.config.static_nodes.clone(), shard).await;
        let _ = self.kad_db.set(db.clone());

        let hook_server = self.clone();
        db.set_hook_for_new_node(Arc::new(move |node| {
            let server = hook_server.clone();
            tokio::spawn(async move { server.add_node(node).await });
        }))
        .await;

        let Some((add_peer_rx, del_peer_rx)) = self.loop_rx.lock().await.take() else {
            return Err(NetError::AlreadyRunning);
        };
        let run_handle = tokio::spawn(self.clone().run(add_peer_rx, del_peer_rx));
        let listen_handle = tokio::spawn(self.clone().listen_loop(listener));
        self.tasks.lock().await.extend([run_handle, listen_handle]);

        *running = true;
        Ok(())
    }

    /// Discovery hook: dial a newly known node.
    async fn add_node(self: Arc<Self>, node: Node) {
        if !node.has_shard() {
            return;
        }
        if node.id == self.identity.node_id() {
            return;
        }
        if self.peers.contains(&node.address()).await {
            return;
        }

        let target = node.tcp_addr();
        tracing::info!(node = %node, "dialing discovered node");
        let stream =
            match tokio::time::timeout(DEFAULT_DIAL_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    tracing::error!(node = %node, error = %err, "dial failed");
                    return;
                }
                Err(_) => {
                    tracing::error!(node = %node, "dial timed out");
                    return;
                }
            };

        if let Err(err) = self.setup_conn(stream, Direction::Outbound, Some(node)).await {
            tracing::info!(error = %err, "outbound connection setup failed");
        }
    }

    /// Accept inbound connections, bounded by handshake slots. Temporary
    /// accept errors are retried; permanent ones stop the loop.
    async fn listen_loop(self: Arc<Self>, listener: TcpListener) {
        let tokens = if self.config.max_pending_peers > 0 {
            self.config.max_pending_peers
        } else {
            MAX_ACCEPT_CONNS
        };
        let slots = Arc::new(Semaphore::new(tokens));

        loop {
            // wait for a handshake slot before accepting
            let permit = tokio::select! {
                _ = self.quit.cancelled() => return,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let (stream, remote) = tokio::select! {
                _ = self.quit.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) if is_temporary_accept_error(&err) => {
                        drop(permit);
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "accept failed, stopping listener");
                        return;
                    }
                },
            };

            tracing::info!(%remote, "accepted inbound connection");
            let server = self.clone();
            let handle = tokio::spawn(async move {
                if let Err(err) = server.setup_conn(stream, Direction::Inbound, None).await {
                    tracing::info!(%remote, error = %err, "inbound connection setup failed");
                }
                drop(permit); // slot returns once setup finished either way
            });
            self.tasks.lock().await.push(handle);
        }
    }

    /// Authenticate a fresh connection and, on success, hand the peer to the
    /// run loop under a supervisor task.
    async fn setup_conn(
        self: &Arc<Self>,
        stream: TcpStream,
        direction: Direction,
        dial_dest: Option<Node>,
    ) -> Result<(), NetError> {
        let conn = Arc::new(Connection::new(stream)?);
        let peer = Peer::new(conn.clone(), &self.protocols, dial_dest.clone());
        let caps: Vec<Cap> = self.protocols.iter().map(|p| p.cap()).collect();

        let (remote, nonce_client, nonce_server) = match self
            .handshake
            .execute(&conn, caps, direction, dial_dest.as_ref())
            .await
        {
            Ok(done) => done,
            Err(err) => {
                tracing::info!(remote = %conn.peer_addr(), error = %err, "handshake failed");
                peer.close();
                return Err(err);
            }
        };

        if direction == Direction::Inbound {
            let db = self
                .kad_db
                .get()
                .ok_or_else(|| NetError::Config("discovery not initialised".into()))?;
            let Some(node) = db.find_by_node_id(&remote.node_id).await else {
                tracing::info!(peer = %remote.node_id, "authenticated node unknown to discovery");
                peer.close();
                return Err(NetError::UnknownPeer(remote.node_id));
            };
            peer.set_node(node).await;
        }
        tracing::debug!(
            peer = %remote.node_id,
            nonce_client,
            nonce_server,
            caps = ?remote.caps,
            "handshake complete"
        );

        let add_peer_tx = self.add_peer_tx.clone();
        let del_peer_tx = self.del_peer_tx.clone();
        let quit = self.quit.clone();
        let handle = tokio::spawn(async move {
            // registration races server shutdown; don't strand the peer
            tokio::select! {
                sent = add_peer_tx.send(peer.clone()) => {
                    if sent.is_err() {
                        peer.close();
                        return;
                    }
                }
                _ = quit.cancelled() => {
                    peer.close();
                    return;
                }
            }
            let run = peer.clone().run();
            tokio::pin!(run);
            let err = tokio::select! {
                err = &mut run => err,
                _ = quit.cancelled() => {
                    // shutdown may race registration; make sure this peer
                    // hears about it even if the run loop never saw it
                    peer.disconnect(DISC_SERVER_QUIT);
                    run.await
                }
            };
            tracing::debug!(error = %err, "supervised peer exited");
            let _ = del_peer_tx.send(peer).await;
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Central loop: the only writer of the peer tables.
    async fn run(
        self: Arc<Self>,
        mut add_peer_rx: mpsc::Receiver<Arc<Peer>>,
        mut del_peer_rx: mpsc::Receiver<Arc<Peer>>,
    ) {
        tracing::info!("p2p server running");
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => {
                    tracing::warn!("server got quit signal, cleaning up");
                    break;
                }
                Some(peer) = add_peer_rx.recv() => self.add_peer(peer).await,
                Some(peer) = del_peer_rx.recv() => self.delete_peer(peer).await,
                else => break,
            }
        }

        // Disconnect every peer and drain exits until the table is empty.
        for peer in self.peers.all().await {
            peer.disconnect(DISC_SERVER_QUIT);
        }
        while self.peers.count().await > 0 {
            match del_peer_rx.recv().await {
                Some(peer) => self.delete_peer(peer).await,
                None => break,
            }
        }
        tracing::info!("p2p server run loop done");
    }

    async fn add_peer(&self, peer: Arc<Peer>) {
        let Some(node) = peer.node().await else {
            tracing::warn!("refusing to register peer without a node record");
            peer.close();
            return;
        };
        let addr = node.address();

        if let Some(old_peer) = self.peers.get(&addr).await {
            tracing::info!(peer = %node, "address already connected, replacing old peer");
            old_peer.disconnect(DISC_ALREADY_CONNECTED);
            let old_shard = old_peer.shard().await;
            self.peers.remove_from_shard(&addr, old_shard).await;
        }

        self.peers.insert(addr, node.shard, peer).await;
        let peers = self.peers.count().await;
        tracing::info!(peer = %node, peers, "peer registered");
    }

    async fn delete_peer(&self, peer: Arc<Peer>) {
        let Some(node) = peer.node().await else {
            return;
        };
        let addr = node.address();
        if self.peers.remove_if_current(&addr, node.shard, &peer).await {
            let peers = self.peers.count().await;
            tracing::info!(peer = %node, peers, "peer removed");
        } else {
            tracing::info!(peer = %node, "stale peer exit ignored");
        }
    }

    /// Number of connected peers.
    pub async fn peer_count(&self) -> usize {
        self.peers.count().await
    }

    /// Number of connected peers in one shard.
    pub async fn shard_peer_count(&self, shard: ShardId) -> usize {
        self.peers.shard_count(shard).await
    }

    /// Metadata for every connected peer, sorted by hex node id.
    pub async fn peers_info(&self) -> Vec<PeerInfo> {
        let mut infos = Vec::new();
        for peer in self.peers.all().await {
            infos.push(peer.info().await);
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// The advertised self node record; set by `start`.
    pub fn self_node(&self) -> Option<&Node> {
        self.self_node.get()
    }

    /// The discovery database; set by `start`.
    pub fn discovery_db(&self) -> Option<&Arc<Database>> {
        self.kad_db.get()
    }

    /// Stop the server and wait for every supervised task. Idempotent.
    pub async fn stop(&self) {
        {
            let mut running = self.running.lock().await;
            if !*running {
                return;
            }
            *running = false;
        }
        self.quit.cancel();
        self.wait().await;
    }

    /// Wait for all server tasks (loops and supervisors) to finish.
    pub async fn wait(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock().await;
                tasks.drain(..).collect()
            };
            if drained.is_empty() {
                return;
            }
            for task in drained {
                let _ = task.await;
            }
        }
    }
}

fn is_temporary_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
