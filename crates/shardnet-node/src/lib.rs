//! Shardnet Node -- authenticated, multiplexed TCP connections for a
//! sharded chain node.
//!
//! The server dials nodes surfaced by discovery, authenticates each
//! connection with a mutual handshake bound to the remote's identity key,
//! and demultiplexes wire messages into per-sub-protocol windows. Peer-table
//! bookkeeping is serialized through the server's central run loop.

pub mod config;
pub mod conn;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod peer;
pub mod server;
pub mod subprotocol;

pub use config::Config;
pub use conn::Connection;
pub use discovery::{Database, Node, ShardId, SHARD_COUNT, UNDEFINED_SHARD};
pub use error::NetError;
pub use handshake::{Direction, Handshake, HandshakeError};
pub use peer::{Peer, PeerInfo, ProtocolRw, PING_INTERVAL};
pub use server::{Server, DEFAULT_DIAL_TIMEOUT, MAX_ACCEPT_CONNS};
pub use subprotocol::{AddPeerFn, GetPeerFn, Protocol};
