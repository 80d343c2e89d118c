//! Error taxonomy for the peer/server complex.

use shardnet_crypto::NodeId;
use shardnet_protocol::ProtocolError;

use crate::handshake::HandshakeError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Transport fault: any read/write failure, fatal for the owning peer.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// A wrapper write used a local code at or above the protocol's window.
    /// Surfaced to the calling sub-protocol, not fatal for the peer.
    #[error("invalid message code {0}")]
    InvalidCode(u16),
    /// An inbound code matched no registered window. Fatal for the peer.
    #[error("no sub-protocol registered for code {0}")]
    UnknownCode(u16),
    #[error("peer connection closed")]
    PeerClosed,
    /// The remote sent a disconnect control message.
    #[error("disconnect received from remote (reason {0})")]
    DiscReceived(u8),
    /// A local `Disconnect(reason)` request; the non-error shutdown path.
    #[error("disconnection requested (reason {0})")]
    DisconnectRequested(u8),
    /// Handshake-authenticated node absent from the discovery database.
    #[error("node {0} not found in discovery database")]
    UnknownPeer(NodeId),
    #[error("server already running")]
    AlreadyRunning,
    #[error("config: {0}")]
    Config(String),
}
