//! Sub-protocol declarations.
//!
//! A sub-protocol reserves a window of `length` message codes within each
//! peer session and may hook peer arrival (`add_peer`) and introspection
//! (`get_peer`). Both hooks are optional, mirroring how higher layers
//! register only what they need.

use serde_json::Value;
use shardnet_crypto::NodeId;
use shardnet_protocol::Cap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::peer::{Peer, ProtocolRw};

pub type AddPeerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked once per peer after the wrappers are installed. Runs as one of
/// the peer's tasks; it must return before the peer finishes shutting down.
pub type AddPeerFn = Arc<dyn Fn(Arc<Peer>, Arc<ProtocolRw>) -> AddPeerFuture + Send + Sync>;

/// Sub-protocol metadata lookup for peer introspection.
pub type GetPeerFn = Arc<dyn Fn(&NodeId) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
pub struct Protocol {
    pub name: String,
    pub version: u32,
    /// Size of the reserved code window. A zero-length window is legal; the
    /// sub-protocol then never receives a message.
    pub length: u16,
    pub add_peer: Option<AddPeerFn>,
    pub get_peer: Option<GetPeerFn>,
}

impl Protocol {
    pub fn new(name: impl Into<String>, version: u32, length: u16) -> Self {
        Self {
            name: name.into(),
            version,
            length,
            add_peer: None,
            get_peer: None,
        }
    }

    /// Capability identifier: unique within a peer session.
    pub fn cap(&self) -> Cap {
        Cap::new(self.name.clone(), self.version)
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("length", &self.length)
            .field("add_peer", &self.add_peer.is_some())
            .field("get_peer", &self.get_peer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_identifier() {
        let proto = Protocol::new("chain", 2, 9);
        assert_eq!(proto.cap().to_string(), "chain/2");
    }
}
