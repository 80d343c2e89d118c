//! Wire message, control code space, capability and handshake payload types.

use serde::{Deserialize, Serialize};
use shardnet_crypto::NodeId;
use std::fmt;

use crate::ProtocolError;

/// Liveness probe; the receiver replies with [`CTL_MSG_PONG`].
pub const CTL_MSG_PING: u16 = 1;

/// Reply to a ping.
pub const CTL_MSG_PONG: u16 = 2;

/// Peer-initiated disconnect. Payload optionally carries a 1-byte reason.
pub const CTL_MSG_DISC: u16 = 3;

/// Wrapped handshake payload; only valid during the handshake exchange.
pub const CTL_MSG_PROTO_HANDSHAKE: u16 = 4;

/// First code available to sub-protocols. Codes 5..16 are reserved and
/// ignored when received.
pub const BASE_PROTO_CODE: u16 = 16;

/// Disconnect reason: the remote address already has a live peer.
pub const DISC_ALREADY_CONNECTED: u8 = 10;

/// Disconnect reason: the server is shutting down.
pub const DISC_SERVER_QUIT: u8 = 11;

/// Length of the handshake extra-data block:
/// md5(payload) || client nonce (BE) || server nonce (BE).
pub const HS_EXTRA_DATA_LEN: usize = 32;

/// A single wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(code: u16, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// A control message with an empty payload.
    pub fn control(code: u16) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }

    /// A disconnect message carrying a reason code.
    pub fn disc(reason: u8) -> Self {
        Self {
            code: CTL_MSG_DISC,
            payload: vec![reason],
        }
    }

    /// Whether this is a transport control message.
    pub fn is_control(&self) -> bool {
        self.code < BASE_PROTO_CODE
    }
}

/// A sub-protocol capability: `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cap {
    pub name: String,
    pub version: u32,
}

impl Cap {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Application-level handshake payload: the sender's claimed identity and
/// its supported capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtoHandShake {
    pub node_id: NodeId,
    pub caps: Vec<Cap>,
}

impl ProtoHandShake {
    pub fn new(node_id: NodeId, caps: Vec<Cap>) -> Self {
        Self { node_id, caps }
    }

    /// Serialize to the opaque wire encoding.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the opaque wire encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardnet_crypto::Identity;

    #[test]
    fn cap_display() {
        assert_eq!(Cap::new("chain", 1).to_string(), "chain/1");
    }

    #[test]
    fn handshake_payload_round_trip() {
        let hs = ProtoHandShake::new(
            Identity::generate().node_id(),
            vec![Cap::new("chain", 1), Cap::new("relay", 3)],
        );
        let bytes = hs.encode().unwrap();
        let decoded = ProtoHandShake::decode(&bytes).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn disc_message_carries_reason() {
        let msg = Message::disc(DISC_SERVER_QUIT);
        assert_eq!(msg.code, CTL_MSG_DISC);
        assert_eq!(msg.payload, vec![DISC_SERVER_QUIT]);
        assert!(msg.is_control());
    }

    #[test]
    fn control_code_space_is_below_base() {
        for code in [
            CTL_MSG_PING,
            CTL_MSG_PONG,
            CTL_MSG_DISC,
            CTL_MSG_PROTO_HANDSHAKE,
        ] {
            assert!(code < BASE_PROTO_CODE);
        }
    }
}
