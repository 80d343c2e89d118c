//! Mutual-authentication handshake.
//!
//! Both sides exchange one wrapped `ProtoHandShake` each; the initiator
//! writes first. The wrap binds the plaintext payload to the sender's
//! identity key and to the session nonces:
//!
//! ```text
//! extra  = md5(payload) || nonce_client BE || nonce_server BE   (32 bytes)
//! inner  = extra || sign_recoverable(extra)
//! frame  = payload || ecies(peer_pubkey, inner) || len(enc) as u32 BE
//! ```
//!
//! Verifying a wrap proves the remote controls the private key for the node
//! id it claims, and that it saw our nonce.

use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;

use shardnet_crypto::{
    ecies, identity::recover_node_id, md5_digest, CryptoError, Identity, NodeId,
};
use shardnet_protocol::{
    Cap, Message, ProtoHandShake, CTL_MSG_PROTO_HANDSHAKE, HS_EXTRA_DATA_LEN,
};

use crate::conn::Connection;
use crate::discovery::Node;
use crate::error::NetError;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed handshake message")]
    Malformed,
    #[error("handshake payload digest mismatch")]
    Integrity,
    #[error("recovered public key does not match claimed node id")]
    IdentityMismatch,
    #[error("peer did not echo our nonce")]
    NonceMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Handshake engine. Stateless apart from the local identity key.
pub struct Handshake {
    identity: Arc<Identity>,
}

impl Handshake {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self { identity }
    }

    /// Wrap a handshake payload for `peer_node_id`.
    pub fn pack(
        &self,
        handshake_msg: &ProtoHandShake,
        peer_node_id: &NodeId,
        nonce_client: u64,
        nonce_server: u64,
    ) -> Result<Message, HandshakeError> {
        let body = handshake_msg.encode().map_err(|_| HandshakeError::Malformed)?;

        let mut extra = [0u8; HS_EXTRA_DATA_LEN];
        extra[..16].copy_from_slice(&md5_digest(&body));
        extra[16..24].copy_from_slice(&nonce_client.to_be_bytes());
        extra[24..32].copy_from_slice(&nonce_server.to_be_bytes());

        // sign with the local key, then encrypt to the peer's key
        let signature = self.identity.sign_recoverable(&extra)?;
        let mut inner = Vec::with_capacity(HS_EXTRA_DATA_LEN + signature.len());
        inner.extend_from_slice(&extra);
        inner.extend_from_slice(&signature);

        let peer_key = peer_node_id.public_key()?;
        let enc = ecies::encrypt(&peer_key, &inner)?;

        let mut payload = Vec::with_capacity(body.len() + enc.len() + 4);
        payload.extend_from_slice(&body);
        payload.extend_from_slice(&enc);
        payload.extend_from_slice(&(enc.len() as u32).to_be_bytes());
        Ok(Message::new(CTL_MSG_PROTO_HANDSHAKE, payload))
    }

    /// Verify a wrapped handshake message and recover the payload and both
    /// nonces. The nonces live in the encrypted extra block, so they are
    /// only meaningful after decryption succeeds.
    pub fn unpack(&self, msg: &Message) -> Result<(ProtoHandShake, u64, u64), HandshakeError> {
        if msg.code != CTL_MSG_PROTO_HANDSHAKE {
            return Err(HandshakeError::Malformed);
        }
        let payload = &msg.payload;
        if payload.len() < HS_EXTRA_DATA_LEN + 4 {
            return Err(HandshakeError::Malformed);
        }

        let len = payload.len();
        let enc_len = u32::from_be_bytes(
            payload[len - 4..]
                .try_into()
                .map_err(|_| HandshakeError::Malformed)?,
        ) as usize;
        let body_len = len
            .checked_sub(enc_len + 4)
            .ok_or(HandshakeError::Malformed)?;

        let body = &payload[..body_len];
        let handshake_msg =
            ProtoHandShake::decode(body).map_err(|_| HandshakeError::Malformed)?;

        // decrypt with the local key: proves the wrap was addressed to us
        let inner = ecies::decrypt(self.identity.secret_key(), &payload[body_len..len - 4])?;
        if inner.len() <= HS_EXTRA_DATA_LEN {
            return Err(HandshakeError::Malformed);
        }
        let extra: [u8; HS_EXTRA_DATA_LEN] = inner[..HS_EXTRA_DATA_LEN]
            .try_into()
            .map_err(|_| HandshakeError::Malformed)?;

        // recover the signer: proves the wrap came from the claimed node
        let recovered = recover_node_id(&extra, &inner[HS_EXTRA_DATA_LEN..])?;
        if recovered != handshake_msg.node_id {
            return Err(HandshakeError::IdentityMismatch);
        }

        if md5_digest(body)[..] != extra[..16] {
            return Err(HandshakeError::Integrity);
        }

        let nonce_client = u64::from_be_bytes(
            extra[16..24].try_into().map_err(|_| HandshakeError::Malformed)?,
        );
        let nonce_server = u64::from_be_bytes(
            extra[24..32].try_into().map_err(|_| HandshakeError::Malformed)?,
        );
        Ok((handshake_msg, nonce_client, nonce_server))
    }

    /// Run the exchange on `conn`. The outbound side writes first; the
    /// inbound side reads first and echoes the client nonce back.
    pub async fn execute(
        &self,
        conn: &Connection,
        caps: Vec<Cap>,
        direction: Direction,
        dial_dest: Option<&Node>,
    ) -> Result<(ProtoHandShake, u64, u64), NetError> {
        let local = ProtoHandShake::new(self.identity.node_id(), caps);

        match direction {
            Direction::Outbound => {
                let dest = dial_dest.ok_or_else(|| {
                    NetError::Config("outbound handshake needs a dial destination".into())
                })?;
                let nonce_client = OsRng.next_u64();

                let wrapped = self.pack(&local, &dest.id, nonce_client, 0)?;
                conn.write_message(&wrapped).await?;

                let reply = conn.read_message().await?;
                let (remote, echoed_client, nonce_server) = self.unpack(&reply)?;
                if echoed_client != nonce_client {
                    return Err(HandshakeError::NonceMismatch.into());
                }
                Ok((remote, nonce_client, nonce_server))
            }
            Direction::Inbound => {
                let nonce_server = OsRng.next_u64();

                let first = conn.read_message().await?;
                let (remote, nonce_client, _) = self.unpack(&first)?;

                let reply = self.pack(&local, &remote.node_id, nonce_client, nonce_server)?;
                conn.write_message(&reply).await?;
                Ok((remote, nonce_client, nonce_server))
            }
        }
    }
}
