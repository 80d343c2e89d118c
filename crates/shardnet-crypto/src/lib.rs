//! Shardnet Crypto -- secp256k1 node identity, recoverable ECDSA, ECIES.
//!
//! A node is identified by its uncompressed secp256k1 public key with the
//! leading tag byte stripped (64 bytes). The short `Address` form keys the
//! server's peer tables.

use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub mod ecies;
pub mod identity;

pub use identity::Identity;

/// Length of a node id: uncompressed public key minus the 0x04 tag.
pub const NODE_ID_LEN: usize = 64;

/// Length of the short address form.
pub const ADDRESS_LEN: usize = 20;

/// Recoverable signature length: 64-byte compact form plus the recovery id.
pub const SIGNATURE_LEN: usize = 65;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("ecies encryption failed: {0}")]
    Encrypt(String),
    #[error("ecies decryption failed")]
    Decrypt,
    #[error("secp256k1: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Node identifier: uncompressed secp256k1 public key, tag byte stripped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive the id from a public key.
    pub fn from_public_key(key: &secp256k1::PublicKey) -> Self {
        let uncompressed = key.serialize_uncompressed();
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&uncompressed[1..]);
        NodeId(id)
    }

    /// Reconstruct the full public key (prepends the uncompressed tag).
    pub fn public_key(&self) -> Result<secp256k1::PublicKey, CryptoError> {
        let mut buf = [0u8; NODE_ID_LEN + 1];
        buf[0] = 0x04;
        buf[1..].copy_from_slice(&self.0);
        secp256k1::PublicKey::from_slice(&buf).map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Short address form: trailing 20 bytes of SHA-256 over the id.
    pub fn address(&self) -> Address {
        let digest = Sha256::digest(self.0);
        let mut addr = [0u8; ADDRESS_LEN];
        addr.copy_from_slice(&digest[digest.len() - ADDRESS_LEN..]);
        Address(addr)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for NodeId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(CryptoError::InvalidPublicKey);
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&bytes);
        Ok(NodeId(id))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Short node address, used as the peer-table key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

/// MD5 digest of `data`. The handshake extra block carries this alongside
/// the session nonces; MD5 is an integrity check here, not an authenticator
/// (the block is additionally signed).
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}
