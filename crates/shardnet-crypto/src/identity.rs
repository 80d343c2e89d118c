//! secp256k1 node identity -- keypair generation, key-file loading,
//! recoverable signing and public-key recovery.

use rand::rngs::OsRng;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use std::path::Path;

use crate::{CryptoError, NodeId, SIGNATURE_LEN};

/// Node identity wrapping a secp256k1 keypair.
pub struct Identity {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
    public_key: PublicKey,
    node_id: NodeId,
}

impl Identity {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        let node_id = NodeId::from_public_key(&public_key);
        Self {
            secp,
            secret_key,
            public_key,
            node_id,
        }
    }

    /// Build an identity from an existing secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        let node_id = NodeId::from_public_key(&public_key);
        Self {
            secp,
            secret_key,
            public_key,
            node_id,
        }
    }

    /// Parse a hex-encoded 32-byte secret key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Hex encoding of the secret key, as stored in the key file.
    pub fn to_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Load the key file at `path`, or generate one and write it there.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let hex_key = std::fs::read_to_string(path)?;
            return Self::from_hex(&hex_key);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, identity.to_hex())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(identity)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Sign a 32-byte digest, returning the 65-byte recoverable form
    /// (compact r||s followed by the recovery id).
    pub fn sign_recoverable(&self, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
        let msg = Message::from_digest_slice(digest)?;
        let sig = self.secp.sign_ecdsa_recoverable(&msg, &self.secret_key);
        let (recovery_id, compact) = sig.serialize_compact();

        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&compact);
        out[64] = recovery_id.to_i32() as u8;
        Ok(out)
    }
}

/// Recover the signer's node id from a 32-byte digest and a 65-byte
/// recoverable signature.
pub fn recover_node_id(digest: &[u8; 32], signature: &[u8]) -> Result<NodeId, CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature);
    }
    let recovery_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| CryptoError::InvalidSignature)?;
    let sig = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| CryptoError::InvalidSignature)?;

    let msg = Message::from_digest_slice(digest)?;
    let secp = Secp256k1::new();
    let key = secp
        .recover_ecdsa(&msg, &sig)
        .map_err(|_| CryptoError::InvalidSignature)?;
    Ok(NodeId::from_public_key(&key))
}
