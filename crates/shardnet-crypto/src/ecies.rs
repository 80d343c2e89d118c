//! ECIES over secp256k1 -- ephemeral ECDH, SHA-256 key derivation,
//! AES-256-GCM payload encryption.
//!
//! Wire form: ephemeral compressed public key (33 bytes) || nonce (12 bytes)
//! || ciphertext with appended auth tag. Both ends of a handshake run this
//! code, so the construction only has to agree with itself.

use rand::rngs::OsRng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::CryptoError;

const EPHEMERAL_PUB_LEN: usize = 33;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Minimum length of a well-formed ECIES blob.
pub const MIN_CIPHERTEXT_LEN: usize = EPHEMERAL_PUB_LEN + NONCE_LEN + TAG_LEN;

fn derive_key(shared: &SharedSecret) -> Result<LessSafeKey, CryptoError> {
    let key_bytes: [u8; 32] = Sha256::digest(shared.secret_bytes()).into();
    let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
        .map_err(|_| CryptoError::Encrypt("invalid derived key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` to the holder of `peer_key`.
pub fn encrypt(peer_key: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let secp = Secp256k1::new();
    let (ephemeral_secret, ephemeral_public) = secp.generate_keypair(&mut OsRng);

    let shared = SharedSecret::new(peer_key, &ephemeral_secret);
    let key = derive_key(&shared)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::Encrypt("rng failure".into()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    // ring appends the auth tag in place
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Encrypt("seal failed".into()))?;

    let mut out = Vec::with_capacity(EPHEMERAL_PUB_LEN + NONCE_LEN + in_out.len());
    out.extend_from_slice(&ephemeral_public.serialize());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`] with the receiver's secret key.
/// All failure modes collapse to [`CryptoError::Decrypt`].
pub fn decrypt(secret_key: &SecretKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::Decrypt);
    }

    let ephemeral_public =
        PublicKey::from_slice(&data[..EPHEMERAL_PUB_LEN]).map_err(|_| CryptoError::Decrypt)?;
    let shared = SharedSecret::new(&ephemeral_public, secret_key);
    let key = derive_key(&shared).map_err(|_| CryptoError::Decrypt)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&data[EPHEMERAL_PUB_LEN..EPHEMERAL_PUB_LEN + NONCE_LEN]);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = data[EPHEMERAL_PUB_LEN + NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(plaintext.to_vec())
}
