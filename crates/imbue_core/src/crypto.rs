//! Symmetric wire encryption derived from the shared token.
//!
//! Each message line is sealed independently: `nonce + ciphertext`, with a
//! fresh random nonce. Both sides derive the same key from the token, so a
//! mismatched token surfaces as a decrypt failure on the first message.

use crate::{ImbueError, Result};
use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &[u8] = b"imbue-wire-v1";

/// Derives the 32-byte wire key from a shared token.
pub fn derive_wire_key(token: &str) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(KEY_CONTEXT);
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Seals and opens individual wire messages.
#[derive(Clone)]
pub struct WireCipher {
    cipher: ChaCha20Poly1305,
}

impl WireCipher {
    pub fn from_token(token: &str) -> Result<Self> {
        let key = derive_wire_key(token);
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| ImbueError::Crypto(format!("Failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext`, returning `nonce + ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ImbueError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts data produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(ImbueError::Crypto(
                "Sealed message shorter than nonce".to_string(),
            ));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|e| ImbueError::Crypto(format!("Decryption failed: {}", e)))
    }
}
