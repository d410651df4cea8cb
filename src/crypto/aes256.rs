//! AES-256-GCM AEAD cipher block.
//!
//! Output format is `nonce(12) || ciphertext || tag(16)`, so the sealed form
//! is 28 bytes longer than the plaintext. A fresh random nonce is drawn for
//! every message; decryption verifies the tag and fails on any tampering.

use super::Block;
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};

/// Minimum sealed length: 12-byte nonce + 16-byte tag.
const OVERHEAD: usize = 28;

pub struct Aes256Block {
    cipher: Aes256Gcm,
}

impl Aes256Block {
    /// Create a cipher from the shared 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(key.into());
        Self { cipher }
    }

    fn generate_nonce() -> [u8; 12] {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }
}

impl Block for Aes256Block {
    /// Seal the buffer in place: `data` becomes `nonce || ciphertext || tag`.
    fn encrypt(&self, data: &mut Vec<u8>) -> crate::Result<()> {
        let nonce_bytes = Self::generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, data.as_ref())
            .map_err(|e| format!("AES-256-GCM encryption failed: {}", e))?;

        data.clear();
        data.extend_from_slice(&nonce_bytes);
        data.extend_from_slice(&ciphertext);

        Ok(())
    }

    /// Open the buffer in place. Fails if the buffer is shorter than the
    /// nonce+tag overhead or if tag verification fails.
    fn decrypt(&self, data: &mut Vec<u8>) -> crate::Result<()> {
        if data.len() < OVERHEAD {
            return Err("sealed frame too short for AES-256-GCM".into());
        }

        let nonce = Nonce::from_slice(&data[0..12]);
        let ciphertext = &data[12..];

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| "AES-256-GCM authentication failed".to_string())?;

        data.clear();
        data.extend_from_slice(&plaintext);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let block = Aes256Block::new(&[0u8; 32]);
        let msg = b"ping across the tunnel".to_vec();
        let mut buf = msg.clone();
        block.encrypt(&mut buf).unwrap();
        assert_eq!(buf.len(), msg.len() + OVERHEAD);
        block.decrypt(&mut buf).unwrap();
        assert_eq!(buf, msg);
    }

    #[test]
    fn single_bit_flip_fails_auth() {
        let block = Aes256Block::new(&[0u8; 32]);
        let mut buf = b"integrity matters".to_vec();
        block.encrypt(&mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(block.decrypt(&mut buf).is_err());
    }

    #[test]
    fn wrong_key_fails_auth() {
        let sealer = Aes256Block::new(&[0u8; 32]);
        let opener = Aes256Block::new(&[1u8; 32]);
        let mut buf = b"shared key required".to_vec();
        sealer.encrypt(&mut buf).unwrap();
        assert!(opener.decrypt(&mut buf).is_err());
    }
}
