//! Tunnel payload encryption.
//!
//! The wire protocol runs every post-handshake frame through a cipher block.
//! Production tunnels use AES-256-GCM with a per-message random nonce; the
//! plaintext block exists for development setups where the dialer sent
//! `enc_flag = 0`. Both ends must hold the same 32-byte key.

pub mod aes256;
pub mod plain;

use crate::crypto::aes256::Aes256Block;
use crate::crypto::plain::PlainBlock;
use base64::Engine;
use std::path::Path;
use std::sync::Arc;

/// Core encryption/decryption trait.
///
/// Implementations transform the buffer in place and are `Send + Sync` so a
/// single block can be shared across every connection task.
pub trait Block: Send + Sync {
    fn encrypt(&self, data: &mut Vec<u8>) -> crate::Result<()>;
    fn decrypt(&self, data: &mut Vec<u8>) -> crate::Result<()>;
}

/// Shared handle to a cipher block.
pub type SharedBlock = Arc<Box<dyn Block>>;

pub fn aes_block(key: &[u8; 32]) -> SharedBlock {
    Arc::new(Box::new(Aes256Block::new(key)))
}

pub fn plain_block() -> SharedBlock {
    Arc::new(Box::new(PlainBlock::new()))
}

/// Load the shared 32-byte key from a base64-encoded key file.
pub fn load_key(path: &Path) -> crate::Result<[u8; 32]> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("read key file {}: {}", path.display(), e))?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|e| format!("key file {} is not valid base64: {}", path.display(), e))?;
    if raw.len() != 32 {
        return Err(format!(
            "key file {} decodes to {} bytes, expected 32",
            path.display(),
            raw.len()
        )
        .into());
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw);
    Ok(key)
}
