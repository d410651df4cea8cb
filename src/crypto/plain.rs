//! Plain (no-op) cipher block for `enc_flag = 0` development tunnels.
//!
//! ⚠️ Provides NO security; frames cross the wire in cleartext. The daemon
//! logs a warning whenever a plaintext tunnel is accepted or dialed.

use crate::crypto::Block;

pub struct PlainBlock {}

impl PlainBlock {
    pub fn new() -> Self {
        Self {}
    }
}

impl Block for PlainBlock {
    fn encrypt(&self, _data: &mut Vec<u8>) -> crate::Result<()> {
        Ok(())
    }

    fn decrypt(&self, _data: &mut Vec<u8>) -> crate::Result<()> {
        Ok(())
    }
}

impl Default for PlainBlock {
    fn default() -> Self {
        Self::new()
    }
}
