//! Frame parsing and validation errors.

use std::fmt;
use std::fmt::Display;

/// Failure modes when turning raw bytes into tunnel messages.
#[derive(Debug)]
pub enum FrameError {
    /// Buffer ends before a complete frame; more stream data is needed.
    TooShort,

    /// Declared payload length exceeds the 65535-byte frame limit.
    Oversize(usize),

    /// Malformed payload: empty plaintext, bad token length, or a JSON body
    /// that does not match its discriminator's schema.
    Invalid,

    /// AEAD open failed: tampered frame, wrong key, or truncated ciphertext.
    DecryptionFailed(crate::Error),
}

impl std::error::Error for FrameError {}

impl Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::TooShort => "stream ended early".fmt(fmt),
            FrameError::Oversize(n) => write!(fmt, "frame length {} exceeds limit", n),
            FrameError::Invalid => "invalid frame".fmt(fmt),
            FrameError::DecryptionFailed(e) => write!(fmt, "decryption failed: {}", e),
        }
    }
}
