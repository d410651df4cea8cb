//! Stable per-process node identity.

use serde::Serialize;

/// Who this daemon is on the mesh. Built once at startup from host info and
/// configuration; never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct NodeIdentity {
    pub name: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    /// Best-effort public endpoint, when discovery succeeded.
    pub public_addr: Option<String>,
}

impl NodeIdentity {
    pub fn new(name: String, public_addr: Option<String>) -> Self {
        Self {
            name,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            public_addr,
        }
    }
}
