pub mod client;
pub mod codec;
pub mod control;
pub mod crypto;
pub mod http;
pub mod hub;
pub mod identity;
pub mod intent;
pub mod netdev;
pub mod network;
pub mod observe;
pub mod topology;
pub mod util;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
