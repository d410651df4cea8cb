pub mod peer;
pub mod queue;
pub mod tcp_listener;
pub mod tcp_transport;

use crate::network::tcp_transport::TcpTransport;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Byte-stream transport carrying length-prefixed frames.
///
/// The handshake logic on both sides is written against this trait rather
/// than the TCP type, so another reliable stream transport can slot in
/// without touching the protocol code. TCP is the only implementation today.
#[async_trait]
pub trait Connection: Send {
    /// Read one raw byte off the stream (the handshake `enc_flag`).
    async fn read_byte(&mut self) -> crate::Result<u8>;

    async fn write_byte(&mut self, b: u8) -> crate::Result<()>;

    /// Read one complete frame payload.
    async fn read_frame(&mut self) -> crate::Result<Vec<u8>>;

    /// Frame a payload and write it out.
    async fn write_frame(&mut self, payload: &[u8]) -> crate::Result<()>;

    async fn close(&mut self);

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Dial attempts give up after this long.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake completion budget on both sides.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive emission interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// A connection with no inbound frames for this long is considered dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for flushing in-flight frames while draining.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Outbound FIFO capacity per peer, in frames.
pub const OUTBOUND_QUEUE_CAP: usize = 1024;

/// Consecutive protocol errors tolerated on one connection before it closes.
pub const PROTOCOL_ERROR_LIMIT: u32 = 32;

/// Dial a hub with the standard connect timeout.
pub async fn dial(server_addr: &str) -> crate::Result<TcpTransport> {
    match timeout(DIAL_TIMEOUT, TcpStream::connect(server_addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(TcpTransport::new(stream))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err("connection timeout".into()),
    }
}
