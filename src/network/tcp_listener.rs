//! TCP acceptor with transient-error backoff.

use crate::network::tcp_transport::TcpTransport;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Accept loop front-end for the hub's listening socket.
///
/// Transient accept failures (connection aborted/reset, would-block storms
/// from fd exhaustion) retry with backoff starting at 1s and doubling to 64s
/// before giving up; anything else is fatal.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub async fn bind(addr: &str) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("listening on {}", addr);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> crate::Result<TcpTransport> {
        let mut backoff = 1u64;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => {
                    let _ = socket.set_nodelay(true);
                    return Ok(TcpTransport::new(socket));
                }
                Err(err) => match err.kind() {
                    ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionReset
                    | ErrorKind::WouldBlock => {
                        if backoff > 64 {
                            tracing::error!("accept retry exhausted: {}", err);
                            return Err(err.into());
                        }
                        tracing::warn!("accept failed, retrying in {}s: {}", backoff, err);
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        backoff *= 2;
                    }
                    _ => {
                        tracing::error!("fatal accept error: {}", err);
                        return Err(err.into());
                    }
                },
            }
        }
    }
}
