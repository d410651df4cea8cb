//! TCP stream transport carrying length-prefixed frames.
//!
//! The transport deals in raw frame payloads; sealing and discriminator
//! dispatch happen a layer up in [`crate::codec::parser::Parser`] because the
//! cipher is only chosen after the handshake's `enc_flag` byte.

use crate::codec::errors::FrameError;
use crate::codec::frame::LEN_PREFIX;
use crate::codec::parser::Parser;
use crate::network::Connection;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const READ_BUFFER_CAP: usize = 4096;

/// Whole-socket transport used for the handshake phase.
pub struct TcpTransport {
    socket: TcpStream,
    input_stream: BytesMut,
}

impl TcpTransport {
    pub fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            input_stream: BytesMut::with_capacity(READ_BUFFER_CAP),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Read one raw byte off the stream (the handshake `enc_flag`).
    pub async fn read_byte(&mut self) -> crate::Result<u8> {
        loop {
            if !self.input_stream.is_empty() {
                let b = self.input_stream[0];
                self.input_stream.advance(1);
                return Ok(b);
            }
            if 0 == self.socket.read_buf(&mut self.input_stream).await? {
                return Err("EOF".into());
            }
        }
    }

    pub async fn write_byte(&mut self, b: u8) -> crate::Result<()> {
        self.socket.write_all(&[b]).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Read one complete frame payload.
    pub async fn read_frame(&mut self) -> crate::Result<Vec<u8>> {
        loop {
            if let Some((payload, consumed)) = Parser::try_decode_frame(&self.input_stream)? {
                self.input_stream.advance(consumed);
                return Ok(payload);
            }

            if 0 == self.socket.read_buf(&mut self.input_stream).await? {
                return if self.input_stream.is_empty() {
                    Err("EOF".into())
                } else {
                    Err("connection reset by peer".into())
                };
            }
        }
    }

    /// Frame a payload and write it out.
    pub async fn write_frame(&mut self, payload: &[u8]) -> crate::Result<()> {
        let buf = Parser::encode_frame(payload)?;
        self.write_raw(&buf).await
    }

    /// Write bytes that already carry their length prefix.
    pub async fn write_raw(&mut self, buf: &[u8]) -> crate::Result<()> {
        self.socket.write_all(buf).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Split into independently-owned read and write halves so the inbound
    /// reader and outbound writer can run as separate tasks. Bytes already
    /// buffered from the handshake phase carry over to the reader.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.socket.into_split();
        (
            FrameReader {
                half: read_half,
                input_stream: self.input_stream,
            },
            FrameWriter { half: write_half },
        )
    }

    pub async fn close(&mut self) {
        let _ = self.socket.shutdown().await;
    }
}

#[async_trait]
impl Connection for TcpTransport {
    async fn read_byte(&mut self) -> crate::Result<u8> {
        TcpTransport::read_byte(self).await
    }

    async fn write_byte(&mut self, b: u8) -> crate::Result<()> {
        TcpTransport::write_byte(self, b).await
    }

    async fn read_frame(&mut self) -> crate::Result<Vec<u8>> {
        TcpTransport::read_frame(self).await
    }

    async fn write_frame(&mut self, payload: &[u8]) -> crate::Result<()> {
        TcpTransport::write_frame(self, payload).await
    }

    async fn close(&mut self) {
        TcpTransport::close(self).await
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpTransport::peer_addr(self)
    }
}

pub struct FrameReader {
    half: OwnedReadHalf,
    input_stream: BytesMut,
}

impl FrameReader {
    /// Read one complete frame payload.
    ///
    /// An oversize length prefix is a protocol error, not a desync: the
    /// offending frame body is discarded off the stream before the error
    /// returns, so the caller can count it and keep reading.
    pub async fn read_frame(&mut self) -> crate::Result<Vec<u8>> {
        loop {
            match Parser::try_decode_frame(&self.input_stream) {
                Ok(Some((payload, consumed))) => {
                    self.input_stream.advance(consumed);
                    return Ok(payload);
                }
                Ok(None) => {}
                Err(e) => {
                    let skip = match e.downcast_ref::<FrameError>() {
                        Some(FrameError::Oversize(len)) => Some(LEN_PREFIX + *len),
                        _ => None,
                    };
                    if let Some(total) = skip {
                        discard_bytes(&mut self.half, &mut self.input_stream, total).await?;
                    }
                    return Err(e);
                }
            }

            if 0 == self.half.read_buf(&mut self.input_stream).await? {
                return if self.input_stream.is_empty() {
                    Err("EOF".into())
                } else {
                    Err("connection reset by peer".into())
                };
            }
        }
    }
}

async fn discard_bytes(
    half: &mut OwnedReadHalf,
    input_stream: &mut BytesMut,
    mut remaining: usize,
) -> crate::Result<()> {
    loop {
        let have = input_stream.len().min(remaining);
        input_stream.advance(have);
        remaining -= have;
        if remaining == 0 {
            return Ok(());
        }
        if 0 == half.read_buf(input_stream).await? {
            return Err("EOF while discarding oversize frame".into());
        }
    }
}

pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, payload: &[u8]) -> crate::Result<()> {
        let buf = Parser::encode_frame(payload)?;
        self.write_raw(&buf).await
    }

    /// Write bytes that already carry their length prefix (the marshal path
    /// produces framed buffers directly).
    pub async fn write_raw(&mut self, buf: &[u8]) -> crate::Result<()> {
        self.half.write_all(buf).await?;
        self.half.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = self.half.shutdown().await;
    }
}
