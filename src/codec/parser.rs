//! Frame encoder/decoder.
//!
//! Handles the 4-byte big-endian length prefix, discriminator dispatch, and
//! payload sealing/opening through the connection's cipher block. Handshake
//! frames bypass the cipher; see the module docs in [`crate::codec::frame`].

use crate::codec::errors::FrameError;
use crate::codec::frame::*;
use crate::crypto::Block;
use std::net::Ipv4Addr;

pub struct Parser;

impl Parser {
    /// Wrap a payload in the length-prefixed frame form.
    pub fn encode_frame(payload: &[u8]) -> crate::Result<Vec<u8>> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(FrameError::Oversize(payload.len()).into());
        }
        let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// Try to pull one frame payload off the front of a stream buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame,
    /// `Ok(Some((payload, consumed)))` on success, and an error for a length
    /// prefix above the frame limit (a protocol violation, not a short read).
    pub fn try_decode_frame(buf: &[u8]) -> crate::Result<Option<(Vec<u8>, usize)>> {
        if buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversize(len).into());
        }
        let total = LEN_PREFIX + len;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((buf[LEN_PREFIX..total].to_vec(), total)))
    }

    /// Serialize a tunnel message into a sealed, framed byte vector.
    pub fn marshal(msg: TunnelMsg, block: &dyn Block) -> crate::Result<Vec<u8>> {
        let mut plaintext = match msg {
            TunnelMsg::Data(data) => {
                let mut buf = Vec::with_capacity(1 + data.payload.len());
                buf.push(DISC_DATA);
                buf.extend_from_slice(&data.payload);
                buf
            }
            TunnelMsg::KeepAlive => vec![DISC_KEEPALIVE],
            TunnelMsg::TopologyAnnounce(snapshot) => {
                let body = serde_json::to_vec(&snapshot)?;
                let mut buf = Vec::with_capacity(1 + body.len());
                buf.push(DISC_TOPOLOGY_ANNOUNCE);
                buf.extend_from_slice(&body);
                buf
            }
            TunnelMsg::DisconnectIntent(reason) => {
                let mut buf = Vec::with_capacity(1 + reason.len());
                buf.push(DISC_DISCONNECT_INTENT);
                buf.extend_from_slice(reason.as_bytes());
                buf
            }
            TunnelMsg::ReconnectInvite(meta) => {
                let mut buf = vec![DISC_RECONNECT_INVITE];
                if let Some(meta) = meta {
                    buf.extend_from_slice(&serde_json::to_vec(&meta)?);
                }
                buf
            }
            TunnelMsg::LatencyProbe(token) => {
                let mut buf = vec![DISC_LATENCY_PROBE];
                buf.extend_from_slice(&token);
                buf
            }
            TunnelMsg::LatencyEcho(token) => {
                let mut buf = vec![DISC_LATENCY_ECHO];
                buf.extend_from_slice(&token);
                buf
            }
            TunnelMsg::RouteState(route_all) => {
                let body = serde_json::to_vec(&RouteStateMsg { route_all })?;
                let mut buf = vec![DISC_ROUTE_STATE];
                buf.extend_from_slice(&body);
                buf
            }
        };

        block.encrypt(&mut plaintext)?;
        Self::encode_frame(&plaintext)
    }

    /// Open a frame payload and decode the tunnel message inside.
    ///
    /// Returns `Ok(None)` for an unknown discriminator: the frame is dropped
    /// silently so newer peers can speak extensions past this build.
    pub fn unmarshal(payload: Vec<u8>, block: &dyn Block) -> crate::Result<Option<TunnelMsg>> {
        let mut plaintext = payload;
        block
            .decrypt(&mut plaintext)
            .map_err(FrameError::DecryptionFailed)?;

        if plaintext.is_empty() {
            return Err(FrameError::Invalid.into());
        }

        let disc = plaintext[0];
        let body = &plaintext[1..];

        let msg = match disc {
            DISC_DATA => TunnelMsg::Data(DataMsg {
                payload: body.to_vec(),
            }),
            DISC_KEEPALIVE => TunnelMsg::KeepAlive,
            DISC_TOPOLOGY_ANNOUNCE => {
                let snapshot: TopologySnapshot =
                    serde_json::from_slice(body).map_err(|_| FrameError::Invalid)?;
                TunnelMsg::TopologyAnnounce(snapshot)
            }
            DISC_DISCONNECT_INTENT => {
                TunnelMsg::DisconnectIntent(String::from_utf8_lossy(body).into_owned())
            }
            DISC_RECONNECT_INVITE => {
                let meta = if body.is_empty() {
                    None
                } else {
                    Some(serde_json::from_slice(body).map_err(|_| FrameError::Invalid)?)
                };
                TunnelMsg::ReconnectInvite(meta)
            }
            DISC_LATENCY_PROBE => TunnelMsg::LatencyProbe(Self::token(body)?),
            DISC_LATENCY_ECHO => TunnelMsg::LatencyEcho(Self::token(body)?),
            DISC_ROUTE_STATE => {
                let state: RouteStateMsg =
                    serde_json::from_slice(body).map_err(|_| FrameError::Invalid)?;
                TunnelMsg::RouteState(state.route_all)
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    fn token(body: &[u8]) -> crate::Result<[u8; 8]> {
        if body.len() != 8 {
            return Err(FrameError::Invalid.into());
        }
        let mut token = [0u8; 8];
        token.copy_from_slice(body);
        Ok(token)
    }

    /// Serialize the dialer's handshake JSON (plaintext, no discriminator).
    pub fn encode_handshake(req: &HandshakeRequest) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(req)?)
    }

    pub fn decode_handshake(payload: &[u8]) -> crate::Result<HandshakeRequest> {
        serde_json::from_slice(payload).map_err(|_| FrameError::Invalid.into())
    }

    /// Decode the acceptor's assigned-IP reply: an ASCII dotted quad,
    /// 7–15 bytes, not framed with a discriminator.
    pub fn decode_assigned_ip(payload: &[u8]) -> crate::Result<Ipv4Addr> {
        if payload.len() < 7 || payload.len() > 15 {
            return Err(FrameError::Invalid.into());
        }
        std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
            .ok_or_else(|| FrameError::Invalid.into())
    }
}
