//! Wire framing and the producer/consumer-side channel handle.
//!
//! Framing is universal across all three [`ChannelPattern`]s:
//!
//! ```text
//! data frame:    ['A', <raw bytes>]              (2 ZMQ frames)
//! control frame: ['C', <type str>, <body>]        (3 ZMQ frames, +identity on ROUTER)
//! ```

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const FRAME_DATA: &[u8] = b"A";
pub const FRAME_CONTROL: &[u8] = b"C";

/// ZMQ socket pattern for the producer-consumer data channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelPattern {
    /// Producer XPUB (binds), consumers SUB (connect) — one-to-many streaming.
    PubSub,
    /// Producer PUSH (binds), consumers PULL (connect) — load-balanced pipeline.
    Pipeline,
    /// Producer ROUTER (binds), consumer DEALER (connect) — full bidirectional.
    Bidir,
}

impl ChannelPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelPattern::PubSub => "pubsub",
            ChannelPattern::Pipeline => "pipeline",
            ChannelPattern::Bidir => "bidir",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pubsub" => Some(ChannelPattern::PubSub),
            "pipeline" => Some(ChannelPattern::Pipeline),
            "bidir" => Some(ChannelPattern::Bidir),
            _ => None,
        }
    }
}

/// Send a data frame (`['A', data]`) on `socket`.
pub fn send_data(socket: &zmq::Socket, data: &[u8]) -> HubResult<()> {
    socket.send(FRAME_DATA, zmq::SNDMORE)?;
    socket.send(data, 0)?;
    Ok(())
}

/// Send `[identity, 'A', data]` on a ROUTER socket.
pub fn send_data_to(socket: &zmq::Socket, identity: &[u8], data: &[u8]) -> HubResult<()> {
    socket.send(identity, zmq::SNDMORE)?;
    socket.send(FRAME_DATA, zmq::SNDMORE)?;
    socket.send(data, 0)?;
    Ok(())
}

/// Receive a data frame, discarding a leading identity frame if the socket
/// is a ROUTER (multipart messages longer than 2 frames).
pub fn recv_data(socket: &zmq::Socket, timeout: Duration) -> HubResult<Option<(Vec<u8>, Option<Vec<u8>>)>> {
    if !poll_readable(socket, timeout)? {
        return Ok(None);
    }
    let parts = socket.recv_multipart(0)?;
    match parts.len() {
        2 if parts[0] == FRAME_DATA => Ok(Some((parts[1].clone(), None))),
        3 if parts[1] == FRAME_DATA => Ok(Some((parts[2].clone(), Some(parts[0].clone())))),
        _ => Err(HubError::Protocol("malformed data frame".into())),
    }
}

/// Send a control frame: `['C', type, body]`, or `[identity, 'C', type, body]`
/// when `identity` is provided (ROUTER).
pub fn send_ctrl(socket: &zmq::Socket, frame_type: &str, body: &[u8], identity: Option<&[u8]>) -> HubResult<()> {
    if let Some(id) = identity {
        socket.send(id, zmq::SNDMORE)?;
    }
    socket.send(FRAME_CONTROL, zmq::SNDMORE)?;
    socket.send(frame_type.as_bytes(), zmq::SNDMORE)?;
    socket.send(body, 0)?;
    Ok(())
}

/// A received control frame.
pub struct CtrlMessage {
    pub frame_type: String,
    pub body: Vec<u8>,
    pub identity: Option<Vec<u8>>,
}

pub fn recv_ctrl(socket: &zmq::Socket, timeout: Duration) -> HubResult<Option<CtrlMessage>> {
    if !poll_readable(socket, timeout)? {
        return Ok(None);
    }
    let parts = socket.recv_multipart(0)?;
    match parts.len() {
        3 if parts[0] == FRAME_CONTROL => Ok(Some(CtrlMessage {
            frame_type: String::from_utf8_lossy(&parts[1]).into_owned(),
            body: parts[2].clone(),
            identity: None,
        })),
        4 if parts[1] == FRAME_CONTROL => Ok(Some(CtrlMessage {
            frame_type: String::from_utf8_lossy(&parts[2]).into_owned(),
            body: parts[3].clone(),
            identity: Some(parts[0].clone()),
        })),
        _ => Err(HubError::Protocol("malformed control frame".into())),
    }
}

fn poll_readable(socket: &zmq::Socket, timeout: Duration) -> HubResult<bool> {
    let mut items = [socket.as_poll_item(zmq::POLLIN)];
    let n = zmq::poll(&mut items, timeout.as_millis() as i64)?;
    Ok(n > 0 && items[0].is_readable())
}

/// Describes the producer side of a channel, as published to the broker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub shm_name: String,
    pub producer_pid: u64,
    pub schema_hash: String,
    pub schema_version: u32,
    pub has_shared_memory: bool,
    pub pattern: ChannelPattern,
    pub zmq_ctrl_endpoint: String,
    pub zmq_data_endpoint: String,
    pub zmq_pubkey: String,
}

/// What a consumer learns about a channel from `DISC_ACK`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub shm_name: String,
    pub schema_hash: String,
    pub schema_version: u32,
    pub has_shared_memory: bool,
    pub pattern: ChannelPattern,
    pub zmq_ctrl_endpoint: String,
    pub zmq_data_endpoint: String,
    pub zmq_pubkey: String,
    pub consumer_count: u32,
}

/// Producer or consumer side of a single channel's P2C sockets, plus an
/// optional DataBlock attachment for bulk shared-memory data.
///
/// Single-threaded by construction: the sockets live in whichever thread
/// created them (mirroring the teacher's rule that a ZMQ socket must stay
/// on the thread that opened it).
pub struct ChannelHandle {
    channel_name: String,
    pattern: ChannelPattern,
    shm_name: Option<String>,
    ctrl_socket: zmq::Socket,
    data_socket: Option<zmq::Socket>,
    valid: bool,
}

impl ChannelHandle {
    pub(crate) fn new(
        channel_name: String,
        pattern: ChannelPattern,
        shm_name: Option<String>,
        ctrl_socket: zmq::Socket,
        data_socket: Option<zmq::Socket>,
    ) -> Self {
        Self { channel_name, pattern, shm_name, ctrl_socket, data_socket, valid: true }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn pattern(&self) -> ChannelPattern {
        self.pattern
    }

    pub fn has_shm(&self) -> bool {
        self.shm_name.is_some()
    }

    pub fn shm_name(&self) -> Option<&str> {
        self.shm_name.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Called by the Messenger worker when `CHANNEL_CLOSING_NOTIFY` arrives
    /// for this channel.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Broadcast/push/send raw bytes on the data socket (PubSub/Pipeline),
    /// or on the ctrl ROUTER/DEALER socket addressed to `identity` (Bidir).
    pub fn send(&self, data: &[u8], identity: Option<&[u8]>) -> HubResult<()> {
        match (self.pattern, &self.data_socket, identity) {
            (ChannelPattern::Bidir, _, Some(id)) => send_data_to(&self.ctrl_socket, id, data),
            (ChannelPattern::Bidir, _, None) => send_data(&self.ctrl_socket, data),
            (_, Some(sock), _) => send_data(sock, data),
            (_, None, _) => Err(HubError::Protocol("no data socket on this handle".into())),
        }
    }

    pub fn recv(&self, timeout: Duration) -> HubResult<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        match (self.pattern, &self.data_socket) {
            (ChannelPattern::Bidir, _) => recv_data(&self.ctrl_socket, timeout),
            (_, Some(sock)) => recv_data(sock, timeout),
            (_, None) => Err(HubError::Protocol("no data socket on this handle".into())),
        }
    }

    pub fn send_ctrl(&self, frame_type: &str, body: &[u8], identity: Option<&[u8]>) -> HubResult<()> {
        send_ctrl(&self.ctrl_socket, frame_type, body, identity)
    }

    pub fn recv_ctrl(&self, timeout: Duration) -> HubResult<Option<CtrlMessage>> {
        recv_ctrl(&self.ctrl_socket, timeout)
    }

    pub(crate) fn ctrl_socket(&self) -> &zmq::Socket {
        &self.ctrl_socket
    }

    pub(crate) fn data_socket(&self) -> Option<&zmq::Socket> {
        self.data_socket.as_ref()
    }

    /// Consume the handle and hand back its raw sockets plus identifying
    /// metadata. `Producer`/`Consumer` use this to split a handle across the
    /// peer/ctrl thread (gets `ctrl_socket`) and the write/shm thread (gets
    /// `data_socket`), since each ZMQ socket must be pinned to one thread.
    pub(crate) fn split(self) -> (String, ChannelPattern, Option<String>, zmq::Socket, Option<zmq::Socket>) {
        (self.channel_name, self.pattern, self.shm_name, self.ctrl_socket, self.data_socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_round_trips_through_str() {
        for p in [ChannelPattern::PubSub, ChannelPattern::Pipeline, ChannelPattern::Bidir] {
            assert_eq!(ChannelPattern::from_str_opt(p.as_str()), Some(p));
        }
    }

    #[test]
    fn unknown_pattern_string_is_none() {
        assert_eq!(ChannelPattern::from_str_opt("nonsense"), None);
    }
}
