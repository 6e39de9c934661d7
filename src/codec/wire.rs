//! The binary wire envelope.
//!
//! Every transport message is one envelope: a fixed header followed by
//! the initialization vector, the call correlation key and the payload.
//! The payload bytes are opaque here; encryption and signature handling
//! live in [super::envelope].
//!
//! Header layout (big endian):
//!
//! ```text
//! +-----+-------+--------+---------+-------------+
//! | tag | flags | iv len | key len | data len u32|
//! +-----+-------+--------+---------+-------------+
//! ```
//!
//! An all-zero header with no trailing bytes is the keep-alive frame.

use bytes::{Buf as _, BufMut as _};

use crate::error::ProtocolError;
use crate::guid::Guid;

/// Discriminates every non-empty wire envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[repr(u8)]
pub enum MessageType {
    CompleteHandshake = 1,
    Auth = 2,
    AuthResponse = 3,
    Rpc = 4,
    RpcResult = 5,
    Invoke = 6,
    Goodbye = 7,
    SessionClosed = 8,
}

impl MessageType {
    fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        Ok(match tag {
            1 => MessageType::CompleteHandshake,
            2 => MessageType::Auth,
            3 => MessageType::AuthResponse,
            4 => MessageType::Rpc,
            5 => MessageType::RpcResult,
            6 => MessageType::Invoke,
            7 => MessageType::Goodbye,
            8 => MessageType::SessionClosed,
            tag => return Err(ProtocolError::UnknownMessageType { tag }),
        })
    }

    /// Wire name, used in traces.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::CompleteHandshake => "complete_handshake",
            MessageType::Auth => "auth",
            MessageType::AuthResponse => "auth_response",
            MessageType::Rpc => "rpc",
            MessageType::RpcResult => "rpc_result",
            MessageType::Invoke => "invoke",
            MessageType::Goodbye => "goodbye",
            MessageType::SessionClosed => "session_closed",
        }
    }

    /// Whether the payload carries a signature wrapper when encryption is
    /// on. These are the server-authored messages whose authenticity the
    /// client must be able to check.
    pub fn requires_signature(self) -> bool {
        matches!(
            self,
            MessageType::CompleteHandshake | MessageType::AuthResponse | MessageType::Invoke
        )
    }
}

const ERROR_MASK: u8 = 0b0000_0001;

/// A parsed wire envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct WireMessage {
    pub message_type: MessageType,
    /// Serialized payload, possibly AES-encrypted.
    #[cfg_attr(
        test,
        proptest(strategy = "proptest::collection::vec(proptest::arbitrary::any::<u8>(), 0..64)")
    )]
    pub data: Vec<u8>,
    /// AES nonce; empty when encryption is off.
    #[cfg_attr(
        test,
        proptest(strategy = "proptest::collection::vec(proptest::arbitrary::any::<u8>(), 0..13)")
    )]
    pub iv: Vec<u8>,
    /// Correlates a request with its result; absent on non-RPC messages.
    pub unique_call_key: Option<Guid>,
    /// The payload is a serialized error.
    pub error: bool,
}

impl WireMessage {
    pub const HEADER_SIZE: usize = 8;

    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            data: Vec::new(),
            iv: Vec::new(),
            unique_call_key: None,
            error: false,
        }
    }

    /// The frame sent to keep an idle session alive.
    pub fn keep_alive_frame() -> Vec<u8> {
        vec![0u8; Self::HEADER_SIZE]
    }

    /// Parse one transport frame. `Ok(None)` is the keep-alive frame.
    pub fn parse(frame: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if frame.is_empty() || frame == &[0u8; Self::HEADER_SIZE][..] {
            return Ok(None);
        }
        if frame.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::MalformedFrame {
                reason: format!("frame of {} bytes is shorter than the header", frame.len()),
            });
        }

        let mut bytes = &frame[..];
        let tag = bytes.get_u8();
        let flags = bytes.get_u8();
        let iv_len = bytes.get_u8() as usize;
        let key_len = bytes.get_u8() as usize;
        let data_len = bytes.get_u32() as usize;

        let message_type = MessageType::from_tag(tag)?;
        if flags & !ERROR_MASK != 0 {
            return Err(ProtocolError::MalformedFrame {
                reason: format!("unknown flag bits {:#010b}", flags),
            });
        }
        let expected = Self::HEADER_SIZE + iv_len + key_len + data_len;
        if frame.len() != expected {
            return Err(ProtocolError::MalformedFrame {
                reason: format!("frame of {} bytes, header declares {}", frame.len(), expected),
            });
        }

        let iv = bytes[..iv_len].to_vec();
        bytes.advance(iv_len);
        let unique_call_key = match key_len {
            0 => None,
            Guid::SIZE => Some(Guid::from_slice(&bytes[..Guid::SIZE]).unwrap()),
            len => {
                return Err(ProtocolError::MalformedFrame {
                    reason: format!("call key of {} bytes", len),
                })
            }
        };
        bytes.advance(key_len);
        let data = bytes[..data_len].to_vec();

        Ok(Some(Self {
            message_type,
            data,
            iv,
            unique_call_key,
            error: flags & ERROR_MASK != 0,
        }))
    }

    pub fn build(&self) -> Vec<u8> {
        let key_len = self.unique_call_key.map_or(0, |_| Guid::SIZE);
        let mut frame =
            Vec::with_capacity(Self::HEADER_SIZE + self.iv.len() + key_len + self.data.len());
        frame.put_u8(self.message_type as u8);
        frame.put_u8(if self.error { ERROR_MASK } else { 0 });
        frame.put_u8(self.iv.len() as u8);
        frame.put_u8(key_len as u8);
        frame.put_u32(self.data.len() as u32);
        frame.extend_from_slice(&self.iv);
        if let Some(key) = &self.unique_call_key {
            frame.extend_from_slice(key.as_bytes());
        }
        frame.extend_from_slice(&self.data);
        frame
    }
}
