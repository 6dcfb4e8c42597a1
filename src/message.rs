//! WebSocket message types and close codes as defined in RFC 6455.

use crate::error::{Error, Result};
use crate::protocol::{Frame, MAX_CONTROL_FRAME_PAYLOAD, OpCode};

/// WebSocket close status code per RFC 6455 Section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum CloseCode {
    /// Normal closure (1000).
    #[default]
    Normal,
    /// Going away (1001).
    GoingAway,
    /// Protocol error (1002).
    ProtocolError,
    /// Unsupported data (1003).
    UnsupportedData,
    /// Invalid payload (1007).
    InvalidPayload,
    /// Policy violation (1008).
    PolicyViolation,
    /// Message too big (1009).
    MessageTooBig,
    /// Internal error (1011).
    InternalError,
    /// Any other code.
    Other(u16),
}

impl CloseCode {
    /// Create a `CloseCode` from its numeric value.
    #[must_use]
    pub const fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }

    /// Get the numeric value of this close code.
    #[must_use]
    pub const fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => *code,
        }
    }

    /// Check if this close code is reserved and MUST NOT be sent in a Close frame.
    ///
    /// Reserved codes per RFC 6455 Section 7.4.1: 1004, 1005, 1006, 1015.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self.as_u16(), 1004..=1006 | 1015)
    }
}

/// Close frame containing status code and optional reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// The close status code.
    pub code: CloseCode,
    /// Human-readable reason for closing (UTF-8, max 123 bytes).
    pub reason: String,
}

impl CloseFrame {
    /// Create a new close frame with the given code and reason.
    #[must_use]
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Encode into a close frame payload.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCloseCode` for reserved codes
    /// - `Error::ControlFrameTooLarge` if the reason does not fit
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.code.is_reserved() {
            return Err(Error::InvalidCloseCode(self.code.as_u16()));
        }
        let mut payload = self.code.as_u16().to_be_bytes().to_vec();
        payload.extend_from_slice(self.reason.as_bytes());
        if payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::ControlFrameTooLarge(payload.len()));
        }
        Ok(payload)
    }

    /// Decode a received close payload.
    ///
    /// An empty payload carries no status. A one-byte payload or a non-UTF-8
    /// reason are mapped to protocol / payload errors the way the peer
    /// should be answered.
    #[must_use]
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match payload.len() {
            0 => None,
            1 => Some(CloseFrame::new(
                CloseCode::ProtocolError,
                "Invalid close frame",
            )),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                match std::str::from_utf8(&payload[2..]) {
                    Ok(reason) => Some(CloseFrame::new(CloseCode::from_u16(code), reason)),
                    Err(_) => Some(CloseFrame::new(CloseCode::InvalidPayload, "")),
                }
            }
        }
    }
}

/// WebSocket message types.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Message {
    /// A text message (UTF-8 encoded).
    Text(String),
    /// A binary message (arbitrary bytes).
    Binary(Vec<u8>),
    /// A ping frame (control frame, payload <= 125 bytes).
    Ping(Vec<u8>),
    /// A pong frame (control frame, payload <= 125 bytes).
    Pong(Vec<u8>),
    /// A close frame (control frame, may include status code and reason).
    Close(Option<CloseFrame>),
}

impl Message {
    /// Create a text message.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(s.into())
    }

    /// Create a binary message.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Message::Binary(data.into())
    }

    /// Opcode of the frame carrying this message.
    #[must_use]
    pub const fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
            Message::Ping(_) => OpCode::Ping,
            Message::Pong(_) => OpCode::Pong,
            Message::Close(_) => OpCode::Close,
        }
    }

    /// Returns `true` if this is a control message (ping, pong, or close).
    #[must_use]
    pub const fn is_control(&self) -> bool {
        self.opcode().is_control()
    }

    /// Borrow the text content, if this is a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a received, already validated frame into a message.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidUtf8` for a text frame with invalid UTF-8
    /// - `Error::ProtocolViolation` for any fragment (FIN clear, or a
    ///   continuation frame); messages are not reassembled
    pub fn from_frame(frame: Frame) -> Result<Self> {
        if !frame.fin {
            return Err(Error::ProtocolViolation(
                "fragmented messages are not supported".into(),
            ));
        }
        match frame.opcode {
            OpCode::Text => String::from_utf8(frame.into_payload())
                .map(Message::Text)
                .map_err(|_| Error::InvalidUtf8),
            OpCode::Binary => Ok(Message::Binary(frame.into_payload())),
            OpCode::Ping => Ok(Message::Ping(frame.into_payload())),
            OpCode::Pong => Ok(Message::Pong(frame.into_payload())),
            OpCode::Close => Ok(Message::Close(CloseFrame::decode(frame.payload()))),
            OpCode::Continuation => Err(Error::ProtocolViolation(
                "fragmented messages are not supported".into(),
            )),
        }
    }
}
