//! Framed message envelope shared by the board link and the client sockets.
//!
//! Every frame is a fixed 9-byte header followed by exactly `length` payload
//! bytes:
//!
//! ```text
//! +--------+----------------+----------------+-------------------+
//! | type   | correlation    | length         | payload           |
//! | u8     | u32 (BE)       | u32 (BE)       | `length` bytes    |
//! +--------+----------------+----------------+-------------------+
//! ```
//!
//! Payload contents are JSON documents described in [`crate::payload`].

use std::collections::HashSet;

use arrayvec::ArrayVec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 9;
const_assert_eq!(HEADER_LEN, 1 + 4 + 4);

/// Largest payload accepted when no explicit limit is configured.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Correlation id carried by unsolicited messages (board telemetry, forwarded telemetry).
pub const NO_CORRELATION: u32 = 0;

/// Highest client protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 1;

pub type HeaderBuffer = ArrayVec<u8, HEADER_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    BoardTelemetry = 1,
    BoardCommand = 2,
    ClientQuery = 3,
    ClientResponse = 4,
    ClientSubscribe = 5,
    Heartbeat = 6,
    Error = 7,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::BoardTelemetry,
        MessageType::BoardCommand,
        MessageType::ClientQuery,
        MessageType::ClientResponse,
        MessageType::ClientSubscribe,
        MessageType::Heartbeat,
        MessageType::Error,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<MessageType> {
        MessageType::ALL.iter().copied().find(|t| t.tag() == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("stream ended mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },
    #[error("unknown message type tag {0:#04x}")]
    UnknownType(u8),
    #[error("{0:?} messages are not served on this channel")]
    UnexpectedType(MessageType),
    #[error("invalid payload: {0}")]
    BadPayload(String),
}

impl ProtocolError {
    /// Whether the channel that produced this error has to be closed.
    ///
    /// Only `Truncated` is recoverable: more bytes may complete the frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Truncated { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub correlation: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, correlation: u32, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            correlation,
            payload,
        }
    }

    /// Builds a message whose payload is the JSON encoding of `body`.
    pub fn json<T: Serialize>(
        message_type: MessageType,
        correlation: u32,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ProtocolError::BadPayload(e.to_string()))?;
        Ok(Self::new(message_type, correlation, payload))
    }

    pub fn heartbeat(correlation: u32) -> Self {
        Self::new(MessageType::Heartbeat, correlation, Vec::new())
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::BadPayload(e.to_string()))
    }

    /// Payload length as written in the header.
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_unsolicited(&self) -> bool {
        self.correlation == NO_CORRELATION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub correlation: u32,
    pub length: u32,
}

impl FrameHeader {
    /// Parses the first [`HEADER_LEN`] bytes of `bytes`.
    ///
    /// The caller guarantees at least `HEADER_LEN` bytes are present.
    pub fn parse(bytes: &[u8], max_frame_size: usize) -> Result<Self, ProtocolError> {
        debug_assert!(bytes.len() >= HEADER_LEN, "header parse needs {HEADER_LEN} bytes");

        let message_type =
            MessageType::from_tag(bytes[0]).ok_or(ProtocolError::UnknownType(bytes[0]))?;
        let correlation = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let length = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);

        if length as usize > max_frame_size {
            return Err(ProtocolError::Malformed(format!(
                "declared length {length} exceeds maximum frame size {max_frame_size}"
            )));
        }

        Ok(Self {
            message_type,
            correlation,
            length,
        })
    }

    pub fn encode(&self) -> HeaderBuffer {
        let mut header = HeaderBuffer::new();
        header.push(self.message_type.tag());
        for byte in self
            .correlation
            .to_be_bytes()
            .into_iter()
            .chain(self.length.to_be_bytes())
        {
            header.push(byte);
        }
        header
    }
}

pub fn encode(message: &Message) -> Vec<u8> {
    debug_assert!(
        message.payload.len() <= u32::MAX as usize,
        "payload of {} bytes cannot be framed",
        message.payload.len()
    );

    let header = FrameHeader {
        message_type: message.message_type,
        correlation: message.correlation,
        length: message.length(),
    }
    .encode();

    let mut out = Vec::with_capacity(HEADER_LEN + message.payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&message.payload);
    out
}

/// Decodes exactly one frame occupying the whole of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    decode_with_limit(bytes, DEFAULT_MAX_FRAME_SIZE)
}

pub fn decode_with_limit(bytes: &[u8], max_frame_size: usize) -> Result<Message, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            buffered: bytes.len(),
        });
    }

    let header = FrameHeader::parse(bytes, max_frame_size)?;
    let total = HEADER_LEN + header.length as usize;

    if bytes.len() < total {
        return Err(ProtocolError::Truncated {
            buffered: bytes.len(),
        });
    }
    if bytes.len() > total {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes after frame",
            bytes.len() - total
        )));
    }

    Ok(Message::new(
        header.message_type,
        header.correlation,
        bytes[HEADER_LEN..total].to_vec(),
    ))
}

/// Incremental decoder holding the partial-frame state of one connection.
///
/// Bytes are handed over with [`feed`](Self::feed) as they arrive; complete
/// frames are pulled out with [`next_message`](Self::next_message) or the
/// [`frames`](Self::frames) iterator. Neither ever blocks: when the buffered
/// bytes do not form a full frame they simply yield nothing, and iteration can
/// resume after the next `feed`.
///
/// `Malformed` and `UnknownType` poison the decoder; every later call reports
/// the same error.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
    failed: Option<ProtocolError>,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
            failed: None,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        if self.failed.is_none() {
            self.buffer.extend_from_slice(bytes);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.failed.is_some()
    }

    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = match FrameHeader::parse(&self.buffer, self.max_frame_size) {
            Ok(header) => header,
            Err(err) => {
                self.failed = Some(err.clone());
                self.buffer.clear();
                return Err(err);
            }
        };

        let total = HEADER_LEN + header.length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_LEN..total].to_vec();
        self.buffer.drain(..total);

        Ok(Some(Message::new(
            header.message_type,
            header.correlation,
            payload,
        )))
    }

    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            done: false,
        }
    }

    /// Called when the underlying stream reached EOF.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Truncated {
                buffered: self.buffer.len(),
            })
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.failed = None;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Lazy sequence of the frames currently assembled in a [`FrameDecoder`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Message, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Correlation id allocator for one connection.
///
/// Ids are never [`NO_CORRELATION`] and never collide with a request that is
/// still in flight.
#[derive(Debug, Default)]
pub struct CorrelationIds {
    last: u32,
    in_flight: HashSet<u32>,
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id and tracks it until [`complete`](Self::complete).
    pub fn allocate(&mut self) -> u32 {
        let id = self.issue();
        self.in_flight.insert(id);
        id
    }

    /// Allocates an id for a message that never gets a response.
    pub fn issue(&mut self) -> u32 {
        loop {
            self.last = self.last.wrapping_add(1);
            if self.last != NO_CORRELATION && !self.in_flight.contains(&self.last) {
                return self.last;
            }
        }
    }

    pub fn complete(&mut self, id: u32) -> bool {
        self.in_flight.remove(&id)
    }

    pub fn is_in_flight(&self, id: u32) -> bool {
        self.in_flight.contains(&id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Per-kind message handling. The implementor is the registrar for its
/// channel: kinds it does not override are rejected as `UnexpectedType`.
pub trait MessageHandler {
    fn on_board_telemetry(&mut self, message: &Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnexpectedType(message.message_type))
    }

    fn on_board_command(&mut self, message: &Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnexpectedType(message.message_type))
    }

    fn on_client_query(&mut self, message: &Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnexpectedType(message.message_type))
    }

    fn on_client_response(&mut self, message: &Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnexpectedType(message.message_type))
    }

    fn on_client_subscribe(&mut self, message: &Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnexpectedType(message.message_type))
    }

    fn on_heartbeat(&mut self, message: &Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnexpectedType(message.message_type))
    }

    fn on_error(&mut self, message: &Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnexpectedType(message.message_type))
    }
}

pub fn dispatch<H: MessageHandler + ?Sized>(
    handler: &mut H,
    message: &Message,
) -> Result<(), ProtocolError> {
    match message.message_type {
        MessageType::BoardTelemetry => handler.on_board_telemetry(message),
        MessageType::BoardCommand => handler.on_board_command(message),
        MessageType::ClientQuery => handler.on_client_query(message),
        MessageType::ClientResponse => handler.on_client_response(message),
        MessageType::ClientSubscribe => handler.on_client_subscribe(message),
        MessageType::Heartbeat => handler.on_heartbeat(message),
        MessageType::Error => handler.on_error(message),
    }
}
