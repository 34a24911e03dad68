//! Length-prefixed frame codec.
//!
//! Wire format:
//! ```text
//! ┌────────────┬────────────┬──────────────────────────┐
//! │ Length (1) │ Opcode (1) │ Payload (Length - 1)     │
//! └────────────┴────────────┴──────────────────────────┘
//! ```
//!
//! The length byte counts the opcode plus the payload. Responses carry their
//! status as the first payload byte.

use std::fmt;

use thiserror::Error;

use super::constants::{LENGTH_FIELD_SIZE, MAX_PAYLOAD_SIZE, OPCODE_FIELD_SIZE};
use super::status::Status;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Outbound command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: u8,
    payload: Vec<u8>,
}

impl CommandFrame {
    /// Build a command, rejecting payloads above `max_payload`.
    pub fn new(opcode: u8, payload: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        let max = max_payload.min(MAX_PAYLOAD_SIZE);
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        Ok(Self {
            opcode,
            payload: payload.to_vec(),
        })
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Value of the length prefix.
    pub fn length(&self) -> u8 {
        // Bounded by MAX_PAYLOAD_SIZE in `new`.
        (OPCODE_FIELD_SIZE + self.payload.len()) as u8
    }

    /// Total bytes on the wire.
    pub fn wire_size(&self) -> usize {
        LENGTH_FIELD_SIZE + self.length() as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.push(self.length());
        buf.push(self.opcode);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Encode a command frame into its wire bytes.
pub fn encode(opcode: u8, payload: &[u8], max_payload: usize) -> Result<Vec<u8>, FrameError> {
    Ok(CommandFrame::new(opcode, payload, max_payload)?.to_bytes())
}

/// Inbound frame: a response or an unsolicited notification.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Status byte, if the frame carries one.
    pub fn status(&self) -> Option<Status> {
        self.payload.first().map(|&b| Status::from_byte(b))
    }

    /// Payload after the status byte.
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or(&[])
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(op=0x{:02X}, payload=[", self.opcode)?;
        for (i, b) in self.payload.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, "])")
    }
}

/// Result of attempting to parse one frame from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// More bytes are needed.
    Incomplete,
    /// A complete frame and the number of bytes it occupied.
    Frame(Frame, usize),
    /// The length prefix is inconsistent. The caller discards the given
    /// number of bytes and tries again.
    Malformed(usize),
}

/// Parse one frame from the front of `buf`. Never panics.
pub fn try_parse(buf: &[u8], max_payload: usize) -> ParseResult {
    let Some(&length) = buf.first() else {
        return ParseResult::Incomplete;
    };
    let length = length as usize;

    if length < OPCODE_FIELD_SIZE {
        return ParseResult::Malformed(LENGTH_FIELD_SIZE);
    }
    if length - OPCODE_FIELD_SIZE > max_payload.min(MAX_PAYLOAD_SIZE) {
        return ParseResult::Malformed(LENGTH_FIELD_SIZE);
    }

    let total = LENGTH_FIELD_SIZE + length;
    if buf.len() < total {
        return ParseResult::Incomplete;
    }

    let opcode = buf[LENGTH_FIELD_SIZE];
    let payload = buf[LENGTH_FIELD_SIZE + OPCODE_FIELD_SIZE..total].to_vec();
    ParseResult::Frame(Frame { opcode, payload }, total)
}
