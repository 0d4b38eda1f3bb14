//! Wire and IPC message codec.
//!
//! All messages share a little-endian layout with a `u32` message counter id
//! as the first field. Display-class messages follow the id with a fixed
//! 8-byte header: a `u16` kind/flags field, a `u16` payload-kind field, and a
//! 4-byte union holding a boolean, an `i32`, an `f32`, or a string length.
//! String payloads append the UTF-8 bytes plus a trailing NUL that is not
//! counted in the length field.
//!
//! The VM host sends the same display layout over IPC with a zero id; the
//! agent overwrites the id before republishing. Decoding never overlays
//! memory onto untrusted bytes — every field is bounds-checked.

use thiserror::Error;

/// Display kind discriminators (low bits of the kind/flags field).
const KIND_OUTPUT: u16 = 0;
const KIND_ERROR: u16 = 1;
const KIND_RESULT: u16 = 2;
const KIND_PROMPT: u16 = 3;
const KIND_PROMPT_RESPONSE: u16 = 4;
/// A flush record (or a content-free flush marker from the VM host).
const KIND_FLUSH: u16 = 100;

/// Kind/flags bit: the message closes its own run.
const FLAG_SELF_FLUSHING: u16 = 0x8000;
const KIND_MASK: u16 = !FLAG_SELF_FLUSHING;

/// Payload kind discriminators (shared with the browser client).
const PAYLOAD_BOOLEAN: u16 = 3;
const PAYLOAD_I32: u16 = 4;
const PAYLOAD_F32: u16 = 5;
const PAYLOAD_STRING: u16 = 6;

/// Monitor sub-kind for a telemetry line (flush reuses `KIND_FLUSH`).
const MONITOR_LINE: u16 = 0;

/// Recoverable decode failure: the offending message is logged and dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unknown display kind {0}")]
    UnknownKind(u16),
    #[error("unknown payload kind {0}")]
    UnknownPayload(u16),
    #[error("string length {len} exceeds remaining {avail} bytes")]
    BadStringLength { len: usize, avail: usize },
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Device status as carried in status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Idle,
    Running,
}

impl DeviceStatus {
    fn wire(self) -> u16 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
        }
    }
}

/// Sub-kind of a value-bearing display message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    Output,
    Error,
    Result,
    Prompt,
    PromptResponse,
}

impl DisplayKind {
    fn wire(self) -> u16 {
        match self {
            Self::Output => KIND_OUTPUT,
            Self::Error => KIND_ERROR,
            Self::Result => KIND_RESULT,
            Self::Prompt => KIND_PROMPT,
            Self::PromptResponse => KIND_PROMPT_RESPONSE,
        }
    }

    fn from_wire(kind: u16) -> Result<Self, DecodeError> {
        match kind {
            KIND_OUTPUT => Ok(Self::Output),
            KIND_ERROR => Ok(Self::Error),
            KIND_RESULT => Ok(Self::Result),
            KIND_PROMPT => Ok(Self::Prompt),
            KIND_PROMPT_RESPONSE => Ok(Self::PromptResponse),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// Value payload of a display message.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayValue {
    Boolean(bool),
    Int(i32),
    Float(f32),
    Text(String),
}

/// A value-bearing display message as produced by the VM host.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMessage {
    pub kind: DisplayKind,
    pub self_flushing: bool,
    pub value: DisplayValue,
}

/// A message received from the VM host over the IPC channel.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
    Display(DisplayMessage),
    /// Content-free marker asking the agent to close the current run.
    FlushMarker,
}

/// Outbound topic class; the reactor maps this to the configured topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutTopic {
    Hello,
    Status,
    Display,
    Monitor,
}

/// An encoded outbound message ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: OutTopic,
    pub payload: Vec<u8>,
}

fn push_value(buf: &mut Vec<u8>, value: &DisplayValue) {
    match value {
        DisplayValue::Boolean(b) => {
            buf.extend_from_slice(&PAYLOAD_BOOLEAN.to_le_bytes());
            buf.extend_from_slice(&u32::from(*b).to_le_bytes());
        }
        DisplayValue::Int(i) => {
            buf.extend_from_slice(&PAYLOAD_I32.to_le_bytes());
            buf.extend_from_slice(&i.to_le_bytes());
        }
        DisplayValue::Float(f) => {
            buf.extend_from_slice(&PAYLOAD_F32.to_le_bytes());
            buf.extend_from_slice(&f.to_le_bytes());
        }
        DisplayValue::Text(s) => {
            buf.extend_from_slice(&PAYLOAD_STRING.to_le_bytes());
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
    }
}

/// Encode a value-bearing display message.
pub fn encode_display(id: u32, msg: &DisplayMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&id.to_le_bytes());
    let mut kind = msg.kind.wire();
    if msg.self_flushing {
        kind |= FLAG_SELF_FLUSHING;
    }
    buf.extend_from_slice(&kind.to_le_bytes());
    push_value(&mut buf, &msg.value);
    buf
}

/// Encode a flush record closing the run `[starting, starting + count)`.
///
/// The layout is shared by display and monitor flushes.
pub fn encode_flush(id: u32, starting: u32, count: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(14);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&KIND_FLUSH.to_le_bytes());
    buf.extend_from_slice(&starting.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    buf
}

/// Encode a status message.
pub fn encode_status(id: u32, status: DeviceStatus) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&status.wire().to_le_bytes());
    buf
}

/// Encode the one-time hello message carrying the session nonce.
pub fn encode_hello(id: u32, nonce: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf
}

/// Encode a monitor telemetry line.
pub fn encode_monitor_line(id: u32, line: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + line.len());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&MONITOR_LINE.to_le_bytes());
    buf.extend_from_slice(&(line.len() as u32).to_le_bytes());
    buf.extend_from_slice(line.as_bytes());
    buf
}

fn read_u16(data: &[u8], at: usize) -> Result<u16, DecodeError> {
    let bytes = data
        .get(at..at + 2)
        .ok_or(DecodeError::Truncated { need: at + 2, got: data.len() })?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, DecodeError> {
    let bytes = data
        .get(at..at + 4)
        .ok_or(DecodeError::Truncated { need: at + 4, got: data.len() })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Split an inbound command payload into its message id and the remainder.
///
/// Every inbound command (run/stop/ping/input) starts with a 4-byte id used
/// for deduplication; the run remainder is the raw program image.
pub fn parse_inbound(payload: &[u8]) -> Result<(u32, &[u8]), DecodeError> {
    let id = read_u32(payload, 0)?;
    Ok((id, &payload[4..]))
}

/// Decode a display-format message received from the VM host.
///
/// The leading id field is present but ignored — the agent stamps its own
/// counter before republishing.
pub fn decode_ipc(data: &[u8]) -> Result<IpcMessage, DecodeError> {
    let kind_field = read_u16(data, 4)?;
    if kind_field & KIND_MASK == KIND_FLUSH {
        // The VM host sends a bare header; any tail is ignored.
        return Ok(IpcMessage::FlushMarker);
    }

    let kind = DisplayKind::from_wire(kind_field & KIND_MASK)?;
    let self_flushing = kind_field & FLAG_SELF_FLUSHING != 0;

    let payload_kind = read_u16(data, 6)?;
    let value = match payload_kind {
        PAYLOAD_BOOLEAN => DisplayValue::Boolean(read_u32(data, 8)? != 0),
        PAYLOAD_I32 => DisplayValue::Int(read_u32(data, 8)? as i32),
        PAYLOAD_F32 => DisplayValue::Float(f32::from_bits(read_u32(data, 8)?)),
        PAYLOAD_STRING => {
            let len = read_u32(data, 8)? as usize;
            let tail = &data[12..];
            // The trailing NUL is not counted in the length field.
            if len > tail.len() {
                return Err(DecodeError::BadStringLength { len, avail: tail.len() });
            }
            let text = std::str::from_utf8(&tail[..len])
                .map_err(|_| DecodeError::InvalidUtf8)?;
            DisplayValue::Text(text.to_owned())
        }
        other => return Err(DecodeError::UnknownPayload(other)),
    };

    Ok(IpcMessage::Display(DisplayMessage { kind, self_flushing, value }))
}
