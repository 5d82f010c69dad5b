//! Malmo wire protocol: text commands and fixed-layout binary replies.
//!
//! Commands are UTF-8 payloads, one per frame. Replies that carry flags or
//! numbers use big-endian fixed layouts:
//!
//! | Reply                          | Layout              |
//! |--------------------------------|---------------------|
//! | quit / init / reinit / find ack| `u32`               |
//! | peek done flag                 | `i8`                |
//! | step reply                     | `f64` + `i8` + `i8` |

use tokio_util::bytes::{Buf, Bytes};

use crate::version::greeting;

/// Text commands sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// Greeting banner, first message on every connection.
    Hello,
    Peek,
    Quit,
    Status,
    Find(&'a str),
    Init(&'a str),
    Step { option: u8, body: &'a str },
}

impl Command<'_> {
    pub fn render(&self) -> String {
        match self {
            Command::Hello => greeting(),
            Command::Peek => "<Peek/>".to_string(),
            Command::Quit => "<Quit/>".to_string(),
            Command::Status => "<Status/>".to_string(),
            Command::Find(token) => format!("<Find>{}</Find>", token),
            Command::Init(token) => format!("<Init>{}</Init>", token),
            Command::Step { option, body } => {
                format!("<Step{opt}>{body}</Step{opt}>", opt = option)
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(self.render())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{reply} reply must be {expected} bytes, got {actual}")]
    ShortReply {
        reply: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("frame of {actual} bytes does not match {height}x{width}x{depth} geometry")]
    FrameSize {
        actual: usize,
        height: usize,
        width: usize,
        depth: usize,
    },
    #[error("invalid info payload: {0}")]
    InvalidInfo(#[from] serde_json::Error),
    #[error("info payload must be a JSON object")]
    InfoNotObject,
    #[error("status reply is not UTF-8")]
    InvalidStatus,
}

fn expect_len(reply: &'static str, frame: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if frame.len() != expected {
        return Err(ProtocolError::ShortReply {
            reply,
            expected,
            actual: frame.len(),
        });
    }
    Ok(())
}

/// Decode a `u32` acknowledgment (quit, init, reinit) or port (find).
pub fn decode_u32(reply: &'static str, mut frame: &[u8]) -> Result<u32, ProtocolError> {
    expect_len(reply, frame, 4)?;
    Ok(frame.get_u32())
}

/// Decode a `u32` acknowledgment as a boolean; nonzero is acknowledged.
pub fn decode_ack(reply: &'static str, frame: &[u8]) -> Result<bool, ProtocolError> {
    Ok(decode_u32(reply, frame)? != 0)
}

/// Decode the one-byte completion flag that ends a peek reply.
pub fn decode_done_flag(mut frame: &[u8]) -> Result<bool, ProtocolError> {
    expect_len("peek done", frame, 1)?;
    Ok(frame.get_i8() == 1)
}

/// Fixed-layout reply that follows the observation in a step exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReply {
    pub reward: f64,
    pub done: bool,
    /// Whether a JSON info frame follows.
    pub info_sent: bool,
}

impl StepReply {
    pub const LEN: usize = 10;

    pub fn decode(mut frame: &[u8]) -> Result<Self, ProtocolError> {
        expect_len("step", frame, Self::LEN)?;
        let reward = frame.get_f64();
        let done = frame.get_i8() == 1;
        let info_sent = frame.get_i8() == 1;
        Ok(Self {
            reward,
            done,
            info_sent,
        })
    }
}

/// Parse an info frame into a JSON object. Empty frames are an empty object.
pub fn decode_info(frame: &[u8]) -> Result<serde_json::Map<String, serde_json::Value>, ProtocolError> {
    if frame.is_empty() {
        return Ok(serde_json::Map::new());
    }
    match serde_json::from_slice(frame)? {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(serde_json::Map::new()),
        _ => Err(ProtocolError::InfoNotObject),
    }
}
