//! Binary frame codec (RFC 6455 subset)
//!
//! Receive side: FIN/opcode byte, mask bit, 7/16/64-bit payload length,
//! optional 4-byte mask key. Send side: always one unmasked FIN text frame,
//! never fragmented.

use thiserror::Error;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Reserved opcodes, ignored by the receiver
    Other(u8),
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value & 0x0f {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xa => Opcode::Pong,
            other => Opcode::Other(other),
        }
    }
}

/// A fully received, unmasked frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Text and binary frames carry application messages
    pub fn is_message(&self) -> bool {
        matches!(self.opcode, Opcode::Text | Opcode::Binary)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The declared payload can never fit the receiver's buffer
    #[error("frame payload of {declared} bytes exceeds the {limit}-byte receive bound")]
    PayloadTooLarge { declared: u64, limit: usize },
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete, otherwise the frame and
/// the number of bytes it consumed. A declared payload above `max_payload`
/// is rejected as soon as the length field is readable.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let opcode = Opcode::from(buf[0]);
    let masked = buf[1] & 0x80 != 0;

    let (declared, mut header_len) = match buf[1] & 0x7f {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        short => (u64::from(short), 2),
    };

    if declared > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge { declared, limit: max_payload });
    }
    let payload_len = declared as usize;

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let key = [buf[header_len], buf[header_len + 1], buf[header_len + 2], buf[header_len + 3]];
        header_len += 4;
        Some(key)
    } else {
        None
    };

    let total = header_len + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[header_len..total].to_vec();
    if let Some(key) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i & 3];
        }
    }

    Ok(Some((Frame { opcode, payload }, total)))
}

/// Encode a server text frame: FIN set, unmasked, shortest length form
pub fn encode_text(payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 10);
    out.push(0x81);

    if len < 126 {
        out.push(len as u8);
    } else if len < 65536 {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}
