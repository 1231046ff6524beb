//! HTTP/1.1 Upgrade handshake helpers

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing (RFC 6455 §1.3)
const ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const KEY_HEADER: &[u8] = b"sec-websocket-key:";

/// Compute `Sec-WebSocket-Accept` for a client key
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Offset just past the `\r\n\r\n` header terminator, if present
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Extract the `Sec-WebSocket-Key` value from a request head.
///
/// The header name is matched case-insensitively; surrounding whitespace is
/// trimmed. Returns `None` when the header is absent or empty.
pub fn extract_key(head: &[u8]) -> Option<String> {
    head.split(|&b| b == b'\n').find_map(|line| {
        if line.len() < KEY_HEADER.len() || !line[..KEY_HEADER.len()].eq_ignore_ascii_case(KEY_HEADER) {
            return None;
        }
        let value = std::str::from_utf8(&line[KEY_HEADER.len()..]).ok()?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// The fixed 101 response carrying the accept token
pub fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
}
