//! Payload envelope for stored sessions.
//!
//! Layout: `b"DS"`, one format byte, a big-endian `u32` body length, then the
//! JSON object body. The explicit length catches truncated writes that would
//! otherwise still parse.

use crate::error::CodecError;
use crate::record::SessionAttributes;

const MAGIC: &[u8; 2] = b"DS";
const FORMAT_V1: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// Encode attributes into a stored payload.
pub fn encode(attrs: &SessionAttributes) -> Vec<u8> {
    // A map with string keys and JSON values always serializes.
    let body = serde_json::to_vec(attrs).unwrap_or_else(|_| b"{}".to_vec());
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_V1);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decode a stored payload back into attributes.
pub fn decode(bytes: &[u8]) -> Result<SessionAttributes, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!("{} bytes is shorter than header", bytes.len())));
    }
    if &bytes[..2] != MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }
    if bytes[2] != FORMAT_V1 {
        return Err(corrupt(format!("unknown format {}", bytes[2])));
    }

    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[3..HEADER_LEN]);
    let declared = u32::from_be_bytes(len) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() != declared {
        return Err(corrupt(format!(
            "body is {} bytes, header says {}",
            body.len(),
            declared
        )));
    }

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| corrupt(e.to_string()))?;
    if !value.is_object() {
        return Err(corrupt("body is not an object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))
}

fn corrupt(reason: String) -> CodecError {
    CodecError::CorruptPayload(reason)
}
