//! Byte codec for the text protocol
//!
//! Every character maps to exactly one byte (Latin-1). Commands and responses
//! are ASCII, so no multi-byte encoding is ever applied on the wire.

/// Convert text into the bytes written to a characteristic.
///
/// Characters above U+00FF do not fit a byte and are reduced modulo 256.
/// Commands are generated ASCII, so this never happens in practice.
pub fn encode(text: &str) -> Vec<u8> {
    text.chars().map(|c| c as u32 as u8).collect()
}

/// Convert a characteristic value back into text, one character per byte.
pub fn decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
