//! Register encoding: 32-bit IEEE-754 floats packed big-endian into
//! consecutive 16-bit Modbus registers.
//!
//! Unset values are written as `+inf`, the device's "leave unchanged" marker.

use crate::error::DecodeError;

/// Bytes occupied by one float value.
pub const BYTES_PER_VALUE: usize = 4;

/// Registers occupied by one float value.
pub const WORDS_PER_VALUE: u16 = 2;

/// Interpret `buf` as `count` big-endian floats.
pub fn decode_floats(buf: &[u8], count: usize) -> Result<Vec<f32>, DecodeError> {
    let expected = count * BYTES_PER_VALUE;
    if buf.len() != expected {
        return Err(DecodeError::Length {
            expected,
            actual: buf.len(),
        });
    }

    Ok(buf
        .chunks_exact(BYTES_PER_VALUE)
        .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Encode values as big-endian floats, `None` becoming `+inf`.
pub fn encode_floats(values: &[Option<f32>]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|v| v.unwrap_or(f32::INFINITY).to_be_bytes())
        .collect()
}

/// Flatten register words into their big-endian byte stream.
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Pack a byte stream into big-endian register words.
///
/// A trailing odd byte is zero-padded.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
        .collect()
}

/// Decode the words of an input-register response into `count` floats.
pub fn decode_registers(words: &[u16], count: usize) -> Result<Vec<f32>, DecodeError> {
    decode_floats(&words_to_bytes(words), count)
}

/// Encode values into the words of a holding-register write.
pub fn encode_registers(values: &[Option<f32>]) -> Vec<u16> {
    bytes_to_words(&encode_floats(values))
}
